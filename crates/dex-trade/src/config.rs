//! # Protocol Configuration
//!
//! Deadlines, confirmation depth, dispute language, and retry settings for a
//! node. Every value has a default; `from_env()` overrides them from `DEX_*`
//! environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `DEX_TAKE_OFFER_TIMEOUT_SECS` | 60 |
//! | `DEX_DEPOSIT_TIMEOUT_SECS` | 86400 |
//! | `DEX_PAYOUT_TIMEOUT_SECS` | 172800 |
//! | `DEX_PAYOUT_ACK_TIMEOUT_SECS` | 86400 |
//! | `DEX_MIN_CONFIRMATIONS` | 1 |
//! | `DEX_DISPUTE_LANGUAGE` | `en` |
//! | `DEX_OFFER_TTL_SECS` | 604800 |
//! | `DEX_RETRY_MAX_ATTEMPTS` | 4 |
//! | `DEX_RETRY_BASE_DELAY_MS` | 200 |

use std::time::Duration;

use dex_core::LanguageCode;
use dex_task::RetryPolicy;
use thiserror::Error;

use crate::trade::TradeState;

/// Invalid configuration value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Timing and policy settings for the trade protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// How long the taker waits for the maker's answer.
    pub take_offer_timeout: Duration,
    /// Deadline for the deposit to be published and confirmed.
    pub deposit_timeout: Duration,
    /// Deadline for the seller to publish the payout after confirmation.
    pub payout_timeout: Duration,
    /// Deadline for the buyer to acknowledge the payout.
    pub payout_ack_timeout: Duration,
    /// Confirmations after which a deposit counts as confirmed.
    pub min_confirmations: u32,
    /// Language used to select mediators and refund agents.
    pub dispute_language: LanguageCode,
    /// Age after which an untaken offer expires.
    pub offer_ttl: Duration,
    /// Default backoff for caller-driven retries (`resume_trade_with`,
    /// `retry_offer_signing`). Pipelines themselves run once per event.
    pub retry: RetryPolicy,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            take_offer_timeout: Duration::from_secs(60),
            deposit_timeout: Duration::from_secs(24 * 3600),
            payout_timeout: Duration::from_secs(48 * 3600),
            payout_ack_timeout: Duration::from_secs(24 * 3600),
            min_confirmations: 1,
            dispute_language: LanguageCode::default(),
            offer_ttl: Duration::from_secs(7 * 24 * 3600),
            retry: RetryPolicy::default(),
        }
    }
}

impl ProtocolConfig {
    /// Load from `DEX_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let secs = |var: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match lookup(var) {
                Some(v) => parse_positive(var, &v).map(Duration::from_secs),
                None => Ok(default),
            }
        };

        let min_confirmations = match lookup("DEX_MIN_CONFIRMATIONS") {
            Some(v) => u32::try_from(parse_positive("DEX_MIN_CONFIRMATIONS", &v)?).map_err(|_| {
                ConfigError::InvalidValue {
                    var: "DEX_MIN_CONFIRMATIONS",
                    value: v.clone(),
                    reason: "out of range".into(),
                }
            })?,
            None => defaults.min_confirmations,
        };

        let dispute_language = match lookup("DEX_DISPUTE_LANGUAGE") {
            Some(v) => LanguageCode::new(&v).map_err(|e| ConfigError::InvalidValue {
                var: "DEX_DISPUTE_LANGUAGE",
                value: v.clone(),
                reason: e.to_string(),
            })?,
            None => defaults.dispute_language.clone(),
        };

        let mut retry = defaults.retry;
        if let Some(v) = lookup("DEX_RETRY_MAX_ATTEMPTS") {
            retry.max_attempts = u32::try_from(parse_positive("DEX_RETRY_MAX_ATTEMPTS", &v)?)
                .map_err(|_| ConfigError::InvalidValue {
                    var: "DEX_RETRY_MAX_ATTEMPTS",
                    value: v.clone(),
                    reason: "out of range".into(),
                })?;
        }
        if let Some(v) = lookup("DEX_RETRY_BASE_DELAY_MS") {
            retry.base_delay =
                Duration::from_millis(parse_positive("DEX_RETRY_BASE_DELAY_MS", &v)?);
        }

        Ok(Self {
            take_offer_timeout: secs("DEX_TAKE_OFFER_TIMEOUT_SECS", defaults.take_offer_timeout)?,
            deposit_timeout: secs("DEX_DEPOSIT_TIMEOUT_SECS", defaults.deposit_timeout)?,
            payout_timeout: secs("DEX_PAYOUT_TIMEOUT_SECS", defaults.payout_timeout)?,
            payout_ack_timeout: secs("DEX_PAYOUT_ACK_TIMEOUT_SECS", defaults.payout_ack_timeout)?,
            min_confirmations,
            dispute_language,
            offer_ttl: secs("DEX_OFFER_TTL_SECS", defaults.offer_ttl)?,
            retry,
        })
    }

    /// Deadline for a trade waiting in `state`; `None` for states that do
    /// not wait on the counterparty.
    pub fn timeout_for(&self, state: TradeState) -> Option<Duration> {
        match state {
            TradeState::Initiated => Some(self.deposit_timeout),
            TradeState::DepositPublished => Some(self.deposit_timeout),
            TradeState::DepositConfirmed => Some(self.payout_timeout),
            TradeState::PayoutPublished => Some(self.payout_ack_timeout),
            TradeState::Completed
            | TradeState::DisputeOpened
            | TradeState::DisputeResolved
            | TradeState::Cancelled => None,
        }
    }
}

fn parse_positive(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    };
    let n: u64 = value.trim().parse().map_err(|_| invalid("not an integer"))?;
    if n == 0 {
        return Err(invalid("must be greater than zero"));
    }
    Ok(n)
}
