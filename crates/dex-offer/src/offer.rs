//! # Offers
//!
//! An offer is the maker's signed intent to trade. The payload's terms are
//! fixed at creation; the only mutable part is the arbitrator's co-signature.
//! Trades embed a copy of the signed payload, so both parties reason over the
//! same bytes.
//!
//! ## Lifecycle
//!
//! ```text
//! PENDING ──▶ AVAILABLE ──▶ TAKEN
//!   │  │          │
//!   │  │          ├──▶ CANCELLED
//!   │  │          └──▶ EXPIRED
//!   │  └──▶ INVALID
//!   └──▶ CANCELLED
//! ```
//!
//! `AVAILABLE` is reachable only through [`Offer::mark_available`], which
//! re-verifies the arbitrator signature against the designated arbitrator's
//! key.

use dex_core::{CanonicalBytes, NodeAddress, OfferId, Timestamp};
use dex_crypto::{verify_signature, Ed25519PublicKey, Ed25519Signature, PubKeyRing};
use serde::{Deserialize, Serialize};

use crate::error::OfferError;

// ── Offer State ──────────────────────────────────────────────────────

/// Offer lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferState {
    /// Created, awaiting the arbitrator's co-signature.
    Pending,
    /// Co-signed and tradeable.
    Available,
    /// Co-signing failed verification (terminal).
    Invalid,
    /// Taken by a counterparty (terminal).
    Taken,
    /// Withdrawn by the maker (terminal).
    Cancelled,
    /// Not taken within its time-to-live (terminal).
    Expired,
}

impl OfferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Available => "AVAILABLE",
            Self::Invalid => "INVALID",
            Self::Taken => "TAKEN",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Invalid | Self::Taken | Self::Cancelled | Self::Expired
        )
    }

    /// Valid target states from this state.
    pub fn valid_transitions(&self) -> &'static [OfferState] {
        match self {
            Self::Pending => &[Self::Available, Self::Invalid, Self::Cancelled],
            Self::Available => &[Self::Taken, Self::Cancelled, Self::Expired],
            Self::Invalid | Self::Taken | Self::Cancelled | Self::Expired => &[],
        }
    }

    pub fn can_transition_to(&self, target: OfferState) -> bool {
        self.valid_transitions().contains(&target)
    }
}

impl std::fmt::Display for OfferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Terms ────────────────────────────────────────────────────────────

/// The maker's side of the trade, with respect to the base currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Economic terms of an offer. Amounts are in base-currency minor units;
/// `price` is counter-currency minor units per whole base unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferTerms {
    pub direction: Direction,
    pub base_currency: String,
    pub counter_currency: String,
    pub min_amount: u64,
    pub amount: u64,
    pub price: u64,
    pub payment_methods: Vec<String>,
}

impl OfferTerms {
    /// Check the terms are internally consistent.
    pub fn validate(&self) -> Result<(), OfferError> {
        let invalid = |reason: &str| {
            Err(OfferError::InvalidTerms {
                reason: reason.to_string(),
            })
        };
        if !is_currency_code(&self.base_currency) || !is_currency_code(&self.counter_currency) {
            return invalid("currency codes must be 3-5 uppercase ASCII letters");
        }
        if self.base_currency == self.counter_currency {
            return invalid("base and counter currency must differ");
        }
        if self.min_amount == 0 {
            return invalid("min_amount must be positive");
        }
        if self.min_amount > self.amount {
            return invalid("min_amount exceeds amount");
        }
        if self.price == 0 {
            return invalid("price must be positive");
        }
        if self.payment_methods.is_empty() {
            return invalid("at least one payment method is required");
        }
        if self.payment_methods.iter().any(|m| m.trim().is_empty()) {
            return invalid("payment method names must be non-empty");
        }
        Ok(())
    }

    pub fn amount_in_range(&self, amount: u64) -> bool {
        (self.min_amount..=self.amount).contains(&amount)
    }

    /// Counter-currency value of `amount` base units, rounded down.
    ///
    /// `base_unit` is the number of minor units in one whole base unit.
    pub fn counter_value(&self, amount: u64, base_unit: u64) -> Option<u64> {
        if base_unit == 0 {
            return None;
        }
        let value = u128::from(amount) * u128::from(self.price) / u128::from(base_unit);
        u64::try_from(value).ok()
    }
}

fn is_currency_code(code: &str) -> bool {
    (3..=5).contains(&code.len()) && code.chars().all(|c| c.is_ascii_uppercase())
}

// ── Payload ──────────────────────────────────────────────────────────

/// The signed offer payload shared with takers and embedded in trades.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub id: OfferId,
    pub terms: OfferTerms,
    pub maker_address: NodeAddress,
    pub maker_pub_key_ring: PubKeyRing,
    /// The arbitrator that must co-sign the offer and is bound to its trades.
    pub arbitrator_signer: NodeAddress,
    pub created_at: Timestamp,
    /// Set once co-signed. Covers every other field.
    pub arbitrator_signature: Option<Ed25519Signature>,
}

/// Every payload field except the signature.
#[derive(Serialize)]
struct SignableOffer<'a> {
    id: &'a OfferId,
    terms: &'a OfferTerms,
    maker_address: &'a NodeAddress,
    maker_pub_key_ring: &'a PubKeyRing,
    arbitrator_signer: &'a NodeAddress,
    created_at: &'a Timestamp,
}

impl OfferPayload {
    /// Build an unsigned payload after validating `terms`.
    pub fn new(
        terms: OfferTerms,
        maker_address: NodeAddress,
        maker_pub_key_ring: PubKeyRing,
        arbitrator_signer: NodeAddress,
    ) -> Result<Self, OfferError> {
        terms.validate()?;
        Ok(Self {
            id: OfferId::new(),
            terms,
            maker_address,
            maker_pub_key_ring,
            arbitrator_signer,
            created_at: Timestamp::now(),
            arbitrator_signature: None,
        })
    }

    /// Canonical bytes the arbitrator signs.
    pub fn signable_bytes(&self) -> Result<CanonicalBytes, OfferError> {
        Ok(CanonicalBytes::new(&SignableOffer {
            id: &self.id,
            terms: &self.terms,
            maker_address: &self.maker_address,
            maker_pub_key_ring: &self.maker_pub_key_ring,
            arbitrator_signer: &self.arbitrator_signer,
            created_at: &self.created_at,
        })?)
    }

    /// Whether `signature` is a valid signature over this payload by `key`.
    pub fn verify_with(&self, signature: &Ed25519Signature, key: &Ed25519PublicKey) -> bool {
        match self.signable_bytes() {
            Ok(bytes) => verify_signature(&bytes, signature, key),
            Err(e) => {
                tracing::warn!(offer_id = %self.id, error = %e, "offer payload not canonicalizable");
                false
            }
        }
    }

    /// Whether the payload carries a valid arbitrator signature by `key`.
    pub fn has_valid_arbitrator_signature(&self, key: &Ed25519PublicKey) -> bool {
        self.arbitrator_signature
            .as_ref()
            .is_some_and(|sig| self.verify_with(sig, key))
    }

    /// The payload with the signature cleared, as sent for co-signing.
    pub fn unsigned(&self) -> Self {
        Self {
            arbitrator_signature: None,
            ..self.clone()
        }
    }
}

// ── Offer ────────────────────────────────────────────────────────────

/// A recorded state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferTransition {
    pub from: OfferState,
    pub to: OfferState,
    pub at: Timestamp,
    pub reason: Option<String>,
}

/// An offer with its lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    payload: OfferPayload,
    state: OfferState,
    error_message: Option<String>,
    transition_log: Vec<OfferTransition>,
}

impl Offer {
    /// A new `PENDING` offer.
    pub fn new(payload: OfferPayload) -> Self {
        Self {
            payload,
            state: OfferState::Pending,
            error_message: None,
            transition_log: Vec::new(),
        }
    }

    pub fn id(&self) -> OfferId {
        self.payload.id
    }

    pub fn payload(&self) -> &OfferPayload {
        &self.payload
    }

    pub fn state(&self) -> OfferState {
        self.state
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn set_error_message(&mut self, message: impl Into<String>) {
        self.error_message = Some(message.into());
    }

    pub fn transition_log(&self) -> &[OfferTransition] {
        &self.transition_log
    }

    /// Move to `to` if the lifecycle permits it. `AVAILABLE` must go through
    /// [`Offer::mark_available`].
    pub fn transition(&mut self, to: OfferState, reason: Option<&str>) -> Result<(), OfferError> {
        if to == OfferState::Available {
            return Err(self.invalid_transition(to));
        }
        self.apply_transition(to, reason)
    }

    /// Attach the arbitrator's signature. Only a `PENDING` offer accepts one.
    pub fn apply_signature(&mut self, signature: Ed25519Signature) -> Result<(), OfferError> {
        if self.state != OfferState::Pending {
            return Err(self.invalid_transition(OfferState::Available));
        }
        self.payload.arbitrator_signature = Some(signature);
        Ok(())
    }

    /// Move `PENDING → AVAILABLE` after re-verifying the arbitrator signature
    /// against `arbitrator_key`.
    pub fn mark_available(&mut self, arbitrator_key: &Ed25519PublicKey) -> Result<(), OfferError> {
        if !self.state.can_transition_to(OfferState::Available) {
            return Err(self.invalid_transition(OfferState::Available));
        }
        if !self.payload.has_valid_arbitrator_signature(arbitrator_key) {
            return Err(OfferError::InvalidOfferSignature {
                offer_id: self.id(),
                arbitrator: self.payload.arbitrator_signer.clone(),
            });
        }
        self.apply_transition(OfferState::Available, Some("arbitrator co-signed"))?;
        self.error_message = None;
        Ok(())
    }

    fn apply_transition(&mut self, to: OfferState, reason: Option<&str>) -> Result<(), OfferError> {
        if !self.state.can_transition_to(to) {
            return Err(self.invalid_transition(to));
        }
        self.transition_log.push(OfferTransition {
            from: self.state,
            to,
            at: Timestamp::now(),
            reason: reason.map(str::to_string),
        });
        tracing::info!(offer_id = %self.id(), from = %self.state, to = %to, "offer transition");
        self.state = to;
        Ok(())
    }

    fn invalid_transition(&self, to: OfferState) -> OfferError {
        OfferError::InvalidTransition {
            offer_id: self.id(),
            from: self.state.as_str().to_string(),
            to: to.as_str().to_string(),
        }
    }
}
