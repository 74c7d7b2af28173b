//! # Payout Decisions
//!
//! A dispute ends with a [`SignedResolution`]: the assigned agent's binding
//! decision on how the deposited funds are paid out. Split amounts are
//! computed in integer basis points; the two shares always sum to the total.

use dex_core::{DisputeId, NodeAddress, Timestamp, TradeId};
use dex_crypto::{sign_payload, verify_payload, Ed25519PublicKey, Ed25519Signature, KeyRing};
use serde::{Deserialize, Serialize};

use crate::dispute::PartyRole;
use crate::error::ArbitrationError;

/// Basis points in one whole.
pub const BASIS_POINTS: u16 = 10_000;

/// How the disputed funds are paid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutDecision {
    PayoutToMaker,
    PayoutToTaker,
    Split {
        /// Maker's share; the taker receives the rest.
        maker_basis_points: u16,
    },
}

/// Amounts paid to each party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutSplit {
    pub maker: u64,
    pub taker: u64,
}

impl PayoutDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PayoutToMaker => "PAYOUT_TO_MAKER",
            Self::PayoutToTaker => "PAYOUT_TO_TAKER",
            Self::Split { .. } => "SPLIT",
        }
    }

    pub fn validate(&self) -> Result<(), ArbitrationError> {
        match self {
            Self::Split { maker_basis_points } if *maker_basis_points > BASIS_POINTS => {
                Err(ArbitrationError::InvalidDecision(format!(
                    "split of {maker_basis_points} bps exceeds {BASIS_POINTS}"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Maker's share in basis points.
    pub fn maker_basis_points(&self) -> u16 {
        match self {
            Self::PayoutToMaker => BASIS_POINTS,
            Self::PayoutToTaker => 0,
            Self::Split { maker_basis_points } => (*maker_basis_points).min(BASIS_POINTS),
        }
    }

    /// Divide `total`. The maker's share rounds down.
    pub fn split(&self, total: u64) -> PayoutSplit {
        let maker = u128::from(total) * u128::from(self.maker_basis_points())
            / u128::from(BASIS_POINTS);
        // maker <= total, so the conversion cannot fail.
        let maker = u64::try_from(maker).unwrap_or(total);
        PayoutSplit {
            maker,
            taker: total - maker,
        }
    }

    /// The party whose node broadcasts the payout: the one receiving the
    /// larger share, the maker on an even split.
    pub fn broadcaster(&self) -> PartyRole {
        if self.maker_basis_points() * 2 >= BASIS_POINTS {
            PartyRole::Maker
        } else {
            PartyRole::Taker
        }
    }
}

impl std::fmt::Display for PayoutDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Split { maker_basis_points } => write!(f, "SPLIT({maker_basis_points} bps to maker)"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// The agent's decision on one dispute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub dispute_id: DisputeId,
    pub trade_id: TradeId,
    /// Agent issuing the decision.
    pub agent: NodeAddress,
    pub decision: PayoutDecision,
    pub summary: String,
    pub resolved_at: Timestamp,
}

impl Resolution {
    pub fn new(
        dispute_id: DisputeId,
        trade_id: TradeId,
        agent: NodeAddress,
        decision: PayoutDecision,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            dispute_id,
            trade_id,
            agent,
            decision,
            summary: summary.into(),
            resolved_at: Timestamp::now(),
        }
    }

    /// Sign with the agent's keys.
    pub fn sign(self, keys: &KeyRing) -> Result<SignedResolution, ArbitrationError> {
        self.decision.validate()?;
        let signature = sign_payload(keys.signing_key(), &self)?;
        Ok(SignedResolution {
            resolution: self,
            signature,
        })
    }
}

/// A resolution with the issuing agent's signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedResolution {
    pub resolution: Resolution,
    pub signature: Ed25519Signature,
}

impl SignedResolution {
    pub fn verify(&self, key: &Ed25519PublicKey) -> bool {
        verify_payload(&self.resolution, &self.signature, key)
    }

    pub fn decision(&self) -> PayoutDecision {
        self.resolution.decision
    }
}
