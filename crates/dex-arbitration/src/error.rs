//! # Arbitration Error Types
//!
//! State machine rejections carry the current and attempted state; resolution
//! rejections carry the dispute and the signer so operators can see who tried
//! to resolve what.

use dex_core::{CanonicalizationError, DisputeId, NodeAddress};
use thiserror::Error;

/// Errors arising from dispute operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArbitrationError {
    /// Attempted state transition is not valid from the current dispute state.
    #[error("invalid transition for {dispute_id} from {from} to {to}")]
    InvalidTransition {
        /// The dispute identifier.
        dispute_id: DisputeId,
        /// The current state name.
        from: String,
        /// The attempted target state name.
        to: String,
    },

    /// The resolution is not signed by the dispute's assigned agent.
    #[error("resolution for {dispute_id} is not signed by the assigned agent (claimed signer {signer})")]
    UnauthorizedResolution {
        /// The dispute identifier.
        dispute_id: DisputeId,
        /// The agent the resolution claims to come from.
        signer: NodeAddress,
    },

    /// A different decision was already applied to this dispute.
    #[error("dispute {dispute_id} already resolved with {applied}; refusing {offered}")]
    ConflictingResolution {
        /// The dispute identifier.
        dispute_id: DisputeId,
        /// The decision already applied.
        applied: String,
        /// The decision offered now.
        offered: String,
    },

    /// The resolution names another dispute or trade.
    #[error("resolution does not match dispute {dispute_id}: {reason}")]
    ResolutionMismatch {
        /// The dispute identifier.
        dispute_id: DisputeId,
        /// What differs.
        reason: String,
    },

    /// The payout decision is malformed.
    #[error("invalid payout decision: {0}")]
    InvalidDecision(String),

    /// Canonicalization error while signing or digesting.
    #[error("canonicalization error: {0}")]
    Canonicalization(String),
}

impl From<CanonicalizationError> for ArbitrationError {
    fn from(err: CanonicalizationError) -> Self {
        Self::Canonicalization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_display_names_signer() {
        let err = ArbitrationError::UnauthorizedResolution {
            dispute_id: DisputeId::new(),
            signer: NodeAddress::new("mallory.onion:1").unwrap(),
        };
        assert!(format!("{err}").contains("claimed signer mallory.onion:1"));
    }

    #[test]
    fn conflicting_display() {
        let err = ArbitrationError::ConflictingResolution {
            dispute_id: DisputeId::new(),
            applied: "PAYOUT_TO_MAKER".into(),
            offered: "PAYOUT_TO_TAKER".into(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("already resolved with PAYOUT_TO_MAKER"));
        assert!(msg.contains("refusing PAYOUT_TO_TAKER"));
    }

    #[test]
    fn invalid_decision_display() {
        let err = ArbitrationError::InvalidDecision("split above 10000 bps".into());
        assert_eq!(format!("{err}"), "invalid payout decision: split above 10000 bps");
    }
}
