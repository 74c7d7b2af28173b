//! # Offer Errors
//!
//! Errors fall into three classes the signing pipeline and callers act on:
//! validation (rejected before any state change), trust (signature failures,
//! fatal to the offer), and transient (arbitrator unreachable, retryable).

use dex_core::{CanonicalizationError, NodeAddress, OfferId};
use thiserror::Error;

/// Errors from offer validation, the offer state machine, co-signing, and
/// the offer book.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OfferError {
    /// Offer terms failed validation.
    #[error("invalid offer terms: {reason}")]
    InvalidTerms {
        /// What is wrong with the terms.
        reason: String,
    },

    /// State transition not permitted by the offer lifecycle.
    #[error("invalid offer transition for {offer_id} from {from} to {to}")]
    InvalidTransition {
        /// Offer identifier.
        offer_id: OfferId,
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// The offer's arbitrator signer is not in the local accepted set.
    #[error("arbitrator {address} is not an accepted arbitrator")]
    UnknownArbitrator {
        /// Address named by the offer.
        address: NodeAddress,
    },

    /// The arbitrator did not answer the signing request.
    #[error("arbitrator {address} unreachable: {reason}")]
    ArbitratorUnreachable {
        /// Arbitrator address.
        address: NodeAddress,
        /// Transport failure description.
        reason: String,
    },

    /// The signature returned by the arbitrator does not verify over the
    /// payload it returned.
    #[error("arbitrator {arbitrator} returned an invalid signature for offer {offer_id}")]
    InvalidArbitratorSignature {
        /// Offer identifier.
        offer_id: OfferId,
        /// Signing arbitrator.
        arbitrator: NodeAddress,
    },

    /// The local payload with the arbitrator's signature applied does not
    /// verify.
    #[error("offer {offer_id} does not carry a valid signature from {arbitrator}")]
    InvalidOfferSignature {
        /// Offer identifier.
        offer_id: OfferId,
        /// Designated arbitrator.
        arbitrator: NodeAddress,
    },

    /// The arbitrator's response does not belong to this offer.
    #[error("signing response mismatch for offer {offer_id}: {reason}")]
    ResponseMismatch {
        /// Offer identifier.
        offer_id: OfferId,
        /// What differs.
        reason: String,
    },

    /// No offer with this id is held.
    #[error("offer {offer_id} not found")]
    NotFound {
        /// Offer identifier.
        offer_id: OfferId,
    },

    /// Requested amount outside the offer's range.
    #[error("amount {amount} outside range [{min}, {max}] of offer {offer_id}")]
    AmountOutOfRange {
        /// Offer identifier.
        offer_id: OfferId,
        /// Requested amount.
        amount: u64,
        /// Offer minimum.
        min: u64,
        /// Offer maximum.
        max: u64,
    },

    /// Canonicalization failed while signing or verifying.
    #[error("canonicalization error: {0}")]
    Canonicalization(String),
}

impl From<CanonicalizationError> for OfferError {
    fn from(err: CanonicalizationError) -> Self {
        Self::Canonicalization(err.to_string())
    }
}

impl OfferError {
    /// Errors worth retrying by resuming the failed step.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ArbitratorUnreachable { .. })
    }

    /// Signature and response failures that invalidate the offer.
    pub fn is_trust_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidArbitratorSignature { .. }
                | Self::InvalidOfferSignature { .. }
                | Self::ResponseMismatch { .. }
        )
    }
}
