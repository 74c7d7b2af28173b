//! # Trade Error Types
//!
//! Errors are classified the way the protocol reacts to them:
//!
//! - validation: rejected before any state change, never retried;
//! - trust: a counterparty message failed verification; the message is
//!   rejected and recorded on the trade;
//! - transient: an unreachable peer or unavailable wallet; the failed
//!   pipeline step is checkpointed and resumed later;
//! - fatal wallet rejections escalate the trade to a dispute.

use dex_arbitration::ArbitrationError;
use dex_core::{CanonicalizationError, NodeAddress, OfferId, TradeId};
use dex_offer::OfferError;
use thiserror::Error;

/// Errors reported by the wallet collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    /// Not enough spendable funds for the transaction.
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        /// Amount needed.
        required: u64,
        /// Amount spendable.
        available: u64,
    },

    /// The wallet is locked and cannot sign.
    #[error("wallet is locked")]
    WalletLocked,

    /// The network refused the transaction.
    #[error("broadcast rejected: {reason}")]
    BroadcastRejected {
        /// Rejection reason reported by the node.
        reason: String,
    },

    /// The wallet backend is temporarily unavailable.
    #[error("wallet unavailable: {reason}")]
    Unavailable {
        /// Failure description.
        reason: String,
    },
}

/// Errors reported by the network collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// The peer could not be reached.
    #[error("peer {peer} unreachable: {reason}")]
    PeerUnreachable {
        /// Destination address.
        peer: NodeAddress,
        /// Transport failure description.
        reason: String,
    },
}

/// Errors reported by the persistence collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// The store could not be read or written.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be decoded.
    #[error("corrupt record {key}: {reason}")]
    Corrupt {
        /// Record key.
        key: String,
        /// Decode failure.
        reason: String,
    },
}

/// Errors from the trade protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TradeError {
    /// No trade with this id is known.
    #[error("trade {trade_id} not found")]
    NotFound {
        /// Trade identifier.
        trade_id: TradeId,
    },

    /// State transition not permitted by the trade lifecycle.
    #[error("invalid trade transition for {trade_id} from {from} to {to}")]
    InvalidTransition {
        /// Trade identifier.
        trade_id: TradeId,
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// A message signature did not verify against the sender's key.
    #[error("invalid signature on {message} for {trade_id} from {sender}")]
    InvalidSignature {
        /// Trade identifier.
        trade_id: TradeId,
        /// Claimed sender.
        sender: NodeAddress,
        /// Message kind.
        message: String,
    },

    /// A message came from someone other than the trade's counterparty.
    #[error("unexpected sender {actual} for {trade_id}, expected {expected}")]
    UnexpectedSender {
        /// Trade identifier.
        trade_id: TradeId,
        /// The counterparty address.
        expected: NodeAddress,
        /// The address the message came from.
        actual: NodeAddress,
    },

    /// A message arrived that the trade cannot process in its current state.
    #[error("out-of-order {message} for {trade_id} in state {state}")]
    OutOfOrder {
        /// Trade identifier.
        trade_id: TradeId,
        /// Current state.
        state: String,
        /// Message kind.
        message: String,
    },

    /// The maker declined the take-offer request.
    #[error("offer {offer_id} could not be taken: {reason}")]
    TakeRejected {
        /// Offer identifier.
        offer_id: OfferId,
        /// Reason given by the maker.
        reason: String,
    },

    /// An offer broadcast arrived from a peer other than its maker.
    #[error("offer {offer_id} of {maker} relayed by {from}")]
    RelayedOffer {
        /// Offer identifier.
        offer_id: OfferId,
        /// Maker named in the offer.
        maker: NodeAddress,
        /// Peer that sent the broadcast.
        from: NodeAddress,
    },

    /// A dispute agent named by the counterparty is not trusted locally.
    #[error("dispute agent {address} is not accepted")]
    UnknownAgent {
        /// Agent address.
        address: NodeAddress,
    },

    /// No dispute is open for the trade.
    #[error("no dispute for trade {trade_id}")]
    NoDispute {
        /// Trade identifier.
        trade_id: TradeId,
    },

    /// Request rejected before any state change.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Wallet collaborator failure.
    #[error("wallet error: {0}")]
    Wallet(#[from] WalletError),

    /// Network collaborator failure.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Persistence collaborator failure.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Offer failure.
    #[error("offer error: {0}")]
    Offer(#[from] OfferError),

    /// Dispute failure.
    #[error("arbitration error: {0}")]
    Arbitration(#[from] ArbitrationError),

    /// Canonicalization failed while signing or digesting.
    #[error("canonicalization error: {0}")]
    Canonicalization(String),
}

impl From<CanonicalizationError> for TradeError {
    fn from(err: CanonicalizationError) -> Self {
        Self::Canonicalization(err.to_string())
    }
}

impl TradeError {
    /// Errors worth resuming the failed step for.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(NetworkError::PeerUnreachable { .. }) => true,
            Self::Wallet(WalletError::Unavailable { .. } | WalletError::WalletLocked) => true,
            Self::Offer(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Counterparty messages that failed verification.
    pub fn is_trust_failure(&self) -> bool {
        match self {
            Self::InvalidSignature { .. }
            | Self::UnexpectedSender { .. }
            | Self::RelayedOffer { .. } => true,
            Self::Offer(e) => e.is_trust_failure(),
            _ => false,
        }
    }

    /// Fatal wallet rejections of a fund-moving step.
    pub fn is_wallet_failure(&self) -> bool {
        matches!(
            self,
            Self::Wallet(WalletError::InsufficientFunds { .. } | WalletError::BroadcastRejected { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> NodeAddress {
        NodeAddress::new("maker.onion:9999").unwrap()
    }

    #[test]
    fn classification() {
        let unreachable = TradeError::from(NetworkError::PeerUnreachable {
            peer: peer(),
            reason: "circuit closed".into(),
        });
        assert!(unreachable.is_transient());
        assert!(!unreachable.is_trust_failure());

        assert!(TradeError::from(WalletError::WalletLocked).is_transient());

        let rejected = TradeError::from(WalletError::BroadcastRejected {
            reason: "double spend".into(),
        });
        assert!(!rejected.is_transient());
        assert!(rejected.is_wallet_failure());

        let forged = TradeError::InvalidSignature {
            trade_id: TradeId::new(),
            sender: peer(),
            message: "DEPOSIT_PUBLISHED".into(),
        };
        assert!(forged.is_trust_failure());
        assert!(!forged.is_transient());
    }

    #[test]
    fn insufficient_funds_display() {
        let err = WalletError::InsufficientFunds {
            required: 100,
            available: 40,
        };
        assert_eq!(format!("{err}"), "insufficient funds: required 100, available 40");
    }

    #[test]
    fn out_of_order_display() {
        let err = TradeError::OutOfOrder {
            trade_id: TradeId::new(),
            state: "INITIATED".into(),
            message: "PAYOUT_PUBLISHED".into(),
        };
        assert!(format!("{err}").contains("out-of-order PAYOUT_PUBLISHED"));
    }
}
