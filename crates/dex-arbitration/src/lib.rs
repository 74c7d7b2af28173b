//! # dex-arbitration — Trade Disputes
//!
//! - **Error** ([`error`]): structured errors for dispute operations.
//! - **Dispute** ([`dispute`]): the escalation record, its evidence snapshot,
//!   evidence items, and the `OPEN → RESOLVED` lifecycle.
//! - **Resolution** ([`resolution`]): signed payout decisions and the integer
//!   split arithmetic.
//!
//! Choosing which agent a dispute goes to, and moving funds once it is
//! resolved, belong to the trade protocol.

pub mod dispute;
pub mod error;
pub mod resolution;

// Re-export primary types.
pub use dispute::{
    AssignedAgent, Dispute, DisputeReason, DisputeState, DisputeTransition, EvidenceItem,
    EvidenceSnapshot, PartyRole, ResolutionOutcome,
};
pub use error::ArbitrationError;
pub use resolution::{PayoutDecision, PayoutSplit, Resolution, SignedResolution, BASIS_POINTS};
