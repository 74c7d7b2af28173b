//! # dex-core — Foundational Types for the Exchange Trade Core
//!
//! Every other crate in the workspace depends on `dex-core`; it depends on
//! nothing internal.
//!
//! ## Key Design Principles
//!
//! 1. **Newtype identifiers.** `OfferId`, `TradeId`, `DisputeId`,
//!    `MessageId`, `NodeAddress`, `LanguageCode`, `TxId`. No bare strings or
//!    UUIDs cross crate boundaries.
//!
//! 2. **`CanonicalBytes` newtype.** Every signature and digest in the protocol
//!    is computed over `CanonicalBytes::new()` output, so maker, taker,
//!    arbitrator, and dispute agents agree on the exact bytes signed.
//!
//! 3. **UTC-only timestamps** with seconds precision.
//!
//! ## Crate Policy
//!
//! - No `unsafe` code.
//! - No `panic!()` or `.unwrap()` outside tests.

pub mod canonical;
pub mod digest;
pub mod error;
pub mod identity;
pub mod temporal;

// Re-export primary types.
pub use canonical::CanonicalBytes;
pub use digest::{sha256_digest, ContentDigest};
pub use error::{CanonicalizationError, CoreError, CryptoError};
pub use identity::{DisputeId, LanguageCode, MessageId, NodeAddress, OfferId, TradeId, TxId};
pub use temporal::Timestamp;
