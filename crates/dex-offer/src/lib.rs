//! # dex-offer — Offers and Arbitrator Co-Signing
//!
//! An offer names the arbitrator that will serve any trade taken from it.
//! Before the offer can be taken, that arbitrator signs the offer payload.
//! Takers check the signature against their own accepted arbitrators, so a
//! maker cannot bind a trade to an arbitrator the taker does not trust.
//!
//! - [`offer`]: terms, payload, and the `PENDING → AVAILABLE → TAKEN`
//!   lifecycle.
//! - [`signing`]: the maker-side co-signing pipeline and the arbitrator-side
//!   handler.
//! - [`book`]: own and remote offers with atomic take.

pub mod book;
pub mod error;
pub mod offer;
pub mod signing;

// Re-export primary types.
pub use book::{OfferBook, OfferOrigin};
pub use error::OfferError;
pub use offer::{Direction, Offer, OfferPayload, OfferState, OfferTerms, OfferTransition};
pub use signing::{
    arbitrator_sign_offer, ArbitratorClient, OfferSigningProtocol, SignOfferRequest,
    SignOfferResponse, SigningModel,
};
