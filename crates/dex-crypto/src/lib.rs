//! # dex-crypto — Signatures at Every Trust Boundary
//!
//! - **Ed25519** key pairs, public keys, and signatures over `CanonicalBytes`.
//! - **One verification path.** [`verify_signature`] answers yes/no for
//!   agent registration, offer co-signing, trade messages, and dispute
//!   resolutions alike; [`verify_payload`] canonicalizes a typed record first.
//! - **Key rings** published by every node.
//!
//! ## Crate Policy
//!
//! - Depends only on `dex-core` internally.
//! - Tests use real Ed25519, never mocks.

pub mod ed25519;
pub mod keyring;
pub mod signing;

pub use ed25519::{verify, verify_signature, Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature};
pub use keyring::{KeyRing, PubKeyRing};
pub use signing::{payload_digest, sign_payload, verify_payload};
