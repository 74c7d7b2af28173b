//! # Error Types
//!
//! Errors shared by every crate in the workspace. Protocol crates define their
//! own `thiserror` enums and wrap these with `#[from]`.

use thiserror::Error;

/// Foundational validation and serialization failures.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Canonicalization failed.
    #[error("canonicalization error: {0}")]
    Canonicalization(#[from] CanonicalizationError),

    /// A value failed a constructor's validation rule.
    #[error("validation error: {0}")]
    Validation(String),
}

/// Error during canonical serialization.
#[derive(Error, Debug)]
pub enum CanonicalizationError {
    /// Float values are not permitted; amounts are integers in minor units.
    #[error("float values are not permitted in canonical representations: {0}")]
    FloatRejected(f64),

    /// JSON serialization failed.
    #[error("serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// Error in cryptographic operations.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Signature did not verify against the given key.
    #[error("signature verification failed: {0}")]
    VerificationFailed(String),

    /// Key bytes could not be parsed.
    #[error("key error: {0}")]
    KeyError(String),

    /// The payload could not be canonicalized for signing.
    #[error("canonicalization error: {0}")]
    Canonicalization(#[from] CanonicalizationError),
}
