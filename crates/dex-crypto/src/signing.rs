//! # Payload Signing
//!
//! Typed wrappers over [`Ed25519KeyPair::sign`] and [`verify_signature`] that
//! canonicalize a serializable payload first. Protocol crates sign and verify
//! their records through these two functions only.

use dex_core::{CanonicalBytes, CanonicalizationError, ContentDigest};
use serde::Serialize;

use crate::ed25519::{verify_signature, Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature};

/// Canonicalize `payload` and sign it.
pub fn sign_payload<T: Serialize>(
    key: &Ed25519KeyPair,
    payload: &T,
) -> Result<Ed25519Signature, CanonicalizationError> {
    let canonical = CanonicalBytes::new(payload)?;
    Ok(key.sign(&canonical))
}

/// Canonicalize `payload` and check `signature` against `key`.
///
/// A payload that cannot be canonicalized never verifies.
pub fn verify_payload<T: Serialize>(
    payload: &T,
    signature: &Ed25519Signature,
    key: &Ed25519PublicKey,
) -> bool {
    match CanonicalBytes::new(payload) {
        Ok(canonical) => verify_signature(&canonical, signature, key),
        Err(e) => {
            tracing::warn!(error = %e, "payload could not be canonicalized for verification");
            false
        }
    }
}

/// Digest of a payload's canonical form.
pub fn payload_digest<T: Serialize>(payload: &T) -> Result<ContentDigest, CanonicalizationError> {
    Ok(dex_core::sha256_digest(&CanonicalBytes::new(payload)?))
}
