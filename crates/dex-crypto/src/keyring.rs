//! # Key Rings
//!
//! A node owns one [`KeyRing`]; peers learn its [`PubKeyRing`] through offers,
//! trade messages, and agent registrations.

use serde::{Deserialize, Serialize};

use crate::ed25519::{Ed25519KeyPair, Ed25519PublicKey};
use crate::signing::payload_digest;

/// The public half of a node's keys, as published to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PubKeyRing {
    /// Key that verifies this node's signatures.
    pub signing_key: Ed25519PublicKey,
}

impl PubKeyRing {
    /// Short stable identifier for logs (first 16 hex chars of the digest).
    pub fn fingerprint(&self) -> String {
        match payload_digest(self) {
            Ok(digest) => digest.to_hex()[..16].to_string(),
            Err(_) => self.signing_key.to_hex()[..16].to_string(),
        }
    }
}

/// A node's private signing material.
#[derive(Debug)]
pub struct KeyRing {
    signing: Ed25519KeyPair,
}

impl KeyRing {
    pub fn generate() -> Self {
        Self {
            signing: Ed25519KeyPair::generate(),
        }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: Ed25519KeyPair::from_seed(seed),
        }
    }

    pub fn signing_key(&self) -> &Ed25519KeyPair {
        &self.signing
    }

    pub fn pub_key_ring(&self) -> PubKeyRing {
        PubKeyRing {
            signing_key: self.signing.public_key(),
        }
    }
}
