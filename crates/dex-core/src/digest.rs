//! # Content Digests
//!
//! SHA-256 digests over [`CanonicalBytes`]. Trades keep a digest of every
//! signed protocol message they exchange; a dispute's evidence snapshot is a
//! list of these digests, and selection of a dispute agent is seeded from the
//! digest of a trade id.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::canonical::CanonicalBytes;

/// A 32-byte SHA-256 digest of canonical bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentDigest {
    /// The raw digest value.
    pub bytes: [u8; 32],
}

impl ContentDigest {
    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// The first eight bytes as a big-endian integer.
    ///
    /// Used as a deterministic seed; both trade parties derive the same value
    /// from the same canonical input.
    pub fn leading_u64(&self) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.bytes[..8]);
        u64::from_be_bytes(head)
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sha256:{}", self.to_hex())
    }
}

/// Compute the SHA-256 digest of canonical bytes.
///
/// Accepts only `&CanonicalBytes`, never raw slices.
pub fn sha256_digest(data: &CanonicalBytes) -> ContentDigest {
    let hash = Sha256::digest(data.as_bytes());
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&hash);
    ContentDigest { bytes }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_known_vector() {
        let cb = CanonicalBytes::new(&serde_json::json!({})).unwrap();
        assert_eq!(
            sha256_digest(&cb).to_hex(),
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn display_is_prefixed_hex() {
        let cb = CanonicalBytes::new(&serde_json::json!({"trade": 1})).unwrap();
        let s = sha256_digest(&cb).to_string();
        assert!(s.starts_with("sha256:"));
        assert_eq!(s.len(), 7 + 64);
    }

    #[test]
    fn leading_u64_reads_big_endian_prefix() {
        let mut bytes = [0u8; 32];
        bytes[7] = 5;
        bytes[6] = 1;
        assert_eq!(ContentDigest { bytes }.leading_u64(), 261);
    }

    #[test]
    fn distinct_inputs_distinct_digests() {
        let a = CanonicalBytes::new(&serde_json::json!({"a": 1})).unwrap();
        let b = CanonicalBytes::new(&serde_json::json!({"a": 2})).unwrap();
        assert_ne!(sha256_digest(&a), sha256_digest(&b));
    }
}
