//! # Canonical Serialization
//!
//! `CanonicalBytes` is the only input accepted by signing, verification, and
//! digest functions anywhere in the workspace. Maker, taker, arbitrator, and
//! dispute agents each re-serialize the payloads they verify, so every party
//! must derive byte-identical input from the same logical value.
//!
//! ## Rules
//!
//! 1. Floats are rejected. Amounts and prices are integers in minor units.
//! 2. Timestamps are carried as [`crate::Timestamp`], which serializes as
//!    `YYYY-MM-DDTHH:MM:SSZ`.
//! 3. Output is RFC 8785 (JCS): sorted keys, no insignificant whitespace.

use serde::Serialize;
use serde_json::Value;

use crate::error::CanonicalizationError;

/// Bytes produced exclusively by JCS canonicalization.
///
/// The inner buffer is private; [`CanonicalBytes::new`] is the sole
/// constructor, so a signature can never be computed over bytes that skipped
/// float rejection or key ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalBytes(Vec<u8>);

impl CanonicalBytes {
    /// Canonicalize any serializable value.
    ///
    /// # Errors
    ///
    /// `FloatRejected` if any number in the value tree is a non-integer
    /// float, `SerializationFailed` if serde cannot produce a JSON value.
    pub fn new(obj: &impl Serialize) -> Result<Self, CanonicalizationError> {
        let value = serde_json::to_value(obj)?;
        reject_floats(&value)?;
        let encoded = serde_jcs::to_string(&value)?;
        Ok(Self(encoded.into_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for CanonicalBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Walk the value tree and fail on the first non-integer number.
fn reject_floats(value: &Value) -> Result<(), CanonicalizationError> {
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => Ok(()),
        Value::Number(n) => {
            if !n.is_i64() && !n.is_u64() {
                if let Some(f) = n.as_f64() {
                    return Err(CanonicalizationError::FloatRejected(f));
                }
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(reject_floats),
        Value::Object(map) => map.values().try_for_each(reject_floats),
    }
}
