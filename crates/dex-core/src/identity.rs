//! # Identifiers
//!
//! Newtypes for every identifier the protocol passes around, so an `OfferId`
//! can never be handed to a function expecting a `TradeId`. Network-facing
//! strings (`NodeAddress`, `LanguageCode`, `TxId`) are validated on
//! construction and on deserialization.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::CoreError;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Access the inner UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a maker's offer.
    OfferId,
    "offer"
);
uuid_id!(
    /// Identifier of a trade. Shared by both parties' local copies.
    TradeId,
    "trade"
);
uuid_id!(
    /// Identifier of a dispute opened against a trade.
    DisputeId,
    "dispute"
);
uuid_id!(
    /// Identifier of a single protocol message, used for duplicate suppression.
    MessageId,
    "msg"
);

impl DisputeId {
    /// The dispute id both parties of `trade_id` derive independently.
    pub fn for_trade(trade_id: &TradeId) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"dispute:");
        hasher.update(trade_id.as_uuid().as_bytes());
        let hash = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hash[..16]);
        Self(uuid::Builder::from_random_bytes(bytes).into_uuid())
    }
}

// ── Network address ──────────────────────────────────────────────────

/// A peer's network address in `host:port` form.
///
/// Hosts are opaque to the core (onion addresses, hostnames, loopback), but
/// must be non-empty and carry a numeric port.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeAddress(String);

impl NodeAddress {
    pub fn new(address: impl Into<String>) -> Result<Self, CoreError> {
        let address = address.into();
        let Some((host, port)) = address.rsplit_once(':') else {
            return Err(CoreError::Validation(format!(
                "node address must be host:port, got {address:?}"
            )));
        };
        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(CoreError::Validation(format!(
                "node address has an invalid host: {address:?}"
            )));
        }
        if port.parse::<u16>().is_err() {
            return Err(CoreError::Validation(format!(
                "node address has an invalid port: {address:?}"
            )));
        }
        Ok(Self(address))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for NodeAddress {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeAddress> for String {
    fn from(value: NodeAddress) -> Self {
        value.0
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Language code ────────────────────────────────────────────────────

/// ISO 639 language code (two or three ASCII letters), stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LanguageCode(String);

impl LanguageCode {
    pub fn new(code: impl AsRef<str>) -> Result<Self, CoreError> {
        let code = code.as_ref();
        let valid = (2..=3).contains(&code.len()) && code.chars().all(|c| c.is_ascii_alphabetic());
        if !valid {
            return Err(CoreError::Validation(format!(
                "language code must be 2-3 ASCII letters, got {code:?}"
            )));
        }
        Ok(Self(code.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// English, the fallback dispute language.
impl Default for LanguageCode {
    fn default() -> Self {
        Self("en".to_string())
    }
}

impl TryFrom<String> for LanguageCode {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<LanguageCode> for String {
    fn from(value: LanguageCode) -> Self {
        value.0
    }
}

impl std::fmt::Display for LanguageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Transaction id ───────────────────────────────────────────────────

/// A blockchain transaction id as reported by the wallet (64 hex chars).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TxId(String);

impl TxId {
    pub fn new(id: impl AsRef<str>) -> Result<Self, CoreError> {
        let id = id.as_ref();
        if id.len() != 64 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CoreError::Validation(format!(
                "transaction id must be 64 hex characters, got {id:?}"
            )));
        }
        Ok(Self(id.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TxId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TxId> for String {
    fn from(value: TxId) -> Self {
        value.0
    }
}

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
