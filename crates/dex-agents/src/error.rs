//! # Agent Directory Errors

use dex_core::{CanonicalizationError, NodeAddress};
use thiserror::Error;

/// Errors from registering, accepting, or withdrawing dispute agents.
#[derive(Error, Debug)]
pub enum AgentError {
    /// The registration or withdrawal signature does not verify against the
    /// agent's declared key.
    #[error("invalid signature on registration for agent {address}")]
    InvalidSignature {
        /// Address the registration claimed.
        address: NodeAddress,
    },

    /// The address is excluded by the active filter.
    #[error("agent {address} is banned by filter")]
    Banned {
        /// Banned address.
        address: NodeAddress,
    },

    /// No registration exists for the address.
    #[error("no registered dispute agent at {address}")]
    UnknownAgent {
        /// Address looked up.
        address: NodeAddress,
    },

    /// A registration older than the one already held was offered.
    #[error("stale registration for agent {address}: {offered} is older than {current}")]
    StaleRegistration {
        /// Agent address.
        address: NodeAddress,
        /// Timestamp of the offered registration.
        offered: String,
        /// Timestamp of the registration already held.
        current: String,
    },

    /// The registration is well-signed but unusable.
    #[error("invalid registration for agent {address}: {reason}")]
    InvalidRegistration {
        /// Agent address.
        address: NodeAddress,
        /// What is wrong with it.
        reason: String,
    },

    /// The registration could not be canonicalized for signing.
    #[error("canonicalization error: {0}")]
    Canonicalization(#[from] CanonicalizationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> NodeAddress {
        NodeAddress::new("arb.onion:9999").unwrap()
    }

    #[test]
    fn invalid_signature_display_names_address() {
        let err = AgentError::InvalidSignature { address: addr() };
        assert_eq!(
            format!("{err}"),
            "invalid signature on registration for agent arb.onion:9999"
        );
    }

    #[test]
    fn stale_registration_display() {
        let err = AgentError::StaleRegistration {
            address: addr(),
            offered: "2026-01-01T00:00:00Z".into(),
            current: "2026-02-01T00:00:00Z".into(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("older than 2026-02-01T00:00:00Z"));
    }
}
