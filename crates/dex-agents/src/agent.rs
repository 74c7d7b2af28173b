//! # Dispute Agents
//!
//! Arbitrators, mediators, and refund agents share one record type,
//! [`DisputeAgent`], tagged by [`AgentRole`]. Role-specific fields live in the
//! role variant, so no part of the protocol needs a per-role type hierarchy.
//!
//! An agent exists for a peer only after a registration signed by the agent's
//! own key has been verified. Registration does not imply trust: the consuming
//! party must also accept the agent (see [`crate::registry`]).

use std::collections::BTreeSet;

use dex_core::{LanguageCode, NodeAddress, Timestamp};
use dex_crypto::{sign_payload, verify_payload, Ed25519PublicKey, Ed25519Signature, KeyRing, PubKeyRing};
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

// ── Roles ────────────────────────────────────────────────────────────

/// Role discriminant used for lookups and selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentKind {
    /// Co-signs offers and resolves disputes on the trades it is bound to.
    Arbitrator,
    /// Human mediator proposing a resolution.
    Mediator,
    /// Pays out from a refund pool when a trade cannot complete.
    RefundAgent,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Arbitrator => "ARBITRATOR",
            Self::Mediator => "MEDIATOR",
            Self::RefundAgent => "REFUND_AGENT",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role with its role-specific registration fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentRole {
    Arbitrator {
        /// Fee charged on disputed trades, in basis points.
        fee_basis_points: u16,
    },
    Mediator,
    RefundAgent {
        /// Wallet address refunds are paid from.
        payout_address: String,
    },
}

impl AgentRole {
    pub fn kind(&self) -> AgentKind {
        match self {
            Self::Arbitrator { .. } => AgentKind::Arbitrator,
            Self::Mediator => AgentKind::Mediator,
            Self::RefundAgent { .. } => AgentKind::RefundAgent,
        }
    }
}

// ── Agent record ─────────────────────────────────────────────────────

/// A registered dispute agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeAgent {
    /// Network address; the directory key.
    pub address: NodeAddress,
    /// Keys the agent signs registrations, offers, and resolutions with.
    pub pub_key_ring: PubKeyRing,
    /// Languages the agent handles disputes in.
    pub languages: BTreeSet<LanguageCode>,
    /// When the agent signed this registration.
    pub registered_at: Timestamp,
    /// Optional contact address.
    pub email: Option<String>,
    /// Optional free text shown to users.
    pub info: Option<String>,
    /// Role and role-specific fields.
    pub role: AgentRole,
    /// Signature over every field above.
    pub registration_signature: Ed25519Signature,
}

/// The signed portion of a registration.
#[derive(Serialize)]
struct RegistrationClaim<'a> {
    address: &'a NodeAddress,
    pub_key_ring: &'a PubKeyRing,
    languages: &'a BTreeSet<LanguageCode>,
    registered_at: &'a Timestamp,
    email: &'a Option<String>,
    info: &'a Option<String>,
    role: &'a AgentRole,
}

impl DisputeAgent {
    pub fn kind(&self) -> AgentKind {
        self.role.kind()
    }

    /// Key that verifies this agent's signatures.
    pub fn signing_key(&self) -> &Ed25519PublicKey {
        &self.pub_key_ring.signing_key
    }

    pub fn supports_language(&self, language: &LanguageCode) -> bool {
        self.languages.contains(language)
    }

    /// Whether `registration_signature` verifies against the declared key.
    pub fn has_valid_registration(&self) -> bool {
        verify_payload(
            &self.claim(),
            &self.registration_signature,
            &self.pub_key_ring.signing_key,
        )
    }

    fn claim(&self) -> RegistrationClaim<'_> {
        RegistrationClaim {
            address: &self.address,
            pub_key_ring: &self.pub_key_ring,
            languages: &self.languages,
            registered_at: &self.registered_at,
            email: &self.email,
            info: &self.info,
            role: &self.role,
        }
    }
}

/// Builder for a registration the agent signs with its own keys.
#[derive(Debug, Clone)]
pub struct AgentRegistration {
    address: NodeAddress,
    role: AgentRole,
    languages: BTreeSet<LanguageCode>,
    registered_at: Timestamp,
    email: Option<String>,
    info: Option<String>,
}

impl AgentRegistration {
    pub fn new(
        address: NodeAddress,
        role: AgentRole,
        languages: impl IntoIterator<Item = LanguageCode>,
    ) -> Self {
        Self {
            address,
            role,
            languages: languages.into_iter().collect(),
            registered_at: Timestamp::now(),
            email: None,
            info: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }

    pub fn registered_at(mut self, at: Timestamp) -> Self {
        self.registered_at = at;
        self
    }

    /// Sign the registration with the agent's key ring.
    pub fn sign(self, keys: &KeyRing) -> Result<DisputeAgent, AgentError> {
        if self.languages.is_empty() {
            return Err(AgentError::InvalidRegistration {
                address: self.address,
                reason: "at least one language is required".into(),
            });
        }
        let mut agent = DisputeAgent {
            address: self.address,
            pub_key_ring: keys.pub_key_ring(),
            languages: self.languages,
            registered_at: self.registered_at,
            email: self.email,
            info: self.info,
            role: self.role,
            // Placeholder until the claim over the final fields is signed.
            registration_signature: Ed25519Signature::from_bytes([0u8; 64]),
        };
        agent.registration_signature = sign_payload(keys.signing_key(), &agent.claim())?;
        Ok(agent)
    }
}

// ── Withdrawal ───────────────────────────────────────────────────────

/// An agent's signed request to leave the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unregistration {
    pub address: NodeAddress,
    pub signed_at: Timestamp,
    pub signature: Ed25519Signature,
}

#[derive(Serialize)]
struct UnregistrationClaim<'a> {
    action: &'static str,
    address: &'a NodeAddress,
    signed_at: &'a Timestamp,
}

impl Unregistration {
    pub fn sign(keys: &KeyRing, address: NodeAddress) -> Result<Self, AgentError> {
        let signed_at = Timestamp::now();
        let signature = sign_payload(
            keys.signing_key(),
            &UnregistrationClaim {
                action: "unregister",
                address: &address,
                signed_at: &signed_at,
            },
        )?;
        Ok(Self {
            address,
            signed_at,
            signature,
        })
    }

    pub fn verify(&self, key: &Ed25519PublicKey) -> bool {
        verify_payload(
            &UnregistrationClaim {
                action: "unregister",
                address: &self.address,
                signed_at: &self.signed_at,
            },
            &self.signature,
            key,
        )
    }
}
