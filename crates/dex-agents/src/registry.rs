//! # Dispute-Agent Registry
//!
//! Each node keeps one registry, passed explicitly to every protocol that
//! needs an agent. It tracks three independent sets:
//!
//! - **registered**: agents whose signed registration verified;
//! - **accepted**: addresses this user chose to trust;
//! - **banned**: addresses excluded by the active filter.
//!
//! An agent is usable only when registered, accepted, and not banned.
//! Registration never implies acceptance.
//!
//! ## Concurrency
//!
//! State lives in an immutable [`RegistrySnapshot`] behind
//! `RwLock<Arc<_>>`. Readers clone the `Arc` and work on a consistent view
//! for as long as they like. Writers copy the current snapshot, mutate the
//! copy, and swap it in under the write lock, so a reader never observes a
//! half-applied update.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dex_core::{LanguageCode, NodeAddress, TradeId};
use parking_lot::RwLock;

use crate::agent::{AgentKind, DisputeAgent, Unregistration};
use crate::error::AgentError;
use crate::selection;

/// What `register` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Inserted,
    Replaced {
        /// The replacement changed the agent's key, so earlier acceptance
        /// was withdrawn and must be granted again.
        acceptance_revoked: bool,
    },
}

/// A consistent view of the registry.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    registered: BTreeMap<NodeAddress, DisputeAgent>,
    accepted: BTreeSet<NodeAddress>,
    banned: BTreeSet<NodeAddress>,
}

impl RegistrySnapshot {
    pub fn registered(&self, address: &NodeAddress) -> Option<&DisputeAgent> {
        self.registered.get(address)
    }

    pub fn is_accepted(&self, address: &NodeAddress) -> bool {
        self.accepted.contains(address)
    }

    pub fn is_banned(&self, address: &NodeAddress) -> bool {
        self.banned.contains(address)
    }

    /// Accepted addresses, in order.
    pub fn accepted_addresses(&self) -> Vec<NodeAddress> {
        self.accepted.iter().cloned().collect()
    }

    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    /// Accepted agents of `kind`, ordered by address.
    pub fn accepted_of_kind(&self, kind: AgentKind) -> impl Iterator<Item = &DisputeAgent> {
        self.accepted
            .iter()
            .filter_map(|address| self.registered.get(address))
            .filter(move |agent| agent.kind() == kind)
    }

    /// Accepted agents of `kind` that speak `language`, ordered by address.
    pub fn eligible(&self, language: &LanguageCode, kind: AgentKind) -> Vec<DisputeAgent> {
        self.accepted_of_kind(kind)
            .filter(|agent| agent.supports_language(language))
            .cloned()
            .collect()
    }
}

/// The node's dispute-agent directory.
#[derive(Debug, Default)]
pub struct DisputeAgentRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl DisputeAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current consistent view.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.read().clone()
    }

    /// Copy, mutate, swap. `f` failing leaves the registry untouched.
    fn update<R>(
        &self,
        f: impl FnOnce(&mut RegistrySnapshot) -> Result<R, AgentError>,
    ) -> Result<R, AgentError> {
        let mut guard = self.current.write();
        let mut next = RegistrySnapshot::clone(&guard);
        let out = f(&mut next)?;
        *guard = Arc::new(next);
        Ok(out)
    }

    /// Verify and store a registration, keyed by address.
    ///
    /// # Errors
    ///
    /// - `InvalidSignature` if the registration does not verify against the
    ///   key it declares.
    /// - `Banned` if the address is filtered.
    /// - `StaleRegistration` if a newer registration is already held for the
    ///   address.
    pub fn register(&self, agent: DisputeAgent) -> Result<RegistrationOutcome, AgentError> {
        if !agent.has_valid_registration() {
            tracing::warn!(address = %agent.address, "rejected agent registration with invalid signature");
            return Err(AgentError::InvalidSignature {
                address: agent.address,
            });
        }

        let address = agent.address.clone();
        let kind = agent.kind();
        let outcome = self.update(move |snap| {
            if snap.banned.contains(&agent.address) {
                return Err(AgentError::Banned {
                    address: agent.address,
                });
            }
            let outcome = match snap.registered.get(&agent.address) {
                None => RegistrationOutcome::Inserted,
                Some(existing) => {
                    if existing.registered_at > agent.registered_at {
                        return Err(AgentError::StaleRegistration {
                            offered: agent.registered_at.to_string(),
                            current: existing.registered_at.to_string(),
                            address: agent.address,
                        });
                    }
                    let key_changed = existing.signing_key() != agent.signing_key();
                    if key_changed {
                        snap.accepted.remove(&agent.address);
                    }
                    RegistrationOutcome::Replaced {
                        acceptance_revoked: key_changed,
                    }
                }
            };
            snap.registered.insert(agent.address.clone(), agent);
            Ok(outcome)
        })?;

        tracing::info!(address = %address, kind = %kind, ?outcome, "dispute agent registered");
        Ok(outcome)
    }

    /// Remove an agent on its own signed request.
    ///
    /// Returns `true` if the agent was accepted before removal.
    pub fn unregister(&self, withdrawal: &Unregistration) -> Result<bool, AgentError> {
        let was_accepted = self.update(|snap| {
            let agent = snap
                .registered
                .get(&withdrawal.address)
                .ok_or_else(|| AgentError::UnknownAgent {
                    address: withdrawal.address.clone(),
                })?;
            if !withdrawal.verify(agent.signing_key()) {
                return Err(AgentError::InvalidSignature {
                    address: withdrawal.address.clone(),
                });
            }
            snap.registered.remove(&withdrawal.address);
            Ok(snap.accepted.remove(&withdrawal.address))
        })?;
        tracing::info!(address = %withdrawal.address, "dispute agent unregistered");
        Ok(was_accepted)
    }

    /// Trust a registered agent.
    pub fn accept(&self, address: &NodeAddress) -> Result<(), AgentError> {
        self.update(|snap| {
            if snap.banned.contains(address) {
                return Err(AgentError::Banned {
                    address: address.clone(),
                });
            }
            if !snap.registered.contains_key(address) {
                return Err(AgentError::UnknownAgent {
                    address: address.clone(),
                });
            }
            snap.accepted.insert(address.clone());
            Ok(())
        })?;
        tracing::info!(address = %address, "dispute agent accepted");
        Ok(())
    }

    /// Withdraw trust. Returns whether the address was accepted.
    pub fn revoke(&self, address: &NodeAddress) -> bool {
        let mut guard = self.current.write();
        if !guard.accepted.contains(address) {
            return false;
        }
        let mut next = RegistrySnapshot::clone(&guard);
        next.accepted.remove(address);
        *guard = Arc::new(next);
        tracing::info!(address = %address, "dispute agent acceptance revoked");
        true
    }

    /// Replace the ban filter. Banned agents are dropped from the registered
    /// and accepted sets; returns the addresses that were dropped.
    pub fn apply_filter(&self, banned: impl IntoIterator<Item = NodeAddress>) -> Vec<NodeAddress> {
        let banned: BTreeSet<NodeAddress> = banned.into_iter().collect();
        let mut guard = self.current.write();
        let mut next = RegistrySnapshot::clone(&guard);
        let dropped: Vec<NodeAddress> = next
            .registered
            .keys()
            .filter(|address| banned.contains(*address))
            .cloned()
            .collect();
        for address in &dropped {
            next.registered.remove(address);
            next.accepted.remove(address);
            tracing::warn!(address = %address, "dispute agent excluded by filter");
        }
        next.accepted.retain(|address| !banned.contains(address));
        next.banned = banned;
        *guard = Arc::new(next);
        dropped
    }

    /// Accepted agents of `kind` speaking `language`, ordered by address.
    /// An empty result is normal.
    pub fn select_eligible(&self, language: &LanguageCode, kind: AgentKind) -> Vec<DisputeAgent> {
        self.snapshot().eligible(language, kind)
    }

    /// Deterministic pick among eligible agents, seeded by the trade id so
    /// both parties choose the same agent.
    pub fn select_one(
        &self,
        language: &LanguageCode,
        kind: AgentKind,
        trade_id: &TradeId,
    ) -> Option<DisputeAgent> {
        let eligible = self.select_eligible(language, kind);
        selection::pick(&eligible, trade_id).cloned()
    }

    /// An accepted agent of `kind` at `address`.
    pub fn accepted_agent(&self, address: &NodeAddress, kind: AgentKind) -> Option<DisputeAgent> {
        let snap = self.snapshot();
        if !snap.is_accepted(address) {
            return None;
        }
        snap.registered(address)
            .filter(|agent| agent.kind() == kind)
            .cloned()
    }
}
