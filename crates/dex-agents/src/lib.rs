//! # dex-agents — Dispute-Agent Directory
//!
//! Arbitrators co-sign offers and resolve disputes on the trades bound to
//! them; mediators and refund agents take over when the arbitrator is
//! unreachable. This crate holds the per-user directory every trade consults:
//!
//! - [`DisputeAgent`]: one record type tagged by [`AgentRole`].
//! - [`DisputeAgentRegistry`]: signed registration, explicit acceptance,
//!   ban filtering, and deterministic language-aware selection.
//!
//! The registry is ordinary per-node state. Protocols receive it as an
//! `Arc<DisputeAgentRegistry>` argument; there is no global instance.

pub mod agent;
pub mod error;
pub mod registry;
pub mod selection;

// Re-export primary types.
pub use agent::{AgentKind, AgentRegistration, AgentRole, DisputeAgent, Unregistration};
pub use error::AgentError;
pub use registry::{DisputeAgentRegistry, RegistrationOutcome, RegistrySnapshot};
