//! # Persistence
//!
//! A synchronous key-value contract for the records a node must survive a
//! restart with. The storage format is the implementation's business.

use std::collections::HashMap;

use dex_agents::DisputeAgent;
use dex_arbitration::Dispute;
use dex_core::{DisputeId, NodeAddress, OfferId, TradeId};
use dex_offer::Offer;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;
use crate::trade::Trade;

/// A stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Record {
    Offer(Offer),
    Trade(Box<Trade>),
    Dispute(Box<Dispute>),
    Agent(DisputeAgent),
    /// The addresses this node accepts as dispute agents.
    AcceptedAgents(Vec<NodeAddress>),
}

/// Key of a stored record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKey {
    Offer(OfferId),
    Trade(TradeId),
    Dispute(DisputeId),
    Agent(NodeAddress),
    AcceptedAgents,
}

impl Record {
    pub fn key(&self) -> RecordKey {
        match self {
            Self::Offer(o) => RecordKey::Offer(o.id()),
            Self::Trade(t) => RecordKey::Trade(t.id),
            Self::Dispute(d) => RecordKey::Dispute(d.id),
            Self::Agent(a) => RecordKey::Agent(a.address.clone()),
            Self::AcceptedAgents(_) => RecordKey::AcceptedAgents,
        }
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offer(id) => write!(f, "{id}"),
            Self::Trade(id) => write!(f, "{id}"),
            Self::Dispute(id) => write!(f, "{id}"),
            Self::Agent(addr) => write!(f, "agent:{addr}"),
            Self::AcceptedAgents => f.write_str("accepted-agents"),
        }
    }
}

pub trait PersistenceService: Send + Sync {
    /// Insert or replace the record under its key.
    fn save(&self, record: Record) -> Result<(), PersistenceError>;

    fn load(&self, key: &RecordKey) -> Result<Option<Record>, PersistenceError>;

    /// Every stored record, in no particular order. Used to rebuild a node's
    /// state on start-up.
    fn load_all(&self) -> Result<Vec<Record>, PersistenceError>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    records: RwLock<HashMap<RecordKey, Record>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn load_trade(&self, id: &TradeId) -> Option<Trade> {
        match self.records.read().get(&RecordKey::Trade(*id)) {
            Some(Record::Trade(t)) => Some((**t).clone()),
            _ => None,
        }
    }
}

impl PersistenceService for InMemoryPersistence {
    fn save(&self, record: Record) -> Result<(), PersistenceError> {
        self.records.write().insert(record.key(), record);
        Ok(())
    }

    fn load(&self, key: &RecordKey) -> Result<Option<Record>, PersistenceError> {
        Ok(self.records.read().get(key).cloned())
    }

    fn load_all(&self) -> Result<Vec<Record>, PersistenceError> {
        Ok(self.records.read().values().cloned().collect())
    }
}
