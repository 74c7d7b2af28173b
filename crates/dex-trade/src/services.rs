//! # External Collaborators
//!
//! The trade core never constructs, signs, or transports anything itself. It
//! consumes a wallet and a network through these traits; implementations are
//! supplied by the embedding node (and by [`crate::testing`] in tests).
//!
//! Delivery is at-least-once and unordered across peers. Per-trade ordering
//! and duplicate suppression are enforced by the protocol, not the transport.

use async_trait::async_trait;
use dex_arbitration::PayoutDecision;
use dex_core::{NodeAddress, TradeId, TxId};
use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, TradeError, WalletError};
use crate::message::NetworkEnvelope;
use crate::trade::Trade;

// ── Wallet ───────────────────────────────────────────────────────────

/// What a transaction does for its trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxKind {
    Deposit,
    Payout,
}

/// One output of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: String,
    pub amount: u64,
}

/// A wallet-built transaction awaiting broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub kind: TxKind,
    pub trade_id: TradeId,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    pub fn total(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount).sum()
    }
}

/// Wallet funds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub available: u64,
    pub reserved: u64,
    pub locked: u64,
}

#[async_trait]
pub trait WalletService: Send + Sync {
    /// Build the deposit that locks the trade amount.
    async fn build_deposit_transaction(&self, trade: &Trade) -> Result<Transaction, WalletError>;

    /// Build a payout of the deposit divided according to `decision`.
    async fn build_payout_transaction(
        &self,
        trade: &Trade,
        decision: PayoutDecision,
    ) -> Result<Transaction, WalletError>;

    async fn broadcast(&self, tx: &Transaction) -> Result<TxId, WalletError>;

    async fn balance(&self) -> Result<Balance, WalletError>;

    /// Confirmations of a broadcast transaction; zero if unknown.
    async fn confirmations(&self, tx_id: &TxId) -> Result<u32, WalletError>;
}

// ── Network ──────────────────────────────────────────────────────────

#[async_trait]
pub trait NetworkService: Send + Sync {
    /// Send to one peer. `Ok` means the peer's transport acknowledged receipt.
    async fn send_direct(
        &self,
        peer: &NodeAddress,
        envelope: NetworkEnvelope,
    ) -> Result<(), NetworkError>;

    /// Publish to every connected peer.
    async fn broadcast(&self, envelope: NetworkEnvelope) -> Result<(), NetworkError>;
}

/// Receive callback a node registers with its transport.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, from: NodeAddress, envelope: NetworkEnvelope)
        -> Result<(), TradeError>;
}
