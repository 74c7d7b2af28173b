//! # dex-trade — Trade Execution
//!
//! Carries a trade from a taken offer to a completed payout, or to a dispute
//! decided by the arbitrator the offer bound it to.
//!
//! ```text
//! INITIATED → DEPOSIT_PUBLISHED → DEPOSIT_CONFIRMED → PAYOUT_PUBLISHED → COMPLETED
//!     │               │                   │                  │
//!     └───────────────┴─────── DISPUTE_OPENED ───────────────┘
//!                                    │
//!                             DISPUTE_RESOLVED
//! ```
//!
//! - [`message`]: signed, step-numbered protocol messages.
//! - [`trade`]: the trade record and its state machine.
//! - [`pipeline`]: deposit, payout, and delivery task pipelines.
//! - [`protocol`]: the per-node engine that verifies, orders, and applies
//!   messages and fires deadlines.
//! - [`escalation`]: dispute opening along the agent chain and resolution.
//! - [`exchange`]: the node facade and inbound message dispatch.
//! - [`services`] and [`persistence`]: the wallet, network, and storage seams.

pub mod config;
pub mod error;
pub mod escalation;
pub mod exchange;
pub mod message;
pub mod persistence;
pub mod pipeline;
pub mod protocol;
pub mod services;
pub mod trade;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

// Re-export primary types.
pub use config::{ConfigError, ProtocolConfig};
pub use error::{NetworkError, PersistenceError, TradeError, WalletError};
pub use exchange::{ExchangeNode, NodeServices};
pub use message::{MessageBody, NetworkEnvelope, SignedTradeMessage, TradeMessage};
pub use persistence::{InMemoryPersistence, PersistenceService, Record, RecordKey};
pub use protocol::{ProtocolContext, Recovery, TradeProtocol};
pub use services::{
    Balance, MessageHandler, NetworkService, Transaction, TxKind, TxOutput, WalletService,
};
pub use trade::{Checkpoint, PipelineKind, Trade, TradeState, TradeTransition};
