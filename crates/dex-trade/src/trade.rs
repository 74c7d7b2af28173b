//! # Trade Lifecycle
//!
//! One [`Trade`] per accepted offer per party. Each party's copy advances only
//! on its own wallet results and on verified, signed messages from the
//! counterparty.
//!
//! ```text
//! INITIATED ──▶ DEPOSIT_PUBLISHED ──▶ DEPOSIT_CONFIRMED ──▶ PAYOUT_PUBLISHED ──▶ COMPLETED
//!     │                │                     │                     │
//!     └────────────────┴─────────┬───────────┴─────────────────────┘
//!                                ▼
//!                         DISPUTE_OPENED ──▶ DISPUTE_RESOLVED
//! ```
//!
//! A take request the maker rejects moves the taker's copy from `INITIATED`
//! to `CANCELLED`; no funds have moved at that point.
//!
//! Every awaiting state carries a deadline. The version counter increments on
//! every transition and every re-armed deadline, so a timer armed for an
//! older version never acts.

use std::collections::BTreeSet;

use dex_arbitration::{EvidenceSnapshot, PartyRole, PayoutDecision};
use dex_core::{ContentDigest, DisputeId, MessageId, NodeAddress, Timestamp, TradeId, TxId};
use dex_crypto::{Ed25519PublicKey, PubKeyRing};
use dex_offer::{Direction, OfferPayload};
use serde::{Deserialize, Serialize};

use crate::error::TradeError;
use crate::message::SignedTradeMessage;
use crate::services::{Transaction, TxKind};

// ── Trade State ──────────────────────────────────────────────────────

/// The lifecycle state of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeState {
    /// Offer taken; waiting for acceptance or the deposit.
    Initiated,
    /// Deposit broadcast; waiting for confirmations.
    DepositPublished,
    /// Deposit confirmed; waiting for the payout.
    DepositConfirmed,
    /// Payout broadcast; waiting for the buyer's acknowledgment.
    PayoutPublished,
    /// Terminal success state.
    Completed,
    /// Escalated to a dispute agent.
    DisputeOpened,
    /// The agent's decision was applied. Terminal state.
    DisputeResolved,
    /// The maker rejected the take request. Terminal state.
    Cancelled,
}

impl TradeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "INITIATED",
            Self::DepositPublished => "DEPOSIT_PUBLISHED",
            Self::DepositConfirmed => "DEPOSIT_CONFIRMED",
            Self::PayoutPublished => "PAYOUT_PUBLISHED",
            Self::Completed => "COMPLETED",
            Self::DisputeOpened => "DISPUTE_OPENED",
            Self::DisputeResolved => "DISPUTE_RESOLVED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::DisputeResolved | Self::Cancelled)
    }

    /// States that wait on the counterparty and carry a deadline.
    pub fn is_awaiting(&self) -> bool {
        matches!(
            self,
            Self::Initiated | Self::DepositPublished | Self::DepositConfirmed | Self::PayoutPublished
        )
    }

    /// Valid target states from this state.
    pub fn valid_transitions(&self) -> &'static [TradeState] {
        match self {
            Self::Initiated => &[Self::DepositPublished, Self::DisputeOpened, Self::Cancelled],
            Self::DepositPublished => &[Self::DepositConfirmed, Self::DisputeOpened],
            Self::DepositConfirmed => &[Self::PayoutPublished, Self::DisputeOpened],
            Self::PayoutPublished => &[Self::Completed, Self::DisputeOpened],
            Self::DisputeOpened => &[Self::DisputeResolved],
            Self::Completed | Self::DisputeResolved | Self::Cancelled => &[],
        }
    }
}

impl std::fmt::Display for TradeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeTransition {
    pub from: TradeState,
    pub to: TradeState,
    pub at: Timestamp,
    pub reason: String,
}

// ── Checkpoints ──────────────────────────────────────────────────────

/// The fund-moving and messaging pipelines a trade runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineKind {
    PublishDeposit,
    PublishPayout,
    DisputePayout,
    Deliver,
}

impl PipelineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PublishDeposit => "publish_deposit",
            Self::PublishPayout => "publish_payout",
            Self::DisputePayout => "dispute_payout",
            Self::Deliver => "deliver_message",
        }
    }
}

/// Where a pipeline stopped on a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub pipeline: PipelineKind,
    /// Index of the failed task; resuming starts here.
    pub step: usize,
    pub decision: Option<PayoutDecision>,
}

/// How an incoming stepped message relates to the trade's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOrder {
    /// Already processed or behind the trade; ignore.
    Duplicate,
    /// The next step.
    Next,
    /// Ahead of the next step; reject.
    Future,
}

// ── The Trade ────────────────────────────────────────────────────────

/// One party's record of a trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    /// The co-signed offer, as taken.
    pub offer: OfferPayload,
    /// This node's role.
    pub role: PartyRole,
    pub amount: u64,
    pub taker: NodeAddress,
    pub taker_pub_key_ring: PubKeyRing,
    /// Arbitrator bound by the offer, with the key that co-signed it.
    pub arbitrator: NodeAddress,
    pub arbitrator_key: Ed25519PublicKey,
    pub taken_at: Timestamp,
    pub deadline: Option<Timestamp>,
    pub deposit_tx_id: Option<TxId>,
    pub payout_tx_id: Option<TxId>,
    /// Transaction built but not yet broadcast.
    pub pending_tx: Option<Transaction>,
    /// Signed message prepared but not yet delivered.
    pub outbox: Option<SignedTradeMessage>,
    /// A verified next-step message that arrived before the local
    /// precondition held (payout request before local confirmation).
    pub deferred: Option<SignedTradeMessage>,
    pub checkpoint: Option<Checkpoint>,
    pub error_message: Option<String>,
    pub dispute_id: Option<DisputeId>,
    state: TradeState,
    version: u64,
    last_step: Option<u8>,
    processed_messages: BTreeSet<MessageId>,
    message_digests: Vec<ContentDigest>,
    transition_log: Vec<TradeTransition>,
}

impl Trade {
    /// A new trade in `INITIATED`.
    pub fn new(
        id: TradeId,
        offer: OfferPayload,
        role: PartyRole,
        amount: u64,
        taker: NodeAddress,
        taker_pub_key_ring: PubKeyRing,
        arbitrator_key: Ed25519PublicKey,
    ) -> Self {
        let arbitrator = offer.arbitrator_signer.clone();
        tracing::info!(trade_id = %id, offer_id = %offer.id, role = %role, amount, "trade initiated");
        Self {
            id,
            offer,
            role,
            amount,
            taker,
            taker_pub_key_ring,
            arbitrator,
            arbitrator_key,
            taken_at: Timestamp::now(),
            deadline: None,
            deposit_tx_id: None,
            payout_tx_id: None,
            pending_tx: None,
            outbox: None,
            deferred: None,
            checkpoint: None,
            error_message: None,
            dispute_id: None,
            state: TradeState::Initiated,
            version: 0,
            last_step: None,
            processed_messages: BTreeSet::new(),
            message_digests: Vec::new(),
            transition_log: Vec::new(),
        }
    }

    pub fn state(&self) -> TradeState {
        self.state
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn last_step(&self) -> Option<u8> {
        self.last_step
    }

    pub fn transition_log(&self) -> &[TradeTransition] {
        &self.transition_log
    }

    pub fn message_digests(&self) -> &[ContentDigest] {
        &self.message_digests
    }

    pub fn tx_id(&self, kind: TxKind) -> Option<&TxId> {
        match kind {
            TxKind::Deposit => self.deposit_tx_id.as_ref(),
            TxKind::Payout => self.payout_tx_id.as_ref(),
        }
    }

    pub fn maker(&self) -> &NodeAddress {
        &self.offer.maker_address
    }

    pub fn counterparty(&self) -> &NodeAddress {
        match self.role {
            PartyRole::Maker => &self.taker,
            PartyRole::Taker => &self.offer.maker_address,
        }
    }

    pub fn counterparty_key(&self) -> &Ed25519PublicKey {
        match self.role {
            PartyRole::Maker => &self.taker_pub_key_ring.signing_key,
            PartyRole::Taker => &self.offer.maker_pub_key_ring.signing_key,
        }
    }

    /// The party delivering the base currency: the maker of a sell offer,
    /// the taker of a buy offer.
    pub fn seller_role(&self) -> PartyRole {
        match self.offer.terms.direction {
            Direction::Sell => PartyRole::Maker,
            Direction::Buy => PartyRole::Taker,
        }
    }

    pub fn is_seller(&self) -> bool {
        self.role == self.seller_role()
    }

    pub fn is_buyer(&self) -> bool {
        !self.is_seller()
    }

    /// Payout of a completed trade: everything to the buyer.
    pub fn release_decision(&self) -> PayoutDecision {
        match self.seller_role().counterparty() {
            PartyRole::Maker => PayoutDecision::PayoutToMaker,
            PartyRole::Taker => PayoutDecision::PayoutToTaker,
        }
    }

    /// Move to `to`, recording the transition.
    pub fn transition(&mut self, to: TradeState, reason: &str) -> Result<(), TradeError> {
        if !self.state.valid_transitions().contains(&to) {
            return Err(TradeError::InvalidTransition {
                trade_id: self.id,
                from: self.state.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        tracing::info!(
            trade_id = %self.id,
            role = %self.role,
            from = %self.state,
            to = %to,
            reason,
            "trade transition"
        );
        self.transition_log.push(TradeTransition {
            from: self.state,
            to,
            at: Timestamp::now(),
            reason: reason.to_string(),
        });
        self.state = to;
        self.version += 1;
        if !to.is_awaiting() {
            self.deadline = None;
        }
        Ok(())
    }

    /// Set a new deadline; returns the version a timer must be armed with.
    pub fn arm_deadline(&mut self, at: Timestamp) -> u64 {
        self.deadline = Some(at);
        self.version += 1;
        self.version
    }

    /// Whether the deadline has passed while still awaiting.
    pub fn is_overdue(&self, now: Timestamp) -> bool {
        self.state.is_awaiting() && self.deadline.is_some_and(|d| d <= now)
    }

    /// Classify a stepped message against the trade's progress.
    pub fn order_of(&self, message: &SignedTradeMessage) -> MessageOrder {
        if self.processed_messages.contains(&message.id()) {
            return MessageOrder::Duplicate;
        }
        let Some(step) = message.step() else {
            return MessageOrder::Next;
        };
        let next = self.last_step.map_or(0, |s| s + 1);
        match step.cmp(&next) {
            std::cmp::Ordering::Less => MessageOrder::Duplicate,
            std::cmp::Ordering::Equal => MessageOrder::Next,
            std::cmp::Ordering::Greater => MessageOrder::Future,
        }
    }

    pub fn has_processed(&self, id: &MessageId) -> bool {
        self.processed_messages.contains(id)
    }

    /// Record a sent or received message as evidence and advance the step.
    pub fn record_message(&mut self, message: &SignedTradeMessage) -> Result<(), TradeError> {
        if !self.processed_messages.insert(message.id()) {
            return Ok(());
        }
        self.message_digests.push(message.digest()?);
        if let Some(step) = message.step() {
            self.last_step = Some(self.last_step.map_or(step, |s| s.max(step)));
        }
        Ok(())
    }

    /// Hold a verified message until its local precondition holds.
    /// Redeliveries are treated as duplicates meanwhile.
    pub fn hold_message(&mut self, message: SignedTradeMessage) {
        self.processed_messages.insert(message.id());
        self.deferred = Some(message);
    }

    /// Release a held message so it can be processed and recorded.
    pub fn take_deferred(&mut self) -> Option<SignedTradeMessage> {
        let message = self.deferred.take()?;
        self.processed_messages.remove(&message.id());
        Some(message)
    }

    /// The signed evidence handed to a dispute agent.
    pub fn evidence_snapshot(&self) -> EvidenceSnapshot {
        EvidenceSnapshot {
            trade_id: self.id,
            offer_id: self.offer.id,
            trade_state: self.state.as_str().to_string(),
            amount: self.amount,
            deposit_tx_id: self.deposit_tx_id.clone(),
            payout_tx_id: self.payout_tx_id.clone(),
            message_digests: self.message_digests.clone(),
            taken_at: self.taken_at,
        }
    }
}
