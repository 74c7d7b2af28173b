//! # Trade Protocol Engine
//!
//! Drives every trade a node participates in. Each trade lives behind its own
//! `tokio::sync::Mutex`, held for the whole handling of one message or event,
//! so steps of one trade are serialized while different trades progress in
//! parallel.
//!
//! ## Rules
//!
//! - A counterparty message is processed only if it comes from the trade's
//!   counterparty, verifies against the counterparty's key, and is the next
//!   step. Passed steps and seen message ids are dropped as duplicates;
//!   future steps are rejected.
//! - Funds move only in pipelines triggered by a verified message: the taker
//!   publishes the deposit after the maker's signed acceptance, the seller
//!   publishes the payout after the buyer's signed payout request.
//! - Every awaiting state carries a deadline. A timer armed with the trade's
//!   version escalates to a dispute when it fires on an unchanged trade.
//! - Each pipeline runs once per event. A transient failure leaves a
//!   checkpoint for [`TradeProtocol::resume_trade`], which the caller drives
//!   (directly or through [`TradeProtocol::resume_trade_with`]); a fatal
//!   wallet failure escalates.
//! - [`TradeProtocol::recover`] rebuilds the engine from storage after a
//!   restart and re-arms the deadlines of every trade still in flight.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use dex_agents::{AgentKind, DisputeAgent, DisputeAgentRegistry};
use dex_arbitration::{Dispute, DisputeReason, PartyRole, PayoutDecision};
use dex_core::{NodeAddress, OfferId, Timestamp, TradeId};
use dex_crypto::{Ed25519PublicKey, KeyRing, PubKeyRing};
use dex_offer::{Direction, Offer, OfferBook, OfferError, OfferOrigin, OfferPayload};
use dex_task::RetryPolicy;
use tokio::sync::{oneshot, Mutex};

use crate::config::ProtocolConfig;
use crate::error::{TradeError, WalletError};
use crate::message::{MessageBody, NetworkEnvelope, SignedTradeMessage, TradeMessage};
use crate::persistence::{PersistenceService, Record, RecordKey};
use crate::pipeline::{Pipelines, TradeModel};
use crate::services::{NetworkService, WalletService};
use crate::trade::{Checkpoint, MessageOrder, PipelineKind, Trade, TradeState};

/// What a node is built from.
pub struct ProtocolContext {
    pub address: NodeAddress,
    pub keys: Arc<KeyRing>,
    pub config: ProtocolConfig,
    pub registry: Arc<DisputeAgentRegistry>,
    pub offers: Arc<OfferBook>,
    pub wallet: Arc<dyn WalletService>,
    pub network: Arc<dyn NetworkService>,
    pub persistence: Arc<dyn PersistenceService>,
}

/// What [`TradeProtocol::recover`] restored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovery {
    pub offers: usize,
    pub agents: usize,
    pub accepted_agents: usize,
    /// Trades still in flight, now held in memory with their deadlines armed.
    pub trades: Vec<TradeId>,
    pub disputes: usize,
}

/// The maker's answer to a take request, as seen by the waiting taker.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TakeOutcome {
    Accepted,
    Rejected(String),
}

pub(crate) struct Inner {
    pub(crate) ctx: ProtocolContext,
    pub(crate) trades: DashMap<TradeId, Arc<Mutex<Trade>>>,
    pub(crate) disputes: DashMap<TradeId, Dispute>,
    take_waiters: DashMap<TradeId, oneshot::Sender<TakeOutcome>>,
    /// Take requests being decided. Held from before the first await until
    /// the trade exists or the request is refused.
    take_requests: DashSet<TradeId>,
    pipelines: Pipelines,
}

/// Per-node trade engine. Cheap to clone.
#[derive(Clone)]
pub struct TradeProtocol {
    pub(crate) inner: Arc<Inner>,
}

impl TradeProtocol {
    pub fn new(ctx: ProtocolContext) -> Self {
        let pipelines = Pipelines::new(&ctx.address, &ctx.keys, &ctx.wallet, &ctx.network);
        Self {
            inner: Arc::new(Inner {
                ctx,
                trades: DashMap::new(),
                disputes: DashMap::new(),
                take_waiters: DashMap::new(),
                take_requests: DashSet::new(),
                pipelines,
            }),
        }
    }

    pub fn address(&self) -> &NodeAddress {
        &self.inner.ctx.address
    }

    pub fn pub_key_ring(&self) -> PubKeyRing {
        self.inner.ctx.keys.pub_key_ring()
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.inner.ctx.config
    }

    pub fn registry(&self) -> &Arc<DisputeAgentRegistry> {
        &self.inner.ctx.registry
    }

    pub fn offers(&self) -> &Arc<OfferBook> {
        &self.inner.ctx.offers
    }

    pub(crate) fn keys(&self) -> &KeyRing {
        &self.inner.ctx.keys
    }

    pub(crate) fn network(&self) -> &Arc<dyn NetworkService> {
        &self.inner.ctx.network
    }

    pub(crate) fn persistence(&self) -> &Arc<dyn PersistenceService> {
        &self.inner.ctx.persistence
    }

    /// A copy of the trade's current record.
    pub async fn trade(&self, id: &TradeId) -> Result<Trade, TradeError> {
        let handle = self.trade_handle(id)?;
        let trade = handle.lock().await;
        Ok(trade.clone())
    }

    pub async fn trade_state(&self, id: &TradeId) -> Result<TradeState, TradeError> {
        let handle = self.trade_handle(id)?;
        let state = handle.lock().await.state();
        Ok(state)
    }

    pub fn trade_ids(&self) -> Vec<TradeId> {
        let mut ids: Vec<TradeId> = self.inner.trades.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// The trade's handle, reloading it from persistence if needed.
    pub(crate) fn trade_handle(&self, id: &TradeId) -> Result<Arc<Mutex<Trade>>, TradeError> {
        if let Some(handle) = self.inner.trades.get(id) {
            return Ok(Arc::clone(handle.value()));
        }
        match self.persistence().load(&RecordKey::Trade(*id))? {
            Some(Record::Trade(trade)) => {
                tracing::info!(trade_id = %id, "trade reloaded from storage");
                let handle = self
                    .inner
                    .trades
                    .entry(*id)
                    .or_insert_with(|| Arc::new(Mutex::new(*trade)));
                Ok(Arc::clone(handle.value()))
            }
            _ => Err(TradeError::NotFound { trade_id: *id }),
        }
    }

    fn handles(&self) -> Vec<Arc<Mutex<Trade>>> {
        self.inner
            .trades
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    pub(crate) fn persist(&self, trade: &Trade) {
        if let Err(e) = self.persistence().save(Record::Trade(Box::new(trade.clone()))) {
            tracing::error!(trade_id = %trade.id, error = %e, "failed to persist trade");
        }
    }

    pub(crate) fn persist_offer(&self, offer: &Offer) {
        if let Err(e) = self.persistence().save(Record::Offer(offer.clone())) {
            tracing::error!(offer_id = %offer.id(), error = %e, "failed to persist offer");
        }
    }

    pub(crate) fn persist_accepted_agents(&self) {
        let accepted = self.registry().snapshot().accepted_addresses();
        if let Err(e) = self.persistence().save(Record::AcceptedAgents(accepted)) {
            tracing::error!(error = %e, "failed to persist accepted agents");
        }
    }

    // ── Recovery ─────────────────────────────────────────────────────

    /// Rebuild in-memory state from storage.
    ///
    /// Restores the node's own offers, its registered and accepted agents,
    /// its disputes, and every trade that is not terminal. Each restored
    /// trade that awaits the counterparty gets a timer for what is left of
    /// its deadline, firing at once if the deadline already passed.
    ///
    /// Must run inside a Tokio runtime, before the node takes traffic.
    pub fn recover(&self) -> Result<Recovery, TradeError> {
        let mut recovery = Recovery::default();
        let mut agents: Vec<DisputeAgent> = Vec::new();
        let mut accepted: Vec<NodeAddress> = Vec::new();

        for record in self.persistence().load_all()? {
            match record {
                Record::Offer(offer) => {
                    if &offer.payload().maker_address == self.address() {
                        self.offers().put_own(offer);
                        recovery.offers += 1;
                    }
                }
                Record::Agent(agent) => agents.push(agent),
                Record::AcceptedAgents(addresses) => accepted = addresses,
                Record::Dispute(dispute) => {
                    self.inner.disputes.insert(dispute.trade_id, *dispute);
                    recovery.disputes += 1;
                }
                Record::Trade(trade) => {
                    if trade.state().is_terminal() {
                        continue;
                    }
                    let trade_id = trade.id;
                    let version = trade.version();
                    let deadline = trade.deadline.filter(|_| trade.state().is_awaiting());
                    self.inner
                        .trades
                        .insert(trade_id, Arc::new(Mutex::new(*trade)));
                    if let Some(deadline) = deadline {
                        let left = deadline.epoch_secs() - Timestamp::now().epoch_secs();
                        let after = Duration::from_secs(u64::try_from(left).unwrap_or(0));
                        self.schedule_deadline(trade_id, version, after);
                    }
                    recovery.trades.push(trade_id);
                }
            }
        }

        for agent in agents {
            let address = agent.address.clone();
            match self.registry().register(agent) {
                Ok(_) => recovery.agents += 1,
                Err(e) => tracing::warn!(agent = %address, error = %e, "stored agent not restored"),
            }
        }
        for address in accepted {
            match self.registry().accept(&address) {
                Ok(()) => recovery.accepted_agents += 1,
                Err(e) => tracing::warn!(agent = %address, error = %e, "stored acceptance not restored"),
            }
        }
        recovery.trades.sort();

        tracing::info!(
            address = %self.address(),
            offers = recovery.offers,
            agents = recovery.agents,
            trades = recovery.trades.len(),
            disputes = recovery.disputes,
            "node state recovered"
        );
        Ok(recovery)
    }

    // ── Taking an offer ──────────────────────────────────────────────

    /// Take a remote offer and wait for the maker's answer.
    ///
    /// Returns the trade id once the maker accepted (the deposit pipeline has
    /// run by then) or once the answer timed out, in which case the trade is
    /// in `DISPUTE_OPENED`.
    ///
    /// # Errors
    ///
    /// - `TakeRejected` if the maker declined; the trade is `CANCELLED`.
    /// - Offer errors if the offer is unknown, own, out of range, or its
    ///   arbitrator is not accepted locally.
    pub async fn take_offer(&self, offer_id: OfferId, amount: u64) -> Result<TradeId, TradeError> {
        let offer = self
            .offers()
            .get(&offer_id)
            .ok_or(OfferError::NotFound { offer_id })?;
        if self.offers().origin(&offer_id) == Some(OfferOrigin::Own) {
            return Err(TradeError::Validation("cannot take own offer".into()));
        }
        let payload = offer.payload().clone();
        let arbitrator_key = self.verified_arbitrator_key(&payload)?;
        if payload.terms.direction == Direction::Buy {
            self.require_funds(amount).await?;
        }
        let payload = self.offers().take(&offer_id, amount)?;

        let trade_id = TradeId::new();
        let trade = Trade::new(
            trade_id,
            payload.clone(),
            PartyRole::Taker,
            amount,
            self.address().clone(),
            self.pub_key_ring(),
            arbitrator_key,
        );
        let (tx, rx) = oneshot::channel();
        self.inner.take_waiters.insert(trade_id, tx);
        let handle = Arc::new(Mutex::new(trade));
        self.inner.trades.insert(trade_id, Arc::clone(&handle));

        let armed = {
            let mut trade = handle.lock().await;
            let armed = self.arm_deadline(&mut trade, self.config().take_offer_timeout);
            let body = MessageBody::TakeOfferRequest {
                offer: payload,
                amount,
                taker_pub_key_ring: self.pub_key_ring(),
            };
            let sent = self.send(&mut trade, body).await;
            if let Err(e) = sent {
                self.inner.take_waiters.remove(&trade_id);
                trade.checkpoint = None;
                trade.error_message = Some(e.to_string());
                trade.transition(TradeState::Cancelled, "take request not delivered")?;
                self.persist(&trade);
                self.restore_remote_offer(offer.payload().clone());
                return Err(e);
            }
            self.persist(&trade);
            armed
        };

        match tokio::time::timeout(self.config().take_offer_timeout, rx).await {
            Ok(Ok(TakeOutcome::Accepted)) => Ok(trade_id),
            Ok(Ok(TakeOutcome::Rejected(reason))) => {
                // The maker's book decides; its copy is not takeable from here.
                self.offers().remove(&offer_id);
                Err(TradeError::TakeRejected { offer_id, reason })
            }
            Ok(Err(_)) | Err(_) => {
                self.inner.take_waiters.remove(&trade_id);
                tracing::warn!(trade_id = %trade_id, "no answer to take request");
                self.on_deadline(trade_id, armed).await?;
                Ok(trade_id)
            }
        }
    }

    /// Key of the offer's arbitrator, which must be accepted locally and must
    /// have co-signed the payload.
    fn verified_arbitrator_key(&self, payload: &OfferPayload) -> Result<Ed25519PublicKey, TradeError> {
        let arbitrator = self
            .registry()
            .accepted_agent(&payload.arbitrator_signer, AgentKind::Arbitrator)
            .ok_or_else(|| OfferError::UnknownArbitrator {
                address: payload.arbitrator_signer.clone(),
            })?;
        if !payload.has_valid_arbitrator_signature(arbitrator.signing_key()) {
            return Err(OfferError::InvalidOfferSignature {
                offer_id: payload.id,
                arbitrator: payload.arbitrator_signer.clone(),
            }
            .into());
        }
        Ok(*arbitrator.signing_key())
    }

    async fn require_funds(&self, amount: u64) -> Result<(), TradeError> {
        let balance = self.inner.ctx.wallet.balance().await?;
        if balance.available < amount {
            return Err(WalletError::InsufficientFunds {
                required: amount,
                available: balance.available,
            }
            .into());
        }
        Ok(())
    }

    /// Put a remote offer whose take never reached the maker back on offer.
    fn restore_remote_offer(&self, payload: OfferPayload) {
        let offer_id = payload.id;
        self.offers().remove(&offer_id);
        if let Err(e) = self.offers().admit_remote(payload, self.registry()) {
            tracing::warn!(offer_id = %offer_id, error = %e, "remote offer not restored");
        }
    }

    fn resolve_take(&self, trade_id: &TradeId, outcome: TakeOutcome) {
        if let Some((_, waiter)) = self.inner.take_waiters.remove(trade_id) {
            let _ = waiter.send(outcome);
        }
    }

    /// Maker side of a take request.
    async fn handle_take_request(&self, signed: SignedTradeMessage) -> Result<(), TradeError> {
        let MessageBody::TakeOfferRequest {
            offer,
            amount,
            taker_pub_key_ring,
        } = &signed.message.body
        else {
            return Err(TradeError::Validation("not a take request".into()));
        };
        let trade_id = signed.message.trade_id;
        let taker = signed.message.sender.clone();
        if !signed.verify(&taker_pub_key_ring.signing_key) {
            tracing::warn!(trade_id = %trade_id, taker = %taker, "take request with invalid signature");
            return Err(TradeError::InvalidSignature {
                trade_id,
                sender: taker,
                message: signed.kind().to_string(),
            });
        }
        // Reserve before checking for the trade: the holder of a reservation
        // inserts the trade before releasing it.
        if !self.inner.take_requests.insert(trade_id) {
            tracing::debug!(trade_id = %trade_id, "take request already being decided");
            return Ok(());
        }
        if self.trade_handle(&trade_id).is_ok() {
            self.inner.take_requests.remove(&trade_id);
            tracing::debug!(trade_id = %trade_id, "duplicate take request");
            return Ok(());
        }

        let accepted = self.accept_take(&signed, offer, *amount, *taker_pub_key_ring).await;
        self.inner.take_requests.remove(&trade_id);
        if let Err(e) = &accepted {
            tracing::warn!(trade_id = %trade_id, offer_id = %offer.id, error = %e, "take request rejected");
            let reply = MessageBody::TakeOfferRejected {
                reason: e.to_string(),
            };
            match TradeMessage::new(trade_id, self.address().clone(), reply).sign(self.keys()) {
                Ok(reply) => {
                    if let Err(send_err) = self
                        .network()
                        .send_direct(&taker, NetworkEnvelope::Trade(reply))
                        .await
                    {
                        tracing::warn!(trade_id = %trade_id, error = %send_err, "could not deliver rejection");
                    }
                }
                Err(sign_err) => {
                    tracing::error!(trade_id = %trade_id, error = %sign_err, "could not sign rejection");
                }
            }
        }
        accepted
    }

    async fn accept_take(
        &self,
        request: &SignedTradeMessage,
        offer: &OfferPayload,
        amount: u64,
        taker_key: PubKeyRing,
    ) -> Result<(), TradeError> {
        let own = self.offers().get(&offer.id).filter(|o| {
            self.offers().origin(&offer.id) == Some(OfferOrigin::Own) && o.payload() == offer
        });
        if own.is_none() || &offer.maker_address != self.address() {
            return Err(TradeError::Validation(format!("{} is not an offer of this node", offer.id)));
        }
        let arbitrator_key = self.verified_arbitrator_key(offer)?;
        if offer.terms.direction == Direction::Sell {
            self.require_funds(amount).await?;
        }
        let payload = self.offers().take(&offer.id, amount)?;
        if let Some(taken) = self.offers().get(&offer.id) {
            self.persist_offer(&taken);
        }

        let trade_id = request.message.trade_id;
        let trade = Trade::new(
            trade_id,
            payload,
            PartyRole::Maker,
            amount,
            request.message.sender.clone(),
            taker_key,
            arbitrator_key,
        );
        let handle = match self.inner.trades.entry(trade_id) {
            Entry::Occupied(_) => return Ok(()),
            Entry::Vacant(slot) => Arc::clone(slot.insert(Arc::new(Mutex::new(trade))).value()),
        };

        let mut trade = handle.lock().await;
        trade.record_message(request)?;
        self.arm_deadline(&mut trade, self.config().deposit_timeout);
        let sent = self.send(&mut trade, MessageBody::TakeOfferAccepted).await;
        self.persist(&trade);
        if let Err(e) = sent {
            // The taker's own deadline covers a lost acceptance.
            tracing::warn!(trade_id = %trade_id, error = %e, "acceptance not delivered");
        }
        Ok(())
    }

    // ── Incoming messages ────────────────────────────────────────────

    /// Entry point for every signed trade message from the transport.
    pub async fn handle_trade_message(
        &self,
        from: NodeAddress,
        signed: SignedTradeMessage,
    ) -> Result<(), TradeError> {
        let trade_id = signed.message.trade_id;
        if signed.message.sender != from {
            tracing::warn!(trade_id = %trade_id, from = %from, claimed = %signed.message.sender, "sender mismatch");
            return Err(TradeError::UnexpectedSender {
                trade_id,
                expected: signed.message.sender.clone(),
                actual: from,
            });
        }
        if matches!(signed.message.body, MessageBody::TakeOfferRequest { .. }) {
            return self.handle_take_request(signed).await;
        }

        let handle = self.trade_handle(&trade_id)?;
        let mut trade = handle.lock().await;
        let before = trade.state();
        let result = self.process(&mut trade, signed).await;
        self.settle(&mut trade, before);
        result
    }

    /// Verify and apply one counterparty message to a locked trade.
    pub(crate) async fn process(
        &self,
        trade: &mut Trade,
        signed: SignedTradeMessage,
    ) -> Result<(), TradeError> {
        let kind = signed.kind();
        if &signed.message.sender != trade.counterparty() {
            tracing::warn!(trade_id = %trade.id, sender = %signed.message.sender, message = kind, "message from outside the trade");
            return Err(TradeError::UnexpectedSender {
                trade_id: trade.id,
                expected: trade.counterparty().clone(),
                actual: signed.message.sender.clone(),
            });
        }
        if !signed.verify(trade.counterparty_key()) {
            tracing::warn!(trade_id = %trade.id, message = kind, "counterparty signature failed verification");
            let err = TradeError::InvalidSignature {
                trade_id: trade.id,
                sender: signed.message.sender.clone(),
                message: kind.to_string(),
            };
            trade.error_message = Some(err.to_string());
            if trade.state().is_awaiting() {
                self.open_dispute_locked(trade, DisputeReason::VerificationFailure)
                    .await?;
            }
            return Err(err);
        }
        match trade.order_of(&signed) {
            MessageOrder::Duplicate => {
                tracing::debug!(trade_id = %trade.id, message = kind, "duplicate message ignored");
                return Ok(());
            }
            MessageOrder::Future => return Err(self.out_of_order(trade, kind)),
            MessageOrder::Next => {}
        }

        match (&signed.message.body, trade.state()) {
            (MessageBody::DisputeOpened { .. }, _) => self.mirror_dispute(trade, &signed),

            (MessageBody::TakeOfferAccepted, TradeState::Initiated)
                if trade.role == PartyRole::Taker =>
            {
                trade.record_message(&signed)?;
                self.arm_deadline(trade, self.config().deposit_timeout);
                let result = self
                    .execute(trade, PipelineKind::PublishDeposit, None, 0)
                    .await;
                self.resolve_take(&trade.id, TakeOutcome::Accepted);
                result
            }

            (MessageBody::TakeOfferRejected { reason }, TradeState::Initiated)
                if trade.role == PartyRole::Taker =>
            {
                trade.record_message(&signed)?;
                trade.error_message = Some(reason.clone());
                trade.transition(TradeState::Cancelled, "rejected by maker")?;
                self.resolve_take(&trade.id, TakeOutcome::Rejected(reason.clone()));
                Ok(())
            }

            (MessageBody::DepositPublished { tx_id }, TradeState::Initiated)
                if trade.role == PartyRole::Maker =>
            {
                trade.record_message(&signed)?;
                trade.deposit_tx_id = Some(tx_id.clone());
                trade.transition(TradeState::DepositPublished, "deposit announced by taker")
            }

            (MessageBody::PayoutRequest, TradeState::DepositPublished) if trade.is_seller() => {
                tracing::info!(trade_id = %trade.id, "payout requested before local confirmation, deferring");
                trade.hold_message(signed);
                Ok(())
            }

            (MessageBody::PayoutRequest, TradeState::DepositConfirmed) if trade.is_seller() => {
                trade.record_message(&signed)?;
                let release = trade.release_decision();
                self.execute(trade, PipelineKind::PublishPayout, Some(release), 0)
                    .await
            }

            (MessageBody::PayoutPublished { tx_id }, TradeState::DepositConfirmed)
                if trade.is_buyer() =>
            {
                trade.record_message(&signed)?;
                trade.payout_tx_id = Some(tx_id.clone());
                trade.transition(TradeState::PayoutPublished, "payout announced by seller")?;
                trade.transition(TradeState::Completed, "payout received")?;
                self.send(trade, MessageBody::PayoutAcknowledged).await
            }

            (MessageBody::PayoutAcknowledged, TradeState::PayoutPublished) if trade.is_seller() => {
                trade.record_message(&signed)?;
                trade.transition(TradeState::Completed, "payout acknowledged by buyer")
            }

            _ => Err(self.out_of_order(trade, kind)),
        }
    }

    fn out_of_order(&self, trade: &Trade, kind: &str) -> TradeError {
        tracing::warn!(trade_id = %trade.id, state = %trade.state(), message = kind, "out-of-order message rejected");
        TradeError::OutOfOrder {
            trade_id: trade.id,
            state: trade.state().as_str().to_string(),
            message: kind.to_string(),
        }
    }

    // ── Sending and pipelines ────────────────────────────────────────

    /// Sign `body`, record it as evidence, and deliver it.
    pub(crate) async fn send(&self, trade: &mut Trade, body: MessageBody) -> Result<(), TradeError> {
        let signed = TradeMessage::new(trade.id, self.address().clone(), body).sign(self.keys())?;
        trade.record_message(&signed)?;
        trade.outbox = Some(signed);
        self.execute(trade, PipelineKind::Deliver, None, 0).await
    }

    /// Run a pipeline once from task `start`.
    ///
    /// A transient failure leaves a checkpoint and the error on the trade; a
    /// later [`TradeProtocol::resume_trade`] continues at the failed task. A
    /// fatal wallet failure on an awaiting trade opens a dispute.
    pub(crate) async fn execute(
        &self,
        trade: &mut Trade,
        kind: PipelineKind,
        decision: Option<PayoutDecision>,
        start: usize,
    ) -> Result<(), TradeError> {
        let runner = self.inner.pipelines.get(kind);
        let mut model = TradeModel {
            trade: trade.clone(),
            decision,
        };
        let result = runner.run_from(&mut model, start).await;
        *trade = model.trade;

        match result {
            Ok(_) => {
                trade.checkpoint = None;
                trade.error_message = None;
                Ok(())
            }
            Err(failure) if failure.error.is_transient() => {
                tracing::warn!(
                    trade_id = %trade.id,
                    pipeline = %failure.pipeline,
                    task = %failure.task,
                    error = %failure.error,
                    "transient failure, checkpoint saved"
                );
                trade.error_message = Some(failure.error.to_string());
                trade.checkpoint = Some(Checkpoint {
                    pipeline: kind,
                    step: failure.index,
                    decision,
                });
                Err(failure.into_error())
            }
            Err(failure) => {
                trade.checkpoint = None;
                let error = failure.into_error();
                if error.is_wallet_failure() && trade.state().is_awaiting() {
                    tracing::error!(trade_id = %trade.id, error = %error, "wallet failure, escalating");
                    self.open_dispute_locked(trade, DisputeReason::WalletFailure)
                        .await?;
                }
                Err(error)
            }
        }
    }

    // ── Deadlines ────────────────────────────────────────────────────

    /// Set a deadline `after` from now and arm a timer for it.
    pub(crate) fn arm_deadline(&self, trade: &mut Trade, after: Duration) -> u64 {
        let version = trade.arm_deadline(Timestamp::now().saturating_add(after));
        self.schedule_deadline(trade.id, version, after);
        version
    }

    /// Fire [`TradeProtocol::on_deadline`] for `version` after `after`.
    fn schedule_deadline(&self, trade_id: TradeId, version: u64, after: Duration) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let protocol = TradeProtocol { inner };
            if let Err(e) = protocol.on_deadline(trade_id, version).await {
                tracing::warn!(trade_id = %trade_id, error = %e, "deadline escalation failed");
            }
        });
    }

    /// Arm the deadline of a newly entered awaiting state and persist.
    pub(crate) fn settle(&self, trade: &mut Trade, before: TradeState) {
        let state = trade.state();
        if state != before && state.is_awaiting() {
            if let Some(after) = self.config().timeout_for(state) {
                self.arm_deadline(trade, after);
            }
        }
        self.persist(trade);
    }

    /// Timer callback. Escalates only if the trade is still awaiting at the
    /// version the timer was armed with; any other call is a no-op.
    pub async fn on_deadline(
        &self,
        trade_id: TradeId,
        armed_version: u64,
    ) -> Result<Option<Dispute>, TradeError> {
        let handle = self.trade_handle(&trade_id)?;
        let mut trade = handle.lock().await;
        if trade.version() != armed_version || !trade.state().is_awaiting() {
            tracing::debug!(trade_id = %trade_id, armed_version, "stale deadline ignored");
            return Ok(None);
        }
        tracing::warn!(trade_id = %trade_id, state = %trade.state(), "deadline expired");
        let dispute = self
            .open_dispute_locked(&mut trade, DisputeReason::Timeout)
            .await?;
        Ok(Some(dispute))
    }

    /// Escalate every trade whose deadline is at or before `now`.
    pub async fn check_deadlines(&self, now: Timestamp) -> Vec<TradeId> {
        let mut escalated = Vec::new();
        for handle in self.handles() {
            let mut trade = handle.lock().await;
            if !trade.is_overdue(now) {
                continue;
            }
            tracing::warn!(trade_id = %trade.id, state = %trade.state(), "deadline passed");
            match self
                .open_dispute_locked(&mut trade, DisputeReason::Timeout)
                .await
            {
                Ok(_) => escalated.push(trade.id),
                Err(e) => tracing::error!(trade_id = %trade.id, error = %e, "escalation failed"),
            }
        }
        escalated
    }

    // ── Confirmations and resumption ─────────────────────────────────

    /// Advance trades whose deposit reached the confirmation depth.
    ///
    /// The buyer then requests the payout; a seller holding an early payout
    /// request processes it.
    pub async fn poll_confirmations(&self) -> Vec<TradeId> {
        let mut confirmed = Vec::new();
        for handle in self.handles() {
            let mut trade = handle.lock().await;
            if trade.state() != TradeState::DepositPublished {
                continue;
            }
            let Some(tx_id) = trade.deposit_tx_id.clone() else {
                continue;
            };
            match self.inner.ctx.wallet.confirmations(&tx_id).await {
                Ok(n) if n >= self.config().min_confirmations => {}
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(trade_id = %trade.id, error = %e, "confirmation check failed");
                    continue;
                }
            }
            let before = trade.state();
            if let Err(e) = trade.transition(TradeState::DepositConfirmed, "deposit confirmed") {
                tracing::error!(trade_id = %trade.id, error = %e, "confirmation transition failed");
                continue;
            }
            confirmed.push(trade.id);

            let follow_up = if trade.is_buyer() {
                self.send(&mut trade, MessageBody::PayoutRequest).await
            } else if let Some(request) = trade.take_deferred() {
                self.process(&mut trade, request).await
            } else {
                Ok(())
            };
            if let Err(e) = follow_up {
                tracing::warn!(trade_id = %trade.id, error = %e, "post-confirmation step failed");
            }
            self.settle(&mut trade, before);
        }
        confirmed
    }

    /// Continue a trade after a transient failure or a restart.
    ///
    /// Resumes a checkpointed pipeline at its failed task, then processes a
    /// deferred payout request whose precondition now holds.
    pub async fn resume_trade(&self, trade_id: TradeId) -> Result<TradeState, TradeError> {
        let handle = self.trade_handle(&trade_id)?;
        let mut trade = handle.lock().await;
        let before = trade.state();

        let mut result = Ok(());
        if let Some(checkpoint) = trade.checkpoint {
            tracing::info!(
                trade_id = %trade_id,
                pipeline = checkpoint.pipeline.as_str(),
                step = checkpoint.step,
                "resuming pipeline"
            );
            result = self
                .execute(
                    &mut trade,
                    checkpoint.pipeline,
                    checkpoint.decision,
                    checkpoint.step,
                )
                .await;
        } else if trade.state() == TradeState::DepositConfirmed && trade.deferred.is_some() {
            if let Some(request) = trade.take_deferred() {
                result = self.process(&mut trade, request).await;
            }
        }
        self.settle(&mut trade, before);
        result.map(|()| trade.state())
    }

    /// [`TradeProtocol::resume_trade`] under a caller-chosen backoff.
    ///
    /// Each attempt takes and releases the trade's lock, so messages for the
    /// trade are handled between attempts. Only transient errors are retried.
    pub async fn resume_trade_with(
        &self,
        trade_id: TradeId,
        policy: &RetryPolicy,
    ) -> Result<TradeState, TradeError> {
        let attempts = policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.resume_trade(trade_id).await {
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    let delay = policy.delay_for(attempt);
                    attempt += 1;
                    tracing::warn!(
                        trade_id = %trade_id,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "resume failed, retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                }
                outcome => return outcome,
            }
        }
    }
}

impl std::fmt::Debug for TradeProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeProtocol")
            .field("address", self.address())
            .field("trades", &self.inner.trades.len())
            .field("disputes", &self.inner.disputes.len())
            .field("pipelines", &self.inner.pipelines)
            .finish()
    }
}
