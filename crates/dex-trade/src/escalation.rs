//! # Dispute Escalation
//!
//! Moves a trade into a dispute and applies the assigned agent's decision.
//!
//! The agent is found along a fixed chain: the arbitrator bound to the trade
//! by the offer, then a mediator, then a refund agent, the latter two picked
//! with [`DisputeAgentRegistry::select_one`] so both parties compute the same
//! candidate. The first agent that acknowledges the signed `DISPUTE_OPENED`
//! notice is assigned. If none does, the dispute is still opened, assigned to
//! the bound arbitrator, and flagged `notification_pending`.
//!
//! Both parties derive the dispute id from the trade id. A party that already
//! holds a dispute for the trade keeps its assignment when the counterparty's
//! notice arrives.
//!
//! [`DisputeAgentRegistry::select_one`]: dex_agents::DisputeAgentRegistry::select_one

use dex_agents::AgentKind;
use dex_arbitration::{
    AssignedAgent, Dispute, DisputeReason, EvidenceItem, EvidenceSnapshot, ResolutionOutcome,
    SignedResolution,
};
use dex_core::{ContentDigest, DisputeId, NodeAddress, Timestamp, TradeId};

use crate::error::TradeError;
use crate::message::{MessageBody, NetworkEnvelope, SignedTradeMessage, TradeMessage};
use crate::persistence::{Record, RecordKey};
use crate::protocol::TradeProtocol;
use crate::trade::{PipelineKind, Trade, TradeState};

impl TradeProtocol {
    /// Open a dispute on a trade at the user's request or for `reason`.
    ///
    /// Idempotent: a trade already in dispute returns its existing dispute.
    pub async fn open_dispute(
        &self,
        trade_id: TradeId,
        reason: DisputeReason,
    ) -> Result<Dispute, TradeError> {
        let handle = self.trade_handle(&trade_id)?;
        let mut trade = handle.lock().await;
        let dispute = self.open_dispute_locked(&mut trade, reason).await?;
        self.persist(&trade);
        Ok(dispute)
    }

    pub(crate) async fn open_dispute_locked(
        &self,
        trade: &mut Trade,
        reason: DisputeReason,
    ) -> Result<Dispute, TradeError> {
        if matches!(
            trade.state(),
            TradeState::DisputeOpened | TradeState::DisputeResolved
        ) {
            return self.dispute_for(trade);
        }
        if !trade.state().is_awaiting() {
            return Err(TradeError::InvalidTransition {
                trade_id: trade.id,
                from: trade.state().as_str().to_string(),
                to: TradeState::DisputeOpened.as_str().to_string(),
            });
        }

        let dispute_id = DisputeId::for_trade(&trade.id);
        let evidence = trade.evidence_snapshot();
        let bound = AssignedAgent {
            address: trade.arbitrator.clone(),
            kind: AgentKind::Arbitrator,
            signing_key: trade.arbitrator_key,
        };

        let mut assigned = None;
        for agent in self.escalation_chain(trade, &bound) {
            let notice = self.dispute_notice(trade, dispute_id, reason, &agent, &evidence)?;
            match self
                .network()
                .send_direct(&agent.address, NetworkEnvelope::Trade(notice.clone()))
                .await
            {
                Ok(()) => {
                    assigned = Some((agent, notice));
                    break;
                }
                Err(e) => tracing::warn!(
                    trade_id = %trade.id,
                    agent = %agent.address,
                    kind = %agent.kind,
                    error = %e,
                    "dispute agent unreachable, escalating"
                ),
            }
        }
        let notified = assigned.is_some();
        let (agent, notice) = match assigned {
            Some(found) => found,
            None => {
                tracing::error!(trade_id = %trade.id, "no dispute agent reachable, notification pending");
                let notice = self.dispute_notice(trade, dispute_id, reason, &bound, &evidence)?;
                (bound, notice)
            }
        };

        let mut dispute = Dispute::open(reason, trade.role, agent, evidence);
        dispute.notification_pending = !notified;
        trade.record_message(&notice)?;
        trade.transition(TradeState::DisputeOpened, reason.as_str())?;
        trade.dispute_id = Some(dispute.id);
        trade.outbox = None;
        trade.checkpoint = None;
        self.store_dispute(&dispute);
        self.persist(trade);

        let peer = trade.counterparty().clone();
        if let Err(e) = self
            .network()
            .send_direct(&peer, NetworkEnvelope::Trade(notice))
            .await
        {
            // The counterparty's own deadline opens the same dispute.
            tracing::warn!(trade_id = %trade.id, error = %e, "counterparty not notified of dispute");
        }
        Ok(dispute)
    }

    fn escalation_chain(&self, trade: &Trade, bound: &AssignedAgent) -> Vec<AssignedAgent> {
        let language = &self.config().dispute_language;
        let mut chain = vec![bound.clone()];
        for kind in [AgentKind::Mediator, AgentKind::RefundAgent] {
            if let Some(agent) = self.registry().select_one(language, kind, &trade.id) {
                chain.push(AssignedAgent::from(&agent));
            }
        }
        chain
    }

    fn dispute_notice(
        &self,
        trade: &Trade,
        dispute_id: DisputeId,
        reason: DisputeReason,
        agent: &AssignedAgent,
        evidence: &EvidenceSnapshot,
    ) -> Result<SignedTradeMessage, TradeError> {
        let body = MessageBody::DisputeOpened {
            dispute_id,
            reason,
            agent: agent.address.clone(),
            agent_kind: agent.kind,
            evidence: evidence.clone(),
        };
        TradeMessage::new(trade.id, self.address().clone(), body).sign(self.keys())
    }

    /// Apply the counterparty's verified `DISPUTE_OPENED` notice.
    pub(crate) fn mirror_dispute(
        &self,
        trade: &mut Trade,
        notice: &SignedTradeMessage,
    ) -> Result<(), TradeError> {
        let MessageBody::DisputeOpened {
            dispute_id,
            reason,
            agent,
            agent_kind,
            ..
        } = &notice.message.body
        else {
            return Err(TradeError::Validation("not a dispute notice".into()));
        };

        match trade.state() {
            TradeState::DisputeOpened | TradeState::DisputeResolved => {
                trade.record_message(notice)?;
                tracing::info!(trade_id = %trade.id, "dispute already open, keeping local assignment");
                return Ok(());
            }
            state if !state.is_awaiting() => {
                return Err(TradeError::OutOfOrder {
                    trade_id: trade.id,
                    state: state.as_str().to_string(),
                    message: notice.kind().to_string(),
                });
            }
            _ => {}
        }
        if *dispute_id != DisputeId::for_trade(&trade.id) {
            return Err(TradeError::Validation(format!(
                "dispute id {dispute_id} does not belong to {}",
                trade.id
            )));
        }
        let assigned = self.trusted_agent(trade, agent, *agent_kind).ok_or_else(|| {
            tracing::warn!(trade_id = %trade.id, agent = %agent, "dispute names an agent not trusted locally");
            TradeError::UnknownAgent {
                address: agent.clone(),
            }
        })?;

        trade.record_message(notice)?;
        let dispute = Dispute::open(*reason, trade.role.counterparty(), assigned, trade.evidence_snapshot());
        trade.transition(TradeState::DisputeOpened, "opened by counterparty")?;
        trade.dispute_id = Some(dispute.id);
        trade.outbox = None;
        trade.checkpoint = None;
        self.store_dispute(&dispute);
        Ok(())
    }

    /// The bound arbitrator, or an agent in the local accepted set.
    fn trusted_agent(
        &self,
        trade: &Trade,
        address: &NodeAddress,
        kind: AgentKind,
    ) -> Option<AssignedAgent> {
        if kind == AgentKind::Arbitrator && address == &trade.arbitrator {
            return Some(AssignedAgent {
                address: address.clone(),
                kind,
                signing_key: trade.arbitrator_key,
            });
        }
        self.registry()
            .accepted_agent(address, kind)
            .map(|agent| AssignedAgent::from(&agent))
    }

    // ── Resolution ───────────────────────────────────────────────────

    /// Apply the assigned agent's signed decision to the trade's dispute.
    ///
    /// The first application moves the trade to `DISPUTE_RESOLVED`. If this
    /// node receives the larger share, it builds and broadcasts the payout;
    /// a recorded payout transaction is never broadcast again.
    ///
    /// # Errors
    ///
    /// Any error from [`Dispute::apply_resolution`] leaves trade and dispute
    /// unchanged.
    pub async fn apply_resolution(
        &self,
        signed: SignedResolution,
    ) -> Result<ResolutionOutcome, TradeError> {
        let trade_id = signed.resolution.trade_id;
        let handle = self.trade_handle(&trade_id)?;
        let mut trade = handle.lock().await;
        let mut dispute = self.dispute_for(&trade)?;
        let decision = signed.decision();

        let outcome = dispute.apply_resolution(signed)?;
        if outcome == ResolutionOutcome::Applied {
            trade.transition(TradeState::DisputeResolved, decision.as_str())?;
            self.store_dispute(&dispute);
        }

        let pays_out = decision.broadcaster() == trade.role
            && trade.state() == TradeState::DisputeResolved
            && trade.deposit_tx_id.is_some()
            && trade.payout_tx_id.is_none()
            && trade.checkpoint.is_none();
        if pays_out {
            tracing::info!(trade_id = %trade_id, decision = %decision, "broadcasting dispute payout");
            if let Err(e) = self
                .execute(&mut trade, PipelineKind::DisputePayout, Some(decision), 0)
                .await
            {
                tracing::error!(trade_id = %trade_id, error = %e, "dispute payout failed");
            }
        }
        self.persist(&trade);
        Ok(outcome)
    }

    /// The dispute opened on this trade, if any.
    pub fn dispute(&self, trade_id: &TradeId) -> Option<Dispute> {
        self.inner
            .disputes
            .get(trade_id)
            .map(|d| d.value().clone())
    }

    /// Attach a party's evidence to the trade's open dispute.
    pub async fn add_evidence(
        &self,
        trade_id: TradeId,
        description: impl Into<String>,
        content_digest: ContentDigest,
    ) -> Result<(), TradeError> {
        let handle = self.trade_handle(&trade_id)?;
        let trade = handle.lock().await;
        let mut dispute = self.dispute_for(&trade)?;
        dispute.add_evidence(EvidenceItem {
            submitted_by: trade.role,
            description: description.into(),
            content_digest,
            submitted_at: Timestamp::now(),
        })?;
        self.store_dispute(&dispute);
        Ok(())
    }

    fn dispute_for(&self, trade: &Trade) -> Result<Dispute, TradeError> {
        if let Some(dispute) = self.dispute(&trade.id) {
            return Ok(dispute);
        }
        let no_dispute = || TradeError::NoDispute { trade_id: trade.id };
        let id = trade.dispute_id.ok_or_else(no_dispute)?;
        match self.persistence().load(&RecordKey::Dispute(id))? {
            Some(Record::Dispute(dispute)) => {
                self.inner.disputes.insert(trade.id, (*dispute).clone());
                Ok(*dispute)
            }
            _ => Err(no_dispute()),
        }
    }

    fn store_dispute(&self, dispute: &Dispute) {
        self.inner.disputes.insert(dispute.trade_id, dispute.clone());
        if let Err(e) = self
            .persistence()
            .save(Record::Dispute(Box::new(dispute.clone())))
        {
            tracing::error!(dispute_id = %dispute.id, error = %e, "failed to persist dispute");
        }
    }
}
