//! # Exchange Node
//!
//! The outward face of one participant: places and co-signs offers, takes
//! remote offers, reports trade state, opens disputes, and applies dispute
//! decisions. It is also the node's [`MessageHandler`], dispatching every
//! inbound envelope to the offer book or the trade engine.
//!
//! A node built over existing storage calls [`ExchangeNode::recover`] before
//! it takes traffic. Every operation runs its pipeline once; the
//! `*_with` variants retry transient failures under a caller's
//! [`RetryPolicy`].

use std::sync::Arc;

use async_trait::async_trait;
use dex_agents::{
    AgentError, AgentKind, DisputeAgent, DisputeAgentRegistry, RegistrationOutcome,
};
use dex_arbitration::{Dispute, DisputeReason, ResolutionOutcome, SignedResolution};
use dex_core::{LanguageCode, NodeAddress, OfferId, Timestamp, TradeId};
use dex_crypto::{payload_digest, KeyRing, PubKeyRing};
use dex_offer::{
    ArbitratorClient, Offer, OfferBook, OfferError, OfferOrigin, OfferPayload,
    OfferSigningProtocol, OfferTerms,
};
use dex_task::{RetryPolicy, RunReport, TaskFailure};
use serde::Serialize;

use crate::config::ProtocolConfig;
use crate::error::TradeError;
use crate::message::NetworkEnvelope;
use crate::persistence::{PersistenceService, Record};
use crate::protocol::{ProtocolContext, Recovery, TradeProtocol};
use crate::services::{MessageHandler, NetworkService, WalletService};
use crate::trade::{Trade, TradeState};

/// External collaborators of a node.
pub struct NodeServices {
    pub wallet: Arc<dyn WalletService>,
    pub network: Arc<dyn NetworkService>,
    pub persistence: Arc<dyn PersistenceService>,
    pub arbitrators: Arc<dyn ArbitratorClient>,
}

/// One exchange participant. Cheap to clone.
#[derive(Clone)]
pub struct ExchangeNode {
    protocol: TradeProtocol,
    signing: Arc<OfferSigningProtocol>,
}

impl ExchangeNode {
    pub fn new(
        address: NodeAddress,
        keys: KeyRing,
        config: ProtocolConfig,
        registry: Arc<DisputeAgentRegistry>,
        services: NodeServices,
    ) -> Self {
        let signing = Arc::new(OfferSigningProtocol::new(
            Arc::clone(&registry),
            services.arbitrators,
        ));
        let protocol = TradeProtocol::new(ProtocolContext {
            address,
            keys: Arc::new(keys),
            config,
            registry,
            offers: Arc::new(OfferBook::new()),
            wallet: services.wallet,
            network: services.network,
            persistence: services.persistence,
        });
        Self { protocol, signing }
    }

    pub fn protocol(&self) -> &TradeProtocol {
        &self.protocol
    }

    pub fn address(&self) -> &NodeAddress {
        self.protocol.address()
    }

    pub fn pub_key_ring(&self) -> PubKeyRing {
        self.protocol.pub_key_ring()
    }

    pub fn registry(&self) -> &Arc<DisputeAgentRegistry> {
        self.protocol.registry()
    }

    pub fn offers(&self) -> &Arc<OfferBook> {
        self.protocol.offers()
    }

    /// Restore offers, agents, trades, and disputes from storage and re-arm
    /// pending deadlines. See [`TradeProtocol::recover`].
    pub fn recover(&self) -> Result<Recovery, TradeError> {
        self.protocol.recover()
    }

    // ── Agents ───────────────────────────────────────────────────────

    /// Register a signed agent record. Registration does not accept it.
    pub fn register_agent(&self, agent: DisputeAgent) -> Result<RegistrationOutcome, AgentError> {
        let outcome = self.registry().register(agent.clone())?;
        if let Err(e) = self.protocol.persistence().save(Record::Agent(agent)) {
            tracing::error!(error = %e, "failed to persist agent");
        }
        Ok(outcome)
    }

    pub fn accept_agent(&self, address: &NodeAddress) -> Result<(), AgentError> {
        self.registry().accept(address)?;
        self.protocol.persist_accepted_agents();
        Ok(())
    }

    /// Withdraw trust from an agent. Returns whether it was accepted.
    pub fn revoke_agent(&self, address: &NodeAddress) -> bool {
        let revoked = self.registry().revoke(address);
        if revoked {
            self.protocol.persist_accepted_agents();
        }
        revoked
    }

    /// Accepted agents of `kind` handling `language`, ordered by address.
    pub fn list_eligible_agents(&self, language: &LanguageCode, kind: AgentKind) -> Vec<DisputeAgent> {
        self.registry().select_eligible(language, kind)
    }

    // ── Offers ───────────────────────────────────────────────────────

    /// Create an offer, have `arbitrator` co-sign it, and publish it.
    ///
    /// The offer is kept in the book whatever the outcome: `AVAILABLE` on
    /// success, `PENDING` when the arbitrator is not accepted or unreachable,
    /// `INVALID` when a signature failed. A `PENDING` offer can be signed
    /// again with [`ExchangeNode::retry_offer_signing`].
    pub async fn place_offer(
        &self,
        terms: OfferTerms,
        arbitrator: NodeAddress,
    ) -> Result<OfferId, OfferError> {
        let payload = OfferPayload::new(
            terms,
            self.address().clone(),
            self.pub_key_ring(),
            arbitrator,
        )?;
        let mut offer = Offer::new(payload);
        let signed = self.signing.sign(&mut offer).await;
        self.publish_signed(offer, signed).await
    }

    /// Co-sign a `PENDING` own offer again, retrying while the arbitrator is
    /// unreachable and `policy` allows.
    pub async fn retry_offer_signing(
        &self,
        offer_id: &OfferId,
        policy: &RetryPolicy,
    ) -> Result<OfferId, OfferError> {
        let mut offer = self
            .offers()
            .get(offer_id)
            .filter(|_| self.offers().origin(offer_id) == Some(OfferOrigin::Own))
            .ok_or(OfferError::NotFound { offer_id: *offer_id })?;
        let signed = self.signing.sign_with_retry(&mut offer, policy).await;
        self.publish_signed(offer, signed).await
    }

    /// Store the offer as signing left it and broadcast it if it is takeable.
    async fn publish_signed(
        &self,
        offer: Offer,
        signed: Result<RunReport, TaskFailure<OfferError>>,
    ) -> Result<OfferId, OfferError> {
        let offer_id = offer.id();
        self.offers().put_own(offer.clone());
        self.protocol.persist_offer(&offer);

        match signed {
            Ok(_) => {
                tracing::info!(offer_id = %offer_id, "offer co-signed, publishing");
                let envelope = NetworkEnvelope::OfferBroadcast(offer.payload().clone());
                if let Err(e) = self.protocol.network().broadcast(envelope).await {
                    tracing::warn!(offer_id = %offer_id, error = %e, "offer broadcast failed");
                }
                Ok(offer_id)
            }
            Err(failure) => {
                tracing::warn!(offer_id = %offer_id, task = %failure.task, "offer not co-signed");
                Err(failure.into_error())
            }
        }
    }

    pub fn cancel_offer(&self, offer_id: &OfferId) -> Result<(), OfferError> {
        self.offers().cancel(offer_id)?;
        if let Some(offer) = self.offers().get(offer_id) {
            self.protocol.persist_offer(&offer);
        }
        Ok(())
    }

    /// Expire offers older than the configured time-to-live.
    pub fn expire_offers(&self, now: Timestamp) -> Vec<OfferId> {
        let expired = self
            .offers()
            .expire_stale(now, self.protocol.config().offer_ttl);
        for id in &expired {
            if let Some(offer) = self.offers().get(id) {
                self.protocol.persist_offer(&offer);
            }
        }
        expired
    }

    // ── Trades ───────────────────────────────────────────────────────

    pub async fn take_offer(&self, offer_id: OfferId, amount: u64) -> Result<TradeId, TradeError> {
        self.protocol.take_offer(offer_id, amount).await
    }

    pub async fn trade_state(&self, trade_id: &TradeId) -> Result<TradeState, TradeError> {
        self.protocol.trade_state(trade_id).await
    }

    pub async fn trade(&self, trade_id: &TradeId) -> Result<Trade, TradeError> {
        self.protocol.trade(trade_id).await
    }

    pub async fn poll_confirmations(&self) -> Vec<TradeId> {
        self.protocol.poll_confirmations().await
    }

    pub async fn check_deadlines(&self, now: Timestamp) -> Vec<TradeId> {
        self.protocol.check_deadlines(now).await
    }

    pub async fn resume_trade(&self, trade_id: TradeId) -> Result<TradeState, TradeError> {
        self.protocol.resume_trade(trade_id).await
    }

    pub async fn resume_trade_with(
        &self,
        trade_id: TradeId,
        policy: &RetryPolicy,
    ) -> Result<TradeState, TradeError> {
        self.protocol.resume_trade_with(trade_id, policy).await
    }

    // ── Disputes ─────────────────────────────────────────────────────

    pub async fn open_dispute(
        &self,
        trade_id: TradeId,
        reason: DisputeReason,
    ) -> Result<Dispute, TradeError> {
        self.protocol.open_dispute(trade_id, reason).await
    }

    pub fn dispute(&self, trade_id: &TradeId) -> Option<Dispute> {
        self.protocol.dispute(trade_id)
    }

    pub async fn apply_resolution(
        &self,
        resolution: SignedResolution,
    ) -> Result<ResolutionOutcome, TradeError> {
        self.protocol.apply_resolution(resolution).await
    }

    /// Submit a document as evidence; the dispute keeps its digest.
    pub async fn add_evidence<T: Serialize>(
        &self,
        trade_id: TradeId,
        description: impl Into<String>,
        document: &T,
    ) -> Result<(), TradeError> {
        let digest = payload_digest(document)?;
        self.protocol.add_evidence(trade_id, description, digest).await
    }
}

#[async_trait]
impl MessageHandler for ExchangeNode {
    async fn on_message(
        &self,
        from: NodeAddress,
        envelope: NetworkEnvelope,
    ) -> Result<(), TradeError> {
        match envelope {
            NetworkEnvelope::Trade(message) => {
                self.protocol.handle_trade_message(from, message).await
            }
            NetworkEnvelope::OfferBroadcast(payload) => {
                let offer_id = payload.id;
                if payload.maker_address != from {
                    tracing::warn!(offer_id = %offer_id, maker = %payload.maker_address, from = %from, "offer broadcast not from its maker");
                    return Err(TradeError::RelayedOffer {
                        offer_id,
                        maker: payload.maker_address,
                        from,
                    });
                }
                let state = self.offers().admit_remote(payload, self.registry())?;
                tracing::debug!(offer_id = %offer_id, from = %from, state = %state, "remote offer");
                Ok(())
            }
            NetworkEnvelope::Resolution(resolution) => {
                self.apply_resolution(resolution).await.map(|_| ())
            }
        }
    }
}

impl std::fmt::Debug for ExchangeNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeNode")
            .field("protocol", &self.protocol)
            .field("signing", &self.signing)
            .finish()
    }
}
