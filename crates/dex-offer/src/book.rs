//! # Offer Book
//!
//! A node's view of offers: its own and those received from peers. Entries
//! are keyed by offer id in a `DashMap`; every state change happens under the
//! entry's shard lock, so two concurrent takers of the same offer cannot both
//! see it `AVAILABLE`.
//!
//! Remote offers are admitted only when their arbitrator is in the local
//! accepted set and the arbitrator signature verifies against that agent's
//! key.

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dex_agents::{AgentKind, DisputeAgentRegistry};
use dex_core::{OfferId, Timestamp};
use serde::{Deserialize, Serialize};

use crate::error::OfferError;
use crate::offer::{Offer, OfferPayload, OfferState};

/// Where an offer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferOrigin {
    Own,
    Remote,
}

#[derive(Debug, Clone)]
struct BookEntry {
    offer: Offer,
    origin: OfferOrigin,
}

/// Concurrent offer book.
#[derive(Debug, Default)]
pub struct OfferBook {
    offers: DashMap<OfferId, BookEntry>,
}

impl OfferBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace one of this node's own offers.
    pub fn put_own(&self, offer: Offer) {
        self.offers.insert(
            offer.id(),
            BookEntry {
                offer,
                origin: OfferOrigin::Own,
            },
        );
    }

    /// Admit an offer received from a peer.
    ///
    /// Idempotent: an offer already held keeps its current state.
    pub fn admit_remote(
        &self,
        payload: OfferPayload,
        registry: &DisputeAgentRegistry,
    ) -> Result<OfferState, OfferError> {
        if let Some(existing) = self.offers.get(&payload.id) {
            return Ok(existing.offer.state());
        }
        payload.terms.validate()?;
        let arbitrator = registry
            .accepted_agent(&payload.arbitrator_signer, AgentKind::Arbitrator)
            .ok_or_else(|| OfferError::UnknownArbitrator {
                address: payload.arbitrator_signer.clone(),
            })?;

        let mut offer = Offer::new(payload);
        if let Err(e) = offer.mark_available(arbitrator.signing_key()) {
            tracing::warn!(offer_id = %offer.id(), error = %e, "rejected remote offer");
            return Err(e);
        }

        match self.offers.entry(offer.id()) {
            Entry::Occupied(existing) => Ok(existing.get().offer.state()),
            Entry::Vacant(slot) => {
                slot.insert(BookEntry {
                    offer,
                    origin: OfferOrigin::Remote,
                });
                Ok(OfferState::Available)
            }
        }
    }

    pub fn get(&self, id: &OfferId) -> Option<Offer> {
        self.offers.get(id).map(|e| e.offer.clone())
    }

    pub fn state(&self, id: &OfferId) -> Option<OfferState> {
        self.offers.get(id).map(|e| e.offer.state())
    }

    pub fn origin(&self, id: &OfferId) -> Option<OfferOrigin> {
        self.offers.get(id).map(|e| e.origin)
    }

    /// Atomically move an `AVAILABLE` offer to `TAKEN` for `amount`.
    ///
    /// Of several concurrent callers exactly one succeeds; the rest see
    /// `InvalidTransition`. Returns the signed payload.
    pub fn take(&self, id: &OfferId, amount: u64) -> Result<OfferPayload, OfferError> {
        let mut entry = self
            .offers
            .get_mut(id)
            .ok_or(OfferError::NotFound { offer_id: *id })?;
        let offer = &mut entry.offer;
        if offer.state() == OfferState::Available && !offer.payload().terms.amount_in_range(amount)
        {
            let terms = &offer.payload().terms;
            return Err(OfferError::AmountOutOfRange {
                offer_id: *id,
                amount,
                min: terms.min_amount,
                max: terms.amount,
            });
        }
        offer.transition(OfferState::Taken, Some("taken"))?;
        Ok(offer.payload().clone())
    }

    /// Withdraw an offer that has not been taken.
    pub fn cancel(&self, id: &OfferId) -> Result<(), OfferError> {
        let mut entry = self
            .offers
            .get_mut(id)
            .ok_or(OfferError::NotFound { offer_id: *id })?;
        entry
            .offer
            .transition(OfferState::Cancelled, Some("cancelled by maker"))
    }

    /// Expire every `AVAILABLE` offer created more than `ttl` before `now`.
    pub fn expire_stale(&self, now: Timestamp, ttl: Duration) -> Vec<OfferId> {
        let mut expired = Vec::new();
        for mut entry in self.offers.iter_mut() {
            let offer = &mut entry.offer;
            if offer.state() != OfferState::Available {
                continue;
            }
            if offer.payload().created_at.saturating_add(ttl) > now {
                continue;
            }
            if offer
                .transition(OfferState::Expired, Some("time-to-live elapsed"))
                .is_ok()
            {
                expired.push(offer.id());
            }
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired stale offers");
        }
        expired
    }

    /// Offers that can currently be taken, oldest first.
    pub fn available(&self) -> Vec<Offer> {
        let mut offers: Vec<Offer> = self
            .offers
            .iter()
            .filter(|e| e.offer.state() == OfferState::Available)
            .map(|e| e.offer.clone())
            .collect();
        offers.sort_by_key(|o| (o.payload().created_at, o.id()));
        offers
    }

    /// This node's own offers in any state, oldest first.
    pub fn own(&self) -> Vec<Offer> {
        let mut offers: Vec<Offer> = self
            .offers
            .iter()
            .filter(|e| e.origin == OfferOrigin::Own)
            .map(|e| e.offer.clone())
            .collect();
        offers.sort_by_key(|o| (o.payload().created_at, o.id()));
        offers
    }

    pub fn remove(&self, id: &OfferId) -> Option<Offer> {
        self.offers.remove(id).map(|(_, e)| e.offer)
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }
}
