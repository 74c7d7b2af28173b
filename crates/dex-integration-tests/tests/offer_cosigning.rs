//! # Offer Co-Signing Across Nodes
//!
//! A maker's offer becomes takeable only after the arbitrator it names signs
//! it, and peers admit it only if they accept that arbitrator too.

mod common;

use std::time::Duration;

use common::{list_offer, setup, ARBITRATOR, FUNDS, MAKER, TAKER};
use dex_core::{NodeAddress, Timestamp};
use dex_offer::{Direction, OfferError, OfferOrigin, OfferState};
use dex_trade::testing::TestMarket;
use dex_trade::{MessageHandler, NetworkEnvelope, PersistenceService, Record, RecordKey, TradeError};

// =========================================================================
// Co-signing
// =========================================================================

#[tokio::test]
async fn cosigned_offer_is_available_and_verifiable() {
    let s = setup(TestMarket::config());
    let offer_id = list_offer(&s, Direction::Sell).await;

    let own = s.maker.node.offers().get(&offer_id).expect("maker holds offer");
    assert_eq!(own.state(), OfferState::Available);
    assert!(own
        .payload()
        .has_valid_arbitrator_signature(s.arbitrator.agent.signing_key()));

    // The taker admitted the broadcast after checking the same signature.
    let remote = s.taker.node.offers();
    assert_eq!(remote.state(&offer_id), Some(OfferState::Available));
    assert_eq!(remote.origin(&offer_id), Some(OfferOrigin::Remote));

    let stored = s
        .maker
        .persistence
        .load(&RecordKey::Offer(offer_id))
        .expect("storage readable");
    assert!(matches!(stored, Some(Record::Offer(o)) if o.state() == OfferState::Available));
}

#[tokio::test]
async fn unknown_arbitrator_leaves_offer_pending() {
    let s = setup(TestMarket::config());
    let stranger = NodeAddress::new("stranger.onion:9999").unwrap();

    let err = s
        .maker
        .node
        .place_offer(TestMarket::terms(Direction::Sell), stranger.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, OfferError::UnknownArbitrator { ref address } if address == &stranger));

    let own = s.maker.node.offers().own();
    assert_eq!(own.len(), 1);
    assert_eq!(own[0].state(), OfferState::Pending);
    assert!(own[0].error_message().is_some());

    s.market.network.settle().await;
    assert!(s.taker.node.offers().is_empty(), "pending offers are not published");
}

#[tokio::test]
async fn unreachable_arbitrator_leaves_offer_pending() {
    let s = setup(TestMarket::config());
    s.market.arbitrators.set_offline(s.arbitrator.address(), true);

    let err = s
        .maker
        .node
        .place_offer(TestMarket::terms(Direction::Buy), s.arbitrator.address().clone())
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(s.maker.node.offers().own()[0].state(), OfferState::Pending);

    assert!(s.taker.node.offers().is_empty());

    let pending_id = s.maker.node.offers().own()[0].id();
    s.market.arbitrators.set_offline(s.arbitrator.address(), false);
    let offer_id = s
        .maker
        .node
        .retry_offer_signing(&pending_id, &TestMarket::config().retry)
        .await
        .unwrap();
    s.market.network.settle().await;
    assert_eq!(offer_id, pending_id);
    assert_eq!(s.taker.node.offers().state(&offer_id), Some(OfferState::Available));
}

#[tokio::test]
async fn only_own_offers_are_signed_again() {
    let s = setup(TestMarket::config());
    let offer_id = list_offer(&s, Direction::Sell).await;
    let err = s
        .taker
        .node
        .retry_offer_signing(&offer_id, &TestMarket::config().retry)
        .await
        .unwrap_err();
    assert!(matches!(err, OfferError::NotFound { .. }));
}

#[tokio::test]
async fn relayed_offer_broadcast_is_refused() {
    let s = setup(TestMarket::config());
    let offer_id = list_offer(&s, Direction::Sell).await;
    let late = s
        .market
        .spawn_node("late.onion:9999", 3, FUNDS, TestMarket::config());
    let payload = s.maker.node.offers().get(&offer_id).unwrap().payload().clone();

    let err = late
        .node
        .on_message(
            s.taker.address().clone(),
            NetworkEnvelope::OfferBroadcast(payload.clone()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::RelayedOffer { .. }));
    assert!(err.is_trust_failure());
    assert!(late.node.offers().is_empty());

    late.node
        .on_message(s.maker.address().clone(), NetworkEnvelope::OfferBroadcast(payload))
        .await
        .unwrap();
    assert_eq!(late.node.offers().state(&offer_id), Some(OfferState::Available));
}

#[tokio::test]
async fn peer_without_the_arbitrator_ignores_the_offer() {
    common::init_tracing();
    let market = TestMarket::new();
    let outsider = market.spawn_node(TAKER, 2, FUNDS, TestMarket::config());
    let arbitrator = market.add_arbitrator(ARBITRATOR, 9);
    let maker = market.spawn_node(MAKER, 1, FUNDS, TestMarket::config());

    let offer_id = maker
        .node
        .place_offer(TestMarket::terms(Direction::Sell), arbitrator.address().clone())
        .await
        .expect("maker accepts the arbitrator");
    market.network.settle().await;

    assert!(outsider.node.offers().is_empty());
    let err = outsider.node.take_offer(offer_id, 500_000).await.unwrap_err();
    assert!(matches!(err, TradeError::Offer(OfferError::NotFound { .. })));
}

// =========================================================================
// Lifecycle
// =========================================================================

#[tokio::test]
async fn cancelled_offer_cannot_be_taken() {
    let s = setup(TestMarket::config());
    let offer_id = list_offer(&s, Direction::Sell).await;

    s.maker.node.cancel_offer(&offer_id).expect("available offer cancels");
    assert_eq!(s.maker.node.offers().state(&offer_id), Some(OfferState::Cancelled));

    // The taker still lists it; the maker refuses.
    let err = s.taker.node.take_offer(offer_id, 500_000).await.unwrap_err();
    assert!(matches!(err, TradeError::TakeRejected { .. }));
    assert!(s.maker.node.protocol().trade_ids().is_empty());
}

#[tokio::test]
async fn stale_offers_expire() {
    let s = setup(TestMarket::config());
    let offer_id = list_offer(&s, Direction::Sell).await;

    assert!(s.maker.node.expire_offers(Timestamp::now()).is_empty());
    let next_week = Timestamp::now().saturating_add(Duration::from_secs(8 * 24 * 3600));
    assert_eq!(s.maker.node.expire_offers(next_week), vec![offer_id]);
    assert_eq!(s.maker.node.offers().state(&offer_id), Some(OfferState::Expired));
}
