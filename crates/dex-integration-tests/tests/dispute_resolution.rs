//! # Disputes and Resolutions
//!
//! Escalation along the agent chain, mirrored disputes, and the rule that
//! only the assigned agent's signed decision moves funds, exactly once.

mod common;

use common::{open_trade, setup, setup_with, Setup, AMOUNT, TAKER};
use dex_agents::{AgentKind, AgentRole};
use dex_arbitration::{
    ArbitrationError, DisputeReason, PartyRole, PayoutDecision, ResolutionOutcome,
};
use dex_core::{DisputeId, NodeAddress, TradeId};
use dex_crypto::KeyRing;
use dex_offer::Direction;
use dex_trade::testing::{LinkMode, TestAgent, TestMarket};
use dex_trade::{
    MessageBody, NetworkEnvelope, NetworkService, TradeError, TradeMessage, TradeState, TxKind,
};
use proptest::prelude::*;

const MEDIATOR: &str = "mediator.onion:9999";

/// A trade with a published deposit, disputed by the taker.
async fn disputed(s: &Setup) -> TradeId {
    let trade_id = open_trade(s, Direction::Sell).await;
    s.taker
        .node
        .open_dispute(trade_id, DisputeReason::UserRequested)
        .await
        .expect("awaiting trade can be disputed");
    s.market.network.settle().await;
    trade_id
}

/// Deliver a decision to both parties the way the agent would.
async fn publish(s: &Setup, agent: &TestAgent, trade_id: TradeId, decision: PayoutDecision) {
    let resolution = agent.resolve(trade_id, decision).expect("valid decision");
    let endpoint = s.market.network.endpoint(agent.address().clone());
    for node in [&s.maker, &s.taker] {
        endpoint
            .send_direct(node.address(), NetworkEnvelope::Resolution(resolution.clone()))
            .await
            .expect("parties reachable");
    }
    s.market.network.settle().await;
}

// =========================================================================
// Opening
// =========================================================================

#[tokio::test]
async fn both_parties_hold_the_same_dispute() {
    let s = setup(TestMarket::config());
    let trade_id = disputed(&s).await;

    let opened = s.taker.node.dispute(&trade_id).unwrap();
    let mirrored = s.maker.node.dispute(&trade_id).unwrap();
    assert_eq!(opened.id, DisputeId::for_trade(&trade_id));
    assert_eq!(opened.id, mirrored.id);
    assert_eq!(opened.agent, mirrored.agent);
    assert_eq!(opened.opened_by, PartyRole::Taker);
    assert_eq!(mirrored.opened_by, PartyRole::Taker);
    assert_eq!(mirrored.reason, DisputeReason::UserRequested);
    assert_eq!(
        s.maker.node.trade_state(&trade_id).await.unwrap(),
        TradeState::DisputeOpened
    );
}

#[tokio::test]
async fn reopening_returns_the_existing_dispute() {
    let s = setup(TestMarket::config());
    let trade_id = disputed(&s).await;

    let again = s
        .taker
        .node
        .open_dispute(trade_id, DisputeReason::Timeout)
        .await
        .unwrap();
    assert_eq!(again.reason, DisputeReason::UserRequested);
    assert_eq!(s.market.network.mailbox(s.arbitrator.address()).len(), 1);
}

#[tokio::test]
async fn unreachable_arbitrator_escalates_to_mediator() {
    let s = setup_with(TestMarket::config(), |market| {
        market.add_agent(MEDIATOR, AgentRole::Mediator, 10);
    });
    s.market
        .network
        .set_link(s.arbitrator.address(), LinkMode::Unreachable);
    let trade_id = disputed(&s).await;

    let mediator = NodeAddress::new(MEDIATOR).unwrap();
    for node in [&s.taker, &s.maker] {
        let dispute = node.node.dispute(&trade_id).unwrap();
        assert_eq!(dispute.agent.address, mediator);
        assert_eq!(dispute.agent.kind, AgentKind::Mediator);
        assert!(!dispute.notification_pending);
    }
    assert_eq!(s.market.network.mailbox(&mediator).len(), 1);
}

#[tokio::test]
async fn no_reachable_agent_leaves_notification_pending() {
    let s = setup(TestMarket::config());
    s.market
        .network
        .set_link(s.arbitrator.address(), LinkMode::Unreachable);
    let trade_id = disputed(&s).await;

    let dispute = s.taker.node.dispute(&trade_id).unwrap();
    assert_eq!(&dispute.agent.address, s.arbitrator.address());
    assert!(dispute.notification_pending);
    assert_eq!(
        s.taker.node.trade_state(&trade_id).await.unwrap(),
        TradeState::DisputeOpened
    );
}

#[tokio::test]
async fn notice_naming_an_untrusted_agent_is_rejected() {
    let s = setup(TestMarket::config());
    let trade_id = open_trade(&s, Direction::Sell).await;
    let evidence = s.taker.node.trade(&trade_id).await.unwrap().evidence_snapshot();

    let taker = NodeAddress::new(TAKER).unwrap();
    let notice = TradeMessage::new(
        trade_id,
        taker.clone(),
        MessageBody::DisputeOpened {
            dispute_id: DisputeId::for_trade(&trade_id),
            reason: DisputeReason::UserRequested,
            agent: NodeAddress::new("rogue.onion:9999").unwrap(),
            agent_kind: AgentKind::Mediator,
            evidence,
        },
    )
    .sign(&KeyRing::from_seed(&[2u8; 32]))
    .unwrap();

    let err = s
        .maker
        .node
        .protocol()
        .handle_trade_message(taker, notice)
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::UnknownAgent { .. }));
    assert!(s.maker.node.dispute(&trade_id).is_none());
    assert_eq!(
        s.maker.node.trade_state(&trade_id).await.unwrap(),
        TradeState::DepositPublished
    );
}

#[tokio::test]
async fn evidence_attaches_to_open_dispute_only() {
    let s = setup(TestMarket::config());
    let trade_id = open_trade(&s, Direction::Sell).await;
    let receipt = serde_json::json!({ "bank": "SEPA", "reference": "T-1001" });

    let err = s
        .taker
        .node
        .add_evidence(trade_id, "bank transfer receipt", &receipt)
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::NoDispute { .. }));

    s.taker
        .node
        .open_dispute(trade_id, DisputeReason::UserRequested)
        .await
        .unwrap();
    s.taker
        .node
        .add_evidence(trade_id, "bank transfer receipt", &receipt)
        .await
        .unwrap();
    let items = s.taker.node.dispute(&trade_id).unwrap().evidence_items().to_vec();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].submitted_by, PartyRole::Taker);
}

// =========================================================================
// Resolution
// =========================================================================

#[tokio::test]
async fn decision_pays_out_exactly_once() {
    let s = setup(TestMarket::config());
    let trade_id = disputed(&s).await;
    publish(&s, &s.arbitrator, trade_id, PayoutDecision::PayoutToTaker).await;

    for node in [&s.maker, &s.taker] {
        assert_eq!(
            node.node.trade_state(&trade_id).await.unwrap(),
            TradeState::DisputeResolved
        );
    }
    assert_eq!(s.market.chain.broadcast_count(&trade_id, TxKind::Payout), 1);

    // Redelivery changes nothing.
    let again = s
        .arbitrator
        .resolve(trade_id, PayoutDecision::PayoutToTaker)
        .unwrap();
    let outcome = s.taker.node.apply_resolution(again).await.unwrap();
    assert_eq!(outcome, ResolutionOutcome::AlreadyApplied);
    assert_eq!(s.market.chain.broadcast_count(&trade_id, TxKind::Payout), 1);
}

#[tokio::test]
async fn conflicting_decision_is_refused() {
    let s = setup(TestMarket::config());
    let trade_id = disputed(&s).await;
    publish(&s, &s.arbitrator, trade_id, PayoutDecision::PayoutToMaker).await;

    let other = s
        .arbitrator
        .resolve(trade_id, PayoutDecision::PayoutToTaker)
        .unwrap();
    let err = s.maker.node.apply_resolution(other).await.unwrap_err();
    assert!(matches!(
        err,
        TradeError::Arbitration(ArbitrationError::ConflictingResolution { .. })
    ));
    assert_eq!(s.market.chain.broadcast_count(&trade_id, TxKind::Payout), 1);
}

#[tokio::test]
async fn decision_by_another_key_moves_nothing() {
    let s = setup(TestMarket::config());
    let trade_id = disputed(&s).await;

    let impostor = TestAgent {
        agent: s.arbitrator.agent.clone(),
        keys: std::sync::Arc::new(KeyRing::from_seed(&[66u8; 32])),
    };
    let forged = impostor
        .resolve(trade_id, PayoutDecision::PayoutToMaker)
        .unwrap();
    for node in [&s.maker, &s.taker] {
        let err = node.node.apply_resolution(forged.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            TradeError::Arbitration(ArbitrationError::UnauthorizedResolution { .. })
        ));
        assert_eq!(
            node.node.trade_state(&trade_id).await.unwrap(),
            TradeState::DisputeOpened
        );
    }
    assert_eq!(s.market.chain.broadcast_count(&trade_id, TxKind::Payout), 0);
}

#[tokio::test]
async fn bypassed_arbitrator_cannot_decide() {
    let s = setup_with(TestMarket::config(), |market| {
        market.add_agent(MEDIATOR, AgentRole::Mediator, 10);
    });
    s.market
        .network
        .set_link(s.arbitrator.address(), LinkMode::Unreachable);
    let trade_id = disputed(&s).await;

    let late = s
        .arbitrator
        .resolve(trade_id, PayoutDecision::PayoutToMaker)
        .unwrap();
    assert!(s.maker.node.apply_resolution(late).await.is_err());
    assert_eq!(s.market.chain.broadcast_count(&trade_id, TxKind::Payout), 0);
}

#[tokio::test]
async fn resolution_without_dispute_is_refused() {
    let s = setup(TestMarket::config());
    let trade_id = open_trade(&s, Direction::Sell).await;
    let resolution = s
        .arbitrator
        .resolve(trade_id, PayoutDecision::PayoutToMaker)
        .unwrap();
    let err = s.maker.node.apply_resolution(resolution).await.unwrap_err();
    assert!(matches!(err, TradeError::NoDispute { .. }));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// Any split is paid once, by the party with the larger share, and the
    /// outputs sum to the deposit.
    #[test]
    fn split_is_paid_once_and_conserves_deposit(maker_bps in 0u16..=10_000) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let s = setup(TestMarket::config());
            let trade_id = disputed(&s).await;
            let decision = PayoutDecision::Split { maker_basis_points: maker_bps };
            publish(&s, &s.arbitrator, trade_id, decision).await;

            let payouts: Vec<_> = s
                .market
                .chain
                .broadcasts()
                .into_iter()
                .filter(|(_, tx)| tx.kind == TxKind::Payout)
                .collect();
            assert_eq!(payouts.len(), 1);
            assert_eq!(payouts[0].1.total(), AMOUNT);

            let payer = match decision.broadcaster() {
                PartyRole::Maker => &s.maker,
                PartyRole::Taker => &s.taker,
            };
            let recorded = payer.node.trade(&trade_id).await.unwrap().payout_tx_id;
            assert_eq!(recorded.as_ref(), Some(&payouts[0].0));
        });
    }
}
