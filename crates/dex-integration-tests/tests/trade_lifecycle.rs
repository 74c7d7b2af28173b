//! # Trade Lifecycle
//!
//! Two nodes carry trades from a take request to completion, through a
//! missing counterparty, a contested take, wallet failures, and restarts.

mod common;

use std::time::Duration;

use common::{list_offer, open_trade, setup, AMOUNT, FUNDS};
use dex_agents::AgentKind;
use dex_arbitration::{DisputeReason, PartyRole};
use dex_core::LanguageCode;
use dex_offer::{Direction, OfferState};
use dex_trade::testing::{LinkMode, TestMarket};
use dex_trade::{TradeError, TradeState, TxKind};

// =========================================================================
// Happy path
// =========================================================================

#[tokio::test]
async fn buy_offer_completes_with_payout_to_maker() {
    let s = setup(TestMarket::config());
    let trade_id = open_trade(&s, Direction::Buy).await;
    let maker = s.maker.node.protocol();
    let taker = s.taker.node.protocol();

    // Taker sells: it published the deposit from its own wallet.
    assert_eq!(s.market.chain.broadcast_count(&trade_id, TxKind::Deposit), 1);
    assert_eq!(s.taker.wallet.balance_snapshot().reserved, AMOUNT);
    assert_eq!(maker.trade_state(&trade_id).await.unwrap(), TradeState::DepositPublished);

    s.market.chain.mine(1);
    // Seller confirms first this time; the buyer's request then goes
    // straight through.
    assert_eq!(taker.poll_confirmations().await, vec![trade_id]);
    assert_eq!(maker.poll_confirmations().await, vec![trade_id]);
    s.market.network.settle().await;

    for node in [&s.maker, &s.taker] {
        let trade = node.node.trade(&trade_id).await.unwrap();
        assert_eq!(trade.state(), TradeState::Completed);
        assert!(trade.deadline.is_none());
        assert!(trade.payout_tx_id.is_some());
    }
    let payouts: Vec<_> = s
        .market
        .chain
        .broadcasts()
        .into_iter()
        .filter(|(_, tx)| tx.kind == TxKind::Payout)
        .collect();
    assert_eq!(payouts.len(), 1);
    let outputs = &payouts[0].1.outputs;
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].address, s.maker.address().as_str());
    assert_eq!(outputs[0].amount, AMOUNT);
}

#[tokio::test]
async fn evidence_grows_with_every_step() {
    let s = setup(TestMarket::config());
    let trade_id = open_trade(&s, Direction::Sell).await;

    let maker = s.maker.node.trade(&trade_id).await.unwrap();
    // Take request, acceptance, deposit announcement.
    assert_eq!(maker.message_digests().len(), 3);
    assert_eq!(maker.last_step(), Some(2));
    let log: Vec<_> = maker.transition_log().iter().map(|t| t.to).collect();
    assert_eq!(log, vec![TradeState::DepositPublished]);
}

// =========================================================================
// Contested take
// =========================================================================

#[tokio::test]
async fn concurrent_takers_produce_one_trade() {
    let s = setup(TestMarket::config());
    let second = s
        .market
        .spawn_node("second.onion:9999", 3, FUNDS, TestMarket::config());
    let offer_id = list_offer(&s, Direction::Sell).await;
    assert_eq!(second.node.offers().state(&offer_id), Some(OfferState::Available));

    let (first, other) = tokio::join!(
        s.taker.node.take_offer(offer_id, AMOUNT),
        second.node.take_offer(offer_id, AMOUNT),
    );
    s.market.network.settle().await;

    let first_accepted = first.is_ok();
    let outcomes = [first, other];
    let accepted: Vec<_> = outcomes.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(accepted.len(), 1, "exactly one take succeeds: {outcomes:?}");
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(TradeError::TakeRejected { .. }))));

    let maker = s.maker.node.protocol();
    assert_eq!(maker.trade_ids(), vec![*accepted[0]]);
    assert_eq!(s.maker.node.offers().state(&offer_id), Some(OfferState::Taken));
    assert_eq!(s.market.chain.broadcasts().len(), 1);
    // The losing taker no longer lists the offer.
    let loser = if first_accepted { &second } else { &s.taker };
    assert!(loser.node.offers().get(&offer_id).is_none());
}

// =========================================================================
// Missing counterparty
// =========================================================================

#[tokio::test]
async fn unanswered_take_opens_timeout_dispute() {
    let config = dex_trade::ProtocolConfig {
        take_offer_timeout: Duration::from_millis(200),
        ..TestMarket::config()
    };
    let s = setup(config);
    let offer_id = list_offer(&s, Direction::Sell).await;
    s.market.network.set_link(s.maker.address(), LinkMode::Blackhole);

    let trade_id = s.taker.node.take_offer(offer_id, AMOUNT).await.unwrap();
    // Let the armed timer fire too; it must not escalate twice.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let taker = s.taker.node.protocol();
    let trade = taker.trade(&trade_id).await.unwrap();
    assert_eq!(trade.state(), TradeState::DisputeOpened);
    let dispute = taker.dispute(&trade_id).expect("dispute recorded");
    assert_eq!(dispute.reason, DisputeReason::Timeout);
    assert_eq!(dispute.opened_by, PartyRole::Taker);
    assert_eq!(&dispute.agent.address, s.arbitrator.address());
    assert!(!dispute.notification_pending);
    assert_eq!(Some(dispute.id), trade.dispute_id);

    let notices = s.market.network.mailbox(s.arbitrator.address());
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].1.kind(), "DISPUTE_OPENED");
    assert_eq!(s.market.chain.broadcasts().len(), 0);
}

#[tokio::test]
async fn silent_seller_escalates_after_payout_deadline() {
    let s = setup(TestMarket::config());
    let trade_id = open_trade(&s, Direction::Sell).await;
    s.market.chain.mine(1);

    // The maker sells but never sees the request.
    s.market.network.set_link(s.maker.address(), LinkMode::Blackhole);
    let taker = s.taker.node.protocol();
    taker.poll_confirmations().await;
    assert_eq!(taker.trade_state(&trade_id).await.unwrap(), TradeState::DepositConfirmed);

    let deadline = taker.trade(&trade_id).await.unwrap().deadline.unwrap();
    assert!(taker.check_deadlines(deadline).await.contains(&trade_id));
    assert_eq!(taker.trade_state(&trade_id).await.unwrap(), TradeState::DisputeOpened);
    assert_eq!(s.market.chain.broadcast_count(&trade_id, TxKind::Payout), 0);
}

// =========================================================================
// Wallet failures and restarts
// =========================================================================

#[tokio::test]
async fn rejected_deposit_escalates_with_wallet_failure() {
    let s = setup(TestMarket::config());
    let offer_id = list_offer(&s, Direction::Sell).await;
    s.taker.wallet.reject_broadcasts(true);

    let trade_id = s.taker.node.take_offer(offer_id, AMOUNT).await.unwrap();
    s.market.network.settle().await;

    let taker = s.taker.node.protocol();
    assert_eq!(taker.trade_state(&trade_id).await.unwrap(), TradeState::DisputeOpened);
    assert_eq!(
        taker.dispute(&trade_id).unwrap().reason,
        DisputeReason::WalletFailure
    );
    // The maker mirrors the dispute from the signed notice.
    let mirrored = s.maker.node.dispute(&trade_id).expect("maker mirrored dispute");
    assert_eq!(mirrored.opened_by, PartyRole::Taker);
    assert_eq!(mirrored.id, taker.dispute(&trade_id).unwrap().id);
}

#[tokio::test]
async fn transient_failures_resume_without_repeating_broadcast() {
    let s = setup(TestMarket::config());
    let offer_id = list_offer(&s, Direction::Sell).await;
    s.taker.wallet.fail_next_broadcasts(3);

    let trade_id = s.taker.node.take_offer(offer_id, AMOUNT).await.unwrap();
    let taker = s.taker.node.protocol();
    let trade = taker.trade(&trade_id).await.unwrap();
    assert_eq!(trade.state(), TradeState::Initiated);
    assert!(trade.checkpoint.is_some());
    assert!(trade.pending_tx.is_some());
    assert!(trade.error_message.is_some());

    // Restart over the same storage, then resume with backoff.
    let restarted = s.market.restart(&s.taker, TestMarket::config());
    assert_eq!(restarted.recovered.trades, vec![trade_id]);
    let state = restarted
        .node
        .resume_trade_with(trade_id, &TestMarket::config().retry)
        .await
        .unwrap();
    assert_eq!(state, TradeState::DepositPublished);
    s.market.network.settle().await;

    let resumed = restarted.node.protocol().trade(&trade_id).await.unwrap();
    assert!(resumed.error_message.is_none());
    assert_eq!(s.market.chain.broadcast_count(&trade_id, TxKind::Deposit), 1);
    assert_eq!(
        s.maker.node.trade_state(&trade_id).await.unwrap(),
        TradeState::DepositPublished
    );
}

#[tokio::test]
async fn restarted_maker_still_serves_its_offers() {
    let s = setup(TestMarket::config());
    let offer_id = list_offer(&s, Direction::Sell).await;

    let maker = s.market.restart(&s.maker, TestMarket::config());
    assert_eq!(maker.recovered.offers, 1);
    assert_eq!(maker.node.offers().state(&offer_id), Some(OfferState::Available));
    assert_eq!(
        maker
            .node
            .list_eligible_agents(&LanguageCode::default(), AgentKind::Arbitrator)
            .len(),
        1
    );

    let trade_id = s.taker.node.take_offer(offer_id, AMOUNT).await.unwrap();
    s.market.network.settle().await;
    assert_eq!(
        maker.node.trade_state(&trade_id).await.unwrap(),
        TradeState::DepositPublished
    );
    assert_eq!(maker.node.offers().state(&offer_id), Some(OfferState::Taken));
    assert!(s.market.network.handler_errors().is_empty());
}
