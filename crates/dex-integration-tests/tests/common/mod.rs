//! Fixtures shared by the scenario suites: one arbitrator, a maker, and a
//! taker on an in-process network and chain.

#![allow(dead_code)]

use dex_core::{OfferId, TradeId};
use dex_offer::Direction;
use dex_trade::testing::{TestAgent, TestMarket, TestNode};
use dex_trade::ProtocolConfig;
use tracing_subscriber::EnvFilter;

pub const FUNDS: u64 = 10_000_000;
pub const AMOUNT: u64 = 500_000;
pub const ARBITRATOR: &str = "arbitrator.onion:9999";
pub const MAKER: &str = "maker.onion:9999";
pub const TAKER: &str = "taker.onion:9999";

/// Log to the test writer, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Setup {
    pub market: TestMarket,
    pub arbitrator: TestAgent,
    pub maker: TestNode,
    pub taker: TestNode,
}

pub fn setup(config: ProtocolConfig) -> Setup {
    setup_with(config, |_| {})
}

/// As [`setup`], letting `agents` add dispute agents before the nodes start.
pub fn setup_with(config: ProtocolConfig, agents: impl FnOnce(&TestMarket)) -> Setup {
    init_tracing();
    let market = TestMarket::new();
    let arbitrator = market.add_arbitrator(ARBITRATOR, 9);
    agents(&market);
    let maker = market.spawn_node(MAKER, 1, FUNDS, config.clone());
    let taker = market.spawn_node(TAKER, 2, FUNDS, config);
    Setup {
        market,
        arbitrator,
        maker,
        taker,
    }
}

/// Place a co-signed offer and let it reach the taker.
pub async fn list_offer(s: &Setup, direction: Direction) -> OfferId {
    let offer_id = s
        .maker
        .node
        .place_offer(TestMarket::terms(direction), s.arbitrator.address().clone())
        .await
        .expect("offer co-signed");
    s.market.network.settle().await;
    offer_id
}

/// List an offer and take it; returns once both sides settled.
pub async fn open_trade(s: &Setup, direction: Direction) -> TradeId {
    let offer_id = list_offer(s, direction).await;
    let trade_id = s
        .taker
        .node
        .take_offer(offer_id, AMOUNT)
        .await
        .expect("take accepted");
    s.market.network.settle().await;
    trade_id
}
