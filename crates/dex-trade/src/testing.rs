//! # In-Process Test Doubles
//!
//! A network, chain, wallet, and arbitrator transport that run inside one
//! tokio runtime, for unit and cross-crate tests.
//!
//! - [`LocalNetwork`] delivers envelopes in order per destination through an
//!   unbounded channel drained by one task per attached node. Links can be
//!   cut ([`LinkMode::Unreachable`]) or silently dropped
//!   ([`LinkMode::Blackhole`]). Dispute agents get passive mailboxes.
//! - [`MockChain`] records broadcasts and confirmation depth; [`MockWallet`]
//!   builds transactions against it and can be locked, drained, slowed, or
//!   made to fail broadcasts.
//! - [`LocalArbitrator`] co-signs offers with registered arbitrator keys.
//! - [`TestMarket`] wires these into a set of [`ExchangeNode`]s sharing one
//!   network, one chain, and one set of accepted dispute agents.
//!
//! Harness constructors panic on malformed fixtures.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dex_agents::{AgentRegistration, AgentRole, DisputeAgent, DisputeAgentRegistry};
use dex_arbitration::{ArbitrationError, PayoutDecision, Resolution, SignedResolution};
use dex_core::{DisputeId, LanguageCode, NodeAddress, TradeId, TxId};
use dex_crypto::{payload_digest, KeyRing};
use dex_offer::{
    arbitrator_sign_offer, ArbitratorClient, Direction, OfferError, OfferTerms, SignOfferRequest,
    SignOfferResponse,
};
use dex_task::RetryPolicy;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::config::ProtocolConfig;
use crate::error::{NetworkError, WalletError};
use crate::exchange::{ExchangeNode, NodeServices};
use crate::message::NetworkEnvelope;
use crate::persistence::{InMemoryPersistence, PersistenceService};
use crate::protocol::Recovery;
use crate::services::{
    Balance, MessageHandler, NetworkService, Transaction, TxKind, TxOutput, WalletService,
};
use crate::trade::Trade;

// ── Network ──────────────────────────────────────────────────────────

/// How envelopes addressed to a node are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    Up,
    /// Sends fail with `PeerUnreachable`.
    Unreachable,
    /// Sends succeed but nothing arrives.
    Blackhole,
}

/// An envelope with its sender.
pub type Delivery = (NodeAddress, NetworkEnvelope);

#[derive(Default)]
struct NetworkInner {
    routes: DashMap<NodeAddress, mpsc::UnboundedSender<Delivery>>,
    mailboxes: DashMap<NodeAddress, Vec<Delivery>>,
    links: DashMap<NodeAddress, LinkMode>,
    in_flight: AtomicUsize,
    handler_errors: Mutex<Vec<(NodeAddress, String)>>,
}

/// In-process message bus.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<NetworkInner>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route envelopes for `address` to `handler`, one at a time, in order.
    pub fn attach(&self, address: NodeAddress, handler: Arc<dyn MessageHandler>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        self.inner.routes.insert(address.clone(), tx);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while let Some((from, envelope)) = rx.recv().await {
                let kind = envelope.kind();
                if let Err(e) = handler.on_message(from.clone(), envelope).await {
                    tracing::debug!(to = %address, from = %from, message = kind, error = %e, "handler rejected message");
                    inner.handler_errors.lock().push((address.clone(), e.to_string()));
                }
                inner.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        });
    }

    /// Give a passive participant (a dispute agent) a mailbox.
    pub fn add_mailbox(&self, address: NodeAddress) {
        self.inner.mailboxes.entry(address).or_default();
    }

    pub fn mailbox(&self, address: &NodeAddress) -> Vec<Delivery> {
        self.inner
            .mailboxes
            .get(address)
            .map(|m| m.value().clone())
            .unwrap_or_default()
    }

    pub fn set_link(&self, address: &NodeAddress, mode: LinkMode) {
        self.inner.links.insert(address.clone(), mode);
    }

    /// Errors returned by attached handlers, with the receiving address.
    pub fn handler_errors(&self) -> Vec<(NodeAddress, String)> {
        self.inner.handler_errors.lock().clone()
    }

    /// The transport a node at `address` sends through.
    pub fn endpoint(&self, address: NodeAddress) -> Arc<dyn NetworkService> {
        Arc::new(LocalEndpoint {
            network: self.clone(),
            address,
        })
    }

    /// Wait until every queued envelope has been handled.
    pub async fn settle(&self) {
        for _ in 0..5_000 {
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
                if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tracing::warn!("network did not settle");
    }

    fn link(&self, address: &NodeAddress) -> LinkMode {
        self.inner
            .links
            .get(address)
            .map(|m| *m.value())
            .unwrap_or(LinkMode::Up)
    }

    fn deliver(
        &self,
        from: &NodeAddress,
        to: &NodeAddress,
        envelope: NetworkEnvelope,
    ) -> Result<(), NetworkError> {
        let unreachable = |reason: &str| NetworkError::PeerUnreachable {
            peer: to.clone(),
            reason: reason.to_string(),
        };
        match self.link(to) {
            LinkMode::Unreachable => return Err(unreachable("link down")),
            LinkMode::Blackhole => return Ok(()),
            LinkMode::Up => {}
        }
        if let Some(route) = self.inner.routes.get(to) {
            self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
            if route.send((from.clone(), envelope)).is_err() {
                self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                return Err(unreachable("receiver stopped"));
            }
            return Ok(());
        }
        if let Some(mut mailbox) = self.inner.mailboxes.get_mut(to) {
            mailbox.push((from.clone(), envelope));
            return Ok(());
        }
        Err(unreachable("no route"))
    }
}

struct LocalEndpoint {
    network: LocalNetwork,
    address: NodeAddress,
}

#[async_trait]
impl NetworkService for LocalEndpoint {
    async fn send_direct(
        &self,
        peer: &NodeAddress,
        envelope: NetworkEnvelope,
    ) -> Result<(), NetworkError> {
        self.network.deliver(&self.address, peer, envelope)
    }

    async fn broadcast(&self, envelope: NetworkEnvelope) -> Result<(), NetworkError> {
        let peers: Vec<NodeAddress> = self
            .network
            .inner
            .routes
            .iter()
            .map(|r| r.key().clone())
            .filter(|peer| peer != &self.address)
            .collect();
        for peer in peers {
            if let Err(e) = self.network.deliver(&self.address, &peer, envelope.clone()) {
                tracing::debug!(peer = %peer, error = %e, "broadcast skipped peer");
            }
        }
        Ok(())
    }
}

// ── Chain and wallet ─────────────────────────────────────────────────

/// Shared ledger of broadcast transactions.
#[derive(Debug, Default)]
pub struct MockChain {
    confirmations: DashMap<TxId, u32>,
    broadcasts: Mutex<Vec<(TxId, Transaction)>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `blocks` confirmations to every broadcast transaction.
    pub fn mine(&self, blocks: u32) {
        for mut entry in self.confirmations.iter_mut() {
            *entry.value_mut() += blocks;
        }
    }

    pub fn confirmations(&self, tx_id: &TxId) -> u32 {
        self.confirmations.get(tx_id).map(|c| *c.value()).unwrap_or(0)
    }

    pub fn broadcasts(&self) -> Vec<(TxId, Transaction)> {
        self.broadcasts.lock().clone()
    }

    /// How many times a transaction of `kind` was broadcast for a trade.
    pub fn broadcast_count(&self, trade_id: &TradeId, kind: TxKind) -> usize {
        self.broadcasts
            .lock()
            .iter()
            .filter(|(_, tx)| &tx.trade_id == trade_id && tx.kind == kind)
            .count()
    }

    fn submit(&self, tx: &Transaction) -> Result<TxId, WalletError> {
        let rejected = |reason: String| WalletError::BroadcastRejected { reason };
        let digest = payload_digest(tx).map_err(|e| rejected(e.to_string()))?;
        let tx_id = TxId::new(digest.to_hex()).map_err(|e| rejected(e.to_string()))?;
        self.broadcasts.lock().push((tx_id.clone(), tx.clone()));
        self.confirmations.entry(tx_id.clone()).or_insert(0);
        Ok(tx_id)
    }
}

/// Wallet over a [`MockChain`].
#[derive(Debug)]
pub struct MockWallet {
    chain: Arc<MockChain>,
    balance: Mutex<Balance>,
    locked: AtomicBool,
    reject_broadcasts: AtomicBool,
    transient_failures: AtomicU32,
    balance_delay_ms: AtomicU64,
}

impl MockWallet {
    pub fn new(chain: Arc<MockChain>, available: u64) -> Self {
        Self {
            chain,
            balance: Mutex::new(Balance {
                available,
                ..Balance::default()
            }),
            locked: AtomicBool::new(false),
            reject_broadcasts: AtomicBool::new(false),
            transient_failures: AtomicU32::new(0),
            balance_delay_ms: AtomicU64::new(0),
        }
    }

    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }

    /// Make every later broadcast fail with `BroadcastRejected`.
    pub fn reject_broadcasts(&self, reject: bool) {
        self.reject_broadcasts.store(reject, Ordering::SeqCst);
    }

    /// Make the next `n` broadcasts fail with `Unavailable`.
    pub fn fail_next_broadcasts(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Make every balance query take `delay`, like a wallet that syncs.
    pub fn set_balance_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.balance_delay_ms.store(ms, Ordering::SeqCst);
    }

    pub fn balance_snapshot(&self) -> Balance {
        *self.balance.lock()
    }

    fn check_unlocked(&self) -> Result<(), WalletError> {
        if self.locked.load(Ordering::SeqCst) {
            return Err(WalletError::WalletLocked);
        }
        Ok(())
    }
}

#[async_trait]
impl WalletService for MockWallet {
    async fn build_deposit_transaction(&self, trade: &Trade) -> Result<Transaction, WalletError> {
        self.check_unlocked()?;
        let mut balance = self.balance.lock();
        if balance.available < trade.amount {
            return Err(WalletError::InsufficientFunds {
                required: trade.amount,
                available: balance.available,
            });
        }
        balance.available -= trade.amount;
        balance.reserved += trade.amount;
        Ok(Transaction {
            kind: TxKind::Deposit,
            trade_id: trade.id,
            outputs: vec![TxOutput {
                address: format!("escrow:{}", trade.id),
                amount: trade.amount,
            }],
        })
    }

    async fn build_payout_transaction(
        &self,
        trade: &Trade,
        decision: PayoutDecision,
    ) -> Result<Transaction, WalletError> {
        self.check_unlocked()?;
        let split = decision.split(trade.amount);
        let outputs = [
            (trade.maker().as_str().to_string(), split.maker),
            (trade.taker.as_str().to_string(), split.taker),
        ]
        .into_iter()
        .filter(|(_, amount)| *amount > 0)
        .map(|(address, amount)| TxOutput { address, amount })
        .collect();
        Ok(Transaction {
            kind: TxKind::Payout,
            trade_id: trade.id,
            outputs,
        })
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<TxId, WalletError> {
        self.check_unlocked()?;
        let pending = self.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(WalletError::Unavailable {
                reason: "node syncing".into(),
            });
        }
        if self.reject_broadcasts.load(Ordering::SeqCst) {
            return Err(WalletError::BroadcastRejected {
                reason: "inputs already spent".into(),
            });
        }
        self.chain.submit(tx)
    }

    async fn balance(&self) -> Result<Balance, WalletError> {
        let delay = self.balance_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(self.balance_snapshot())
    }

    async fn confirmations(&self, tx_id: &TxId) -> Result<u32, WalletError> {
        Ok(self.chain.confirmations(tx_id))
    }
}

// ── Arbitrator transport ─────────────────────────────────────────────

/// Co-signs offers in process with the keys of registered arbitrators.
#[derive(Debug, Default)]
pub struct LocalArbitrator {
    keys: RwLock<HashMap<NodeAddress, Arc<KeyRing>>>,
    offline: RwLock<HashSet<NodeAddress>>,
}

impl LocalArbitrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, address: NodeAddress, keys: Arc<KeyRing>) {
        self.keys.write().insert(address, keys);
    }

    pub fn set_offline(&self, address: &NodeAddress, offline: bool) {
        let mut set = self.offline.write();
        if offline {
            set.insert(address.clone());
        } else {
            set.remove(address);
        }
    }
}

#[async_trait]
impl ArbitratorClient for LocalArbitrator {
    async fn request_signature(
        &self,
        arbitrator: &DisputeAgent,
        request: SignOfferRequest,
    ) -> Result<SignOfferResponse, OfferError> {
        let unreachable = |reason: &str| OfferError::ArbitratorUnreachable {
            address: arbitrator.address.clone(),
            reason: reason.to_string(),
        };
        if self.offline.read().contains(&arbitrator.address) {
            return Err(unreachable("offline"));
        }
        let keys = self
            .keys
            .read()
            .get(&arbitrator.address)
            .cloned()
            .ok_or_else(|| unreachable("unknown host"))?;
        arbitrator_sign_offer(&keys, &arbitrator.address, &request)
    }
}

// ── Market harness ───────────────────────────────────────────────────

/// A dispute agent taking part in a [`TestMarket`].
#[derive(Debug, Clone)]
pub struct TestAgent {
    pub agent: DisputeAgent,
    pub keys: Arc<KeyRing>,
}

impl TestAgent {
    pub fn address(&self) -> &NodeAddress {
        &self.agent.address
    }

    /// Sign a decision on the dispute of `trade_id`.
    pub fn resolve(
        &self,
        trade_id: TradeId,
        decision: PayoutDecision,
    ) -> Result<SignedResolution, ArbitrationError> {
        Resolution::new(
            DisputeId::for_trade(&trade_id),
            trade_id,
            self.agent.address.clone(),
            decision,
            "decided after reviewing the trade evidence",
        )
        .sign(&self.keys)
    }
}

/// One participant of a [`TestMarket`] with handles to its doubles.
#[derive(Debug, Clone)]
pub struct TestNode {
    pub node: Arc<ExchangeNode>,
    pub wallet: Arc<MockWallet>,
    pub persistence: Arc<InMemoryPersistence>,
    /// What the node rebuilt from storage; empty for a fresh node.
    pub recovered: Recovery,
    seed: u8,
}

impl TestNode {
    pub fn address(&self) -> &NodeAddress {
        self.node.address()
    }
}

/// Nodes, agents, network, and chain of one test.
pub struct TestMarket {
    pub network: LocalNetwork,
    pub chain: Arc<MockChain>,
    pub arbitrators: Arc<LocalArbitrator>,
    agents: Mutex<Vec<DisputeAgent>>,
}

impl Default for TestMarket {
    fn default() -> Self {
        Self::new()
    }
}

impl TestMarket {
    pub fn new() -> Self {
        Self {
            network: LocalNetwork::new(),
            chain: Arc::new(MockChain::new()),
            arbitrators: Arc::new(LocalArbitrator::new()),
            agents: Mutex::new(Vec::new()),
        }
    }

    /// Default settings with millisecond retry delays.
    pub fn config() -> ProtocolConfig {
        ProtocolConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..ProtocolConfig::default()
        }
    }

    /// Terms for 0.01 BTC at 60 000 EUR, takeable from 0.001 BTC.
    pub fn terms(direction: Direction) -> OfferTerms {
        OfferTerms {
            direction,
            base_currency: "BTC".into(),
            counter_currency: "EUR".into(),
            min_amount: 100_000,
            amount: 1_000_000,
            price: 6_000_000,
            payment_methods: vec!["SEPA".into()],
        }
    }

    /// Register a dispute agent with a mailbox. Nodes spawned afterwards
    /// hold it as accepted; arbitrators also co-sign offers.
    ///
    /// # Panics
    ///
    /// If `address` is malformed.
    pub fn add_agent(&self, address: &str, role: AgentRole, seed: u8) -> TestAgent {
        let address = NodeAddress::new(address).expect("valid agent address");
        let keys = Arc::new(KeyRing::from_seed(&[seed; 32]));
        let is_arbitrator = matches!(role, AgentRole::Arbitrator { .. });
        let agent = AgentRegistration::new(address.clone(), role, [LanguageCode::default()])
            .sign(&keys)
            .expect("registration with a language signs");
        self.network.add_mailbox(address.clone());
        if is_arbitrator {
            self.arbitrators.add(address, Arc::clone(&keys));
        }
        self.agents.lock().push(agent.clone());
        TestAgent { agent, keys }
    }

    /// An arbitrator charging 0.5%.
    pub fn add_arbitrator(&self, address: &str, seed: u8) -> TestAgent {
        self.add_agent(
            address,
            AgentRole::Arbitrator {
                fee_basis_points: 50,
            },
            seed,
        )
    }

    /// Start a node with `funds` available and every known agent accepted.
    ///
    /// # Panics
    ///
    /// If `address` is malformed.
    pub fn spawn_node(&self, address: &str, seed: u8, funds: u64, config: ProtocolConfig) -> TestNode {
        let address = NodeAddress::new(address).expect("valid node address");
        let wallet = Arc::new(MockWallet::new(Arc::clone(&self.chain), funds));
        let persistence = Arc::new(InMemoryPersistence::new());
        let started = self.start(address, seed, config, wallet, persistence);
        for agent in self.agents.lock().iter() {
            let accepted = started
                .node
                .register_agent(agent.clone())
                .and_then(|_| started.node.accept_agent(&agent.address));
            if let Err(e) = accepted {
                tracing::warn!(agent = %agent.address, error = %e, "test agent not accepted");
            }
        }
        started
    }

    /// Replace a node by a fresh process over the same wallet and storage.
    /// The new node knows only what it recovers from storage.
    ///
    /// # Panics
    ///
    /// If the stored state cannot be read.
    pub fn restart(&self, node: &TestNode, config: ProtocolConfig) -> TestNode {
        let mut restarted = self.start(
            node.address().clone(),
            node.seed,
            config,
            Arc::clone(&node.wallet),
            Arc::clone(&node.persistence),
        );
        restarted.recovered = restarted.node.recover().expect("stored state readable");
        restarted
    }

    fn start(
        &self,
        address: NodeAddress,
        seed: u8,
        config: ProtocolConfig,
        wallet: Arc<MockWallet>,
        persistence: Arc<InMemoryPersistence>,
    ) -> TestNode {
        let registry = Arc::new(DisputeAgentRegistry::new());
        let node = Arc::new(ExchangeNode::new(
            address.clone(),
            KeyRing::from_seed(&[seed; 32]),
            config,
            registry,
            NodeServices {
                wallet: Arc::clone(&wallet) as Arc<dyn WalletService>,
                network: self.network.endpoint(address.clone()),
                persistence: Arc::clone(&persistence) as Arc<dyn PersistenceService>,
                arbitrators: Arc::clone(&self.arbitrators) as Arc<dyn ArbitratorClient>,
            },
        ));
        self.network
            .attach(address, Arc::clone(&node) as Arc<dyn MessageHandler>);
        TestNode {
            node,
            wallet,
            persistence,
            recovered: Recovery::default(),
            seed,
        }
    }
}
