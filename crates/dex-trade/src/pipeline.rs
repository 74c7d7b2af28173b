//! # Trade Pipelines
//!
//! The fund-moving and messaging steps of a trade, expressed as
//! [`TaskRunner`]s over a [`TradeModel`]. Every task is idempotent with
//! respect to what the trade already records: a built transaction is not
//! rebuilt, a recorded transaction id is not broadcast again, and a delivered
//! message leaves the outbox empty. Resuming at a checkpoint therefore never
//! repeats a side effect.

use std::sync::Arc;

use async_trait::async_trait;
use dex_arbitration::PayoutDecision;
use dex_core::NodeAddress;
use dex_crypto::KeyRing;
use dex_task::{Task, TaskRunner};

use crate::error::TradeError;
use crate::message::{MessageBody, NetworkEnvelope, TradeMessage};
use crate::services::{NetworkService, TxKind, WalletService};
use crate::trade::{PipelineKind, Trade, TradeState};

/// Working state of one pipeline run.
#[derive(Debug, Clone)]
pub struct TradeModel {
    pub trade: Trade,
    /// Payout division; `None` pays everything to the buyer.
    pub decision: Option<PayoutDecision>,
}

// ── Tasks ────────────────────────────────────────────────────────────

struct BuildTransaction {
    wallet: Arc<dyn WalletService>,
    kind: TxKind,
}

#[async_trait]
impl Task<TradeModel, TradeError> for BuildTransaction {
    fn name(&self) -> &str {
        match self.kind {
            TxKind::Deposit => "build_deposit",
            TxKind::Payout => "build_payout",
        }
    }

    async fn execute(&self, model: &mut TradeModel) -> Result<(), TradeError> {
        let decision = model.decision;
        let trade = &mut model.trade;
        let already_built = trade
            .pending_tx
            .as_ref()
            .is_some_and(|tx| tx.kind == self.kind);
        if trade.tx_id(self.kind).is_some() || already_built {
            return Ok(());
        }
        let tx = match self.kind {
            TxKind::Deposit => self.wallet.build_deposit_transaction(trade).await?,
            TxKind::Payout => {
                let decision = decision.unwrap_or_else(|| trade.release_decision());
                self.wallet.build_payout_transaction(trade, decision).await?
            }
        };
        trade.pending_tx = Some(tx);
        Ok(())
    }
}

struct BroadcastTransaction {
    wallet: Arc<dyn WalletService>,
    kind: TxKind,
}

#[async_trait]
impl Task<TradeModel, TradeError> for BroadcastTransaction {
    fn name(&self) -> &str {
        match self.kind {
            TxKind::Deposit => "broadcast_deposit",
            TxKind::Payout => "broadcast_payout",
        }
    }

    async fn execute(&self, model: &mut TradeModel) -> Result<(), TradeError> {
        let trade = &mut model.trade;
        if trade.tx_id(self.kind).is_some() {
            return Ok(());
        }
        let tx = trade
            .pending_tx
            .clone()
            .filter(|tx| tx.kind == self.kind)
            .ok_or_else(|| TradeError::Validation(format!("no {:?} transaction built", self.kind)))?;
        let tx_id = self.wallet.broadcast(&tx).await?;
        tracing::info!(trade_id = %trade.id, tx_id = %tx_id, kind = ?self.kind, "transaction broadcast");
        match self.kind {
            TxKind::Deposit => trade.deposit_tx_id = Some(tx_id),
            TxKind::Payout => trade.payout_tx_id = Some(tx_id),
        }
        trade.pending_tx = None;
        Ok(())
    }
}

/// Sign the announcement of a broadcast transaction into the outbox.
struct Announce {
    keys: Arc<KeyRing>,
    address: NodeAddress,
    kind: TxKind,
}

#[async_trait]
impl Task<TradeModel, TradeError> for Announce {
    fn name(&self) -> &str {
        match self.kind {
            TxKind::Deposit => "announce_deposit",
            TxKind::Payout => "announce_payout",
        }
    }

    async fn execute(&self, model: &mut TradeModel) -> Result<(), TradeError> {
        let trade = &mut model.trade;
        if trade.outbox.is_some() {
            return Ok(());
        }
        let tx_id = trade
            .tx_id(self.kind)
            .cloned()
            .ok_or_else(|| TradeError::Validation("nothing broadcast to announce".into()))?;
        let body = match self.kind {
            TxKind::Deposit => MessageBody::DepositPublished { tx_id },
            TxKind::Payout => MessageBody::PayoutPublished { tx_id },
        };
        // Already announced and delivered.
        if body.step() <= trade.last_step() {
            return Ok(());
        }
        let signed = TradeMessage::new(trade.id, self.address.clone(), body).sign(&self.keys)?;
        trade.record_message(&signed)?;
        trade.outbox = Some(signed);
        Ok(())
    }
}

/// Send the outbox to the counterparty.
struct Deliver {
    network: Arc<dyn NetworkService>,
}

#[async_trait]
impl Task<TradeModel, TradeError> for Deliver {
    fn name(&self) -> &str {
        "deliver"
    }

    async fn execute(&self, model: &mut TradeModel) -> Result<(), TradeError> {
        let trade = &mut model.trade;
        let Some(message) = trade.outbox.clone() else {
            return Ok(());
        };
        let peer = trade.counterparty().clone();
        let kind = message.kind();
        self.network
            .send_direct(&peer, NetworkEnvelope::Trade(message))
            .await?;
        tracing::debug!(trade_id = %trade.id, peer = %peer, message = kind, "message delivered");
        trade.outbox = None;
        Ok(())
    }
}

fn advance(
    from: TradeState,
    to: TradeState,
    reason: &'static str,
) -> impl Fn(&mut TradeModel) -> Result<(), TradeError> + Send + Sync + 'static {
    move |model: &mut TradeModel| {
        if model.trade.state() == from {
            model.trade.transition(to, reason)?;
        }
        Ok(())
    }
}

fn record_failure(error: &TradeError, model: &mut TradeModel) {
    tracing::warn!(trade_id = %model.trade.id, error = %error, "trade pipeline failed");
    model.trade.error_message = Some(error.to_string());
}

// ── Pipelines ────────────────────────────────────────────────────────

/// The four pipelines a node runs, built once per node.
pub struct Pipelines {
    publish_deposit: TaskRunner<TradeModel, TradeError>,
    publish_payout: TaskRunner<TradeModel, TradeError>,
    dispute_payout: TaskRunner<TradeModel, TradeError>,
    deliver: TaskRunner<TradeModel, TradeError>,
}

impl Pipelines {
    pub fn new(
        address: &NodeAddress,
        keys: &Arc<KeyRing>,
        wallet: &Arc<dyn WalletService>,
        network: &Arc<dyn NetworkService>,
    ) -> Self {
        let build = |kind| BuildTransaction {
            wallet: Arc::clone(wallet),
            kind,
        };
        let broadcast = |kind| BroadcastTransaction {
            wallet: Arc::clone(wallet),
            kind,
        };
        let announce = |kind| Announce {
            keys: Arc::clone(keys),
            address: address.clone(),
            kind,
        };
        let deliver = || Deliver {
            network: Arc::clone(network),
        };

        Self {
            publish_deposit: TaskRunner::new(PipelineKind::PublishDeposit.as_str())
                .with_task(build(TxKind::Deposit))
                .with_task(broadcast(TxKind::Deposit))
                .with_fn(
                    "mark_deposit_published",
                    advance(TradeState::Initiated, TradeState::DepositPublished, "deposit broadcast"),
                )
                .with_task(announce(TxKind::Deposit))
                .with_task(deliver())
                .on_failure(record_failure),
            publish_payout: TaskRunner::new(PipelineKind::PublishPayout.as_str())
                .with_task(build(TxKind::Payout))
                .with_task(broadcast(TxKind::Payout))
                .with_fn(
                    "mark_payout_published",
                    advance(
                        TradeState::DepositConfirmed,
                        TradeState::PayoutPublished,
                        "payout broadcast",
                    ),
                )
                .with_task(announce(TxKind::Payout))
                .with_task(deliver())
                .on_failure(record_failure),
            dispute_payout: TaskRunner::new(PipelineKind::DisputePayout.as_str())
                .with_task(build(TxKind::Payout))
                .with_task(broadcast(TxKind::Payout))
                .on_failure(record_failure),
            deliver: TaskRunner::new(PipelineKind::Deliver.as_str())
                .with_task(deliver())
                .on_failure(record_failure),
        }
    }

    pub fn get(&self, kind: PipelineKind) -> &TaskRunner<TradeModel, TradeError> {
        match kind {
            PipelineKind::PublishDeposit => &self.publish_deposit,
            PipelineKind::PublishPayout => &self.publish_payout,
            PipelineKind::DisputePayout => &self.dispute_payout,
            PipelineKind::Deliver => &self.deliver,
        }
    }
}

impl std::fmt::Debug for Pipelines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipelines")
            .field("publish_deposit", &self.publish_deposit.task_names())
            .field("publish_payout", &self.publish_payout.task_names())
            .field("dispute_payout", &self.dispute_payout.task_names())
            .field("deliver", &self.deliver.task_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{LinkMode, LocalNetwork, MockChain, MockWallet};
    use crate::trade::tests::trade;
    use dex_arbitration::PartyRole;
    use dex_offer::Direction;
    use dex_task::RetryPolicy;
    use std::time::Duration;

    struct Fixture {
        chain: Arc<MockChain>,
        wallet: Arc<MockWallet>,
        network: LocalNetwork,
        pipelines: Pipelines,
        maker: NodeAddress,
    }

    fn fixture() -> Fixture {
        let chain = Arc::new(MockChain::new());
        let wallet = Arc::new(MockWallet::new(Arc::clone(&chain), 10_000_000));
        let network = LocalNetwork::new();
        let maker = NodeAddress::new("maker.onion:9999").unwrap();
        network.add_mailbox(maker.clone());
        let taker = NodeAddress::new("taker.onion:9999").unwrap();
        let pipelines = Pipelines::new(
            &taker,
            &Arc::new(KeyRing::from_seed(&[8u8; 32])),
            &(Arc::clone(&wallet) as Arc<dyn WalletService>),
            &network.endpoint(taker.clone()),
        );
        Fixture {
            chain,
            wallet,
            network,
            pipelines,
            maker,
        }
    }

    fn once() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn deposit_pipeline_publishes_and_announces() {
        let f = fixture();
        let mut model = TradeModel {
            trade: trade(PartyRole::Taker, Direction::Sell),
            decision: None,
        };
        let report = f
            .pipelines
            .get(PipelineKind::PublishDeposit)
            .run(&mut model)
            .await
            .unwrap();
        assert_eq!(report.completed.len(), 5);

        let t = &model.trade;
        assert_eq!(t.state(), TradeState::DepositPublished);
        assert!(t.deposit_tx_id.is_some());
        assert!(t.pending_tx.is_none());
        assert!(t.outbox.is_none());
        assert_eq!(t.last_step(), Some(2));
        assert_eq!(f.chain.broadcast_count(&t.id, TxKind::Deposit), 1);

        let inbox = f.network.mailbox(&f.maker);
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].1.kind(), "DEPOSIT_PUBLISHED");
    }

    #[tokio::test]
    async fn resuming_after_delivery_failure_does_not_rebroadcast() {
        let f = fixture();
        f.network.set_link(&f.maker, LinkMode::Unreachable);
        let runner = f.pipelines.get(PipelineKind::PublishDeposit);
        let mut model = TradeModel {
            trade: trade(PartyRole::Taker, Direction::Sell),
            decision: None,
        };

        let failure = once()
            .run(runner, &mut model, TradeError::is_transient)
            .await
            .unwrap_err();
        assert_eq!(failure.task, "deliver");
        assert!(model.trade.outbox.is_some());
        assert!(model.trade.error_message.is_some());

        f.network.set_link(&f.maker, LinkMode::Up);
        once()
            .resume(runner, &mut model, failure.index, TradeError::is_transient)
            .await
            .unwrap();
        assert_eq!(f.chain.broadcast_count(&model.trade.id, TxKind::Deposit), 1);
        assert_eq!(f.network.mailbox(&f.maker).len(), 1);
    }

    #[tokio::test]
    async fn rerunning_from_start_skips_completed_side_effects() {
        let f = fixture();
        let runner = f.pipelines.get(PipelineKind::PublishDeposit);
        let mut model = TradeModel {
            trade: trade(PartyRole::Taker, Direction::Sell),
            decision: None,
        };
        runner.run(&mut model).await.unwrap();
        let digests = model.trade.message_digests().len();
        runner.run(&mut model).await.unwrap();

        assert_eq!(model.trade.message_digests().len(), digests);
        assert_eq!(f.chain.broadcast_count(&model.trade.id, TxKind::Deposit), 1);
        assert_eq!(f.network.mailbox(&f.maker).len(), 1);
    }

    #[tokio::test]
    async fn wallet_rejection_is_fatal() {
        let f = fixture();
        f.wallet.reject_broadcasts(true);
        let mut model = TradeModel {
            trade: trade(PartyRole::Taker, Direction::Sell),
            decision: None,
        };
        let failure = RetryPolicy::default()
            .run(
                f.pipelines.get(PipelineKind::PublishDeposit),
                &mut model,
                TradeError::is_transient,
            )
            .await
            .unwrap_err();
        assert_eq!(failure.task, "broadcast_deposit");
        assert!(failure.error.is_wallet_failure());
        assert!(!failure.error.is_transient());
        assert_eq!(model.trade.state(), TradeState::Initiated);
    }

    #[tokio::test]
    async fn dispute_payout_divides_by_decision() {
        let f = fixture();
        let mut t = trade(PartyRole::Taker, Direction::Sell);
        t.transition(TradeState::DisputeOpened, "timeout").unwrap();
        t.transition(TradeState::DisputeResolved, "split").unwrap();
        let mut model = TradeModel {
            trade: t,
            decision: Some(PayoutDecision::Split {
                maker_basis_points: 2_500,
            }),
        };
        f.pipelines
            .get(PipelineKind::DisputePayout)
            .run(&mut model)
            .await
            .unwrap();

        let broadcasts = f.chain.broadcasts();
        assert_eq!(broadcasts.len(), 1);
        let (tx_id, tx) = &broadcasts[0];
        assert_eq!(model.trade.payout_tx_id.as_ref(), Some(tx_id));
        assert_eq!(tx.total(), 500_000);
        assert_eq!(tx.outputs[0].amount, 125_000);
        assert_eq!(tx.outputs[1].amount, 375_000);
    }
}
