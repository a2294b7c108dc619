//! Hands decoded VAAs to one redemption lane per destination chain.
//!
//! Lanes are bounded queues drained by a dedicated worker, so a slow or unresponsive chain only
//! ever delays its own redemptions. Producers never wait: a VAA arriving at a full lane is
//! dropped and left for reconciliation to pick up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use error_stack::{report, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wormhole_vaa::Chain;

use crate::asyncutil::future::{with_retry, RetryPolicy};
use crate::monitoring;
use crate::monitoring::metrics::Msg;
use crate::redeem::{BridgeConnector, RedemptionEngine};
use crate::storage::{DedupStore, VaaRecord};

#[derive(Error, Debug)]
pub enum Error {
    #[error("redemption lane crashed")]
    LaneCrashed,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// capacity of each destination lane
    pub queue_cap: usize,
    pub max_attempts: u64,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// redeem wrapped native tokens as the native asset
    pub unwrap_native: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_cap: 100,
            max_attempts: 3,
            retry_delay: Duration::from_secs(10),
            unwrap_native: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Queued(Chain),
    /// not a token transfer
    NoDestination,
    UnsupportedChain(Chain),
    Dropped(Chain),
}

/// Producer side of the lanes. Cheap to clone.
#[derive(Clone)]
pub struct DispatchHandle {
    lanes: Arc<HashMap<Chain, mpsc::Sender<VaaRecord>>>,
    monitoring_client: monitoring::Client,
}

pub type LaneReceivers = HashMap<Chain, mpsc::Receiver<VaaRecord>>;

/// Creates one bounded lane per chain.
pub fn lanes(
    chains: impl IntoIterator<Item = Chain>,
    queue_cap: usize,
    monitoring_client: monitoring::Client,
) -> (DispatchHandle, LaneReceivers) {
    let (senders, receivers) = chains
        .into_iter()
        .map(|chain| {
            let (tx, rx) = mpsc::channel(queue_cap.max(1));
            ((chain, tx), (chain, rx))
        })
        .unzip();

    (
        DispatchHandle {
            lanes: Arc::new(senders),
            monitoring_client,
        },
        receivers,
    )
}

impl DispatchHandle {
    /// Never blocks.
    pub fn dispatch(&self, record: VaaRecord) -> Dispatched {
        let key = record.key();

        let Some(chain) = record.to_chain else {
            debug!(key = %key, "vaa is not a token transfer, nothing to redeem");
            return Dispatched::NoDestination;
        };

        let Some(lane) = self.lanes.get(&chain) else {
            debug!(key = %key, to_chain = chain.id(), "no redemption lane for destination chain");
            return Dispatched::UnsupportedChain(chain);
        };

        match lane.try_send(record) {
            Ok(()) => Dispatched::Queued(chain),
            Err(TrySendError::Full(_)) => {
                warn!(
                    key = %key,
                    to_chain = chain.id(),
                    "redemption lane is full, dropping vaa"
                );
                self.monitoring_client
                    .metrics()
                    .record_metric(Msg::DispatchDropped { chain });
                Dispatched::Dropped(chain)
            }
            Err(TrySendError::Closed(_)) => {
                warn!(key = %key, to_chain = chain.id(), "redemption lane is closed, dropping vaa");
                Dispatched::Dropped(chain)
            }
        }
    }
}

/// Consumer side of the lanes.
pub struct Dispatcher<C> {
    engine: Arc<RedemptionEngine<C>>,
    store: DedupStore,
    receivers: LaneReceivers,
    config: Config,
}

impl<C> Dispatcher<C>
where
    C: BridgeConnector + Send + Sync + 'static,
{
    pub fn new(
        engine: Arc<RedemptionEngine<C>>,
        store: DedupStore,
        receivers: LaneReceivers,
        config: Config,
    ) -> Self {
        Self {
            engine,
            store,
            receivers,
            config,
        }
    }

    pub async fn run(self, token: CancellationToken) -> Result<(), Error> {
        if self.receivers.is_empty() {
            info!("no destination chains configured, vaas are only stored");
            token.cancelled().await;
            return Ok(());
        }

        let mut running = JoinSet::new();

        for (chain, receiver) in self.receivers {
            let lane = Lane {
                chain,
                receiver,
                engine: self.engine.clone(),
                store: self.store.clone(),
                retry_policy: RetryPolicy::repeat_constant(
                    self.config.retry_delay,
                    self.config.max_attempts,
                ),
                unwrap_native: self.config.unwrap_native,
            };
            running.spawn(lane.run(token.child_token()));
        }

        while let Some(joined) = running.join_next().await {
            if let Err(err) = joined {
                return Err(report!(Error::LaneCrashed).attach_printable(err.to_string()));
            }
        }

        Ok(())
    }
}

struct Lane<C> {
    chain: Chain,
    receiver: mpsc::Receiver<VaaRecord>,
    engine: Arc<RedemptionEngine<C>>,
    store: DedupStore,
    retry_policy: RetryPolicy,
    unwrap_native: bool,
}

impl<C> Lane<C>
where
    C: BridgeConnector,
{
    async fn run(mut self, token: CancellationToken) {
        info!(chain_id = self.chain.id(), "starting redemption lane");

        loop {
            let record = tokio::select! {
                _ = token.cancelled() => break,
                record = self.receiver.recv() => match record {
                    Some(record) => record,
                    None => break,
                },
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.process(record) => {},
            }
        }

        info!(chain_id = self.chain.id(), "redemption lane stopped");
    }

    async fn process(&self, record: VaaRecord) {
        let key = record.key();

        let signed_vaa = match record.signed_vaa() {
            Ok(signed_vaa) => signed_vaa,
            Err(err) => {
                error!(key = %key, err = %err, "vaa envelope is not valid hex");
                return;
            }
        };

        let result = with_retry(
            || {
                self.engine
                    .redeem(self.chain, &signed_vaa, self.unwrap_native, false)
            },
            self.retry_policy,
        )
        .await;

        match result {
            Ok(outcome) => {
                info!(key = %key, outcome = %outcome, "redemption finished");
                if outcome.is_redeemed() {
                    self.store.mark_redeemed(&key).await;
                }
            }
            Err(err) => {
                error!(key = %key, err = ?err, "giving up on redemption");
            }
        }
    }
}
