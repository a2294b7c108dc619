//! Reconciliation of the external pending-transfer ledger against the local store.
//!
//! Transfers the ledger still considers open, whose VAA has been sitting in the store for longer
//! than `stale_after` without a successful redemption, are pushed through the redemption lanes
//! again.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use error_stack::{Result, ResultExt};
use mockall::automock;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wormhole_vaa::{Address, Chain};

use crate::dispatch::{DispatchHandle, Dispatched};
use crate::monitoring;
use crate::monitoring::metrics::Msg;
use crate::spy::EmitterFilter;
use crate::storage::{DedupStore, VaaRecord};
use crate::url::Url;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to fetch pending transfers")]
    Fetch,
    #[error("invalid pending transfer record")]
    InvalidRecord,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub enabled: bool,
    pub url: Url,
    #[serde(
        serialize_with = "humantime_serde::serialize",
        deserialize_with = "deserialize_interval"
    )]
    pub interval: Duration,
    /// minimum age of an unredeemed VAA before it is resubmitted
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "https://crossswap-pre.coming.chat/v1/getUnSendTransferFromWormhole"
                .parse()
                .expect("default pending transfer url should be valid"),
            interval: Duration::from_secs(600),
            stale_after: Duration::from_secs(24 * 60 * 60),
            http_timeout: Duration::from_secs(10),
        }
    }
}

fn deserialize_interval<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let interval: Duration = humantime_serde::deserialize(deserializer)?;

    if interval.is_zero() {
        return Err(D::Error::custom("reconciliation interval must be greater than zero"));
    }

    Ok(interval)
}

#[automock]
#[async_trait]
pub trait PendingTransferSource {
    /// Raw ledger entries, parsed one by one so a single bad entry cannot spoil the batch.
    async fn fetch(&self) -> Result<Vec<Value>, Error>;
}

pub struct HttpPendingTransferSource {
    client: reqwest::Client,
    url: Url,
}

impl HttpPendingTransferSource {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .change_context(Error::Fetch)?;

        Ok(Self { client, url })
    }
}

#[derive(Deserialize)]
struct PendingTransfers {
    record: Vec<Value>,
}

#[async_trait]
impl PendingTransferSource for HttpPendingTransferSource {
    async fn fetch(&self) -> Result<Vec<Value>, Error> {
        let transfers: PendingTransfers = self
            .client
            .get((*self.url).clone())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .change_context(Error::Fetch)
            .attach_printable_lazy(|| self.url.clone())?
            .json()
            .await
            .change_context(Error::Fetch)?;

        Ok(transfers.record)
    }
}

#[serde_as]
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct PendingTransfer {
    src_wormhole_chain_id: Chain,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    sequence: u64,
}

impl TryFrom<Value> for PendingTransfer {
    type Error = error_stack::Report<Error>;

    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        serde_json::from_value(value.clone())
            .change_context(Error::InvalidRecord)
            .attach_printable(value)
    }
}

pub struct Compensator<P> {
    source: P,
    store: DedupStore,
    emitters: HashMap<Chain, Address>,
    stale_after: Duration,
    monitoring_client: monitoring::Client,
}

impl<P> Compensator<P>
where
    P: PendingTransferSource,
{
    pub fn new(
        source: P,
        store: DedupStore,
        emitters: impl IntoIterator<Item = EmitterFilter>,
        stale_after: Duration,
        monitoring_client: monitoring::Client,
    ) -> Self {
        Self {
            source,
            store,
            emitters: emitters
                .into_iter()
                .map(|emitter| (emitter.chain, emitter.address))
                .collect(),
            stale_after,
            monitoring_client,
        }
    }

    /// Stored VAAs the ledger still lists as pending that are stale and not yet redeemed.
    pub async fn find_unprocessed(&self) -> Result<Vec<VaaRecord>, Error> {
        let entries = self.source.fetch().await?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();

        let mut unprocessed = vec![];
        for entry in entries {
            let transfer = match PendingTransfer::try_from(entry) {
                Ok(transfer) => transfer,
                Err(err) => {
                    warn!(err = ?err, "skipping pending transfer");
                    continue;
                }
            };

            let Some(emitter) = self.emitters.get(&transfer.src_wormhole_chain_id) else {
                continue;
            };

            let Some(record) = self
                .store
                .find_vaa(
                    transfer.sequence,
                    Some(transfer.src_wormhole_chain_id),
                    Some(*emitter),
                )
                .await
            else {
                debug!(
                    sequence = transfer.sequence,
                    emitter_chain = transfer.src_wormhole_chain_id.id(),
                    "pending transfer has no stored vaa"
                );
                continue;
            };

            let age = now.saturating_sub(u64::from(record.timestamp));
            if record.redeemed_at.is_none() && age > self.stale_after.as_secs() {
                unprocessed.push(record);
            }
        }

        if !unprocessed.is_empty() {
            info!(count = unprocessed.len(), "found unprocessed transfers");
        }

        Ok(unprocessed)
    }

    pub async fn run(
        self,
        dispatcher: DispatchHandle,
        interval: Duration,
        token: CancellationToken,
    ) -> Result<(), Error> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {},
            }

            let unprocessed = match self.find_unprocessed().await {
                Ok(unprocessed) => unprocessed,
                Err(err) => {
                    warn!(err = ?err, "skipping reconciliation pass");
                    continue;
                }
            };

            self.monitoring_client
                .metrics()
                .record_metric(Msg::CompensationFound {
                    count: u64::try_from(unprocessed.len()).unwrap_or(u64::MAX),
                });

            for record in unprocessed {
                let (sequence, emitter_chain) = (record.sequence, record.emitter_chain_id);
                if let Dispatched::Queued(to_chain) = dispatcher.dispatch(record) {
                    info!(
                        sequence,
                        emitter_chain = emitter_chain.id(),
                        to_chain = to_chain.id(),
                        "resubmitted stale transfer"
                    );
                }
            }
        }

        info!("compensator stopped");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use error_stack::report;
    use serde_json::json;
    use tracing_test::traced_test;

    use super::*;
    use crate::dispatch::lanes;
    use crate::monitoring::test_utils::{disabled_client, monitoring_client};
    use crate::storage::test_utils::{record_with, EMITTER};
    use crate::storage::SqliteStorage;

    const HOUR: u32 = 60 * 60;

    fn now() -> u32 {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        u32::try_from(secs).unwrap()
    }

    fn emitters() -> Vec<EmitterFilter> {
        vec![EmitterFilter {
            chain: Chain::Ethereum,
            address: EMITTER.parse().unwrap(),
        }]
    }

    fn source(entries: Vec<Value>) -> MockPendingTransferSource {
        let mut source = MockPendingTransferSource::new();
        source
            .expect_fetch()
            .returning(move || Ok(entries.clone()));
        source
    }

    async fn store_with(records: Vec<VaaRecord>) -> DedupStore {
        let store = DedupStore::new(SqliteStorage::in_memory().unwrap());
        for record in records {
            assert!(store.upsert_vaa(record).await);
        }
        store
    }

    fn compensator(
        source: MockPendingTransferSource,
        store: DedupStore,
    ) -> Compensator<MockPendingTransferSource> {
        Compensator::new(
            source,
            store,
            emitters(),
            Duration::from_secs(24 * 60 * 60),
            disabled_client(),
        )
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = toml::from_str::<Config>(r#"interval = "0s""#).unwrap_err();
        assert!(err
            .to_string()
            .contains("reconciliation interval must be greater than zero"));

        let config: Config = toml::from_str(r#"interval = "5m""#).unwrap();
        assert_eq!(config.interval, Duration::from_secs(300));
        assert_eq!(toml::from_str::<Config>("").unwrap(), Config::default());
    }

    #[test]
    fn pending_transfer_sequence_can_be_number_or_string() {
        let from_number =
            PendingTransfer::try_from(json!({"srcWormholeChainId": 2, "sequence": 7})).unwrap();
        let from_string = PendingTransfer::try_from(
            json!({"srcWormholeChainId": 2, "sequence": "7", "dstWormholeChainId": 6}),
        )
        .unwrap();

        let expected = PendingTransfer {
            src_wormhole_chain_id: Chain::Ethereum,
            sequence: 7,
        };
        assert_eq!(from_number, expected);
        assert_eq!(from_string, expected);

        assert!(PendingTransfer::try_from(json!({"srcWormholeChainId": 2})).is_err());
        assert!(
            PendingTransfer::try_from(json!({"srcWormholeChainId": 2, "sequence": "abc"}))
                .is_err()
        );
    }

    #[tokio::test]
    async fn only_stale_vaas_are_unprocessed() {
        let store = store_with(vec![
            record_with(1, now().saturating_sub(25 * HOUR)),
            record_with(2, now().saturating_sub(HOUR)),
        ])
        .await;
        let source = source(vec![
            json!({"srcWormholeChainId": 2, "sequence": 1}),
            json!({"srcWormholeChainId": 2, "sequence": "2"}),
        ]);

        let unprocessed = compensator(source, store).find_unprocessed().await.unwrap();

        assert_eq!(unprocessed.len(), 1);
        assert_eq!(unprocessed[0].sequence, 1);
    }

    #[tokio::test]
    async fn redeemed_vaas_are_not_unprocessed() {
        let stale = record_with(1, now().saturating_sub(25 * HOUR));
        let store = store_with(vec![stale.clone()]).await;
        assert!(store.mark_redeemed(&stale.key()).await);

        let source = source(vec![json!({"srcWormholeChainId": 2, "sequence": 1})]);

        assert!(compensator(source, store)
            .find_unprocessed()
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn bad_entries_and_unknown_chains_do_not_abort_the_batch() {
        let store = store_with(vec![
            record_with(1, now().saturating_sub(25 * HOUR)),
            record_with(3, now().saturating_sub(48 * HOUR)),
        ])
        .await;
        let source = source(vec![
            json!({"srcWormholeChainId": 2, "sequence": 1}),
            json!({"sequence": 2}),
            json!("garbage"),
            json!({"srcWormholeChainId": 4, "sequence": 3}),
            json!({"srcWormholeChainId": 2, "sequence": 404}),
            json!({"srcWormholeChainId": 2, "sequence": 3}),
        ]);

        let unprocessed = compensator(source, store).find_unprocessed().await.unwrap();

        assert_eq!(
            unprocessed
                .iter()
                .map(|record| record.sequence)
                .collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert!(logs_contain("skipping pending transfer"));
    }

    #[tokio::test]
    async fn fetch_failure_fails_the_whole_pass() {
        let mut source = MockPendingTransferSource::new();
        source
            .expect_fetch()
            .returning(|| Err(report!(Error::Fetch)));

        let result = compensator(source, store_with(vec![]).await)
            .find_unprocessed()
            .await;

        assert!(matches!(
            result.unwrap_err().current_context(),
            Error::Fetch
        ));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn run_resubmits_stale_vaas_every_interval() {
        let store = store_with(vec![record_with(1, now().saturating_sub(25 * HOUR))]).await;

        let mut source = MockPendingTransferSource::new();
        let mut calls = 0;
        source.expect_fetch().returning(move || {
            calls += 1;
            match calls {
                1 => Err(report!(Error::Fetch)),
                _ => Ok(vec![json!({"srcWormholeChainId": 2, "sequence": 1})]),
            }
        });

        let (monitoring_client, mut metrics) = monitoring_client();
        let compensator = Compensator::new(
            source,
            store,
            emitters(),
            Duration::from_secs(24 * 60 * 60),
            monitoring_client,
        );
        let (handle, mut receivers) = lanes([Chain::Avalanche], 10, disabled_client());
        let token = CancellationToken::new();
        let running = tokio::spawn(compensator.run(
            handle,
            Duration::from_secs(60),
            token.clone(),
        ));

        let lane = receivers.get_mut(&Chain::Avalanche).unwrap();
        assert_eq!(lane.recv().await.unwrap().sequence, 1);
        assert_eq!(lane.recv().await.unwrap().sequence, 1);

        token.cancel();
        assert!(running.await.unwrap().is_ok());

        assert!(logs_contain("skipping reconciliation pass"));
        assert_eq!(
            metrics.recv().await.unwrap(),
            Msg::CompensationFound { count: 1 }
        );
    }

    #[tokio::test]
    async fn http_source_fails_on_unreachable_ledger() {
        let source = HttpPendingTransferSource::new(
            "http://127.0.0.1:1/pending".parse().unwrap(),
            Duration::from_millis(200),
        )
        .unwrap();

        assert!(matches!(
            source.fetch().await.unwrap_err().current_context(),
            Error::Fetch
        ));
    }
}
