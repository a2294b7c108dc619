use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::DispatchHandle;
use crate::monitoring;
use crate::monitoring::metrics::Msg;
use crate::spy::{EmitterFilter, SpyClient, VaaStream};
use crate::storage::{DedupStore, VaaRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Disconnected,
    Subscribing,
    Streaming,
}

/// Follows the spy feed forever: every VAA is decoded, stored and handed to its destination
/// lane. Losing the stream only costs a fixed cool-down before the next subscription.
pub struct Listener<S> {
    client: S,
    filters: Vec<EmitterFilter>,
    store: DedupStore,
    dispatcher: DispatchHandle,
    reconnect_delay: Duration,
    warm_up_vaa: Option<Vec<u8>>,
    monitoring_client: monitoring::Client,
    state: ListenerState,
}

impl<S> Listener<S>
where
    S: SpyClient,
{
    pub fn new(
        client: S,
        filters: Vec<EmitterFilter>,
        store: DedupStore,
        dispatcher: DispatchHandle,
        reconnect_delay: Duration,
        monitoring_client: monitoring::Client,
    ) -> Self {
        Self {
            client,
            filters,
            store,
            dispatcher,
            reconnect_delay,
            warm_up_vaa: None,
            monitoring_client,
            state: ListenerState::Disconnected,
        }
    }

    /// A known-good VAA that is decoded and stored once at startup, but never redeemed.
    pub fn with_warm_up_vaa(mut self, vaa: Vec<u8>) -> Self {
        self.warm_up_vaa = Some(vaa);
        self
    }

    /// Only returns once the token is cancelled.
    pub async fn run(mut self, token: CancellationToken) {
        if let Some(vaa) = self.warm_up_vaa.take() {
            info!("processing warm-up vaa");
            self.process(&vaa, false).await;
        }

        while !token.is_cancelled() {
            self.transition(ListenerState::Subscribing);
            let subscription = tokio::select! {
                _ = token.cancelled() => break,
                subscription = self.client.subscribe(self.filters.clone()) => subscription,
            };

            match subscription {
                Ok(stream) => {
                    self.transition(ListenerState::Streaming);
                    self.stream(stream, &token).await;
                }
                Err(err) => warn!(err = ?err, "failed to subscribe to the spy"),
            }

            self.transition(ListenerState::Disconnected);
            if token.is_cancelled() {
                break;
            }

            info!(
                delay = ?self.reconnect_delay,
                "waiting before subscribing to the spy again"
            );
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {},
            }
        }

        self.transition(ListenerState::Disconnected);
        info!("listener stopped");
    }

    fn transition(&mut self, state: ListenerState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "listener state changed");
            self.state = state;
        }
    }

    /// Returns once the stream fails, ends or the token is cancelled.
    async fn stream(&self, mut stream: VaaStream, token: &CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(vaa)) => self.process(&vaa, true).await,
                Some(Err(err)) => {
                    warn!(err = ?err, "spy stream failed");
                    return;
                }
                None => {
                    warn!("spy stream closed");
                    return;
                }
            }
        }
    }

    async fn process(&self, vaa: &[u8], dispatch: bool) {
        self.monitoring_client
            .metrics()
            .record_metric(Msg::VaaReceived);

        let record = match VaaRecord::from_signed_vaa(vaa) {
            Ok(record) => record,
            Err(err) => {
                warn!(err = %err, vaa = hex::encode(vaa), "dropping malformed vaa");
                return;
            }
        };

        info!(
            sequence = record.sequence,
            emitter_chain = record.emitter_chain_id.id(),
            emitter_address = %record.emitter_address,
            hash = %record.hash,
            "received vaa"
        );

        if self.store.upsert_vaa(record.clone()).await {
            self.monitoring_client
                .metrics()
                .record_metric(Msg::VaaStored);
        }

        if dispatch {
            self.dispatcher.dispatch(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use error_stack::report;
    use futures::stream;
    use tokio::sync::mpsc;
    use tokio::time::Instant;
    use tracing_test::traced_test;
    use wormhole_vaa::Chain;

    use super::*;
    use crate::dispatch::{lanes, LaneReceivers};
    use crate::monitoring::test_utils::{disabled_client, monitoring_client};
    use crate::spy::{Error as SpyError, MockSpyClient};
    use crate::storage::test_utils::{transfer_record, transfer_vaa_bytes, EMITTER};
    use crate::storage::SqliteStorage;

    fn vaa_with_sequence(sequence: u64) -> Vec<u8> {
        let mut vaa = wormhole_vaa::Vaa::parse(&transfer_vaa_bytes()).unwrap();
        vaa.sequence = sequence;
        vaa.serialize()
    }

    fn filters() -> Vec<EmitterFilter> {
        vec![EmitterFilter {
            chain: Chain::Ethereum,
            address: EMITTER.parse().unwrap(),
        }]
    }

    fn listener(
        client: MockSpyClient,
        store: DedupStore,
    ) -> (Listener<MockSpyClient>, LaneReceivers) {
        let (handle, receivers) = lanes([Chain::Avalanche], 10, disabled_client());
        let listener = Listener::new(
            client,
            filters(),
            store,
            handle,
            Duration::from_secs(5),
            disabled_client(),
        );

        (listener, receivers)
    }

    async fn next_sequence(receivers: &mut LaneReceivers) -> u64 {
        receivers
            .get_mut(&Chain::Avalanche)
            .unwrap()
            .recv()
            .await
            .unwrap()
            .sequence
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribes_after_cool_down_and_keeps_stored_vaas() {
        let subscribed_at = Arc::new(Mutex::new(vec![]));
        let times = subscribed_at.clone();

        let mut client = MockSpyClient::new();
        client
            .expect_subscribe()
            .withf(|filters| *filters == self::filters())
            .returning(move |_| {
                let mut times = times.lock().unwrap();
                times.push(Instant::now());

                let stream: VaaStream = match times.len() {
                    1 => stream::iter(vec![
                        Ok(vaa_with_sequence(1)),
                        Err(report!(SpyError::Stream)),
                    ])
                    .boxed(),
                    2 => stream::iter(vec![Ok(vaa_with_sequence(2))]).boxed(),
                    _ => stream::pending().boxed(),
                };
                Ok(stream)
            });

        let store = DedupStore::new(SqliteStorage::in_memory().unwrap());
        let (listener, mut receivers) = listener(client, store.clone());
        let token = CancellationToken::new();
        let running = tokio::spawn(listener.run(token.clone()));

        assert_eq!(next_sequence(&mut receivers).await, 1);
        assert_eq!(next_sequence(&mut receivers).await, 2);

        // the second stream ended on its own, so a third subscription follows
        while subscribed_at.lock().unwrap().len() < 3 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        token.cancel();
        running.await.unwrap();

        let times = subscribed_at.lock().unwrap().clone();
        assert!(times[1].duration_since(times[0]) >= Duration::from_secs(5));
        assert!(times[2].duration_since(times[1]) >= Duration::from_secs(5));

        assert!(store.find_vaa(1, None, None).await.is_some());
        assert!(store.find_vaa(2, None, None).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn subscription_failures_are_retried_forever() {
        let attempts = Arc::new(Mutex::new(0u32));
        let counter = attempts.clone();

        let mut client = MockSpyClient::new();
        client.expect_subscribe().returning(move |_| {
            *counter.lock().unwrap() += 1;
            Err(report!(SpyError::Connection))
        });

        let store = DedupStore::new(SqliteStorage::in_memory().unwrap());
        let (listener, _receivers) = listener(client, store);
        let token = CancellationToken::new();
        let running = tokio::spawn(listener.run(token.clone()));

        let start = Instant::now();
        while *attempts.lock().unwrap() < 4 {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert!(start.elapsed() >= Duration::from_secs(15));

        token.cancel();
        running.await.unwrap();
        assert!(logs_contain("failed to subscribe to the spy"));
    }

    #[tokio::test]
    #[traced_test]
    async fn malformed_vaas_are_dropped_without_breaking_the_stream() {
        let mut client = MockSpyClient::new();
        client.expect_subscribe().returning(|_| {
            Ok(stream::iter(vec![Ok(vec![1, 2, 3]), Ok(transfer_vaa_bytes())])
                .chain(stream::pending())
                .boxed())
        });

        let (monitoring_client, mut metrics) = monitoring_client();
        let store = DedupStore::new(SqliteStorage::in_memory().unwrap());
        let (handle, mut receivers) = lanes([Chain::Avalanche], 10, disabled_client());
        let listener = Listener::new(
            client,
            filters(),
            store.clone(),
            handle,
            Duration::from_secs(5),
            monitoring_client,
        );
        let token = CancellationToken::new();
        let running = tokio::spawn(listener.run(token.clone()));

        assert_eq!(next_sequence(&mut receivers).await, 2337);
        token.cancel();
        running.await.unwrap();

        assert!(logs_contain("dropping malformed vaa"));
        assert_eq!(
            store.find_vaa(2337, None, None).await,
            Some(transfer_record())
        );

        let mut recorded = vec![];
        while let Ok(msg) = metrics.try_recv() {
            recorded.push(msg);
        }
        assert_eq!(
            recorded,
            vec![Msg::VaaReceived, Msg::VaaReceived, Msg::VaaStored]
        );
    }

    #[tokio::test]
    async fn warm_up_vaa_is_stored_but_not_dispatched() {
        let mut client = MockSpyClient::new();
        client
            .expect_subscribe()
            .returning(|_| Ok(stream::pending().boxed()));

        let store = DedupStore::new(SqliteStorage::in_memory().unwrap());
        let (listener, mut receivers) = listener(client, store.clone());
        let token = CancellationToken::new();
        let running = tokio::spawn(
            listener
                .with_warm_up_vaa(transfer_vaa_bytes())
                .run(token.clone()),
        );

        while store.find_vaa(2337, None, None).await.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        token.cancel();
        running.await.unwrap();

        let lane = receivers.get_mut(&Chain::Avalanche).unwrap();
        assert!(matches!(
            lane.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));
    }
}
