use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, MethodRouter};
use futures::StreamExt;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use wormhole_vaa::Chain;

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RedemptionOutcome {
    AlreadyRedeemed,
    NotRedeemed,
    Redeemed,
    Failed,
}

impl Display for RedemptionOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RedemptionOutcome::AlreadyRedeemed => "already_redeemed",
            RedemptionOutcome::NotRedeemed => "not_redeemed",
            RedemptionOutcome::Redeemed => "redeemed",
            RedemptionOutcome::Failed => "failed",
        })
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum Msg {
    /// A message arrived on the spy stream, before any decoding
    VaaReceived,
    /// A decoded VAA was persisted
    VaaStored,
    RedemptionAttempt {
        chain: Chain,
        outcome: RedemptionOutcome,
    },
    /// The destination lane was full and the VAA was left for reconciliation
    DispatchDropped { chain: Chain },
    /// Number of stale, unredeemed VAAs found in one reconciliation pass
    CompensationFound { count: u64 },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    MetricsEncoding(#[from] fmt::Error),
    #[error(transparent)]
    HttpResponse(#[from] axum::http::Error),
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

#[derive(Clone, Debug)]
pub enum Client {
    WithChannel { sender: mpsc::Sender<Msg> },
    Disabled,
}

impl Client {
    /// Never blocks. A full or closed channel only results in a warning.
    pub fn record_metric(&self, msg: Msg) {
        match self {
            Client::Disabled => (),
            Client::WithChannel { sender } => {
                if let Err(err) = sender.try_send(msg) {
                    warn!(err = %err, "failed to record metrics");
                }
            }
        }
    }
}

pub fn create_endpoint(channel_size: usize) -> (MethodRouter, Process, Client) {
    let (tx, rx) = mpsc::channel(channel_size);

    let mut registry = <Registry>::default();
    let metrics = Metrics::new(&mut registry);

    (
        get(serve_metrics).with_state(Arc::new(registry)),
        Process::new(rx, metrics),
        Client::WithChannel { sender: tx },
    )
}

/// Applies recorded messages to the registry in the background.
pub struct Process {
    stream: ReceiverStream<Msg>,
    metrics: Metrics,
}

impl Process {
    fn new(metrics_rx: mpsc::Receiver<Msg>, metrics: Metrics) -> Self {
        Self {
            stream: ReceiverStream::new(metrics_rx),
            metrics,
        }
    }

    /// Stops on cancellation or once every client is dropped.
    pub fn run(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let stream = self.stream.take_until(cancel.cancelled());

            tokio::pin!(stream);
            while let Some(msg) = stream.next().await {
                self.metrics.handle_message(msg);
            }

            if !cancel.is_cancelled() {
                warn!("all metrics clients disconnected, metrics processing stopped");
            }
        })
    }
}

async fn serve_metrics(State(registry): State<Arc<Registry>>) -> Result<Response<Body>, Error> {
    let mut buffer = String::new();
    encode(&mut buffer, &registry)?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)
        .body(Body::from(buffer))?)
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ChainLabel {
    chain: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RedemptionLabel {
    chain: String,
    /// already_redeemed, not_redeemed, redeemed or failed
    outcome: String,
}

struct Metrics {
    vaa_received: Counter,
    vaa_stored: Counter,
    redemption_attempts: Family<RedemptionLabel, Counter>,
    dispatch_dropped: Family<ChainLabel, Counter>,
    compensation_found: Counter,
}

impl Metrics {
    fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            vaa_received: Counter::default(),
            vaa_stored: Counter::default(),
            redemption_attempts: Family::default(),
            dispatch_dropped: Family::default(),
            compensation_found: Counter::default(),
        };

        registry.register(
            "vaa_received",
            "number of messages received from the spy",
            metrics.vaa_received.clone(),
        );
        registry.register(
            "vaa_stored",
            "number of decoded VAAs written to storage",
            metrics.vaa_stored.clone(),
        );
        registry.register(
            "redemption_attempts",
            "number of redemption attempts by destination chain and outcome",
            metrics.redemption_attempts.clone(),
        );
        registry.register(
            "dispatch_dropped",
            "number of VAAs dropped because the destination lane was full",
            metrics.dispatch_dropped.clone(),
        );
        registry.register(
            "compensation_found",
            "number of stale unredeemed VAAs found by reconciliation",
            metrics.compensation_found.clone(),
        );

        metrics
    }

    fn handle_message(&self, msg: Msg) {
        match msg {
            Msg::VaaReceived => {
                self.vaa_received.inc();
            }
            Msg::VaaStored => {
                self.vaa_stored.inc();
            }
            Msg::RedemptionAttempt { chain, outcome } => {
                self.redemption_attempts
                    .get_or_create(&RedemptionLabel {
                        chain: chain.to_string(),
                        outcome: outcome.to_string(),
                    })
                    .inc();
            }
            Msg::DispatchDropped { chain } => {
                self.dispatch_dropped
                    .get_or_create(&ChainLabel {
                        chain: chain.to_string(),
                    })
                    .inc();
            }
            Msg::CompensationFound { count } => {
                self.compensation_found.inc_by(count);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum_test::TestServer;
    use tokio::time::{sleep, Duration};

    use super::*;

    async fn scrape(server: &TestServer) -> String {
        let response = server.get("/metrics").await;
        response.assert_status_ok();
        assert_eq!(
            response.header(CONTENT_TYPE).to_str().unwrap(),
            OPENMETRICS_CONTENT_TYPE
        );

        response.text()
    }

    #[tokio::test]
    async fn recorded_messages_show_up_in_the_scrape() {
        let (router, process, client) = create_endpoint(100);
        let cancel = CancellationToken::new();
        let handle = process.run(cancel.clone());
        let server = TestServer::new(Router::new().route("/metrics", router)).unwrap();

        client.record_metric(Msg::VaaReceived);
        client.record_metric(Msg::VaaReceived);
        client.record_metric(Msg::VaaStored);
        client.record_metric(Msg::RedemptionAttempt {
            chain: Chain::Polygon,
            outcome: RedemptionOutcome::AlreadyRedeemed,
        });
        client.record_metric(Msg::DispatchDropped { chain: Chain::Bsc });
        client.record_metric(Msg::CompensationFound { count: 4 });

        sleep(Duration::from_millis(100)).await;
        let text = scrape(&server).await;

        assert!(text.contains("vaa_received_total 2"));
        assert!(text.contains("vaa_stored_total 1"));
        assert!(text.contains(
            r#"redemption_attempts_total{chain="Polygon",outcome="already_redeemed"} 1"#
        ));
        assert!(text.contains(r#"dispatch_dropped_total{chain="Bsc"} 1"#));
        assert!(text.contains("compensation_found_total 4"));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn disabled_client_discards_messages() {
        Client::Disabled.record_metric(Msg::VaaReceived);
    }
}
