use std::net::{Ipv4Addr, SocketAddrV4};

use axum::Router;
use error_stack::Result;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::http::{self, Listen};
use crate::monitoring::endpoints::status;
use crate::monitoring::metrics;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub enabled: bool,
    pub bind_address: SocketAddrV4,
    /// metrics recorded faster than the registry applies them are dropped beyond this
    pub channel_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 3000),
            channel_size: 1000,
        }
    }
}

/// Handed to every component that reports metrics.
#[derive(Clone, Debug)]
pub struct Client {
    metrics_client: metrics::Client,
}

impl Client {
    /// For one-shot commands that run without a monitoring server.
    pub fn disabled() -> Self {
        Self {
            metrics_client: metrics::Client::Disabled,
        }
    }

    pub fn metrics(&self) -> &metrics::Client {
        &self.metrics_client
    }
}

/// Serves `/status` and `/metrics`. A disabled server only waits to be cancelled.
pub struct Server {
    enabled: Option<(Listen, Router, metrics::Process)>,
}

impl Server {
    pub fn new(config: Config) -> (Server, Client) {
        if !config.enabled {
            info!("monitoring server is disabled");
            return (Server { enabled: None }, Client::disabled());
        }

        Self::listening(config.bind_address.into(), config.channel_size)
    }

    fn listening(listen: Listen, channel_size: usize) -> (Server, Client) {
        let (metrics_router, metrics_process, metrics_client) =
            metrics::create_endpoint(channel_size);
        let router = Router::new()
            .route("/status", status::create_endpoint())
            .route("/metrics", metrics_router);

        (
            Server {
                enabled: Some((listen, router, metrics_process)),
            },
            Client { metrics_client },
        )
    }

    /// Binds to a listener the caller already owns.
    pub fn with_listener(listener: TcpListener, channel_size: usize) -> (Server, Client) {
        Self::listening(listener.into(), channel_size)
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<(), http::Error> {
        let Some((listen, router, metrics_process)) = self.enabled else {
            cancel.cancelled().await;
            return Ok(());
        };

        let metrics_handle = metrics_process.run(cancel.clone());
        let result = http::serve("monitoring", listen, router, cancel.clone()).await;

        // the registry process must not outlive the server
        cancel.cancel();
        _ = metrics_handle.await;

        result
    }
}
