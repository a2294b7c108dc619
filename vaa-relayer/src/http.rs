//! Plumbing shared by the relayer's HTTP surfaces.

use std::net::{SocketAddr, SocketAddrV4};

use axum::Router;
use error_stack::{Result, ResultExt};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to bind {0} server")]
    Bind(&'static str),
    #[error("{0} server failed while running")]
    WhileRunning(&'static str),
}

/// Where a server listens: an address bound at startup, or a listener bound by the caller.
pub enum Listen {
    Address(SocketAddr),
    Bound(TcpListener),
}

impl Listen {
    async fn bind(self, server: &'static str) -> Result<TcpListener, Error> {
        match self {
            Listen::Address(address) => TcpListener::bind(address)
                .await
                .change_context(Error::Bind(server))
                .attach_printable(address),
            Listen::Bound(listener) => Ok(listener),
        }
    }
}

impl From<SocketAddrV4> for Listen {
    fn from(address: SocketAddrV4) -> Self {
        Listen::Address(address.into())
    }
}

impl From<TcpListener> for Listen {
    fn from(listener: TcpListener) -> Self {
        Listen::Bound(listener)
    }
}

/// Serves `router` until `cancel` fires, then drains in-flight requests.
pub async fn serve(
    server: &'static str,
    listen: Listen,
    router: Router,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let listener = listen.bind(server).await?;
    info!(server, address = ?listener.local_addr().ok(), "http server started");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            info!(server, "http server shutting down");
        })
        .await
        .change_context(Error::WhileRunning(server))
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use axum::routing::get;

    use super::*;

    #[tokio::test]
    async fn bind_fails_on_a_taken_address() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let SocketAddr::V4(address) = taken.local_addr().unwrap() else {
            panic!("expected an ipv4 address");
        };

        let err = serve("test", address.into(), Router::new(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err.current_context(), Error::Bind("test")));
    }

    #[tokio::test]
    async fn serves_until_cancelled() {
        let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let address = listener.local_addr().unwrap();
        let router = Router::new().route("/ping", get(|| async { "pong" }));

        let cancel = CancellationToken::new();
        let running = tokio::spawn(serve("test", listener.into(), router, cancel.clone()));

        let url = format!("http://{address}/ping");
        assert_eq!(reqwest::get(&url).await.unwrap().text().await.unwrap(), "pong");

        cancel.cancel();
        assert!(running.await.unwrap().is_ok());
        assert!(reqwest::get(&url).await.unwrap_err().is_connect());
    }
}
