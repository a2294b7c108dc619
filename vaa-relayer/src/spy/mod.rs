//! Subscription to the guardian spy, the feed of signed VAAs.

use std::time::Duration;

use async_trait::async_trait;
use error_stack::Result;
use futures::stream::BoxStream;
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use wormhole_vaa::{Address, Chain};

use crate::url::Url;

mod client;

pub use client::GrpcSpyClient;

#[allow(clippy::all)]
mod proto {
    tonic::include_proto!("spy.v1");
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to connect to the spy")]
    Connection,
    #[error("failed to subscribe to signed vaas")]
    Subscribe,
    #[error("spy stream failed")]
    Stream,
}

/// Raw signed VAAs in the order the spy delivers them.
pub type VaaStream = BoxStream<'static, Result<Vec<u8>, Error>>;

/// A source chain contract whose VAAs this relayer cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct EmitterFilter {
    pub chain: Chain,
    pub address: Address,
}

#[automock]
#[async_trait]
pub trait SpyClient {
    /// Opens a new stream, the spy only sends VAAs matching one of the filters.
    async fn subscribe(&self, filters: Vec<EmitterFilter>) -> Result<VaaStream, Error>;
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub url: Url,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// cool-down between losing the stream and subscribing again
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    /// hex encoded VAA pushed through decoding and storage once at startup
    pub warm_up_vaa: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: "http://localhost:7073"
                .parse()
                .expect("default spy url should be valid"),
            connect_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
            warm_up_vaa: None,
        }
    }
}
