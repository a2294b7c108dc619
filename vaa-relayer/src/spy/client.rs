use std::time::Duration;

use async_trait::async_trait;
use error_stack::{Result, ResultExt};
use futures::StreamExt;
use tonic::transport::Endpoint;
use tracing::info;

use super::proto::filter_entry::Filter;
use super::proto::spy_rpc_service_client::SpyRpcServiceClient;
use super::proto::{self, FilterEntry, SubscribeSignedVaaRequest};
use super::{EmitterFilter, Error, SpyClient, VaaStream};
use crate::url::Url;

impl From<EmitterFilter> for FilterEntry {
    fn from(filter: EmitterFilter) -> Self {
        FilterEntry {
            filter: Some(Filter::EmitterFilter(proto::EmitterFilter {
                chain_id: filter.chain.id().into(),
                emitter_address: hex::encode(filter.address.as_bytes()),
            })),
        }
    }
}

/// Spy client over gRPC. Every subscription uses a fresh connection, so a dead channel never
/// outlives the stream it served.
pub struct GrpcSpyClient {
    url: Url,
    connect_timeout: Duration,
}

impl GrpcSpyClient {
    pub fn new(url: Url, connect_timeout: Duration) -> Self {
        Self {
            url,
            connect_timeout,
        }
    }
}

#[async_trait]
impl SpyClient for GrpcSpyClient {
    async fn subscribe(&self, filters: Vec<EmitterFilter>) -> Result<VaaStream, Error> {
        let channel = Endpoint::from_shared(self.url.as_str().to_string())
            .change_context(Error::Connection)
            .attach_printable_lazy(|| self.url.clone())?
            .connect_timeout(self.connect_timeout)
            .connect()
            .await
            .change_context(Error::Connection)
            .attach_printable_lazy(|| self.url.clone())?;

        let request = SubscribeSignedVaaRequest {
            filters: filters.into_iter().map(FilterEntry::from).collect(),
        };

        let stream = SpyRpcServiceClient::new(channel)
            .subscribe_signed_vaa(request)
            .await
            .change_context(Error::Subscribe)?
            .into_inner();

        info!(url = %self.url, "subscribed to signed vaas");

        Ok(stream
            .map(|response| {
                response
                    .map(|response| response.vaa_bytes)
                    .change_context(Error::Stream)
            })
            .boxed())
    }
}
