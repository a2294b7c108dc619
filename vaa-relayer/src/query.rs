//! Read-only lookup service over the dedup store.
//!
//! Every request is a JSON `POST` of `{method, params}` on any path. Answers are plain text: a
//! JSON document for results, `null` for a missing record, or a short explanation when the
//! method or its parameters are not understood.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use error_stack::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use wormhole_vaa::{Address, Chain};

use crate::http::{self, Listen};
use crate::storage::{DedupStore, GasStats, DEFAULT_PAGE_SIZE};

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub enabled: bool,
    pub bind_address: SocketAddrV4,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5066),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Request {
    method: String,
    #[serde(default)]
    params: Vec<Value>,
}

const GET_SIGNED_VAA_USAGE: &str =
    "Required params: sequence [str], Optional params: chainid [number]";
const GET_SIGNED_VAA_BY_TO_USAGE: &str =
    "Required params: toChain [number], Optional params: to [string]";
const GET_DST_GAS_USAGE: &str = "Required params: chainId [number], dstSwapLength [number]";

#[derive(Debug, Serialize)]
struct DstGas {
    #[serde(rename = "VaaLength")]
    vaa_length: String,
    #[serde(rename = "EstimateGas")]
    estimate_gas: String,
    #[serde(rename = "EstimateGasPrice")]
    estimate_gas_price: String,
    #[serde(rename = "ActualGas")]
    actual_gas: String,
    #[serde(rename = "ActualGasPrice")]
    actual_gas_price: String,
}

impl From<GasStats> for DstGas {
    fn from(stats: GasStats) -> Self {
        Self {
            vaa_length: stats.avg_vaa_length.to_string(),
            estimate_gas: stats.avg_estimate_gas.to_string(),
            estimate_gas_price: stats.avg_estimate_gas_price.to_string(),
            actual_gas: stats.avg_actual_gas.to_string(),
            actual_gas_price: stats.avg_actual_gas_price.to_string(),
        }
    }
}

pub fn router(store: DedupStore) -> Router {
    Router::new()
        .fallback(post(handle))
        .with_state(store)
}

async fn handle(
    State(store): State<DedupStore>,
    request: std::result::Result<Json<Request>, JsonRejection>,
) -> String {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => {
            warn!(err = %rejection, "rejected query request");
            return format!("Invalid request: {}", rejection.body_text());
        }
    };

    info!(
        method = %request.method,
        params = ?request.params,
        "processing query request"
    );

    match request.method.as_str() {
        "GetSignedVAA" => get_signed_vaa(&store, &request.params).await,
        "GetSignedVAAByTo" => get_signed_vaa_by_to(&store, &request.params).await,
        "GetDstGas" => get_dst_gas(&store, &request.params).await,
        method => format!("Not found method: {method}"),
    }
}

async fn get_signed_vaa(store: &DedupStore, params: &[Value]) -> String {
    let Some(sequence) = params.first().and_then(as_u64) else {
        return GET_SIGNED_VAA_USAGE.to_string();
    };

    let (emitter_chain, emitter_address) = match params {
        [_] => (None, None),
        [_, chain] => (as_chain(chain), None),
        [_, chain, address, ..] => (as_chain(chain), as_address(address)),
        [] => return GET_SIGNED_VAA_USAGE.to_string(),
    };
    if params.len() > 1 && emitter_chain.is_none() {
        return GET_SIGNED_VAA_USAGE.to_string();
    }

    to_text(&store.find_vaa(sequence, emitter_chain, emitter_address).await)
}

async fn get_signed_vaa_by_to(store: &DedupStore, params: &[Value]) -> String {
    let Some(to_chain) = params.first().and_then(as_chain) else {
        return GET_SIGNED_VAA_BY_TO_USAGE.to_string();
    };
    let to = match params.get(1) {
        Some(to) => match as_address(to) {
            Some(to) => Some(to),
            None => return GET_SIGNED_VAA_BY_TO_USAGE.to_string(),
        },
        None => None,
    };

    to_text(
        &store
            .find_by_destination(to_chain, to, DEFAULT_PAGE_SIZE)
            .await,
    )
}

async fn get_dst_gas(store: &DedupStore, params: &[Value]) -> String {
    let [chain, dst_swap_length] = params else {
        return GET_DST_GAS_USAGE.to_string();
    };
    let (Some(chain), Some(dst_swap_length)) = (as_chain(chain), as_u64(dst_swap_length)) else {
        return GET_DST_GAS_USAGE.to_string();
    };

    match store.query_gas_stats(chain, dst_swap_length).await {
        Some(stats) => to_text(&DstGas::from(stats)),
        None => format!(
            "Not exist dst gas at chain {} for swap length {}",
            chain.id(),
            dst_swap_length
        ),
    }
}

fn to_text(value: &impl Serialize) -> String {
    serde_json::to_string(value).unwrap_or_else(|err| {
        warn!(err = %err, "failed to serialize query response");
        "null".to_string()
    })
}

/// Accepts both JSON numbers and decimal strings.
fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(string) => string.trim().parse().ok(),
        _ => None,
    }
}

fn as_chain(value: &Value) -> Option<Chain> {
    as_u64(value)
        .and_then(|id| u16::try_from(id).ok())
        .map(Chain::from)
}

fn as_address(value: &Value) -> Option<Address> {
    value
        .as_str()
        .and_then(|address| Address::from_str(address).ok())
}

pub struct Server {
    listen: Listen,
    store: DedupStore,
}

impl Server {
    pub fn new(listen: impl Into<Listen>, store: DedupStore) -> Self {
        Self {
            listen: listen.into(),
            store,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<(), http::Error> {
        http::serve("query", self.listen, router(self.store), cancel).await
    }
}
