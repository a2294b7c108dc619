//! Redemption of transfer VAAs on their destination chain.
//!
//! Every attempt asks the destination token bridge first whether the transfer was already
//! completed, which makes redelivered VAAs, reconciliation resubmissions and concurrent
//! relayers harmless. Only then are fees resolved and the redemption submitted.

use std::collections::HashMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::time::Duration;

use async_trait::async_trait;
use error_stack::{report, Result, ResultExt};
use ethers_core::types::{H160, H256, U256};
use mockall::automock;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use wormhole_vaa::{Address, Chain, Payload, Vaa, WormholePayload};

use crate::monitoring;
use crate::monitoring::metrics::{Msg, RedemptionOutcome};
use crate::storage::{DedupStore, DstGasRecord};
use crate::url::Url;

mod evm;
mod fees;

pub use evm::EvmConnector;
pub use fees::{FeeData, FeePolicy, TxOverrides};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("no configuration for destination chain {0}")]
    UnsupportedChain(Chain),
    #[error("invalid vaa")]
    InvalidVaa,
    #[error("failed to connect to the destination chain")]
    Connection,
    #[error("failed to check whether the transfer was completed")]
    IdempotencyCheck,
    #[error("failed to fetch fee data")]
    FeeData,
    #[error("failed to submit the redemption")]
    Submission,
    #[error("failed to get the redemption receipt")]
    Receipt,
}

/// Hex encoded secp256k1 key of the relayer account. Never printed or serialized.
#[derive(Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(transparent)]
pub struct PrivateKey(String);

impl PrivateKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Debug for PrivateKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl Serialize for PrivateKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str("[REDACTED]")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Standard,
    /// Celo nodes reject typed transactions, redemptions are sent as legacy transactions
    Celo,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChainConfig {
    pub chain: Chain,
    pub name: String,
    #[serde(deserialize_with = "Url::deserialize_sensitive")]
    pub rpc_url: Url,
    #[serde(with = "humantime_serde", default = "default_rpc_timeout")]
    pub rpc_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_receipt_timeout")]
    pub receipt_timeout: Duration,
    pub token_bridge: H160,
    /// the omniswap contract that receives transfers with payload on this chain
    pub redeem_contract: H160,
    #[serde(default)]
    pub fee_policy: Option<FeePolicy>,
    #[serde(default)]
    pub provider: Option<ProviderKind>,
}

fn default_rpc_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_receipt_timeout() -> Duration {
    Duration::from_secs(120)
}

impl ChainConfig {
    pub fn fee_policy(&self) -> FeePolicy {
        self.fee_policy
            .unwrap_or_else(|| FeePolicy::for_chain(self.chain))
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider.unwrap_or(match self.chain {
            Chain::Celo => ProviderKind::Celo,
            _ => ProviderKind::Standard,
        })
    }
}

/// What the redemption cost, as reported by the mined transaction's receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedemptionReceipt {
    pub tx_hash: H256,
    pub block_number: Option<u64>,
    pub gas_used: U256,
    pub effective_gas_price: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeemOutcome {
    AlreadyRedeemed,
    /// only returned for check-only requests
    NotRedeemed,
    Redeemed(RedemptionReceipt),
}

impl RedeemOutcome {
    pub fn is_redeemed(&self) -> bool {
        !matches!(self, RedeemOutcome::NotRedeemed)
    }
}

impl Display for RedeemOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RedeemOutcome::AlreadyRedeemed => f.write_str("already redeemed"),
            RedeemOutcome::NotRedeemed => f.write_str("not redeemed"),
            RedeemOutcome::Redeemed(receipt) => write!(f, "redeemed in {:?}", receipt.tx_hash),
        }
    }
}

impl From<&RedeemOutcome> for RedemptionOutcome {
    fn from(outcome: &RedeemOutcome) -> Self {
        match outcome {
            RedeemOutcome::AlreadyRedeemed => RedemptionOutcome::AlreadyRedeemed,
            RedeemOutcome::NotRedeemed => RedemptionOutcome::NotRedeemed,
            RedeemOutcome::Redeemed(_) => RedemptionOutcome::Redeemed,
        }
    }
}

/// Token bridge and redeem contract of one destination chain, bound to a signer.
#[automock]
#[async_trait]
pub trait BridgeClient {
    async fn is_transfer_completed(&self, signed_vaa: &[u8]) -> Result<bool, Error>;

    async fn fee_data(&self) -> Result<FeeData, Error>;

    async fn gas_price(&self) -> Result<U256, Error>;

    /// Submits the redemption and waits for it to be mined.
    async fn complete_transfer(
        &self,
        signed_vaa: &[u8],
        unwrap_native: bool,
        overrides: TxOverrides,
    ) -> Result<RedemptionReceipt, Error>;
}

#[automock]
#[async_trait]
pub trait BridgeConnector {
    /// Builds a client with a fresh signer. Called once per redemption attempt.
    async fn connect(
        &self,
        chain: &ChainConfig,
        private_key: &PrivateKey,
    ) -> Result<Box<dyn BridgeClient + Send + Sync>, Error>;
}

/// Gas the sender prepaid for the destination leg. Zero for anything but omniswap transfers.
#[derive(Debug, Default, PartialEq, Eq)]
struct GasEstimate {
    estimate_gas: U256,
    estimate_gas_price: U256,
    dst_swap_length: u64,
}

impl GasEstimate {
    fn from_payload(payload: &Payload) -> Self {
        let Payload::TransferWithPayload(transfer) = payload else {
            return GasEstimate::default();
        };

        match WormholePayload::decode(&transfer.payload) {
            Ok(omniswap) => GasEstimate {
                estimate_gas: omniswap.dst_max_gas,
                estimate_gas_price: omniswap.dst_max_gas_price,
                dst_swap_length: u64::try_from(omniswap.dst_swap_data.len())
                    .unwrap_or(u64::MAX),
            },
            Err(err) => {
                debug!(err = %err, "transfer payload carries no gas estimate");
                GasEstimate::default()
            }
        }
    }
}

pub struct RedemptionEngine<C> {
    connector: C,
    chains: HashMap<Chain, ChainConfig>,
    private_key: PrivateKey,
    store: DedupStore,
    monitoring_client: monitoring::Client,
}

impl<C> RedemptionEngine<C>
where
    C: BridgeConnector,
{
    pub fn new(
        connector: C,
        chains: impl IntoIterator<Item = ChainConfig>,
        private_key: PrivateKey,
        store: DedupStore,
        monitoring_client: monitoring::Client,
    ) -> Self {
        Self {
            connector,
            chains: chains
                .into_iter()
                .map(|config| (config.chain, config))
                .collect(),
            private_key,
            store,
            monitoring_client,
        }
    }

    /// Destination chains this engine can redeem on.
    pub fn chains(&self) -> impl Iterator<Item = Chain> + '_ {
        self.chains.keys().copied()
    }

    pub async fn redeem(
        &self,
        chain: Chain,
        signed_vaa: &[u8],
        unwrap_native: bool,
        check_only: bool,
    ) -> Result<RedeemOutcome, Error> {
        let vaa = Vaa::parse(signed_vaa).change_context(Error::InvalidVaa)?;
        let span = info_span!(
            "redeem",
            chain_id = chain.id(),
            sequence = vaa.sequence,
            emitter_chain = vaa.emitter_chain.id(),
            emitter_address = %vaa.emitter_address,
        );

        let result = self
            .try_redeem(chain, &vaa, signed_vaa, unwrap_native, check_only)
            .instrument(span)
            .await;

        let outcome = match &result {
            Ok(outcome) => outcome.into(),
            Err(_) => RedemptionOutcome::Failed,
        };
        self.monitoring_client
            .metrics()
            .record_metric(Msg::RedemptionAttempt { chain, outcome });

        result
    }

    async fn try_redeem(
        &self,
        chain: Chain,
        vaa: &Vaa,
        signed_vaa: &[u8],
        unwrap_native: bool,
        check_only: bool,
    ) -> Result<RedeemOutcome, Error> {
        let config = self
            .chains
            .get(&chain)
            .ok_or_else(|| report!(Error::UnsupportedChain(chain)))?;

        let client = self
            .connector
            .connect(config, &self.private_key)
            .await
            .attach_printable_lazy(|| config.name.clone())?;

        if client.is_transfer_completed(signed_vaa).await? {
            info!("transfer already redeemed");
            return Ok(RedeemOutcome::AlreadyRedeemed);
        }

        if check_only {
            info!("transfer not redeemed");
            return Ok(RedeemOutcome::NotRedeemed);
        }

        let overrides = config.fee_policy().overrides(client.as_ref()).await?;

        let payload = Payload::decode(&vaa.payload);
        let estimate = GasEstimate::from_payload(&payload);
        cross_check(config, &payload);

        let receipt = client
            .complete_transfer(signed_vaa, unwrap_native, overrides)
            .await?;
        info!(
            tx_hash = ?receipt.tx_hash,
            gas_used = %receipt.gas_used,
            "redeemed transfer"
        );

        self.store
            .record_gas(DstGasRecord {
                chain_id: chain,
                vaa_length: u64::try_from(signed_vaa.len()).unwrap_or(u64::MAX),
                dst_swap_length: estimate.dst_swap_length,
                estimate_gas: estimate.estimate_gas,
                estimate_gas_price: estimate.estimate_gas_price,
                actual_gas: receipt.gas_used,
                actual_gas_price: receipt.effective_gas_price,
            })
            .await;

        Ok(RedeemOutcome::Redeemed(receipt))
    }
}

/// Mismatches may come from third-party integrations using the same emitter, so they are only
/// reported.
fn cross_check(config: &ChainConfig, payload: &Payload) {
    if let Some(to_chain) = payload.to_chain() {
        if to_chain != config.chain {
            warn!(to_chain = to_chain.id(), "transfer is destined to another chain");
        }
    }

    if let Some(to) = payload.to() {
        let redeem_contract = Address::from(config.redeem_contract.0);
        if to != redeem_contract {
            warn!(
                to = %to,
                redeem_contract = %redeem_contract,
                "transfer recipient is not the redeem contract"
            );
        }
    }
}
