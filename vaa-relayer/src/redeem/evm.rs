use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::{report, Result, ResultExt};
use ethers_contract::abigen;
use ethers_core::types::transaction::eip2718::TypedTransaction;
use ethers_core::types::{Bytes, U256};
use ethers_middleware::SignerMiddleware;
use ethers_providers::{Http, Middleware, Provider};
use ethers_signers::LocalWallet;
use tokio::time::timeout;
use tracing::info;
use wormhole_vaa::Vaa;

use super::{
    BridgeClient, BridgeConnector, ChainConfig, Error, FeeData, PrivateKey, ProviderKind,
    RedemptionReceipt, TxOverrides,
};

abigen!(
    TokenBridge,
    r#"[
        function isTransferCompleted(bytes32 hash) external view returns (bool)
    ]"#
);

abigen!(
    SoDiamond,
    r#"[
        function completeTransferWithPayload(bytes encodeVm) external
        function completeTransferAndUnwrapETHWithPayload(bytes encodeVm) external
    ]"#
);

type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Connects to EVM destination chains over JSON-RPC.
pub struct EvmConnector;

#[async_trait]
impl BridgeConnector for EvmConnector {
    async fn connect(
        &self,
        chain: &ChainConfig,
        private_key: &PrivateKey,
    ) -> Result<Box<dyn BridgeClient + Send + Sync>, Error> {
        let http_client = reqwest::Client::builder()
            .timeout(chain.rpc_timeout)
            .build()
            .change_context(Error::Connection)?;
        let provider = Provider::new(Http::new_with_client(
            (*chain.rpc_url).clone(),
            http_client,
        ));

        let wallet: LocalWallet = private_key
            .expose()
            .parse::<LocalWallet>()
            .change_context(Error::Connection)
            .attach_printable("invalid private key")?;

        let client = SignerMiddleware::new_with_provider_chain(provider, wallet)
            .await
            .change_context(Error::Connection)
            .attach_printable_lazy(|| chain.rpc_url.clone())?;
        info!(
            chain_id = chain.chain.id(),
            signer = ?client.address(),
            "connected to destination chain"
        );

        let client = Arc::new(client);
        Ok(Box::new(EvmBridgeClient {
            token_bridge: TokenBridge::new(chain.token_bridge, client.clone()),
            redeem_contract: SoDiamond::new(chain.redeem_contract, client.clone()),
            client,
            legacy: chain.provider() == ProviderKind::Celo,
            receipt_timeout: chain.receipt_timeout,
        }))
    }
}

struct EvmBridgeClient {
    client: Arc<SignerClient>,
    token_bridge: TokenBridge<SignerClient>,
    redeem_contract: SoDiamond<SignerClient>,
    legacy: bool,
    receipt_timeout: Duration,
}

#[async_trait]
impl BridgeClient for EvmBridgeClient {
    async fn is_transfer_completed(&self, signed_vaa: &[u8]) -> Result<bool, Error> {
        let digest = Vaa::parse(signed_vaa)
            .change_context(Error::IdempotencyCheck)?
            .digest();

        self.token_bridge
            .is_transfer_completed(digest)
            .call()
            .await
            .change_context(Error::IdempotencyCheck)
    }

    async fn fee_data(&self) -> Result<FeeData, Error> {
        let (max_fee_per_gas, max_priority_fee_per_gas) = self
            .client
            .estimate_eip1559_fees(None)
            .await
            .change_context(Error::FeeData)?;

        Ok(FeeData {
            max_fee_per_gas: Some(max_fee_per_gas),
            max_priority_fee_per_gas: Some(max_priority_fee_per_gas),
        })
    }

    async fn gas_price(&self) -> Result<U256, Error> {
        self.client
            .get_gas_price()
            .await
            .change_context(Error::FeeData)
    }

    async fn complete_transfer(
        &self,
        signed_vaa: &[u8],
        unwrap_native: bool,
        overrides: TxOverrides,
    ) -> Result<RedemptionReceipt, Error> {
        let encoded_vm = Bytes::from(signed_vaa.to_vec());
        let mut call = match unwrap_native {
            true => self
                .redeem_contract
                .complete_transfer_and_unwrap_eth_with_payload(encoded_vm),
            false => self.redeem_contract.complete_transfer_with_payload(encoded_vm),
        };

        if self.legacy || overrides.gas_price.is_some() {
            call = call.legacy();
        }
        if let Some(gas_price) = overrides.gas_price {
            call = call.gas_price(gas_price);
        }
        if let TypedTransaction::Eip1559(tx) = &mut call.tx {
            if overrides.max_fee_per_gas.is_some() {
                tx.max_fee_per_gas = overrides.max_fee_per_gas;
            }
            if overrides.max_priority_fee_per_gas.is_some() {
                tx.max_priority_fee_per_gas = overrides.max_priority_fee_per_gas;
            }
        }

        let pending = call.send().await.change_context(Error::Submission)?;
        let tx_hash = pending.tx_hash();
        info!(tx_hash = ?tx_hash, "submitted redemption");

        let receipt = timeout(self.receipt_timeout, pending)
            .await
            .change_context(Error::Receipt)
            .attach_printable_lazy(|| format!("no receipt for {tx_hash:?} in time"))?
            .change_context(Error::Receipt)?
            .ok_or_else(|| report!(Error::Receipt))
            .attach_printable_lazy(|| format!("{tx_hash:?} was dropped from the mempool"))?;

        Ok(RedemptionReceipt {
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number.map(|number| number.as_u64()),
            gas_used: receipt.gas_used.unwrap_or_default(),
            effective_gas_price: receipt
                .effective_gas_price
                .or(overrides.gas_price)
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use wormhole_vaa::Chain;

    use super::*;
    use crate::redeem::test_utils::chain_config;

    #[tokio::test]
    async fn invalid_private_key_fails_before_any_rpc_call() {
        let result = EvmConnector
            .connect(&chain_config(Chain::Bsc), &PrivateKey::new("not a key"))
            .await;

        match result {
            Err(err) => assert_eq!(err.current_context(), &Error::Connection),
            Ok(_) => panic!("connecting with an invalid key should fail"),
        }
    }

    #[tokio::test]
    async fn unreachable_rpc_fails_to_connect() {
        let config = ChainConfig {
            rpc_url: crate::url::Url::new_sensitive("http://127.0.0.1:1").unwrap(),
            rpc_timeout: Duration::from_millis(200),
            ..chain_config(Chain::Bsc)
        };
        let key = PrivateKey::new(
            "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318",
        );

        match EvmConnector.connect(&config, &key).await {
            Err(err) => assert_eq!(err.current_context(), &Error::Connection),
            Ok(_) => panic!("connecting to a closed port should fail"),
        }
    }
}
