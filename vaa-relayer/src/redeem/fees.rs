use error_stack::Result;
use ethers_core::types::U256;
use serde::{Deserialize, Serialize};
use wormhole_vaa::Chain;

use super::{BridgeClient, Error};

const DEFAULT_FEE_MULTIPLIER: u64 = 50;

/// Current EIP-1559 fee suggestion of a node. Nodes without fee market support leave both
/// fields empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeeData {
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
}

/// Fee fields set explicitly on a redemption transaction. Anything left `None` is estimated
/// by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxOverrides {
    pub gas_price: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeePolicy {
    /// let the node estimate everything
    Default,
    /// multiply the node's EIP-1559 fee suggestion, for chains whose fees spike faster than
    /// their nodes estimate
    BoostedEip1559 {
        #[serde(default = "default_multiplier")]
        multiplier: u64,
    },
    /// send an explicit gas price taken from the node, bypassing the fee market
    LegacyGasPrice,
}

fn default_multiplier() -> u64 {
    DEFAULT_FEE_MULTIPLIER
}

impl FeePolicy {
    pub fn for_chain(chain: Chain) -> Self {
        match chain {
            Chain::Polygon | Chain::Avalanche => FeePolicy::BoostedEip1559 {
                multiplier: DEFAULT_FEE_MULTIPLIER,
            },
            Chain::Klaytn | Chain::Fantom => FeePolicy::LegacyGasPrice,
            _ => FeePolicy::Default,
        }
    }

    pub async fn overrides(
        &self,
        client: &(dyn BridgeClient + Send + Sync),
    ) -> Result<TxOverrides, Error> {
        match self {
            FeePolicy::Default => Ok(TxOverrides::default()),
            FeePolicy::BoostedEip1559 { multiplier } => {
                let fees = client.fee_data().await?;

                Ok(TxOverrides {
                    max_fee_per_gas: fees.max_fee_per_gas.map(|fee| boost(fee, *multiplier)),
                    max_priority_fee_per_gas: fees
                        .max_priority_fee_per_gas
                        .map(|fee| boost(fee, *multiplier)),
                    ..TxOverrides::default()
                })
            }
            FeePolicy::LegacyGasPrice => Ok(TxOverrides {
                gas_price: Some(client.gas_price().await?),
                ..TxOverrides::default()
            }),
        }
    }
}

/// Saturates at `U256::MAX` instead of overflowing.
fn boost(fee: U256, multiplier: u64) -> U256 {
    fee.checked_mul(U256::from(multiplier))
        .unwrap_or(U256::MAX)
}

#[cfg(test)]
mod tests {
    use error_stack::report;

    use super::*;
    use crate::redeem::MockBridgeClient;

    #[test]
    fn policy_follows_the_chain_family() {
        assert_eq!(
            FeePolicy::for_chain(Chain::Polygon),
            FeePolicy::BoostedEip1559 { multiplier: 50 }
        );
        assert_eq!(
            FeePolicy::for_chain(Chain::Avalanche),
            FeePolicy::BoostedEip1559 { multiplier: 50 }
        );
        assert_eq!(FeePolicy::for_chain(Chain::Klaytn), FeePolicy::LegacyGasPrice);
        assert_eq!(FeePolicy::for_chain(Chain::Fantom), FeePolicy::LegacyGasPrice);
        assert_eq!(FeePolicy::for_chain(Chain::Bsc), FeePolicy::Default);
        assert_eq!(FeePolicy::for_chain(Chain::Celo), FeePolicy::Default);
    }

    #[test]
    fn policy_deserializes_from_tagged_table() {
        let boosted: FeePolicy = toml::from_str(r#"type = "boosted_eip1559""#).unwrap();
        assert_eq!(boosted, FeePolicy::BoostedEip1559 { multiplier: 50 });

        let custom: FeePolicy = toml::from_str(
            r#"
            type = "boosted_eip1559"
            multiplier = 3
            "#,
        )
        .unwrap();
        assert_eq!(custom, FeePolicy::BoostedEip1559 { multiplier: 3 });

        let legacy: FeePolicy = toml::from_str(r#"type = "legacy_gas_price""#).unwrap();
        assert_eq!(legacy, FeePolicy::LegacyGasPrice);
    }

    #[tokio::test]
    async fn default_policy_queries_nothing() {
        let client = MockBridgeClient::new();

        assert_eq!(
            FeePolicy::Default.overrides(&client).await.unwrap(),
            TxOverrides::default()
        );
    }

    #[tokio::test]
    async fn boosted_policy_multiplies_both_fees() {
        let mut client = MockBridgeClient::new();
        client.expect_fee_data().times(1).returning(|| {
            Ok(FeeData {
                max_fee_per_gas: Some(U256::from(30_000_000_000u64)),
                max_priority_fee_per_gas: Some(U256::from(2_000_000_000u64)),
            })
        });

        let overrides = FeePolicy::BoostedEip1559 { multiplier: 50 }
            .overrides(&client)
            .await
            .unwrap();

        assert_eq!(
            overrides,
            TxOverrides {
                gas_price: None,
                max_fee_per_gas: Some(U256::from(1_500_000_000_000u64)),
                max_priority_fee_per_gas: Some(U256::from(100_000_000_000u64)),
            }
        );
    }

    #[tokio::test]
    async fn boosted_policy_saturates_and_keeps_missing_fees_unset() {
        let mut client = MockBridgeClient::new();
        client.expect_fee_data().returning(|| {
            Ok(FeeData {
                max_fee_per_gas: Some(U256::MAX / 2),
                max_priority_fee_per_gas: None,
            })
        });

        let overrides = FeePolicy::BoostedEip1559 { multiplier: 50 }
            .overrides(&client)
            .await
            .unwrap();

        assert_eq!(overrides.max_fee_per_gas, Some(U256::MAX));
        assert_eq!(overrides.max_priority_fee_per_gas, None);
    }

    #[tokio::test]
    async fn legacy_policy_sets_the_node_gas_price() {
        let mut client = MockBridgeClient::new();
        client
            .expect_gas_price()
            .returning(|| Ok(U256::from(250_000_000_000u64)));
        client.expect_fee_data().never();

        let overrides = FeePolicy::LegacyGasPrice.overrides(&client).await.unwrap();

        assert_eq!(overrides.gas_price, Some(U256::from(250_000_000_000u64)));
        assert_eq!(overrides.max_fee_per_gas, None);
    }

    #[tokio::test]
    async fn fee_lookup_failures_propagate() {
        let mut client = MockBridgeClient::new();
        client
            .expect_fee_data()
            .returning(|| Err(report!(Error::FeeData)));

        let err = FeePolicy::for_chain(Chain::Polygon)
            .overrides(&client)
            .await
            .unwrap_err();
        assert!(matches!(err.current_context(), Error::FeeData));
    }
}
