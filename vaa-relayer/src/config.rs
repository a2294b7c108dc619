use itertools::Itertools;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::redeem::{ChainConfig, PrivateKey};
use crate::spy::EmitterFilter;
use crate::{compensate, dispatch, monitoring, query, spy, storage};

#[derive(Deserialize, Serialize, Debug, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub spy_service: spy::Config,
    pub private_key: PrivateKey,
    pub storage: storage::Config,
    pub dispatch: dispatch::Config,
    pub compensate: compensate::Config,
    pub query_server: query::Config,
    pub monitoring_server: monitoring::Config,
    /// source chain contracts to follow, at most one per chain
    #[serde(deserialize_with = "deserialize_emitters")]
    pub emitters: Vec<EmitterFilter>,
    /// destination chains to redeem on
    #[serde(deserialize_with = "deserialize_chains")]
    pub chains: Vec<ChainConfig>,
}

fn deserialize_emitters<'de, D>(deserializer: D) -> Result<Vec<EmitterFilter>, D::Error>
where
    D: Deserializer<'de>,
{
    let emitters: Vec<EmitterFilter> = Deserialize::deserialize(deserializer)?;

    if !emitters.iter().map(|emitter| emitter.chain).all_unique() {
        return Err(D::Error::custom("only one emitter per source chain is allowed"));
    }

    Ok(emitters)
}

fn deserialize_chains<'de, D>(deserializer: D) -> Result<Vec<ChainConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    let chains: Vec<ChainConfig> = Deserialize::deserialize(deserializer)?;

    if let Some(chain) = chains.iter().map(|config| config.chain).duplicates().next() {
        return Err(D::Error::custom(format!(
            "destination chain {} is configured more than once",
            chain.id()
        )));
    }

    Ok(chains)
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Duration;

    use assert_ok::assert_ok;
    use wormhole_vaa::Chain;

    use super::Config;
    use crate::monitoring;
    use crate::redeem::{FeePolicy, ProviderKind};

    const CHAIN_BSC: &str = "
        [[chains]]
        chain = 4
        name = 'bsc'
        rpc_url = 'https://bsc.example.com/key/secret'
        token_bridge = '0xb6f6d86a8f9879a9c87f643768d9efc38c1da6e7'
        redeem_contract = '0x2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a'
    ";

    const EMITTER_ETHEREUM: &str = "
        [[emitters]]
        chain = 2
        address = '0x3ee18B2214AFF97000D974cf647E7C347E8fa585'
    ";

    #[test]
    fn empty_config_falls_back_to_defaults() {
        let config: Config = assert_ok!(toml::from_str(""));
        assert_eq!(config, Config::default());
        assert_eq!(config.spy_service.reconnect_delay, Duration::from_secs(5));
        assert_eq!(
            config.compensate.stale_after,
            Duration::from_secs(24 * 60 * 60)
        );
        assert_eq!(
            config.query_server.bind_address,
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5066)
        );
        assert!(!config.monitoring_server.enabled);
    }

    #[test]
    fn full_config_deserializes() {
        let config_str = format!(
            "
            private_key = '0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318'

            [spy_service]
            url = 'http://spy:7073'
            reconnect_delay = '2s'

            [dispatch]
            queue_cap = 5
            retry_delay = '1m'

            [compensate]
            enabled = true
            url = 'http://ledger/pending'
            interval = '5m'
            stale_after = '12h'

            [monitoring_server]
            enabled = true
            bind_address = '0.0.0.0:3001'

            {EMITTER_ETHEREUM}

            [[emitters]]
            chain = 6
            address = '0x0e082F06FF657D94310cB8cE8B0D9a04541d8052'

            {CHAIN_BSC}
            fee_policy = {{ type = 'legacy_gas_price' }}

            [[chains]]
            chain = 14
            name = 'celo'
            rpc_url = 'https://forno.celo.org'
            receipt_timeout = '30s'
            token_bridge = '0x796dff6d74f3e27060b71255fe517bfb23c93eed'
            redeem_contract = '0x2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a'
            "
        );

        let config: Config = assert_ok!(toml::from_str(&config_str));

        assert_eq!(config.spy_service.reconnect_delay, Duration::from_secs(2));
        assert_eq!(config.dispatch.queue_cap, 5);
        assert_eq!(config.dispatch.max_attempts, 3);
        assert_eq!(config.dispatch.retry_delay, Duration::from_secs(60));
        assert!(config.compensate.enabled);
        assert_eq!(config.compensate.stale_after, Duration::from_secs(12 * 60 * 60));
        assert_eq!(
            config.monitoring_server,
            monitoring::Config {
                enabled: true,
                bind_address: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 3001),
                channel_size: 1000,
            }
        );

        assert_eq!(config.emitters.len(), 2);
        assert_eq!(config.emitters[0].chain, Chain::Ethereum);

        assert_eq!(config.chains.len(), 2);
        assert_eq!(config.chains[0].fee_policy(), FeePolicy::LegacyGasPrice);
        assert_eq!(config.chains[0].rpc_timeout, Duration::from_secs(10));
        assert_eq!(config.chains[1].chain, Chain::Celo);
        assert_eq!(config.chains[1].provider(), ProviderKind::Celo);
        assert_eq!(config.chains[1].receipt_timeout, Duration::from_secs(30));
    }

    #[test]
    fn duplicate_destination_chains_are_rejected() {
        let config_str = format!("{CHAIN_BSC}\n{CHAIN_BSC}");

        let err = toml::from_str::<Config>(&config_str).unwrap_err();
        assert!(err
            .to_string()
            .contains("destination chain 4 is configured more than once"));
    }

    #[test]
    fn duplicate_emitter_chains_are_rejected() {
        let config_str = format!("{EMITTER_ETHEREUM}\n{EMITTER_ETHEREUM}");

        assert!(toml::from_str::<Config>(&config_str).is_err());
    }

    #[test]
    fn secrets_are_redacted_when_printed() {
        let config_str = format!(
            "
            private_key = '0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318'
            {CHAIN_BSC}
            "
        );
        let config: Config = toml::from_str(&config_str).unwrap();

        let printed = format!("{config:?}");
        assert!(!printed.contains("4c0883a6"));
        assert!(!printed.contains("secret"));

        assert_eq!(
            serde_json::to_string(&config.private_key).unwrap(),
            "\"[REDACTED]\""
        );
    }
}
