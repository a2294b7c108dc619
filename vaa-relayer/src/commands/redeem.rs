use error_stack::{report, Result, ResultExt};
use wormhole_vaa::{Chain, Payload, Vaa};

use crate::config::Config;
use crate::redeem::{EvmConnector, RedemptionEngine};
use crate::storage::VaaRecord;
use crate::{monitoring, open_store, Error};

#[derive(clap::Args, Debug)]
pub struct Args {
    /// Hex encoded signed VAA
    vaa: String,
    /// Destination chain id or name, defaults to the transfer's destination
    #[arg(long)]
    chain: Option<Chain>,
    /// Only check whether the transfer was already redeemed
    #[arg(long)]
    check_only: bool,
    /// Redeem wrapped native tokens as the native asset
    #[arg(long)]
    unwrap_native: bool,
}

pub async fn run(config: Config, args: Args) -> Result<Option<String>, Error> {
    let Args {
        vaa,
        chain,
        check_only,
        unwrap_native,
    } = args;

    let signed_vaa = hex::decode(vaa.trim().trim_start_matches("0x"))
        .change_context(Error::InvalidInput)
        .attach_printable("vaa is not valid hex")?;
    let chain = match chain {
        Some(chain) => chain,
        None => destination(&signed_vaa)?,
    };

    let store = open_store(&config.storage)?;
    let engine = RedemptionEngine::new(
        EvmConnector,
        config.chains,
        config.private_key,
        store.clone(),
        monitoring::Client::disabled(),
    );

    let outcome = engine
        .redeem(chain, &signed_vaa, unwrap_native, check_only)
        .await
        .change_context(Error::Redemption)?;

    if outcome.is_redeemed() {
        if let Ok(record) = VaaRecord::from_signed_vaa(&signed_vaa) {
            store.mark_redeemed(&record.key()).await;
        }
    }

    Ok(Some(format!("transfer on chain {chain}: {outcome}")))
}

fn destination(signed_vaa: &[u8]) -> Result<Chain, Error> {
    let vaa = Vaa::parse(signed_vaa).change_context(Error::InvalidInput)?;

    Payload::decode(&vaa.payload)
        .to_chain()
        .ok_or_else(|| report!(Error::InvalidInput))
        .attach_printable("vaa is not a token transfer, pass the destination with --chain")
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::storage::test_utils::transfer_vaa_bytes;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        args: Args,
    }

    #[test]
    fn chain_can_be_given_by_name_or_id() {
        let by_name = Cli::parse_from(["redeem", "00", "--chain", "bsc", "--check-only"]);
        assert_eq!(by_name.args.chain, Some(Chain::Bsc));
        assert!(by_name.args.check_only);
        assert!(!by_name.args.unwrap_native);

        let by_id = Cli::parse_from(["redeem", "00", "--chain", "4", "--unwrap-native"]);
        assert_eq!(by_id.args.chain, Some(Chain::Bsc));
        assert!(by_id.args.unwrap_native);
    }

    #[test]
    fn destination_defaults_to_the_transfer_target() {
        assert_eq!(
            destination(&transfer_vaa_bytes()).unwrap(),
            Chain::Avalanche
        );
        assert!(destination(&[1, 2, 3]).is_err());
    }

    #[tokio::test]
    async fn invalid_hex_is_rejected_before_connecting() {
        let args = Cli::parse_from(["redeem", "0xnothex"]).args;

        let err = run(Config::default(), args).await.unwrap_err();
        assert!(matches!(err.current_context(), Error::InvalidInput));
    }
}
