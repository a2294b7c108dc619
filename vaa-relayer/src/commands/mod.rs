use clap::Subcommand;

pub mod daemon;
pub mod find_unprocessed;
pub mod redeem;

#[derive(Debug, Subcommand)]
pub enum SubCommand {
    /// Run the relayer daemon process (default)
    Daemon,
    /// Redeem a single signed VAA on its destination chain
    Redeem(redeem::Args),
    /// Run one reconciliation pass and print the stale, unredeemed transfers
    FindUnprocessed,
}
