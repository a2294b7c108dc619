use std::fs::canonicalize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use ::config::{Config as cfg, Environment, File, FileFormat, FileSourceFile};
use clap::{Parser, ValueEnum};
use config::ConfigError;
use error_stack::{Report, ResultExt};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vaa_relayer::commands::{daemon, find_unprocessed, redeem, SubCommand};
use vaa_relayer::config::Config;
use vaa_relayer::Error;

#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Config files to merge, in order. Missing files are skipped
    #[arg(short, long, default_values_os_t = default_config_paths())]
    config: Vec<PathBuf>,

    /// Log format
    #[arg(short, long, value_enum, default_value_t = Output::Text)]
    output: Output,

    #[command(subcommand)]
    cmd: Option<SubCommand>,
}

#[derive(Debug, Clone, ValueEnum)]
enum Output {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Args = Args::parse();
    set_up_logger(&args.output);

    let mut cfg = init_config(&args.config);
    cfg.storage.path = expand_home_dir(&cfg.storage.path);

    let result = match args.cmd.unwrap_or(SubCommand::Daemon) {
        SubCommand::Daemon => {
            info!(chains = cfg.chains.len(), emitters = cfg.emitters.len(), "starting relayer");
            let result = daemon::run(cfg).await;
            info!("relayer stopped");
            result
        }
        SubCommand::Redeem(redeem_args) => redeem::run(cfg, redeem_args).await,
        SubCommand::FindUnprocessed => find_unprocessed::run(cfg).await,
    };

    let report = match result {
        Ok(output) => {
            output.into_iter().for_each(|line| info!("{line}"));
            return ExitCode::SUCCESS;
        }
        Err(report) => report,
    };

    error!(err = %report, "{report:#}");
    // the full report goes last so it is what a terminal user sees
    if matches!(args.output, Output::Text) {
        eprintln!("{report:?}");
    }

    ExitCode::FAILURE
}

/// `RUST_LOG` overrides the default `info` level.
fn set_up_logger(output: &Output) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match output {
        Output::Json => subscriber.json().flatten_event(true).init(),
        Output::Text => subscriber.compact().init(),
    }
}

/// Later files override earlier ones, `VAA_RELAYER__*` variables override every file.
fn init_config(config_paths: &[PathBuf]) -> Config {
    let sources = config_paths
        .iter()
        .filter_map(|path| canonicalize(expand_home_dir(path)).ok())
        .inspect(|path| info!(path = %path.display(), "loading config file"))
        .map(File::from)
        .collect::<Vec<_>>();

    if sources.is_empty() {
        info!("no config file found, using defaults and environment");
    }

    load_config(sources)
        .change_context(Error::LoadConfig)
        .inspect_err(|report| error!(err = %report, "{report:#}"))
        .unwrap_or_default()
}

fn load_config(
    sources: Vec<File<FileSourceFile, FileFormat>>,
) -> error_stack::Result<Config, ConfigError> {
    let config = cfg::builder()
        .add_source(sources)
        .add_source(Environment::with_prefix("VAA_RELAYER").separator("__"))
        .build()?;

    config.try_deserialize().map_err(Report::from)
}

fn default_config_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("~/.vaa-relayer/config.toml"),
        PathBuf::from("config.toml"),
    ]
}

fn expand_home_dir(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();

    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(relative), Some(home)) => home.join(relative),
        _ => path.to_path_buf(),
    }
}
