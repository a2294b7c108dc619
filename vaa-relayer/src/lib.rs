use std::sync::Arc;
use std::time::Duration;

use asyncutil::task::{CancellableTask, TaskError, TaskGroup};
use compensate::{Compensator, HttpPendingTransferSource};
use dispatch::{DispatchHandle, Dispatcher};
use error_stack::{FutureExt, Result, ResultExt};
use listener::Listener;
use redeem::{EvmConnector, RedemptionEngine};
use spy::GrpcSpyClient;
use storage::{DedupStore, SqliteStorage};
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;

pub mod asyncutil;
pub mod commands;
pub mod compensate;
pub mod config;
pub mod dispatch;
pub mod http;
pub mod listener;
pub mod monitoring;
pub mod query;
pub mod redeem;
pub mod spy;
pub mod storage;
pub mod url;

pub async fn run(cfg: Config) -> Result<(), Error> {
    prepare_app(cfg).await?.run().await
}

pub(crate) fn open_store(config: &storage::Config) -> Result<DedupStore, Error> {
    let storage = SqliteStorage::open(&config.path, config.pool_size)
        .change_context(Error::Connection)
        .attach_printable_lazy(|| config.path.display().to_string())?;

    Ok(DedupStore::new(storage))
}

async fn prepare_app(cfg: Config) -> Result<App, Error> {
    let Config {
        spy_service,
        private_key,
        storage,
        dispatch,
        compensate,
        query_server,
        monitoring_server,
        emitters,
        chains,
    } = cfg;

    let (monitoring_server, monitoring_client) = monitoring::Server::new(monitoring_server);

    let store = open_store(&storage)?;

    let engine = Arc::new(RedemptionEngine::new(
        EvmConnector,
        chains,
        private_key,
        store.clone(),
        monitoring_client.clone(),
    ));
    let (dispatch_handle, receivers) = dispatch::lanes(
        engine.chains().collect::<Vec<_>>(),
        dispatch.queue_cap,
        monitoring_client.clone(),
    );
    let dispatcher = Dispatcher::new(engine, store.clone(), receivers, dispatch);

    let mut listener = Listener::new(
        GrpcSpyClient::new(spy_service.url, spy_service.connect_timeout),
        emitters.clone(),
        store.clone(),
        dispatch_handle.clone(),
        spy_service.reconnect_delay,
        monitoring_client.clone(),
    );
    if let Some(vaa) = spy_service.warm_up_vaa {
        let vaa = hex::decode(vaa.trim_start_matches("0x"))
            .change_context(Error::LoadConfig)
            .attach_printable("warm-up vaa is not valid hex")?;
        listener = listener.with_warm_up_vaa(vaa);
    }

    let compensator = match compensate.enabled {
        true => Some(ScheduledCompensator {
            compensator: Compensator::new(
                HttpPendingTransferSource::new(compensate.url, compensate.http_timeout)
                    .change_context(Error::Connection)?,
                store.clone(),
                emitters,
                compensate.stale_after,
                monitoring_client.clone(),
            ),
            interval: compensate.interval,
        }),
        false => {
            info!("reconciliation is disabled");
            None
        }
    };

    let query_server = match query_server.enabled {
        true => Some(query::Server::new(query_server.bind_address, store)),
        false => {
            info!("query server is disabled");
            None
        }
    };

    Ok(App {
        listener,
        dispatcher,
        dispatch_handle,
        compensator,
        query_server,
        monitoring_server,
    })
}

struct ScheduledCompensator {
    compensator: Compensator<HttpPendingTransferSource>,
    interval: Duration,
}

struct App {
    listener: Listener<GrpcSpyClient>,
    dispatcher: Dispatcher<EvmConnector>,
    dispatch_handle: DispatchHandle,
    compensator: Option<ScheduledCompensator>,
    query_server: Option<query::Server>,
    monitoring_server: monitoring::Server,
}

impl App {
    async fn run(self) -> Result<(), Error> {
        let Self {
            listener,
            dispatcher,
            dispatch_handle,
            compensator,
            query_server,
            monitoring_server,
        } = self;

        let main_token = CancellationToken::new();
        let exit_token = main_token.clone();
        tokio::spawn(async move {
            let mut sigint = signal(SignalKind::interrupt()).expect("failed to capture SIGINT");
            let mut sigterm = signal(SignalKind::terminate()).expect("failed to capture SIGTERM");

            tokio::select! {
                _ = sigint.recv() => {},
                _ = sigterm.recv() => {},
            }

            info!("signal received, waiting for program to exit gracefully");

            exit_token.cancel();
        });

        let mut tasks = TaskGroup::new("vaa-relayer")
            .add_task(
                "monitoring-server",
                CancellableTask::create(|token| {
                    monitoring_server
                        .run(token)
                        .change_context(Error::MonitoringServer)
                }),
            )
            .add_task(
                "dispatcher",
                CancellableTask::create(|token| {
                    dispatcher.run(token).change_context(Error::Dispatcher)
                }),
            )
            .add_task(
                "listener",
                CancellableTask::create(|token| async move {
                    listener.run(token).await;
                    Ok(())
                }),
            );

        if let Some(ScheduledCompensator {
            compensator,
            interval,
        }) = compensator
        {
            tasks = tasks.add_task(
                "compensator",
                CancellableTask::create(move |token| {
                    compensator
                        .run(dispatch_handle, interval, token)
                        .change_context(Error::Compensator)
                }),
            );
        }

        if let Some(query_server) = query_server {
            tasks = tasks.add_task(
                "query-server",
                CancellableTask::create(|token| {
                    query_server.run(token).change_context(Error::QueryServer)
                }),
            );
        }

        tasks.run(main_token).await
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("dispatcher failed")]
    Dispatcher,
    #[error("compensator failed")]
    Compensator,
    #[error("query server failed")]
    QueryServer,
    #[error("monitoring server failed")]
    MonitoringServer,
    #[error("redemption failed")]
    Redemption,
    #[error("connection failed")]
    Connection,
    #[error("failed to load config")]
    LoadConfig,
    #[error("invalid input")]
    InvalidInput,
    #[error("task execution failed")]
    Task(#[from] TaskError),
}
