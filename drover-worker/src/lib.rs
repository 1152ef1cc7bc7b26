//! The drover worker process.
//!
//! [`App::start`] wires a [`Queue`] to a worker, the retention pruner, the event log and the HTTP
//! endpoints. [`App::shutdown`] tears them down in order: the HTTP server stops accepting
//! connections, the worker drains, the broker connection is closed and finally the read position
//! cache is released.
use std::{convert::Infallible, io, net::SocketAddr, sync::Arc};

use anyhow::Context;
use drover::{dispatch::BoxError, lifecycle::ShutdownReport, prelude::*};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod http;
pub mod jobs;
pub mod telemetry;

use config::Config;

/// The running process.
pub struct App {
    local_addr: SocketAddr,
    queue: Queue,
    worker: WorkerHandle,
    read_positions: Option<Arc<ReadPositionGauge>>,
    http: JoinHandle<io::Result<()>>,
    http_shutdown: CancellationToken,
    background: CancellationToken,
    pruner: JoinHandle<()>,
    observer: JoinHandle<()>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("local_addr", &self.local_addr)
            .field("queue", &self.queue.name())
            .finish_non_exhaustive()
    }
}

impl App {
    /// Registers the recurring jobs and starts processing `queue`, serving HTTP on `listener`.
    pub async fn start(
        config: &Config,
        queue: Queue,
        read_positions: Option<ReadPositionGauge>,
        listener: TcpListener,
    ) -> anyhow::Result<Self> {
        let read_positions = read_positions.map(Arc::new);
        let dispatch = jobs::dispatch_table(config.fanout_threshold, read_positions.clone())?;
        let pruner_config = config.pruner_config()?;

        let recurring = jobs::recurring().ensure(&queue).await?;
        tracing::info!(?recurring, "Recurring jobs registered");

        let worker = Worker::new(queue.clone(), dispatch)
            .with_config(config.worker_config())
            .spawn();

        let background = CancellationToken::new();
        let pruner = spawn_pruner(queue.clone(), pruner_config, background.clone());
        let observer = spawn_observer(queue.subscribe(), LoggingObserver, background.clone());

        let state = http::AppState {
            queue: queue.clone(),
            worker: worker.clone(),
            read_positions: read_positions.clone(),
            metric_prefix: config.metric_prefix.as_str().into(),
        };
        let local_addr = listener.local_addr().context("listener has no local address")?;
        let http_shutdown = CancellationToken::new();
        let http = http::serve(listener, http::router(state), http_shutdown.clone());
        tracing::info!(%local_addr, queue = queue.name(), "Worker started");

        Ok(Self {
            local_addr,
            queue,
            worker,
            read_positions,
            http,
            http_shutdown,
            background,
            pruner,
            observer,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn worker(&self) -> &WorkerHandle {
        &self.worker
    }

    /// Runs every shutdown step, each one after the previous finished.
    pub async fn shutdown(self) -> ShutdownReport {
        let Self {
            queue,
            worker,
            read_positions,
            http,
            http_shutdown,
            background,
            pruner,
            observer,
            ..
        } = self;

        Shutdown::new()
            .then("http", move || async move {
                http_shutdown.cancel();
                http.await??;
                Ok::<_, BoxError>(())
            })
            .then("worker", move || async move {
                let report = worker.close().await;
                background.cancel();
                pruner.await?;
                observer.await?;
                match report.abandoned {
                    0 => Ok::<_, BoxError>(()),
                    abandoned => Err(format!("{abandoned} jobs abandoned to lock expiry").into()),
                }
            })
            .then("broker", move || async move { queue.close().await })
            .then("cache", move || async move {
                drop(read_positions);
                Ok::<_, Infallible>(())
            })
            .run()
            .await
    }
}
