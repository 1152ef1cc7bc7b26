use anyhow::Context;
use drover::{metrics::ReadPositionGauge, queue::Queue, DroverError, ErrorPolicy, Phase};
use drover_redis::{RedisBackend, ScanCounter};
use drover_worker::{config::Config, telemetry, App};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load();
    telemetry::init(config.log_format);
    telemetry::install_panic_hook();

    let app = match start(&config).await {
        Ok(app) => app,
        Err(error) => {
            tracing::error!(?error, "Failed to start the worker: {error:#}");
            return Err(error);
        }
    };

    shutdown_signal().await;

    let report = app.shutdown().await;
    for failure in &report.failures {
        tracing::error!(step = %failure.step, "Shutdown step failed: {}", failure.error);
    }
    tracing::info!(clean = report.is_clean(), "Shut down");
    Ok(())
}

async fn start(config: &Config) -> anyhow::Result<App> {
    let backend = startup(RedisBackend::from_url(&config.redis_mq_url, &config.queue_name).await)
        .context("connecting to the broker")?;
    let queue = Queue::new(config.queue_name.as_str(), backend).with_defaults(config.job_defaults());
    startup(queue.ping().await).context("pinging the broker")?;

    let read_positions = match &config.redis_cache_url {
        Some(url) => match ScanCounter::from_url(url, &config.read_position_prefix).await {
            Ok(scanner) => Some(
                ReadPositionGauge::new(scanner.with_count(config.read_position_scan_count))
                    .with_sentinel(config.read_position_sentinel),
            ),
            Err(error) => {
                tracing::warn!(
                    ?error,
                    "Read position cache unavailable, the gauge is disabled: {error}"
                );
                None
            }
        },
        None => {
            tracing::info!("REDIS_CACHE_URL is not set, the read position gauge is disabled");
            None
        }
    };

    let listener = TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("binding {}", config.listen_addr()))?;

    App::start(config, queue, read_positions, listener).await
}

/// Nothing runs without the broker, so every error reaching this point aborts startup. Errors the
/// startup policy does not consider fatal are still logged as such.
fn startup<T, E>(result: Result<T, E>) -> anyhow::Result<T>
where
    E: Into<DroverError>,
{
    result.map_err(|error| {
        let error = error.into();
        if error.policy(Phase::Startup) != ErrorPolicy::Fatal {
            tracing::warn!(?error, "Unexpected error while connecting to the broker: {error}");
        }
        anyhow::Error::new(error)
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(?error, "Failed to listen for SIGINT: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(?error, "Failed to listen for SIGTERM: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
