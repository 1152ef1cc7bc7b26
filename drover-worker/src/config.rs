//! Process configuration, read from flags or the environment.
//!
//! A `.env` file in the working directory is loaded first, see [`Config::load`].
use std::{net::SocketAddr, time::Duration};

use chrono::TimeDelta;
use clap::{Parser, ValueEnum};
use drover::{pruner::PrunerConfig, queue::JobDefaults, worker::WorkerConfig, DroverError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "drover-worker", version, about = "Processes the jobs of a drover queue")]
pub struct Config {
    /// Port of the health, lifecycle and metrics endpoints.
    #[arg(long, env = "PORT", default_value_t = 3002)]
    pub port: u16,

    /// The broker holding the queue.
    #[arg(long, env = "REDIS_MQ_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_mq_url: String,

    /// The cache holding reading positions. The read position gauge is omitted when unset.
    #[arg(long, env = "REDIS_CACHE_URL")]
    pub redis_cache_url: Option<String>,

    #[arg(long, env = "QUEUE_NAME", default_value = "drover-backend-queue")]
    pub queue_name: String,

    /// Jobs processed at the same time.
    #[arg(long, env = "WORKER_CONCURRENCY", default_value_t = 1)]
    pub worker_concurrency: usize,

    /// How long shutdown waits for in flight jobs.
    #[arg(long, env = "DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    pub drain_timeout_secs: u64,

    #[arg(long, env = "LOCK_DURATION_MS", default_value_t = 30_000)]
    pub lock_duration_ms: u64,

    /// Fan-out jobs are skipped while more jobs than this are prioritized.
    #[arg(long, env = "FANOUT_THRESHOLD", default_value_t = 1000)]
    pub fanout_threshold: u64,

    #[arg(
        long,
        env = "READ_POSITION_PREFIX",
        default_value = "omnivore:cached-reading-position"
    )]
    pub read_position_prefix: String,

    #[arg(long, env = "READ_POSITION_SCAN_COUNT", default_value_t = 10_000)]
    pub read_position_scan_count: u64,

    /// Reported instead of the read position count when one scan pass does not cover the cache.
    #[arg(long, env = "READ_POSITION_SENTINEL", default_value_t = 10_001)]
    pub read_position_sentinel: u64,

    #[arg(long, env = "METRIC_PREFIX", default_value = "drover")]
    pub metric_prefix: String,

    /// Cron schedule, with seconds, of the retention pruner.
    #[arg(long, env = "PRUNE_SCHEDULE", default_value = PrunerConfig::DEFAULT_SCHEDULE)]
    pub prune_schedule: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

impl Config {
    /// Loads `.env` if present and parses the command line.
    pub fn load() -> Self {
        if let Err(error) = dotenvy::dotenv() {
            if !error.not_found() {
                eprintln!("Failed to load .env: {error}");
            }
        }
        Self::parse()
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.worker_concurrency.max(1),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            ..Default::default()
        }
    }

    pub fn job_defaults(&self) -> JobDefaults {
        JobDefaults {
            lock_duration: TimeDelta::milliseconds(self.lock_duration_ms as i64),
            ..Default::default()
        }
    }

    pub fn pruner_config(&self) -> Result<PrunerConfig, DroverError> {
        self.prune_schedule.parse()
    }
}
