//! Configuration management for the inferflow service.
//!
//! This module provides configuration handling through multiple sources:
//! 1. Default configuration (embedded in binary)
//! 2. User-specified configuration file
//! 3. Environment variables (prefixed with `INFERFLOW_`)
//! 4. Command-line arguments
//!
//! Configuration options are loaded in order of precedence, with later sources
//! overriding earlier ones.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

/// Command-line arguments shared by every subcommand.
#[derive(Debug, Default, clap::Args)]
pub struct Args {
    /// Configuration file path
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// Base directory for the metadata database and artifact files
    #[clap(long)]
    pub data_dir: Option<PathBuf>,

    /// Number of workers per logical queue
    #[clap(long)]
    pub workers: Option<usize>,

    /// Result cache TTL in seconds
    #[clap(long)]
    pub result_ttl: Option<u64>,
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Metadata database and artifact storage
    pub storage: StorageConfig,
    /// Job queue and worker pool settings
    pub queue: QueueConfig,
    /// Result cache settings
    pub results: ResultCacheConfig,
}

/// Metadata database and artifact file locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for all durable state
    pub data_dir: PathBuf,
    /// Database file name, relative to `data_dir`
    #[serde(default = "default_database")]
    pub database: String,
    /// Artifact directory name, relative to `data_dir`
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,
}

impl StorageConfig {
    /// Absolute path of the metadata database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database)
    }

    /// Root directory for stored artifact files.
    pub fn artifact_root(&self) -> PathBuf {
        self.data_dir.join(&self.artifact_dir)
    }
}

/// Worker pool configuration.
///
/// The soft/hard limits and recycling thresholds bound the damage a stuck or
/// leaky inference backend can do to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Logical queues routed by task name; unknown task names share a
    /// default queue.
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,
    /// Workers per logical queue
    #[serde(default = "default_workers_per_queue")]
    pub workers_per_queue: usize,
    /// Cooperative cancellation is signalled after this many seconds
    #[serde(default = "default_soft_time_limit")]
    pub soft_time_limit_secs: u64,
    /// The job is abandoned and failed after this many seconds
    #[serde(default = "default_hard_time_limit")]
    pub hard_time_limit_secs: u64,
    /// A worker retires after processing this many jobs
    #[serde(default = "default_max_jobs_per_worker")]
    pub max_jobs_per_worker: usize,
    /// A worker retires once process resident memory exceeds this many bytes
    #[serde(default)]
    pub memory_limit_bytes: Option<u64>,
}

impl QueueConfig {
    pub fn soft_limit(&self) -> Duration {
        Duration::from_secs(self.soft_time_limit_secs)
    }

    pub fn hard_limit(&self) -> Duration {
        Duration::from_secs(self.hard_time_limit_secs)
    }
}

/// Result cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultCacheConfig {
    /// Seconds a cached result stays readable before it expires
    #[serde(default = "default_result_ttl")]
    pub ttl_secs: u64,
    /// Interval for the background sweep of expired entries
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl ResultCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl ServiceConfig {
    /// Load configuration from all sources.
    pub fn load(args: &Args) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(config::File::from_str(
            include_str!("../config/default.toml"),
            config::FileFormat::Toml,
        ));

        // Load user config if specified
        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        // Add environment variables
        builder = builder.add_source(
            config::Environment::with_prefix("INFERFLOW").separator("__"),
        );

        // Build config
        let mut config: ServiceConfig = builder.build()?.try_deserialize()?;

        // Override with command line args
        if let Some(dir) = &args.data_dir {
            config.storage.data_dir = dir.clone();
        }
        if let Some(workers) = args.workers {
            config.queue.workers_per_queue = workers;
        }
        if let Some(ttl) = args.result_ttl {
            config.results.ttl_secs = ttl;
        }

        Ok(config)
    }
}

fn default_database() -> String {
    "models.duckdb".to_string()
}

fn default_artifact_dir() -> String {
    "artifacts".to_string()
}

fn default_queues() -> Vec<String> {
    vec!["detect".to_string(), "classify".to_string()]
}

fn default_workers_per_queue() -> usize {
    num_cpus::get().clamp(1, 4)
}

fn default_soft_time_limit() -> u64 {
    240
}

fn default_hard_time_limit() -> u64 {
    300
}

fn default_max_jobs_per_worker() -> usize {
    100
}

fn default_result_ttl() -> u64 {
    3600
}

fn default_cleanup_interval() -> u64 {
    60
}
