//! Asynchronous inference jobs.
//!
//! Submission hands a job to a logical queue and returns an opaque id
//! immediately; a pool of workers resolves the artifact, runs the backend,
//! and publishes the outcome to the result cache. The broker is abstracted
//! behind [`JobQueue`] so the in-memory implementation can be swapped for
//! an external one without touching the registry or the metadata store.

pub mod queue;
pub mod status;

pub use queue::{QueueStats, WorkQueue, WorkQueueConfig};
pub use status::JobStatus;

use async_trait::async_trait;

use crate::error::Result;

/// Opaque job identifier assigned at enqueue time.
pub type JobId = String;

/// Native execution states of the in-memory broker. The status translator
/// maps these (and anything an external broker might report) onto the
/// public state machine.
pub mod state {
    pub const PENDING: &str = "PENDING";
    pub const STARTED: &str = "STARTED";
    pub const SUCCESS: &str = "SUCCESS";
    pub const FAILURE: &str = "FAILURE";
}

/// One unit of inference work.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub model_name: String,
    pub version_label: String,
    pub task_name: String,
    pub payload: Vec<u8>,
}

/// A job's broker-native state as observed at one poll.
#[derive(Debug, Clone)]
pub struct JobState {
    /// Broker-native state name, e.g. `"STARTED"`.
    pub native: String,
    /// Failure message, present once the job has failed.
    pub error: Option<String>,
    /// Enqueue timestamp, epoch milliseconds.
    pub enqueued_at: i64,
}

/// Broker interface: enqueue work, observe its native state.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job. Returns immediately; never blocks on inference.
    async fn submit(&self, request: JobRequest) -> Result<JobId>;

    /// Native state of a job, or `None` for ids the broker no longer
    /// (or never) knew about.
    async fn state(&self, job_id: &str) -> Option<JobState>;
}
