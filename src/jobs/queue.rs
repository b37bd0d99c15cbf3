//! In-memory job broker and worker pool.
//!
//! Each logical queue (one per routed task name, plus a shared default)
//! owns an unbounded channel and a set of workers pulling from a shared
//! receiver. Workers are supervised: one retires after a configured number
//! of jobs or once process memory crosses the ceiling, and its supervisor
//! spawns a replacement. This bounds the effect of native-library leaks in
//! the inference backend.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{state, JobId, JobQueue, JobRequest, JobState};
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::inference::{CancelSignal, Predictions};
use crate::registry::ArtifactRegistry;
use crate::results::ResultCache;

use async_trait::async_trait;

/// Queue jobs land on when their task name has no dedicated route.
const DEFAULT_QUEUE: &str = "default";

/// How long a terminal job state outlives its cached result.
const STATE_RETENTION_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct WorkQueueConfig {
    /// Task names with a dedicated queue and worker set.
    pub queues: Vec<String>,
    pub workers_per_queue: usize,
    /// Cooperative cancellation is signalled at this limit.
    pub soft_time_limit: Duration,
    /// The job is abandoned and failed at this limit.
    pub hard_time_limit: Duration,
    /// Worker retires after this many jobs.
    pub max_jobs_per_worker: usize,
    /// Worker retires once process RSS exceeds this (Linux only).
    pub memory_limit_bytes: Option<u64>,
    /// TTL for cached results; terminal job states are retained slightly
    /// longer so expiry is reported as expired, not unknown.
    pub result_ttl: Duration,
    /// Interval for sweeping expired job-state entries.
    pub sweep_interval: Duration,
}

impl WorkQueueConfig {
    pub fn from_service(config: &ServiceConfig) -> Self {
        Self {
            queues: config.queue.queues.clone(),
            workers_per_queue: config.queue.workers_per_queue.max(1),
            soft_time_limit: config.queue.soft_limit(),
            hard_time_limit: config.queue.hard_limit(),
            max_jobs_per_worker: config.queue.max_jobs_per_worker.max(1),
            memory_limit_bytes: config.queue.memory_limit_bytes,
            result_ttl: config.results.ttl(),
            sweep_interval: config.results.cleanup_interval(),
        }
    }
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            queues: vec!["detect".to_string(), "classify".to_string()],
            workers_per_queue: 2,
            soft_time_limit: Duration::from_secs(240),
            hard_time_limit: Duration::from_secs(300),
            max_jobs_per_worker: 100,
            memory_limit_bytes: Some(512 * 1024 * 1024),
            result_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Counters across all queues and workers.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub recycled_workers: u64,
}

struct JobEntry {
    native: &'static str,
    error: Option<String>,
    enqueued_at: i64,
    /// Set once terminal; the entry is dropped after this instant.
    expires_at: Option<Instant>,
}

struct QueuedJob {
    id: JobId,
    request: JobRequest,
}

type SharedReceiver = Arc<Mutex<mpsc::UnboundedReceiver<QueuedJob>>>;

/// State shared by every worker.
struct WorkerContext {
    config: WorkQueueConfig,
    jobs: Arc<DashMap<JobId, JobEntry>>,
    registry: Arc<ArtifactRegistry>,
    results: Arc<dyn ResultCache>,
    stats: Arc<RwLock<QueueStats>>,
}

enum WorkerExit {
    /// Channel closed; the queue is shutting down.
    Closed,
    Recycled(RecycleReason),
}

#[derive(Debug, Clone, Copy)]
enum RecycleReason {
    MaxJobs,
    MemoryCeiling,
}

impl fmt::Display for RecycleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecycleReason::MaxJobs => write!(f, "max jobs per worker"),
            RecycleReason::MemoryCeiling => write!(f, "memory ceiling"),
        }
    }
}

pub struct WorkQueue {
    lanes: HashMap<String, mpsc::UnboundedSender<QueuedJob>>,
    jobs: Arc<DashMap<JobId, JobEntry>>,
    stats: Arc<RwLock<QueueStats>>,
    supervisors: Vec<tokio::task::JoinHandle<()>>,
    sweeper: Option<tokio::task::JoinHandle<()>>,
}

impl WorkQueue {
    pub fn new(
        config: WorkQueueConfig,
        registry: Arc<ArtifactRegistry>,
        results: Arc<dyn ResultCache>,
    ) -> Self {
        let jobs: Arc<DashMap<JobId, JobEntry>> = Arc::new(DashMap::new());
        let stats = Arc::new(RwLock::new(QueueStats::default()));

        let mut queue_names: Vec<String> = config.queues.clone();
        if !queue_names.iter().any(|q| q == DEFAULT_QUEUE) {
            queue_names.push(DEFAULT_QUEUE.to_string());
        }

        let context = Arc::new(WorkerContext {
            config: config.clone(),
            jobs: Arc::clone(&jobs),
            registry,
            results,
            stats: Arc::clone(&stats),
        });

        let mut lanes = HashMap::new();
        let mut supervisors = Vec::new();
        for name in queue_names {
            let (tx, rx) = mpsc::unbounded_channel();
            let rx: SharedReceiver = Arc::new(Mutex::new(rx));
            for slot in 0..config.workers_per_queue.max(1) {
                supervisors.push(tokio::spawn(supervise_worker(
                    Arc::clone(&context),
                    name.clone(),
                    slot,
                    Arc::clone(&rx),
                )));
            }
            lanes.insert(name, tx);
        }

        let sweeper = Some(Self::start_sweeper(Arc::clone(&jobs), config.sweep_interval));
        info!(
            queues = lanes.len(),
            workers_per_queue = config.workers_per_queue,
            "job queue started"
        );

        Self {
            lanes,
            jobs,
            stats,
            supervisors,
            sweeper,
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.stats.read().clone()
    }

    fn start_sweeper(
        jobs: Arc<DashMap<JobId, JobEntry>>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let expired: Vec<JobId> = jobs
                    .iter()
                    .filter(|entry| entry.expires_at.is_some_and(|at| now >= at))
                    .map(|entry| entry.key().clone())
                    .collect();
                let removed = expired
                    .into_iter()
                    .filter(|id| jobs.remove(id).is_some())
                    .count();
                if removed > 0 {
                    debug!(removed, "dropped expired job states");
                }
            }
        })
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.take() {
            handle.abort();
        }
        for handle in self.supervisors.drain(..) {
            handle.abort();
        }
    }
}

#[async_trait]
impl JobQueue for WorkQueue {
    async fn submit(&self, request: JobRequest) -> Result<JobId> {
        let id = Uuid::new_v4().to_string();
        self.jobs.insert(
            id.clone(),
            JobEntry {
                native: state::PENDING,
                error: None,
                enqueued_at: Utc::now().timestamp_millis(),
                expires_at: None,
            },
        );

        let lane = self
            .lanes
            .get(&request.task_name)
            .unwrap_or_else(|| &self.lanes[DEFAULT_QUEUE]);
        debug!(job_id = %id, task = %request.task_name, "job submitted");
        if lane.send(QueuedJob { id: id.clone(), request }).is_err() {
            self.jobs.remove(&id);
            return Err(Error::QueueUnavailable("worker pool is shut down".into()));
        }
        self.stats.write().submitted += 1;
        Ok(id)
    }

    async fn state(&self, job_id: &str) -> Option<JobState> {
        let expired = {
            let entry = self.jobs.get(job_id)?;
            if entry.expires_at.is_some_and(|at| Instant::now() >= at) {
                true
            } else {
                return Some(JobState {
                    native: entry.native.to_string(),
                    error: entry.error.clone(),
                    enqueued_at: entry.enqueued_at,
                });
            }
        };
        if expired {
            self.jobs.remove(job_id);
        }
        None
    }
}

async fn supervise_worker(
    context: Arc<WorkerContext>,
    queue: String,
    slot: usize,
    receiver: SharedReceiver,
) {
    loop {
        match worker_loop(&context, &receiver).await {
            WorkerExit::Closed => break,
            WorkerExit::Recycled(reason) => {
                context.stats.write().recycled_workers += 1;
                debug!(%queue, slot, %reason, "recycling worker");
            }
        }
    }
}

async fn worker_loop(context: &WorkerContext, receiver: &SharedReceiver) -> WorkerExit {
    let mut served = 0usize;
    loop {
        // Hold the receiver lock only while waiting; processing happens
        // with the lock released so other workers keep draining the lane.
        let job = { receiver.lock().await.recv().await };
        match job {
            None => return WorkerExit::Closed,
            Some(job) => {
                process_job(context, job).await;
                served += 1;
            }
        }

        // Recycle checks run after a served job, so a worker always makes
        // progress even when the process is already over the ceiling.
        if served >= context.config.max_jobs_per_worker {
            return WorkerExit::Recycled(RecycleReason::MaxJobs);
        }
        if let Some(limit) = context.config.memory_limit_bytes {
            if resident_memory_bytes().is_some_and(|rss| rss > limit) {
                return WorkerExit::Recycled(RecycleReason::MemoryCeiling);
            }
        }
    }
}

async fn process_job(context: &WorkerContext, job: QueuedJob) {
    let QueuedJob { id, request } = job;
    update_job(context, &id, state::STARTED, None);

    // The soft limit only signals; the backend may use it to stop early
    // and clean up. The hard limit abandons the step.
    let cancel = CancelSignal::new();
    let soft_timer = {
        let cancel = cancel.clone();
        let job_id = id.clone();
        let limit = context.config.soft_time_limit;
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            cancel.cancel();
            warn!(job_id = %job_id, "soft time limit reached, cancellation signalled");
        })
    };

    let outcome = tokio::time::timeout(
        context.config.hard_time_limit,
        run_job(context, &request, &cancel),
    )
    .await;
    soft_timer.abort();

    match outcome {
        Err(_) => fail_job(context, &id, &Error::Timeout(context.config.hard_time_limit)),
        Ok(Err(e)) => fail_job(context, &id, &e),
        Ok(Ok(predictions)) => {
            let key = format!("{}:{}", request.task_name, id);
            match context
                .results
                .set(&key, &predictions, context.config.result_ttl)
                .await
            {
                Ok(()) => {
                    update_job(context, &id, state::SUCCESS, None);
                    context.stats.write().completed += 1;
                    debug!(job_id = %id, "job completed");
                }
                Err(e) => fail_job(context, &id, &e),
            }
        }
    }
}

async fn run_job(
    context: &WorkerContext,
    request: &JobRequest,
    cancel: &CancelSignal,
) -> Result<Predictions> {
    let handle = context
        .registry
        .get(&request.model_name, &request.version_label, &request.task_name)
        .await?;
    handle.infer(&request.payload, cancel).await
}

fn fail_job(context: &WorkerContext, job_id: &str, err: &Error) {
    error!(job_id = %job_id, "job failed: {err}");
    update_job(context, job_id, state::FAILURE, Some(err.to_string()));
    context.stats.write().failed += 1;
}

fn update_job(context: &WorkerContext, job_id: &str, native: &'static str, error: Option<String>) {
    if let Some(mut entry) = context.jobs.get_mut(job_id) {
        entry.native = native;
        entry.error = error;
        if native == state::SUCCESS || native == state::FAILURE {
            // Terminal states outlive the cached result so that a poll after
            // TTL expiry reports "result expired" rather than an unknown job.
            entry.expires_at =
                Some(Instant::now() + context.config.result_ttl + STATE_RETENTION_MARGIN);
        }
    }
}

/// Process resident set size. Only implemented on Linux; elsewhere the
/// memory-ceiling recycle check is skipped and job-count recycling applies.
#[cfg(target_os = "linux")]
fn resident_memory_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_bytes() -> Option<u64> {
    None
}
