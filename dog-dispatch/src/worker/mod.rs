pub mod executor;
pub(crate) mod heartbeat;
pub mod pool;

pub use executor::JobExecutor;
pub use pool::{PoolStats, WorkerPool};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::WorkerConfig, observability::LatencyWindow, queue::JobQueue, DispatchError,
    DispatchResult, Job, JobId, JobResult, ResourceMetrics, WorkerId, WorkerState, WorkerStatus,
};

/// Live state of one worker, shared by its loop, its jobs and its heartbeat
pub(crate) struct WorkerShared {
    pub(crate) id: WorkerId,
    pub(crate) config: WorkerConfig,
    handler_types: Vec<String>,
    started_at: DateTime<Utc>,
    status: RwLock<WorkerStatus>,
    current_jobs: RwLock<Vec<JobId>>,
    healthy: AtomicBool,
    completed: AtomicU64,
    failed: AtomicU64,
    latency: RwLock<LatencyWindow>,
}

impl WorkerShared {
    fn new(id: WorkerId, config: WorkerConfig, handler_types: Vec<String>) -> Self {
        Self {
            id,
            config,
            handler_types,
            started_at: Utc::now(),
            status: RwLock::new(WorkerStatus::Starting),
            current_jobs: RwLock::new(Vec::new()),
            healthy: AtomicBool::new(true),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            latency: RwLock::new(LatencyWindow::new(100)),
        }
    }

    fn set_status(&self, status: WorkerStatus) {
        *self.status.write() = status;
    }

    pub(crate) fn status(&self) -> WorkerStatus {
        *self.status.read()
    }

    pub(crate) fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Relaxed);
    }

    pub(crate) fn active_jobs(&self) -> usize {
        self.current_jobs.read().len()
    }

    fn begin(&self, job_id: &JobId) {
        self.current_jobs.write().push(job_id.clone());
        let mut status = self.status.write();
        if matches!(*status, WorkerStatus::Idle | WorkerStatus::Error) {
            *status = WorkerStatus::Busy;
        }
    }

    fn finish(&self, job_id: &JobId, latency_ms: u64, success: bool) {
        if success {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.latency.write().record(latency_ms, success);

        let mut current = self.current_jobs.write();
        current.retain(|id| id != job_id);
        let mut status = self.status.write();
        if current.is_empty() && *status == WorkerStatus::Busy {
            *status = WorkerStatus::Idle;
        }
    }

    /// Snapshot as published to the store
    pub(crate) fn state(&self) -> WorkerState {
        let current_jobs = self.current_jobs.read().clone();
        let now = Utc::now();
        WorkerState {
            id: self.id.clone(),
            worker_type: self.config.worker_type.clone(),
            status: self.status(),
            handler_types: self.handler_types.clone(),
            queues: self.config.queues.clone(),
            last_heartbeat: now,
            started_at: self.started_at,
            resources: ResourceMetrics {
                active_jobs: current_jobs.len(),
                available_slots: self
                    .config
                    .max_concurrent_jobs
                    .saturating_sub(current_jobs.len()),
                jobs_completed: self.completed.load(Ordering::Relaxed),
                jobs_failed: self.failed.load(Ordering::Relaxed),
                avg_latency_ms: self.latency.read().avg_latency_ms(),
                uptime_secs: (now - self.started_at).num_seconds().max(0) as u64,
            },
            current_jobs,
            max_concurrent_jobs: self.config.max_concurrent_jobs,
            healthy: self.healthy.load(Ordering::Relaxed),
        }
    }
}

/// A queue worker: claims jobs and runs their handlers
///
/// Concurrency is bounded by `max_concurrent_jobs` slots. Every claimed job
/// runs on its own task; the heartbeat runs on another.
pub struct Worker {
    shared: Arc<WorkerShared>,
    queue: Arc<JobQueue>,
    executor: JobExecutor,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(id: WorkerId, queue: Arc<JobQueue>, executor: JobExecutor, config: WorkerConfig) -> Self {
        let handler_types = executor.handlers().registered_types();
        let slots = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Self {
            shared: Arc::new(WorkerShared::new(id, config, handler_types)),
            queue,
            executor,
            slots,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.shared.id
    }

    /// Start the worker loop on a new task
    pub fn spawn(self) -> WorkerHandle {
        let shared = self.shared.clone();
        let shutdown = self.shutdown.clone();
        let join = tokio::spawn(self.run());
        WorkerHandle {
            shared,
            shutdown,
            join,
        }
    }

    async fn run(self) {
        let Worker {
            shared,
            queue,
            executor,
            slots,
            shutdown,
        } = self;
        let store = queue.store().clone();

        shared.set_status(WorkerStatus::Idle);
        if let Err(e) = store.put_worker(shared.state(), shared.config.heartbeat_ttl).await {
            warn!(worker_id = %shared.id, "Failed to register worker: {}", e);
        }

        let heartbeat_stop = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat::run(
            shared.clone(),
            store.clone(),
            heartbeat_stop.clone(),
        ));

        info!(worker_id = %shared.id, queues = ?shared.config.queues, "Worker started");

        let mut in_flight: JoinSet<()> = JoinSet::new();
        loop {
            while let Some(finished) = in_flight.try_join_next() {
                if let Err(e) = finished {
                    error!(worker_id = %shared.id, "Job task failed: {}", e);
                }
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match next_job(&queue, &shared).await {
                Ok(Some(job)) => {
                    shared.begin(&job.id);
                    let queue = queue.clone();
                    let executor = executor.clone();
                    let shared = shared.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        process(job, &queue, &executor, &shared).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(shared.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(worker_id = %shared.id, "Error claiming job: {}", e);
                    if shared.active_jobs() == 0 {
                        shared.set_status(WorkerStatus::Error);
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(shared.config.error_backoff) => {}
                    }
                    if shared.status() == WorkerStatus::Error {
                        shared.set_status(WorkerStatus::Idle);
                    }
                }
            }
        }

        shared.set_status(WorkerStatus::ShuttingDown);
        if let Err(e) = heartbeat::beat(&shared, store.as_ref()).await {
            debug!(worker_id = %shared.id, "Final heartbeat failed: {}", e);
        }

        let drained = tokio::time::timeout(shared.config.shutdown_timeout, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                worker_id = %shared.id,
                in_flight = in_flight.len(),
                "Shutdown timeout reached, aborting in-flight jobs"
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }

        heartbeat_stop.cancel();
        let _ = heartbeat.await;

        shared.set_status(WorkerStatus::Stopped);
        if let Err(e) = store.remove_worker(&shared.id).await {
            warn!(worker_id = %shared.id, "Failed to deregister worker: {}", e);
        }
        queue.metrics().forget_worker(&shared.id);

        info!(worker_id = %shared.id, "Worker stopped");
    }
}

/// Claim from the worker's queues in configured order
async fn next_job(queue: &JobQueue, shared: &WorkerShared) -> DispatchResult<Option<Job>> {
    for name in &shared.config.queues {
        if let Some(job) = queue.dequeue(name, Some(&shared.id)).await? {
            return Ok(Some(job));
        }
    }
    Ok(None)
}

/// Execute one claimed job and report the outcome
async fn process(job: Job, queue: &JobQueue, executor: &JobExecutor, shared: &WorkerShared) {
    debug!(job_id = %job.id, job_type = %job.job_type, worker_id = %shared.id, "Processing job");

    let started = Instant::now();
    let outcome = executor.execute(&job).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let success = match outcome {
        Ok(data) => {
            let result = JobResult::success(data, elapsed_ms, Some(shared.id.clone()));
            match queue.complete(&job.id, result).await {
                Ok(_) => true,
                Err(e) => {
                    warn!(job_id = %job.id, worker_id = %shared.id, "Completion not recorded: {}", e);
                    false
                }
            }
        }
        Err(err) => {
            if let Err(e) = queue
                .fail_for_worker(&job.id, Some(&shared.id), &err, elapsed_ms)
                .await
            {
                warn!(job_id = %job.id, worker_id = %shared.id, "Failure not recorded: {}", e);
            }
            false
        }
    };

    shared.finish(&job.id, elapsed_ms, success);
}

/// Handle to a running worker
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn id(&self) -> &WorkerId {
        &self.shared.id
    }

    /// Current worker record
    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    pub fn active_jobs(&self) -> usize {
        self.shared.active_jobs()
    }

    pub fn is_healthy(&self) -> bool {
        self.shared.healthy.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop claiming, drain in-flight jobs within the shutdown timeout, then deregister
    pub async fn shutdown(self) -> DispatchResult<()> {
        self.shutdown.cancel();
        self.join
            .await
            .map_err(|e| DispatchError::Internal(format!("Worker join error: {}", e)))
    }
}
