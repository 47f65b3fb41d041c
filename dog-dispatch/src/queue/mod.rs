pub mod reaper;
pub mod retry;

pub use reaper::{OrphanReaper, ReapStats};
pub use retry::RetryPolicy;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{debug, info, instrument, warn};

use crate::{
    backend::{BoxStream, JobStore, MemoryStore},
    codec::Payload,
    config::QueueConfig,
    job::JobDefinition,
    observability::MetricsCollector,
    DispatchError, DispatchResult, Job, JobError, JobEvent, JobId, JobPriority, JobResult,
    JobStatus, RankKey, WorkerId,
};

/// Bound on read-modify-swap rounds for one job update
const MAX_SWAP_ATTEMPTS: usize = 16;

/// Parameters for one enqueue call
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub queue_name: String,
    pub job_type: String,
    pub payload: Payload,
    pub priority: JobPriority,
    pub delay_until: Option<DateTime<Utc>>,

    /// Falls back to [`QueueConfig::default_max_retries`]
    pub max_retries: Option<u32>,

    /// Falls back to [`QueueConfig::default_timeout_seconds`]
    pub timeout_seconds: Option<u64>,

    pub metadata: HashMap<String, String>,
}

impl EnqueueRequest {
    pub fn new(queue_name: impl Into<String>, job_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            queue_name: queue_name.into(),
            job_type: job_type.into(),
            payload,
            priority: JobPriority::default(),
            delay_until: None,
            max_retries: None,
            timeout_seconds: None,
            metadata: HashMap::new(),
        }
    }

    /// Request with a JSON-encoded payload
    pub fn json<T: Serialize + ?Sized>(
        queue_name: impl Into<String>,
        job_type: impl Into<String>,
        payload: &T,
    ) -> DispatchResult<Self> {
        Ok(Self::new(queue_name, job_type, Payload::json(payload)?))
    }

    /// Request for a typed job, carrying its type, priority and limits
    pub fn for_job<J: JobDefinition>(queue_name: impl Into<String>, job: &J) -> DispatchResult<Self> {
        Ok(Self::new(queue_name, J::JOB_TYPE, Payload::json(job)?)
            .with_priority(job.priority())
            .with_max_retries(job.max_retries())
            .with_timeout_seconds(J::TIMEOUT_SECONDS))
    }

    pub fn with_priority(mut self, priority: impl Into<JobPriority>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn with_delay_until(mut self, delay_until: DateTime<Utc>) -> Self {
        self.delay_until = Some(delay_until);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Per-queue counts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_name: String,

    /// Pending and visible to dequeue
    pub ready: usize,

    /// Pending but held back by `delay_until`
    pub delayed: usize,

    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueStats {
    /// Ready plus delayed
    pub fn pending(&self) -> usize {
        self.ready + self.delayed
    }
}

/// Constraints checked when a failure is applied
#[derive(Debug, Clone, Copy)]
struct FailGuard<'a> {
    /// Reject with `NotOwner` when another worker holds the job
    worker_id: Option<&'a WorkerId>,

    /// Reject with `Conflict` if the record moved on since it was observed
    expected_version: Option<u64>,

    /// Apply the retry policy's backoff
    backoff: bool,

    execution_time_ms: u64,
}

/// Priority-ordered, multi-queue job queue over a [`JobStore`]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    config: QueueConfig,
    metrics: Arc<MetricsCollector>,
    events: broadcast::Sender<JobEvent>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, config: QueueConfig, metrics: Arc<MetricsCollector>) -> Self {
        let (events, _) = broadcast::channel(1000);
        Self {
            store,
            config,
            metrics,
            events,
        }
    }

    /// Queue over a fresh [`MemoryStore`] with default settings
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            QueueConfig::default(),
            Arc::new(MetricsCollector::new()),
        )
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Stream of job lifecycle events
    pub fn subscribe(&self) -> BoxStream<JobEvent> {
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(|event| event.ok());
        Box::pin(stream)
    }

    fn publish(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    fn validate(&self, request: &EnqueueRequest) -> DispatchResult<()> {
        if request.queue_name.trim().is_empty() {
            return Err(DispatchError::Validation("queue_name must not be empty".to_string()));
        }
        if request.job_type.trim().is_empty() {
            return Err(DispatchError::Validation("job_type must not be empty".to_string()));
        }
        if let Some(timeout) = request.timeout_seconds {
            if timeout == 0 || timeout > self.config.max_timeout_seconds {
                return Err(DispatchError::Validation(format!(
                    "timeout_seconds must be within 1..={}",
                    self.config.max_timeout_seconds
                )));
            }
        }
        if let Some(retries) = request.max_retries {
            if retries > self.config.max_retries_limit {
                return Err(DispatchError::Validation(format!(
                    "max_retries must not exceed {}",
                    self.config.max_retries_limit
                )));
            }
        }
        if request.payload.size() > self.config.max_payload_bytes {
            return Err(DispatchError::Validation(format!(
                "payload of {} bytes exceeds limit of {}",
                request.payload.size(),
                self.config.max_payload_bytes
            )));
        }
        request.payload.check_version()
    }

    /// Validate and enqueue a job, returning its id
    #[instrument(skip_all, fields(queue = %request.queue_name, job_type = %request.job_type))]
    pub async fn enqueue(&self, request: EnqueueRequest) -> DispatchResult<JobId> {
        self.validate(&request)?;

        let now = Utc::now();
        let mut job = Job::new(request.queue_name, request.job_type, request.payload);
        job.priority = request.priority;
        job.max_retries = request.max_retries.unwrap_or(self.config.default_max_retries);
        job.timeout_seconds = request
            .timeout_seconds
            .unwrap_or(self.config.default_timeout_seconds);
        job.delay_until = request.delay_until.filter(|until| *until > now);
        job.metadata = request.metadata;
        job.sequence = self.store.next_sequence().await?;

        let job = self.store.insert_job(job).await?;
        let delayed = match job.delay_until {
            Some(until) => {
                self.store.delay_insert(&job.queue_name, &job.id, until).await?;
                true
            }
            None => {
                self.store
                    .rank_insert(&job.queue_name, &job.id, job.rank_key())
                    .await?;
                false
            }
        };

        self.metrics.record_enqueued(&job.job_type);
        self.publish(JobEvent::Enqueued {
            job_id: job.id.clone(),
            queue: job.queue_name.clone(),
            job_type: job.job_type.clone(),
            delayed,
            at: now,
        });

        info!(job_id = %job.id, priority = job.priority.value(), delayed, "Job enqueued");
        Ok(job.id)
    }

    /// Move delayed jobs whose time has come into the ranked set
    ///
    /// Entries taken from the delayed set but not yet promoted when the store
    /// fails go back into the delayed set, due at `now`.
    pub async fn promote_due(&self, queue: &str, now: DateTime<Utc>) -> DispatchResult<usize> {
        let mut due = self.store.delay_take_due(queue, now).await?.into_iter();
        let mut promoted = 0;

        while let Some(job_id) = due.next() {
            match self.promote_one(queue, &job_id).await {
                Ok(true) => promoted += 1,
                Ok(false) => debug!(job_id = %job_id, "Dropping stale delayed entry"),
                Err(e) => {
                    for held in std::iter::once(job_id).chain(due) {
                        if let Err(restore) = self.store.delay_insert(queue, &held, now).await {
                            warn!(job_id = %held, error = %restore, "Failed to restore delayed entry");
                        }
                    }
                    return Err(e);
                }
            }
        }

        if promoted > 0 {
            debug!(queue, promoted, "Promoted delayed jobs");
        }
        Ok(promoted)
    }

    async fn promote_one(&self, queue: &str, job_id: &JobId) -> DispatchResult<bool> {
        match self.store.get_job(job_id).await? {
            Some(job) if job.status == JobStatus::Pending => {
                self.store.rank_insert(queue, &job.id, job.rank_key()).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Claim the best-ranked ready job of `queue`
    ///
    /// Removal from the ranked set decides ownership: a candidate someone
    /// else removed first is skipped and the next one is tried.
    pub async fn dequeue(&self, queue: &str, worker_id: Option<&WorkerId>) -> DispatchResult<Option<Job>> {
        self.promote_due(queue, Utc::now()).await?;

        loop {
            let head = self.store.rank_head(queue, self.config.claim_batch).await?;
            if head.is_empty() {
                return Ok(None);
            }

            for (job_id, key) in head {
                if !self.store.rank_remove(queue, &job_id).await? {
                    continue;
                }
                match self.claim(&job_id, worker_id).await {
                    Ok(Some(job)) => return Ok(Some(job)),
                    Ok(None) => {}
                    Err(e) => {
                        self.restore_ranked(queue, &job_id, key).await;
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Put back a ranked entry whose claim failed part way
    ///
    /// A job that did become Processing is skipped and dropped by the next
    /// dequeue, and the reaper still finds it through the processing index.
    async fn restore_ranked(&self, queue: &str, job_id: &JobId, key: RankKey) {
        match self.store.rank_insert(queue, job_id, key).await {
            Ok(()) => warn!(job_id = %job_id, "Claim failed, job returned to the ranked set"),
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to return job to the ranked set"),
        }
    }

    /// Mark a job removed from the ranked set as processing
    ///
    /// The processing index is written before the record swap, so no
    /// failure leaves a Processing job the reaper cannot see.
    async fn claim(&self, job_id: &JobId, worker_id: Option<&WorkerId>) -> DispatchResult<Option<Job>> {
        for _ in 0..MAX_SWAP_ATTEMPTS {
            let mut job = match self.store.get_job(job_id).await? {
                Some(job) => job,
                None => return Ok(None),
            };
            if job.status != JobStatus::Pending {
                debug!(job_id = %job_id, status = %job.status, "Skipping non-pending ranked entry");
                return Ok(None);
            }

            let now = Utc::now();
            if job.is_delayed(now) {
                if let Some(until) = job.delay_until {
                    self.store.delay_insert(&job.queue_name, job_id, until).await?;
                }
                return Ok(None);
            }

            let version = job.version;
            job.start_processing(worker_id.cloned(), now)?;
            self.store.processing_add(&job.queue_name, job_id).await?;
            match self.store.swap_job(version, job).await {
                Ok(job) => {
                    self.metrics.record_claimed();
                    self.publish(JobEvent::Claimed {
                        job_id: job.id.clone(),
                        worker_id: job.worker_id.clone(),
                        at: now,
                    });
                    debug!(job_id = %job.id, worker_id = ?job.worker_id, "Job claimed");
                    return Ok(Some(job));
                }
                Err(DispatchError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(DispatchError::Storage(format!("Gave up claiming job {} after concurrent updates", job_id)))
    }

    /// Best-ranked ready job, without claiming it
    pub async fn peek(&self, queue: &str) -> DispatchResult<Option<Job>> {
        self.promote_due(queue, Utc::now()).await?;

        for (job_id, _) in self.store.rank_head(queue, self.config.claim_batch).await? {
            if let Some(job) = self.store.get_job(&job_id).await? {
                if job.status == JobStatus::Pending {
                    return Ok(Some(job));
                }
            }
        }
        Ok(None)
    }

    /// Pending jobs of `queue`, ready plus delayed
    pub async fn queue_length(&self, queue: &str) -> DispatchResult<usize> {
        Ok(self.store.rank_len(queue).await? + self.store.delay_len(queue).await?)
    }

    pub async fn get_queue_stats(&self, queue: &str) -> DispatchResult<QueueStats> {
        let mut stats = QueueStats {
            queue_name: queue.to_string(),
            ready: self.store.rank_len(queue).await?,
            delayed: self.store.delay_len(queue).await?,
            ..QueueStats::default()
        };

        for job in self.store.list_jobs(queue).await? {
            match job.status {
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
                JobStatus::Pending => {}
            }
        }
        Ok(stats)
    }

    pub async fn queue_names(&self) -> DispatchResult<Vec<String>> {
        self.store.queue_names().await
    }

    /// Look up a job's status, result and error
    pub async fn get_job(&self, job_id: &JobId) -> DispatchResult<Job> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| DispatchError::JobNotFound(job_id.to_string()))
    }

    /// Record a successful execution
    ///
    /// When `result.worker_id` is set it must be the current holder.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn complete(&self, job_id: &JobId, result: JobResult) -> DispatchResult<Job> {
        for _ in 0..MAX_SWAP_ATTEMPTS {
            let mut job = self.get_job(job_id).await?;
            if job.status == JobStatus::Processing {
                check_owner(&job, result.worker_id.as_ref())?;
            }

            let version = job.version;
            let execution_ms = result.execution_time_ms;
            job.complete(result.clone(), Utc::now())?;

            match self.store.swap_job(version, job).await {
                Ok(job) => {
                    self.store.processing_remove(&job.queue_name, &job.id).await?;
                    self.metrics
                        .record_completed(&job.job_type, job.worker_id.as_ref(), execution_ms);
                    self.publish(JobEvent::Completed {
                        job_id: job.id.clone(),
                        at: job.updated_at,
                    });
                    info!(execution_ms, "Job completed");
                    return Ok(job);
                }
                Err(DispatchError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(DispatchError::Storage(format!("Gave up completing job {} after concurrent updates", job_id)))
    }

    /// Record a failed execution; returns whether the job was retried
    pub async fn fail(&self, job_id: &JobId, error: &JobError) -> DispatchResult<bool> {
        self.fail_for_worker(job_id, None, error, 0).await
    }

    /// Record a failed execution reported by `worker_id`
    pub async fn fail_for_worker(
        &self,
        job_id: &JobId,
        worker_id: Option<&WorkerId>,
        error: &JobError,
        execution_time_ms: u64,
    ) -> DispatchResult<bool> {
        let guard = FailGuard {
            worker_id,
            expected_version: None,
            backoff: true,
            execution_time_ms,
        };
        self.apply_failure(job_id, guard, error).await.map(|(_, retried)| retried)
    }

    /// Take a processing job back from a dead or overdue worker
    ///
    /// `observed` is the record the caller judged orphaned; if it changed
    /// since, the reclaim is abandoned with `Conflict`. The job skips
    /// backoff and is ready again immediately when retries remain.
    pub async fn reclaim(&self, observed: &Job, reason: &str, now: DateTime<Utc>) -> DispatchResult<bool> {
        let elapsed_ms = observed
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        let guard = FailGuard {
            worker_id: None,
            expected_version: Some(observed.version),
            backoff: false,
            execution_time_ms: elapsed_ms,
        };

        let (job, retried) = self
            .apply_failure(&observed.id, guard, &JobError::Timeout(observed.timeout_seconds))
            .await?;

        self.metrics.record_reclaimed();
        self.publish(JobEvent::Reclaimed {
            job_id: job.id.clone(),
            worker_id: observed.worker_id.clone(),
            reason: reason.to_string(),
            at: now,
        });
        warn!(job_id = %job.id, worker_id = ?observed.worker_id, reason, retried, "Reclaimed orphaned job");
        Ok(retried)
    }

    async fn apply_failure(
        &self,
        job_id: &JobId,
        guard: FailGuard<'_>,
        error: &JobError,
    ) -> DispatchResult<(Job, bool)> {
        let message = error.message();

        for _ in 0..MAX_SWAP_ATTEMPTS {
            let mut job = self.get_job(job_id).await?;
            if let Some(expected) = guard.expected_version {
                if job.version != expected {
                    return Err(DispatchError::Conflict {
                        job_id: job_id.to_string(),
                        expected,
                        found: job.version,
                    });
                }
            }
            if job.status == JobStatus::Processing {
                check_owner(&job, guard.worker_id)?;
            }

            let now = Utc::now();
            let version = job.version;
            let holder = job.worker_id.clone();

            let retried = error.is_retryable() && job.can_retry();
            if retried {
                let delay_until = if guard.backoff {
                    self.config.retry.retry_at(job.retry_count + 1, now)
                } else {
                    None
                };
                job.schedule_retry(message.clone(), delay_until, now)?;
                job.sequence = self.store.next_sequence().await?;
            } else {
                job.fail(message.clone(), guard.execution_time_ms, now)?;
            }

            let job = match self.store.swap_job(version, job).await {
                Ok(job) => job,
                Err(DispatchError::Conflict { .. }) if guard.expected_version.is_none() => continue,
                Err(e) => return Err(e),
            };

            self.store.processing_remove(&job.queue_name, &job.id).await?;
            self.metrics.record_failed(
                &job.job_type,
                holder.as_ref(),
                guard.execution_time_ms,
                retried,
            );

            if retried {
                match job.delay_until {
                    Some(until) => self.store.delay_insert(&job.queue_name, &job.id, until).await?,
                    None => {
                        self.store
                            .rank_insert(&job.queue_name, &job.id, job.rank_key())
                            .await?
                    }
                }
                self.publish(JobEvent::Retrying {
                    job_id: job.id.clone(),
                    retry_count: job.retry_count,
                    delay_until: job.delay_until,
                    error: message.clone(),
                    at: now,
                });
                warn!(
                    job_id = %job.id,
                    retry_count = job.retry_count,
                    max_retries = job.max_retries,
                    error = %message,
                    "Job failed, scheduled for retry"
                );
            } else {
                self.publish(JobEvent::Failed {
                    job_id: job.id.clone(),
                    error: message.clone(),
                    at: now,
                });
                tracing::error!(
                    job_id = %job.id,
                    retry_count = job.retry_count,
                    error = %message,
                    "Job failed permanently"
                );
            }
            return Ok((job, retried));
        }

        Err(DispatchError::Storage(format!("Gave up failing job {} after concurrent updates", job_id)))
    }

    /// Cancel a pending or processing job
    ///
    /// Cancellation wins: a later `complete` or `fail` returns `JobCancelled`.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn cancel(&self, job_id: &JobId) -> DispatchResult<Job> {
        for _ in 0..MAX_SWAP_ATTEMPTS {
            let mut job = self.get_job(job_id).await?;
            let version = job.version;
            job.cancel(Utc::now())?;

            match self.store.swap_job(version, job).await {
                Ok(job) => {
                    self.store.rank_remove(&job.queue_name, &job.id).await?;
                    self.store.delay_remove(&job.queue_name, &job.id).await?;
                    self.store.processing_remove(&job.queue_name, &job.id).await?;
                    self.metrics.record_cancelled(&job.job_type);
                    self.publish(JobEvent::Cancelled {
                        job_id: job.id.clone(),
                        at: job.updated_at,
                    });
                    info!("Job cancelled");
                    return Ok(job);
                }
                Err(DispatchError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(DispatchError::Storage(format!("Gave up cancelling job {} after concurrent updates", job_id)))
    }

    /// Delete terminal jobs of `queue` finished before `cutoff`
    pub async fn purge_terminal(&self, queue: &str, cutoff: DateTime<Utc>) -> DispatchResult<usize> {
        let mut purged = 0;
        for job in self.store.list_jobs(queue).await? {
            let expired = job.status.is_terminal()
                && job.completed_at.map_or(false, |finished| finished < cutoff);
            if expired && self.store.delete_job(&job.id).await? {
                purged += 1;
            }
        }
        Ok(purged)
    }
}

fn check_owner(job: &Job, worker_id: Option<&WorkerId>) -> DispatchResult<()> {
    match (worker_id, job.worker_id.as_ref()) {
        (Some(claimed_by), Some(holder)) if claimed_by != holder => Err(DispatchError::NotOwner {
            job_id: job.id.to_string(),
            worker_id: claimed_by.to_string(),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn immediate_queue() -> JobQueue {
        JobQueue::new(
            Arc::new(MemoryStore::new()),
            QueueConfig::default().with_retry_policy(RetryPolicy::immediate()),
            Arc::new(MetricsCollector::new()),
        )
    }

    fn request(priority: i32) -> EnqueueRequest {
        EnqueueRequest::json("default", "echo", &json!({"p": priority}))
            .unwrap()
            .with_priority(priority)
    }

    #[tokio::test]
    async fn test_validation_rejects_before_enqueue() {
        let queue = immediate_queue();

        let err = queue.enqueue(request(1).with_timeout_seconds(0)).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));

        let mut bad = request(1);
        bad.job_type = " ".into();
        assert!(matches!(queue.enqueue(bad).await, Err(DispatchError::Validation(_))));

        assert_eq!(queue.queue_length("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_peek_does_not_claim() {
        let queue = immediate_queue();
        let id = queue.enqueue(request(5)).await.unwrap();

        assert_eq!(queue.peek("default").await.unwrap().map(|j| j.id), Some(id.clone()));
        assert_eq!(queue.queue_length("default").await.unwrap(), 1);
        assert_eq!(queue.dequeue("default", None).await.unwrap().map(|j| j.id), Some(id));
    }

    #[tokio::test]
    async fn test_complete_checks_owner() {
        let queue = immediate_queue();
        let id = queue.enqueue(request(5)).await.unwrap();
        let worker: WorkerId = "w1".into();
        queue.dequeue("default", Some(&worker)).await.unwrap().unwrap();

        let intruder = JobResult::success(json!(1), 1, Some("w2".into()));
        assert!(matches!(
            queue.complete(&id, intruder).await,
            Err(DispatchError::NotOwner { .. })
        ));

        let job = queue
            .complete(&id, JobResult::success(json!(1), 1, Some(worker)))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(queue.get_queue_stats("default").await.unwrap().processing, 0);
    }

    #[tokio::test]
    async fn test_permanent_error_fails_immediately() {
        let queue = immediate_queue();
        let id = queue.enqueue(request(5).with_max_retries(5)).await.unwrap();
        queue.dequeue("default", None).await.unwrap().unwrap();

        let retried = queue.fail(&id, &JobError::permanent("bad input")).await.unwrap();
        assert!(!retried);

        let job = queue.get_job(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.error.as_deref(), Some("bad input"));
    }

    #[tokio::test]
    async fn test_retry_with_backoff_is_delayed() {
        let queue = JobQueue::in_memory();
        let id = queue.enqueue(request(5)).await.unwrap();
        queue.dequeue("default", None).await.unwrap().unwrap();

        assert!(queue.fail(&id, &JobError::retryable("flaky")).await.unwrap());

        let stats = queue.get_queue_stats("default").await.unwrap();
        assert_eq!(stats.ready, 0);
        assert_eq!(stats.delayed, 1);
        assert!(queue.dequeue("default", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_removes_from_ranked_set() {
        let queue = immediate_queue();
        let id = queue.enqueue(request(5)).await.unwrap();

        queue.cancel(&id).await.unwrap();
        assert!(queue.dequeue("default", None).await.unwrap().is_none());
        assert!(matches!(
            queue.cancel(&id).await,
            Err(DispatchError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_purge_terminal() {
        let queue = immediate_queue();
        let id = queue.enqueue(request(5)).await.unwrap();
        queue.dequeue("default", None).await.unwrap().unwrap();
        queue.complete(&id, JobResult::success(json!(1), 1, None)).await.unwrap();

        let future = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(queue.purge_terminal("default", future).await.unwrap(), 1);
        assert!(matches!(queue.get_job(&id).await, Err(DispatchError::JobNotFound(_))));
    }
}
