use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

use super::{JobId, JobPriority, JobResult, WorkerId};
use crate::{codec::Payload, DispatchError, DispatchResult};

/// Job status lifecycle
///
/// `Pending -> Processing -> {Completed | Pending (retry) | Failed}`, and
/// `Pending | Processing -> Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the ranked set, or in the delayed set until `delay_until`
    Pending,

    /// Claimed by exactly one worker
    Processing,

    Completed,

    /// Failed permanently (retries exhausted or non-retryable error)
    Failed,

    Cancelled,
}

impl JobStatus {
    /// Check if the job is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Get the status name as a string
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Position of a job inside a queue's ranked set
///
/// Orders by descending priority, then ascending enqueue sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RankKey {
    pub priority: i32,
    pub sequence: u64,
}

impl RankKey {
    pub fn new(priority: JobPriority, sequence: u64) -> Self {
        Self {
            priority: priority.value(),
            sequence,
        }
    }

    /// Single ascending score for sorted-set stores (lowest pops first)
    ///
    /// Exact while sequences stay below 2^32.
    pub fn score(&self) -> f64 {
        -(self.priority as f64) * 4_294_967_296.0 + self.sequence as f64
    }
}

impl Ord for RankKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for RankKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Job record - the persisted unit of asynchronous work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    pub job_type: String,
    pub payload: Payload,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub max_retries: u32,
    pub retry_count: u32,
    pub timeout_seconds: u64,

    /// Invisible to dequeue until this instant
    pub delay_until: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Current holder while processing, last holder afterwards
    pub worker_id: Option<WorkerId>,

    pub result: Option<JobResult>,
    pub error: Option<String>,
    pub metadata: HashMap<String, String>,

    /// Enqueue order, embedded in the ranking key
    pub sequence: u64,

    /// Optimistic concurrency version, bumped on every store write
    pub version: u64,
}

impl Job {
    /// Create a pending job with default limits
    pub fn new(queue_name: impl Into<String>, job_type: impl Into<String>, payload: Payload) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            queue_name: queue_name.into(),
            job_type: job_type.into(),
            payload,
            priority: JobPriority::default(),
            status: JobStatus::Pending,
            max_retries: 3,
            retry_count: 0,
            timeout_seconds: 300,
            delay_until: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            worker_id: None,
            result: None,
            error: None,
            metadata: HashMap::new(),
            sequence: 0,
            version: 0,
        }
    }

    /// Ranking key for the queue's ranked set
    pub fn rank_key(&self) -> RankKey {
        RankKey::new(self.priority, self.sequence)
    }

    /// Check if the job is still held back by `delay_until`
    pub fn is_delayed(&self, now: DateTime<Utc>) -> bool {
        self.delay_until.map_or(false, |until| until > now)
    }

    /// Check if the job may be handed to a worker
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && !self.is_delayed(now)
    }

    /// Check if another attempt is allowed
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Total attempts so far, including the running one
    pub fn attempts(&self) -> u32 {
        match self.status {
            JobStatus::Pending => self.retry_count,
            _ => self.retry_count + 1,
        }
    }

    /// When a processing job must have finished
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.started_at
            .map(|started| started + chrono::Duration::seconds(self.timeout_seconds as i64))
    }

    /// Claim the job for a worker
    pub fn start_processing(&mut self, worker_id: Option<WorkerId>, now: DateTime<Utc>) -> DispatchResult<()> {
        if self.status != JobStatus::Pending {
            return Err(self.transition_error(JobStatus::Processing));
        }
        self.status = JobStatus::Processing;
        self.worker_id = worker_id;
        self.started_at = Some(now);
        self.delay_until = None;
        self.updated_at = now;
        Ok(())
    }

    /// Complete the job successfully
    pub fn complete(&mut self, result: JobResult, now: DateTime<Utc>) -> DispatchResult<()> {
        self.ensure_processing(JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Return the job to pending for another attempt
    pub fn schedule_retry(
        &mut self,
        error: String,
        delay_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DispatchResult<()> {
        self.ensure_processing(JobStatus::Pending)?;
        if !self.can_retry() {
            return Err(self.transition_error(JobStatus::Pending));
        }
        self.retry_count += 1;
        self.status = JobStatus::Pending;
        self.error = Some(error);
        self.delay_until = delay_until;
        self.started_at = None;
        self.worker_id = None;
        self.updated_at = now;
        Ok(())
    }

    /// Fail the job permanently
    pub fn fail(&mut self, error: String, execution_time_ms: u64, now: DateTime<Utc>) -> DispatchResult<()> {
        self.ensure_processing(JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.result = Some(JobResult::failure(
            error.clone(),
            execution_time_ms,
            self.worker_id.clone(),
        ));
        self.error = Some(error);
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Cancel the job
    pub fn cancel(&mut self, now: DateTime<Utc>) -> DispatchResult<()> {
        if self.status.is_terminal() {
            return Err(self.transition_error(JobStatus::Cancelled));
        }
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    fn ensure_processing(&self, to: JobStatus) -> DispatchResult<()> {
        match self.status {
            JobStatus::Processing => Ok(()),
            JobStatus::Cancelled => Err(DispatchError::JobCancelled(self.id.to_string())),
            _ => Err(self.transition_error(to)),
        }
    }

    fn transition_error(&self, to: JobStatus) -> DispatchError {
        DispatchError::InvalidTransition {
            job_id: self.id.to_string(),
            from: self.status.name(),
            to: to.name(),
        }
    }
}
