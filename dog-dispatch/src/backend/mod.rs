pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use std::pin::Pin;
use std::time::Duration;

use crate::{
    DispatchResult, Job, JobId, RankKey, WorkerId, WorkerState,
};

pub use memory::MemoryStore;

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Store primitives shared by every queue, worker and reaper process
///
/// Every method is a single atomic operation against the backing store.
/// Cross-process coordination relies on nothing else: `rank_remove` is the
/// claim point and `swap_job` guards record updates.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Allocate the next enqueue sequence number (monotonic, store-wide)
    async fn next_sequence(&self) -> DispatchResult<u64>;

    /// Insert a new job record, returning it with its initial version
    async fn insert_job(&self, job: Job) -> DispatchResult<Job>;

    async fn get_job(&self, job_id: &JobId) -> DispatchResult<Option<Job>>;

    /// Replace a job record if its stored version still equals `expected_version`
    ///
    /// Returns the stored record with the bumped version, or
    /// [`DispatchError::Conflict`](crate::DispatchError::Conflict).
    async fn swap_job(&self, expected_version: u64, job: Job) -> DispatchResult<Job>;

    async fn delete_job(&self, job_id: &JobId) -> DispatchResult<bool>;

    /// All job records of a queue
    async fn list_jobs(&self, queue: &str) -> DispatchResult<Vec<Job>>;

    /// Names of every queue that has ever held a job
    async fn queue_names(&self) -> DispatchResult<Vec<String>>;

    /// Add a job to the queue's ranked set
    async fn rank_insert(&self, queue: &str, job_id: &JobId, key: RankKey) -> DispatchResult<()>;

    /// Remove a job from the ranked set; `false` when someone else removed it first
    async fn rank_remove(&self, queue: &str, job_id: &JobId) -> DispatchResult<bool>;

    /// Best-ranked entries, without removing them
    async fn rank_head(&self, queue: &str, limit: usize) -> DispatchResult<Vec<(JobId, RankKey)>>;

    async fn rank_len(&self, queue: &str) -> DispatchResult<usize>;

    /// Hold a job back until `until`
    async fn delay_insert(&self, queue: &str, job_id: &JobId, until: DateTime<Utc>) -> DispatchResult<()>;

    /// Atomically remove and return every delayed job due at `now`
    async fn delay_take_due(&self, queue: &str, now: DateTime<Utc>) -> DispatchResult<Vec<JobId>>;

    async fn delay_remove(&self, queue: &str, job_id: &JobId) -> DispatchResult<bool>;

    async fn delay_len(&self, queue: &str) -> DispatchResult<usize>;

    /// Track a claimed job for orphan detection
    async fn processing_add(&self, queue: &str, job_id: &JobId) -> DispatchResult<()>;

    async fn processing_remove(&self, queue: &str, job_id: &JobId) -> DispatchResult<bool>;

    async fn processing_list(&self, queue: &str) -> DispatchResult<Vec<JobId>>;

    /// Write a worker record that expires after `ttl` unless refreshed
    async fn put_worker(&self, state: WorkerState, ttl: Duration) -> DispatchResult<()>;

    /// Live worker record; expired records are invisible
    async fn get_worker(&self, worker_id: &WorkerId) -> DispatchResult<Option<WorkerState>>;

    async fn list_workers(&self) -> DispatchResult<Vec<WorkerState>>;

    /// Flag a live worker record unhealthy, keeping its expiry; `false` if absent
    async fn mark_worker_unhealthy(&self, worker_id: &WorkerId) -> DispatchResult<bool>;

    async fn remove_worker(&self, worker_id: &WorkerId) -> DispatchResult<bool>;
}
