use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use dog_dispatch::{
    config::{QueueConfig, ReaperConfig},
    observability::MetricsCollector,
    DispatchError, DispatchResult, EnqueueRequest, Job, JobId, JobQueue, JobStatus, JobStore,
    MemoryStore, OrphanReaper, RankKey, RetryPolicy, WorkerId, WorkerState,
};

/// In-memory store that fails the next N reads or swaps
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    failing_reads: AtomicUsize,
    failing_swaps: AtomicUsize,
}

impl FlakyStore {
    fn fail_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    fn fail_swaps(&self, count: usize) {
        self.failing_swaps.store(count, Ordering::SeqCst);
    }

    fn trip(counter: &AtomicUsize) -> DispatchResult<()> {
        match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1)) {
            Ok(_) => Err(DispatchError::Storage("connection reset".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn next_sequence(&self) -> DispatchResult<u64> {
        self.inner.next_sequence().await
    }

    async fn insert_job(&self, job: Job) -> DispatchResult<Job> {
        self.inner.insert_job(job).await
    }

    async fn get_job(&self, job_id: &JobId) -> DispatchResult<Option<Job>> {
        Self::trip(&self.failing_reads)?;
        self.inner.get_job(job_id).await
    }

    async fn swap_job(&self, expected_version: u64, job: Job) -> DispatchResult<Job> {
        Self::trip(&self.failing_swaps)?;
        self.inner.swap_job(expected_version, job).await
    }

    async fn delete_job(&self, job_id: &JobId) -> DispatchResult<bool> {
        self.inner.delete_job(job_id).await
    }

    async fn list_jobs(&self, queue: &str) -> DispatchResult<Vec<Job>> {
        self.inner.list_jobs(queue).await
    }

    async fn queue_names(&self) -> DispatchResult<Vec<String>> {
        self.inner.queue_names().await
    }

    async fn rank_insert(&self, queue: &str, job_id: &JobId, key: RankKey) -> DispatchResult<()> {
        self.inner.rank_insert(queue, job_id, key).await
    }

    async fn rank_remove(&self, queue: &str, job_id: &JobId) -> DispatchResult<bool> {
        self.inner.rank_remove(queue, job_id).await
    }

    async fn rank_head(&self, queue: &str, limit: usize) -> DispatchResult<Vec<(JobId, RankKey)>> {
        self.inner.rank_head(queue, limit).await
    }

    async fn rank_len(&self, queue: &str) -> DispatchResult<usize> {
        self.inner.rank_len(queue).await
    }

    async fn delay_insert(&self, queue: &str, job_id: &JobId, until: DateTime<Utc>) -> DispatchResult<()> {
        self.inner.delay_insert(queue, job_id, until).await
    }

    async fn delay_take_due(&self, queue: &str, now: DateTime<Utc>) -> DispatchResult<Vec<JobId>> {
        self.inner.delay_take_due(queue, now).await
    }

    async fn delay_remove(&self, queue: &str, job_id: &JobId) -> DispatchResult<bool> {
        self.inner.delay_remove(queue, job_id).await
    }

    async fn delay_len(&self, queue: &str) -> DispatchResult<usize> {
        self.inner.delay_len(queue).await
    }

    async fn processing_add(&self, queue: &str, job_id: &JobId) -> DispatchResult<()> {
        self.inner.processing_add(queue, job_id).await
    }

    async fn processing_remove(&self, queue: &str, job_id: &JobId) -> DispatchResult<bool> {
        self.inner.processing_remove(queue, job_id).await
    }

    async fn processing_list(&self, queue: &str) -> DispatchResult<Vec<JobId>> {
        self.inner.processing_list(queue).await
    }

    async fn put_worker(&self, state: WorkerState, ttl: Duration) -> DispatchResult<()> {
        self.inner.put_worker(state, ttl).await
    }

    async fn get_worker(&self, worker_id: &WorkerId) -> DispatchResult<Option<WorkerState>> {
        self.inner.get_worker(worker_id).await
    }

    async fn list_workers(&self) -> DispatchResult<Vec<WorkerState>> {
        self.inner.list_workers().await
    }

    async fn mark_worker_unhealthy(&self, worker_id: &WorkerId) -> DispatchResult<bool> {
        self.inner.mark_worker_unhealthy(worker_id).await
    }

    async fn remove_worker(&self, worker_id: &WorkerId) -> DispatchResult<bool> {
        self.inner.remove_worker(worker_id).await
    }
}

fn create_queue() -> (Arc<FlakyStore>, Arc<JobQueue>) {
    let store = Arc::new(FlakyStore::default());
    let queue = Arc::new(JobQueue::new(
        store.clone(),
        QueueConfig::default().with_retry_policy(RetryPolicy::immediate()),
        Arc::new(MetricsCollector::new()),
    ));
    (store, queue)
}

fn create_request() -> EnqueueRequest {
    EnqueueRequest::json("default", "render", &json!({ "frame": 1 })).unwrap()
}

#[tokio::test]
async fn test_read_fault_during_claim_keeps_job_ready() {
    let (store, queue) = create_queue();
    let id = queue.enqueue(create_request()).await.unwrap();

    store.fail_reads(1);
    let err = queue.dequeue("default", None).await.unwrap_err();
    assert!(matches!(err, DispatchError::Storage(_)));

    let stats = queue.get_queue_stats("default").await.unwrap();
    assert_eq!((stats.ready, stats.processing), (1, 0));

    let reaper = OrphanReaper::new(queue.clone(), ReaperConfig::default());
    reaper.reap_at(Utc::now() + chrono::Duration::days(1)).await.unwrap();
    assert_eq!(queue.get_job(&id).await.unwrap().status, JobStatus::Pending);

    let job = queue.dequeue("default", None).await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.status, JobStatus::Processing);
}

#[tokio::test]
async fn test_swap_fault_during_claim_keeps_job_ready() {
    let (store, queue) = create_queue();
    let id = queue.enqueue(create_request()).await.unwrap();

    store.fail_swaps(1);
    assert!(queue.dequeue("default", None).await.is_err());
    assert_eq!(queue.get_job(&id).await.unwrap().status, JobStatus::Pending);
    assert_eq!(queue.get_queue_stats("default").await.unwrap().ready, 1);

    let job = queue.dequeue("default", None).await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(queue.get_queue_stats("default").await.unwrap().processing, 1);
    assert!(store.processing_list("default").await.unwrap().contains(&id));
}

#[tokio::test]
async fn test_read_fault_during_promotion_keeps_jobs_delayed() {
    let (store, queue) = create_queue();
    let due_at = Utc::now() + chrono::Duration::hours(1);
    for _ in 0..2 {
        queue
            .enqueue(create_request().with_delay_until(due_at))
            .await
            .unwrap();
    }
    assert_eq!(queue.get_queue_stats("default").await.unwrap().delayed, 2);

    store.fail_reads(1);
    assert!(queue.promote_due("default", due_at).await.is_err());
    let stats = queue.get_queue_stats("default").await.unwrap();
    assert_eq!((stats.ready, stats.delayed), (0, 2));

    assert_eq!(queue.promote_due("default", due_at).await.unwrap(), 2);
    assert_eq!(queue.queue_length("default").await.unwrap(), 2);
}
