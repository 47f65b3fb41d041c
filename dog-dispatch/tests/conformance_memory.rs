use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use proptest::prelude::*;
use serde_json::json;
use tokio_stream::StreamExt;

use dog_dispatch::{
    config::{QueueConfig, ReaperConfig},
    observability::MetricsCollector,
    DispatchError, EnqueueRequest, JobError, JobEvent, JobId, JobQueue, JobResult, JobStatus,
    MemoryStore, OrphanReaper, RetryPolicy, WorkerId,
};

/// Test factory functions
fn create_queue() -> Arc<JobQueue> {
    let config = QueueConfig::default().with_retry_policy(RetryPolicy::immediate());
    Arc::new(JobQueue::new(
        Arc::new(MemoryStore::new()),
        config,
        Arc::new(MetricsCollector::new()),
    ))
}

fn create_request(priority: i32) -> EnqueueRequest {
    EnqueueRequest::json("default", "test_job", &json!({ "priority": priority }))
        .unwrap()
        .with_priority(priority)
}

async fn receive_next_event(stream: &mut dog_dispatch::BoxStream<JobEvent>) -> JobEvent {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("Timeout waiting for event")
        .expect("Stream ended")
}

/// Q1. Higher priority first, enqueue order within a priority
#[tokio::test]
async fn test_dequeue_orders_by_priority() {
    let queue = create_queue();

    let low = queue.enqueue(create_request(1)).await.unwrap();
    let high = queue.enqueue(create_request(10)).await.unwrap();
    let mid = queue.enqueue(create_request(5)).await.unwrap();

    let mut order = Vec::new();
    while let Some(job) = queue.dequeue("default", None).await.unwrap() {
        order.push(job.id);
    }

    assert_eq!(order, vec![high, mid, low]);
}

#[tokio::test]
async fn test_equal_priorities_preserve_enqueue_order() {
    let queue = create_queue();

    let mut enqueued = Vec::new();
    for _ in 0..5 {
        enqueued.push(queue.enqueue(create_request(5)).await.unwrap());
    }

    let mut dequeued = Vec::new();
    while let Some(job) = queue.dequeue("default", None).await.unwrap() {
        dequeued.push(job.id);
    }

    assert_eq!(dequeued, enqueued);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Q2. Any priority sequence dequeues as a stable descending sort
    #[test]
    fn prop_dequeue_is_stable_priority_sort(priorities in prop::collection::vec(-5i32..20, 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let (expected, actual) = runtime.block_on(async {
            let queue = create_queue();

            let mut expected: Vec<(i32, JobId)> = Vec::new();
            for &priority in &priorities {
                let id = queue.enqueue(create_request(priority)).await.unwrap();
                expected.push((priority, id));
            }
            // sort_by is stable, so equal priorities keep enqueue order
            expected.sort_by(|a, b| b.0.cmp(&a.0));

            let mut actual = Vec::new();
            while let Some(job) = queue.dequeue("default", None).await.unwrap() {
                actual.push(job.id);
            }
            (expected.into_iter().map(|(_, id)| id).collect::<Vec<_>>(), actual)
        });

        prop_assert_eq!(expected, actual);
    }
}

/// Q3. Concurrent dequeues never hand out the same job twice
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dequeue_claims_each_job_once() {
    let queue = create_queue();
    for i in 0..200 {
        queue.enqueue(create_request(i % 7)).await.unwrap();
    }

    let mut tasks = Vec::new();
    for w in 0..16 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            let worker = WorkerId::from(format!("worker-{}", w));
            let mut claimed = Vec::new();
            while let Some(job) = queue.dequeue("default", Some(&worker)).await.unwrap() {
                assert_eq!(job.worker_id.as_ref(), Some(&worker));
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }

    let unique: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), 200);
    assert_eq!(unique.len(), 200);
}

/// Q4. Dequeue on an empty queue is a no-op
#[tokio::test]
async fn test_empty_dequeue_is_idempotent() {
    let queue = create_queue();

    let before = queue.get_queue_stats("default").await.unwrap();
    assert!(queue.dequeue("default", None).await.unwrap().is_none());
    assert!(queue.dequeue("default", None).await.unwrap().is_none());
    let after = queue.get_queue_stats("default").await.unwrap();

    assert_eq!(before, after);
    assert_eq!(queue.queue_length("default").await.unwrap(), 0);
}

/// Q5. max_retries = 3 means exactly four attempts, then terminal failure
#[tokio::test]
async fn test_always_failing_job_attempted_four_times() {
    let queue = create_queue();
    let id = queue
        .enqueue(create_request(5).with_max_retries(3))
        .await
        .unwrap();

    let mut attempts = 0;
    let mut retried = Vec::new();
    while let Some(job) = queue.dequeue("default", None).await.unwrap() {
        attempts += 1;
        let error = JobError::Retryable(format!("attempt {} failed", attempts));
        retried.push(queue.fail(&job.id, &error).await.unwrap());
    }

    assert_eq!(attempts, 4);
    assert_eq!(retried, vec![true, true, true, false]);

    let job = queue.get_job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 3);
    assert_eq!(job.error.as_deref(), Some("attempt 4 failed"));
    assert!(queue.dequeue("default", None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_permanent_error_is_terminal_immediately() {
    let queue = create_queue();
    let id = queue.enqueue(create_request(5)).await.unwrap();

    let job = queue.dequeue("default", None).await.unwrap().unwrap();
    let retried = queue
        .fail(&job.id, &JobError::Permanent("bad input".into()))
        .await
        .unwrap();

    assert!(!retried);
    let job = queue.get_job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 0);
}

/// Q6. A job held by a vanished worker is reclaimed and dequeued again
#[tokio::test]
async fn test_orphaned_job_reclaimed_within_one_cycle() {
    let queue = create_queue();
    let id = queue
        .enqueue(create_request(5).with_timeout_seconds(1))
        .await
        .unwrap();

    let ghost = WorkerId::from("ghost");
    let claimed = queue.dequeue("default", Some(&ghost)).await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
    assert!(queue.dequeue("default", None).await.unwrap().is_none());

    let reaper = OrphanReaper::new(queue.clone(), ReaperConfig::default());
    let stats = reaper
        .reap_at(Utc::now() + chrono::Duration::seconds(10))
        .await
        .unwrap();
    assert_eq!(stats.reclaimed, 1);

    let again = queue.dequeue("default", None).await.unwrap().unwrap();
    assert_eq!(again.id, id);
    assert_eq!(again.retry_count, 1);
}

/// Q7. Delayed jobs stay invisible until due
#[tokio::test]
async fn test_delayed_job_invisible_until_due() {
    let queue = create_queue();
    let until = Utc::now() + chrono::Duration::hours(1);
    let id = queue
        .enqueue(create_request(5).with_delay_until(until))
        .await
        .unwrap();

    assert!(queue.dequeue("default", None).await.unwrap().is_none());
    assert!(queue.peek("default").await.unwrap().is_none());
    assert_eq!(queue.queue_length("default").await.unwrap(), 1);

    let promoted = queue
        .promote_due("default", until + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(promoted, 1);

    let job = queue.dequeue("default", None).await.unwrap().unwrap();
    assert_eq!(job.id, id);
}

/// Q8. Completion records the result for lookup
#[tokio::test]
async fn test_complete_records_result() {
    let queue = create_queue();
    let worker = WorkerId::from("w1");
    let id = queue.enqueue(create_request(5)).await.unwrap();

    queue.dequeue("default", Some(&worker)).await.unwrap().unwrap();
    queue
        .complete(&id, JobResult::success(json!({"ok": true}), 7, Some(worker.clone())))
        .await
        .unwrap();

    let job = queue.get_job(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let result = job.result.unwrap();
    assert_eq!(result.data, Some(json!({"ok": true})));
    assert_eq!(result.worker_id, Some(worker));
}

/// Q9. Only the holder may complete a job
#[tokio::test]
async fn test_only_holder_can_complete() {
    let queue = create_queue();
    let id = queue.enqueue(create_request(5)).await.unwrap();
    queue
        .dequeue("default", Some(&WorkerId::from("owner")))
        .await
        .unwrap()
        .unwrap();

    let err = queue
        .complete(&id, JobResult::success(json!(null), 1, Some(WorkerId::from("intruder"))))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NotOwner { .. }));
}

/// Q10. Cancellation wins over a late completion
#[tokio::test]
async fn test_cancel_wins_over_late_completion() {
    let queue = create_queue();
    let id = queue.enqueue(create_request(5)).await.unwrap();
    queue.dequeue("default", None).await.unwrap().unwrap();

    let cancelled = queue.cancel(&id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    assert!(queue
        .complete(&id, JobResult::success(json!(1), 1, None))
        .await
        .is_err());
    assert_eq!(queue.get_job(&id).await.unwrap().status, JobStatus::Cancelled);
}

/// Q11. Lifecycle events are published in order
#[tokio::test]
async fn test_lifecycle_events_published() {
    let queue = create_queue();
    let mut events = queue.subscribe();

    let id = queue.enqueue(create_request(5)).await.unwrap();
    queue.dequeue("default", None).await.unwrap().unwrap();
    queue
        .complete(&id, JobResult::success(json!(null), 1, None))
        .await
        .unwrap();

    assert!(matches!(receive_next_event(&mut events).await, JobEvent::Enqueued { job_id, .. } if job_id == id));
    assert!(matches!(receive_next_event(&mut events).await, JobEvent::Claimed { job_id, .. } if job_id == id));
    assert!(matches!(receive_next_event(&mut events).await, JobEvent::Completed { job_id, .. } if job_id == id));
}

#[tokio::test]
async fn test_invalid_enqueue_rejected() {
    let queue = create_queue();

    let empty_type = EnqueueRequest::json("default", "", &json!({})).unwrap();
    assert!(matches!(
        queue.enqueue(empty_type).await,
        Err(DispatchError::Validation(_))
    ));

    let zero_timeout = create_request(5).with_timeout_seconds(0);
    assert!(matches!(
        queue.enqueue(zero_timeout).await,
        Err(DispatchError::Validation(_))
    ));

    assert_eq!(queue.queue_length("default").await.unwrap(), 0);
}
