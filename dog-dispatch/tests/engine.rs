use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;

use dog_dispatch::prelude::*;
use dog_dispatch::{
    config::{AutoScalerConfig, DispatcherConfig, WorkerConfig},
    JobEvent,
};

#[derive(Debug, Serialize, Deserialize)]
struct Resize {
    width: u32,
    height: u32,
}

#[async_trait]
impl JobDefinition for Resize {
    type Output = serde_json::Value;

    const JOB_TYPE: &'static str = "resize";

    async fn execute(&self) -> Result<Self::Output, JobError> {
        if self.width == 0 || self.height == 0 {
            return Err(JobError::Permanent("empty image".to_string()));
        }
        Ok(json!({ "pixels": self.width * self.height }))
    }
}

fn engine_config() -> EngineConfig {
    EngineConfig::default()
        .with_worker(
            WorkerConfig::default()
                .with_poll_interval(Duration::from_millis(10))
                .with_shutdown_timeout(Duration::from_secs(2)),
        )
        .with_dispatcher(DispatcherConfig::default().with_warm_targets(2))
        .with_autoscaler(AutoScalerConfig::default().with_bounds(1, 4))
}

fn handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::default();
    handlers
        .register_fn("echo", |payload| async move { Ok(payload) })
        .unwrap();
    handlers.register_job::<Resize>().unwrap();
    handlers
}

async fn wait_for_terminal(engine: &DispatchEngine, id: &JobId) -> Job {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let job = engine.get_job(id).await.unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Timeout waiting for job to finish")
}

#[tokio::test]
async fn test_engine_runs_queued_and_dispatched_work() {
    let engine = DispatchEngine::builder(engine_config())
        .with_handlers(handlers())
        .build()
        .unwrap();
    engine.start().await.unwrap();

    assert_eq!(engine.pool().worker_count(), 1);
    assert_eq!(engine.dispatcher().member_count(), 2);

    let echo = engine
        .enqueue(EnqueueRequest::json("default", "echo", &json!({"x": 1})).unwrap().with_priority(5))
        .await
        .unwrap();
    let job = wait_for_terminal(&engine, &echo).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result.unwrap().data, Some(json!({"x": 1})));

    let resize = engine
        .enqueue(EnqueueRequest::for_job("default", &Resize { width: 4, height: 3 }).unwrap())
        .await
        .unwrap();
    let job = wait_for_terminal(&engine, &resize).await;
    assert_eq!(job.result.unwrap().data, Some(json!({"pixels": 12})));

    let response = engine
        .submit_request(DispatchRequest::json("echo", &json!({"y": 2})).unwrap())
        .await
        .unwrap();
    assert!(response.success);
    assert_eq!(response.result, Some(json!({"y": 2})));

    let metrics = engine.get_metrics().await.unwrap();
    assert!(metrics.jobs.completed >= 2);
    assert_eq!(metrics.dispatch.requests, 1);
    assert!(metrics.queues.iter().any(|q| q.queue_name == "default"));

    engine.shutdown().await.unwrap();
    assert_eq!(engine.pool().worker_count(), 0);
}

#[tokio::test]
async fn test_engine_permanent_failure_and_cancel() {
    let engine = DispatchEngine::builder(engine_config())
        .with_handlers(handlers())
        .build()
        .unwrap();

    // not started: jobs wait in the queue
    let pending = engine
        .enqueue(EnqueueRequest::json("default", "echo", &json!({})).unwrap())
        .await
        .unwrap();
    let cancelled = engine.cancel_job(&pending).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(engine.get_queue_stats("default").await.unwrap().ready, 0);

    let mut events = engine.subscribe();
    engine.start().await.unwrap();
    assert!(engine.start().await.is_err());

    let bad = engine
        .enqueue(EnqueueRequest::for_job("default", &Resize { width: 0, height: 3 }).unwrap())
        .await
        .unwrap();
    let job = wait_for_terminal(&engine, &bad).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.error.as_deref(), Some("empty image"));

    let failed = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(event) = events.next().await {
            if let JobEvent::Failed { job_id, .. } = event {
                return job_id;
            }
        }
        panic!("Event stream ended");
    })
    .await
    .expect("Timeout waiting for failure event");
    assert_eq!(failed, bad);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_config_rejected_at_build() {
    let config = EngineConfig::default().with_autoscaler(AutoScalerConfig::default().with_bounds(5, 2));
    assert!(matches!(
        DispatchEngine::builder(config).build(),
        Err(DispatchError::Validation(_))
    ));
}
