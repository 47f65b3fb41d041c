use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use serde_json::json;
use tokio::time::Instant;

use dog_dispatch::{
    config::{AutoScalerConfig, WorkerConfig},
    observability::MetricsCollector,
    scaling::ScalingMetrics,
    AutoScaler, CodecRegistry, DispatchResult, EnqueueRequest, HandlerRegistry, JobExecutor,
    JobQueue, PoolProvisioner, ProvisioningBackend, ScalingAction, WorkerId, WorkerPool,
};

fn scaler_config() -> AutoScalerConfig {
    AutoScalerConfig::default()
        .with_bounds(1, 3)
        .with_queue_depth_thresholds(5, 0)
        .with_max_step(1)
        .with_cooldowns(Duration::from_millis(100), Duration::from_millis(100))
}

/// S1. Depth grows the pool one step per cooldown up to the maximum, then
/// an empty queue shrinks it back to the minimum
#[tokio::test]
async fn test_scales_with_queue_depth_within_bounds() {
    let metrics = Arc::new(MetricsCollector::new());
    let queue = Arc::new(JobQueue::new(
        Arc::new(dog_dispatch::MemoryStore::new()),
        Default::default(),
        metrics.clone(),
    ));

    // workers poll a different queue, so the backlog stays ready
    let executor = JobExecutor::new(Arc::new(HandlerRegistry::default()), Arc::new(CodecRegistry::default()));
    let pool = Arc::new(WorkerPool::new(
        queue.clone(),
        executor,
        WorkerConfig::default()
            .with_queues(["elsewhere"])
            .with_shutdown_timeout(Duration::from_secs(1)),
    ));
    pool.spawn_worker().unwrap();

    let scaler = AutoScaler::new(
        scaler_config(),
        queue.clone(),
        metrics.clone(),
        Arc::new(PoolProvisioner::new(pool.clone())),
    )
    .with_queues(vec!["default".to_string()]);

    let mut ids = Vec::new();
    for i in 0..10 {
        ids.push(
            queue
                .enqueue(EnqueueRequest::json("default", "render", &json!({ "frame": i })).unwrap())
                .await
                .unwrap(),
        );
    }

    let decision = scaler.tick().await.unwrap();
    assert_eq!(decision.action, ScalingAction::ScaleUp);
    assert_eq!((decision.worker_count_before, decision.worker_count_after), (1, 2));
    assert_eq!(decision.metrics.queue_depth, 10);
    assert_eq!(pool.worker_count(), 2);

    let decision = scaler.tick().await.unwrap();
    assert_eq!(decision.action, ScalingAction::NoAction);
    assert!(decision.reason.contains("cooldown"));

    tokio::time::sleep(Duration::from_millis(150)).await;
    let decision = scaler.tick().await.unwrap();
    assert_eq!(decision.action, ScalingAction::ScaleUp);
    assert_eq!(pool.worker_count(), 3);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let decision = scaler.tick().await.unwrap();
    assert_eq!(decision.action, ScalingAction::NoAction);
    assert!(decision.reason.contains("capacity limit"));

    for id in &ids {
        queue.cancel(id).await.unwrap();
    }

    let decision = scaler.tick().await.unwrap();
    assert_eq!(decision.action, ScalingAction::ScaleDown);
    assert_eq!(pool.worker_count(), 2);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let decision = scaler.tick().await.unwrap();
    assert_eq!(decision.action, ScalingAction::ScaleDown);
    assert_eq!(decision.worker_count_after, 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let decision = scaler.tick().await.unwrap();
    assert_eq!(decision.action, ScalingAction::NoAction);
    assert_eq!(pool.worker_count(), 1);

    let history = scaler.history();
    assert_eq!(history.len(), 7);
    let net: i64 = history.iter().map(|d| d.delta()).sum();
    assert_eq!(net, 0);
    assert_eq!(metrics.scaling_history().len(), 7);

    pool.shutdown().await.unwrap();
}

struct FixedProvisioner;

#[async_trait]
impl ProvisioningBackend for FixedProvisioner {
    async fn current_workers(&self) -> DispatchResult<usize> {
        Ok(0)
    }

    async fn spawn_worker(&self) -> DispatchResult<WorkerId> {
        Ok(WorkerId::generate("fixed"))
    }

    async fn terminate_worker(&self) -> DispatchResult<Option<WorkerId>> {
        Ok(None)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// S2. Any decision from within bounds stays within bounds and moves by at most one step
    #[test]
    fn prop_decision_respects_bounds(
        min in 0usize..5,
        span in 0usize..8,
        step in 1usize..4,
        offset in 0usize..8,
        queue_depth in 0usize..500,
        avg_response_time_ms in 0.0f64..5_000.0,
        error_rate in 0.0f64..1.0,
        budget in prop::option::of(0.0f64..2.0),
    ) {
        let max = min + span;
        let count = min + offset.min(span);

        let mut config = AutoScalerConfig::default()
            .with_bounds(min, max)
            .with_max_step(step);
        if let Some(budget) = budget {
            config = config.with_budget(0.10, budget);
        }

        let scaler = AutoScaler::new(
            config.clone(),
            Arc::new(JobQueue::in_memory()),
            Arc::new(MetricsCollector::new()),
            Arc::new(FixedProvisioner),
        );

        let decision = scaler.decide(
            ScalingMetrics {
                queue_depth,
                avg_response_time_ms,
                error_rate,
                worker_count: count,
                hourly_cost: count as f64 * config.cost_per_worker_hour,
            },
            Instant::now(),
        );

        prop_assert!(decision.worker_count_after >= min);
        prop_assert!(decision.worker_count_after <= max);
        prop_assert!(decision.delta().unsigned_abs() as usize <= step);
        match decision.action {
            ScalingAction::ScaleUp => prop_assert!(decision.delta() > 0),
            ScalingAction::ScaleDown => prop_assert!(decision.delta() < 0),
            ScalingAction::NoAction => prop_assert_eq!(decision.delta(), 0),
        }
    }
}
