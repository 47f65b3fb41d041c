//! Capacity control loop
//!
//! Every `interval` the [`AutoScaler`] samples queue depth, response time,
//! error rate and worker count, then grows or shrinks capacity through a
//! [`ProvisioningBackend`]. Scale-up and scale-down have independent
//! cooldowns, and each cycle moves by at most `max_step` workers within
//! `[min_workers, max_workers]`.

pub mod decision;
pub mod provisioning;

pub use decision::{ScalingAction, ScalingDecision, ScalingMetrics};
pub use provisioning::{PoolProvisioner, ProvisioningBackend};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{config::AutoScalerConfig, observability::MetricsCollector, queue::JobQueue, DispatchResult};

#[derive(Default)]
struct ScalerState {
    last_scale_up: Option<Instant>,
    last_scale_down: Option<Instant>,
    history: VecDeque<ScalingDecision>,
}

pub struct AutoScaler {
    config: AutoScalerConfig,
    queue: Arc<JobQueue>,
    metrics: Arc<MetricsCollector>,
    provisioner: Arc<dyn ProvisioningBackend>,

    /// Queues sampled for depth; empty means every known queue
    queues: Vec<String>,

    state: Mutex<ScalerState>,
}

impl AutoScaler {
    pub fn new(
        config: AutoScalerConfig,
        queue: Arc<JobQueue>,
        metrics: Arc<MetricsCollector>,
        provisioner: Arc<dyn ProvisioningBackend>,
    ) -> Self {
        Self {
            config,
            queue,
            metrics,
            provisioner,
            queues: Vec::new(),
            state: Mutex::new(ScalerState::default()),
        }
    }

    /// Restrict depth sampling to these queues
    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = queues;
        self
    }

    pub fn config(&self) -> &AutoScalerConfig {
        &self.config
    }

    /// Decisions in the order they were made, oldest first
    pub fn history(&self) -> Vec<ScalingDecision> {
        self.state.lock().history.iter().cloned().collect()
    }

    pub fn last_decision(&self) -> Option<ScalingDecision> {
        self.state.lock().history.back().cloned()
    }

    /// Gather the inputs for one cycle
    pub async fn sample(&self) -> DispatchResult<ScalingMetrics> {
        let queues = if self.queues.is_empty() {
            self.queue.queue_names().await?
        } else {
            self.queues.clone()
        };

        let mut queue_depth = 0;
        for name in &queues {
            queue_depth += self.queue.get_queue_stats(name).await?.ready;
        }

        let worker_count = self.provisioner.current_workers().await?;
        Ok(ScalingMetrics {
            queue_depth,
            avg_response_time_ms: self.metrics.avg_response_time_ms(),
            error_rate: self.metrics.error_rate(),
            worker_count,
            hourly_cost: worker_count as f64 * self.config.cost_per_worker_hour,
        })
    }

    fn cooldown_remaining(last: Option<Instant>, cooldown: Duration, now: Instant) -> Option<Duration> {
        let last = last?;
        let remaining = (last + cooldown).saturating_duration_since(now);
        (!remaining.is_zero()).then_some(remaining)
    }

    /// Largest worker count the budget allows
    fn affordable_workers(&self) -> usize {
        match self.config.max_hourly_budget {
            Some(budget) if self.config.cost_per_worker_hour > 0.0 => {
                (budget / self.config.cost_per_worker_hour).floor() as usize
            }
            _ => usize::MAX,
        }
    }

    /// Choose an action for `metrics` without applying it
    pub fn decide(&self, metrics: ScalingMetrics, now: Instant) -> ScalingDecision {
        let cfg = &self.config;
        let count = metrics.worker_count;
        let step = cfg.max_step.max(1);
        let (last_up, last_down) = {
            let state = self.state.lock();
            (state.last_scale_up, state.last_scale_down)
        };

        let over_budget = cfg
            .max_hourly_budget
            .map_or(false, |budget| metrics.hourly_cost > budget);

        let mut up_reasons = Vec::new();
        if count < cfg.min_workers {
            up_reasons.push(format!("worker count {} below minimum {}", count, cfg.min_workers));
        }
        if metrics.queue_depth >= cfg.scale_up_queue_depth {
            up_reasons.push(format!(
                "queue depth {} >= {}",
                metrics.queue_depth, cfg.scale_up_queue_depth
            ));
        }
        if metrics.avg_response_time_ms > cfg.target_response_time_ms {
            up_reasons.push(format!(
                "avg response time {:.1}ms > {:.1}ms",
                metrics.avg_response_time_ms, cfg.target_response_time_ms
            ));
        }
        if metrics.error_rate > cfg.scale_up_error_rate {
            up_reasons.push(format!(
                "error rate {:.1}% > {:.1}%",
                metrics.error_rate * 100.0,
                cfg.scale_up_error_rate * 100.0
            ));
        }

        let load_is_low = metrics.queue_depth <= cfg.scale_down_queue_depth
            && metrics.avg_response_time_ms < cfg.target_response_time_ms / 2.0
            && metrics.error_rate < cfg.scale_down_error_rate;

        let wants_down = count > cfg.max_workers
            || (count > cfg.min_workers && (over_budget || (up_reasons.is_empty() && load_is_low)));

        if wants_down {
            let reason = if count > cfg.max_workers {
                format!("worker count {} above maximum {}", count, cfg.max_workers)
            } else if over_budget {
                format!(
                    "projected cost {:.2}/h exceeds budget {:.2}/h",
                    metrics.hourly_cost,
                    cfg.max_hourly_budget.unwrap_or_default()
                )
            } else {
                format!(
                    "low load: queue depth {}, avg response time {:.1}ms, error rate {:.1}%",
                    metrics.queue_depth,
                    metrics.avg_response_time_ms,
                    metrics.error_rate * 100.0
                )
            };

            if let Some(remaining) = Self::cooldown_remaining(last_down, cfg.scale_down_cooldown, now) {
                return ScalingDecision::no_action(
                    format!("{}; scale-down cooldown {}s remaining", reason, remaining.as_secs()),
                    metrics,
                );
            }

            let target = count.saturating_sub(step).max(cfg.min_workers);
            return ScalingDecision::new(ScalingAction::ScaleDown, reason, metrics, target);
        }

        if !up_reasons.is_empty() {
            let reason = up_reasons.join(", ");
            let ceiling = cfg.max_workers.min(self.affordable_workers().max(cfg.min_workers));
            if count >= ceiling {
                return ScalingDecision::no_action(
                    format!("{}; already at capacity limit {}", reason, ceiling),
                    metrics,
                );
            }

            if let Some(remaining) = Self::cooldown_remaining(last_up, cfg.scale_up_cooldown, now) {
                return ScalingDecision::no_action(
                    format!("{}; scale-up cooldown {}s remaining", reason, remaining.as_secs()),
                    metrics,
                );
            }

            let target = (count + step).min(ceiling).max(cfg.min_workers);
            return ScalingDecision::new(ScalingAction::ScaleUp, reason, metrics, target);
        }

        ScalingDecision::no_action("metrics within thresholds", metrics)
    }

    /// Run one sample, decide and apply cycle
    #[instrument(skip_all)]
    pub async fn tick(&self) -> DispatchResult<ScalingDecision> {
        let metrics = self.sample().await?;
        let decision = self.decide(metrics, Instant::now());
        self.apply(decision).await
    }

    async fn apply(&self, mut decision: ScalingDecision) -> DispatchResult<ScalingDecision> {
        let before = decision.worker_count_before;
        let mut failure = None;

        match decision.action {
            ScalingAction::ScaleUp => {
                self.state.lock().last_scale_up = Some(Instant::now());
                let mut count = before;
                while count < decision.worker_count_after {
                    match self.provisioner.spawn_worker().await {
                        Ok(id) => {
                            debug!(worker_id = %id, "Provisioned worker");
                            count += 1;
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                decision.worker_count_after = count;
            }
            ScalingAction::ScaleDown => {
                self.state.lock().last_scale_down = Some(Instant::now());
                let mut count = before;
                while count > decision.worker_count_after {
                    match self.provisioner.terminate_worker().await {
                        Ok(Some(id)) => {
                            debug!(worker_id = %id, "Terminated worker");
                            count -= 1;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                decision.worker_count_after = count;
            }
            ScalingAction::NoAction => {}
        }

        if let Some(e) = &failure {
            decision.reason = format!("{}; provisioning failed: {}", decision.reason, e);
        }

        match decision.action {
            ScalingAction::NoAction => debug!(reason = %decision.reason, "No scaling action"),
            action => info!(
                action = action.name(),
                before = decision.worker_count_before,
                after = decision.worker_count_after,
                reason = %decision.reason,
                "Scaling decision applied"
            ),
        }

        self.record(decision.clone());
        match failure {
            Some(e) => {
                warn!("Scaling partially applied: {}", e);
                Err(e)
            }
            None => Ok(decision),
        }
    }

    fn record(&self, decision: ScalingDecision) {
        {
            let mut state = self.state.lock();
            if state.history.len() >= self.config.history_limit.max(1) {
                state.history.pop_front();
            }
            state.history.push_back(decision.clone());
        }
        self.metrics.record_scaling_decision(decision);
    }

    /// Run [`AutoScaler::tick`] every `interval` until cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Auto-scaler cycle failed: {}", e);
                    }
                }
            }
        }
        debug!("Auto-scaler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DispatchError, WorkerId};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        workers: AtomicUsize,
    }

    #[async_trait]
    impl ProvisioningBackend for Counter {
        async fn current_workers(&self) -> DispatchResult<usize> {
            Ok(self.workers.load(Ordering::SeqCst))
        }

        async fn spawn_worker(&self) -> DispatchResult<WorkerId> {
            let n = self.workers.fetch_add(1, Ordering::SeqCst);
            Ok(WorkerId::from(format!("w{}", n)))
        }

        async fn terminate_worker(&self) -> DispatchResult<Option<WorkerId>> {
            let n = self.workers.fetch_sub(1, Ordering::SeqCst);
            Ok(Some(WorkerId::from(format!("w{}", n - 1))))
        }
    }

    struct Broken;

    #[async_trait]
    impl ProvisioningBackend for Broken {
        async fn current_workers(&self) -> DispatchResult<usize> {
            Ok(1)
        }

        async fn spawn_worker(&self) -> DispatchResult<WorkerId> {
            Err(DispatchError::Provisioning("quota exhausted".to_string()))
        }

        async fn terminate_worker(&self) -> DispatchResult<Option<WorkerId>> {
            Ok(None)
        }
    }

    fn scaler(config: AutoScalerConfig, workers: usize) -> AutoScaler {
        let queue = Arc::new(JobQueue::in_memory());
        let metrics = queue.metrics().clone();
        AutoScaler::new(
            config,
            queue,
            metrics,
            Arc::new(Counter {
                workers: AtomicUsize::new(workers),
            }),
        )
    }

    fn metrics(queue_depth: usize, worker_count: usize) -> ScalingMetrics {
        ScalingMetrics {
            queue_depth,
            avg_response_time_ms: 100.0,
            error_rate: 0.0,
            worker_count,
            hourly_cost: worker_count as f64 * 0.10,
        }
    }

    #[tokio::test]
    async fn test_high_depth_scales_up_by_step() {
        let s = scaler(AutoScalerConfig::default(), 2);
        let decision = s.decide(metrics(150, 2), Instant::now());

        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(decision.worker_count_after, 4);
        assert!(decision.reason.contains("queue depth 150"));
    }

    #[tokio::test]
    async fn test_scale_up_clamped_to_max() {
        let s = scaler(AutoScalerConfig::default().with_bounds(1, 3), 2);
        let decision = s.decide(metrics(500, 2), Instant::now());
        assert_eq!(decision.worker_count_after, 3);

        let at_max = s.decide(metrics(500, 3), Instant::now());
        assert_eq!(at_max.action, ScalingAction::NoAction);
    }

    #[tokio::test]
    async fn test_scale_down_requires_all_low_signals() {
        let s = scaler(AutoScalerConfig::default(), 5);

        let mut slow = metrics(0, 5);
        slow.avg_response_time_ms = 600.0;
        assert_eq!(s.decide(slow, Instant::now()).action, ScalingAction::NoAction);

        let decision = s.decide(metrics(0, 5), Instant::now());
        assert_eq!(decision.action, ScalingAction::ScaleDown);
        assert_eq!(decision.worker_count_after, 3);
    }

    #[tokio::test]
    async fn test_error_rate_triggers_scale_up() {
        let s = scaler(AutoScalerConfig::default(), 2);
        let mut failing = metrics(0, 2);
        failing.error_rate = 0.25;

        assert_eq!(s.decide(failing, Instant::now()).action, ScalingAction::ScaleUp);
    }

    #[tokio::test]
    async fn test_budget_forces_scale_down() {
        let config = AutoScalerConfig::default().with_budget(1.0, 3.0);
        let s = scaler(config, 5);
        let mut busy = metrics(500, 5);
        busy.hourly_cost = 5.0;

        let decision = s.decide(busy, Instant::now());
        assert_eq!(decision.action, ScalingAction::ScaleDown);
        assert!(decision.reason.contains("budget"));
    }

    #[tokio::test]
    async fn test_scale_up_stops_at_budget() {
        let config = AutoScalerConfig::default().with_budget(1.0, 3.0);
        let s = scaler(config, 2);
        let mut busy = metrics(500, 2);
        busy.hourly_cost = 2.0;

        assert_eq!(s.decide(busy, Instant::now()).worker_count_after, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_up_cooldown() {
        let config = AutoScalerConfig::default().with_queue_depth_thresholds(0, 0);
        let s = scaler(config, 1);

        let first = s.tick().await.unwrap();
        assert_eq!(first.action, ScalingAction::ScaleUp);
        assert_eq!(first.worker_count_after, 3);

        let second = s.tick().await.unwrap();
        assert_eq!(second.action, ScalingAction::NoAction);
        assert!(second.reason.contains("cooldown"));

        tokio::time::advance(Duration::from_secs(60)).await;
        let third = s.tick().await.unwrap();
        assert_eq!(third.action, ScalingAction::ScaleUp);
        assert_eq!(s.history().len(), 3);
    }

    #[tokio::test]
    async fn test_provisioning_failure_is_recorded() {
        let queue = Arc::new(JobQueue::in_memory());
        let metrics = queue.metrics().clone();
        let s = AutoScaler::new(
            AutoScalerConfig::default().with_queue_depth_thresholds(0, 0),
            queue,
            metrics.clone(),
            Arc::new(Broken),
        );

        let err = s.tick().await.unwrap_err();
        assert!(matches!(err, DispatchError::Provisioning(_)));

        let recorded = s.last_decision().unwrap();
        assert_eq!(recorded.worker_count_after, 1);
        assert!(recorded.reason.contains("quota exhausted"));
        assert_eq!(metrics.scaling_history().len(), 1);
    }
}
