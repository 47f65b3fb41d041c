use std::str::FromStr;
use std::time::Duration;

use crate::{dispatch::SelectionStrategy, queue::RetryPolicy, DispatchError, DispatchResult};

/// Limits and defaults applied at enqueue time
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Retry budget when the caller does not set one
    pub default_max_retries: u32,

    /// Handler time budget when the caller does not set one
    pub default_timeout_seconds: u64,

    /// Upper bound accepted for `timeout_seconds`
    pub max_timeout_seconds: u64,

    /// Upper bound accepted for `max_retries`
    pub max_retries_limit: u32,

    /// Largest payload accepted, in bytes
    pub max_payload_bytes: usize,

    /// Candidates inspected per dequeue round
    pub claim_batch: usize,

    /// Backoff applied to retried jobs
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            default_timeout_seconds: 300, // 5 minutes
            max_timeout_seconds: 24 * 3600,
            max_retries_limit: 100,
            max_payload_bytes: 1024 * 1024, // 1MB
            claim_batch: 16,
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    pub fn with_default_timeout_seconds(mut self, secs: u64) -> Self {
        self.default_timeout_seconds = secs;
        self
    }

    pub fn with_max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Per-worker execution settings
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Label reported in worker records
    pub worker_type: String,

    /// Queues polled, in priority order
    pub queues: Vec<String>,

    /// Concurrency slots per worker
    pub max_concurrent_jobs: usize,

    /// Sleep when every queue was empty
    pub poll_interval: Duration,

    /// Sleep after a store error
    pub error_backoff: Duration,

    pub heartbeat_interval: Duration,

    /// Liveness TTL on the worker record; must exceed `heartbeat_interval`
    pub heartbeat_ttl: Duration,

    /// Grace period for in-flight jobs on shutdown
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_type: "general".to_string(),
            queues: vec!["default".to_string()],
            max_concurrent_jobs: 4,
            poll_interval: Duration::from_millis(100),
            error_backoff: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_ttl: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_type(mut self, worker_type: impl Into<String>) -> Self {
        self.worker_type = worker_type.into();
        self
    }

    /// Set the polled queues, highest priority first
    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_concurrent_jobs(mut self, slots: usize) -> Self {
        self.max_concurrent_jobs = slots;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, ttl: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_ttl = ttl;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Health-check cycle settings
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,

    /// Slack added to a job's timeout before it counts as orphaned
    pub reclaim_grace: Duration,

    /// How long terminal jobs are kept before purge
    pub retention: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            reclaim_grace: Duration::from_secs(5),
            retention: Duration::from_secs(24 * 3600),
        }
    }
}

impl ReaperConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_reclaim_grace(mut self, grace: Duration) -> Self {
        self.reclaim_grace = grace;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

/// Load balancer and circuit breaker settings
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub strategy: SelectionStrategy,

    /// Members above this error rate are unhealthy
    pub max_error_rate: f64,

    /// Members above this average latency are unhealthy
    pub max_avg_latency_ms: f64,

    /// Members whose last heartbeat is older than this are unhealthy
    pub heartbeat_staleness: Duration,

    /// Samples kept per member for error rate and latency
    pub stats_window: usize,

    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout: Duration,

    /// Failures older than this no longer count toward opening
    pub failure_window: Duration,

    /// Trial dispatches permitted while half-open
    pub half_open_max_calls: u32,

    /// Trial successes required to close again
    pub half_open_success_threshold: u32,

    /// Period of the health refresh and breaker transition tick
    pub monitor_interval: Duration,

    /// Upper bound on one synchronous request
    pub request_timeout: Duration,

    /// Ring points per member for consistent hashing
    pub virtual_nodes: usize,

    /// Warm in-process targets registered on engine start
    pub warm_targets: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::LeastBusy,
            max_error_rate: 0.5,
            max_avg_latency_ms: 5_000.0,
            heartbeat_staleness: Duration::from_secs(30),
            stats_window: 100,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(60),
            failure_window: Duration::from_secs(60),
            half_open_max_calls: 3,
            half_open_success_threshold: 2,
            monitor_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
            virtual_nodes: 100,
            warm_targets: 2,
        }
    }
}

impl DispatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_circuit_breaker(mut self, threshold: u32, timeout: Duration) -> Self {
        self.circuit_breaker_threshold = threshold;
        self.circuit_breaker_timeout = timeout;
        self
    }

    pub fn with_half_open(mut self, max_calls: u32, success_threshold: u32) -> Self {
        self.half_open_max_calls = max_calls;
        self.half_open_success_threshold = success_threshold;
        self
    }

    pub fn with_health_thresholds(mut self, max_error_rate: f64, max_avg_latency_ms: f64) -> Self {
        self.max_error_rate = max_error_rate;
        self.max_avg_latency_ms = max_avg_latency_ms;
        self
    }

    pub fn with_heartbeat_staleness(mut self, staleness: Duration) -> Self {
        self.heartbeat_staleness = staleness;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_warm_targets(mut self, count: usize) -> Self {
        self.warm_targets = count;
        self
    }
}

/// Capacity control loop settings
#[derive(Debug, Clone)]
pub struct AutoScalerConfig {
    pub interval: Duration,
    pub min_workers: usize,
    pub max_workers: usize,

    /// Total ready depth at or above which the pool grows
    pub scale_up_queue_depth: usize,

    /// Total ready depth at or below which the pool may shrink
    pub scale_down_queue_depth: usize,

    pub target_response_time_ms: f64,

    pub scale_up_error_rate: f64,
    pub scale_down_error_rate: f64,

    pub scale_up_cooldown: Duration,
    pub scale_down_cooldown: Duration,

    /// Largest change applied in one cycle
    pub max_step: usize,

    pub cost_per_worker_hour: f64,

    /// Projected hourly spend that forces a scale-down when exceeded
    pub max_hourly_budget: Option<f64>,

    /// Decisions kept for audit
    pub history_limit: usize,
}

impl Default for AutoScalerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            min_workers: 1,
            max_workers: 10,
            scale_up_queue_depth: 100,
            scale_down_queue_depth: 10,
            target_response_time_ms: 1_000.0,
            scale_up_error_rate: 0.10,
            scale_down_error_rate: 0.05,
            scale_up_cooldown: Duration::from_secs(60),
            scale_down_cooldown: Duration::from_secs(300),
            max_step: 2,
            cost_per_worker_hour: 0.10,
            max_hourly_budget: None,
            history_limit: 100,
        }
    }
}

impl AutoScalerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bounds(mut self, min_workers: usize, max_workers: usize) -> Self {
        self.min_workers = min_workers;
        self.max_workers = max_workers;
        self
    }

    pub fn with_queue_depth_thresholds(mut self, scale_up: usize, scale_down: usize) -> Self {
        self.scale_up_queue_depth = scale_up;
        self.scale_down_queue_depth = scale_down;
        self
    }

    pub fn with_target_response_time_ms(mut self, target: f64) -> Self {
        self.target_response_time_ms = target;
        self
    }

    pub fn with_cooldowns(mut self, scale_up: Duration, scale_down: Duration) -> Self {
        self.scale_up_cooldown = scale_up;
        self.scale_down_cooldown = scale_down;
        self
    }

    pub fn with_max_step(mut self, step: usize) -> Self {
        self.max_step = step;
        self
    }

    pub fn with_budget(mut self, cost_per_worker_hour: f64, max_hourly_budget: f64) -> Self {
        self.cost_per_worker_hour = cost_per_worker_hour;
        self.max_hourly_budget = Some(max_hourly_budget);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub reaper: ReaperConfig,
    pub dispatcher: DispatcherConfig,
    pub autoscaler: AutoScalerConfig,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_reaper(mut self, reaper: ReaperConfig) -> Self {
        self.reaper = reaper;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_autoscaler(mut self, autoscaler: AutoScalerConfig) -> Self {
        self.autoscaler = autoscaler;
        self
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> DispatchResult<()> {
        fn invalid(msg: &str) -> DispatchResult<()> {
            Err(DispatchError::Validation(msg.to_string()))
        }

        if self.queue.default_timeout_seconds == 0 {
            return invalid("default_timeout_seconds must be greater than zero");
        }
        if self.queue.default_timeout_seconds > self.queue.max_timeout_seconds {
            return invalid("default_timeout_seconds exceeds max_timeout_seconds");
        }
        if self.queue.claim_batch == 0 {
            return invalid("claim_batch must be greater than zero");
        }
        if self.worker.queues.is_empty() {
            return invalid("worker must poll at least one queue");
        }
        if self.worker.max_concurrent_jobs == 0 {
            return invalid("max_concurrent_jobs must be greater than zero");
        }
        if self.worker.heartbeat_interval.is_zero() || self.worker.poll_interval.is_zero() {
            return invalid("worker intervals must be greater than zero");
        }
        if self.worker.heartbeat_ttl <= self.worker.heartbeat_interval {
            return invalid("heartbeat_ttl must exceed heartbeat_interval");
        }
        if self.reaper.interval.is_zero() {
            return invalid("reaper interval must be greater than zero");
        }
        if self.dispatcher.circuit_breaker_threshold == 0 {
            return invalid("circuit_breaker_threshold must be greater than zero");
        }
        if self.dispatcher.half_open_max_calls == 0
            || self.dispatcher.half_open_success_threshold > self.dispatcher.half_open_max_calls
        {
            return invalid("half_open_success_threshold must be within 1..=half_open_max_calls");
        }
        if self.dispatcher.monitor_interval.is_zero() || self.dispatcher.request_timeout.is_zero() {
            return invalid("dispatcher intervals must be greater than zero");
        }
        if self.dispatcher.stats_window == 0 || self.dispatcher.virtual_nodes == 0 {
            return invalid("stats_window and virtual_nodes must be greater than zero");
        }
        if self.autoscaler.min_workers > self.autoscaler.max_workers {
            return invalid("min_workers exceeds max_workers");
        }
        if self.autoscaler.max_workers == 0 {
            return invalid("max_workers must be greater than zero");
        }
        if self.autoscaler.max_step == 0 {
            return invalid("max_step must be greater than zero");
        }
        if self.autoscaler.scale_down_queue_depth > self.autoscaler.scale_up_queue_depth {
            return invalid("scale_down_queue_depth exceeds scale_up_queue_depth");
        }
        if self.autoscaler.interval.is_zero() {
            return invalid("autoscaler interval must be greater than zero");
        }
        Ok(())
    }

    /// Defaults overlaid with `DISPATCH_*` environment variables
    pub fn from_env() -> DispatchResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`
    pub fn from_lookup<F>(lookup: F) -> DispatchResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(queues) = lookup("DISPATCH_QUEUES") {
            config.worker.queues = queues
                .split(',')
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = parse_var(&lookup, "DISPATCH_MAX_CONCURRENT_JOBS")? {
            config.worker.max_concurrent_jobs = v;
        }
        if let Some(v) = parse_var(&lookup, "DISPATCH_DEFAULT_MAX_RETRIES")? {
            config.queue.default_max_retries = v;
        }
        if let Some(v) = parse_var(&lookup, "DISPATCH_DEFAULT_TIMEOUT_SECS")? {
            config.queue.default_timeout_seconds = v;
        }
        if let Some(v) = parse_var(&lookup, "DISPATCH_HEARTBEAT_INTERVAL_SECS")? {
            config.worker.heartbeat_interval = Duration::from_secs(v);
        }
        if let Some(v) = parse_var(&lookup, "DISPATCH_HEARTBEAT_TTL_SECS")? {
            config.worker.heartbeat_ttl = Duration::from_secs(v);
        }
        if let Some(v) = parse_var(&lookup, "DISPATCH_REAPER_INTERVAL_SECS")? {
            config.reaper.interval = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<SelectionStrategy, _>(&lookup, "DISPATCH_STRATEGY")? {
            config.dispatcher.strategy = v;
        }
        if let Some(v) = parse_var(&lookup, "DISPATCH_CIRCUIT_BREAKER_THRESHOLD")? {
            config.dispatcher.circuit_breaker_threshold = v;
        }
        if let Some(v) = parse_var(&lookup, "DISPATCH_CIRCUIT_BREAKER_TIMEOUT_SECS")? {
            config.dispatcher.circuit_breaker_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_var(&lookup, "DISPATCH_MIN_WORKERS")? {
            config.autoscaler.min_workers = v;
        }
        if let Some(v) = parse_var(&lookup, "DISPATCH_MAX_WORKERS")? {
            config.autoscaler.max_workers = v;
        }
        if let Some(v) = parse_var(&lookup, "DISPATCH_SCALE_UP_COOLDOWN_SECS")? {
            config.autoscaler.scale_up_cooldown = Duration::from_secs(v);
        }
        if let Some(v) = parse_var(&lookup, "DISPATCH_SCALE_DOWN_COOLDOWN_SECS")? {
            config.autoscaler.scale_down_cooldown = Duration::from_secs(v);
        }
        if let Some(v) = parse_var(&lookup, "DISPATCH_MAX_HOURLY_BUDGET")? {
            config.autoscaler.max_hourly_budget = Some(v);
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> DispatchResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| DispatchError::Validation(format!("Invalid {}='{}': {}", key, raw, e))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_min_above_max_rejected() {
        let config = EngineConfig::new().with_autoscaler(AutoScalerConfig::new().with_bounds(5, 2));
        assert!(matches!(config.validate(), Err(DispatchError::Validation(_))));
    }

    #[test]
    fn test_env_overlay() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("DISPATCH_QUEUES", "critical, default"),
            ("DISPATCH_MAX_WORKERS", "20"),
            ("DISPATCH_STRATEGY", "consistent_hash"),
        ]))
        .unwrap();

        assert_eq!(config.worker.queues, vec!["critical", "default"]);
        assert_eq!(config.autoscaler.max_workers, 20);
        assert_eq!(config.dispatcher.strategy, SelectionStrategy::ConsistentHash);
    }

    #[test]
    fn test_env_malformed_value() {
        let err = EngineConfig::from_lookup(lookup_from(&[("DISPATCH_MAX_WORKERS", "lots")])).unwrap_err();
        assert!(matches!(err, DispatchError::Validation(msg) if msg.contains("DISPATCH_MAX_WORKERS")));
    }
}
