use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    dispatch::CircuitBreakerState, queue::QueueStats, scaling::ScalingDecision, DispatchError,
    WorkerId,
};

/// Bounded window of `(latency_ms, success)` samples
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<(u64, bool)>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, latency_ms: u64, success: bool) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((latency_ms, success));
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sum of sampled latencies
    pub fn total_latency_ms(&self) -> u64 {
        self.samples.iter().map(|(ms, _)| *ms).sum()
    }

    pub fn failures(&self) -> usize {
        self.samples.iter().filter(|(_, ok)| !ok).count()
    }

    /// 0.0 when empty
    pub fn avg_latency_ms(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.total_latency_ms() as f64 / self.samples.len() as f64
        }
    }

    /// 0.0 when empty
    pub fn error_rate(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.failures() as f64 / self.samples.len() as f64
        }
    }
}

/// Metrics for a specific job type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobTypeMetrics {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
    pub total_execution_ms: u64,
}

impl JobTypeMetrics {
    /// Calculate success rate as percentage
    pub fn success_rate(&self) -> f64 {
        let total_processed = self.completed + self.failed;
        if total_processed == 0 {
            100.0
        } else {
            (self.completed as f64 / total_processed as f64) * 100.0
        }
    }

    /// Calculate retry rate as percentage
    pub fn retry_rate(&self) -> f64 {
        if self.enqueued == 0 {
            0.0
        } else {
            (self.retried as f64 / self.enqueued as f64) * 100.0
        }
    }
}

#[derive(Debug, Clone)]
struct WorkerStats {
    completed: u64,
    failed: u64,
    window: LatencyWindow,
}

/// Per-worker figures as exposed in snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub worker_id: WorkerId,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
}

/// Synchronous dispatch figures
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchMetrics {
    pub requests: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rejected_capacity: u64,
    pub rejected_circuit: u64,
    pub avg_latency_ms: f64,
    pub error_rate: f64,
}

/// Global job counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobCounters {
    pub enqueued: u64,
    pub claimed: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub reclaimed: u64,
}

/// Point-in-time view of every aggregate, for dashboards and the auto-scaler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub jobs: JobCounters,

    /// Ready plus delayed jobs across published queues
    pub pending: usize,
    pub processing: usize,

    /// Over job executions and dispatches combined
    pub avg_response_time_ms: f64,
    pub error_rate: f64,

    pub job_types: HashMap<String, JobTypeMetrics>,
    pub workers: Vec<WorkerMetrics>,
    pub dispatch: DispatchMetrics,
    pub circuit_breaker: Option<CircuitBreakerState>,
    pub queues: Vec<QueueStats>,
    pub scaling_history: Vec<ScalingDecision>,
}

/// Aggregates counts, latencies and error rates for the engine
///
/// Constructed explicitly and shared by `Arc`; there is no global instance.
pub struct MetricsCollector {
    started_at: DateTime<Utc>,

    jobs_enqueued: AtomicU64,
    jobs_claimed: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_cancelled: AtomicU64,
    jobs_reclaimed: AtomicU64,

    dispatch_requests: AtomicU64,
    dispatch_succeeded: AtomicU64,
    dispatch_failed: AtomicU64,
    dispatch_rejected_capacity: AtomicU64,
    dispatch_rejected_circuit: AtomicU64,

    window_size: usize,
    history_limit: usize,

    job_types: RwLock<HashMap<String, JobTypeMetrics>>,
    workers: RwLock<HashMap<WorkerId, WorkerStats>>,
    executions: RwLock<LatencyWindow>,
    dispatches: RwLock<LatencyWindow>,
    circuit: RwLock<Option<CircuitBreakerState>>,
    queues: RwLock<HashMap<String, QueueStats>>,
    scaling: RwLock<VecDeque<ScalingDecision>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_limits(1000, 100)
    }

    /// Collector keeping `window_size` latency samples and `history_limit` scaling decisions
    pub fn with_limits(window_size: usize, history_limit: usize) -> Self {
        Self {
            started_at: Utc::now(),
            jobs_enqueued: AtomicU64::new(0),
            jobs_claimed: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_cancelled: AtomicU64::new(0),
            jobs_reclaimed: AtomicU64::new(0),
            dispatch_requests: AtomicU64::new(0),
            dispatch_succeeded: AtomicU64::new(0),
            dispatch_failed: AtomicU64::new(0),
            dispatch_rejected_capacity: AtomicU64::new(0),
            dispatch_rejected_circuit: AtomicU64::new(0),
            window_size,
            history_limit: history_limit.max(1),
            job_types: RwLock::new(HashMap::new()),
            workers: RwLock::new(HashMap::new()),
            executions: RwLock::new(LatencyWindow::new(window_size)),
            dispatches: RwLock::new(LatencyWindow::new(window_size)),
            circuit: RwLock::new(None),
            queues: RwLock::new(HashMap::new()),
            scaling: RwLock::new(VecDeque::new()),
        }
    }

    fn with_job_type<F: FnOnce(&mut JobTypeMetrics)>(&self, job_type: &str, f: F) {
        let mut types = self.job_types.write();
        f(types.entry(job_type.to_string()).or_default());
    }

    fn record_worker_sample(&self, worker_id: Option<&WorkerId>, execution_ms: u64, success: bool) {
        self.executions.write().record(execution_ms, success);

        if let Some(worker_id) = worker_id {
            let mut workers = self.workers.write();
            let stats = workers.entry(worker_id.clone()).or_insert_with(|| WorkerStats {
                completed: 0,
                failed: 0,
                window: LatencyWindow::new(self.window_size),
            });
            if success {
                stats.completed += 1;
            } else {
                stats.failed += 1;
            }
            stats.window.record(execution_ms, success);
        }
    }

    pub fn record_enqueued(&self, job_type: &str) {
        self.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
        self.with_job_type(job_type, |m| m.enqueued += 1);
    }

    pub fn record_claimed(&self) {
        self.jobs_claimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, job_type: &str, worker_id: Option<&WorkerId>, execution_ms: u64) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.with_job_type(job_type, |m| {
            m.completed += 1;
            m.total_execution_ms += execution_ms;
        });
        self.record_worker_sample(worker_id, execution_ms, true);
    }

    /// Record a failed attempt; `retried` tells whether it went back to pending
    pub fn record_failed(&self, job_type: &str, worker_id: Option<&WorkerId>, execution_ms: u64, retried: bool) {
        if retried {
            self.jobs_retried.fetch_add(1, Ordering::Relaxed);
        } else {
            self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.with_job_type(job_type, |m| {
            if retried {
                m.retried += 1;
            } else {
                m.failed += 1;
            }
            m.total_execution_ms += execution_ms;
        });
        self.record_worker_sample(worker_id, execution_ms, false);
    }

    pub fn record_cancelled(&self, job_type: &str) {
        self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
        self.with_job_type(job_type, |m| m.cancelled += 1);
    }

    pub fn record_reclaimed(&self) {
        self.jobs_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a synchronous request that reached a worker
    pub fn record_dispatch(&self, worker_id: &WorkerId, latency_ms: u64, success: bool) {
        self.dispatch_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.dispatch_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dispatch_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.dispatches.write().record(latency_ms, success);

        let mut workers = self.workers.write();
        let stats = workers.entry(worker_id.clone()).or_insert_with(|| WorkerStats {
            completed: 0,
            failed: 0,
            window: LatencyWindow::new(self.window_size),
        });
        if success {
            stats.completed += 1;
        } else {
            stats.failed += 1;
        }
        stats.window.record(latency_ms, success);
    }

    /// Record a request rejected before reaching any worker
    pub fn record_dispatch_rejected(&self, error: &DispatchError) {
        self.dispatch_requests.fetch_add(1, Ordering::Relaxed);
        match error {
            DispatchError::CircuitOpen { .. } => {
                self.dispatch_rejected_circuit.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.dispatch_rejected_capacity.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn set_circuit_state(&self, state: CircuitBreakerState) {
        *self.circuit.write() = Some(state);
    }

    pub fn record_queue_stats(&self, stats: QueueStats) {
        self.queues.write().insert(stats.queue_name.clone(), stats);
    }

    pub fn record_scaling_decision(&self, decision: ScalingDecision) {
        let mut history = self.scaling.write();
        if history.len() == self.history_limit {
            history.pop_front();
        }
        history.push_back(decision);
    }

    /// Drop per-worker figures for a worker that left the pool
    pub fn forget_worker(&self, worker_id: &WorkerId) {
        self.workers.write().remove(worker_id);
    }

    /// Average latency over job executions and dispatches
    pub fn avg_response_time_ms(&self) -> f64 {
        let executions = self.executions.read();
        let dispatches = self.dispatches.read();
        let count = executions.len() + dispatches.len();
        if count == 0 {
            0.0
        } else {
            (executions.total_latency_ms() + dispatches.total_latency_ms()) as f64 / count as f64
        }
    }

    /// Failure share over job executions and dispatches
    pub fn error_rate(&self) -> f64 {
        let executions = self.executions.read();
        let dispatches = self.dispatches.read();
        let count = executions.len() + dispatches.len();
        if count == 0 {
            0.0
        } else {
            (executions.failures() + dispatches.failures()) as f64 / count as f64
        }
    }

    pub fn worker_metrics(&self, worker_id: &WorkerId) -> Option<WorkerMetrics> {
        self.workers.read().get(worker_id).map(|stats| WorkerMetrics {
            worker_id: worker_id.clone(),
            jobs_completed: stats.completed,
            jobs_failed: stats.failed,
            error_rate: stats.window.error_rate(),
            avg_latency_ms: stats.window.avg_latency_ms(),
        })
    }

    pub fn job_type_metrics(&self, job_type: &str) -> Option<JobTypeMetrics> {
        self.job_types.read().get(job_type).cloned()
    }

    pub fn counters(&self) -> JobCounters {
        JobCounters {
            enqueued: self.jobs_enqueued.load(Ordering::Relaxed),
            claimed: self.jobs_claimed.load(Ordering::Relaxed),
            completed: self.jobs_completed.load(Ordering::Relaxed),
            retried: self.jobs_retried.load(Ordering::Relaxed),
            failed: self.jobs_failed.load(Ordering::Relaxed),
            cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            reclaimed: self.jobs_reclaimed.load(Ordering::Relaxed),
        }
    }

    pub fn dispatch_metrics(&self) -> DispatchMetrics {
        let window = self.dispatches.read();
        DispatchMetrics {
            requests: self.dispatch_requests.load(Ordering::Relaxed),
            succeeded: self.dispatch_succeeded.load(Ordering::Relaxed),
            failed: self.dispatch_failed.load(Ordering::Relaxed),
            rejected_capacity: self.dispatch_rejected_capacity.load(Ordering::Relaxed),
            rejected_circuit: self.dispatch_rejected_circuit.load(Ordering::Relaxed),
            avg_latency_ms: window.avg_latency_ms(),
            error_rate: window.error_rate(),
        }
    }

    pub fn scaling_history(&self) -> Vec<ScalingDecision> {
        self.scaling.read().iter().cloned().collect()
    }

    pub fn circuit_state(&self) -> Option<CircuitBreakerState> {
        self.circuit.read().clone()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Utc::now();

        let mut queues: Vec<QueueStats> = self.queues.read().values().cloned().collect();
        queues.sort_by(|a, b| a.queue_name.cmp(&b.queue_name));

        let mut workers: Vec<WorkerMetrics> = self
            .workers
            .read()
            .iter()
            .map(|(id, stats)| WorkerMetrics {
                worker_id: id.clone(),
                jobs_completed: stats.completed,
                jobs_failed: stats.failed,
                error_rate: stats.window.error_rate(),
                avg_latency_ms: stats.window.avg_latency_ms(),
            })
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

        MetricsSnapshot {
            timestamp: now,
            uptime_secs: (now - self.started_at).num_seconds().max(0) as u64,
            jobs: self.counters(),
            pending: queues.iter().map(QueueStats::pending).sum(),
            processing: queues.iter().map(|q| q.processing).sum(),
            avg_response_time_ms: self.avg_response_time_ms(),
            error_rate: self.error_rate(),
            job_types: self.job_types.read().clone(),
            workers,
            dispatch: self.dispatch_metrics(),
            circuit_breaker: self.circuit_state(),
            queues,
            scaling_history: self.scaling_history(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
