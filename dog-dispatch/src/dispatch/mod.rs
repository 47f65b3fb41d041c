//! Synchronous dispatch to warm workers
//!
//! Members are filtered by a health predicate refreshed on the monitor tick,
//! then one is chosen by the configured [`SelectionStrategy`]. A pool-wide
//! [`CircuitBreaker`] fast-fails dispatch while the pool is failing.

pub mod breaker;
pub mod strategy;
pub mod target;

pub use breaker::{Admission, BreakerSettings, CircuitBreaker, CircuitBreakerState, CircuitState};
pub use strategy::{fingerprint, Candidate, HashRing, SelectionStrategy, Selector};
pub use target::{DispatchTarget, LocalTarget};

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    codec::{CodecRegistry, Payload},
    config::DispatcherConfig,
    observability::{LatencyWindow, MetricsCollector},
    DispatchError, DispatchResult, JobError, RequestId, WorkerId,
};

/// A synchronous, latency-sensitive call
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub request_id: RequestId,
    pub request_type: String,
    pub payload: Payload,

    /// Routes equal keys to the same member under consistent hashing
    pub affinity_key: Option<String>,

    /// Overrides the dispatcher's request timeout
    pub timeout: Option<Duration>,
}

impl DispatchRequest {
    pub fn new(request_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            request_id: RequestId::new(),
            request_type: request_type.into(),
            payload,
            affinity_key: None,
            timeout: None,
        }
    }

    /// Request with a JSON-encoded payload
    pub fn json<T: Serialize + ?Sized>(request_type: impl Into<String>, payload: &T) -> DispatchResult<Self> {
        Ok(Self::new(request_type, Payload::json(payload)?))
    }

    pub fn with_affinity_key(mut self, key: impl Into<String>) -> Self {
        self.affinity_key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn fingerprint(&self) -> u64 {
        match &self.affinity_key {
            Some(key) => fingerprint(key.as_bytes()),
            None => {
                let mut bytes = self.request_type.as_bytes().to_vec();
                bytes.extend_from_slice(&self.payload.bytes);
                fingerprint(&bytes)
            }
        }
    }
}

/// Outcome of a request that reached a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub request_id: RequestId,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub worker_id: WorkerId,
}

/// Per-member statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberStats {
    pub worker_id: WorkerId,
    pub weight: u32,
    pub active_requests: usize,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub healthy: bool,
}

struct Member {
    target: Arc<dyn DispatchTarget>,
    weight: u32,
    order: u64,
    active: AtomicUsize,
    total: AtomicU64,
    failed: AtomicU64,
    window: Mutex<LatencyWindow>,
    last_heartbeat: Mutex<Instant>,
}

impl Member {
    fn record(&self, latency_ms: u64, success: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.window.lock().record(latency_ms, success);
    }

    fn is_healthy(&self, config: &DispatcherConfig, now: Instant) -> bool {
        let (error_rate, avg_latency) = {
            let window = self.window.lock();
            (window.error_rate(), window.avg_latency_ms())
        };
        let heartbeat_age = now.saturating_duration_since(*self.last_heartbeat.lock());

        error_rate <= config.max_error_rate
            && avg_latency <= config.max_avg_latency_ms
            && heartbeat_age <= config.heartbeat_staleness
    }

    fn candidate(&self) -> Candidate {
        Candidate {
            id: self.target.id().clone(),
            active: self.active.load(Ordering::Acquire),
            total: self.total.load(Ordering::Relaxed),
            weight: self.weight,
            order: self.order,
        }
    }
}

/// Healthy members in registration order, refreshed off the request path
#[derive(Default)]
struct HealthView {
    healthy: Vec<WorkerId>,
    ring: Option<HashRing>,
}

/// Counts one request as in-flight on a member until dropped
pub struct RequestGuard {
    member: Arc<Member>,
}

impl RequestGuard {
    fn new(member: Arc<Member>) -> Self {
        member.active.fetch_add(1, Ordering::AcqRel);
        Self { member }
    }

    pub fn worker_id(&self) -> &WorkerId {
        self.member.target.id()
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.member.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Load balancer for synchronous requests
pub struct Dispatcher {
    config: DispatcherConfig,
    members: DashMap<WorkerId, Arc<Member>>,
    next_order: AtomicU64,
    health: RwLock<Arc<HealthView>>,
    breaker: Arc<CircuitBreaker>,
    selector: Selector,
    codecs: Arc<CodecRegistry>,
    metrics: Arc<MetricsCollector>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, codecs: Arc<CodecRegistry>, metrics: Arc<MetricsCollector>) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(BreakerSettings::from_config(&config)));
        let selector = Selector::new(config.strategy);
        Self {
            config,
            members: DashMap::new(),
            next_order: AtomicU64::new(0),
            health: RwLock::new(Arc::new(HealthView::default())),
            breaker,
            selector,
            codecs,
            metrics,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.selector.strategy()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn circuit_state(&self) -> CircuitBreakerState {
        self.breaker.snapshot()
    }

    /// Add a warm member; weight only matters for weighted selection
    pub fn register_worker(&self, target: Arc<dyn DispatchTarget>, weight: u32) -> DispatchResult<()> {
        if weight == 0 {
            return Err(DispatchError::Validation(
                "Dispatch weight must be greater than zero".to_string(),
            ));
        }

        let id = target.id().clone();
        let member = Arc::new(Member {
            target,
            weight,
            order: self.next_order.fetch_add(1, Ordering::Relaxed),
            active: AtomicUsize::new(0),
            total: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            window: Mutex::new(LatencyWindow::new(self.config.stats_window)),
            last_heartbeat: Mutex::new(Instant::now()),
        });
        self.members.insert(id.clone(), member);
        self.refresh_health();

        info!(worker_id = %id, weight, "Registered dispatch target");
        Ok(())
    }

    pub fn deregister_worker(&self, worker_id: &WorkerId) -> bool {
        let removed = self.members.remove(worker_id).is_some();
        if removed {
            self.refresh_health();
            self.metrics.forget_worker(worker_id);
            info!(worker_id = %worker_id, "Deregistered dispatch target");
        }
        removed
    }

    pub fn record_heartbeat(&self, worker_id: &WorkerId) -> DispatchResult<()> {
        let member = self
            .members
            .get(worker_id)
            .ok_or_else(|| DispatchError::WorkerNotFound(worker_id.to_string()))?;
        *member.last_heartbeat.lock() = Instant::now();
        Ok(())
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn healthy_workers(&self) -> Vec<WorkerId> {
        self.health.read().healthy.clone()
    }

    /// Per-member statistics in registration order
    pub fn member_stats(&self) -> Vec<MemberStats> {
        let healthy = self.health.read().clone();
        let mut members: Vec<Arc<Member>> = self.members.iter().map(|m| m.value().clone()).collect();
        members.sort_by_key(|m| m.order);

        members
            .into_iter()
            .map(|m| {
                let window = m.window.lock();
                MemberStats {
                    worker_id: m.target.id().clone(),
                    weight: m.weight,
                    active_requests: m.active.load(Ordering::Acquire),
                    total_requests: m.total.load(Ordering::Relaxed),
                    failed_requests: m.failed.load(Ordering::Relaxed),
                    error_rate: window.error_rate(),
                    avg_latency_ms: window.avg_latency_ms(),
                    healthy: healthy.healthy.contains(m.target.id()),
                }
            })
            .collect()
    }

    /// Recompute the healthy set
    fn refresh_health(&self) {
        let now = Instant::now();
        let mut members: Vec<Arc<Member>> = self.members.iter().map(|m| m.value().clone()).collect();
        members.sort_by_key(|m| m.order);

        let healthy: Vec<WorkerId> = members
            .iter()
            .filter(|m| m.is_healthy(&self.config, now))
            .map(|m| m.target.id().clone())
            .collect();
        let ring = (self.selector.strategy() == SelectionStrategy::ConsistentHash)
            .then(|| HashRing::new(&healthy, self.config.virtual_nodes));

        *self.health.write() = Arc::new(HealthView { healthy, ring });
    }

    /// Pick a healthy member for a request fingerprint
    pub fn select_worker(&self, fingerprint: u64) -> DispatchResult<WorkerId> {
        let view = self.health.read().clone();
        let candidates: Vec<Candidate> = view
            .healthy
            .iter()
            .filter_map(|id| self.members.get(id).map(|m| m.candidate()))
            .collect();

        self.selector
            .select(&candidates, view.ring.as_ref(), fingerprint)
            .ok_or_else(|| {
                DispatchError::Capacity(format!(
                    "{} registered, none healthy",
                    self.members.len()
                ))
            })
    }

    /// Count a request as in-flight on a member until the guard drops
    pub fn track_request(&self, worker_id: &WorkerId) -> DispatchResult<RequestGuard> {
        let member = self
            .members
            .get(worker_id)
            .map(|m| m.value().clone())
            .ok_or_else(|| DispatchError::WorkerNotFound(worker_id.to_string()))?;
        Ok(RequestGuard::new(member))
    }

    /// Run a request on one healthy member
    ///
    /// Handler failures and timeouts come back as a response with
    /// `success == false`. Capacity and circuit rejections are errors.
    /// Dropping the returned future does not interrupt the member.
    #[instrument(skip_all, fields(request_id = %request.request_id, request_type = %request.request_type))]
    pub async fn submit_request(&self, request: DispatchRequest) -> DispatchResult<DispatchResponse> {
        let payload = self.codecs.decode_value(&request.payload)?;

        let admission = match self.breaker.check() {
            Ok(admission) => admission,
            Err(e) => {
                self.metrics.record_dispatch_rejected(&e);
                debug!("Dispatch rejected: {}", e);
                return Err(e);
            }
        };

        let selected = self
            .select_worker(request.fingerprint())
            .and_then(|id| self.track_request(&id));
        let guard = match selected {
            Ok(guard) => guard,
            Err(e) => {
                // never reached a member, so the trial is not spent
                self.breaker.release(admission);
                let e = match e {
                    DispatchError::WorkerNotFound(id) => {
                        DispatchError::Capacity(format!("Worker {} left the pool", id))
                    }
                    other => other,
                };
                self.metrics.record_dispatch_rejected(&e);
                warn!("Dispatch rejected: {}", e);
                return Err(e);
            }
        };

        let worker_id = guard.worker_id().clone();
        let target = guard.member.target.clone();
        let member = guard.member.clone();
        let breaker = self.breaker.clone();
        let metrics = self.metrics.clone();
        let timeout = request.timeout.unwrap_or(self.config.request_timeout);
        let DispatchRequest {
            request_id,
            request_type,
            ..
        } = request;

        let task = tokio::spawn(async move {
            let _guard = guard;
            let started = Instant::now();
            let invoked = AssertUnwindSafe(tokio::time::timeout(
                timeout,
                target.invoke(&request_type, payload),
            ))
            .catch_unwind()
            .await;
            let execution_time_ms = started.elapsed().as_millis() as u64;

            let outcome = match invoked {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(JobError::Timeout(timeout.as_secs())),
                Err(_) => Err(JobError::Retryable("Dispatch target panicked".to_string())),
            };
            let success = outcome.is_ok();

            member.record(execution_time_ms, success);
            if success {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
            metrics.record_dispatch(&worker_id, execution_time_ms, success);

            let (result, error) = match outcome {
                Ok(value) => (Some(value), None),
                Err(e) => (None, Some(e.message())),
            };
            DispatchResponse {
                request_id,
                success,
                result,
                error,
                execution_time_ms,
                worker_id,
            }
        });

        task.await
            .map_err(|e| DispatchError::Internal(format!("Dispatch task failed: {}", e)))
    }

    /// Refresh health, probe liveness and apply breaker transitions
    pub fn monitor_tick(&self) {
        if let Some((from, to)) = self.breaker.tick() {
            info!(?from, ?to, "Circuit breaker transition");
            if to == CircuitState::HalfOpen {
                // Trial dispatches judge members afresh
                for member in self.members.iter() {
                    *member.window.lock() = LatencyWindow::new(self.config.stats_window);
                }
            }
        }

        for member in self.members.iter() {
            if member.target.is_alive() {
                *member.last_heartbeat.lock() = Instant::now();
            }
        }
        self.refresh_health();
        self.metrics.set_circuit_state(self.breaker.snapshot());
    }

    /// Run [`Dispatcher::monitor_tick`] every `monitor_interval` until cancelled
    pub async fn run_monitor(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.monitor_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.monitor_tick(),
            }
        }
        debug!("Dispatch monitor stopped");
    }
}
