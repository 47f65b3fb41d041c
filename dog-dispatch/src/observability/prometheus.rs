//! Prometheus text export of [`MetricsSnapshot`]s
//!
//! Snapshot figures are cumulative, so every series is a gauge set from the
//! latest snapshot rather than a counter incremented in place.

use prometheus::{Encoder, Gauge, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::{dispatch::CircuitState, observability::MetricsSnapshot, DispatchError, DispatchResult};

fn to_dispatch_error(e: prometheus::Error) -> DispatchError {
    DispatchError::Internal(format!("Prometheus error: {}", e))
}

/// Renders snapshots into its own registry
pub struct PrometheusExporter {
    registry: Registry,
    jobs: IntGaugeVec,
    pending: IntGauge,
    processing: IntGauge,
    avg_response_time: Gauge,
    error_rate: Gauge,
    job_type_outcomes: IntGaugeVec,
    worker_error_rate: GaugeVec,
    worker_latency: GaugeVec,
    dispatch_requests: IntGaugeVec,
    circuit_state: IntGauge,
    circuit_failures: IntGauge,
    queue_depth: IntGaugeVec,
    worker_count: IntGauge,
}

impl PrometheusExporter {
    /// Register every series under `namespace`
    pub fn new(namespace: &str) -> DispatchResult<Self> {
        let registry = Registry::new();
        let opts = |name: &str, help: &str| Opts::new(name, help).namespace(namespace.to_string());

        let jobs = IntGaugeVec::new(opts("jobs_total", "Job lifecycle events by outcome"), &["outcome"])
            .map_err(to_dispatch_error)?;
        let pending = IntGauge::with_opts(opts("jobs_pending", "Ready plus delayed jobs"))
            .map_err(to_dispatch_error)?;
        let processing = IntGauge::with_opts(opts("jobs_processing", "Jobs held by workers"))
            .map_err(to_dispatch_error)?;
        let avg_response_time = Gauge::with_opts(opts(
            "response_time_ms",
            "Average response time over recent executions and dispatches",
        ))
        .map_err(to_dispatch_error)?;
        let error_rate = Gauge::with_opts(opts("error_rate", "Recent error rate"))
            .map_err(to_dispatch_error)?;
        let job_type_outcomes = IntGaugeVec::new(
            opts("job_type_total", "Job outcomes per job type"),
            &["job_type", "outcome"],
        )
        .map_err(to_dispatch_error)?;
        let worker_error_rate = GaugeVec::new(opts("worker_error_rate", "Recent error rate per worker"), &["worker_id"])
            .map_err(to_dispatch_error)?;
        let worker_latency = GaugeVec::new(
            opts("worker_latency_ms", "Average latency per worker"),
            &["worker_id"],
        )
        .map_err(to_dispatch_error)?;
        let dispatch_requests = IntGaugeVec::new(
            opts("dispatch_requests_total", "Synchronous requests by outcome"),
            &["outcome"],
        )
        .map_err(to_dispatch_error)?;
        let circuit_state = IntGauge::with_opts(opts(
            "circuit_breaker_state",
            "0 closed, 1 open, 2 half-open",
        ))
        .map_err(to_dispatch_error)?;
        let circuit_failures = IntGauge::with_opts(opts(
            "circuit_breaker_failures",
            "Failures counted by the circuit breaker",
        ))
        .map_err(to_dispatch_error)?;
        let queue_depth = IntGaugeVec::new(
            opts("queue_depth", "Jobs per queue and state"),
            &["queue_name", "state"],
        )
        .map_err(to_dispatch_error)?;
        let worker_count = IntGauge::with_opts(opts(
            "scaling_worker_count",
            "Worker count after the latest scaling decision",
        ))
        .map_err(to_dispatch_error)?;

        registry.register(Box::new(jobs.clone())).map_err(to_dispatch_error)?;
        registry.register(Box::new(pending.clone())).map_err(to_dispatch_error)?;
        registry.register(Box::new(processing.clone())).map_err(to_dispatch_error)?;
        registry
            .register(Box::new(avg_response_time.clone()))
            .map_err(to_dispatch_error)?;
        registry.register(Box::new(error_rate.clone())).map_err(to_dispatch_error)?;
        registry
            .register(Box::new(job_type_outcomes.clone()))
            .map_err(to_dispatch_error)?;
        registry
            .register(Box::new(worker_error_rate.clone()))
            .map_err(to_dispatch_error)?;
        registry
            .register(Box::new(worker_latency.clone()))
            .map_err(to_dispatch_error)?;
        registry
            .register(Box::new(dispatch_requests.clone()))
            .map_err(to_dispatch_error)?;
        registry
            .register(Box::new(circuit_state.clone()))
            .map_err(to_dispatch_error)?;
        registry
            .register(Box::new(circuit_failures.clone()))
            .map_err(to_dispatch_error)?;
        registry.register(Box::new(queue_depth.clone())).map_err(to_dispatch_error)?;
        registry.register(Box::new(worker_count.clone())).map_err(to_dispatch_error)?;

        Ok(Self {
            registry,
            jobs,
            pending,
            processing,
            avg_response_time,
            error_rate,
            job_type_outcomes,
            worker_error_rate,
            worker_latency,
            dispatch_requests,
            circuit_state,
            circuit_failures,
            queue_depth,
            worker_count,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Load a snapshot into the registered series
    pub fn update(&self, snapshot: &MetricsSnapshot) {
        let jobs = &snapshot.jobs;
        for (outcome, value) in [
            ("enqueued", jobs.enqueued),
            ("claimed", jobs.claimed),
            ("completed", jobs.completed),
            ("retried", jobs.retried),
            ("failed", jobs.failed),
            ("cancelled", jobs.cancelled),
            ("reclaimed", jobs.reclaimed),
        ] {
            self.jobs.with_label_values(&[outcome]).set(value as i64);
        }

        self.pending.set(snapshot.pending as i64);
        self.processing.set(snapshot.processing as i64);
        self.avg_response_time.set(snapshot.avg_response_time_ms);
        self.error_rate.set(snapshot.error_rate);

        for (job_type, m) in &snapshot.job_types {
            for (outcome, value) in [
                ("enqueued", m.enqueued),
                ("completed", m.completed),
                ("failed", m.failed),
                ("retried", m.retried),
                ("cancelled", m.cancelled),
            ] {
                self.job_type_outcomes
                    .with_label_values(&[job_type.as_str(), outcome])
                    .set(value as i64);
            }
        }

        // Stopped workers must not linger as stale series
        self.worker_error_rate.reset();
        self.worker_latency.reset();
        for worker in &snapshot.workers {
            let id = worker.worker_id.as_str();
            self.worker_error_rate.with_label_values(&[id]).set(worker.error_rate);
            self.worker_latency.with_label_values(&[id]).set(worker.avg_latency_ms);
        }

        let dispatch = &snapshot.dispatch;
        for (outcome, value) in [
            ("succeeded", dispatch.succeeded),
            ("failed", dispatch.failed),
            ("rejected_capacity", dispatch.rejected_capacity),
            ("rejected_circuit", dispatch.rejected_circuit),
        ] {
            self.dispatch_requests.with_label_values(&[outcome]).set(value as i64);
        }

        if let Some(breaker) = &snapshot.circuit_breaker {
            self.circuit_state.set(match breaker.state {
                CircuitState::Closed => 0,
                CircuitState::Open => 1,
                CircuitState::HalfOpen => 2,
            });
            self.circuit_failures.set(breaker.failure_count as i64);
        }

        for queue in &snapshot.queues {
            let name = queue.queue_name.as_str();
            for (state, value) in [
                ("ready", queue.ready),
                ("delayed", queue.delayed),
                ("processing", queue.processing),
                ("completed", queue.completed),
                ("failed", queue.failed),
                ("cancelled", queue.cancelled),
            ] {
                self.queue_depth.with_label_values(&[name, state]).set(value as i64);
            }
        }

        if let Some(last) = snapshot.scaling_history.last() {
            self.worker_count.set(last.worker_count_after as i64);
        }
    }

    /// Update from `snapshot` and encode the registry in text format
    pub fn render(&self, snapshot: &MetricsSnapshot) -> DispatchResult<String> {
        self.update(snapshot);

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(to_dispatch_error)?;
        String::from_utf8(buffer).map_err(|e| DispatchError::Internal(format!("Invalid metrics encoding: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::MetricsCollector;
    use crate::WorkerId;

    #[test]
    fn test_render_contains_series() {
        let metrics = MetricsCollector::new();
        metrics.record_enqueued("echo");
        metrics.record_completed("echo", Some(&WorkerId::from("w1")), 12);

        let exporter = PrometheusExporter::new("dispatch").unwrap();
        let text = exporter.render(&metrics.snapshot()).unwrap();

        assert!(text.contains("dispatch_jobs_total{outcome=\"completed\"} 1"));
        assert!(text.contains("dispatch_worker_latency_ms{worker_id=\"w1\"} 12"));
        assert!(text.contains("dispatch_job_type_total{job_type=\"echo\",outcome=\"enqueued\"} 1"));
    }
}
