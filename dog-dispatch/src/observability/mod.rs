pub mod metrics;

#[cfg(feature = "tracing-basic")]
pub mod logging;

#[cfg(feature = "metrics")]
pub mod prometheus;

pub use metrics::{
    DispatchMetrics, JobCounters, JobTypeMetrics, LatencyWindow, MetricsCollector, MetricsSnapshot,
    WorkerMetrics,
};

#[cfg(feature = "tracing-basic")]
pub use logging::{init_tracing, LogFormat};

#[cfg(feature = "metrics")]
pub use self::prometheus::PrometheusExporter;
