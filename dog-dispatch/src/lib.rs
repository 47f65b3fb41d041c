//! # dog-dispatch: Task Dispatch Engine
//!
//! **Priority job queue, worker pool, load-balanced dispatcher and auto-scaler**
//!
//! - **Priority queue**: jobs ranked by descending priority, FIFO within a
//!   priority, with delayed jobs, retries with backoff, timeouts and cancellation
//! - **At-most-one claim**: a job is owned by whichever worker removes it from
//!   the ranked set; nothing else decides ownership
//! - **Worker pool**: bounded concurrency per worker, isolated handler tasks,
//!   independent heartbeats and graceful shutdown
//! - **Orphan reaper**: jobs held past their deadline, or by a worker whose
//!   record expired, are reclaimed and the worker is flagged unhealthy
//! - **Dispatcher**: health-filtered member selection (round-robin,
//!   least-busy, weighted, consistent-hash, random) behind a circuit breaker
//! - **Auto-scaler**: queue depth, latency and error-rate driven capacity with
//!   asymmetric cooldowns and an optional hourly budget
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dog_dispatch::prelude::*;
//! use serde_json::json;
//!
//! # async fn run() -> DispatchResult<()> {
//! let mut handlers = HandlerRegistry::default();
//! handlers.register_fn("echo", |payload| async move { Ok(payload) })?;
//!
//! let engine = DispatchEngine::in_memory(handlers)?;
//! engine.start().await?;
//!
//! let job_id = engine
//!     .enqueue(EnqueueRequest::json("default", "echo", &json!({"x": 1}))?.with_priority(5))
//!     .await?;
//!
//! let response = engine
//!     .submit_request(DispatchRequest::json("echo", &json!({"y": 2}))?)
//!     .await?;
//! assert!(response.success);
//!
//! let job = engine.get_job(&job_id).await?;
//! println!("{} is {:?}", job.id, job.status);
//!
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod job;
pub mod observability;
pub mod queue;
pub mod scaling;
pub mod types;
pub mod worker;

pub use backend::{BoxStream, JobStore, MemoryStore};
pub use codec::json::JsonCodec;
pub use codec::{CodecRegistry, JobCodec, Payload};
pub use config::{
    AutoScalerConfig, DispatcherConfig, EngineConfig, QueueConfig, ReaperConfig, WorkerConfig,
};
pub use dispatch::{
    CircuitBreakerState, CircuitState, DispatchRequest, DispatchResponse, DispatchTarget,
    Dispatcher, LocalTarget, SelectionStrategy,
};
pub use engine::{DispatchEngine, DispatchEngineBuilder};
pub use error::{DispatchError, DispatchResult, JobError};
pub use job::{HandlerRegistry, JobDefinition, JobHandler};
pub use observability::{MetricsCollector, MetricsSnapshot};
pub use queue::{EnqueueRequest, JobQueue, OrphanReaper, QueueStats, RetryPolicy};
pub use scaling::{
    AutoScaler, PoolProvisioner, ProvisioningBackend, ScalingAction, ScalingDecision,
};
pub use types::{
    Job, JobEvent, JobId, JobPriority, JobResult, JobStatus, RankKey, RequestId,
    ResourceMetrics, WorkerId, WorkerState, WorkerStatus,
};
pub use worker::{JobExecutor, WorkerPool};

#[cfg(feature = "metrics")]
pub use observability::PrometheusExporter;

#[cfg(feature = "tracing-basic")]
pub use observability::{init_tracing, LogFormat};

/// Common imports for building on the engine
pub mod prelude {
    pub use crate::{
        DispatchEngine, DispatchRequest, DispatchResponse, EnqueueRequest, EngineConfig,
        HandlerRegistry, JobDefinition, JobHandler,
    };

    pub use crate::{
        DispatchError, DispatchResult, Job, JobError, JobId, JobPriority, JobStatus, Payload,
        WorkerId,
    };

    pub use async_trait::async_trait;
}
