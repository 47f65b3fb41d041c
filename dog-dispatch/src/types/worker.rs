use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, WorkerId};

/// Worker lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Idle,
    Busy,
    Error,
    ShuttingDown,
    Stopped,
}

impl WorkerStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }

    /// Whether the worker may claim new jobs in this status
    pub fn accepts_work(&self) -> bool {
        matches!(self, Self::Idle | Self::Busy | Self::Error)
    }
}

/// Resource and throughput figures reported with each heartbeat
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub active_jobs: usize,
    pub available_slots: usize,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub avg_latency_ms: f64,
    pub uptime_secs: u64,
}

impl ResourceMetrics {
    /// Failed share of finished jobs, 0.0 when nothing finished yet
    pub fn error_rate(&self) -> f64 {
        let total = self.jobs_completed + self.jobs_failed;
        if total == 0 {
            0.0
        } else {
            self.jobs_failed as f64 / total as f64
        }
    }
}

/// Worker record, published to the store with a liveness TTL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    pub id: WorkerId,
    pub worker_type: String,
    pub status: WorkerStatus,

    /// Job types this worker has handlers for
    pub handler_types: Vec<String>,

    /// Queues polled, in priority order
    pub queues: Vec<String>,

    /// Jobs currently executing on this worker
    pub current_jobs: Vec<JobId>,

    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub resources: ResourceMetrics,
    pub max_concurrent_jobs: usize,

    /// Cleared by the reaper when the worker let a job run past its deadline
    pub healthy: bool,
}

impl WorkerState {
    pub fn new(
        id: WorkerId,
        worker_type: impl Into<String>,
        handler_types: Vec<String>,
        queues: Vec<String>,
        max_concurrent_jobs: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            worker_type: worker_type.into(),
            status: WorkerStatus::Starting,
            handler_types,
            queues,
            current_jobs: Vec::new(),
            last_heartbeat: now,
            started_at: now,
            resources: ResourceMetrics {
                available_slots: max_concurrent_jobs,
                ..ResourceMetrics::default()
            },
            max_concurrent_jobs,
            healthy: true,
        }
    }

    /// Most recently claimed job, if any
    pub fn current_job_id(&self) -> Option<&JobId> {
        self.current_jobs.last()
    }

    /// Check if the record is fresher than `window`
    pub fn heartbeat_fresh(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        now - self.last_heartbeat <= window
    }
}
