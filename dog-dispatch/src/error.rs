use thiserror::Error;

/// Result type for dispatch operations
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors surfaced by the queue, worker pool, dispatcher and auto-scaler
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// Malformed enqueue or request parameters, rejected before entering the queue
    #[error("Validation error: {0}")]
    Validation(String),

    /// Handler failure within the retry budget
    #[error("Transient execution error: {0}")]
    TransientExecution(String),

    /// Retries exhausted or explicitly non-retryable
    #[error("Terminal execution error: {0}")]
    TerminalExecution(String),

    #[error("Execution timed out after {0}s")]
    Timeout(u64),

    /// No healthy worker available for synchronous dispatch
    #[error("No healthy worker available: {0}")]
    Capacity(String),

    #[error("Circuit breaker open, retry after {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Job has been cancelled: {0}")]
    JobCancelled(String),

    #[error("Job {job_id} is not held by worker {worker_id}")]
    NotOwner { job_id: String, worker_id: String },

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("Codec not found: {0}")]
    CodecNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// Optimistic write lost against a concurrent update
    #[error("Version conflict on job {job_id}: expected {expected}, found {found}")]
    Conflict {
        job_id: String,
        expected: u64,
        found: u64,
    },

    #[error("Provisioning error: {0}")]
    Provisioning(String),

    #[error("Worker shutdown")]
    WorkerShutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Capacity and circuit errors are operational signals, not job failures
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Capacity(_) | Self::CircuitOpen { .. })
    }

    /// Stable short name, used as a metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::TransientExecution(_) => "transient_execution",
            Self::TerminalExecution(_) => "terminal_execution",
            Self::Timeout(_) => "timeout",
            Self::Capacity(_) => "capacity",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::JobNotFound(_) => "job_not_found",
            Self::WorkerNotFound(_) => "worker_not_found",
            Self::JobCancelled(_) => "job_cancelled",
            Self::NotOwner { .. } => "not_owner",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::CodecNotFound(_) => "codec_not_found",
            Self::Serialization(_) => "serialization",
            Self::Storage(_) => "storage",
            Self::Conflict { .. } => "conflict",
            Self::Provisioning(_) => "provisioning",
            Self::WorkerShutdown => "worker_shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

/// Handler execution outcome - determines retry behavior
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    /// Retryable error - requeued while retries remain
    #[error("Retryable error: {0}")]
    Retryable(String),

    /// Permanent error - fail immediately, no retry
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Handler exceeded its time budget
    #[error("Timed out after {0}s")]
    Timeout(u64),
}

impl JobError {
    /// Create a retryable error
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Timeouts count as transient until the retry budget runs out
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }

    /// Get the error message
    pub fn message(&self) -> String {
        match self {
            Self::Retryable(msg) | Self::Permanent(msg) => msg.clone(),
            Self::Timeout(secs) => format!("Job timed out after {}s", secs),
        }
    }
}

impl From<JobError> for DispatchError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Retryable(msg) => Self::TransientExecution(msg),
            JobError::Permanent(msg) => Self::TerminalExecution(msg),
            JobError::Timeout(secs) => Self::Timeout(secs),
        }
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operational_errors() {
        assert!(DispatchError::Capacity("none".into()).is_operational());
        assert!(DispatchError::CircuitOpen { retry_after_ms: 10 }.is_operational());
        assert!(!DispatchError::Timeout(5).is_operational());
        assert!(!DispatchError::Validation("bad".into()).is_operational());
    }

    #[test]
    fn test_job_error_mapping() {
        assert!(JobError::retryable("flaky").is_retryable());
        assert!(JobError::Timeout(3).is_retryable());
        assert!(!JobError::permanent("bad input").is_retryable());

        let err: DispatchError = JobError::permanent("bad input").into();
        assert_eq!(err, DispatchError::TerminalExecution("bad input".into()));
        assert_eq!(err.kind(), "terminal_execution");
        assert_eq!(JobError::Timeout(3).message(), "Job timed out after 3s");
    }
}
