use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::WorkerId;

/// Outcome of one handler execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,

    /// Value returned by the handler
    pub data: Option<Value>,

    pub error: Option<String>,

    pub execution_time_ms: u64,

    /// Worker that produced the result
    pub worker_id: Option<WorkerId>,
}

impl JobResult {
    /// Successful execution
    pub fn success(data: Value, execution_time_ms: u64, worker_id: Option<WorkerId>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            execution_time_ms,
            worker_id,
        }
    }

    /// Failed execution
    pub fn failure(
        error: impl Into<String>,
        execution_time_ms: u64,
        worker_id: Option<WorkerId>,
    ) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            execution_time_ms,
            worker_id,
        }
    }
}
