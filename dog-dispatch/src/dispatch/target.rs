use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::{worker::JobExecutor, JobError, WorkerId};

/// A warm worker able to serve synchronous requests
#[async_trait]
pub trait DispatchTarget: Send + Sync {
    fn id(&self) -> &WorkerId;

    /// Run the handler for `request_type` with a decoded payload
    async fn invoke(&self, request_type: &str, payload: Value) -> Result<Value, JobError>;

    /// Liveness probe used by the monitor tick
    fn is_alive(&self) -> bool {
        true
    }
}

/// In-process target running handlers from a registry
pub struct LocalTarget {
    id: WorkerId,
    executor: JobExecutor,
    timeout: Duration,
}

impl LocalTarget {
    pub fn new(id: WorkerId, executor: JobExecutor, timeout: Duration) -> Self {
        Self { id, executor, timeout }
    }
}

#[async_trait]
impl DispatchTarget for LocalTarget {
    fn id(&self) -> &WorkerId {
        &self.id
    }

    async fn invoke(&self, request_type: &str, payload: Value) -> Result<Value, JobError> {
        self.executor.run_handler(request_type, payload, self.timeout).await
    }
}
