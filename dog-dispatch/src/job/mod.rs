pub mod registry;

pub use registry::{FnHandler, HandlerRegistry, JobHandler};

use crate::{JobError, JobPriority};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

/// Trait for typed jobs whose payload is the job value itself
///
/// Registered with [`HandlerRegistry::register_job`] and enqueued with
/// [`EnqueueRequest::for_job`](crate::queue::EnqueueRequest::for_job).
#[async_trait]
pub trait JobDefinition: Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Result type returned by job execution
    type Output: Send + Sync + Serialize + 'static;

    /// Job type identifier for dispatch
    const JOB_TYPE: &'static str;

    /// Job priority
    const PRIORITY: JobPriority = JobPriority::NORMAL;

    /// Maximum retry attempts
    const MAX_RETRIES: u32 = 3;

    /// Handler time budget
    const TIMEOUT_SECONDS: u64 = 300;

    /// Execute the job
    async fn execute(&self) -> Result<Self::Output, JobError>;

    /// Get the job type identifier for dispatch
    fn job_type(&self) -> &'static str {
        Self::JOB_TYPE
    }

    /// Get the job priority (default: NORMAL)
    fn priority(&self) -> JobPriority {
        Self::PRIORITY
    }

    /// Get the maximum number of retry attempts (default: 3)
    fn max_retries(&self) -> u32 {
        Self::MAX_RETRIES
    }
}
