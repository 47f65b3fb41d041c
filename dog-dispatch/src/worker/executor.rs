use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::{codec::CodecRegistry, job::HandlerRegistry, Job, JobError};

/// Aborts the wrapped task when dropped, so a cancelled caller never leaks a handler
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Decodes payloads and runs handlers in isolation under a hard timeout
#[derive(Clone)]
pub struct JobExecutor {
    handlers: Arc<HandlerRegistry>,
    codecs: Arc<CodecRegistry>,
}

impl JobExecutor {
    pub fn new(handlers: Arc<HandlerRegistry>, codecs: Arc<CodecRegistry>) -> Self {
        Self { handlers, codecs }
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.codecs
    }

    /// Execute a claimed job
    ///
    /// Undecodable payloads fail permanently. A panicking handler is a
    /// retryable failure; a handler still running at `timeout_seconds` is
    /// aborted.
    pub async fn execute(&self, job: &Job) -> Result<Value, JobError> {
        let payload = self
            .codecs
            .decode_value(&job.payload)
            .map_err(|e| JobError::Permanent(format!("Invalid payload: {}", e)))?;

        self.run_handler(&job.job_type, payload, Duration::from_secs(job.timeout_seconds))
            .await
    }

    /// Run the handler for `job_type` on its own task
    pub async fn run_handler(&self, job_type: &str, payload: Value, timeout: Duration) -> Result<Value, JobError> {
        let handlers = self.handlers.clone();
        let job_type = job_type.to_string();
        let mut task = AbortOnDrop(tokio::spawn(async move {
            handlers.execute(&job_type, payload).await
        }));

        match tokio::time::timeout(timeout, &mut task.0).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => Err(JobError::Retryable(format!(
                "Handler panicked: {}",
                panic_message(join_err.into_panic())
            ))),
            Ok(Err(join_err)) => Err(JobError::Retryable(format!("Handler task failed: {}", join_err))),
            Err(_) => Err(JobError::Timeout(timeout.as_secs())),
        }
    }
}
