use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::{job::JobDefinition, DispatchError, DispatchResult, JobError};

/// Type-erased handler invoked with a job's decoded payload
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> Result<Value, JobError>;
}

/// Handler backed by an async closure
pub struct FnHandler<F> {
    func: F,
}

impl<F> FnHandler<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, JobError>> + Send,
{
    async fn handle(&self, payload: Value) -> Result<Value, JobError> {
        (self.func)(payload).await
    }
}

/// Adapts a [`JobDefinition`] to the type-erased handler interface
struct DefinitionHandler<J: JobDefinition> {
    _phantom: PhantomData<fn() -> J>,
}

#[async_trait]
impl<J: JobDefinition> JobHandler for DefinitionHandler<J> {
    async fn handle(&self, payload: Value) -> Result<Value, JobError> {
        let job: J = serde_json::from_value(payload)
            .map_err(|e| JobError::Permanent(format!("Failed to deserialize job: {}", e)))?;

        let output = job.execute().await?;

        serde_json::to_value(&output)
            .map_err(|e| JobError::Permanent(format!("Failed to serialize result: {}", e)))
    }
}

/// Registry mapping job types to handlers
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    /// Create a new handler registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job type
    pub fn register(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> DispatchResult<()> {
        let job_type = job_type.into();
        if job_type.is_empty() {
            return Err(DispatchError::Validation("job_type must not be empty".to_string()));
        }
        if self.handlers.contains_key(&job_type) {
            return Err(DispatchError::Validation(format!(
                "Job type '{}' already registered",
                job_type
            )));
        }
        self.handlers.insert(job_type, handler);
        Ok(())
    }

    /// Register an async closure as a handler
    pub fn register_fn<F, Fut>(&mut self, job_type: impl Into<String>, func: F) -> DispatchResult<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
    {
        self.register(job_type, Arc::new(FnHandler::new(func)))
    }

    /// Register a typed job definition
    pub fn register_job<J: JobDefinition>(&mut self) -> DispatchResult<()> {
        self.register(
            J::JOB_TYPE,
            Arc::new(DefinitionHandler::<J> {
                _phantom: PhantomData,
            }),
        )
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    /// Check if a job type is registered
    pub fn is_registered(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Get all registered job types, sorted
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Run the handler for `job_type`
    ///
    /// A missing handler is a recoverable failure, not a crash.
    pub async fn execute(&self, job_type: &str, payload: Value) -> Result<Value, JobError> {
        let handler = self.get(job_type).ok_or_else(|| {
            JobError::Retryable(format!("No handler registered for job type: {}", job_type))
        })?;
        handler.handle(payload).await
    }
}
