use std::sync::Arc;

use async_trait::async_trait;

use crate::{worker::WorkerPool, DispatchResult, WorkerId};

/// Adds and removes compute on behalf of the auto-scaler
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    async fn current_workers(&self) -> DispatchResult<usize>;

    async fn spawn_worker(&self) -> DispatchResult<WorkerId>;

    /// Remove one worker; `None` when there is nothing to remove
    async fn terminate_worker(&self) -> DispatchResult<Option<WorkerId>>;
}

/// Provisions workers inside the local [`WorkerPool`]
pub struct PoolProvisioner {
    pool: Arc<WorkerPool>,
}

impl PoolProvisioner {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProvisioningBackend for PoolProvisioner {
    async fn current_workers(&self) -> DispatchResult<usize> {
        Ok(self.pool.worker_count())
    }

    async fn spawn_worker(&self) -> DispatchResult<WorkerId> {
        self.pool.spawn_worker()
    }

    async fn terminate_worker(&self) -> DispatchResult<Option<WorkerId>> {
        self.pool.stop_idlest_worker().await
    }
}
