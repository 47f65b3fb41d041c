use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    config::WorkerConfig,
    queue::JobQueue,
    worker::{JobExecutor, Worker, WorkerHandle},
    DispatchError, DispatchResult, WorkerId, WorkerState, WorkerStatus,
};

/// Aggregate view of the pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub workers: usize,
    pub busy: usize,
    pub idle: usize,
    pub unhealthy: usize,
    pub active_jobs: usize,
    pub total_slots: usize,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
}

/// Set of local workers, keyed by id
///
/// Workers never hold a reference back to the pool; the pool addresses them
/// only through their handles.
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    executor: JobExecutor,
    config: WorkerConfig,
    workers: Mutex<HashMap<WorkerId, WorkerHandle>>,
}

impl WorkerPool {
    pub fn new(queue: Arc<JobQueue>, executor: JobExecutor, config: WorkerConfig) -> Self {
        Self {
            queue,
            executor,
            config,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Start one more worker
    pub fn spawn_worker(&self) -> DispatchResult<WorkerId> {
        if self.config.max_concurrent_jobs == 0 {
            return Err(DispatchError::Validation(
                "max_concurrent_jobs must be greater than zero".to_string(),
            ));
        }

        let id = WorkerId::generate(&self.config.worker_type);
        let worker = Worker::new(
            id.clone(),
            self.queue.clone(),
            self.executor.clone(),
            self.config.clone(),
        );
        let handle = worker.spawn();
        self.workers.lock().insert(id.clone(), handle);

        info!(worker_id = %id, "Spawned worker");
        Ok(id)
    }

    /// Gracefully stop one worker
    pub async fn stop_worker(&self, worker_id: &WorkerId) -> DispatchResult<()> {
        let handle = self
            .workers
            .lock()
            .remove(worker_id)
            .ok_or_else(|| DispatchError::WorkerNotFound(worker_id.to_string()))?;
        handle.shutdown().await
    }

    /// Stop the worker least worth keeping: unhealthy first, then the least loaded
    pub async fn stop_idlest_worker(&self) -> DispatchResult<Option<WorkerId>> {
        let victim = {
            let workers = self.workers.lock();
            workers
                .values()
                .min_by_key(|handle| (handle.is_healthy(), handle.active_jobs(), handle.id().clone()))
                .map(|handle| handle.id().clone())
        };

        match victim {
            Some(id) => {
                self.stop_worker(&id).await?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    /// Stop every worker
    pub async fn shutdown(&self) -> DispatchResult<()> {
        let handles: Vec<WorkerHandle> = self.workers.lock().drain().map(|(_, h)| h).collect();
        let count = handles.len();

        let results = futures::future::join_all(handles.into_iter().map(WorkerHandle::shutdown)).await;
        for result in results {
            result?;
        }

        info!(workers = count, "Worker pool stopped");
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self.workers.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Records of local workers, sorted by id
    pub fn workers(&self) -> Vec<WorkerState> {
        let mut states: Vec<WorkerState> = self.workers.lock().values().map(WorkerHandle::state).collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }

    /// Record of a worker, local or published by another process
    pub async fn get_worker_info(&self, worker_id: &WorkerId) -> DispatchResult<WorkerState> {
        let local = self.workers.lock().get(worker_id).map(WorkerHandle::state);
        if let Some(state) = local {
            return Ok(state);
        }
        self.queue
            .store()
            .get_worker(worker_id)
            .await?
            .ok_or_else(|| DispatchError::WorkerNotFound(worker_id.to_string()))
    }

    pub fn stats(&self) -> PoolStats {
        let states = self.workers();
        let mut stats = PoolStats {
            workers: states.len(),
            ..PoolStats::default()
        };
        for state in &states {
            match state.status {
                WorkerStatus::Busy => stats.busy += 1,
                WorkerStatus::Idle => stats.idle += 1,
                _ => {}
            }
            if !state.healthy {
                stats.unhealthy += 1;
            }
            stats.active_jobs += state.resources.active_jobs;
            stats.total_slots += state.max_concurrent_jobs;
            stats.jobs_completed += state.resources.jobs_completed;
            stats.jobs_failed += state.resources.jobs_failed;
        }
        stats
    }
}
