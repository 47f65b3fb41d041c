use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    backend::{BoxStream, JobStore, MemoryStore},
    codec::CodecRegistry,
    config::EngineConfig,
    dispatch::{DispatchRequest, DispatchResponse, Dispatcher, LocalTarget},
    job::HandlerRegistry,
    observability::{MetricsCollector, MetricsSnapshot},
    queue::{EnqueueRequest, JobQueue, OrphanReaper, QueueStats},
    scaling::{AutoScaler, PoolProvisioner, ProvisioningBackend, ScalingDecision},
    worker::{JobExecutor, WorkerPool},
    DispatchError, DispatchResult, Job, JobEvent, JobId, WorkerId, WorkerState,
};

/// Assembles a [`DispatchEngine`]
pub struct DispatchEngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn JobStore>>,
    handlers: HandlerRegistry,
    codecs: CodecRegistry,
    provisioner: Option<Arc<dyn ProvisioningBackend>>,
}

impl DispatchEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            handlers: HandlerRegistry::default(),
            codecs: CodecRegistry::default(),
            provisioner: None,
        }
    }

    /// Shared store; defaults to a fresh [`MemoryStore`]
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_codec_registry(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// Compute provisioning for the auto-scaler; defaults to the local pool
    pub fn with_provisioner(mut self, provisioner: Arc<dyn ProvisioningBackend>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn build(self) -> DispatchResult<DispatchEngine> {
        self.config.validate()?;

        let config = self.config;
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let metrics = Arc::new(MetricsCollector::with_limits(1000, config.autoscaler.history_limit));
        let queue = Arc::new(JobQueue::new(store.clone(), config.queue.clone(), metrics.clone()));

        let handlers = Arc::new(self.handlers);
        let codecs = Arc::new(self.codecs);
        let executor = JobExecutor::new(handlers.clone(), codecs.clone());

        let pool = Arc::new(WorkerPool::new(queue.clone(), executor.clone(), config.worker.clone()));
        let dispatcher = Arc::new(Dispatcher::new(config.dispatcher.clone(), codecs.clone(), metrics.clone()));
        let reaper = Arc::new(OrphanReaper::new(queue.clone(), config.reaper.clone()));

        let provisioner = self
            .provisioner
            .unwrap_or_else(|| Arc::new(PoolProvisioner::new(pool.clone())));
        let autoscaler = Arc::new(
            AutoScaler::new(config.autoscaler.clone(), queue.clone(), metrics.clone(), provisioner.clone())
                .with_queues(config.worker.queues.clone()),
        );

        Ok(DispatchEngine {
            config,
            store,
            metrics,
            queue,
            executor,
            pool,
            dispatcher,
            reaper,
            autoscaler,
            provisioner,
            shutdown: CancellationToken::new(),
            loops: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }
}

/// Owns every engine service; nothing here is global
///
/// `start` brings up `min_workers` queue workers, the warm dispatch targets
/// and the reaper, monitor and auto-scaler loops. `shutdown` stops the loops
/// and drains the pool.
pub struct DispatchEngine {
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    metrics: Arc<MetricsCollector>,
    queue: Arc<JobQueue>,
    executor: JobExecutor,
    pool: Arc<WorkerPool>,
    dispatcher: Arc<Dispatcher>,
    reaper: Arc<OrphanReaper>,
    autoscaler: Arc<AutoScaler>,
    provisioner: Arc<dyn ProvisioningBackend>,
    shutdown: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl DispatchEngine {
    pub fn builder(config: EngineConfig) -> DispatchEngineBuilder {
        DispatchEngineBuilder::new(config)
    }

    /// In-memory engine with default configuration
    pub fn in_memory(handlers: HandlerRegistry) -> DispatchResult<Self> {
        Self::builder(EngineConfig::default()).with_handlers(handlers).build()
    }

    pub async fn start(&self) -> DispatchResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DispatchError::Validation("Engine already started".to_string()));
        }

        let mut workers = self.provisioner.current_workers().await?;
        while workers < self.config.autoscaler.min_workers {
            self.provisioner.spawn_worker().await?;
            workers += 1;
        }

        for _ in 0..self.config.dispatcher.warm_targets {
            let target = LocalTarget::new(
                WorkerId::generate("dispatch"),
                self.executor.clone(),
                self.config.dispatcher.request_timeout,
            );
            self.dispatcher.register_worker(Arc::new(target), 1)?;
        }

        let mut loops = self.loops.lock();
        loops.push(tokio::spawn(self.reaper.clone().run(self.shutdown.child_token())));
        loops.push(tokio::spawn(
            self.dispatcher.clone().run_monitor(self.shutdown.child_token()),
        ));
        loops.push(tokio::spawn(self.autoscaler.clone().run(self.shutdown.child_token())));

        info!(
            workers,
            warm_targets = self.config.dispatcher.warm_targets,
            "Dispatch engine started"
        );
        Ok(())
    }

    /// Stop the periodic loops and gracefully stop every worker
    pub async fn shutdown(&self) -> DispatchResult<()> {
        self.shutdown.cancel();

        let loops: Vec<JoinHandle<()>> = self.loops.lock().drain(..).collect();
        for handle in futures::future::join_all(loops).await {
            if let Err(e) = handle {
                warn!("Engine loop ended abnormally: {}", e);
            }
        }

        self.pool.shutdown().await?;
        info!("Dispatch engine stopped");
        Ok(())
    }

    pub async fn enqueue(&self, request: EnqueueRequest) -> DispatchResult<JobId> {
        self.queue.enqueue(request).await
    }

    pub async fn submit_request(&self, request: DispatchRequest) -> DispatchResult<DispatchResponse> {
        self.dispatcher.submit_request(request).await
    }

    pub async fn get_job(&self, job_id: &JobId) -> DispatchResult<Job> {
        self.queue.get_job(job_id).await
    }

    pub async fn cancel_job(&self, job_id: &JobId) -> DispatchResult<Job> {
        self.queue.cancel(job_id).await
    }

    pub async fn get_queue_stats(&self, queue: &str) -> DispatchResult<QueueStats> {
        self.queue.get_queue_stats(queue).await
    }

    pub async fn get_worker_info(&self, worker_id: &WorkerId) -> DispatchResult<WorkerState> {
        self.pool.get_worker_info(worker_id).await
    }

    /// Fresh snapshot, with queue stats and breaker state read now
    pub async fn get_metrics(&self) -> DispatchResult<MetricsSnapshot> {
        for name in self.queue.queue_names().await? {
            let stats = self.queue.get_queue_stats(&name).await?;
            self.metrics.record_queue_stats(stats);
        }
        self.metrics.set_circuit_state(self.dispatcher.circuit_state());
        Ok(self.metrics.snapshot())
    }

    pub fn scaling_history(&self) -> Vec<ScalingDecision> {
        self.autoscaler.history()
    }

    pub fn subscribe(&self) -> BoxStream<JobEvent> {
        self.queue.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn reaper(&self) -> &Arc<OrphanReaper> {
        &self.reaper
    }

    pub fn autoscaler(&self) -> &Arc<AutoScaler> {
        &self.autoscaler
    }
}
