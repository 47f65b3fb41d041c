use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::ReaperConfig, queue::JobQueue, DispatchError, DispatchResult, Job, JobStatus,
};

/// Outcome of one health-check cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapStats {
    pub promoted: usize,
    pub reclaimed: usize,
    pub flagged_workers: usize,
    pub purged: usize,
}

/// Health-check cycle reclaiming orphaned jobs
///
/// A processing job is orphaned once its deadline plus the grace period has
/// passed, or once the worker holding it no longer has a live record.
pub struct OrphanReaper {
    queue: Arc<JobQueue>,
    config: ReaperConfig,
}

impl OrphanReaper {
    pub fn new(queue: Arc<JobQueue>, config: ReaperConfig) -> Self {
        Self { queue, config }
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Run cycles every `interval` until `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Starting orphan reaper with interval: {:?}", self.config.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.reap().await {
                        Ok(stats) if stats.reclaimed > 0 || stats.purged > 0 => {
                            info!(
                                reclaimed = stats.reclaimed,
                                flagged_workers = stats.flagged_workers,
                                purged = stats.purged,
                                "Reaper cycle finished"
                            );
                        }
                        Ok(_) => debug!("No orphaned jobs found"),
                        Err(e) => warn!("Error during reaper cycle: {}", e),
                    }
                }
            }
        }

        info!("Orphan reaper stopped");
    }

    /// Run one cycle now
    pub async fn reap(&self) -> DispatchResult<ReapStats> {
        self.reap_at(Utc::now()).await
    }

    /// Run one cycle as if the clock read `now`
    pub async fn reap_at(&self, now: DateTime<Utc>) -> DispatchResult<ReapStats> {
        let mut stats = ReapStats::default();
        let store = self.queue.store();
        let grace = chrono::Duration::from_std(self.config.reclaim_grace)
            .map_err(|e| DispatchError::Validation(format!("Invalid reclaim grace: {}", e)))?;
        let retention = chrono::Duration::from_std(self.config.retention)
            .map_err(|e| DispatchError::Validation(format!("Invalid retention: {}", e)))?;

        for queue in self.queue.queue_names().await? {
            stats.promoted += self.queue.promote_due(&queue, now).await?;

            for job_id in store.processing_list(&queue).await? {
                let job = match store.get_job(&job_id).await? {
                    Some(job) if job.status == JobStatus::Processing => job,
                    // indexed just ahead of an in-flight claim
                    Some(job) if job.status == JobStatus::Pending => continue,
                    _ => {
                        store.processing_remove(&queue, &job_id).await?;
                        continue;
                    }
                };

                let reason = match self.orphan_reason(&job, now, grace).await? {
                    Some(reason) => reason,
                    None => continue,
                };

                match self.queue.reclaim(&job, reason, now).await {
                    Ok(_) => stats.reclaimed += 1,
                    Err(DispatchError::Conflict { .. }) => {
                        debug!(job_id = %job.id, "Job changed while reclaiming, skipped");
                        continue;
                    }
                    Err(e) => return Err(e),
                }

                if let Some(worker_id) = &job.worker_id {
                    if store.mark_worker_unhealthy(worker_id).await? {
                        warn!(worker_id = %worker_id, job_id = %job.id, "Worker flagged unhealthy");
                        stats.flagged_workers += 1;
                    }
                }
            }

            stats.purged += self.queue.purge_terminal(&queue, now - retention).await?;
            self.queue
                .metrics()
                .record_queue_stats(self.queue.get_queue_stats(&queue).await?);
        }

        Ok(stats)
    }

    async fn orphan_reason(
        &self,
        job: &Job,
        now: DateTime<Utc>,
        grace: chrono::Duration,
    ) -> DispatchResult<Option<&'static str>> {
        if let Some(deadline) = job.deadline() {
            if now > deadline + grace {
                return Ok(Some("timeout"));
            }
        }

        let started = job.started_at.unwrap_or(now);
        if let Some(worker_id) = &job.worker_id {
            if now - started > grace && self.queue.store().get_worker(worker_id).await?.is_none() {
                return Ok(Some("worker lost"));
            }
        }

        Ok(None)
    }
}
