use std::sync::Arc;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{backend::JobStore, worker::WorkerShared, DispatchResult};

/// Publish the worker record every `heartbeat_interval` until `stop` fires
///
/// Runs on its own task so a stuck handler cannot block liveness.
pub(crate) async fn run(shared: Arc<WorkerShared>, store: Arc<dyn JobStore>, stop: CancellationToken) {
    let mut ticker = interval(shared.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = beat(&shared, store.as_ref()).await {
                    warn!(worker_id = %shared.id, "Heartbeat failed: {}", e);
                }
            }
        }
    }

    debug!(worker_id = %shared.id, "Heartbeat stopped");
}

/// Write one heartbeat, keeping an unhealthy flag set by the reaper
pub(crate) async fn beat(shared: &WorkerShared, store: &dyn JobStore) -> DispatchResult<()> {
    if let Some(existing) = store.get_worker(&shared.id).await? {
        if !existing.healthy {
            shared.mark_unhealthy();
        }
    }
    store
        .put_worker(shared.state(), shared.config.heartbeat_ttl)
        .await
}
