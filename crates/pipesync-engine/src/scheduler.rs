//! Periodic incremental sync scheduling
//!
//! Kicks off an incremental session at a fixed interval. Overlap is handled
//! by the orchestrator's single-active-session guard: a tick that lands while
//! a session is still running is simply skipped, never queued.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::orchestrator::{EngineError, SyncOrchestrator};

/// Runs incremental syncs on a fixed interval until cancelled
pub struct SyncScheduler {
    orchestrator: SyncOrchestrator,
    interval: Duration,
    cancel: CancellationToken,
}

impl SyncScheduler {
    pub fn new(
        orchestrator: SyncOrchestrator,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            orchestrator,
            interval,
            cancel,
        }
    }

    /// Runs the tick loop; returns when the cancellation token fires
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; consume it so the first
        // scheduled run happens one full interval after startup
        ticker.tick().await;
        info!(interval_secs = self.interval.as_secs(), "sync scheduler started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("sync scheduler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.orchestrator.start_incremental().await {
                        Ok(session_id) => {
                            info!(%session_id, "scheduled incremental sync started");
                        }
                        Err(EngineError::AlreadyRunning(session_id)) => {
                            debug!(%session_id, "sync still active, skipping scheduled run");
                        }
                        Err(e) => {
                            warn!(error = %e, "scheduled sync failed to start");
                        }
                    }
                }
            }
        }
    }
}
