//! Archival sweeper.
//!
//! Periodically moves terminal jobs whose retention window has ended out
//! of the active store. Archived jobs stay readable by id and can be
//! listed on request; their idempotency keys become free again.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::job::JobId;
use crate::store::JobStore;

/// Background task archiving expired terminal jobs.
#[derive(Debug, Clone)]
pub struct ArchivalSweeper {
    store: Arc<JobStore>,
    interval: Duration,
}

impl ArchivalSweeper {
    pub fn new(store: Arc<JobStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Archive everything expired as of `now`.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Vec<JobId> {
        let archived = self.store.archive_expired(now);
        if archived.is_empty() {
            debug!("archival sweep found nothing to archive");
        } else {
            info!(count = archived.len(), "archived expired jobs");
        }
        archived
    }

    /// Archive everything expired as of the current time.
    pub fn sweep(&self) -> Vec<JobId> {
        self.sweep_at(Utc::now())
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "archival sweeper started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
        info!("archival sweeper stopped");
    }
}
