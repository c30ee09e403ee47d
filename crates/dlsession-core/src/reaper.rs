//! Reaper - evicts finished sessions once their retention has passed
//!
//! Runs a background task that periodically asks the coordinator to drop
//! Complete/Error sessions older than the configured retention.

use crate::coordinator::Coordinator;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Periodic retention sweep
pub struct Reaper {
    coordinator: Arc<Coordinator>,
    retention: Duration,
    every: Duration,
}

impl Reaper {
    pub fn new(coordinator: Arc<Coordinator>, retention: Duration, every: Duration) -> Self {
        Self {
            coordinator,
            retention,
            every,
        }
    }

    /// Run one sweep now
    pub fn sweep(&self) -> usize {
        let evicted = self.coordinator.reap(Utc::now(), self.retention);
        if evicted > 0 {
            info!(evicted, "Reaped finished downloads");
        }
        evicted
    }

    /// Start the background task. It stops when `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        info!(
            retention_secs = self.retention.as_secs(),
            every_secs = self.every.as_secs(),
            "Starting reaper"
        );

        tokio::spawn(async move {
            let mut ticker = interval(self.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                self.sweep();
            }

            debug!("Reaper stopped");
        })
    }
}
