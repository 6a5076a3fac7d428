//! Periodic dashboard snapshot publisher.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broker::Broker;

/// Default cadence for dashboard snapshots.
pub const DASHBOARD_INTERVAL: Duration = Duration::from_secs(2);

/// Spawn a task that broadcasts a dashboard snapshot every `interval`
/// until the shutdown signal fires.
pub fn spawn_dashboard_publisher(
    broker: Broker,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        debug!("Dashboard publisher started at {:?} cadence", interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = broker.publish_dashboard_snapshot().await {
                        warn!("Skipping dashboard snapshot: {}", e);
                    }
                }
            }
        }
        debug!("Dashboard publisher stopped");
    })
}
