// # Health Monitor
//
// Periodic liveness probes of every regional participant. The per-region
// flag is a single-writer atomic read lock-free by the admission gate;
// in-flight transactions are never cancelled by a health flip.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::model::{HealthState, Region};

use super::client::ParticipantClient;

/// Lock-free view of regional health. Regions start healthy.
#[derive(Clone)]
pub struct HealthView {
    flags: Arc<HashMap<Region, AtomicBool>>,
}

impl HealthView {
    pub fn new() -> Self {
        let mut flags = HashMap::new();
        for region in Region::all() {
            flags.insert(region, AtomicBool::new(true));
        }
        Self { flags: Arc::new(flags) }
    }

    pub fn is_healthy(&self, region: Region) -> bool {
        self.flags
            .get(&region)
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Single writer: the monitor loop (or an operator override).
    pub fn set_healthy(&self, region: Region, healthy: bool) {
        if let Some(flag) = self.flags.get(&region) {
            flag.store(healthy, Ordering::Relaxed);
        }
    }
}

impl Default for HealthView {
    fn default() -> Self {
        Self::new()
    }
}

/// The probe loop. Runs as its own supervised task.
pub struct HealthMonitor {
    client: Arc<ParticipantClient>,
    view: HealthView,
    poll_interval: Duration,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(
        client: Arc<ParticipantClient>,
        view: HealthView,
        poll_interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self { client, view, poll_interval, probe_timeout }
    }

    pub fn view(&self) -> HealthView {
        self.view.clone()
    }

    /// Probe every region once, logging transitions.
    pub async fn probe_all(&self) {
        for region in Region::all() {
            let healthy = match self.client.health(region, self.probe_timeout).await {
                Ok(health) => health.status != HealthState::Unhealthy,
                Err(e) => {
                    warn!(%region, error = %e, "health probe failed");
                    false
                }
            };

            let was_healthy = self.view.is_healthy(region);
            if was_healthy != healthy {
                if healthy {
                    info!(%region, "region recovered");
                } else {
                    warn!(%region, "region marked unhealthy");
                }
            }
            self.view.set_healthy(region, healthy);
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.probe_all().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regions_start_healthy() {
        let view = HealthView::new();
        assert!(view.is_healthy(Region::Phx));
        assert!(view.is_healthy(Region::La));
    }

    #[test]
    fn test_flip_and_restore() {
        let view = HealthView::new();
        view.set_healthy(Region::La, false);
        assert!(!view.is_healthy(Region::La));
        assert!(view.is_healthy(Region::Phx));

        view.set_healthy(Region::La, true);
        assert!(view.is_healthy(Region::La));
    }

    #[test]
    fn test_clones_share_flags() {
        let view = HealthView::new();
        let other = view.clone();
        other.set_healthy(Region::Phx, false);
        assert!(!view.is_healthy(Region::Phx));
    }
}
