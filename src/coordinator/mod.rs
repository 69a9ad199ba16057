// # Handoff Coordinator Service
//
// The cross-region control plane: 2PC handoff driver, health-gated
// admission, routed reads, ride location, transaction history, and the
// recovery scanner. All durable coordinator state lives in the transaction
// log on the globally-visible store; the service record here is wiring.

pub mod client;
pub mod handlers;
pub mod handoff;
pub mod health;
pub mod locate;
pub mod recovery;
pub mod router;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::{json, Value};
use tracing::warn;

use crate::config::FleetConfig;
use crate::error::Result;
use crate::model::protocol::{HandoffRequest, HandoffResponse, LocateResponse};
use crate::model::query::RideQuery;
use crate::model::{Region, RegionalStats, Ride};
use crate::store::{registry, RegionalStore, RideStore};
use crate::txlog::{TransactionLog, TxRecord};

pub use client::ParticipantClient;
pub use handoff::HandoffCoordinator;
pub use health::{HealthMonitor, HealthView};
pub use locate::RideLocator;
pub use recovery::{RecoveryReport, RecoveryScanner};
pub use router::QueryRouter;

/// Dependency-injected coordinator service record. Constructed once at
/// startup; handlers receive a shared reference.
pub struct Coordinator {
    client: Arc<ParticipantClient>,
    txlog: Arc<TransactionLog>,
    handoff: HandoffCoordinator,
    router: QueryRouter,
    locator: RideLocator,
}

impl Coordinator {
    pub fn new(config: &FleetConfig, health: HealthView) -> Result<Self> {
        let client = Arc::new(ParticipantClient::new(config)?);
        let global_engine = registry::engine_for_uri(&config.global_store_uri)?;
        let txlog = Arc::new(TransactionLog::new(global_engine.clone()));
        let global_store: Arc<dyn RegionalStore> = Arc::new(RideStore::global(global_engine));

        let handoff = HandoffCoordinator::new(client.clone(), txlog.clone(), health);
        let router = QueryRouter::new(client.clone(), global_store);
        let locator = RideLocator::new(client.clone(), txlog.clone());

        Ok(Self { client, txlog, handoff, router, locator })
    }

    pub fn client(&self) -> Arc<ParticipantClient> {
        self.client.clone()
    }

    pub fn txlog(&self) -> Arc<TransactionLog> {
        self.txlog.clone()
    }

    pub fn recovery_scanner(&self, config: &FleetConfig) -> RecoveryScanner {
        RecoveryScanner::new(
            self.client.clone(),
            self.txlog.clone(),
            config.recovery_grace,
            config.recovery_scan_interval,
        )
    }

    pub async fn handoff(&self, req: &HandoffRequest) -> Result<HandoffResponse> {
        self.handoff.handoff(req).await
    }

    pub async fn search(&self, query: &RideQuery) -> Result<Vec<Ride>> {
        self.router.search(query).await
    }

    pub async fn locate(&self, ride_id: &str) -> Result<LocateResponse> {
        self.locator.locate(ride_id).await
    }

    pub fn transaction(&self, tx_id: &str) -> Result<Option<TxRecord>> {
        self.txlog.get(tx_id)
    }

    pub fn history(&self, limit: usize) -> Result<(usize, Vec<TxRecord>)> {
        self.txlog.recent(limit)
    }

    /// Per-region stats; an unreachable region reports null.
    pub async fn stats_all(&self) -> HashMap<String, Option<RegionalStats>> {
        let fetches = Region::all().map(|region| {
            let client = self.client.clone();
            async move { (region, client.stats(region).await) }
        });

        let mut out = HashMap::new();
        for (region, result) in join_all(fetches).await {
            match result {
                Ok(stats) => {
                    out.insert(region.to_string(), Some(stats));
                }
                Err(e) => {
                    warn!(%region, error = %e, "stats fetch failed");
                    out.insert(region.to_string(), None);
                }
            }
        }
        out
    }

    /// Per-region health; an unreachable region reports the probe error.
    pub async fn health_all(&self) -> HashMap<String, Value> {
        let fetches = Region::all().map(|region| {
            let client = self.client.clone();
            async move {
                (
                    region,
                    client.health(region, std::time::Duration::from_secs(2)).await,
                )
            }
        });

        let mut out = HashMap::new();
        for (region, result) in join_all(fetches).await {
            let value = match result {
                Ok(health) => json!(health),
                Err(e) => json!({"status": "unreachable", "error": e.to_string()}),
            };
            out.insert(region.to_string(), value);
        }
        out
    }
}
