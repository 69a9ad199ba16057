// Shared harness: boots the full coordination plane in-process on ephemeral
// ports, with direct handles on the stores and services for fault injection.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use uuid::Uuid;

use fleetmesh::config::FleetConfig;
use fleetmesh::coordinator::{handlers as coord_handlers, Coordinator, HealthView, RecoveryScanner};
use fleetmesh::model::{GeoPoint, Region, Ride, RideCreate, RideStatus};
use fleetmesh::participant::{handlers as rp_handlers, RegionalParticipant};
use fleetmesh::replicator::ChangeReplicator;
use fleetmesh::store::{registry, RegionalStore, RideFilter, RideSort, RideStore};
use fleetmesh::txlog::TransactionLog;

pub struct TestCluster {
    pub config: FleetConfig,
    pub coordinator: Arc<Coordinator>,
    pub health: HealthView,
    pub phx: Arc<RegionalParticipant>,
    pub la: Arc<RegionalParticipant>,
    pub global_store: Arc<dyn RegionalStore>,
    pub coordinator_url: String,
    pub phx_url: String,
    pub la_url: String,
    pub http: reqwest::Client,
    pub phx_server: JoinHandle<()>,
    pub la_server: JoinHandle<()>,
    coordinator_server: JoinHandle<()>,
    replicator_handles: Vec<JoinHandle<()>>,
}

async fn spawn(app: axum::Router) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, handle)
}

impl TestCluster {
    /// Boot participants, coordinator, and (optionally) replicators.
    pub async fn start(replicate: bool) -> Self {
        let run_id = Uuid::new_v4().simple().to_string();
        let mut config = FleetConfig::default();
        config.phx_store_uri = format!("mem://t-{run_id}-phx");
        config.la_store_uri = format!("mem://t-{run_id}-la");
        config.global_store_uri = format!("mem://t-{run_id}-global");
        // Tight budgets keep failure-path tests fast.
        config.prepare_deadline = Duration::from_secs(2);
        config.commit_deadline = Duration::from_secs(2);
        config.recovery_grace = Duration::ZERO;

        let phx_engine = registry::engine_for_uri(&config.phx_store_uri).unwrap();
        let la_engine = registry::engine_for_uri(&config.la_store_uri).unwrap();
        let global_engine = registry::engine_for_uri(&config.global_store_uri).unwrap();

        let phx = Arc::new(RegionalParticipant::from_engine(Region::Phx, phx_engine));
        let la = Arc::new(RegionalParticipant::from_engine(Region::La, la_engine));
        let global_store: Arc<dyn RegionalStore> = Arc::new(RideStore::global(global_engine));

        let (phx_addr, phx_server) = spawn(rp_handlers::router(phx.clone())).await;
        let (la_addr, la_server) = spawn(rp_handlers::router(la.clone())).await;
        config
            .region_endpoints
            .insert(Region::Phx, format!("http://{phx_addr}"));
        config
            .region_endpoints
            .insert(Region::La, format!("http://{la_addr}"));

        let mut replicator_handles = Vec::new();
        if replicate {
            for (region, participant) in [(Region::Phx, &phx), (Region::La, &la)] {
                let replicator =
                    ChangeReplicator::new(region, participant.store(), global_store.clone());
                replicator.initial_sync().await.unwrap();
                replicator_handles.push(tokio::spawn(replicator.run()));
            }
        }

        let health = HealthView::new();
        let coordinator = Arc::new(Coordinator::new(&config, health.clone()).unwrap());
        let (coord_addr, coordinator_server) =
            spawn(coord_handlers::router(coordinator.clone())).await;

        let cluster = Self {
            coordinator_url: format!("http://{coord_addr}"),
            phx_url: format!("http://{phx_addr}"),
            la_url: format!("http://{la_addr}"),
            http: reqwest::Client::new(),
            config,
            coordinator,
            health,
            phx,
            la,
            global_store,
            phx_server,
            la_server,
            coordinator_server,
            replicator_handles,
        };
        cluster.wait_ready().await;
        cluster
    }

    async fn wait_ready(&self) {
        for url in [&self.phx_url, &self.la_url] {
            for _ in 0..50 {
                if self
                    .http
                    .get(format!("{url}/health"))
                    .send()
                    .await
                    .map(|r| r.status().is_success())
                    .unwrap_or(false)
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }

    pub fn participant(&self, region: Region) -> &Arc<RegionalParticipant> {
        match region {
            Region::Phx => &self.phx,
            Region::La => &self.la,
        }
    }

    pub fn region_url(&self, region: Region) -> &str {
        match region {
            Region::Phx => &self.phx_url,
            Region::La => &self.la_url,
        }
    }

    pub fn txlog(&self) -> Arc<TransactionLog> {
        self.coordinator.txlog()
    }

    pub fn recovery_scanner(&self) -> RecoveryScanner {
        self.coordinator.recovery_scanner(&self.config)
    }

    pub async fn seed_ride(&self, region: Region, ride_id: &str) -> Ride {
        self.seed_ride_at(region, ride_id, Utc::now()).await
    }

    pub async fn seed_ride_at(
        &self,
        region: Region,
        ride_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Ride {
        self.participant(region)
            .create_ride(ride_payload(ride_id, region, timestamp))
            .await
            .unwrap()
    }

    /// Total rides across both regional stores.
    pub async fn regional_count(&self) -> usize {
        let mut count = 0;
        for region in Region::all() {
            count += self
                .participant(region)
                .store()
                .find_many(&RideFilter::all(), 0, None, RideSort::Unsorted)
                .await
                .unwrap()
                .len();
        }
        count
    }

    /// Regions holding this ride right now.
    pub async fn holders(&self, ride_id: &str) -> Vec<Region> {
        let mut holders = Vec::new();
        for region in Region::all() {
            if self
                .participant(region)
                .store()
                .find_one(&RideFilter::by_ride_id(ride_id))
                .await
                .unwrap()
                .is_some()
            {
                holders.push(region);
            }
        }
        holders
    }

    /// Assert no ride in either region is still locked by `tx_id`.
    pub async fn assert_no_locks(&self, tx_id: &str) {
        for region in Region::all() {
            let filter = RideFilter::all()
                .with_locked(true)
                .with_transaction_id(tx_id);
            let stuck = self
                .participant(region)
                .store()
                .find_many(&filter, 0, None, RideSort::Unsorted)
                .await
                .unwrap();
            assert!(
                stuck.is_empty(),
                "region {region} still holds locks for {tx_id}: {stuck:?}"
            );
        }
    }

    /// Wait until the GLOBAL replica satisfies a predicate over the rides
    /// matching `ride_id`, or panic after the deadline.
    pub async fn wait_global<F>(&self, ride_id: &str, deadline: Duration, predicate: F)
    where
        F: Fn(&[Ride]) -> bool,
    {
        let start = std::time::Instant::now();
        loop {
            let rides = self
                .global_store
                .find_many(&RideFilter::by_ride_id(ride_id), 0, None, RideSort::Unsorted)
                .await
                .unwrap();
            if predicate(&rides) {
                return;
            }
            if start.elapsed() > deadline {
                panic!("global replica did not converge for {ride_id}: {rides:?}");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

pub fn ride_payload(ride_id: &str, region: Region, timestamp: DateTime<Utc>) -> RideCreate {
    RideCreate {
        ride_id: ride_id.into(),
        vehicle_id: "AV-100".into(),
        customer_id: "C-200".into(),
        status: RideStatus::InProgress,
        city: region,
        fare: 27.5,
        start_location: GeoPoint { lat: 33.4484, lon: -112.0740 },
        current_location: GeoPoint { lat: 33.6, lon: -113.5 },
        end_location: GeoPoint { lat: 34.0522, lon: -118.2437 },
        timestamp: Some(timestamp),
    }
}
