// # Fleetmesh Server
//
// Boots the whole coordination plane in one address space: the regional
// stores, both regional participant servers, the handoff coordinator, the
// health monitor, the change replicators, and the recovery scanner. Every
// component is an independent supervised task; the participants are still
// reached over HTTP by the coordinator even when co-located.

use std::sync::Arc;

use tracing::{error, info};

use fleetmesh::config::FleetConfig;
use fleetmesh::coordinator::{self, Coordinator, HealthMonitor, HealthView, ParticipantClient};
use fleetmesh::error::Result;
use fleetmesh::model::Region;
use fleetmesh::participant::{self, RegionalParticipant};
use fleetmesh::replicator;
use fleetmesh::store::{registry, RegionalStore, RideStore};
use fleetmesh::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    info!(version = VERSION, "starting fleetmesh");

    let config = FleetConfig::from_env()?;

    // Regional participants, one server per region.
    let mut sources: Vec<(Region, Arc<dyn RegionalStore>)> = Vec::new();
    for (region, port) in [(Region::Phx, config.phx_port), (Region::La, config.la_port)] {
        let engine = registry::engine_for_uri(config.store_uri(region))?;
        let participant = Arc::new(RegionalParticipant::from_engine(region, engine));
        sources.push((region, participant.store()));

        let addr = format!("{}:{}", config.listen_addr, port);
        tokio::spawn(async move {
            if let Err(e) = participant::handlers::serve(participant, &addr).await {
                error!(%region, error = %e, "participant server exited");
            }
        });
    }

    // Health monitor: single writer of the per-region flags.
    let health = HealthView::new();
    let probe_client = Arc::new(ParticipantClient::new(&config)?);
    let monitor = HealthMonitor::new(
        probe_client,
        health.clone(),
        config.health_poll_interval,
        config.health_probe_timeout,
    );
    tokio::spawn(monitor.run());

    // Change replication into the GLOBAL replica.
    let global_engine = registry::engine_for_uri(&config.global_store_uri)?;
    let global_store: Arc<dyn RegionalStore> = Arc::new(RideStore::global(global_engine));
    replicator::start_replicators(config.replicator_mode, sources, global_store).await?;

    // The coordinator itself, plus its recovery scanner.
    let coord = Arc::new(Coordinator::new(&config, health)?);
    tokio::spawn(coord.recovery_scanner(&config).run());

    let addr = format!("{}:{}", config.listen_addr, config.coordinator_port);
    let server = {
        let coord = coord.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator::handlers::serve(coord, &addr).await {
                error!(error = %e, "coordinator server exited");
            }
        })
    };

    info!(
        coordinator_port = config.coordinator_port,
        phx_port = config.phx_port,
        la_port = config.la_port,
        "fleetmesh is ready"
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        _ = server => {
            error!("coordinator server task ended unexpectedly");
        }
    }

    info!("shutdown complete");
    Ok(())
}
