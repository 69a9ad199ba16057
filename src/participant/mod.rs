// # Regional Participant
//
// One per region: ride CRUD over the regional store, aggregated stats, the
// store health probe, and the 2PC participant protocol (`twopc`). All
// durable state lives in the store; the participant itself is stateless.

pub mod handlers;
pub mod twopc;

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::info;

use crate::error::{FleetError, Result};
use crate::model::query::ListRidesParams;
use crate::model::{
    round_fare, HealthResponse, HealthState, Region, RegionalStats, Ride, RideCreate, RideUpdate,
};
use crate::store::memory::MemoryEngine;
use crate::store::{FieldUpdates, RegionalStore, RideFilter, RideSort, RideStore};
use crate::txlog::ParticipantLog;

/// Default page size for ride listings.
const DEFAULT_LIST_LIMIT: usize = 50;

/// Regional participant service.
pub struct RegionalParticipant {
    region: Region,
    store: Arc<dyn RegionalStore>,
    participant_log: Arc<ParticipantLog>,
}

impl RegionalParticipant {
    pub fn new(
        region: Region,
        store: Arc<dyn RegionalStore>,
        participant_log: Arc<ParticipantLog>,
    ) -> Self {
        Self { region, store, participant_log }
    }

    /// Wire a participant onto an engine: the ride adapter plus this
    /// region's participant-record log.
    pub fn from_engine(region: Region, engine: Arc<MemoryEngine>) -> Self {
        let store = Arc::new(RideStore::regional(engine.clone()));
        let participant_log = Arc::new(ParticipantLog::new(engine));
        Self::new(region, store, participant_log)
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn store(&self) -> Arc<dyn RegionalStore> {
        self.store.clone()
    }

    pub async fn create_ride(&self, payload: RideCreate) -> Result<Ride> {
        payload.validate()?;
        if payload.city != self.region {
            return Err(FleetError::Validation(format!(
                "city {} does not match region {}",
                payload.city, self.region
            )));
        }

        let mut ride = payload.into_ride(Utc::now());
        let id = self.store.insert(&ride).await?;
        ride.id = Some(id);
        info!(region = %self.region, ride_id = %ride.ride_id, "ride created");
        Ok(ride)
    }

    pub async fn get_ride(&self, ride_id: &str) -> Result<Ride> {
        self.store
            .find_one(&RideFilter::by_ride_id(ride_id))
            .await?
            .ok_or_else(|| {
                FleetError::NotFound(format!("ride {ride_id} not found in {}", self.region))
            })
    }

    pub async fn list_rides(&self, params: &ListRidesParams) -> Result<Vec<Ride>> {
        let filter = RideFilter::from_list_params(params);
        let skip = params.skip.unwrap_or(0);
        let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT);
        self.store
            .find_many(&filter, skip, Some(limit), RideSort::TimestampDesc)
            .await
    }

    pub async fn update_ride(&self, ride_id: &str, update: RideUpdate) -> Result<Ride> {
        update.validate()?;

        let mut set = FieldUpdates::new();
        if let Some(status) = update.status {
            set = set.set("status", json!(status));
        }
        if let Some(fare) = update.fare {
            set = set.set("fare", json!(round_fare(fare)));
        }
        if let Some(loc) = update.current_location {
            set = set.set("currentLocation", json!(loc));
        }
        if let Some(loc) = update.end_location {
            set = set.set("endLocation", json!(loc));
        }
        if let Some(ts) = update.timestamp {
            set = set.set("timestamp", json!(ts));
        }

        self.store
            .find_and_update(&RideFilter::by_ride_id(ride_id), &set, true)
            .await?
            .ok_or_else(|| {
                FleetError::NotFound(format!("ride {ride_id} not found in {}", self.region))
            })
    }

    pub async fn delete_ride(&self, ride_id: &str) -> Result<()> {
        let deleted = self
            .store
            .delete_one(&RideFilter::by_ride_id(ride_id))
            .await?;
        if deleted == 0 {
            return Err(FleetError::NotFound(format!(
                "ride {ride_id} not found in {}",
                self.region
            )));
        }
        info!(region = %self.region, ride_id, "ride deleted");
        Ok(())
    }

    pub async fn stats(&self) -> Result<RegionalStats> {
        let stats = self.store.aggregate_stats().await?;
        Ok(RegionalStats {
            region: self.region,
            total_rides: stats.total,
            active_rides: stats.in_progress,
            completed_rides: stats.completed,
            cancelled_rides: stats.cancelled,
            total_revenue: round_fare(stats.total_fare),
            avg_fare: round_fare(stats.avg_fare),
        })
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        let health = self.store.health().await?;
        let mongodb_status = match health.status {
            HealthState::Healthy => "PRIMARY",
            HealthState::Degraded => "SECONDARY",
            HealthState::Unhealthy => "UNKNOWN",
        };
        Ok(HealthResponse {
            status: health.status,
            region: self.region,
            mongodb_primary: health.primary,
            mongodb_status: mongodb_status.to_owned(),
            replication_lag_ms: health.replication_lag_ms,
            last_write: health.last_write,
            uptime_seconds: self.store.uptime_seconds(),
        })
    }
}
