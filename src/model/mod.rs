// # Domain Model
//
// Ride documents, regions, statuses, and validation rules shared by the
// regional participants, the coordinator, and the replicator.

pub mod protocol;
pub mod query;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

static RIDE_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^R-\d+$").unwrap());
static VEHICLE_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^AV-\d+$").unwrap());
static CUSTOMER_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^C-\d+$").unwrap());

/// The fare floor enforced for non-zero fares. Zero is a special value used
/// for promotional rides and is always accepted.
pub const MIN_CHARGEABLE_FARE: f64 = 5.00;

/// Upper bound on any fare.
pub const MAX_FARE: f64 = 1000.0;

/// A regional shard. Each ride is owned by exactly one region outside of an
/// in-flight handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    #[serde(rename = "PHX")]
    Phx,
    #[serde(rename = "LA")]
    La,
}

impl Region {
    /// All regional shards, in canonical order.
    pub fn all() -> [Region; 2] {
        [Region::Phx, Region::La]
    }

    /// The opposite region.
    pub fn other(self) -> Region {
        match self {
            Region::Phx => Region::La,
            Region::La => Region::Phx,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Region::Phx => "PHX",
            Region::La => "LA",
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Region {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PHX" => Ok(Region::Phx),
            "LA" => Ok(Region::La),
            other => Err(FleetError::Validation(format!("unknown region: {other}"))),
        }
    }
}

/// Lifecycle status of a ride.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RideStatus {
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "IN_PROGRESS")]
    InProgress,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

/// Handoff progress marker stamped on a ride while it is (or was) part of a
/// cross-region transaction. `Completed` marks a ride that arrived in its
/// new region through a committed handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandoffStatus {
    #[serde(rename = "PREPARING")]
    Preparing,
    #[serde(rename = "PREPARED")]
    Prepared,
    #[serde(rename = "COMMITTED")]
    Committed,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "ABORTED")]
    Aborted,
}

/// A geographic point in WGS-84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn validate(&self, field: &str) -> Result<()> {
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err(FleetError::Validation(format!(
                "{field}.lat {} out of range [-90, 90]",
                self.lat
            )));
        }
        if !(-180.0..=180.0).contains(&self.lon) {
            return Err(FleetError::Validation(format!(
                "{field}.lon {} out of range [-180, 180]",
                self.lon
            )));
        }
        Ok(())
    }
}

/// A ride document as persisted in a regional store.
///
/// The three transaction fields (`handoff_status`, `locked`,
/// `transaction_id`) are owned by the 2PC participant logic; they are null /
/// false on any ride not currently part of a handoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ride {
    /// Store-assigned document key. Absent on documents not yet persisted.
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "rideId")]
    pub ride_id: String,
    #[serde(rename = "vehicleId")]
    pub vehicle_id: String,
    #[serde(rename = "customerId")]
    pub customer_id: String,
    pub status: RideStatus,
    pub city: Region,
    pub fare: f64,
    #[serde(rename = "startLocation")]
    pub start_location: GeoPoint,
    #[serde(rename = "currentLocation")]
    pub current_location: GeoPoint,
    #[serde(rename = "endLocation")]
    pub end_location: GeoPoint,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub handoff_status: Option<HandoffStatus>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub transaction_id: Option<String>,
}

impl Ride {
    /// Whether the ride is currently claimed by an in-flight handoff.
    pub fn is_in_handoff(&self) -> bool {
        self.locked && self.transaction_id.is_some()
    }
}

/// Request body for `POST /rides`. The server owns the transaction fields,
/// so the payload never carries them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideCreate {
    #[serde(rename = "rideId")]
    pub ride_id: String,
    #[serde(rename = "vehicleId")]
    pub vehicle_id: String,
    #[serde(rename = "customerId")]
    pub customer_id: String,
    pub status: RideStatus,
    pub city: Region,
    pub fare: f64,
    #[serde(rename = "startLocation")]
    pub start_location: GeoPoint,
    #[serde(rename = "currentLocation")]
    pub current_location: GeoPoint,
    #[serde(rename = "endLocation")]
    pub end_location: GeoPoint,
    /// Defaults to the server clock when absent.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl RideCreate {
    pub fn validate(&self) -> Result<()> {
        validate_ride_id(&self.ride_id)?;
        validate_vehicle_id(&self.vehicle_id)?;
        validate_customer_id(&self.customer_id)?;
        validate_fare(self.fare)?;
        self.start_location.validate("startLocation")?;
        self.current_location.validate("currentLocation")?;
        self.end_location.validate("endLocation")?;
        Ok(())
    }

    /// Materialize a full ride document with server-set defaults.
    pub fn into_ride(self, now: DateTime<Utc>) -> Ride {
        Ride {
            id: None,
            ride_id: self.ride_id,
            vehicle_id: self.vehicle_id,
            customer_id: self.customer_id,
            status: self.status,
            city: self.city,
            fare: round_fare(self.fare),
            start_location: self.start_location,
            current_location: self.current_location,
            end_location: self.end_location,
            timestamp: self.timestamp.unwrap_or(now),
            handoff_status: None,
            locked: false,
            transaction_id: None,
        }
    }
}

/// Request body for `PUT /rides/{id}`. Every field optional; an empty body
/// is rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RideUpdate {
    #[serde(default)]
    pub status: Option<RideStatus>,
    #[serde(default)]
    pub fare: Option<f64>,
    #[serde(default, rename = "currentLocation")]
    pub current_location: Option<GeoPoint>,
    #[serde(default, rename = "endLocation")]
    pub end_location: Option<GeoPoint>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl RideUpdate {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.fare.is_none()
            && self.current_location.is_none()
            && self.end_location.is_none()
            && self.timestamp.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(FleetError::Validation("update body is empty".into()));
        }
        if let Some(fare) = self.fare {
            validate_fare(fare)?;
        }
        if let Some(loc) = &self.current_location {
            loc.validate("currentLocation")?;
        }
        if let Some(loc) = &self.end_location {
            loc.validate("endLocation")?;
        }
        Ok(())
    }
}

/// Aggregated counters for one region, served by `GET /stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionalStats {
    pub region: Region,
    pub total_rides: u64,
    pub active_rides: u64,
    pub completed_rides: u64,
    pub cancelled_rides: u64,
    pub total_revenue: f64,
    pub avg_fare: f64,
}

/// Probe state reported by `GET /health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    #[serde(rename = "healthy")]
    Healthy,
    #[serde(rename = "degraded")]
    Degraded,
    #[serde(rename = "unhealthy")]
    Unhealthy,
}

/// Wire form of a participant health probe. Field names are part of the
/// external contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthState,
    pub region: Region,
    pub mongodb_primary: String,
    pub mongodb_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication_lag_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_write: Option<DateTime<Utc>>,
    pub uptime_seconds: u64,
}

pub fn validate_ride_id(id: &str) -> Result<()> {
    if RIDE_ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(FleetError::Validation(format!(
            "rideId {id:?} does not match R-<digits>"
        )))
    }
}

pub fn validate_vehicle_id(id: &str) -> Result<()> {
    if VEHICLE_ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(FleetError::Validation(format!(
            "vehicleId {id:?} does not match AV-<digits>"
        )))
    }
}

pub fn validate_customer_id(id: &str) -> Result<()> {
    if CUSTOMER_ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(FleetError::Validation(format!(
            "customerId {id:?} does not match C-<digits>"
        )))
    }
}

/// Fare is accepted at exactly zero, or between the chargeable floor and the
/// cap, inclusive.
pub fn validate_fare(fare: f64) -> Result<()> {
    if fare == 0.0 {
        return Ok(());
    }
    if fare < MIN_CHARGEABLE_FARE {
        return Err(FleetError::Validation(format!(
            "fare {fare} below minimum {MIN_CHARGEABLE_FARE:.2}"
        )));
    }
    if fare > MAX_FARE {
        return Err(FleetError::Validation(format!(
            "fare {fare} above maximum {MAX_FARE}"
        )));
    }
    Ok(())
}

/// Round a fare to two decimal places.
pub fn round_fare(fare: f64) -> f64 {
    (fare * 100.0).round() / 100.0
}
