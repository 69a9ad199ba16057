// Query surface types: list-endpoint parameters and the routed search
// request with its three consistency scopes.

use serde::{Deserialize, Serialize};

use super::{Region, RideStatus};
use crate::error::{FleetError, Result};

/// Hard cap on routed query fan-out results.
pub const MAX_QUERY_LIMIT: usize = 100;

fn default_limit() -> usize {
    10
}

/// Consistency scope of a routed read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryScope {
    /// One region's live view. Requires `city`.
    #[serde(rename = "local")]
    Local,
    /// The GLOBAL replica; eventually consistent, bounded by replication lag.
    #[serde(rename = "global-fast")]
    GlobalFast,
    /// Scatter-gather across every region, merged by timestamp.
    #[serde(rename = "global-live")]
    GlobalLive,
}

/// Body of `POST /rides/search` on the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideQuery {
    #[serde(default)]
    pub city: Option<Region>,
    #[serde(default)]
    pub status: Option<RideStatus>,
    #[serde(default)]
    pub min_fare: Option<f64>,
    #[serde(default)]
    pub max_fare: Option<f64>,
    pub scope: QueryScope,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

impl RideQuery {
    pub fn validate(&self) -> Result<()> {
        if self.limit < 1 || self.limit > MAX_QUERY_LIMIT {
            return Err(FleetError::Validation(format!(
                "limit {} out of range [1, {MAX_QUERY_LIMIT}]",
                self.limit
            )));
        }
        if self.scope == QueryScope::Local && self.city.is_none() {
            return Err(FleetError::Validation(
                "scope \"local\" requires a city".into(),
            ));
        }
        if let (Some(min), Some(max)) = (self.min_fare, self.max_fare) {
            if min > max {
                return Err(FleetError::Validation(format!(
                    "min_fare {min} exceeds max_fare {max}"
                )));
            }
        }
        Ok(())
    }
}

/// Query-string parameters of `GET /rides` on a regional participant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListRidesParams {
    #[serde(default)]
    pub city: Option<Region>,
    #[serde(default)]
    pub status: Option<RideStatus>,
    #[serde(default)]
    pub min_fare: Option<f64>,
    #[serde(default)]
    pub max_fare: Option<f64>,
    #[serde(default)]
    pub skip: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}
