// # Regional Store Adapter
//
// The seam between the coordination plane and a region's document store:
// a typed filter language, atomic conditional mutations, aggregation, and a
// restartable change subscription. The embedded engine behind the seam lives
// in `memory`; handles are resolved from `mem://` URIs through `registry`.

pub mod changes;
pub mod memory;
pub mod registry;
pub mod rides;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::Result;
use crate::model::query::{ListRidesParams, RideQuery};
use crate::model::{HandoffStatus, Region, Ride, RideStatus};

pub use changes::{ChangeEvent, ChangeOp, ChangeSubscription, ResumeToken};
pub use memory::{DocFilter, MemoryEngine, Predicate, SortOrder, StoreHealth};
pub use rides::RideStore;

/// Scan ordering. The adapter's default matches the read paths: newest
/// rides first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RideSort {
    #[default]
    TimestampDesc,
    TimestampAsc,
    Unsorted,
}

/// Typed predicate over ride documents, translated to an engine filter.
#[derive(Debug, Clone, Default)]
pub struct RideFilter {
    pub ride_id: Option<String>,
    pub city: Option<Region>,
    pub status: Option<RideStatus>,
    pub min_fare: Option<f64>,
    pub max_fare: Option<f64>,
    pub locked: Option<bool>,
    /// `Some(Some(tx))` matches that transaction; `Some(None)` matches
    /// rides with no transaction.
    pub transaction_id: Option<Option<String>>,
}

impl RideFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_ride_id(ride_id: impl Into<String>) -> Self {
        Self { ride_id: Some(ride_id.into()), ..Self::default() }
    }

    pub fn with_locked(mut self, locked: bool) -> Self {
        self.locked = Some(locked);
        self
    }

    pub fn with_transaction_id(mut self, tx_id: impl Into<String>) -> Self {
        self.transaction_id = Some(Some(tx_id.into()));
        self
    }

    pub fn from_list_params(params: &ListRidesParams) -> Self {
        Self {
            ride_id: None,
            city: params.city,
            status: params.status,
            min_fare: params.min_fare,
            max_fare: params.max_fare,
            locked: None,
            transaction_id: None,
        }
    }

    pub fn from_query(query: &RideQuery) -> Self {
        Self {
            ride_id: None,
            city: query.city,
            status: query.status,
            min_fare: query.min_fare,
            max_fare: query.max_fare,
            locked: None,
            transaction_id: None,
        }
    }

    pub fn to_doc_filter(&self) -> DocFilter {
        let mut filter = DocFilter::new();
        if let Some(ride_id) = &self.ride_id {
            filter = filter.eq("rideId", json!(ride_id));
        }
        if let Some(city) = self.city {
            filter = filter.eq("city", json!(city));
        }
        if let Some(status) = self.status {
            filter = filter.eq("status", json!(status));
        }
        if let Some(min) = self.min_fare {
            filter = filter.field("fare", Predicate::Gte(json!(min)));
        }
        if let Some(max) = self.max_fare {
            filter = filter.field("fare", Predicate::Lte(json!(max)));
        }
        if let Some(locked) = self.locked {
            filter = filter.eq("locked", json!(locked));
        }
        if let Some(tx) = &self.transaction_id {
            filter = filter.eq(
                "transaction_id",
                tx.as_ref().map(|t| json!(t)).unwrap_or(Value::Null),
            );
        }
        filter
    }
}

/// Field assignments for conditional updates, with helpers for the handoff
/// lock lifecycle.
#[derive(Debug, Clone, Default)]
pub struct FieldUpdates {
    map: Map<String, Value>,
}

impl FieldUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.map.insert(field.into(), value);
        self
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.map
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Claim a ride for a transaction: `locked`, `transaction_id`, and
    /// `handoff_status = PREPARING` in one atomic write.
    pub fn lock_for(tx_id: &str) -> Self {
        Self::new()
            .set("locked", json!(true))
            .set("transaction_id", json!(tx_id))
            .set("handoff_status", json!(HandoffStatus::Preparing))
    }

    /// Release a ride from a transaction, clearing all three fields.
    pub fn clear_handoff() -> Self {
        Self::new()
            .set("locked", json!(false))
            .set("transaction_id", Value::Null)
            .set("handoff_status", Value::Null)
    }
}

/// Aggregated counters produced by `aggregate_stats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub total: u64,
    pub completed: u64,
    pub in_progress: u64,
    pub cancelled: u64,
    pub total_fare: f64,
    pub avg_fare: f64,
}

/// Adapter over one region's ride collection.
///
/// Operations are durable once they return; concurrent adapters over the
/// same underlying store are safe. Implementations hold no in-process
/// mutable state beyond the store handle itself.
#[async_trait]
pub trait RegionalStore: Send + Sync {
    async fn find_one(&self, filter: &RideFilter) -> Result<Option<Ride>>;

    async fn find_many(
        &self,
        filter: &RideFilter,
        skip: usize,
        limit: Option<usize>,
        sort: RideSort,
    ) -> Result<Vec<Ride>>;

    /// Fails with `Conflict` when the `rideId` is already present.
    async fn insert(&self, ride: &Ride) -> Result<String>;

    /// Atomically set fields on every matching ride; returns matched count.
    async fn conditional_update(&self, filter: &RideFilter, set: &FieldUpdates) -> Result<u64>;

    /// Atomic read-modify-write of the first matching ride.
    async fn find_and_update(
        &self,
        filter: &RideFilter,
        set: &FieldUpdates,
        return_after: bool,
    ) -> Result<Option<Ride>>;

    async fn delete_one(&self, filter: &RideFilter) -> Result<u64>;

    async fn delete_many(&self, filter: &RideFilter) -> Result<u64>;

    /// Insert a raw document preserving its `_id` (replication path).
    async fn insert_raw(&self, document: Value) -> Result<String>;

    /// Replace the document with the given key, inserting when `upsert`.
    async fn replace_by_key(&self, key: &str, document: Value, upsert: bool) -> Result<()>;

    async fn delete_by_key(&self, key: &str) -> Result<u64>;

    async fn aggregate_stats(&self) -> Result<StoreStats>;

    /// Open a restartable change subscription with after-image lookup.
    async fn subscribe_changes(&self, resume_after: Option<ResumeToken>)
        -> Result<ChangeSubscription>;

    async fn health(&self) -> Result<StoreHealth>;

    fn uptime_seconds(&self) -> u64;
}
