// The ride-collection adapter: typed CRUD, conditional mutations, and
// aggregation over an engine's `rides` collection.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{FleetError, Result};
use crate::model::{Ride, RideStatus};

use super::changes::{ChangeSubscription, ResumeToken};
use super::memory::{Collection, DocFilter, MemoryEngine, SortOrder, StoreHealth};
use super::{FieldUpdates, RegionalStore, RideFilter, RideSort, StoreStats};

const RIDES_COLLECTION: &str = "rides";

/// `RegionalStore` over the embedded engine.
pub struct RideStore {
    engine: Arc<MemoryEngine>,
    collection: Arc<Collection>,
}

impl RideStore {
    /// A regional store: `rideId` is unique within the region.
    pub fn regional(engine: Arc<MemoryEngine>) -> Self {
        let collection = engine.collection(RIDES_COLLECTION, Some("rideId"));
        Self { engine, collection }
    }

    /// The GLOBAL replica: documents keyed by their source `_id` only, so
    /// the transient handoff window (and historical duplicates) cannot be
    /// rejected by an index.
    pub fn global(engine: Arc<MemoryEngine>) -> Self {
        let collection = engine.collection(RIDES_COLLECTION, None);
        Self { engine, collection }
    }

    fn decode(doc: Value) -> Result<Ride> {
        serde_json::from_value(doc)
            .map_err(|e| FleetError::Store(format!("malformed ride document: {e}")))
    }

    fn encode(ride: &Ride) -> Result<Value> {
        Ok(serde_json::to_value(ride)?)
    }

    fn sort_spec(sort: RideSort) -> Option<(&'static str, SortOrder)> {
        match sort {
            RideSort::TimestampDesc => Some(("timestamp", SortOrder::Descending)),
            RideSort::TimestampAsc => Some(("timestamp", SortOrder::Ascending)),
            RideSort::Unsorted => None,
        }
    }
}

#[async_trait]
impl RegionalStore for RideStore {
    async fn find_one(&self, filter: &RideFilter) -> Result<Option<Ride>> {
        match self.collection.find_one(&filter.to_doc_filter()) {
            Some(doc) => Ok(Some(Self::decode(doc)?)),
            None => Ok(None),
        }
    }

    async fn find_many(
        &self,
        filter: &RideFilter,
        skip: usize,
        limit: Option<usize>,
        sort: RideSort,
    ) -> Result<Vec<Ride>> {
        self.collection
            .find_many(&filter.to_doc_filter(), skip, limit, Self::sort_spec(sort))
            .into_iter()
            .map(Self::decode)
            .collect()
    }

    async fn insert(&self, ride: &Ride) -> Result<String> {
        self.collection.insert(Self::encode(ride)?)
    }

    async fn conditional_update(&self, filter: &RideFilter, set: &FieldUpdates) -> Result<u64> {
        Ok(self
            .collection
            .update_many(&filter.to_doc_filter(), set.as_map()) as u64)
    }

    async fn find_and_update(
        &self,
        filter: &RideFilter,
        set: &FieldUpdates,
        return_after: bool,
    ) -> Result<Option<Ride>> {
        match self
            .collection
            .find_one_and_update(&filter.to_doc_filter(), set.as_map(), return_after)
        {
            Some(doc) => Ok(Some(Self::decode(doc)?)),
            None => Ok(None),
        }
    }

    async fn delete_one(&self, filter: &RideFilter) -> Result<u64> {
        Ok(self.collection.delete_one(&filter.to_doc_filter()) as u64)
    }

    async fn delete_many(&self, filter: &RideFilter) -> Result<u64> {
        Ok(self.collection.delete_many(&filter.to_doc_filter()) as u64)
    }

    async fn insert_raw(&self, document: Value) -> Result<String> {
        self.collection.insert(document)
    }

    async fn replace_by_key(&self, key: &str, document: Value, upsert: bool) -> Result<()> {
        self.collection.replace_by_id(key, document, upsert)?;
        Ok(())
    }

    async fn delete_by_key(&self, key: &str) -> Result<u64> {
        Ok(self
            .collection
            .delete_one(&DocFilter::new().eq("_id", Value::String(key.to_owned())))
            as u64)
    }

    async fn aggregate_stats(&self) -> Result<StoreStats> {
        let docs = self
            .collection
            .find_many(&DocFilter::new(), 0, None, None);

        let mut stats = StoreStats::default();
        for doc in &docs {
            stats.total += 1;
            match doc.get("status").and_then(Value::as_str) {
                Some(s) if s == status_str(RideStatus::Completed) => stats.completed += 1,
                Some(s) if s == status_str(RideStatus::InProgress) => stats.in_progress += 1,
                Some(s) if s == status_str(RideStatus::Cancelled) => stats.cancelled += 1,
                _ => {}
            }
            stats.total_fare += doc.get("fare").and_then(Value::as_f64).unwrap_or(0.0);
        }
        if stats.total > 0 {
            stats.avg_fare = stats.total_fare / stats.total as f64;
        }
        Ok(stats)
    }

    async fn subscribe_changes(
        &self,
        resume_after: Option<ResumeToken>,
    ) -> Result<ChangeSubscription> {
        Ok(self.collection.subscribe(resume_after))
    }

    async fn health(&self) -> Result<StoreHealth> {
        Ok(self.engine.health())
    }

    fn uptime_seconds(&self) -> u64 {
        self.engine.uptime_seconds()
    }
}

fn status_str(status: RideStatus) -> &'static str {
    match status {
        RideStatus::Completed => "COMPLETED",
        RideStatus::InProgress => "IN_PROGRESS",
        RideStatus::Cancelled => "CANCELLED",
    }
}
