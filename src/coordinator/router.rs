// # Query Router
//
// Routed reads with three consistency scopes: one region's live view, the
// eventually-consistent GLOBAL replica, or a scatter-gather across every
// region merged by timestamp.

use std::sync::Arc;

use futures::future::join_all;
use tracing::warn;

use crate::error::{FleetError, Result};
use crate::model::query::{QueryScope, RideQuery};
use crate::model::{Region, Ride};
use crate::store::{RegionalStore, RideFilter, RideSort};

use super::client::ParticipantClient;

pub struct QueryRouter {
    client: Arc<ParticipantClient>,
    global_store: Arc<dyn RegionalStore>,
}

impl QueryRouter {
    pub fn new(client: Arc<ParticipantClient>, global_store: Arc<dyn RegionalStore>) -> Self {
        Self { client, global_store }
    }

    pub async fn search(&self, query: &RideQuery) -> Result<Vec<Ride>> {
        query.validate()?;
        match query.scope {
            QueryScope::Local => self.search_local(query).await,
            QueryScope::GlobalFast => self.search_global_fast(query).await,
            QueryScope::GlobalLive => Ok(self.search_global_live(query).await),
        }
    }

    /// Forward to the owning region and return its result verbatim.
    async fn search_local(&self, query: &RideQuery) -> Result<Vec<Ride>> {
        let city = query
            .city
            .ok_or_else(|| FleetError::Validation("scope \"local\" requires a city".into()))?;
        self.client.list_rides(city, query).await
    }

    /// Read the GLOBAL replica directly. Results may lag the regions by up
    /// to the replication delay.
    async fn search_global_fast(&self, query: &RideQuery) -> Result<Vec<Ride>> {
        self.global_store
            .find_many(
                &RideFilter::from_query(query),
                0,
                Some(query.limit),
                RideSort::TimestampDesc,
            )
            .await
    }

    /// Fan out to every region, take up to `limit` per region, then merge,
    /// sort newest-first, and truncate. Partial failures are logged and the
    /// available results returned.
    async fn search_global_live(&self, query: &RideQuery) -> Vec<Ride> {
        let fetches = Region::all().map(|region| {
            let client = self.client.clone();
            async move { (region, client.list_rides(region, query).await) }
        });

        let mut merged: Vec<Ride> = Vec::new();
        for (region, result) in join_all(fetches).await {
            match result {
                Ok(rides) => merged.extend(rides),
                Err(e) => {
                    warn!(%region, error = %e, "scatter-gather leg failed; returning partial results");
                }
            }
        }

        merged.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        merged.truncate(query.limit);
        merged
    }
}
