// # Participant Client
//
// The coordinator's HTTP client for talking to regional participants. Every
// call carries a bounded deadline; an expired deadline is reported the same
// way as any other transport failure.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::FleetConfig;
use crate::error::{FleetError, Result};
use crate::model::protocol::{
    AbortRequest, AbortResponse, CommitRequest, CommitResponse, PendingPrepare, PrepareRequest,
    PrepareResponse,
};
use crate::model::query::RideQuery;
use crate::model::{HealthResponse, Region, RegionalStats, Ride};

pub struct ParticipantClient {
    http: reqwest::Client,
    endpoints: HashMap<Region, String>,
    prepare_deadline: Duration,
    commit_deadline: Duration,
    request_deadline: Duration,
}

impl ParticipantClient {
    pub fn new(config: &FleetConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| FleetError::Configuration(format!("http client: {e}")))?;
        Ok(Self {
            http,
            endpoints: config.region_endpoints.clone(),
            prepare_deadline: config.prepare_deadline,
            commit_deadline: config.commit_deadline,
            request_deadline: Duration::from_secs(10),
        })
    }

    fn url(&self, region: Region, path: &str) -> Result<String> {
        let base = self.endpoints.get(&region).ok_or_else(|| {
            FleetError::Configuration(format!("no endpoint configured for region {region}"))
        })?;
        Ok(format!("{}{path}", base.trim_end_matches('/')))
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        region: Region,
        path: &str,
        body: &B,
        deadline: Duration,
    ) -> Result<T> {
        let url = self.url(region, path)?;
        let response = self
            .http
            .post(&url)
            .timeout(deadline)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FleetError::Transport(format!(
                "{region} returned {status} for {path}"
            )));
        }
        Ok(response.json().await?)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        region: Region,
        path: &str,
        query: &[(String, String)],
        deadline: Duration,
    ) -> Result<T> {
        let url = self.url(region, path)?;
        let response = self
            .http
            .get(&url)
            .query(query)
            .timeout(deadline)
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FleetError::NotFound(format!("{region}{path}")));
        }
        if !status.is_success() {
            return Err(FleetError::Transport(format!(
                "{region} returned {status} for {path}"
            )));
        }
        Ok(response.json().await?)
    }

    pub async fn prepare(&self, region: Region, req: &PrepareRequest) -> Result<PrepareResponse> {
        self.post_json(region, "/2pc/prepare", req, self.prepare_deadline)
            .await
    }

    pub async fn commit(&self, region: Region, req: &CommitRequest) -> Result<CommitResponse> {
        self.post_json(region, "/2pc/commit", req, self.commit_deadline)
            .await
    }

    pub async fn abort(&self, region: Region, req: &AbortRequest) -> Result<AbortResponse> {
        self.post_json(region, "/2pc/abort", req, self.commit_deadline)
            .await
    }

    /// `None` when the region does not hold the ride.
    pub async fn get_ride(&self, region: Region, ride_id: &str) -> Result<Option<Ride>> {
        match self
            .get_json(region, &format!("/rides/{ride_id}"), &[], self.request_deadline)
            .await
        {
            Ok(ride) => Ok(Some(ride)),
            Err(FleetError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Filtered ride listing for the scatter-gather read path.
    pub async fn list_rides(&self, region: Region, query: &RideQuery) -> Result<Vec<Ride>> {
        let mut params: Vec<(String, String)> = Vec::new();
        if let Some(city) = query.city {
            params.push(("city".into(), city.to_string()));
        }
        if let Some(status) = query.status {
            let status = serde_json::to_value(status)?;
            if let Some(s) = status.as_str() {
                params.push(("status".into(), s.to_owned()));
            }
        }
        if let Some(min) = query.min_fare {
            params.push(("min_fare".into(), min.to_string()));
        }
        if let Some(max) = query.max_fare {
            params.push(("max_fare".into(), max.to_string()));
        }
        params.push(("limit".into(), query.limit.to_string()));

        self.get_json(region, "/rides", &params, self.request_deadline)
            .await
    }

    pub async fn stats(&self, region: Region) -> Result<RegionalStats> {
        self.get_json(region, "/stats", &[], self.request_deadline)
            .await
    }

    /// Liveness probe with its own (short) deadline.
    pub async fn health(&self, region: Region, deadline: Duration) -> Result<HealthResponse> {
        self.get_json(region, "/health", &[], deadline).await
    }

    /// Prepared participant records older than the window, for recovery.
    pub async fn pending(&self, region: Region, older_than: Duration) -> Result<Vec<PendingPrepare>> {
        let params = vec![(
            "older_than_seconds".to_string(),
            older_than.as_secs().to_string(),
        )];
        self.get_json(region, "/2pc/pending", &params, self.request_deadline)
            .await
    }
}
