// # Coordinator HTTP Surface
//
// Router and handlers for the coordinator server: handoffs, routed reads,
// fleet-wide stats and health, transaction history, and ride location.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::Method,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;

use crate::api::{ApiError, ApiResult};
use crate::error::FleetError;
use crate::model::protocol::{HandoffRequest, HandoffResponse, LocateResponse};
use crate::model::query::RideQuery;
use crate::model::{RegionalStats, Ride};
use crate::txlog::TxRecord;

use super::Coordinator;

/// The handoff path budget already sums the participant deadlines; this
/// outer timeout only bounds pathological cases.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_BODY_BYTES: usize = 1024 * 1024;

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/handoff", post(post_handoff))
        .route("/rides/search", post(search_rides))
        .route("/rides/{id}/locate", get(locate_ride))
        .route("/stats/all", get(stats_all))
        .route("/health/all", get(health_all))
        .route("/transactions/history", get(transaction_history))
        .route("/transactions/{tx_id}", get(get_transaction))
        .with_state(coordinator)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(
            CorsLayer::new()
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(Any)
                .allow_origin(Any),
        )
}

pub async fn serve(coordinator: Arc<Coordinator>, addr: &str) -> crate::error::Result<()> {
    let app = router(coordinator);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| FleetError::Transport(format!("failed to bind {addr}: {e}")))?;
    info!(%addr, "handoff coordinator listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| FleetError::Transport(format!("coordinator server error: {e}")))
}

async fn post_handoff(
    State(coordinator): State<Arc<Coordinator>>,
    Json(req): Json<HandoffRequest>,
) -> ApiResult<Json<HandoffResponse>> {
    // A dropped client connection must not cancel a transaction
    // mid-protocol: the run is detached and always reaches a terminal
    // state, leaving no locks behind.
    let run = tokio::spawn(async move { coordinator.handoff(&req).await });
    match run.await {
        Ok(outcome) => Ok(Json(outcome?)),
        Err(e) => Err(ApiError::new(
            "INTERNAL_ERROR",
            format!("handoff task failed: {e}"),
        )),
    }
}

async fn search_rides(
    State(coordinator): State<Arc<Coordinator>>,
    Json(query): Json<RideQuery>,
) -> ApiResult<Json<Vec<Ride>>> {
    match coordinator.search(&query).await {
        Ok(rides) => Ok(Json(rides)),
        // Malformed queries are the caller's mistake, not a payload
        // semantics problem.
        Err(FleetError::Validation(msg)) => Err(ApiError::bad_request(msg)),
        Err(e) => Err(e.into()),
    }
}

async fn locate_ride(
    State(coordinator): State<Arc<Coordinator>>,
    Path(ride_id): Path<String>,
) -> ApiResult<Json<LocateResponse>> {
    Ok(Json(coordinator.locate(&ride_id).await?))
}

async fn stats_all(
    State(coordinator): State<Arc<Coordinator>>,
) -> Json<HashMap<String, Option<RegionalStats>>> {
    Json(coordinator.stats_all().await)
}

async fn health_all(
    State(coordinator): State<Arc<Coordinator>>,
) -> Json<HashMap<String, Value>> {
    Json(coordinator.health_all().await)
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    50
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    total: usize,
    transactions: Vec<TxRecord>,
}

async fn transaction_history(
    State(coordinator): State<Arc<Coordinator>>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Json<HistoryResponse>> {
    let (total, transactions) = coordinator.history(params.limit)?;
    Ok(Json(HistoryResponse { total, transactions }))
}

async fn get_transaction(
    State(coordinator): State<Arc<Coordinator>>,
    Path(tx_id): Path<String>,
) -> ApiResult<Json<TxRecord>> {
    match coordinator.transaction(&tx_id)? {
        Some(record) => Ok(Json(record)),
        None => Err(ApiError::not_found(format!("transaction {tx_id}"))),
    }
}
