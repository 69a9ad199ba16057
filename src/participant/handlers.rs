// # Regional Participant HTTP Surface
//
// Router and handlers for the per-region server: ride CRUD, stats, health,
// and the 2PC participant endpoints.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;

use crate::api::{ApiError, ApiResult};
use crate::error::FleetError;
use crate::model::protocol::{
    AbortRequest, AbortResponse, CommitRequest, CommitResponse, PendingPrepare, PrepareRequest,
    PrepareResponse,
};
use crate::model::query::ListRidesParams;
use crate::model::{HealthResponse, RegionalStats, Ride, RideCreate, RideUpdate};

use super::RegionalParticipant;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the participant router with its middleware stack.
pub fn router(participant: Arc<RegionalParticipant>) -> Router {
    Router::new()
        .route("/rides", post(create_ride).get(list_rides))
        .route("/rides/{id}", get(get_ride))
        .route("/rides/{id}", put(update_ride))
        .route("/rides/{id}", delete(delete_ride))
        .route("/stats", get(get_stats))
        .route("/health", get(get_health))
        .route("/2pc/prepare", post(twopc_prepare))
        .route("/2pc/commit", post(twopc_commit))
        .route("/2pc/abort", post(twopc_abort))
        .route("/2pc/pending", get(twopc_pending))
        .with_state(participant)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(
            CorsLayer::new()
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
                .allow_headers(Any)
                .allow_origin(Any),
        )
}

/// Bind and serve the participant API.
pub async fn serve(participant: Arc<RegionalParticipant>, addr: &str) -> crate::error::Result<()> {
    let region = participant.region();
    let app = router(participant);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| FleetError::Transport(format!("failed to bind {addr}: {e}")))?;
    info!(%region, %addr, "regional participant listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| FleetError::Transport(format!("participant server error: {e}")))
}

async fn create_ride(
    State(participant): State<Arc<RegionalParticipant>>,
    Json(payload): Json<RideCreate>,
) -> ApiResult<(StatusCode, Json<Ride>)> {
    let ride = participant.create_ride(payload).await?;
    Ok((StatusCode::CREATED, Json(ride)))
}

async fn get_ride(
    State(participant): State<Arc<RegionalParticipant>>,
    Path(ride_id): Path<String>,
) -> ApiResult<Json<Ride>> {
    Ok(Json(participant.get_ride(&ride_id).await?))
}

async fn list_rides(
    State(participant): State<Arc<RegionalParticipant>>,
    Query(params): Query<ListRidesParams>,
) -> ApiResult<Json<Vec<Ride>>> {
    Ok(Json(participant.list_rides(&params).await?))
}

async fn update_ride(
    State(participant): State<Arc<RegionalParticipant>>,
    Path(ride_id): Path<String>,
    Json(update): Json<RideUpdate>,
) -> ApiResult<Json<Ride>> {
    if update.is_empty() {
        return Err(ApiError::bad_request("update body is empty"));
    }
    Ok(Json(participant.update_ride(&ride_id, update).await?))
}

async fn delete_ride(
    State(participant): State<Arc<RegionalParticipant>>,
    Path(ride_id): Path<String>,
) -> ApiResult<StatusCode> {
    participant.delete_ride(&ride_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_stats(
    State(participant): State<Arc<RegionalParticipant>>,
) -> ApiResult<Json<RegionalStats>> {
    Ok(Json(participant.stats().await?))
}

async fn get_health(
    State(participant): State<Arc<RegionalParticipant>>,
) -> ApiResult<Json<HealthResponse>> {
    Ok(Json(participant.health().await?))
}

async fn twopc_prepare(
    State(participant): State<Arc<RegionalParticipant>>,
    Json(req): Json<PrepareRequest>,
) -> ApiResult<Json<PrepareResponse>> {
    Ok(Json(participant.prepare(&req).await?))
}

async fn twopc_commit(
    State(participant): State<Arc<RegionalParticipant>>,
    Json(req): Json<CommitRequest>,
) -> ApiResult<Json<CommitResponse>> {
    Ok(Json(participant.commit(&req).await?))
}

async fn twopc_abort(
    State(participant): State<Arc<RegionalParticipant>>,
    Json(req): Json<AbortRequest>,
) -> ApiResult<Json<AbortResponse>> {
    Ok(Json(participant.abort(&req).await?))
}

#[derive(Debug, Deserialize)]
struct PendingParams {
    #[serde(default)]
    older_than_seconds: u64,
}

async fn twopc_pending(
    State(participant): State<Arc<RegionalParticipant>>,
    Query(params): Query<PendingParams>,
) -> ApiResult<Json<Vec<PendingPrepare>>> {
    let pending = participant.pending_prepares(Duration::from_secs(params.older_than_seconds))?;
    Ok(Json(pending))
}
