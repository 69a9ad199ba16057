// # Handoff Coordinator
//
// Drives the two-phase migration of one ride between regions: admission
// gate, transaction-log bookkeeping, sequential prepares, parallel commits,
// and rollback. Once the log reaches PREPARED the transaction is
// forward-only; commit-phase failures are left to the recovery scanner.

use std::sync::Arc;
use std::time::Instant;

use tokio::join;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::model::protocol::{
    AbortRequest, CommitRequest, HandoffRequest, HandoffResponse, HandoffStatusWire,
    PrepareRequest, TwoPcOperation, Vote,
};
use crate::model::{validate_ride_id, HandoffStatus, Region, Ride};
use crate::txlog::TransactionLog;

use super::client::ParticipantClient;
use super::health::HealthView;

pub struct HandoffCoordinator {
    client: Arc<ParticipantClient>,
    txlog: Arc<TransactionLog>,
    health: HealthView,
}

impl HandoffCoordinator {
    pub fn new(
        client: Arc<ParticipantClient>,
        txlog: Arc<TransactionLog>,
        health: HealthView,
    ) -> Self {
        Self { client, txlog, health }
    }

    /// Execute one handoff to a terminal outcome. The caller always gets a
    /// transaction id and one of SUCCESS, ABORTED, or BUFFERED.
    pub async fn handoff(&self, req: &HandoffRequest) -> Result<HandoffResponse> {
        validate_ride_id(&req.ride_id)?;
        if req.source == req.target {
            return Err(FleetError::Validation(format!(
                "source and target are both {}",
                req.source
            )));
        }

        let tx_id = Uuid::new_v4().to_string();

        // Admission: an unreachable target means no durable work at all.
        // The buffered response is not retried here; the caller re-submits
        // when the target recovers.
        if !self.health.is_healthy(req.target) {
            info!(
                %tx_id,
                ride_id = %req.ride_id,
                target = %req.target,
                "handoff buffered: target unhealthy"
            );
            return Ok(HandoffResponse {
                status: HandoffStatusWire::Buffered,
                tx_id,
                reason: Some(format!(
                    "Target region {} is currently unavailable",
                    req.target
                )),
                latency_ms: 0,
            });
        }

        let started = Instant::now();
        self.txlog
            .begin(&tx_id, &req.ride_id, req.source, req.target)?;
        info!(%tx_id, ride_id = %req.ride_id, source = %req.source, target = %req.target, "handoff started");

        match self.run_phases(&tx_id, req, started).await {
            Ok(response) => Ok(response),
            Err(e) => {
                // Any coordinator-side failure before PREPARED rolls back.
                error!(%tx_id, error = %e, "handoff failed; rolling back");
                let note = format!("handoff failed: {e}");
                self.rollback(&tx_id, req.source, req.target, &note).await;
                Ok(self.aborted(tx_id, note, started))
            }
        }
    }

    async fn run_phases(
        &self,
        tx_id: &str,
        req: &HandoffRequest,
        started: Instant,
    ) -> Result<HandoffResponse> {
        // Phase 1a: source votes by locking and snapshotting the ride.
        let prepare_src = PrepareRequest {
            ride_id: req.ride_id.clone(),
            tx_id: tx_id.to_owned(),
            operation: TwoPcOperation::Delete,
            ride_data: None,
        };
        let src_response = match self.client.prepare(req.source, &prepare_src).await {
            Ok(response) => response,
            Err(e) => {
                let note = format!("prepare failed in {}: {e}", req.source);
                self.rollback(tx_id, req.source, req.target, &note).await;
                return Ok(self.aborted(tx_id.to_owned(), note, started));
            }
        };

        if src_response.vote == Vote::Abort {
            // The source declined cleanly; there is nothing to undo at the
            // target and nothing locked at the source.
            let note = src_response
                .reason
                .unwrap_or_else(|| format!("{} voted ABORT", req.source));
            self.mark_aborted(tx_id, &note);
            return Ok(self.aborted(tx_id.to_owned(), note, started));
        }

        let snapshot = src_response.ride_data.ok_or_else(|| {
            FleetError::Internal(format!("{} voted COMMIT without a snapshot", req.source))
        })?;

        // Phase 1b: target records its intent to insert.
        let prepare_tgt = PrepareRequest {
            ride_id: req.ride_id.clone(),
            tx_id: tx_id.to_owned(),
            operation: TwoPcOperation::Insert,
            ride_data: Some(snapshot.clone()),
        };
        match self.client.prepare(req.target, &prepare_tgt).await {
            Ok(response) if response.vote == Vote::Commit => {}
            Ok(response) => {
                let note = response
                    .reason
                    .unwrap_or_else(|| format!("{} voted ABORT", req.target));
                self.rollback(tx_id, req.source, req.target, &note).await;
                return Ok(self.aborted(tx_id.to_owned(), note, started));
            }
            Err(e) => {
                let note = format!("prepare failed in {}: {e}", req.target);
                self.rollback(tx_id, req.source, req.target, &note).await;
                return Ok(self.aborted(tx_id.to_owned(), note, started));
            }
        }

        // Commit point. From here the transaction only moves forward.
        self.txlog
            .mark_prepared(tx_id, "Source locked and target prepared")?;

        // Phase 2: both commits in parallel, each tolerant to individual
        // failure.
        let commit_src = CommitRequest {
            ride_id: req.ride_id.clone(),
            tx_id: tx_id.to_owned(),
            operation: TwoPcOperation::Delete,
            ride_data: None,
        };
        let commit_tgt = CommitRequest {
            ride_id: req.ride_id.clone(),
            tx_id: tx_id.to_owned(),
            operation: TwoPcOperation::Insert,
            ride_data: Some(finalize_for_target(snapshot, req.target)),
        };
        let (src_commit, tgt_commit) = join!(
            self.client.commit(req.source, &commit_src),
            self.client.commit(req.target, &commit_tgt),
        );

        let latency_ms = started.elapsed().as_millis() as u64;
        let mut incomplete = Vec::new();
        if let Err(e) = &src_commit {
            warn!(%tx_id, region = %req.source, error = %e, "commit delivery failed");
            incomplete.push(req.source);
        }
        if let Err(e) = &tgt_commit {
            warn!(%tx_id, region = %req.target, error = %e, "commit delivery failed");
            incomplete.push(req.target);
        }

        if incomplete.is_empty() {
            self.txlog
                .mark_committed(tx_id, "Commit completed in both regions", latency_ms)?;
            info!(%tx_id, ride_id = %req.ride_id, latency_ms, "handoff committed");
        } else {
            // Leave the record PREPARED so the recovery scanner replays the
            // commit; the outcome is already decided.
            let regions: Vec<String> = incomplete.iter().map(|r| r.to_string()).collect();
            self.annotate(
                tx_id,
                &format!("commit not yet applied in {}; recovery will replay", regions.join(", ")),
            );
        }

        Ok(HandoffResponse {
            status: HandoffStatusWire::Success,
            tx_id: tx_id.to_owned(),
            reason: None,
            latency_ms,
        })
    }

    /// Abort fan-out to both participants plus the terminal log write.
    /// Participant aborts are idempotent, so failures here only cost a
    /// recovery pass later.
    async fn rollback(&self, tx_id: &str, source: Region, target: Region, note: &str) {
        let req = AbortRequest { tx_id: tx_id.to_owned() };
        let (src, tgt) = join!(self.client.abort(source, &req), self.client.abort(target, &req));
        if let Err(e) = src {
            warn!(%tx_id, region = %source, error = %e, "abort delivery failed");
        }
        if let Err(e) = tgt {
            warn!(%tx_id, region = %target, error = %e, "abort delivery failed");
        }
        self.mark_aborted(tx_id, note);
    }

    fn mark_aborted(&self, tx_id: &str, note: &str) {
        if let Err(e) = self.txlog.mark_aborted(tx_id, note) {
            error!(%tx_id, error = %e, "failed to record abort");
        }
    }

    fn annotate(&self, tx_id: &str, note: &str) {
        if let Err(e) = self.txlog.annotate(tx_id, note) {
            error!(%tx_id, error = %e, "failed to annotate transaction");
        }
    }

    fn aborted(&self, tx_id: String, reason: String, started: Instant) -> HandoffResponse {
        HandoffResponse {
            status: HandoffStatusWire::Aborted,
            tx_id,
            reason: Some(reason),
            latency_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// The committed form of a migrated ride: owned by the target, unlocked,
/// with a fresh store key.
pub(crate) fn finalize_for_target(mut snapshot: Ride, target: Region) -> Ride {
    snapshot.id = None;
    snapshot.city = target;
    snapshot.handoff_status = Some(HandoffStatus::Completed);
    snapshot.locked = false;
    snapshot.transaction_id = None;
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GeoPoint, RideStatus};
    use chrono::Utc;

    fn snapshot() -> Ride {
        Ride {
            id: Some("doc-1".into()),
            ride_id: "R-1".into(),
            vehicle_id: "AV-1".into(),
            customer_id: "C-1".into(),
            status: RideStatus::InProgress,
            city: Region::Phx,
            fare: 10.0,
            start_location: GeoPoint { lat: 33.0, lon: -112.0 },
            current_location: GeoPoint { lat: 33.5, lon: -114.0 },
            end_location: GeoPoint { lat: 34.0, lon: -118.0 },
            timestamp: Utc::now(),
            handoff_status: Some(HandoffStatus::Preparing),
            locked: true,
            transaction_id: Some("tx-1".into()),
        }
    }

    #[test]
    fn test_finalize_reassigns_ownership() {
        let finalized = finalize_for_target(snapshot(), Region::La);
        assert_eq!(finalized.city, Region::La);
        assert_eq!(finalized.handoff_status, Some(HandoffStatus::Completed));
        assert!(!finalized.locked);
        assert!(finalized.transaction_id.is_none());
        assert!(finalized.id.is_none());
    }
}
