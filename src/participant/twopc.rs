// # 2PC Participant Protocol
//
// Prepare, commit, and abort under coordinator direction. Every committing
// or aborting store operation matches on both `rideId` and `transaction_id`
// so a retried commit or a late abort cannot touch an unrelated ride.
// Duplicate calls for the same `(ride_id, tx_id)` are answered identically.

use std::time::Duration;

use tracing::{info, warn};

use crate::error::{FleetError, Result};
use crate::model::protocol::{
    AbortRequest, AbortResponse, AbortStatus, CommitRequest, CommitResponse, CommitStatus,
    PendingPrepare, PrepareRequest, PrepareResponse, TwoPcOperation,
};
use crate::model::{HandoffStatus, Ride};
use crate::store::{FieldUpdates, RegionalStore, RideFilter};
use crate::txlog::ParticipantTxState;

use super::RegionalParticipant;

impl RegionalParticipant {
    /// Vote on a prepare request. Votes are responses, not errors; only a
    /// store failure surfaces as `Err`.
    pub async fn prepare(&self, req: &PrepareRequest) -> Result<PrepareResponse> {
        let response = match req.operation {
            TwoPcOperation::Delete => self.prepare_delete(req).await?,
            TwoPcOperation::Insert => self.prepare_insert(req).await?,
        };
        info!(
            region = %self.region,
            tx_id = %req.tx_id,
            ride_id = %req.ride_id,
            operation = ?req.operation,
            vote = ?response.vote,
            "prepare vote"
        );
        Ok(response)
    }

    /// Source-side prepare: claim the ride and snapshot it.
    async fn prepare_delete(&self, req: &PrepareRequest) -> Result<PrepareResponse> {
        let ride = match self
            .store
            .find_one(&RideFilter::by_ride_id(&req.ride_id))
            .await?
        {
            Some(ride) => ride,
            None => {
                return Ok(PrepareResponse::abort(format!(
                    "ride {} not found in {}",
                    req.ride_id, self.region
                )));
            }
        };

        if ride.locked {
            // A duplicate prepare for the ride we already hold re-votes
            // COMMIT with the recorded snapshot.
            if ride.transaction_id.as_deref() == Some(req.tx_id.as_str()) {
                let snapshot = self
                    .participant_log
                    .get(&req.tx_id)?
                    .and_then(|record| record.ride_data)
                    .unwrap_or(ride);
                return Ok(PrepareResponse::commit(Some(snapshot)));
            }
            return Ok(PrepareResponse::abort(format!(
                "ride {} is locked by transaction {}",
                req.ride_id,
                ride.transaction_id.as_deref().unwrap_or("<unknown>")
            )));
        }

        // Claim atomically; a concurrent coordinator losing this race sees
        // no match and aborts.
        let filter = RideFilter::by_ride_id(&req.ride_id).with_locked(false);
        let snapshot = match self
            .store
            .find_and_update(&filter, &FieldUpdates::lock_for(&req.tx_id), true)
            .await?
        {
            Some(ride) => ride,
            None => {
                return Ok(PrepareResponse::abort(format!(
                    "ride {} is locked by a concurrent transaction",
                    req.ride_id
                )));
            }
        };

        match self.participant_log.record_prepare(
            &req.tx_id,
            &req.ride_id,
            TwoPcOperation::Delete,
            Some(snapshot.clone()),
        ) {
            Ok(_) => {}
            // The record already exists for this tx: a duplicate prepare
            // that lost the race to the first one.
            Err(FleetError::Conflict(_)) => {}
            Err(e) => return Err(e),
        }

        Ok(PrepareResponse::commit(Some(snapshot)))
    }

    /// Target-side prepare: durable intent only. The ride itself is not
    /// written until commit.
    async fn prepare_insert(&self, req: &PrepareRequest) -> Result<PrepareResponse> {
        // Re-votes for a transaction this region has already recorded are
        // answered identically, whatever state the record has reached.
        if let Some(record) = self.participant_log.get(&req.tx_id)? {
            if record.ride_id == req.ride_id {
                return Ok(PrepareResponse::commit(None));
            }
            return Ok(PrepareResponse::abort(format!(
                "transaction {} already prepared for another ride",
                req.tx_id
            )));
        }

        if let Some(active) = self.participant_log.active_for_ride(&req.ride_id)? {
            return Ok(PrepareResponse::abort(format!(
                "ride {} already prepared by transaction {}",
                req.ride_id, active.tx_id
            )));
        }

        // A ride with this id landing here would duplicate it within the
        // region at commit time; refuse while an abort is still possible.
        if self
            .store
            .find_one(&RideFilter::by_ride_id(&req.ride_id))
            .await?
            .is_some()
        {
            return Ok(PrepareResponse::abort(format!(
                "ride {} already exists in {}",
                req.ride_id, self.region
            )));
        }

        match self.participant_log.record_prepare(
            &req.tx_id,
            &req.ride_id,
            TwoPcOperation::Insert,
            req.ride_data.clone(),
        ) {
            Ok(_) => Ok(PrepareResponse::commit(None)),
            Err(FleetError::Conflict(_)) => {
                // Same tx_id re-preparing: idempotent when it names the
                // same ride, conflicting otherwise.
                match self.participant_log.get(&req.tx_id)? {
                    Some(record) if record.ride_id == req.ride_id => {
                        Ok(PrepareResponse::commit(None))
                    }
                    _ => Ok(PrepareResponse::abort(format!(
                        "transaction {} already prepared for another ride",
                        req.tx_id
                    ))),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Apply the coordinator's commit decision. Idempotent: repeating a
    /// commit after the first success is a no-op.
    pub async fn commit(&self, req: &CommitRequest) -> Result<CommitResponse> {
        let response = match req.operation {
            TwoPcOperation::Delete => self.commit_delete(req).await?,
            TwoPcOperation::Insert => self.commit_insert(req).await?,
        };
        self.participant_log
            .mark(&req.tx_id, ParticipantTxState::Committed)?;
        info!(
            region = %self.region,
            tx_id = %req.tx_id,
            ride_id = %req.ride_id,
            operation = ?req.operation,
            "commit applied"
        );
        Ok(response)
    }

    async fn commit_delete(&self, req: &CommitRequest) -> Result<CommitResponse> {
        // Fenced on the transaction id: a retry after success deletes
        // nothing, and a stray commit cannot remove a re-created ride.
        let filter = RideFilter::by_ride_id(&req.ride_id).with_transaction_id(&req.tx_id);
        let deleted = self.store.delete_one(&filter).await?;
        if deleted == 0 {
            warn!(
                region = %self.region,
                tx_id = %req.tx_id,
                ride_id = %req.ride_id,
                "commit delete matched no ride (already applied?)"
            );
        }
        Ok(CommitResponse {
            status: CommitStatus::Committed,
            deleted_count: Some(deleted),
            inserted_id: None,
        })
    }

    async fn commit_insert(&self, req: &CommitRequest) -> Result<CommitResponse> {
        let ride = match &req.ride_data {
            Some(ride) => ride.clone(),
            // Recovery replays carry no payload; fall back to the snapshot
            // persisted at prepare time.
            None => {
                let record = self.participant_log.get(&req.tx_id)?.ok_or_else(|| {
                    FleetError::NotFound(format!(
                        "no prepared record for transaction {}",
                        req.tx_id
                    ))
                })?;
                let snapshot = record.ride_data.ok_or_else(|| {
                    FleetError::Internal(format!(
                        "prepared record for transaction {} has no snapshot",
                        req.tx_id
                    ))
                })?;
                self.finalize_snapshot(snapshot)
            }
        };

        match self.store.insert(&ride).await {
            Ok(id) => Ok(CommitResponse {
                status: CommitStatus::Committed,
                deleted_count: None,
                inserted_id: Some(id),
            }),
            Err(FleetError::Conflict(_)) => {
                // Already inserted by an earlier commit attempt.
                let existing = self
                    .store
                    .find_one(&RideFilter::by_ride_id(&req.ride_id))
                    .await?;
                Ok(CommitResponse {
                    status: CommitStatus::Committed,
                    deleted_count: None,
                    inserted_id: existing.and_then(|r| r.id),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Rewrite a prepared snapshot as this region's committed copy.
    fn finalize_snapshot(&self, mut snapshot: Ride) -> Ride {
        snapshot.id = None;
        snapshot.city = self.region;
        snapshot.handoff_status = Some(HandoffStatus::Completed);
        snapshot.locked = false;
        snapshot.transaction_id = None;
        snapshot
    }

    /// Release all participant state for a transaction. Idempotent; safe
    /// to call whether or not this region ever prepared it.
    pub async fn abort(&self, req: &AbortRequest) -> Result<AbortResponse> {
        let record = self.participant_log.get(&req.tx_id)?;

        // Tentative INSERT documents are deleted before the lock sweep
        // would strip the transaction tag they are found by.
        if let Some(record) = &record {
            if record.operation == TwoPcOperation::Insert {
                let removed = self
                    .store
                    .delete_many(&RideFilter {
                        transaction_id: Some(Some(req.tx_id.clone())),
                        ..RideFilter::default()
                    })
                    .await?;
                if removed > 0 {
                    info!(
                        region = %self.region,
                        tx_id = %req.tx_id,
                        removed,
                        "abort removed tentative documents"
                    );
                }
            }
        }

        let unlocked = self
            .store
            .conditional_update(
                &RideFilter {
                    transaction_id: Some(Some(req.tx_id.clone())),
                    ..RideFilter::default()
                },
                &FieldUpdates::clear_handoff(),
            )
            .await?;
        if unlocked > 0 {
            info!(region = %self.region, tx_id = %req.tx_id, unlocked, "abort released locks");
        }

        if record.is_some() {
            self.participant_log
                .mark(&req.tx_id, ParticipantTxState::Aborted)?;
        }

        Ok(AbortResponse { status: AbortStatus::Aborted })
    }

    /// Prepared-but-unresolved records older than the window, for the
    /// coordinator's recovery scanner.
    pub fn pending_prepares(&self, older_than: Duration) -> Result<Vec<PendingPrepare>> {
        Ok(self
            .participant_log
            .stale_prepared(older_than)?
            .into_iter()
            .map(|record| PendingPrepare {
                tx_id: record.tx_id,
                ride_id: record.ride_id,
                operation: record.operation,
                timestamp: record.timestamp,
            })
            .collect())
    }
}
