// # Recovery Scanner
//
// Reclaims transactions stranded by a crash or lost commit: stale PREPARED
// records get their commit phase replayed, stale STARTED records are
// aborted, and participant records orphaned from the transaction log are
// released. Runs once at startup and then periodically.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::join;
use tracing::{info, warn};

use crate::error::Result;
use crate::model::protocol::{AbortRequest, CommitRequest, PendingPrepare, TwoPcOperation};
use crate::model::Region;
use crate::txlog::{TransactionLog, TxRecord, TxStatus};

use super::client::ParticipantClient;

/// Outcome counts for one scan pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// PREPARED transactions whose commit phase was replayed to completion.
    pub replayed: usize,
    /// STARTED transactions aborted after the grace window.
    pub aborted: usize,
    /// Orphaned participant records released.
    pub released: usize,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.replayed == 0 && self.aborted == 0 && self.released == 0
    }
}

pub struct RecoveryScanner {
    client: Arc<ParticipantClient>,
    txlog: Arc<TransactionLog>,
    grace: Duration,
    scan_interval: Duration,
}

impl RecoveryScanner {
    pub fn new(
        client: Arc<ParticipantClient>,
        txlog: Arc<TransactionLog>,
        grace: Duration,
        scan_interval: Duration,
    ) -> Self {
        Self { client, txlog, grace, scan_interval }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.scan().await {
                Ok(report) if !report.is_empty() => {
                    info!(
                        replayed = report.replayed,
                        aborted = report.aborted,
                        released = report.released,
                        "recovery pass reclaimed transactions"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "recovery pass failed"),
            }
        }
    }

    /// One full pass over the log and both participants.
    pub async fn scan(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for record in self.txlog.stale(TxStatus::Prepared, self.grace)? {
            if self.replay_commit(&record).await {
                report.replayed += 1;
            }
        }

        for record in self.txlog.stale(TxStatus::Started, self.grace)? {
            self.abort_stale_started(&record).await;
            report.aborted += 1;
        }

        for region in Region::all() {
            report.released += self.release_orphans(region).await;
        }

        Ok(report)
    }

    /// Replay the commit phase of a transaction that passed its commit
    /// point but never finished. Idempotent on both participants.
    async fn replay_commit(&self, record: &TxRecord) -> bool {
        let commit_src = CommitRequest {
            ride_id: record.ride_id.clone(),
            tx_id: record.tx_id.clone(),
            operation: TwoPcOperation::Delete,
            ride_data: None,
        };
        // No payload: the target rebuilds the document from its prepared
        // snapshot.
        let commit_tgt = CommitRequest {
            ride_id: record.ride_id.clone(),
            tx_id: record.tx_id.clone(),
            operation: TwoPcOperation::Insert,
            ride_data: None,
        };

        let (src, tgt) = join!(
            self.client.commit(record.source_region, &commit_src),
            self.client.commit(record.target_region, &commit_tgt),
        );

        match (src, tgt) {
            (Ok(_), Ok(_)) => {
                let latency_ms = (Utc::now() - record.created_at).num_milliseconds().max(0) as u64;
                if let Err(e) =
                    self.txlog
                        .mark_committed(&record.tx_id, "Commit replayed by recovery", latency_ms)
                {
                    warn!(tx_id = %record.tx_id, error = %e, "failed to record replayed commit");
                    return false;
                }
                info!(tx_id = %record.tx_id, ride_id = %record.ride_id, "recovery replayed commit");
                true
            }
            (src, tgt) => {
                if let Err(e) = src {
                    warn!(tx_id = %record.tx_id, region = %record.source_region, error = %e, "replay commit failed");
                }
                if let Err(e) = tgt {
                    warn!(tx_id = %record.tx_id, region = %record.target_region, error = %e, "replay commit failed");
                }
                false
            }
        }
    }

    /// A transaction stuck in STARTED never reached its commit point: abort
    /// both sides and close the record.
    async fn abort_stale_started(&self, record: &TxRecord) {
        let req = AbortRequest { tx_id: record.tx_id.clone() };
        let (src, tgt) = join!(
            self.client.abort(record.source_region, &req),
            self.client.abort(record.target_region, &req),
        );
        if let Err(e) = src {
            warn!(tx_id = %record.tx_id, region = %record.source_region, error = %e, "recovery abort failed");
        }
        if let Err(e) = tgt {
            warn!(tx_id = %record.tx_id, region = %record.target_region, error = %e, "recovery abort failed");
        }
        if let Err(e) = self
            .txlog
            .mark_aborted(&record.tx_id, "Recovered: timed out before prepare completed")
        {
            warn!(tx_id = %record.tx_id, error = %e, "failed to record recovery abort");
        } else {
            info!(tx_id = %record.tx_id, ride_id = %record.ride_id, "recovery aborted stale transaction");
        }
    }

    /// Participant records still PREPARED whose transaction is gone or
    /// already terminal: release them on that participant.
    async fn release_orphans(&self, region: Region) -> usize {
        let pending = match self.client.pending(region, self.grace).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(%region, error = %e, "pending-prepare scan failed");
                return 0;
            }
        };

        let mut released = 0;
        for record in pending {
            match self.txlog.get(&record.tx_id) {
                Ok(Some(tx)) => match tx.status {
                    // The log will drive these through replay or abort.
                    TxStatus::Prepared | TxStatus::Started => {}
                    TxStatus::Committed => {
                        if self.redeliver_commit(region, &record).await {
                            released += 1;
                        }
                    }
                    TxStatus::Aborted => {
                        if self.release(region, &record).await {
                            released += 1;
                        }
                    }
                },
                Ok(None) => {
                    if self.release(region, &record).await {
                        released += 1;
                    }
                }
                Err(e) => {
                    warn!(tx_id = %record.tx_id, error = %e, "transaction lookup failed");
                }
            }
        }
        released
    }

    /// The coordinator committed but this participant never heard it.
    async fn redeliver_commit(&self, region: Region, record: &PendingPrepare) -> bool {
        let req = CommitRequest {
            ride_id: record.ride_id.clone(),
            tx_id: record.tx_id.clone(),
            operation: record.operation,
            ride_data: None,
        };
        match self.client.commit(region, &req).await {
            Ok(_) => {
                info!(tx_id = %record.tx_id, %region, "recovery redelivered commit");
                true
            }
            Err(e) => {
                warn!(tx_id = %record.tx_id, %region, error = %e, "commit redelivery failed");
                false
            }
        }
    }

    async fn release(&self, region: Region, record: &PendingPrepare) -> bool {
        let req = AbortRequest { tx_id: record.tx_id.clone() };
        match self.client.abort(region, &req).await {
            Ok(_) => {
                info!(tx_id = %record.tx_id, %region, ride_id = %record.ride_id, "recovery released orphaned prepare");
                true
            }
            Err(e) => {
                warn!(tx_id = %record.tx_id, %region, error = %e, "orphan release failed");
                false
            }
        }
    }
}
