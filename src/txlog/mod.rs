// # Transaction Log
//
// Durable audit state for cross-region handoffs: the coordinator's
// transaction records in the globally-visible store, and the per-region
// participant records that make crash recovery possible. Records are never
// deleted; status transitions are monotone.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{FleetError, Result};
use crate::model::protocol::TwoPcOperation;
use crate::model::{Region, Ride};
use crate::store::memory::{Collection, DocFilter, MemoryEngine, Predicate, SortOrder};

const TRANSACTIONS_COLLECTION: &str = "transactions";
const PARTICIPANT_COLLECTION: &str = "participant_tx";

/// Coordinator-side transaction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    #[serde(rename = "STARTED")]
    Started,
    #[serde(rename = "PREPARED")]
    Prepared,
    #[serde(rename = "COMMITTED")]
    Committed,
    #[serde(rename = "ABORTED")]
    Aborted,
}

impl TxStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxStatus::Committed | TxStatus::Aborted)
    }

    /// Statuses a record may hold immediately before transitioning to
    /// `self`.
    fn predecessors(self) -> &'static [TxStatus] {
        match self {
            TxStatus::Started => &[],
            TxStatus::Prepared => &[TxStatus::Started],
            TxStatus::Committed => &[TxStatus::Prepared],
            TxStatus::Aborted => &[TxStatus::Started, TxStatus::Prepared],
        }
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TxStatus::Started => "STARTED",
            TxStatus::Prepared => "PREPARED",
            TxStatus::Committed => "COMMITTED",
            TxStatus::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// One entry in a transaction's status history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxHistoryEntry {
    pub status: TxStatus,
    pub timestamp: DateTime<Utc>,
    pub note: String,
}

/// The coordinator's durable record of one handoff transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRecord {
    pub tx_id: String,
    #[serde(rename = "rideId")]
    pub ride_id: String,
    pub source_region: Region,
    pub target_region: Region,
    pub status: TxStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub history: Vec<TxHistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Coordinator handle on the transaction log. Only the coordinator mutates
/// these records.
pub struct TransactionLog {
    collection: Arc<Collection>,
}

impl TransactionLog {
    pub fn new(engine: Arc<MemoryEngine>) -> Self {
        Self {
            collection: engine.collection(TRANSACTIONS_COLLECTION, Some("tx_id")),
        }
    }

    fn decode(doc: Value) -> Result<TxRecord> {
        serde_json::from_value(doc)
            .map_err(|e| FleetError::Store(format!("malformed transaction record: {e}")))
    }

    /// Create the STARTED record for a new transaction.
    pub fn begin(
        &self,
        tx_id: &str,
        ride_id: &str,
        source: Region,
        target: Region,
    ) -> Result<TxRecord> {
        let now = Utc::now();
        let record = TxRecord {
            tx_id: tx_id.to_owned(),
            ride_id: ride_id.to_owned(),
            source_region: source,
            target_region: target,
            status: TxStatus::Started,
            created_at: now,
            last_updated: now,
            history: vec![TxHistoryEntry {
                status: TxStatus::Started,
                timestamp: now,
                note: "Transaction created".into(),
            }],
            latency_ms: None,
            error: None,
        };
        self.collection.insert(serde_json::to_value(&record)?)?;
        Ok(record)
    }

    /// Advance a transaction's status, appending to its history. The
    /// transition must be monotone; repeating the current status is a
    /// no-op that returns the stored record.
    pub fn append_status(
        &self,
        tx_id: &str,
        status: TxStatus,
        note: &str,
        latency_ms: Option<u64>,
        error: Option<String>,
    ) -> Result<TxRecord> {
        let allowed: Vec<Value> = status
            .predecessors()
            .iter()
            .map(|s| json!(s))
            .collect();
        let filter = DocFilter::new()
            .eq("tx_id", json!(tx_id))
            .field("status", Predicate::In(allowed));

        let now = Utc::now();
        let updated = self.collection.modify_one(
            &filter,
            |doc| {
                if let Some(object) = doc.as_object_mut() {
                    object.insert("status".into(), json!(status));
                    object.insert("last_updated".into(), json!(now));
                    if let Some(ms) = latency_ms {
                        object.insert("latency_ms".into(), json!(ms));
                    }
                    if let Some(err) = &error {
                        object.insert("error".into(), json!(err));
                    }
                    if let Some(history) = object.get_mut("history").and_then(Value::as_array_mut) {
                        history.push(json!(TxHistoryEntry {
                            status,
                            timestamp: now,
                            note: note.to_owned(),
                        }));
                    }
                }
            },
            true,
        );

        match updated {
            Some(doc) => Self::decode(doc),
            None => match self.get(tx_id)? {
                Some(existing) if existing.status == status => Ok(existing),
                Some(existing) => Err(FleetError::Conflict(format!(
                    "transaction {tx_id} cannot move {} -> {status}",
                    existing.status
                ))),
                None => Err(FleetError::NotFound(format!("transaction {tx_id}"))),
            },
        }
    }

    pub fn mark_prepared(&self, tx_id: &str, note: &str) -> Result<TxRecord> {
        self.append_status(tx_id, TxStatus::Prepared, note, None, None)
    }

    pub fn mark_committed(&self, tx_id: &str, note: &str, latency_ms: u64) -> Result<TxRecord> {
        self.append_status(tx_id, TxStatus::Committed, note, Some(latency_ms), None)
    }

    pub fn mark_aborted(&self, tx_id: &str, note: &str) -> Result<TxRecord> {
        self.append_status(tx_id, TxStatus::Aborted, note, None, Some(note.to_owned()))
    }

    /// Append a history note without changing the status. Used to record
    /// transaction-affecting events (for example a commit delivery failure
    /// awaiting recovery) on the audit trail.
    pub fn annotate(&self, tx_id: &str, note: &str) -> Result<TxRecord> {
        let now = Utc::now();
        let updated = self.collection.modify_one(
            &DocFilter::new().eq("tx_id", json!(tx_id)),
            |doc| {
                if let Some(object) = doc.as_object_mut() {
                    let status = object.get("status").cloned().unwrap_or(Value::Null);
                    object.insert("last_updated".into(), json!(now));
                    if let Some(history) = object.get_mut("history").and_then(Value::as_array_mut) {
                        history.push(json!({
                            "status": status,
                            "timestamp": now,
                            "note": note,
                        }));
                    }
                }
            },
            true,
        );
        match updated {
            Some(doc) => Self::decode(doc),
            None => Err(FleetError::NotFound(format!("transaction {tx_id}"))),
        }
    }

    pub fn get(&self, tx_id: &str) -> Result<Option<TxRecord>> {
        match self
            .collection
            .find_one(&DocFilter::new().eq("tx_id", json!(tx_id)))
        {
            Some(doc) => Ok(Some(Self::decode(doc)?)),
            None => Ok(None),
        }
    }

    /// The most recent transaction touching a ride, if any.
    pub fn latest_for_ride(&self, ride_id: &str) -> Result<Option<TxRecord>> {
        let docs = self.collection.find_many(
            &DocFilter::new().eq("rideId", json!(ride_id)),
            0,
            Some(1),
            Some(("created_at", SortOrder::Descending)),
        );
        docs.into_iter().next().map(Self::decode).transpose()
    }

    /// Newest-first listing plus the total record count.
    pub fn recent(&self, limit: usize) -> Result<(usize, Vec<TxRecord>)> {
        let total = self.collection.count(&DocFilter::new());
        let docs = self.collection.find_many(
            &DocFilter::new(),
            0,
            Some(limit),
            Some(("created_at", SortOrder::Descending)),
        );
        let records = docs
            .into_iter()
            .map(Self::decode)
            .collect::<Result<Vec<_>>>()?;
        Ok((total, records))
    }

    /// Transactions stuck in `status` whose last update is older than the
    /// grace window.
    pub fn stale(&self, status: TxStatus, older_than: Duration) -> Result<Vec<TxRecord>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| FleetError::Internal(e.to_string()))?;
        let filter = DocFilter::new()
            .eq("status", json!(status))
            .field("last_updated", Predicate::Lt(json!(cutoff)));
        self.collection
            .find_many(&filter, 0, None, Some(("last_updated", SortOrder::Ascending)))
            .into_iter()
            .map(Self::decode)
            .collect()
    }
}

/// Participant-side state of a prepared operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantTxState {
    #[serde(rename = "PREPARED")]
    Prepared,
    #[serde(rename = "COMMITTED")]
    Committed,
    #[serde(rename = "ABORTED")]
    Aborted,
}

/// A region's durable record of its role in one transaction, written at
/// prepare time so a crashed participant can be recovered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantTxRecord {
    pub tx_id: String,
    #[serde(rename = "rideId")]
    pub ride_id: String,
    pub operation: TwoPcOperation,
    pub state: ParticipantTxState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ride_data: Option<Ride>,
    pub timestamp: DateTime<Utc>,
}

/// A region's handle on its own participant records.
pub struct ParticipantLog {
    collection: Arc<Collection>,
}

impl ParticipantLog {
    pub fn new(engine: Arc<MemoryEngine>) -> Self {
        Self {
            collection: engine.collection(PARTICIPANT_COLLECTION, Some("tx_id")),
        }
    }

    fn decode(doc: Value) -> Result<ParticipantTxRecord> {
        serde_json::from_value(doc)
            .map_err(|e| FleetError::Store(format!("malformed participant record: {e}")))
    }

    pub fn record_prepare(
        &self,
        tx_id: &str,
        ride_id: &str,
        operation: TwoPcOperation,
        ride_data: Option<Ride>,
    ) -> Result<ParticipantTxRecord> {
        let record = ParticipantTxRecord {
            tx_id: tx_id.to_owned(),
            ride_id: ride_id.to_owned(),
            operation,
            state: ParticipantTxState::Prepared,
            ride_data,
            timestamp: Utc::now(),
        };
        self.collection.insert(serde_json::to_value(&record)?)?;
        Ok(record)
    }

    pub fn get(&self, tx_id: &str) -> Result<Option<ParticipantTxRecord>> {
        match self
            .collection
            .find_one(&DocFilter::new().eq("tx_id", json!(tx_id)))
        {
            Some(doc) => Ok(Some(Self::decode(doc)?)),
            None => Ok(None),
        }
    }

    /// The still-prepared record for a ride, if one exists. Used to detect
    /// a conflicting in-flight transaction at prepare time.
    pub fn active_for_ride(&self, ride_id: &str) -> Result<Option<ParticipantTxRecord>> {
        let filter = DocFilter::new()
            .eq("rideId", json!(ride_id))
            .eq("state", json!(ParticipantTxState::Prepared));
        match self.collection.find_one(&filter) {
            Some(doc) => Ok(Some(Self::decode(doc)?)),
            None => Ok(None),
        }
    }

    /// Advance a record to a terminal state. Idempotent; a record already
    /// in the requested state is returned unchanged.
    pub fn mark(&self, tx_id: &str, state: ParticipantTxState) -> Result<Option<ParticipantTxRecord>> {
        let filter = DocFilter::new()
            .eq("tx_id", json!(tx_id))
            .eq("state", json!(ParticipantTxState::Prepared));
        let mut set = serde_json::Map::new();
        set.insert("state".into(), json!(state));

        match self.collection.find_one_and_update(&filter, &set, true) {
            Some(doc) => Ok(Some(Self::decode(doc)?)),
            None => self.get(tx_id),
        }
    }

    /// Records still PREPARED and older than the grace window.
    pub fn stale_prepared(&self, older_than: Duration) -> Result<Vec<ParticipantTxRecord>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| FleetError::Internal(e.to_string()))?;
        let filter = DocFilter::new()
            .eq("state", json!(ParticipantTxState::Prepared))
            .field("timestamp", Predicate::Lt(json!(cutoff)));
        self.collection
            .find_many(&filter, 0, None, Some(("timestamp", SortOrder::Ascending)))
            .into_iter()
            .map(Self::decode)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> TransactionLog {
        TransactionLog::new(Arc::new(MemoryEngine::new("txlog-test")))
    }

    #[test]
    fn test_begin_writes_started_history() {
        let log = log();
        let record = log.begin("tx-1", "R-1", Region::Phx, Region::La).unwrap();
        assert_eq!(record.status, TxStatus::Started);
        assert_eq!(record.history.len(), 1);
        assert_eq!(record.history[0].note, "Transaction created");

        let fetched = log.get("tx-1").unwrap().unwrap();
        assert_eq!(fetched.ride_id, "R-1");
        assert_eq!(fetched.source_region, Region::Phx);
    }

    #[test]
    fn test_monotone_status_progression() {
        let log = log();
        log.begin("tx-1", "R-1", Region::Phx, Region::La).unwrap();

        let prepared = log.mark_prepared("tx-1", "both voted COMMIT").unwrap();
        assert_eq!(prepared.status, TxStatus::Prepared);
        assert_eq!(prepared.history.len(), 2);

        let committed = log.mark_committed("tx-1", "commit complete", 42).unwrap();
        assert_eq!(committed.status, TxStatus::Committed);
        assert_eq!(committed.latency_ms, Some(42));
    }

    #[test]
    fn test_downgrade_rejected() {
        let log = log();
        log.begin("tx-1", "R-1", Region::Phx, Region::La).unwrap();
        log.mark_prepared("tx-1", "").unwrap();
        log.mark_committed("tx-1", "", 10).unwrap();

        let err = log.mark_aborted("tx-1", "late abort").unwrap_err();
        assert!(matches!(err, FleetError::Conflict(_)));
        assert_eq!(log.get("tx-1").unwrap().unwrap().status, TxStatus::Committed);
    }

    #[test]
    fn test_commit_requires_prepared() {
        let log = log();
        log.begin("tx-1", "R-1", Region::Phx, Region::La).unwrap();
        assert!(log.mark_committed("tx-1", "", 1).is_err());
    }

    #[test]
    fn test_repeated_status_is_noop() {
        let log = log();
        log.begin("tx-1", "R-1", Region::Phx, Region::La).unwrap();
        log.mark_aborted("tx-1", "first").unwrap();
        let second = log.mark_aborted("tx-1", "second").unwrap();
        assert_eq!(second.status, TxStatus::Aborted);
        // History is not extended by the no-op.
        assert_eq!(second.history.len(), 2);
    }

    #[test]
    fn test_latest_for_ride_picks_newest() {
        let log = log();
        log.begin("tx-1", "R-9", Region::Phx, Region::La).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        log.begin("tx-2", "R-9", Region::La, Region::Phx).unwrap();

        let latest = log.latest_for_ride("R-9").unwrap().unwrap();
        assert_eq!(latest.tx_id, "tx-2");
    }

    #[test]
    fn test_stale_scan_respects_window() {
        let log = log();
        log.begin("tx-1", "R-1", Region::Phx, Region::La).unwrap();
        log.mark_prepared("tx-1", "").unwrap();

        // Fresh record is not stale under a generous window.
        let stale = log.stale(TxStatus::Prepared, Duration::from_secs(60)).unwrap();
        assert!(stale.is_empty());

        // Zero-width window catches it.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let stale = log.stale(TxStatus::Prepared, Duration::from_millis(1)).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].tx_id, "tx-1");
    }

    #[test]
    fn test_participant_log_lifecycle() {
        let engine = Arc::new(MemoryEngine::new("participant-log-test"));
        let log = ParticipantLog::new(engine);

        log.record_prepare("tx-1", "R-1", TwoPcOperation::Delete, None).unwrap();
        assert!(log.active_for_ride("R-1").unwrap().is_some());

        log.mark("tx-1", ParticipantTxState::Committed).unwrap();
        assert!(log.active_for_ride("R-1").unwrap().is_none());

        // Marking again is a no-op, not an error.
        let again = log.mark("tx-1", ParticipantTxState::Committed).unwrap().unwrap();
        assert_eq!(again.state, ParticipantTxState::Committed);
    }

    #[test]
    fn test_duplicate_prepare_record_conflicts() {
        let engine = Arc::new(MemoryEngine::new("participant-log-dup"));
        let log = ParticipantLog::new(engine);
        log.record_prepare("tx-1", "R-1", TwoPcOperation::Insert, None).unwrap();
        assert!(log
            .record_prepare("tx-1", "R-1", TwoPcOperation::Insert, None)
            .is_err());
    }
}
