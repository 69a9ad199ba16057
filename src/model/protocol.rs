// # Coordination Protocol Types
//
// Wire types for the 2PC participant endpoints and the coordinator handoff
// surface. Outcomes and votes are tagged variants; only the serialized form
// is a string.

use serde::{Deserialize, Serialize};

use super::{Region, Ride};

/// The operation a participant is asked to prepare for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TwoPcOperation {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "DELETE")]
    Delete,
}

/// Participant vote in the prepare phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    #[serde(rename = "COMMIT")]
    Commit,
    #[serde(rename = "ABORT")]
    Abort,
}

/// Body of `POST /2pc/prepare`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub ride_id: String,
    pub tx_id: String,
    pub operation: TwoPcOperation,
    /// Snapshot from the source participant, forwarded on INSERT prepares.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ride_data: Option<Ride>,
}

/// Response of `POST /2pc/prepare`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareResponse {
    pub vote: Vote,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ride_data: Option<Ride>,
}

impl PrepareResponse {
    pub fn commit(ride_data: Option<Ride>) -> Self {
        Self { vote: Vote::Commit, reason: None, ride_data }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Self { vote: Vote::Abort, reason: Some(reason.into()), ride_data: None }
    }
}

/// Body of `POST /2pc/commit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    pub ride_id: String,
    pub tx_id: String,
    pub operation: TwoPcOperation,
    /// The final document for INSERT commits. When absent the participant
    /// derives it from its prepared snapshot (recovery path).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ride_data: Option<Ride>,
}

/// Terminal participant state reported by commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitStatus {
    #[serde(rename = "COMMITTED")]
    Committed,
    #[serde(rename = "ABORTED")]
    Aborted,
}

/// Response of `POST /2pc/commit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitResponse {
    pub status: CommitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inserted_id: Option<String>,
}

/// Body of `POST /2pc/abort`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortRequest {
    pub tx_id: String,
}

/// Response of `POST /2pc/abort`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortResponse {
    pub status: AbortStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortStatus {
    #[serde(rename = "ABORTED")]
    Aborted,
}

/// A prepared participant record surfaced to the recovery scanner via
/// `GET /2pc/pending`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPrepare {
    pub tx_id: String,
    pub ride_id: String,
    pub operation: TwoPcOperation,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Body of `POST /handoff` on the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRequest {
    pub ride_id: String,
    pub source: Region,
    pub target: Region,
}

/// Terminal handoff outcome returned to the caller. `PREPARED` is never a
/// terminal status externally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandoffStatusWire {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "ABORTED")]
    Aborted,
    #[serde(rename = "BUFFERED")]
    Buffered,
}

/// Response of `POST /handoff`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffResponse {
    pub status: HandoffStatusWire,
    pub tx_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub latency_ms: u64,
}

/// Response of `GET /rides/{id}/locate` on the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocateResponse {
    pub region: Option<Region>,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ride: Option<Ride>,
}
