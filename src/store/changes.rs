// # Change Feed
//
// Ordered change notifications for a collection: every committed mutation is
// published to live subscribers and retained in a bounded replay buffer so a
// subscriber can reconnect and resume from its last position.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{FleetError, Result};

/// Events retained for resume after a disconnect.
const REPLAY_CAPACITY: usize = 4096;

/// Live fan-out channel depth per subscriber.
const CHANNEL_CAPACITY: usize = 1024;

/// Kind of mutation that produced a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOp {
    #[serde(rename = "insert")]
    Insert,
    #[serde(rename = "update")]
    Update,
    #[serde(rename = "delete")]
    Delete,
}

/// One committed mutation.
///
/// `full_document` is always present on insert and carries the after-image
/// on update; delete events identify the document by key only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Feed-local sequence number; strictly increasing.
    pub seq: u64,
    pub op: ChangeOp,
    #[serde(rename = "documentKey")]
    pub document_key: String,
    #[serde(rename = "fullDocument", skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Value>,
}

/// Opaque position in a change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResumeToken(pub u64);

impl ResumeToken {
    pub fn encode(&self) -> String {
        self.0.to_string()
    }

    pub fn decode(s: &str) -> Result<Self> {
        s.parse::<u64>()
            .map(ResumeToken)
            .map_err(|_| FleetError::Validation(format!("invalid resume token {s:?}")))
    }
}

/// Publisher side of a collection's change feed.
pub struct ChangeFeed {
    replay: RwLock<VecDeque<ChangeEvent>>,
    next_seq: AtomicU64,
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            replay: RwLock::new(VecDeque::with_capacity(REPLAY_CAPACITY)),
            next_seq: AtomicU64::new(1),
            tx,
        }
    }

    /// Record a mutation and notify subscribers. Returns the sequence number.
    pub fn publish(&self, op: ChangeOp, document_key: String, full_document: Option<Value>) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let event = ChangeEvent { seq, op, document_key, full_document };

        {
            let mut replay = self.replay.write();
            if replay.len() == REPLAY_CAPACITY {
                replay.pop_front();
            }
            replay.push_back(event.clone());
        }

        // No live subscribers is not an error; the replay buffer covers them.
        let _ = self.tx.send(event);
        seq
    }

    /// Open a subscription, optionally resuming after a previous position.
    ///
    /// Fresh subscriptions start at the current head; resumed ones at the
    /// caller's token. The head is read before the live channel is attached
    /// and the replay backlog covers the gap between the two, so no event
    /// is missed; duplicates across the seam are dropped by the
    /// subscription's monotone sequence check.
    pub fn subscribe(&self, resume_after: Option<ResumeToken>) -> ChangeSubscription {
        let from_seq = match resume_after {
            Some(token) => token.0,
            None => self.next_seq.load(Ordering::SeqCst).saturating_sub(1),
        };
        let rx = self.tx.subscribe();

        let backlog: VecDeque<ChangeEvent> = self
            .replay
            .read()
            .iter()
            .filter(|e| e.seq > from_seq)
            .cloned()
            .collect();

        ChangeSubscription { rx, backlog, last_seq: from_seq }
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer side of a change feed.
///
/// `next` yields events in sequence order. An error means the subscription
/// fell behind or was closed; the caller reconnects with `resume_token`.
pub struct ChangeSubscription {
    rx: broadcast::Receiver<ChangeEvent>,
    backlog: VecDeque<ChangeEvent>,
    last_seq: u64,
}

impl ChangeSubscription {
    pub async fn next(&mut self) -> Result<ChangeEvent> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                if event.seq <= self.last_seq {
                    continue;
                }
                self.last_seq = event.seq;
                return Ok(event);
            }

            match self.rx.recv().await {
                Ok(event) => {
                    if event.seq <= self.last_seq {
                        continue;
                    }
                    self.last_seq = event.seq;
                    return Ok(event);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Err(FleetError::Store(format!(
                        "change subscription lagged by {n} events"
                    )));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(FleetError::Store("change feed closed".into()));
                }
            }
        }
    }

    /// Position of the last delivered event.
    pub fn resume_token(&self) -> ResumeToken {
        ResumeToken(self.last_seq)
    }
}
