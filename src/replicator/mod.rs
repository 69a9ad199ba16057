// # Change Replicator
//
// One long-running task per source region: subscribes to the region's
// change feed and applies every mutation to the GLOBAL replica. Individual
// event failures are logged and skipped; a lost subscription reconnects
// with bounded backoff and resumes from the last delivered position.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ReplicatorMode;
use crate::error::{FleetError, Result};
use crate::model::Region;
use crate::store::{ChangeEvent, ChangeOp, RegionalStore, ResumeToken, RideFilter, RideSort};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Applied-event counters, readable while the task runs.
#[derive(Debug, Default)]
pub struct ReplicatorStats {
    pub inserts: AtomicU64,
    pub updates: AtomicU64,
    pub deletes: AtomicU64,
    pub skipped: AtomicU64,
}

impl ReplicatorStats {
    pub fn applied(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
            + self.updates.load(Ordering::Relaxed)
            + self.deletes.load(Ordering::Relaxed)
    }
}

pub struct ChangeReplicator {
    region: Region,
    source: Arc<dyn RegionalStore>,
    global: Arc<dyn RegionalStore>,
    stats: Arc<ReplicatorStats>,
}

impl ChangeReplicator {
    pub fn new(
        region: Region,
        source: Arc<dyn RegionalStore>,
        global: Arc<dyn RegionalStore>,
    ) -> Self {
        Self {
            region,
            source,
            global,
            stats: Arc::new(ReplicatorStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ReplicatorStats> {
        self.stats.clone()
    }

    /// One-shot copy of every ride in the source region into GLOBAL.
    /// Duplicates are silently skipped, which makes a re-seed idempotent.
    pub async fn initial_sync(&self) -> Result<usize> {
        let rides = self
            .source
            .find_many(&RideFilter::all(), 0, None, RideSort::Unsorted)
            .await?;

        let mut copied = 0;
        for ride in &rides {
            match self.global.insert_raw(serde_json::to_value(ride)?).await {
                Ok(_) => copied += 1,
                Err(FleetError::Conflict(_)) => {}
                Err(e) => {
                    warn!(region = %self.region, ride_id = %ride.ride_id, error = %e, "initial sync insert failed");
                }
            }
        }
        info!(region = %self.region, copied, total = rides.len(), "initial sync complete");
        Ok(copied)
    }

    /// Apply one change event to the GLOBAL replica.
    async fn apply(&self, event: &ChangeEvent) -> Result<()> {
        match event.op {
            ChangeOp::Insert => {
                let doc = event.full_document.clone().ok_or_else(|| {
                    FleetError::Store("insert event without full document".into())
                })?;
                match self.global.insert_raw(doc).await {
                    Ok(_) => {
                        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
                    }
                    // Already present (initial sync overlap); not an error.
                    Err(FleetError::Conflict(_)) => {
                        debug!(region = %self.region, key = %event.document_key, "duplicate insert skipped");
                    }
                    Err(e) => return Err(e),
                }
            }
            ChangeOp::Update => {
                let doc = event.full_document.clone().ok_or_else(|| {
                    FleetError::Store("update event without after-image".into())
                })?;
                self.global
                    .replace_by_key(&event.document_key, doc, true)
                    .await?;
                self.stats.updates.fetch_add(1, Ordering::Relaxed);
            }
            ChangeOp::Delete => {
                self.global.delete_by_key(&event.document_key).await?;
                self.stats.deletes.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Stream loop. Never returns; supervised by the runtime.
    pub async fn run(self) {
        let mut resume: Option<ResumeToken> = None;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let mut subscription = match self.source.subscribe_changes(resume).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    warn!(region = %self.region, error = %e, "change subscription failed; retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };
            info!(region = %self.region, resumed = resume.is_some(), "change stream open");
            backoff = INITIAL_BACKOFF;

            loop {
                match subscription.next().await {
                    Ok(event) => {
                        resume = Some(subscription.resume_token());
                        if let Err(e) = self.apply(&event).await {
                            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                region = %self.region,
                                key = %event.document_key,
                                op = ?event.op,
                                error = %e,
                                "event skipped"
                            );
                        }
                    }
                    Err(e) => {
                        warn!(region = %self.region, error = %e, "change stream lost; reconnecting");
                        resume = Some(subscription.resume_token());
                        break;
                    }
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

/// Seed GLOBAL and start one replicator task per region. Returns the spawned
/// task handles.
pub async fn start_replicators(
    mode: ReplicatorMode,
    sources: Vec<(Region, Arc<dyn RegionalStore>)>,
    global: Arc<dyn RegionalStore>,
) -> Result<Vec<tokio::task::JoinHandle<()>>> {
    let mut handles = Vec::new();
    for (region, source) in sources {
        let replicator = ChangeReplicator::new(region, source, global.clone());
        if mode == ReplicatorMode::InitialAndStream {
            replicator.initial_sync().await?;
        }
        handles.push(tokio::spawn(replicator.run()));
    }
    Ok(handles)
}
