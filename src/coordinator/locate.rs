// # Ride Locator
//
// Resolves which region owns a ride: the transaction log is consulted
// first, and when it has no metadata both regions are probed directly. A
// ride present in both regions is reported as ambiguous rather than
// resolved.

use std::sync::Arc;

use tokio::join;

use crate::error::Result;
use crate::model::protocol::LocateResponse;
use crate::model::Region;
use crate::txlog::{TransactionLog, TxStatus};

use super::client::ParticipantClient;

pub struct RideLocator {
    client: Arc<ParticipantClient>,
    txlog: Arc<TransactionLog>,
}

impl RideLocator {
    pub fn new(client: Arc<ParticipantClient>, txlog: Arc<TransactionLog>) -> Self {
        Self { client, txlog }
    }

    pub async fn locate(&self, ride_id: &str) -> Result<LocateResponse> {
        if let Some(tx) = self.txlog.latest_for_ride(ride_id)? {
            let (region, reason) = match tx.status {
                TxStatus::Committed => (
                    tx.target_region,
                    format!(
                        "Last transaction is COMMITTED from {} to {}",
                        tx.source_region, tx.target_region
                    ),
                ),
                TxStatus::Aborted => (
                    tx.source_region,
                    format!("Last transaction is ABORTED; using source region {}", tx.source_region),
                ),
                status => (
                    tx.source_region,
                    format!(
                        "Last transaction status is {status}; conservatively using source region {}",
                        tx.source_region
                    ),
                ),
            };
            let ride = self.client.get_ride(region, ride_id).await?;
            return Ok(LocateResponse { region: Some(region), reason, ride });
        }

        // No metadata: probe both regions.
        let (phx, la) = join!(
            self.client.get_ride(Region::Phx, ride_id),
            self.client.get_ride(Region::La, ride_id),
        );
        let phx = phx?;
        let la = la?;

        Ok(match (phx, la) {
            (Some(ride), None) => LocateResponse {
                region: Some(Region::Phx),
                reason: "No transaction metadata; ride found only in PHX".into(),
                ride: Some(ride),
            },
            (None, Some(ride)) => LocateResponse {
                region: Some(Region::La),
                reason: "No transaction metadata; ride found only in LA".into(),
                ride: Some(ride),
            },
            (Some(_), Some(_)) => LocateResponse {
                region: None,
                reason: "Ride exists in both PHX and LA; ownership is ambiguous".into(),
                ride: None,
            },
            (None, None) => LocateResponse {
                region: None,
                reason: "Ride not found in either region".into(),
                ride: None,
            },
        })
    }
}
