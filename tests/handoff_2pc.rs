// End-to-end handoff protocol tests over the HTTP surface: happy path,
// admission gating, abort paths, idempotent participant endpoints, and the
// cross-region invariants that must hold once a transaction is terminal.

mod common;

use common::TestCluster;
use fleetmesh::model::Region;
use serde_json::{json, Value};

async fn post_handoff(cluster: &TestCluster, ride_id: &str, source: &str, target: &str) -> (u16, Value) {
    let response = cluster
        .http
        .post(format!("{}/handoff", cluster.coordinator_url))
        .json(&json!({"ride_id": ride_id, "source": source, "target": target}))
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

#[tokio::test]
async fn handoff_happy_path_moves_ride_to_target() {
    let cluster = TestCluster::start(false).await;
    cluster.seed_ride(Region::Phx, "R-100001").await;

    let (status, body) = post_handoff(&cluster, "R-100001", "PHX", "LA").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "SUCCESS");
    let tx_id = body["tx_id"].as_str().unwrap().to_owned();
    assert!(body["latency_ms"].is_u64());

    // Source no longer has the ride.
    let phx_get = cluster
        .http
        .get(format!("{}/rides/R-100001", cluster.phx_url))
        .send()
        .await
        .unwrap();
    assert_eq!(phx_get.status().as_u16(), 404);

    // Target owns it, completed and unlocked.
    let la_get = cluster
        .http
        .get(format!("{}/rides/R-100001", cluster.la_url))
        .send()
        .await
        .unwrap();
    assert_eq!(la_get.status().as_u16(), 200);
    let ride: Value = la_get.json().await.unwrap();
    assert_eq!(ride["city"], "LA");
    assert_eq!(ride["handoff_status"], "COMPLETED");
    assert_eq!(ride["locked"], false);
    assert_eq!(ride["transaction_id"], Value::Null);

    // Log is terminal and monotone; no locks survive.
    let tx = cluster.txlog().get(&tx_id).unwrap().unwrap();
    assert_eq!(format!("{}", tx.status), "COMMITTED");
    let statuses: Vec<String> = tx.history.iter().map(|h| h.status.to_string()).collect();
    assert_eq!(statuses, vec!["STARTED", "PREPARED", "COMMITTED"]);
    cluster.assert_no_locks(&tx_id).await;
}

#[tokio::test]
async fn handoff_conserves_ride_count() {
    let cluster = TestCluster::start(false).await;
    for i in 0..4 {
        cluster.seed_ride(Region::Phx, &format!("R-20000{i}")).await;
    }
    assert_eq!(cluster.regional_count().await, 4);

    post_handoff(&cluster, "R-200000", "PHX", "LA").await;
    post_handoff(&cluster, "R-200001", "PHX", "LA").await;
    // Hand one straight back again.
    post_handoff(&cluster, "R-200000", "LA", "PHX").await;

    assert_eq!(cluster.regional_count().await, 4);
    assert_eq!(cluster.holders("R-200000").await, vec![Region::Phx]);
    assert_eq!(cluster.holders("R-200001").await, vec![Region::La]);
}

#[tokio::test]
async fn handoff_to_unhealthy_target_is_buffered() {
    let cluster = TestCluster::start(false).await;
    cluster.seed_ride(Region::Phx, "R-100001").await;
    cluster.health.set_healthy(Region::La, false);

    let (status, body) = post_handoff(&cluster, "R-100001", "PHX", "LA").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "BUFFERED");
    assert_eq!(
        body["reason"],
        "Target region LA is currently unavailable"
    );
    assert_eq!(body["latency_ms"], 0);
    let tx_id = body["tx_id"].as_str().unwrap();

    // No durable work happened: no log record, source untouched.
    assert!(cluster.txlog().get(tx_id).unwrap().is_none());
    let ride = cluster.phx.get_ride("R-100001").await.unwrap();
    assert!(!ride.locked);
    assert!(ride.transaction_id.is_none());

    // Recovery and resubmission after the target heals.
    cluster.health.set_healthy(Region::La, true);
    let (_, body) = post_handoff(&cluster, "R-100001", "PHX", "LA").await;
    assert_eq!(body["status"], "SUCCESS");
}

#[tokio::test]
async fn handoff_of_missing_ride_aborts() {
    let cluster = TestCluster::start(false).await;

    let (status, body) = post_handoff(&cluster, "R-999999", "PHX", "LA").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ABORTED");
    assert!(body["reason"].as_str().unwrap().contains("not found"));
    let tx_id = body["tx_id"].as_str().unwrap();

    // Log went STARTED then ABORTED; LA saw no writes.
    let tx = cluster.txlog().get(tx_id).unwrap().unwrap();
    assert_eq!(format!("{}", tx.status), "ABORTED");
    let statuses: Vec<String> = tx.history.iter().map(|h| h.status.to_string()).collect();
    assert_eq!(statuses, vec!["STARTED", "ABORTED"]);
    assert!(cluster.holders("R-999999").await.is_empty());
}

#[tokio::test]
async fn handoff_of_locked_ride_aborts_without_disturbing_owner() {
    let cluster = TestCluster::start(false).await;
    cluster.seed_ride(Region::Phx, "R-100001").await;

    // Another transaction already holds the ride.
    let prepare = json!({
        "ride_id": "R-100001",
        "tx_id": "11111111-1111-4111-8111-111111111111",
        "operation": "DELETE"
    });
    let first: Value = cluster
        .http
        .post(format!("{}/2pc/prepare", cluster.phx_url))
        .json(&prepare)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["vote"], "COMMIT");

    let (_, body) = post_handoff(&cluster, "R-100001", "PHX", "LA").await;
    assert_eq!(body["status"], "ABORTED");
    assert!(body["reason"].as_str().unwrap().contains("locked"));

    // The original holder's lock is intact.
    let ride = cluster.phx.get_ride("R-100001").await.unwrap();
    assert!(ride.locked);
    assert_eq!(
        ride.transaction_id.as_deref(),
        Some("11111111-1111-4111-8111-111111111111")
    );
}

#[tokio::test]
async fn handoff_same_source_and_target_is_422() {
    let cluster = TestCluster::start(false).await;
    let (status, _) = post_handoff(&cluster, "R-100001", "PHX", "PHX").await;
    assert_eq!(status, 422);
}

#[tokio::test]
async fn handoff_invalid_ride_id_is_422() {
    let cluster = TestCluster::start(false).await;
    let (status, _) = post_handoff(&cluster, "ride-1", "PHX", "LA").await;
    assert_eq!(status, 422);
}

#[tokio::test]
async fn duplicate_twopc_calls_are_idempotent_over_http() {
    let cluster = TestCluster::start(false).await;
    cluster.seed_ride(Region::Phx, "R-100001").await;
    let tx_id = "22222222-2222-4222-8222-222222222222";

    let prepare = json!({"ride_id": "R-100001", "tx_id": tx_id, "operation": "DELETE"});
    let url = format!("{}/2pc/prepare", cluster.phx_url);
    let first: Value = cluster.http.post(&url).json(&prepare).send().await.unwrap().json().await.unwrap();
    let second: Value = cluster.http.post(&url).json(&prepare).send().await.unwrap().json().await.unwrap();
    assert_eq!(first["vote"], "COMMIT");
    assert_eq!(second["vote"], "COMMIT");

    // Abort twice: both report ABORTED, ride ends unlocked.
    let abort = json!({"tx_id": tx_id});
    let url = format!("{}/2pc/abort", cluster.phx_url);
    let first: Value = cluster.http.post(&url).json(&abort).send().await.unwrap().json().await.unwrap();
    let second: Value = cluster.http.post(&url).json(&abort).send().await.unwrap().json().await.unwrap();
    assert_eq!(first["status"], "ABORTED");
    assert_eq!(second["status"], "ABORTED");

    let ride = cluster.phx.get_ride("R-100001").await.unwrap();
    assert!(!ride.locked);
    assert!(ride.handoff_status.is_none());
}

#[tokio::test]
async fn repeated_handoffs_never_duplicate_a_ride() {
    let cluster = TestCluster::start(false).await;
    cluster.seed_ride(Region::Phx, "R-300000").await;

    for (source, target) in [("PHX", "LA"), ("LA", "PHX"), ("PHX", "LA")] {
        let (_, body) = post_handoff(&cluster, "R-300000", source, target).await;
        assert_eq!(body["status"], "SUCCESS");
        assert_eq!(cluster.holders("R-300000").await.len(), 1);
    }
    assert_eq!(cluster.holders("R-300000").await, vec![Region::La]);
}

#[tokio::test]
async fn random_handoff_sequence_preserves_invariants() {
    use rand::Rng;

    let cluster = TestCluster::start(false).await;
    let ride_ids = ["R-700001", "R-700002", "R-700003"];
    for ride_id in ride_ids {
        cluster.seed_ride(Region::Phx, ride_id).await;
    }
    let before = cluster.regional_count().await;

    let mut rng = rand::rng();
    for _ in 0..12 {
        let ride_id = ride_ids[rng.random_range(0..ride_ids.len())];
        let holders = cluster.holders(ride_id).await;
        assert_eq!(holders.len(), 1, "{ride_id} must have exactly one owner");
        let source = holders[0];
        let (_, body) = post_handoff(
            &cluster,
            ride_id,
            source.as_str(),
            source.other().as_str(),
        )
        .await;
        assert_eq!(body["status"], "SUCCESS");
    }

    // Conservation and exclusivity hold after any closed handoff sequence.
    assert_eq!(cluster.regional_count().await, before);
    for ride_id in ride_ids {
        assert_eq!(cluster.holders(ride_id).await.len(), 1);
    }
}

#[tokio::test]
async fn transaction_history_lists_newest_first() {
    let cluster = TestCluster::start(false).await;
    cluster.seed_ride(Region::Phx, "R-100001").await;
    cluster.seed_ride(Region::Phx, "R-100002").await;

    post_handoff(&cluster, "R-100001", "PHX", "LA").await;
    post_handoff(&cluster, "R-100002", "PHX", "LA").await;

    let body: Value = cluster
        .http
        .get(format!(
            "{}/transactions/history?limit=10",
            cluster.coordinator_url
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["total"], 2);
    let transactions = body["transactions"].as_array().unwrap();
    assert_eq!(transactions.len(), 2);
    assert_eq!(transactions[0]["rideId"], "R-100002");
    assert_eq!(transactions[1]["rideId"], "R-100001");

    // Single-transaction lookup round-trips.
    let tx_id = transactions[0]["tx_id"].as_str().unwrap();
    let tx: Value = cluster
        .http
        .get(format!("{}/transactions/{tx_id}", cluster.coordinator_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(tx["status"], "COMMITTED");

    let missing = cluster
        .http
        .get(format!(
            "{}/transactions/00000000-0000-4000-8000-000000000000",
            cluster.coordinator_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status().as_u16(), 404);
}

#[tokio::test]
async fn health_monitor_flags_dead_region() {
    let cluster = TestCluster::start(false).await;

    use fleetmesh::coordinator::{HealthMonitor, ParticipantClient};
    use std::sync::Arc;
    use std::time::Duration;

    let monitor = HealthMonitor::new(
        Arc::new(ParticipantClient::new(&cluster.config).unwrap()),
        cluster.health.clone(),
        Duration::from_millis(50),
        Duration::from_millis(200),
    );

    monitor.probe_all().await;
    assert!(cluster.health.is_healthy(Region::La));

    // Kill the LA server; the next probe round flags it.
    cluster.la_server.abort();
    tokio::time::sleep(Duration::from_millis(50)).await;
    monitor.probe_all().await;
    assert!(!cluster.health.is_healthy(Region::La));
    assert!(cluster.health.is_healthy(Region::Phx));
}
