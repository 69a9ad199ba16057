// Regional participant API tests: CRUD round-trips, validation boundaries,
// filtered listings, stats, and the health probe shape.

mod common;

use chrono::Utc;
use common::{ride_payload, TestCluster};
use fleetmesh::model::Region;
use serde_json::{json, Value};

#[tokio::test]
async fn create_then_get_round_trips() {
    let cluster = TestCluster::start(false).await;

    let payload = ride_payload("R-100001", Region::Phx, Utc::now());
    let response = cluster
        .http
        .post(format!("{}/rides", cluster.phx_url))
        .json(&payload)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 201);
    let created: Value = response.json().await.unwrap();

    let fetched: Value = cluster
        .http
        .get(format!("{}/rides/R-100001", cluster.phx_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(created, fetched);
    assert_eq!(fetched["rideId"], "R-100001");
    assert_eq!(fetched["locked"], false);
    assert_eq!(fetched["handoff_status"], Value::Null);
}

#[tokio::test]
async fn duplicate_create_is_409() {
    let cluster = TestCluster::start(false).await;
    let payload = ride_payload("R-100001", Region::Phx, Utc::now());

    let url = format!("{}/rides", cluster.phx_url);
    assert_eq!(
        cluster.http.post(&url).json(&payload).send().await.unwrap().status().as_u16(),
        201
    );
    assert_eq!(
        cluster.http.post(&url).json(&payload).send().await.unwrap().status().as_u16(),
        409
    );
}

#[tokio::test]
async fn validation_boundaries() {
    let cluster = TestCluster::start(false).await;
    let url = format!("{}/rides", cluster.phx_url);

    let send = |payload: Value| {
        let http = cluster.http.clone();
        let url = url.clone();
        async move { http.post(&url).json(&payload).send().await.unwrap().status().as_u16() }
    };

    let mut base = serde_json::to_value(ride_payload("R-100001", Region::Phx, Utc::now())).unwrap();

    // Extreme coordinates are legal.
    base["startLocation"] = json!({"lat": 90.0, "lon": -180.0});
    base["rideId"] = json!("R-100002");
    assert_eq!(send(base.clone()).await, 201);

    // Just past the pole is not.
    base["startLocation"] = json!({"lat": 90.0001, "lon": 0.0});
    base["rideId"] = json!("R-100003");
    assert_eq!(send(base.clone()).await, 422);
    base["startLocation"] = json!({"lat": 0.0, "lon": -180.0001});
    assert_eq!(send(base.clone()).await, 422);
    base["startLocation"] = json!({"lat": 33.0, "lon": -112.0});

    // Zero fare is the accepted special case; below the floor is not.
    base["fare"] = json!(0.0);
    base["rideId"] = json!("R-100004");
    assert_eq!(send(base.clone()).await, 201);
    base["fare"] = json!(4.99);
    base["rideId"] = json!("R-100005");
    assert_eq!(send(base.clone()).await, 422);
    base["fare"] = json!(1000.01);
    assert_eq!(send(base.clone()).await, 422);
    base["fare"] = json!(20.0);

    // Identifier formats.
    base["rideId"] = json!("RX-1");
    assert_eq!(send(base.clone()).await, 422);
    base["rideId"] = json!("R-100006");
    base["vehicleId"] = json!("CAR-1");
    assert_eq!(send(base.clone()).await, 422);
}

#[tokio::test]
async fn update_validates_and_applies() {
    let cluster = TestCluster::start(false).await;
    cluster.seed_ride(Region::Phx, "R-100001").await;
    let url = format!("{}/rides/R-100001", cluster.phx_url);

    // Empty body is a 400.
    let response = cluster.http.put(&url).json(&json!({})).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 400);

    // Partial update applies and rounds the fare.
    let response = cluster
        .http
        .put(&url)
        .json(&json!({"fare": 52.987, "status": "COMPLETED"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let updated: Value = response.json().await.unwrap();
    assert_eq!(updated["fare"], 52.99);
    assert_eq!(updated["status"], "COMPLETED");

    // Unknown ride is a 404.
    let response = cluster
        .http
        .put(format!("{}/rides/R-999999", cluster.phx_url))
        .json(&json!({"fare": 10.0}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn delete_returns_204_then_404() {
    let cluster = TestCluster::start(false).await;
    cluster.seed_ride(Region::Phx, "R-100001").await;
    let url = format!("{}/rides/R-100001", cluster.phx_url);

    assert_eq!(cluster.http.delete(&url).send().await.unwrap().status().as_u16(), 204);
    assert_eq!(cluster.http.delete(&url).send().await.unwrap().status().as_u16(), 404);
    assert_eq!(cluster.http.get(&url).send().await.unwrap().status().as_u16(), 404);
}

#[tokio::test]
async fn list_filters_and_paginates() {
    let cluster = TestCluster::start(false).await;
    for i in 0..5 {
        cluster.seed_ride(Region::Phx, &format!("R-60000{i}")).await;
    }

    let rides: Vec<Value> = cluster
        .http
        .get(format!("{}/rides?limit=3", cluster.phx_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rides.len(), 3);

    let rides: Vec<Value> = cluster
        .http
        .get(format!("{}/rides?skip=4&limit=10", cluster.phx_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rides.len(), 1);

    let rides: Vec<Value> = cluster
        .http
        .get(format!(
            "{}/rides?min_fare=100&max_fare=200",
            cluster.phx_url
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(rides.is_empty());

    let rides: Vec<Value> = cluster
        .http
        .get(format!("{}/rides?status=IN_PROGRESS", cluster.phx_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rides.len(), 5);
}

#[tokio::test]
async fn stats_endpoint_aggregates() {
    let cluster = TestCluster::start(false).await;
    cluster.seed_ride(Region::La, "R-100001").await;
    cluster.seed_ride(Region::La, "R-100002").await;

    let stats: Value = cluster
        .http
        .get(format!("{}/stats", cluster.la_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["region"], "LA");
    assert_eq!(stats["total_rides"], 2);
    assert_eq!(stats["active_rides"], 2);
    assert_eq!(stats["total_revenue"], 55.0);
    assert_eq!(stats["avg_fare"], 27.5);
}

#[tokio::test]
async fn health_probe_has_contract_fields() {
    let cluster = TestCluster::start(false).await;
    let health: Value = cluster
        .http
        .get(format!("{}/health", cluster.phx_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["region"], "PHX");
    assert!(health["mongodb_primary"].is_string());
    assert!(health["mongodb_status"].is_string());
    assert!(health["uptime_seconds"].is_u64());
}
