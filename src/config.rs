// Runtime configuration with defaults and `FLEETMESH_*` environment
// overrides. All durable coordination settings (deadlines, grace windows,
// endpoints, store URIs) live here.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{FleetError, Result};
use crate::model::Region;

/// How the change replicator starts up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorMode {
    /// Copy every regional ride into GLOBAL, then stream.
    InitialAndStream,
    /// Stream only; assume GLOBAL is already seeded.
    StreamOnly,
}

impl ReplicatorMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "initial+stream" => Ok(ReplicatorMode::InitialAndStream),
            "stream_only" => Ok(ReplicatorMode::StreamOnly),
            other => Err(FleetError::Configuration(format!(
                "unknown replicator mode {other:?} (expected \"initial+stream\" or \"stream_only\")"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub listen_addr: String,
    pub coordinator_port: u16,
    pub phx_port: u16,
    pub la_port: u16,
    /// Participant base URLs used by the coordinator.
    pub region_endpoints: HashMap<Region, String>,
    pub health_poll_interval: Duration,
    pub health_probe_timeout: Duration,
    pub prepare_deadline: Duration,
    pub commit_deadline: Duration,
    /// Minimum age before recovery reclaims a stuck transaction.
    pub recovery_grace: Duration,
    pub recovery_scan_interval: Duration,
    pub replicator_mode: ReplicatorMode,
    pub global_store_uri: String,
    pub phx_store_uri: String,
    pub la_store_uri: String,
}

impl Default for FleetConfig {
    fn default() -> Self {
        let mut region_endpoints = HashMap::new();
        region_endpoints.insert(Region::Phx, "http://127.0.0.1:8001".to_string());
        region_endpoints.insert(Region::La, "http://127.0.0.1:8002".to_string());

        Self {
            listen_addr: "0.0.0.0".to_string(),
            coordinator_port: 8000,
            phx_port: 8001,
            la_port: 8002,
            region_endpoints,
            health_poll_interval: Duration::from_secs(5),
            health_probe_timeout: Duration::from_secs(2),
            prepare_deadline: Duration::from_millis(5000),
            commit_deadline: Duration::from_millis(10_000),
            recovery_grace: Duration::from_secs(30),
            recovery_scan_interval: Duration::from_secs(15),
            replicator_mode: ReplicatorMode::InitialAndStream,
            global_store_uri: "mem://global".to_string(),
            phx_store_uri: "mem://phx".to_string(),
            la_store_uri: "mem://la".to_string(),
        }
    }
}

impl FleetConfig {
    /// Defaults overridden by any `FLEETMESH_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_var("FLEETMESH_LISTEN_ADDR") {
            config.listen_addr = v;
        }
        if let Some(v) = env_var("FLEETMESH_COORDINATOR_PORT") {
            config.coordinator_port = parse_u16("FLEETMESH_COORDINATOR_PORT", &v)?;
        }
        if let Some(v) = env_var("FLEETMESH_PHX_PORT") {
            config.phx_port = parse_u16("FLEETMESH_PHX_PORT", &v)?;
        }
        if let Some(v) = env_var("FLEETMESH_LA_PORT") {
            config.la_port = parse_u16("FLEETMESH_LA_PORT", &v)?;
        }
        if let Some(v) = env_var("FLEETMESH_PHX_ENDPOINT") {
            config.region_endpoints.insert(Region::Phx, v);
        }
        if let Some(v) = env_var("FLEETMESH_LA_ENDPOINT") {
            config.region_endpoints.insert(Region::La, v);
        }
        if let Some(v) = env_var("FLEETMESH_HEALTH_POLL_INTERVAL_SECONDS") {
            config.health_poll_interval =
                Duration::from_secs(parse_u64("FLEETMESH_HEALTH_POLL_INTERVAL_SECONDS", &v)?);
        }
        if let Some(v) = env_var("FLEETMESH_PREPARE_DEADLINE_MS") {
            config.prepare_deadline =
                Duration::from_millis(parse_u64("FLEETMESH_PREPARE_DEADLINE_MS", &v)?);
        }
        if let Some(v) = env_var("FLEETMESH_COMMIT_DEADLINE_MS") {
            config.commit_deadline =
                Duration::from_millis(parse_u64("FLEETMESH_COMMIT_DEADLINE_MS", &v)?);
        }
        if let Some(v) = env_var("FLEETMESH_RECOVERY_GRACE_SECONDS") {
            config.recovery_grace =
                Duration::from_secs(parse_u64("FLEETMESH_RECOVERY_GRACE_SECONDS", &v)?);
        }
        if let Some(v) = env_var("FLEETMESH_RECOVERY_SCAN_INTERVAL_SECONDS") {
            config.recovery_scan_interval =
                Duration::from_secs(parse_u64("FLEETMESH_RECOVERY_SCAN_INTERVAL_SECONDS", &v)?);
        }
        if let Some(v) = env_var("FLEETMESH_REPLICATOR_MODE") {
            config.replicator_mode = ReplicatorMode::parse(&v)?;
        }
        if let Some(v) = env_var("FLEETMESH_GLOBAL_STORE_URI") {
            config.global_store_uri = v;
        }
        if let Some(v) = env_var("FLEETMESH_PHX_STORE_URI") {
            config.phx_store_uri = v;
        }
        if let Some(v) = env_var("FLEETMESH_LA_STORE_URI") {
            config.la_store_uri = v;
        }

        Ok(config)
    }

    pub fn endpoint(&self, region: Region) -> Result<&str> {
        self.region_endpoints
            .get(&region)
            .map(String::as_str)
            .ok_or_else(|| {
                FleetError::Configuration(format!("no endpoint configured for region {region}"))
            })
    }

    pub fn store_uri(&self, region: Region) -> &str {
        match region {
            Region::Phx => &self.phx_store_uri,
            Region::La => &self.la_store_uri,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_u16(name: &str, value: &str) -> Result<u16> {
    value
        .parse()
        .map_err(|_| FleetError::Configuration(format!("{name}={value:?} is not a port")))
}

fn parse_u64(name: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| FleetError::Configuration(format!("{name}={value:?} is not an integer")))
}
