// Process-wide engine registry. Store URIs of the form `mem://<name>` all
// resolve to the same engine instance for a given name, so the coordinator,
// participants, and replicator can be configured independently yet share
// state the way separate clients of one replica set would.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::error::{FleetError, Result};

use super::memory::MemoryEngine;

static ENGINES: Lazy<DashMap<String, Arc<MemoryEngine>>> = Lazy::new(DashMap::new);

const SCHEME: &str = "mem://";

/// Resolve a store URI to its engine, creating the engine on first use.
pub fn engine_for_uri(uri: &str) -> Result<Arc<MemoryEngine>> {
    let name = uri
        .strip_prefix(SCHEME)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| {
            FleetError::Configuration(format!(
                "store uri {uri:?} is not of the form {SCHEME}<name>"
            ))
        })?;

    Ok(ENGINES
        .entry(name.to_owned())
        .or_insert_with(|| Arc::new(MemoryEngine::new(name)))
        .clone())
}
