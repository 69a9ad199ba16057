// # Embedded Document Engine
//
// In-process replacement for the regional document stores: named engines
// holding collections of JSON documents keyed by `_id`, with an optional
// unique secondary key, atomic multi-step mutations under a per-collection
// write lock, and a change feed per collection.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::model::HealthState;

use super::changes::{ChangeFeed, ChangeOp, ChangeSubscription, ResumeToken};

/// A single comparison against one document field.
#[derive(Debug, Clone)]
pub enum Predicate {
    Eq(Value),
    Ne(Value),
    Gte(Value),
    Lte(Value),
    /// Strictly older than the given value (used for staleness scans).
    Lt(Value),
    In(Vec<Value>),
}

/// Conjunction of field predicates. An empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct DocFilter {
    clauses: Vec<(String, Predicate)>,
}

impl DocFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, predicate: Predicate) -> Self {
        self.clauses.push((name.into(), predicate));
        self
    }

    pub fn eq(self, name: impl Into<String>, value: Value) -> Self {
        self.field(name, Predicate::Eq(value))
    }

    pub fn matches(&self, doc: &Value) -> bool {
        self.clauses.iter().all(|(name, predicate)| {
            let field = doc.get(name).unwrap_or(&Value::Null);
            match predicate {
                Predicate::Eq(v) => values_equal(field, v),
                Predicate::Ne(v) => !values_equal(field, v),
                Predicate::Gte(v) => {
                    matches!(compare_values(field, v), Some(CmpOrdering::Greater | CmpOrdering::Equal))
                }
                Predicate::Lte(v) => {
                    matches!(compare_values(field, v), Some(CmpOrdering::Less | CmpOrdering::Equal))
                }
                Predicate::Lt(v) => matches!(compare_values(field, v), Some(CmpOrdering::Less)),
                Predicate::In(vs) => vs.iter().any(|v| values_equal(field, v)),
            }
        })
    }
}

/// Sort direction for scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    // Numeric equality across integer/float representations.
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    false
}

/// Total-order comparison over the value shapes this store holds. Strings
/// that parse as RFC-3339 timestamps compare as instants.
pub fn compare_values(a: &Value, b: &Value) -> Option<CmpOrdering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => {
            match (
                DateTime::parse_from_rfc3339(x),
                DateTime::parse_from_rfc3339(y),
            ) {
                (Ok(tx), Ok(ty)) => Some(tx.cmp(&ty)),
                _ => Some(x.cmp(y)),
            }
        }
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(CmpOrdering::Equal),
        _ => None,
    }
}

/// One collection of documents.
pub struct Collection {
    name: String,
    unique_key: Option<String>,
    inner: RwLock<CollectionInner>,
    feed: ChangeFeed,
    last_write: RwLock<Option<DateTime<Utc>>>,
}

struct CollectionInner {
    docs: HashMap<String, Value>,
    /// unique-key value -> `_id`, maintained when `unique_key` is set.
    unique_index: HashMap<String, String>,
}

impl Collection {
    fn new(name: impl Into<String>, unique_key: Option<&str>) -> Self {
        Self {
            name: name.into(),
            unique_key: unique_key.map(str::to_owned),
            inner: RwLock::new(CollectionInner {
                docs: HashMap::new(),
                unique_index: HashMap::new(),
            }),
            feed: ChangeFeed::new(),
            last_write: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn unique_value(&self, doc: &Value) -> Option<String> {
        let key = self.unique_key.as_deref()?;
        doc.get(key).and_then(Value::as_str).map(str::to_owned)
    }

    fn touch(&self) {
        *self.last_write.write() = Some(Utc::now());
    }

    /// Insert a document. An `_id` is assigned when absent; the caller's
    /// `_id` is preserved otherwise. Fails with `Conflict` on a duplicate
    /// `_id` or unique-key value.
    pub fn insert(&self, mut doc: Value) -> Result<String> {
        let object = doc
            .as_object_mut()
            .ok_or_else(|| FleetError::Store("document is not an object".into()))?;

        let id = match object.get("_id").and_then(Value::as_str) {
            Some(existing) => existing.to_owned(),
            None => {
                let generated = Uuid::new_v4().to_string();
                object.insert("_id".into(), Value::String(generated.clone()));
                generated
            }
        };

        let mut inner = self.inner.write();
        if inner.docs.contains_key(&id) {
            return Err(FleetError::Conflict(format!(
                "{}: duplicate _id {id}",
                self.name
            )));
        }
        if let Some(unique) = self.unique_value(&doc) {
            if inner.unique_index.contains_key(&unique) {
                return Err(FleetError::Conflict(format!(
                    "{}: duplicate {} {unique}",
                    self.name,
                    self.unique_key.as_deref().unwrap_or("key")
                )));
            }
            inner.unique_index.insert(unique, id.clone());
        }
        inner.docs.insert(id.clone(), doc.clone());
        drop(inner);

        self.touch();
        self.feed.publish(ChangeOp::Insert, id.clone(), Some(doc));
        Ok(id)
    }

    pub fn find_one(&self, filter: &DocFilter) -> Option<Value> {
        let inner = self.inner.read();
        inner.docs.values().find(|doc| filter.matches(doc)).cloned()
    }

    pub fn find_by_id(&self, id: &str) -> Option<Value> {
        self.inner.read().docs.get(id).cloned()
    }

    pub fn find_many(
        &self,
        filter: &DocFilter,
        skip: usize,
        limit: Option<usize>,
        sort: Option<(&str, SortOrder)>,
    ) -> Vec<Value> {
        let inner = self.inner.read();
        let mut matches: Vec<Value> = inner
            .docs
            .values()
            .filter(|doc| filter.matches(doc))
            .cloned()
            .collect();
        drop(inner);

        if let Some((field, order)) = sort {
            matches.sort_by(|a, b| {
                let fa = a.get(field).unwrap_or(&Value::Null);
                let fb = b.get(field).unwrap_or(&Value::Null);
                let cmp = compare_values(fa, fb).unwrap_or(CmpOrdering::Equal);
                match order {
                    SortOrder::Ascending => cmp,
                    SortOrder::Descending => cmp.reverse(),
                }
            });
        }

        let iter = matches.into_iter().skip(skip);
        match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        }
    }

    pub fn count(&self, filter: &DocFilter) -> usize {
        self.inner
            .read()
            .docs
            .values()
            .filter(|doc| filter.matches(doc))
            .count()
    }

    fn apply_set(doc: &mut Value, set: &Map<String, Value>) {
        if let Some(object) = doc.as_object_mut() {
            for (field, value) in set {
                object.insert(field.clone(), value.clone());
            }
        }
    }

    /// Set fields on every matching document. Returns the matched count.
    pub fn update_many(&self, filter: &DocFilter, set: &Map<String, Value>) -> usize {
        let mut updated = Vec::new();
        {
            let mut inner = self.inner.write();
            let ids: Vec<String> = inner
                .docs
                .iter()
                .filter(|(_, doc)| filter.matches(doc))
                .map(|(id, _)| id.clone())
                .collect();
            for id in ids {
                if let Some(doc) = inner.docs.get_mut(&id) {
                    Self::apply_set(doc, set);
                    updated.push((id, doc.clone()));
                }
            }
        }

        let matched = updated.len();
        if matched > 0 {
            self.touch();
            for (id, doc) in updated {
                self.feed.publish(ChangeOp::Update, id, Some(doc));
            }
        }
        matched
    }

    /// Atomically update the first matching document, returning the before-
    /// or after-image.
    pub fn find_one_and_update(
        &self,
        filter: &DocFilter,
        set: &Map<String, Value>,
        return_after: bool,
    ) -> Option<Value> {
        let (id, before, after) = {
            let mut inner = self.inner.write();
            let id = inner
                .docs
                .iter()
                .find(|(_, doc)| filter.matches(doc))
                .map(|(id, _)| id.clone())?;
            let doc = inner.docs.get_mut(&id)?;
            let before = doc.clone();
            Self::apply_set(doc, set);
            (id, before, doc.clone())
        };

        self.touch();
        self.feed.publish(ChangeOp::Update, id, Some(after.clone()));
        Some(if return_after { after } else { before })
    }

    /// Atomically apply an arbitrary mutation to the first matching
    /// document, returning the before- or after-image. Covers mutations a
    /// flat field-set cannot express, such as appending to an array field.
    pub fn modify_one<F>(&self, filter: &DocFilter, mutate: F, return_after: bool) -> Option<Value>
    where
        F: FnOnce(&mut Value),
    {
        let (id, before, after) = {
            let mut inner = self.inner.write();
            let id = inner
                .docs
                .iter()
                .find(|(_, doc)| filter.matches(doc))
                .map(|(id, _)| id.clone())?;
            let doc = inner.docs.get_mut(&id)?;
            let before = doc.clone();
            mutate(doc);
            (id, before, doc.clone())
        };

        self.touch();
        self.feed.publish(ChangeOp::Update, id, Some(after.clone()));
        Some(if return_after { after } else { before })
    }

    /// Replace the document with the given `_id`, inserting when absent and
    /// `upsert` is set. Returns whether a document existed before.
    pub fn replace_by_id(&self, id: &str, mut doc: Value, upsert: bool) -> Result<bool> {
        if let Some(object) = doc.as_object_mut() {
            object.insert("_id".into(), Value::String(id.to_owned()));
        }

        let (existed, op) = {
            let mut inner = self.inner.write();
            let existed = inner.docs.contains_key(id);
            if !existed && !upsert {
                return Ok(false);
            }
            if let Some(old) = inner.docs.get(id).cloned() {
                if let Some(unique) = self.unique_value(&old) {
                    inner.unique_index.remove(&unique);
                }
            }
            if let Some(unique) = self.unique_value(&doc) {
                inner.unique_index.insert(unique, id.to_owned());
            }
            inner.docs.insert(id.to_owned(), doc.clone());
            (existed, if existed { ChangeOp::Update } else { ChangeOp::Insert })
        };

        self.touch();
        self.feed.publish(op, id.to_owned(), Some(doc));
        Ok(existed)
    }

    pub fn delete_one(&self, filter: &DocFilter) -> usize {
        let removed = {
            let mut inner = self.inner.write();
            let id = inner
                .docs
                .iter()
                .find(|(_, doc)| filter.matches(doc))
                .map(|(id, _)| id.clone());
            match id {
                Some(id) => {
                    let doc = inner.docs.remove(&id);
                    if let Some(doc) = &doc {
                        if let Some(unique) = self.unique_value(doc) {
                            inner.unique_index.remove(&unique);
                        }
                    }
                    Some(id)
                }
                None => None,
            }
        };

        match removed {
            Some(id) => {
                self.touch();
                self.feed.publish(ChangeOp::Delete, id, None);
                1
            }
            None => 0,
        }
    }

    pub fn delete_many(&self, filter: &DocFilter) -> usize {
        let removed: Vec<String> = {
            let mut inner = self.inner.write();
            let ids: Vec<String> = inner
                .docs
                .iter()
                .filter(|(_, doc)| filter.matches(doc))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                if let Some(doc) = inner.docs.remove(id) {
                    if let Some(unique) = self.unique_value(&doc) {
                        inner.unique_index.remove(&unique);
                    }
                }
            }
            ids
        };

        let count = removed.len();
        if count > 0 {
            self.touch();
            for id in removed {
                self.feed.publish(ChangeOp::Delete, id, None);
            }
        }
        count
    }

    pub fn subscribe(&self, resume_after: Option<ResumeToken>) -> ChangeSubscription {
        self.feed.subscribe(resume_after)
    }

    pub fn last_write(&self) -> Option<DateTime<Utc>> {
        *self.last_write.read()
    }
}

/// Health snapshot of an engine, shaped for the participant health probe.
#[derive(Debug, Clone)]
pub struct StoreHealth {
    pub status: HealthState,
    pub primary: String,
    pub replication_lag_ms: Option<u64>,
    pub last_write: Option<DateTime<Utc>>,
}

/// A named in-process store instance. Two handles resolved from the same
/// URI share the same engine.
pub struct MemoryEngine {
    name: String,
    primary: String,
    started_at: Instant,
    collections: DashMap<String, Arc<Collection>>,
}

impl MemoryEngine {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let primary = format!("{name}-primary-0");
        Self {
            name,
            primary,
            started_at: Instant::now(),
            collections: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get or create a collection. The unique key is fixed by the first
    /// caller; later callers must agree.
    pub fn collection(&self, name: &str, unique_key: Option<&str>) -> Arc<Collection> {
        self.collections
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(Collection::new(name, unique_key)))
            .clone()
    }

    pub fn health(&self) -> StoreHealth {
        let last_write = self
            .collections
            .iter()
            .filter_map(|entry| entry.value().last_write())
            .max();
        StoreHealth {
            status: HealthState::Healthy,
            primary: self.primary.clone(),
            replication_lag_ms: Some(0),
            last_write,
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rides() -> Arc<Collection> {
        let engine = MemoryEngine::new("test");
        engine.collection("rides", Some("rideId"))
    }

    #[test]
    fn test_insert_assigns_id_and_indexes() {
        let col = rides();
        let id = col.insert(json!({"rideId": "R-1", "fare": 10.0})).unwrap();
        assert!(!id.is_empty());
        let found = col
            .find_one(&DocFilter::new().eq("rideId", json!("R-1")))
            .unwrap();
        assert_eq!(found["_id"], json!(id));
    }

    #[test]
    fn test_insert_duplicate_unique_key_conflicts() {
        let col = rides();
        col.insert(json!({"rideId": "R-1"})).unwrap();
        let err = col.insert(json!({"rideId": "R-1"})).unwrap_err();
        assert!(matches!(err, FleetError::Conflict(_)));
    }

    #[test]
    fn test_duplicate_allowed_without_unique_key() {
        let engine = MemoryEngine::new("test");
        let col = engine.collection("rides", None);
        col.insert(json!({"rideId": "R-1"})).unwrap();
        assert!(col.insert(json!({"rideId": "R-1"})).is_ok());
    }

    #[test]
    fn test_delete_releases_unique_key() {
        let col = rides();
        col.insert(json!({"rideId": "R-1"})).unwrap();
        let deleted = col.delete_one(&DocFilter::new().eq("rideId", json!("R-1")));
        assert_eq!(deleted, 1);
        assert!(col.insert(json!({"rideId": "R-1"})).is_ok());
    }

    #[test]
    fn test_find_one_and_update_atomicity_fields() {
        let col = rides();
        col.insert(json!({"rideId": "R-1", "locked": false})).unwrap();

        let mut set = Map::new();
        set.insert("locked".into(), json!(true));
        set.insert("transaction_id".into(), json!("tx-1"));

        let after = col
            .find_one_and_update(
                &DocFilter::new().eq("rideId", json!("R-1")).eq("locked", json!(false)),
                &set,
                true,
            )
            .unwrap();
        assert_eq!(after["locked"], json!(true));
        assert_eq!(after["transaction_id"], json!("tx-1"));

        // A second conditional lock attempt must not match.
        let second = col.find_one_and_update(
            &DocFilter::new().eq("rideId", json!("R-1")).eq("locked", json!(false)),
            &set,
            true,
        );
        assert!(second.is_none());
    }

    #[test]
    fn test_update_many_returns_matched_count() {
        let col = rides();
        col.insert(json!({"rideId": "R-1", "transaction_id": "tx-9"})).unwrap();
        col.insert(json!({"rideId": "R-2", "transaction_id": "tx-9"})).unwrap();
        col.insert(json!({"rideId": "R-3", "transaction_id": null})).unwrap();

        let mut set = Map::new();
        set.insert("transaction_id".into(), Value::Null);
        let matched = col.update_many(
            &DocFilter::new().eq("transaction_id", json!("tx-9")),
            &set,
        );
        assert_eq!(matched, 2);
    }

    #[test]
    fn test_sort_by_timestamp_descending() {
        let col = rides();
        col.insert(json!({"rideId": "R-1", "timestamp": "2026-01-01T00:00:00Z"}))
            .unwrap();
        col.insert(json!({"rideId": "R-2", "timestamp": "2026-03-01T00:00:00Z"}))
            .unwrap();
        col.insert(json!({"rideId": "R-3", "timestamp": "2026-02-01T00:00:00Z"}))
            .unwrap();

        let docs = col.find_many(
            &DocFilter::new(),
            0,
            None,
            Some(("timestamp", SortOrder::Descending)),
        );
        let ids: Vec<&str> = docs.iter().map(|d| d["rideId"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["R-2", "R-3", "R-1"]);
    }

    #[test]
    fn test_range_predicates() {
        let col = rides();
        col.insert(json!({"rideId": "R-1", "fare": 5.0})).unwrap();
        col.insert(json!({"rideId": "R-2", "fare": 25.0})).unwrap();
        col.insert(json!({"rideId": "R-3", "fare": 50.0})).unwrap();

        let filter = DocFilter::new()
            .field("fare", Predicate::Gte(json!(10.0)))
            .field("fare", Predicate::Lte(json!(40.0)));
        assert_eq!(col.count(&filter), 1);
    }

    #[test]
    fn test_replace_by_id_upsert() {
        let engine = MemoryEngine::new("test");
        let col = engine.collection("rides", None);

        let existed = col
            .replace_by_id("k1", json!({"rideId": "R-1", "fare": 1.0}), true)
            .unwrap();
        assert!(!existed);

        let existed = col
            .replace_by_id("k1", json!({"rideId": "R-1", "fare": 2.0}), true)
            .unwrap();
        assert!(existed);
        assert_eq!(col.find_by_id("k1").unwrap()["fare"], json!(2.0));
    }

    #[test]
    fn test_null_equality_matches_absent_field() {
        let col = rides();
        col.insert(json!({"rideId": "R-1"})).unwrap();
        let found = col.find_one(&DocFilter::new().eq("transaction_id", Value::Null));
        assert!(found.is_some());
    }
}
