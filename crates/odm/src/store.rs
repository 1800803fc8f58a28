//! Document Store - Storage collaborator used to resolve and persist documents
//!
//! The association runtime never talks to a driver directly. It issues the
//! handful of calls below through [`DocumentStore`]; [`MemoryStore`] is the
//! in-process implementation used by tests and single-process setups.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::document::Record;
use crate::error::{OdmError, OdmResult};

/// Extra equality conditions applied on top of an association's key lookup
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Criteria {
    conditions: Vec<(String, Value)>,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field` to equal `value` (or, for array fields, contain it)
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((field.into(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Check a stored record against every condition
    pub fn matches(&self, record: &Record) -> bool {
        self.conditions
            .iter()
            .all(|(field, value)| field_matches(record.get(field), value))
    }
}

fn field_matches(stored: Option<&Value>, expected: &Value) -> bool {
    match stored {
        Some(Value::Array(items)) if !expected.is_array() => items.contains(expected),
        Some(stored) => stored == expected,
        None => expected.is_null(),
    }
}

/// Storage collaborator consumed by the association runtime
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new root document
    async fn insert(&self, collection: &str, record: Record) -> OdmResult<()>;

    /// Merge `fields` into a stored document
    async fn update(&self, collection: &str, id: &str, fields: Record) -> OdmResult<()>;

    /// Remove a stored document; returns false when it did not exist
    async fn remove(&self, collection: &str, id: &str) -> OdmResult<bool>;

    /// Fetch one document by `_id`
    async fn find_by_id(&self, collection: &str, id: &str) -> OdmResult<Record>;

    /// Fetch the documents whose `_id` is in `ids`, skipping missing ones
    async fn find_by_ids(&self, collection: &str, ids: &[String]) -> OdmResult<Vec<Record>>;

    /// Fetch the documents whose `key` matches any of `values`
    async fn find_by_foreign_key(
        &self,
        collection: &str,
        key: &str,
        values: &[Value],
        criteria: &Criteria,
    ) -> OdmResult<Vec<Record>>;

    /// Count the documents whose `key` matches any of `values`
    async fn count_by_foreign_key(
        &self,
        collection: &str,
        key: &str,
        values: &[Value],
        criteria: &Criteria,
    ) -> OdmResult<usize>;

    /// Atomically add `by` to a numeric field
    async fn increment(&self, collection: &str, id: &str, field: &str, by: i64) -> OdmResult<()>;

    /// Add `value` to an array field unless already present
    async fn add_to_set(&self, collection: &str, id: &str, field: &str, value: Value) -> OdmResult<()>;

    /// Remove every occurrence of `value` from an array field
    async fn pull(&self, collection: &str, id: &str, field: &str, value: &Value) -> OdmResult<()>;
}

/// Statistics about store usage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub collections: usize,
    pub documents: usize,
    pub queries: u64,
    pub writes: u64,
}

/// In-memory document store backed by concurrent maps
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: DashMap<String, Vec<Record>>,
    queries: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get statistics about the store
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            collections: self.collections.len(),
            documents: self.collections.iter().map(|c| c.value().len()).sum(),
            queries: self.queries.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    /// Number of documents stored in `collection`
    pub fn len(&self, collection: &str) -> usize {
        self.collections.get(collection).map(|c| c.len()).unwrap_or(0)
    }

    /// Snapshot of one stored document
    pub fn get(&self, collection: &str, id: &str) -> Option<Record> {
        self.collections
            .get(collection)?
            .iter()
            .find(|record| record_id(record) == Some(id))
            .cloned()
    }

    /// Stored `_id`s of `collection` in insertion order
    pub fn ids(&self, collection: &str) -> Vec<String> {
        self.collections
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .filter_map(|record| record_id(record).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    fn with_record<T>(
        &self,
        collection: &str,
        id: &str,
        apply: impl FnOnce(&mut Record) -> OdmResult<T>,
    ) -> OdmResult<T> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let not_found = || OdmError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        };
        let mut records = self.collections.get_mut(collection).ok_or_else(not_found)?;
        let record = records
            .iter_mut()
            .find(|record| record_id(record) == Some(id))
            .ok_or_else(not_found)?;
        apply(record)
    }

    fn select(&self, collection: &str, filter: impl Fn(&Record) -> bool) -> Vec<Record> {
        self.query();
        self.collections
            .get(collection)
            .map(|records| records.iter().filter(|r| filter(r)).cloned().collect())
            .unwrap_or_default()
    }
}

fn record_id(record: &Record) -> Option<&str> {
    record.get("_id").and_then(Value::as_str)
}

fn matches_key(record: &Record, key: &str, values: &[Value], criteria: &Criteria) -> bool {
    values.iter().any(|value| field_matches(record.get(key), value)) && criteria.matches(record)
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert(&self, collection: &str, record: Record) -> OdmResult<()> {
        let id = record_id(&record)
            .ok_or_else(|| OdmError::Store(format!("Cannot insert into '{}' without _id", collection)))?
            .to_string();
        self.writes.fetch_add(1, Ordering::Relaxed);

        let mut records = self.collections.entry(collection.to_string()).or_default();
        if records.iter().any(|existing| record_id(existing) == Some(id.as_str())) {
            return Err(OdmError::Store(format!(
                "Duplicate _id '{}' in collection '{}'",
                id, collection
            )));
        }
        records.push(record);
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, fields: Record) -> OdmResult<()> {
        self.with_record(collection, id, |record| {
            record.extend(fields);
            Ok(())
        })
    }

    async fn remove(&self, collection: &str, id: &str) -> OdmResult<bool> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let Some(mut records) = self.collections.get_mut(collection) else {
            return Ok(false);
        };
        let before = records.len();
        records.retain(|record| record_id(record) != Some(id));
        Ok(records.len() != before)
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> OdmResult<Record> {
        self.select(collection, |record| record_id(record) == Some(id))
            .into_iter()
            .next()
            .ok_or_else(|| OdmError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })
    }

    async fn find_by_ids(&self, collection: &str, ids: &[String]) -> OdmResult<Vec<Record>> {
        let mut found = self.select(collection, |record| {
            record_id(record).map_or(false, |id| ids.iter().any(|wanted| wanted == id))
        });
        // keep the order the keys were given in
        found.sort_by_key(|record| {
            record_id(record).and_then(|id| ids.iter().position(|wanted| wanted == id))
        });
        Ok(found)
    }

    async fn find_by_foreign_key(
        &self,
        collection: &str,
        key: &str,
        values: &[Value],
        criteria: &Criteria,
    ) -> OdmResult<Vec<Record>> {
        Ok(self.select(collection, |record| matches_key(record, key, values, criteria)))
    }

    async fn count_by_foreign_key(
        &self,
        collection: &str,
        key: &str,
        values: &[Value],
        criteria: &Criteria,
    ) -> OdmResult<usize> {
        Ok(self
            .select(collection, |record| matches_key(record, key, values, criteria))
            .len())
    }

    async fn increment(&self, collection: &str, id: &str, field: &str, by: i64) -> OdmResult<()> {
        self.with_record(collection, id, |record| {
            let current = record.get(field).and_then(Value::as_i64).unwrap_or(0);
            record.insert(field.to_string(), Value::from(current + by));
            Ok(())
        })
    }

    async fn add_to_set(&self, collection: &str, id: &str, field: &str, value: Value) -> OdmResult<()> {
        self.with_record(collection, id, |record| {
            let entry = record
                .entry(field.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            match entry {
                Value::Array(items) => {
                    if !items.contains(&value) {
                        items.push(value);
                    }
                    Ok(())
                }
                Value::Null => {
                    *entry = Value::Array(vec![value]);
                    Ok(())
                }
                _ => Err(OdmError::Store(format!("Field '{}' is not an array", field))),
            }
        })
    }

    async fn pull(&self, collection: &str, id: &str, field: &str, value: &Value) -> OdmResult<()> {
        self.with_record(collection, id, |record| {
            if let Some(Value::Array(items)) = record.get_mut(field) {
                items.retain(|item| item != value);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_insert_find_and_update() {
        let store = MemoryStore::new();
        store
            .insert("people", record(json!({"_id": "p1", "name": "Ann"})))
            .await
            .unwrap();

        assert!(store.insert("people", record(json!({"_id": "p1"}))).await.is_err());
        assert!(store.insert("people", record(json!({"name": "x"}))).await.is_err());

        store
            .update("people", "p1", record(json!({"name": "Bea"})))
            .await
            .unwrap();
        let found = store.find_by_id("people", "p1").await.unwrap();
        assert_eq!(found["name"], json!("Bea"));

        let missing = store.find_by_id("people", "p2").await.unwrap_err();
        assert!(matches!(missing, OdmError::NotFound { .. }));
        assert!(store.update("people", "p2", Record::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_foreign_key_queries_with_criteria() {
        let store = MemoryStore::new();
        for (id, owner, kind) in [("e1", "b1", "EyeBowl"), ("e2", "b1", "Face"), ("e3", "b2", "EyeBowl")] {
            store
                .insert(
                    "eyes",
                    record(json!({"_id": id, "eyeable_id": owner, "eyeable_type": kind})),
                )
                .await
                .unwrap();
        }

        let criteria = Criteria::new().eq("eyeable_type", "EyeBowl");
        let found = store
            .find_by_foreign_key("eyes", "eyeable_id", &[json!("b1"), json!("b2")], &criteria)
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().map(|r| r["_id"].clone()).collect();
        assert_eq!(ids, vec![json!("e1"), json!("e3")]);

        let count = store
            .count_by_foreign_key("eyes", "eyeable_id", &[json!("b1")], &Criteria::new())
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_array_keys_and_set_operations() {
        let store = MemoryStore::new();
        store
            .insert("preferences", record(json!({"_id": "pr1", "person_ids": ["a"]})))
            .await
            .unwrap();

        store.add_to_set("preferences", "pr1", "person_ids", json!("b")).await.unwrap();
        store.add_to_set("preferences", "pr1", "person_ids", json!("b")).await.unwrap();
        let found = store
            .find_by_foreign_key("preferences", "person_ids", &[json!("b")], &Criteria::new())
            .await
            .unwrap();
        assert_eq!(found[0]["person_ids"], json!(["a", "b"]));

        store.pull("preferences", "pr1", "person_ids", &json!("a")).await.unwrap();
        assert_eq!(store.get("preferences", "pr1").unwrap()["person_ids"], json!(["b"]));
    }

    #[tokio::test]
    async fn test_find_by_ids_keeps_key_order_and_counts() {
        let store = MemoryStore::new();
        for id in ["a", "b", "c"] {
            store.insert("posts", record(json!({"_id": id}))).await.unwrap();
        }
        store.increment("posts", "a", "views", 2).await.unwrap();
        store.increment("posts", "a", "views", -1).await.unwrap();
        assert_eq!(store.get("posts", "a").unwrap()["views"], json!(1));

        let ids = vec!["c".to_string(), "missing".to_string(), "a".to_string()];
        let found = store.find_by_ids("posts", &ids).await.unwrap();
        let order: Vec<_> = found.iter().map(|r| r["_id"].clone()).collect();
        assert_eq!(order, vec![json!("c"), json!("a")]);

        assert!(store.remove("posts", "b").await.unwrap());
        assert!(!store.remove("posts", "b").await.unwrap());
        assert_eq!(store.len("posts"), 2);

        let stats = store.stats();
        assert_eq!(stats.collections, 1);
        assert_eq!(stats.documents, 2);
        assert!(stats.queries >= 1);
    }
}
