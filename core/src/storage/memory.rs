//! In-memory document store.
//!
//! Backs tests and single-process deployments. One mutex guards the whole
//! map; persistence operations happen off the packet-processing hot path,
//! so contention stays negligible.

use super::{cmp_values, DocumentStore, Filter, SortOrder, StorageError};

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

/// A [DocumentStore] keeping every collection in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Vec<Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Number of documents currently held in `collection`.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .unwrap()
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

impl DocumentStore for MemoryStore {
    fn insert(&self, collection: &str, doc: Value) -> Result<(), StorageError> {
        if !doc.is_object() {
            return Err(StorageError::Decode("document must be an object".into()));
        }
        let mut collections = self.collections.lock().unwrap();
        collections
            .entry(collection.to_string())
            .or_default()
            .push(doc);
        Ok(())
    }

    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<(&str, SortOrder)>,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<Value>, StorageError> {
        let collections = self.collections.lock().unwrap();
        let mut docs: Vec<Value> = collections
            .get(collection)
            .map(|docs| docs.iter().filter(|d| filter.matches(d)).cloned().collect())
            .unwrap_or_default();

        if let Some((field, order)) = sort {
            docs.sort_by(|a, b| {
                let ord = cmp_values(
                    a.get(field).unwrap_or(&Value::Null),
                    b.get(field).unwrap_or(&Value::Null),
                );
                match order {
                    SortOrder::Asc => ord,
                    SortOrder::Desc => ord.reverse(),
                }
            });
        }

        let docs = docs.into_iter().skip(skip);
        Ok(if limit > 0 {
            docs.take(limit).collect()
        } else {
            docs.collect()
        })
    }

    fn update(&self, collection: &str, id: &str, patch: Value) -> Result<bool, StorageError> {
        let patch = match patch {
            Value::Object(map) => map,
            _ => return Err(StorageError::Decode("patch must be an object".into())),
        };
        let mut collections = self.collections.lock().unwrap();
        if let Some(docs) = collections.get_mut(collection) {
            for doc in docs.iter_mut() {
                if doc.get("id").and_then(Value::as_str) == Some(id) {
                    if let Value::Object(fields) = doc {
                        for (k, v) in patch {
                            fields.insert(k, v);
                        }
                    }
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn core_memory_store_insert_find() {
        let store = MemoryStore::new();
        store
            .insert("things", json!({"id": "a", "port": 80}))
            .unwrap();
        store
            .insert("things", json!({"id": "b", "port": 443}))
            .unwrap();

        let hits = store
            .find("things", &Filter::new().eq("port", 80), None, 0, 0)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["id"], "a");
    }

    #[test]
    fn core_memory_store_range_and_sort() {
        let store = MemoryStore::new();
        for (id, n) in [("a", 3), ("b", 1), ("c", 2)] {
            store.insert("things", json!({"id": id, "n": n})).unwrap();
        }
        let hits = store
            .find(
                "things",
                &Filter::new().gte("n", 2),
                Some(("n", SortOrder::Desc)),
                0,
                0,
            )
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|d| d["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn core_memory_store_update_merges() {
        let store = MemoryStore::new();
        store
            .insert("things", json!({"id": "a", "hidden": false, "n": 1}))
            .unwrap();
        assert!(store
            .update("things", "a", json!({"hidden": true}))
            .unwrap());
        let doc = &store.find("things", &Filter::all(), None, 0, 0).unwrap()[0];
        assert_eq!(doc["hidden"], true);
        assert_eq!(doc["n"], 1);
        assert!(!store.update("things", "zz", json!({"x": 1})).unwrap());
    }
}
