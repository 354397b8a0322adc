//! Document store contract.
//!
//! Finalized connections, messages, sessions, rules, and services are
//! persisted through this thin adapter. The core depends on nothing beyond
//! `insert`, `find`, and `update` over JSON documents plus core-side
//! monotonic id generation, so any document database can be bound here. An
//! in-memory implementation ([MemoryStore]) is provided for tests and
//! embedding.

pub mod memory;

pub use memory::MemoryStore;

use serde_json::Value;
use thiserror::Error;

/// Collection names used by the core.
pub mod collections {
    pub const CONNECTIONS: &str = "connections";
    pub const MESSAGES: &str = "messages";
    pub const SESSIONS: &str = "sessions";
    pub const RULES: &str = "rules";
    pub const SERVICES: &str = "services";
    pub const SEARCHES: &str = "searches";
}

/// Errors raised by a document store backend.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage backend: {0}")]
    Backend(String),

    #[error("document decode: {0}")]
    Decode(String),
}

/// Sort order for [DocumentStore::find].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// A single filter condition over a top-level document field.
#[derive(Debug, Clone)]
pub enum Cond {
    /// Field equals value.
    Eq(Value),
    /// Field is numerically/lexicographically >= value.
    Gte(Value),
    /// Field is numerically/lexicographically <= value.
    Lte(Value),
    /// Field equals one of the values.
    In(Vec<Value>),
    /// Field is an array containing the value.
    Contains(Value),
}

/// A conjunction of field conditions.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    conds: Vec<(String, Cond)>,
}

impl Filter {
    /// The filter matching every document.
    pub fn all() -> Self {
        Filter::default()
    }

    pub fn new() -> Self {
        Filter::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conds.push((field.to_string(), Cond::Eq(value.into())));
        self
    }

    pub fn gte(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conds.push((field.to_string(), Cond::Gte(value.into())));
        self
    }

    pub fn lte(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conds.push((field.to_string(), Cond::Lte(value.into())));
        self
    }

    pub fn within(mut self, field: &str, values: Vec<Value>) -> Self {
        self.conds.push((field.to_string(), Cond::In(values)));
        self
    }

    pub fn contains(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conds
            .push((field.to_string(), Cond::Contains(value.into())));
        self
    }

    pub fn conds(&self) -> &[(String, Cond)] {
        &self.conds
    }

    /// Returns `true` if `doc` satisfies every condition.
    pub fn matches(&self, doc: &Value) -> bool {
        self.conds.iter().all(|(field, cond)| {
            let value = doc.get(field).unwrap_or(&Value::Null);
            match cond {
                Cond::Eq(want) => value == want,
                Cond::Gte(want) => cmp_values(value, want) >= std::cmp::Ordering::Equal,
                Cond::Lte(want) => cmp_values(value, want) <= std::cmp::Ordering::Equal,
                Cond::In(wants) => wants.iter().any(|w| w == value),
                Cond::Contains(want) => value
                    .as_array()
                    .map(|arr| arr.iter().any(|v| v == want))
                    .unwrap_or(false),
            }
        })
    }
}

/// Compares two JSON scalars: numbers numerically, everything else through
/// string rendering.
pub(crate) fn cmp_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => {
            let xs = a.as_str().map(str::to_string).unwrap_or_else(|| a.to_string());
            let ys = b.as_str().map(str::to_string).unwrap_or_else(|| b.to_string());
            xs.cmp(&ys)
        }
    }
}

/// The document store contract.
///
/// Documents are JSON objects carrying their identifier in the `id` field.
pub trait DocumentStore: Send + Sync {
    /// Inserts a document into `collection`.
    fn insert(&self, collection: &str, doc: Value) -> Result<(), StorageError>;

    /// Returns documents of `collection` matching `filter`, optionally
    /// sorted by a top-level field, skipping `skip` and returning at most
    /// `limit` documents (`0` = no limit).
    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<(&str, SortOrder)>,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<Value>, StorageError>;

    /// Merges `patch` (a JSON object) into the document of `collection`
    /// with the given id. Returns `false` if no such document exists.
    fn update(&self, collection: &str, id: &str, patch: Value) -> Result<bool, StorageError>;
}

/// Convenience: find one document by id.
pub fn find_by_id(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
) -> Result<Option<Value>, StorageError> {
    let docs = store.find(collection, &Filter::new().eq("id", id), None, 0, 1)?;
    Ok(docs.into_iter().next())
}
