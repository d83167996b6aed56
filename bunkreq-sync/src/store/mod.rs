//! Generic record store contract
//!
//! Every persisted entity (derived requests, source links, original rows,
//! historical assignments) lives in a named collection of JSON records
//! addressed by string id. The contract is deliberately small: no
//! transactions, no joins, no cascading deletes. Callers order their own
//! writes (links removed before their request, validation before mutation).

pub mod filter;
pub mod memory;
pub mod sqlite;

pub use filter::{Filter, Literal};
pub use memory::MemoryStore;
pub use sqlite::SqliteRecordStore;

use async_trait::async_trait;
use bunkreq_common::config::MAX_PAGE_SIZE;
use bunkreq_common::Result;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;

/// One stored record: id plus its JSON body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub id: String,
    pub data: Map<String, Value>,
}

impl Record {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    /// Non-empty string field; empty strings read as unset
    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.data
            .get(field)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn i64_field(&self, field: &str) -> Option<i64> {
        self.data.get(field).and_then(Value::as_i64)
    }

    pub fn f64_field(&self, field: &str) -> Option<f64> {
        self.data.get(field).and_then(Value::as_f64)
    }

    pub fn bool_field(&self, field: &str) -> Option<bool> {
        self.data.get(field).and_then(Value::as_bool)
    }
}

/// One page of a list query
#[derive(Debug, Clone)]
pub struct ListResult {
    pub items: Vec<Record>,
    /// Total matching records across all pages
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

/// Collection-addressed record storage
///
/// Pages are 1-based. `per_page` is clamped to `1..=MAX_PAGE_SIZE`.
/// Records list in insertion order.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a record. A string `id` in `data` is used as the record id,
    /// otherwise one is generated.
    async fn create(&self, collection: &str, data: Map<String, Value>) -> Result<Record>;

    /// Shallow-merge `patch` into an existing record (`NotFound` if absent)
    async fn update(&self, collection: &str, id: &str, patch: Map<String, Value>)
        -> Result<Record>;

    /// Hard-delete; `false` if no such record
    async fn delete(&self, collection: &str, id: &str) -> Result<bool>;

    async fn get_by_id(&self, collection: &str, id: &str) -> Result<Option<Record>>;

    async fn list(
        &self,
        collection: &str,
        filter: Option<&Filter>,
        page: u32,
        per_page: u32,
    ) -> Result<ListResult>;
}

/// A store bound to one collection name
#[derive(Clone)]
pub struct Collection {
    store: Arc<dyn RecordStore>,
    name: &'static str,
}

impl Collection {
    pub fn new(store: Arc<dyn RecordStore>, name: &'static str) -> Self {
        Self { store, name }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn create(&self, data: Map<String, Value>) -> Result<Record> {
        self.store.create(self.name, data).await
    }

    pub async fn update(&self, id: &str, patch: Map<String, Value>) -> Result<Record> {
        self.store.update(self.name, id, patch).await
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.store.delete(self.name, id).await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<Record>> {
        self.store.get_by_id(self.name, id).await
    }

    pub async fn list(&self, filter: Option<&Filter>, page: u32, per_page: u32) -> Result<ListResult> {
        self.store.list(self.name, filter, page, per_page).await
    }

    /// First record matching `filter`, in insertion order
    pub async fn first(&self, filter: &Filter) -> Result<Option<Record>> {
        let result = self.store.list(self.name, Some(filter), 1, 1).await?;
        Ok(result.items.into_iter().next())
    }

    /// Number of records matching `filter`
    pub async fn count(&self, filter: &Filter) -> Result<u64> {
        Ok(self.store.list(self.name, Some(filter), 1, 1).await?.total)
    }
}

pub(crate) fn clamp_page(page: u32, per_page: u32) -> (u32, u32) {
    (page.max(1), per_page.clamp(1, MAX_PAGE_SIZE))
}

pub(crate) fn take_id(data: &mut Map<String, Value>) -> String {
    match data.remove("id") {
        Some(Value::String(id)) if !id.is_empty() => id,
        _ => uuid::Uuid::new_v4().to_string(),
    }
}

/// Shallow merge; the record id is never patched
pub(crate) fn apply_patch(data: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        if key != "id" {
            data.insert(key, value);
        }
    }
}
