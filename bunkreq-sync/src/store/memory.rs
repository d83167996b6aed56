//! In-memory record store
//!
//! Used for tests and dry runs. Honors the same contract as the SQLite
//! store, including the declared unique indexes (the source-link pair is
//! registered by default).

use super::{apply_patch, clamp_page, take_id, Filter, ListResult, Record, RecordStore};
use async_trait::async_trait;
use bunkreq_common::db::SOURCE_LINKS;
use bunkreq_common::{Error, Result};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Default)]
struct MemCollection {
    next_seq: u64,
    rows: BTreeMap<u64, Record>,
    by_id: HashMap<String, u64>,
}

/// Record store backed by process memory
pub struct MemoryStore {
    collections: RwLock<HashMap<String, MemCollection>>,
    unique_indexes: HashMap<String, Vec<Vec<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut unique_indexes = HashMap::new();
        unique_indexes.insert(
            SOURCE_LINKS.to_string(),
            vec![vec!["bunk_request".to_string(), "original_request".to_string()]],
        );
        Self {
            collections: RwLock::new(HashMap::new()),
            unique_indexes,
        }
    }

    /// Declare an additional unique index over `fields` of `collection`
    pub fn with_unique_index(mut self, collection: &str, fields: &[&str]) -> Self {
        self.unique_indexes
            .entry(collection.to_string())
            .or_default()
            .push(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    fn check_unique(
        &self,
        collection: &str,
        coll: &MemCollection,
        id: &str,
        data: &Map<String, Value>,
    ) -> Result<()> {
        let Some(indexes) = self.unique_indexes.get(collection) else {
            return Ok(());
        };

        for fields in indexes {
            let key: Option<Vec<&Value>> = fields
                .iter()
                .map(|f| data.get(f).filter(|v| !v.is_null()))
                .collect();
            // Like SQL, a key with a null component never collides
            let Some(key) = key else { continue };

            let clash = coll.rows.values().any(|row| {
                row.id != id
                    && fields
                        .iter()
                        .zip(key.iter())
                        .all(|(f, v)| row.data.get(f) == Some(*v))
            });
            if clash {
                return Err(Error::UniqueViolation(format!(
                    "{}({})",
                    collection,
                    fields.join(", ")
                )));
            }
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create(&self, collection: &str, mut data: Map<String, Value>) -> Result<Record> {
        let id = take_id(&mut data);
        let mut collections = self.collections.write().await;
        let coll = collections.entry(collection.to_string()).or_default();

        if coll.by_id.contains_key(&id) {
            return Err(Error::UniqueViolation(format!("{}.id = {}", collection, id)));
        }
        self.check_unique(collection, coll, &id, &data)?;

        coll.next_seq += 1;
        let seq = coll.next_seq;
        let record = Record { id: id.clone(), data };
        coll.rows.insert(seq, record.clone());
        coll.by_id.insert(id, seq);
        Ok(record)
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: Map<String, Value>,
    ) -> Result<Record> {
        let mut collections = self.collections.write().await;
        let not_found = || Error::NotFound(format!("{} record {}", collection, id));
        let coll = collections.get_mut(collection).ok_or_else(not_found)?;
        let seq = *coll.by_id.get(id).ok_or_else(not_found)?;

        let mut data = coll
            .rows
            .get(&seq)
            .map(|r| r.data.clone())
            .ok_or_else(not_found)?;
        apply_patch(&mut data, patch);
        self.check_unique(collection, coll, id, &data)?;

        let record = Record {
            id: id.to_string(),
            data,
        };
        coll.rows.insert(seq, record.clone());
        Ok(record)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let mut collections = self.collections.write().await;
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(false);
        };
        match coll.by_id.remove(id) {
            Some(seq) => {
                coll.rows.remove(&seq);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_by_id(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).and_then(|coll| {
            coll.by_id
                .get(id)
                .and_then(|seq| coll.rows.get(seq))
                .cloned()
        }))
    }

    async fn list(
        &self,
        collection: &str,
        filter: Option<&Filter>,
        page: u32,
        per_page: u32,
    ) -> Result<ListResult> {
        let (page, per_page) = clamp_page(page, per_page);
        let collections = self.collections.read().await;

        let matching: Vec<&Record> = match collections.get(collection) {
            Some(coll) => coll
                .rows
                .values()
                .filter(|r| filter.map_or(true, |f| f.matches(&r.id, &r.data)))
                .collect(),
            None => Vec::new(),
        };

        let offset = (page as usize - 1) * per_page as usize;
        let items = matching
            .iter()
            .skip(offset)
            .take(per_page as usize)
            .map(|r| (*r).clone())
            .collect();

        Ok(ListResult {
            items,
            total: matching.len() as u64,
            page,
            per_page,
        })
    }
}
