//! bunkreq-sync library interface
//!
//! Provenance tracking and incremental synchronization of derived bunk
//! requests. Exposes the engine for the CLI and for integration tests.

pub mod db;
pub mod models;
pub mod pagination;
pub mod services;
pub mod store;
pub mod utils;

use bunkreq_common::{Result, SyncConfig};
use db::{OriginalRequestStore, ProvenanceStore, RequestStore};
use services::{
    HistoricalLookup, MergeSplitCoordinator, PartialInvalidationHandler, RequestParser,
    StoreHistoricalLookup, SyncPipeline,
};
use std::path::Path;
use std::sync::Arc;
use store::{RecordStore, SqliteRecordStore};

/// Engine state shared by every command
#[derive(Clone)]
pub struct SyncEngine {
    pub store: Arc<dyn RecordStore>,
    pub requests: RequestStore,
    pub provenance: ProvenanceStore,
    pub originals: OriginalRequestStore,
    pub invalidation: PartialInvalidationHandler,
    pub merge_split: MergeSplitCoordinator,
    pub config: SyncConfig,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn RecordStore>, config: SyncConfig) -> Self {
        let requests = RequestStore::new(store.clone()).with_page_size(config.page_size);
        let provenance = ProvenanceStore::new(store.clone()).with_page_size(config.page_size);
        Self {
            originals: OriginalRequestStore::new(store.clone()),
            invalidation: PartialInvalidationHandler::new(requests.clone(), provenance.clone()),
            merge_split: MergeSplitCoordinator::new(requests.clone(), provenance.clone()),
            requests,
            provenance,
            store,
            config,
        }
    }

    /// Engine over an on-disk SQLite database (created if missing)
    pub async fn open(db_path: &Path, config: SyncConfig) -> Result<Self> {
        let store = SqliteRecordStore::open(db_path)
            .await?
            .with_max_lock_wait(config.max_lock_wait_ms);
        Ok(Self::new(Arc::new(store), config))
    }

    /// Historical lookups over this engine's store
    pub fn store_lookup(&self) -> Arc<dyn HistoricalLookup> {
        Arc::new(StoreHistoricalLookup::new(self.store.clone()))
    }

    pub fn pipeline(
        &self,
        parser: Arc<dyn RequestParser>,
        lookup: Arc<dyn HistoricalLookup>,
    ) -> SyncPipeline {
        SyncPipeline::new(self.store.clone(), parser, lookup, &self.config)
    }
}
