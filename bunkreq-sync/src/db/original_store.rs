//! Original request store: imported source rows and change detection

use crate::models::{ChangeKind, OriginalRequest, SourceRow};
use crate::store::{Collection, RecordStore};
use bunkreq_common::db::ORIGINAL_REQUESTS;
use bunkreq_common::hash::content_hash;
use bunkreq_common::Result;
use serde_json::{Map, Value};
use std::sync::Arc;

#[derive(Clone)]
pub struct OriginalRequestStore {
    originals: Collection,
}

impl OriginalRequestStore {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            originals: Collection::new(store, ORIGINAL_REQUESTS),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<OriginalRequest>> {
        match self.originals.get_by_id(id).await? {
            Some(record) => Ok(Some(OriginalRequest::from_record(&record)?)),
            None => Ok(None),
        }
    }

    /// Stored row with the same natural key as `row`
    pub async fn find(&self, row: &SourceRow) -> Result<Option<OriginalRequest>> {
        match self.originals.first(&row.natural_key_filter()).await? {
            Some(record) => Ok(Some(OriginalRequest::from_record(&record)?)),
            None => Ok(None),
        }
    }

    /// Store an imported row and classify it against the previous import.
    ///
    /// **Algorithm:**
    /// 1. Hash the trimmed content (SHA-256)
    /// 2. No row with this natural key: create it, `New`
    /// 3. Same hash: leave it, `Unchanged`
    /// 4. Different hash: overwrite content and hash in place (the id, and
    ///    so every link to it, is kept), `Changed`
    pub async fn upsert(&self, row: &SourceRow) -> Result<(OriginalRequest, ChangeKind)> {
        let hash = content_hash(&row.content);
        let now = chrono::Utc::now().to_rfc3339();

        match self.find(row).await? {
            None => {
                let mut original = OriginalRequest {
                    id: String::new(),
                    requester_id: row.requester_id,
                    field: row.field.clone(),
                    session_id: row.session_id,
                    year: row.year,
                    content: row.content.clone(),
                    content_hash: hash,
                    imported_at: now,
                };
                let record = self.originals.create(original.to_fields()).await?;
                original.id = record.id;

                tracing::debug!(
                    original_request = %original.id,
                    requester_id = row.requester_id,
                    field = %row.field,
                    "New source row"
                );
                Ok((original, ChangeKind::New))
            }
            Some(existing) if existing.content_hash == hash => Ok((existing, ChangeKind::Unchanged)),
            Some(mut existing) => {
                let mut patch = Map::new();
                patch.insert("content".to_string(), Value::from(row.content.as_str()));
                patch.insert("content_hash".to_string(), Value::from(hash.as_str()));
                patch.insert("imported_at".to_string(), Value::from(now.as_str()));
                self.originals.update(&existing.id, patch).await?;

                tracing::debug!(
                    original_request = %existing.id,
                    old_hash = %existing.content_hash,
                    new_hash = %hash,
                    "Source row content changed"
                );
                existing.content = row.content.clone();
                existing.content_hash = hash;
                existing.imported_at = now;
                Ok((existing, ChangeKind::Changed))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn row(content: &str) -> SourceRow {
        SourceRow {
            requester_id: 7,
            field: "share_bunk_with".to_string(),
            session_id: 1,
            year: 2025,
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn test_upsert_classifies_changes() {
        let store = OriginalRequestStore::new(Arc::new(MemoryStore::new()));

        let (first, kind) = store.upsert(&row("Jane Doe")).await.unwrap();
        assert_eq!(kind, ChangeKind::New);

        // Surrounding whitespace does not count as a change
        let (same, kind) = store.upsert(&row("  Jane Doe \n")).await.unwrap();
        assert_eq!(kind, ChangeKind::Unchanged);
        assert_eq!(same.id, first.id);

        let (changed, kind) = store.upsert(&row("John Smith")).await.unwrap();
        assert_eq!(kind, ChangeKind::Changed);
        assert_eq!(changed.id, first.id);
        assert_ne!(changed.content_hash, first.content_hash);

        let stored = store.get(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.content, "John Smith");
    }

    #[tokio::test]
    async fn test_natural_key_separates_fields() {
        let store = OriginalRequestStore::new(Arc::new(MemoryStore::new()));
        let mut notes = row("Jane Doe");
        notes.field = "bunking_notes".to_string();

        let (a, _) = store.upsert(&row("Jane Doe")).await.unwrap();
        let (b, kind) = store.upsert(&notes).await.unwrap();
        assert_eq!(kind, ChangeKind::New);
        assert_ne!(a.id, b.id);
    }
}
