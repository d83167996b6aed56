//! Request store: persistence of derived bunk requests

use super::provenance_store::ProvenanceStore;
use crate::models::{BunkRequest, RequestIdentity, RequestStatus};
use crate::pagination::{drain_matching, list_all, DrainReport};
use crate::store::{Collection, Filter, Literal, RecordStore};
use bunkreq_common::config::DEFAULT_PAGE_SIZE;
use bunkreq_common::db::BUNK_REQUESTS;
use bunkreq_common::{Error, Result};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Metadata keys written by `flag_for_review`
pub const REVIEW_REASON_KEY: &str = "review_reason";
pub const REVIEW_SOURCE_KEY: &str = "review_changed_source";
pub const REVIEW_FLAGGED_AT_KEY: &str = "review_flagged_at";

#[derive(Clone)]
pub struct RequestStore {
    requests: Collection,
    page_size: u32,
}

impl RequestStore {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            requests: Collection::new(store, BUNK_REQUESTS),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Persist a new request; returns it with its assigned id
    pub async fn create(&self, request: &BunkRequest) -> Result<BunkRequest> {
        let mut fields = request.to_fields()?;
        if !request.id.is_empty() {
            fields.insert("id".to_string(), Value::String(request.id.clone()));
        }
        let record = self.requests.create(fields).await?;

        tracing::debug!(
            bunk_request = %record.id,
            requester_id = request.requester_id,
            request_type = %request.request_type,
            "Created bunk request"
        );

        let mut created = request.clone();
        created.id = record.id;
        Ok(created)
    }

    pub async fn get(&self, id: &str) -> Result<Option<BunkRequest>> {
        match self.requests.get_by_id(id).await? {
            Some(record) => Ok(Some(BunkRequest::from_record(&record)?)),
            None => Ok(None),
        }
    }

    /// Like `get`, but absence is `Error::NotFound`
    pub async fn require(&self, id: &str) -> Result<BunkRequest> {
        self.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Bunk request {}", id)))
    }

    /// Write every field of `request`
    pub async fn update(&self, request: &BunkRequest) -> Result<()> {
        self.requests.update(&request.id, request.to_fields()?).await?;
        Ok(())
    }

    /// Field-level patch (keys as persisted)
    pub async fn patch(&self, id: &str, patch: Map<String, Value>) -> Result<()> {
        self.requests.update(id, patch).await?;
        Ok(())
    }

    pub async fn update_source_fields(&self, id: &str, source_fields: &[String]) -> Result<()> {
        let mut patch = Map::new();
        patch.insert("source_fields".to_string(), Value::from(source_fields.to_vec()));
        self.patch(id, patch).await
    }

    /// Absorb into `merged_into` (soft delete)
    pub async fn soft_delete(&self, id: &str, merged_into: &str) -> Result<()> {
        let mut patch = Map::new();
        patch.insert("merged_into".to_string(), Value::String(merged_into.to_string()));
        self.patch(id, patch).await?;
        tracing::debug!(bunk_request = %id, merged_into = %merged_into, "Soft-deleted bunk request");
        Ok(())
    }

    /// Clear `merged_into`
    pub async fn restore(&self, id: &str) -> Result<()> {
        let mut patch = Map::new();
        patch.insert("merged_into".to_string(), Value::Null);
        self.patch(id, patch).await?;
        tracing::debug!(bunk_request = %id, "Restored bunk request");
        Ok(())
    }

    /// Hard delete. Callers remove the request's links first.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.requests.delete(id).await
    }

    /// Mark a request for staff re-review without touching anything else
    /// but its status and review metadata
    pub async fn flag_for_review(
        &self,
        id: &str,
        reason: &str,
        changed_original_id: &str,
    ) -> Result<()> {
        let request = self.require(id).await?;
        let mut metadata = request.metadata;
        metadata.insert(REVIEW_REASON_KEY.to_string(), Value::from(reason));
        metadata.insert(REVIEW_SOURCE_KEY.to_string(), Value::from(changed_original_id));
        metadata.insert(
            REVIEW_FLAGGED_AT_KEY.to_string(),
            Value::from(chrono::Utc::now().to_rfc3339()),
        );

        let mut patch = Map::new();
        patch.insert(
            "status".to_string(),
            Value::from(RequestStatus::ManualReview.as_str()),
        );
        patch.insert(
            "metadata".to_string(),
            Value::String(serde_json::to_string(&metadata)?),
        );
        self.patch(id, patch).await?;

        tracing::info!(
            bunk_request = %id,
            reason,
            changed_original = %changed_original_id,
            "Flagged bunk request for review"
        );
        Ok(())
    }

    /// The live request with this identity, if any
    pub async fn find_live_by_identity(
        &self,
        identity: &RequestIdentity,
    ) -> Result<Option<BunkRequest>> {
        match self.requests.first(&identity.live_filter()).await? {
            Some(record) => Ok(Some(BunkRequest::from_record(&record)?)),
            None => Ok(None),
        }
    }

    /// Soft-deleted requests absorbed by `parent_id`
    pub async fn merged_children(&self, parent_id: &str) -> Result<Vec<BunkRequest>> {
        let filter = Filter::eq("merged_into", parent_id);
        list_all(&self.requests, Some(&filter), self.page_size)
            .await?
            .iter()
            .map(BunkRequest::from_record)
            .collect()
    }

    pub async fn list_for_year(&self, year: i32, include_merged: bool) -> Result<Vec<BunkRequest>> {
        let mut filter = Filter::eq("year", year);
        if !include_merged {
            filter = filter.and(Filter::eq("merged_into", Literal::Null));
        }
        list_all(&self.requests, Some(&filter), self.page_size)
            .await?
            .iter()
            .map(BunkRequest::from_record)
            .collect()
    }

    /// Delete every request of `year` with its links.
    ///
    /// Drains the first page repeatedly; deleting while paging forward
    /// would skip every other page.
    pub async fn clear_year(&self, year: i32, provenance: &ProvenanceStore) -> Result<DrainReport> {
        let filter = Filter::eq("year", year);
        let requests = self.requests.clone();

        let report = drain_matching(&self.requests, &filter, self.page_size, |record| {
            let requests = requests.clone();
            let provenance = provenance.clone();
            async move {
                provenance.remove_all_links(&record.id).await?;
                requests.delete(&record.id).await?;
                Ok(())
            }
        })
        .await?;

        tracing::info!(
            year,
            deleted = report.processed,
            failed = report.failed.len(),
            "Cleared bunk requests for year"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RequestType;
    use crate::store::MemoryStore;

    fn stores() -> (RequestStore, ProvenanceStore) {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        (
            RequestStore::new(store.clone()).with_page_size(3),
            ProvenanceStore::new(store).with_page_size(3),
        )
    }

    fn request(requester: i64, target: i64) -> BunkRequest {
        let mut r = BunkRequest::new(requester, Some(target), RequestType::BunkWith, 1, 2025);
        r.add_source_field("share_bunk_with");
        r
    }

    #[tokio::test]
    async fn test_create_get_and_soft_delete_cycle() {
        let (requests, _) = stores();
        let created = requests.create(&request(1, 2)).await.unwrap();
        assert!(!created.id.is_empty());

        requests.soft_delete(&created.id, "br-parent").await.unwrap();
        let absorbed = requests.require(&created.id).await.unwrap();
        assert_eq!(absorbed.merged_into.as_deref(), Some("br-parent"));
        assert_eq!(requests.merged_children("br-parent").await.unwrap().len(), 1);

        requests.restore(&created.id).await.unwrap();
        assert!(requests.require(&created.id).await.unwrap().is_live());
    }

    #[tokio::test]
    async fn test_find_live_by_identity_ignores_merged() {
        let (requests, _) = stores();
        let live = requests.create(&request(1, 2)).await.unwrap();
        let identity = live.identity();

        let found = requests.find_live_by_identity(&identity).await.unwrap();
        assert_eq!(found.map(|r| r.id), Some(live.id.clone()));

        requests.soft_delete(&live.id, "other").await.unwrap();
        assert!(requests.find_live_by_identity(&identity).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flag_for_review_keeps_fields() {
        let (requests, _) = stores();
        let mut locked = request(1, 2);
        locked.locked = true;
        let created = requests.create(&locked).await.unwrap();

        requests
            .flag_for_review(&created.id, "source_changed_while_locked", "o9")
            .await
            .unwrap();

        let flagged = requests.require(&created.id).await.unwrap();
        assert_eq!(flagged.status, RequestStatus::ManualReview);
        assert_eq!(flagged.source_fields, created.source_fields);
        assert_eq!(
            flagged.metadata.get(REVIEW_SOURCE_KEY).and_then(Value::as_str),
            Some("o9")
        );
    }

    #[tokio::test]
    async fn test_missing_request_is_not_found() {
        let (requests, _) = stores();
        let err = requests.require("nope").await.unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn test_clear_year_spans_pages_and_removes_links() {
        let (requests, provenance) = stores();
        let mut ids = Vec::new();
        for i in 0..8 {
            let created = requests.create(&request(i, 100 + i)).await.unwrap();
            provenance
                .add_link(&created.id, &format!("o{}", i), true, None)
                .await
                .unwrap();
            ids.push(created.id);
        }
        let mut other_year = request(50, 51);
        other_year.year = 2024;
        requests.create(&other_year).await.unwrap();

        let report = requests.clear_year(2025, &provenance).await.unwrap();

        assert_eq!(report.processed, 8);
        assert!(requests.list_for_year(2025, true).await.unwrap().is_empty());
        assert_eq!(requests.list_for_year(2024, true).await.unwrap().len(), 1);
        for id in &ids {
            assert_eq!(provenance.count_sources(id).await.unwrap(), 0);
        }
    }
}
