//! Provenance store: source links between derived requests and source rows
//!
//! The only component that reads or writes `SourceLink` rows. The
//! record store gives no transactions, so every operation re-reads the
//! current links before deciding what to write and tolerates the
//! uniqueness index rejecting a concurrent duplicate.

use crate::models::{LinkWithField, NewSourceLink, SourceLink};
use crate::models::source_link::{FIELD_BUNK_REQUEST, FIELD_IS_PRIMARY, FIELD_ORIGINAL_REQUEST};
use crate::pagination::{drain_matching, list_all};
use crate::store::{Collection, Filter, Record, RecordStore};
use bunkreq_common::config::DEFAULT_PAGE_SIZE;
use bunkreq_common::db::SOURCE_LINKS;
use bunkreq_common::{Error, Result};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Request ids per `||` filter in batch lookups
pub const BATCH_CHUNK_SIZE: usize = 50;

/// Source link persistence and queries
#[derive(Clone)]
pub struct ProvenanceStore {
    links: Collection,
    page_size: u32,
}

impl ProvenanceStore {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            links: Collection::new(store, SOURCE_LINKS),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    fn parse_links(records: Vec<Record>) -> Vec<SourceLink> {
        records
            .iter()
            .filter_map(|record| match SourceLink::from_record(record) {
                Ok(link) => Some(link),
                Err(e) => {
                    tracing::warn!(link = %record.id, error = %e, "Skipping malformed source link");
                    None
                }
            })
            .collect()
    }

    /// All links of one derived request, in creation order
    pub async fn links_for(&self, bunk_request_id: &str) -> Result<Vec<SourceLink>> {
        let filter = Filter::eq(FIELD_BUNK_REQUEST, bunk_request_id);
        let records = list_all(&self.links, Some(&filter), self.page_size).await?;
        Ok(Self::parse_links(records))
    }

    /// Links of many requests with one query per chunk of ids.
    /// Every requested id gets an entry, empty when it has no links.
    pub async fn links_for_batch(
        &self,
        bunk_request_ids: &[String],
    ) -> Result<HashMap<String, Vec<SourceLink>>> {
        let mut distinct: Vec<&String> = Vec::new();
        let mut seen = HashSet::new();
        for id in bunk_request_ids {
            if seen.insert(id) {
                distinct.push(id);
            }
        }

        let mut by_request: HashMap<String, Vec<SourceLink>> = distinct
            .iter()
            .map(|id| ((*id).clone(), Vec::new()))
            .collect();

        for chunk in distinct.chunks(BATCH_CHUNK_SIZE) {
            let Some(filter) = Filter::any_of(FIELD_BUNK_REQUEST, chunk.iter().map(|id| id.as_str()))
            else {
                continue;
            };
            let records = list_all(&self.links, Some(&filter), self.page_size).await?;
            for link in Self::parse_links(records) {
                if let Some(entry) = by_request.get_mut(&link.bunk_request_id) {
                    entry.push(link);
                }
            }
        }

        tracing::debug!(
            requests = by_request.len(),
            chunks = (distinct.len() + BATCH_CHUNK_SIZE - 1) / BATCH_CHUNK_SIZE,
            "Loaded source links in batch"
        );
        Ok(by_request)
    }

    /// Create one link; `false` when the pair is already linked.
    ///
    /// **Algorithm:**
    /// 1. Read the request's current links
    /// 2. Same source already linked: return false
    /// 3. Primary requested but a primary exists: store as non-primary (logged)
    /// 4. Insert; a uniqueness rejection (concurrent insert) also returns false
    pub async fn add_link(
        &self,
        bunk_request_id: &str,
        original_request_id: &str,
        is_primary: bool,
        source_field: Option<&str>,
    ) -> Result<bool> {
        let existing = self.links_for(bunk_request_id).await?;
        let link = NewSourceLink::new(
            bunk_request_id,
            original_request_id,
            is_primary,
            source_field.map(str::to_string),
        );
        self.insert_against(&existing, link).await
    }

    async fn insert_against(&self, existing: &[SourceLink], mut link: NewSourceLink) -> Result<bool> {
        if existing
            .iter()
            .any(|l| l.original_request_id == link.original_request_id)
        {
            tracing::debug!(
                bunk_request = %link.bunk_request_id,
                original_request = %link.original_request_id,
                "Source link already exists"
            );
            return Ok(false);
        }

        if link.is_primary && existing.iter().any(|l| l.is_primary) {
            tracing::warn!(
                bunk_request = %link.bunk_request_id,
                original_request = %link.original_request_id,
                "Request already has a primary source, storing link as non-primary"
            );
            link.is_primary = false;
        }

        match self.links.create(link.to_fields()).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_unique_violation() => {
                tracing::debug!(
                    bunk_request = %link.bunk_request_id,
                    original_request = %link.original_request_id,
                    "Duplicate source link rejected by store"
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Create many links; returns how many were created.
    ///
    /// Same per-link rules as `add_link`, but current links are read once
    /// per chunk of distinct requests. A failed insert is logged and
    /// skipped.
    pub async fn add_links_batch(&self, links: &[NewSourceLink]) -> Result<usize> {
        let ids: Vec<String> = links.iter().map(|l| l.bunk_request_id.clone()).collect();
        let mut current = self.links_for_batch(&ids).await?;
        let mut created = 0;

        for link in links {
            let existing = current.entry(link.bunk_request_id.clone()).or_default();
            let is_primary = link.is_primary && !existing.iter().any(|l| l.is_primary);

            match self.insert_against(existing, link.clone()).await {
                Ok(true) => {
                    created += 1;
                    // Track locally so later links in the batch see this one
                    existing.push(SourceLink {
                        id: String::new(),
                        bunk_request_id: link.bunk_request_id.clone(),
                        original_request_id: link.original_request_id.clone(),
                        is_primary,
                        source_field: link.source_field.clone(),
                    });
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        bunk_request = %link.bunk_request_id,
                        original_request = %link.original_request_id,
                        error = %e,
                        "Failed to create source link in batch"
                    );
                }
            }
        }

        tracing::info!(requested = links.len(), created, "Batch source link creation complete");
        Ok(created)
    }

    /// Original request ids feeding one derived request
    pub async fn sources_for(&self, bunk_request_id: &str) -> Result<Vec<String>> {
        Ok(self
            .links_for(bunk_request_id)
            .await?
            .into_iter()
            .map(|l| l.original_request_id)
            .collect())
    }

    /// `sources_for` over many requests
    pub async fn sources_for_batch(
        &self,
        bunk_request_ids: &[String],
    ) -> Result<HashMap<String, Vec<String>>> {
        Ok(self
            .links_for_batch(bunk_request_ids)
            .await?
            .into_iter()
            .map(|(id, links)| {
                let originals = links.into_iter().map(|l| l.original_request_id).collect();
                (id, originals)
            })
            .collect())
    }

    /// Derived requests fed by one source row (entry point for invalidation)
    pub async fn requests_for(&self, original_request_id: &str) -> Result<Vec<String>> {
        let filter = Filter::eq(FIELD_ORIGINAL_REQUEST, original_request_id);
        let records = list_all(&self.links, Some(&filter), self.page_size).await?;

        let mut seen = HashSet::new();
        Ok(Self::parse_links(records)
            .into_iter()
            .map(|l| l.bunk_request_id)
            .filter(|id| seen.insert(id.clone()))
            .collect())
    }

    pub async fn count_sources(&self, bunk_request_id: &str) -> Result<usize> {
        let filter = Filter::eq(FIELD_BUNK_REQUEST, bunk_request_id);
        Ok(self.links.count(&filter).await? as usize)
    }

    pub async fn is_single_source(&self, bunk_request_id: &str) -> Result<bool> {
        Ok(self.count_sources(bunk_request_id).await? == 1)
    }

    pub async fn primary_source(&self, bunk_request_id: &str) -> Result<Option<String>> {
        Ok(self
            .links_for(bunk_request_id)
            .await?
            .into_iter()
            .find(|l| l.is_primary)
            .map(|l| l.original_request_id))
    }

    pub async fn find_link(
        &self,
        bunk_request_id: &str,
        original_request_id: &str,
    ) -> Result<Option<SourceLink>> {
        Ok(self
            .links_for(bunk_request_id)
            .await?
            .into_iter()
            .find(|l| l.original_request_id == original_request_id))
    }

    async fn set_primary(&self, link_id: &str, is_primary: bool) -> Result<()> {
        let mut patch = Map::new();
        patch.insert(FIELD_IS_PRIMARY.to_string(), Value::Bool(is_primary));
        self.links.update(link_id, patch).await?;
        Ok(())
    }

    /// Make `new_primary_original_id` the primary source; false if not linked.
    ///
    /// Old primaries are demoted before the target is promoted, so an
    /// interruption leaves zero primaries, never two.
    pub async fn transfer_primary(
        &self,
        bunk_request_id: &str,
        new_primary_original_id: &str,
    ) -> Result<bool> {
        let links = self.links_for(bunk_request_id).await?;
        let Some(target) = links
            .iter()
            .find(|l| l.original_request_id == new_primary_original_id)
        else {
            tracing::debug!(
                bunk_request = %bunk_request_id,
                original_request = %new_primary_original_id,
                "Cannot transfer primary: link not found"
            );
            return Ok(false);
        };

        for link in links.iter().filter(|l| l.is_primary && l.id != target.id) {
            self.set_primary(&link.id, false).await?;
        }
        if !target.is_primary {
            self.set_primary(&target.id, true).await?;
        }

        tracing::debug!(
            bunk_request = %bunk_request_id,
            original_request = %new_primary_original_id,
            "Transferred primary source"
        );
        Ok(true)
    }

    /// Remove one link; false if it did not exist
    pub async fn remove_link(&self, bunk_request_id: &str, original_request_id: &str) -> Result<bool> {
        let mut removed = false;
        for link in self
            .links_for(bunk_request_id)
            .await?
            .into_iter()
            .filter(|l| l.original_request_id == original_request_id)
        {
            removed |= self.links.delete(&link.id).await?;
        }
        Ok(removed)
    }

    /// Remove every link of a request; returns how many were removed.
    ///
    /// Fails if any link could not be removed, so callers never delete a
    /// request while links to it remain.
    pub async fn remove_all_links(&self, bunk_request_id: &str) -> Result<usize> {
        let filter = Filter::eq(FIELD_BUNK_REQUEST, bunk_request_id);
        let links = self.links.clone();
        let report = drain_matching(&self.links, &filter, self.page_size, |record| {
            let links = links.clone();
            async move {
                links.delete(&record.id).await?;
                Ok(())
            }
        })
        .await?;

        if !report.failed.is_empty() {
            return Err(Error::Internal(format!(
                "{} source links of {} could not be removed",
                report.failed.len(),
                bunk_request_id
            )));
        }
        Ok(report.processed)
    }

    /// Re-parent every link of `from_id` onto `to_id` as non-primary.
    ///
    /// **Algorithm:**
    /// 1. Read links of both requests
    /// 2. For each link of `from_id`:
    ///    a. Source already linked to `to_id`: nothing to create
    ///    b. Otherwise create a non-primary copy on `to_id` (same source field)
    ///    c. Delete the original link once its copy exists
    /// 3. Return the number of links created on `to_id`
    ///
    /// A copy that fails to create keeps its original link, so provenance
    /// is never lost.
    pub async fn transfer_all_sources(&self, from_id: &str, to_id: &str) -> Result<usize> {
        let from_links = self.links_for(from_id).await?;
        let mut target_sources: HashSet<String> = self
            .links_for(to_id)
            .await?
            .into_iter()
            .map(|l| l.original_request_id)
            .collect();
        let mut transferred = 0;

        for link in from_links {
            if !target_sources.contains(&link.original_request_id) {
                let copy = NewSourceLink::new(
                    to_id,
                    link.original_request_id.as_str(),
                    false,
                    link.source_field.clone(),
                );
                match self.links.create(copy.to_fields()).await {
                    Ok(_) => transferred += 1,
                    Err(e) if e.is_unique_violation() => {}
                    Err(e) => {
                        tracing::warn!(
                            from = %from_id,
                            to = %to_id,
                            original_request = %link.original_request_id,
                            error = %e,
                            "Failed to transfer source link, keeping original"
                        );
                        continue;
                    }
                }
                target_sources.insert(link.original_request_id.clone());
            }
            self.links.delete(&link.id).await?;
        }

        tracing::debug!(from = %from_id, to = %to_id, transferred, "Transferred source links");
        Ok(transferred)
    }

    /// Sources with the field each contributed (for split)
    pub async fn links_with_fields(&self, bunk_request_id: &str) -> Result<Vec<LinkWithField>> {
        Ok(self
            .links_for(bunk_request_id)
            .await?
            .iter()
            .map(SourceLink::with_field)
            .collect())
    }
}
