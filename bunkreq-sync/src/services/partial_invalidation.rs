//! Partial invalidation of derived requests when a source row changes
//!
//! Reconciliation only: no parsing happens here. Every decision is
//! re-derived from the stored links, so running the handler twice for the
//! same change is a no-op the second time.

use crate::db::{ProvenanceStore, RequestStore};
use crate::db::request_store::REVIEW_SOURCE_KEY;
use crate::models::{RequestStatus, SourceLink};
use crate::services::merge_split::forget_merged_source;
use bunkreq_common::Result;
use serde::Serialize;

/// Review reason recorded on locked requests whose source changed
pub const SOURCE_CHANGED_WHILE_LOCKED: &str = "source_changed_while_locked";

/// Where each linked request ended up
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InvalidationResult {
    pub deleted_requests: Vec<String>,
    pub unlinked_requests: Vec<String>,
    pub flagged_for_review: Vec<String>,
    /// Requests whose reconciliation hit a store error
    pub failed: Vec<String>,
    /// Changed sources whose linked requests could not even be listed
    pub failed_sources: Vec<String>,
}

impl InvalidationResult {
    pub fn total_affected(&self) -> usize {
        self.deleted_requests.len() + self.unlinked_requests.len() + self.flagged_for_review.len()
    }

    pub fn absorb(&mut self, other: InvalidationResult) {
        self.deleted_requests.extend(other.deleted_requests);
        self.unlinked_requests.extend(other.unlinked_requests);
        self.flagged_for_review.extend(other.flagged_for_review);
        self.failed.extend(other.failed);
        self.failed_sources.extend(other.failed_sources);
    }
}

/// Per-request decision; the ids are absorbed requests deleted along the way
enum Outcome {
    Deleted(Vec<String>),
    Unlinked(Vec<String>),
    Flagged,
}

#[derive(Clone)]
pub struct PartialInvalidationHandler {
    requests: RequestStore,
    provenance: ProvenanceStore,
}

impl PartialInvalidationHandler {
    pub fn new(requests: RequestStore, provenance: ProvenanceStore) -> Self {
        Self {
            requests,
            provenance,
        }
    }

    /// Reconcile every request derived from one changed source.
    ///
    /// **Algorithm:**
    /// 1. List the requests linked to the source; none means nothing to do
    /// 2. Load all their links in one batch
    /// 3. Per request:
    ///    - one source or fewer: remove links, then hard-delete the request
    ///      together with any requests merged into it
    ///    - several sources, locked: flag for review, touch nothing else
    ///    - several sources, unlocked: drop the changed link and the field
    ///      it contributed; re-elect a primary if the dropped link was it.
    ///      The source also leaves the merge record, and an absorbed request
    ///      with no recorded source left is deleted
    ///
    /// A failure on one request is logged and reported in `failed`; the
    /// remaining requests are still processed.
    pub async fn handle_source_change(&self, original_request_id: &str) -> Result<InvalidationResult> {
        let mut result = InvalidationResult::default();

        let linked = self.provenance.requests_for(original_request_id).await?;
        if linked.is_empty() {
            tracing::debug!(original_request = %original_request_id, "Changed source has no derived requests");
            return Ok(result);
        }

        let links = self.provenance.links_for_batch(&linked).await?;

        for bunk_request_id in &linked {
            let request_links = links.get(bunk_request_id).map(Vec::as_slice).unwrap_or(&[]);
            match self
                .reconcile(bunk_request_id, original_request_id, request_links)
                .await
            {
                Ok(Outcome::Deleted(absorbed)) => {
                    result.deleted_requests.push(bunk_request_id.clone());
                    result.deleted_requests.extend(absorbed.into_iter().filter(|id| !linked.contains(id)));
                }
                Ok(Outcome::Unlinked(absorbed)) => {
                    result.unlinked_requests.push(bunk_request_id.clone());
                    result.deleted_requests.extend(absorbed.into_iter().filter(|id| !linked.contains(id)));
                }
                Ok(Outcome::Flagged) => result.flagged_for_review.push(bunk_request_id.clone()),
                Err(e) => {
                    tracing::warn!(
                        bunk_request = %bunk_request_id,
                        original_request = %original_request_id,
                        error = %e,
                        "Failed to reconcile request after source change"
                    );
                    result.failed.push(bunk_request_id.clone());
                }
            }
        }

        tracing::info!(
            original_request = %original_request_id,
            deleted = result.deleted_requests.len(),
            unlinked = result.unlinked_requests.len(),
            flagged = result.flagged_for_review.len(),
            failed = result.failed.len(),
            "Source change reconciled"
        );
        Ok(result)
    }

    /// Reconcile several changed sources; a source that fails outright is
    /// reported in `failed_sources` and does not stop the others.
    pub async fn handle_source_changes(&self, original_request_ids: &[String]) -> InvalidationResult {
        let mut total = InvalidationResult::default();
        for original_request_id in original_request_ids {
            match self.handle_source_change(original_request_id).await {
                Ok(result) => total.absorb(result),
                Err(e) => {
                    tracing::error!(
                        original_request = %original_request_id,
                        error = %e,
                        "Source change could not be reconciled"
                    );
                    total.failed_sources.push(original_request_id.clone());
                }
            }
        }
        total
    }

    async fn reconcile(
        &self,
        bunk_request_id: &str,
        original_request_id: &str,
        links: &[SourceLink],
    ) -> Result<Outcome> {
        if links.len() <= 1 {
            let absorbed = self.delete_absorbed(bunk_request_id).await?;
            self.provenance.remove_all_links(bunk_request_id).await?;
            self.requests.delete(bunk_request_id).await?;
            tracing::debug!(
                bunk_request = %bunk_request_id,
                absorbed = absorbed.len(),
                "Deleted single-source request"
            );
            return Ok(Outcome::Deleted(absorbed));
        }

        let Some(mut request) = self.requests.get(bunk_request_id).await? else {
            // Links outlived their request; clear them so the source is free
            let absorbed = self.delete_absorbed(bunk_request_id).await?;
            self.provenance.remove_all_links(bunk_request_id).await?;
            tracing::warn!(bunk_request = %bunk_request_id, "Removed links of a missing request");
            return Ok(Outcome::Deleted(absorbed));
        };

        if request.locked {
            let already_flagged = request.status == RequestStatus::ManualReview
                && request.metadata.get(REVIEW_SOURCE_KEY).and_then(|v| v.as_str())
                    == Some(original_request_id);
            if !already_flagged {
                self.requests
                    .flag_for_review(bunk_request_id, SOURCE_CHANGED_WHILE_LOCKED, original_request_id)
                    .await?;
            }
            return Ok(Outcome::Flagged);
        }

        let changed = links
            .iter()
            .find(|l| l.original_request_id == original_request_id);
        let changed_field = changed.and_then(|l| l.source_field.as_deref());

        // A field stays while another remaining link still carries it
        let field_dropped = changed_field
            .filter(|field| {
                !links.iter().any(|l| {
                    l.original_request_id != original_request_id
                        && l.source_field.as_deref() == Some(*field)
                })
            })
            .map_or(false, |field| request.remove_source_field(field));
        let stale = forget_merged_source(
            &mut request.metadata,
            original_request_id,
            changed_field,
            field_dropped,
            links,
        );

        // Orphaned absorbed requests are deleted before the changed link goes
        let mut orphaned = Vec::with_capacity(stale.orphaned.len());
        for absorbed_id in &stale.orphaned {
            match self.requests.get(absorbed_id).await? {
                Some(child) if child.merged_into.as_deref() == Some(bunk_request_id) => {
                    self.provenance.remove_all_links(absorbed_id).await?;
                    self.requests.delete(absorbed_id).await?;
                    orphaned.push(absorbed_id.clone());
                }
                _ => tracing::debug!(
                    bunk_request = %bunk_request_id,
                    absorbed = %absorbed_id,
                    "Absorbed request with no sources has no record left"
                ),
            }
        }

        self.provenance
            .remove_link(bunk_request_id, original_request_id)
            .await?;
        if field_dropped || stale.changed {
            self.requests.update(&request).await?;
        }

        if changed.map_or(false, |l| l.is_primary) {
            if let Some(next) = links
                .iter()
                .find(|l| l.original_request_id != original_request_id)
            {
                self.provenance
                    .transfer_primary(bunk_request_id, &next.original_request_id)
                    .await?;
            }
        }

        tracing::debug!(
            bunk_request = %bunk_request_id,
            original_request = %original_request_id,
            orphaned = orphaned.len(),
            "Unlinked changed source"
        );
        Ok(Outcome::Unlinked(orphaned))
    }

    /// Hard-delete the requests merged into `parent_id`; they cannot
    /// outlive the request they point at.
    async fn delete_absorbed(&self, parent_id: &str) -> Result<Vec<String>> {
        let mut deleted = Vec::new();
        for child in self.requests.merged_children(parent_id).await? {
            self.provenance.remove_all_links(&child.id).await?;
            self.requests.delete(&child.id).await?;
            deleted.push(child.id);
        }
        if !deleted.is_empty() {
            tracing::debug!(parent = %parent_id, count = deleted.len(), "Deleted absorbed requests");
        }
        Ok(deleted)
    }
}
