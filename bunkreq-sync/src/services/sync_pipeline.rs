//! Incremental sync of imported request rows into derived bunk requests
//!
//! **Flow per run:**
//! 1. Upsert every source row and classify it (new / unchanged / changed)
//! 2. Reconcile requests derived from changed rows (partial invalidation)
//! 3. Parse new and changed rows, once per distinct text when dedup is on
//! 4. Resolve every parsed target, then expand placeholders
//! 5. Persist: reuse a live request with the same identity (adding a
//!    source link) or create a new one with a primary link
//!
//! Unchanged rows are never re-parsed. A failure on one row or request is
//! logged and counted; the run carries on with the rest.

use crate::db::{OriginalRequestStore, ProvenanceStore, RequestStore};
use crate::models::{
    BunkRequest, ChangeKind, ParseRequest, ParseResult, ParsedRequest, RequestPair,
    RequestStatus, RequestType, RequesterContext, ResolutionResult, SourceRow,
};
use crate::services::lookups::HistoricalLookup;
use crate::services::parser::RequestParser;
use crate::services::partial_invalidation::{InvalidationResult, PartialInvalidationHandler};
use crate::services::placeholder_expander::{is_expansion_failure, PlaceholderExpander};
use crate::services::request_deduplicator::{DeduplicationStats, RequestDeduplicator};
use crate::store::RecordStore;
use bunkreq_common::{Result, SyncConfig};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

pub const TARGET_NAME_KEY: &str = "target_name";
pub const RESOLUTION_METHOD_KEY: &str = "resolution_method";
pub const RESOLUTION_ERROR_METHOD: &str = "resolution_error";

/// Counters for one sync run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub rows_seen: usize,
    pub rows_new: usize,
    pub rows_changed: usize,
    pub rows_unchanged: usize,
    pub dedup: Option<DeduplicationStats>,
    pub parse_failures: usize,
    pub requests_created: usize,
    pub requests_reused: usize,
    pub links_added: usize,
    pub invalidation: InvalidationResult,
    /// One line per row or request that could not be processed
    pub failures: Vec<String>,
}

enum Persisted {
    Created,
    Reused { linked: bool },
}

pub struct SyncPipeline {
    originals: OriginalRequestStore,
    requests: RequestStore,
    provenance: ProvenanceStore,
    invalidation: PartialInvalidationHandler,
    deduplicator: RequestDeduplicator,
    expander: PlaceholderExpander,
    parser: Arc<dyn RequestParser>,
    auto_resolve_threshold: f64,
    default_priority: i64,
    dedup_enabled: bool,
}

impl SyncPipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        parser: Arc<dyn RequestParser>,
        lookup: Arc<dyn HistoricalLookup>,
        config: &SyncConfig,
    ) -> Self {
        let requests = RequestStore::new(store.clone()).with_page_size(config.page_size);
        let provenance = ProvenanceStore::new(store.clone()).with_page_size(config.page_size);
        Self {
            originals: OriginalRequestStore::new(store),
            invalidation: PartialInvalidationHandler::new(requests.clone(), provenance.clone()),
            requests,
            provenance,
            deduplicator: RequestDeduplicator::new(),
            expander: PlaceholderExpander::new(lookup),
            parser,
            auto_resolve_threshold: config.auto_resolve_threshold,
            default_priority: config.default_priority,
            dedup_enabled: config.dedup_enabled,
        }
    }

    pub async fn run(&self, rows: &[SourceRow]) -> Result<SyncReport> {
        let mut report = SyncReport {
            rows_seen: rows.len(),
            ..SyncReport::default()
        };

        let mut to_parse = Vec::new();
        let mut changed = Vec::new();
        for row in rows {
            let (original, kind) = match self.originals.upsert(row).await {
                Ok(upserted) => upserted,
                Err(e) => {
                    tracing::warn!(
                        requester_id = row.requester_id,
                        field = %row.field,
                        error = %e,
                        "Failed to store source row"
                    );
                    report
                        .failures
                        .push(format!("row {}/{}: {}", row.requester_id, row.field, e));
                    continue;
                }
            };

            match kind {
                ChangeKind::Unchanged => {
                    report.rows_unchanged += 1;
                    continue;
                }
                ChangeKind::New => report.rows_new += 1,
                ChangeKind::Changed => {
                    report.rows_changed += 1;
                    changed.push(original.id.clone());
                }
            }

            if !original.content.trim().is_empty() {
                to_parse.push(ParseRequest {
                    request_text: original.content.clone(),
                    field_name: original.field.clone(),
                    requester: RequesterContext {
                        requester_id: original.requester_id,
                        session_id: original.session_id,
                        year: original.year,
                    },
                    original_request_id: original.id.clone(),
                });
            }
        }

        // Old derivations go before new ones are written
        report.invalidation = self.invalidation.handle_source_changes(&changed).await;

        let results = if self.dedup_enabled {
            let outcome = self.deduplicator.deduplicate(&to_parse);
            report.dedup = Some(self.deduplicator.stats(&outcome));
            let mut parsed = Vec::with_capacity(outcome.unique.len());
            for request in &outcome.unique {
                parsed.push(self.parse_one(request).await);
            }
            self.deduplicator.expand(parsed, &outcome)
        } else {
            let mut parsed = Vec::with_capacity(to_parse.len());
            for request in &to_parse {
                parsed.push(self.parse_one(request).await);
            }
            parsed
        };

        let mut pairs: Vec<RequestPair> = Vec::with_capacity(results.len());
        for result in results {
            if !result.is_valid {
                report.parse_failures += 1;
                continue;
            }
            let mut resolutions = Vec::with_capacity(result.parsed_requests.len());
            for parsed in &result.parsed_requests {
                resolutions.push(self.resolve_one(parsed, result.parse_request.requester.year).await);
            }
            pairs.push((result, resolutions));
        }

        let pairs = self.expander.expand(pairs).await;

        for (result, resolutions) in &pairs {
            for (i, parsed) in result.parsed_requests.iter().enumerate() {
                let resolution = resolutions
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| ResolutionResult::unresolved(RESOLUTION_ERROR_METHOD));
                match self.persist(result, parsed, &resolution).await {
                    Ok(Persisted::Created) => {
                        report.requests_created += 1;
                        report.links_added += 1;
                    }
                    Ok(Persisted::Reused { linked }) => {
                        report.requests_reused += 1;
                        if linked {
                            report.links_added += 1;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            original_request = %result.parse_request.original_request_id,
                            error = %e,
                            "Failed to persist bunk request"
                        );
                        report.failures.push(format!(
                            "source {}: {}",
                            result.parse_request.original_request_id, e
                        ));
                    }
                }
            }
        }

        tracing::info!(
            rows = report.rows_seen,
            new = report.rows_new,
            changed = report.rows_changed,
            unchanged = report.rows_unchanged,
            created = report.requests_created,
            reused = report.requests_reused,
            invalidated = report.invalidation.total_affected(),
            failures = report.failures.len(),
            "Sync run complete"
        );
        Ok(report)
    }

    async fn parse_one(&self, request: &ParseRequest) -> ParseResult {
        match self
            .parser
            .parse(&request.request_text, &request.field_name, &request.requester)
            .await
        {
            Ok(mut parsed) => {
                for item in parsed.iter_mut() {
                    if item.source_field.is_empty() {
                        item.source_field = request.field_name.clone();
                    }
                }
                ParseResult::success(request.clone(), parsed)
            }
            Err(e) => {
                tracing::warn!(
                    requester_id = request.requester.requester_id,
                    field = %request.field_name,
                    error = %e,
                    "Parse failed"
                );
                ParseResult::failed(request.clone(), e.to_string())
            }
        }
    }

    async fn resolve_one(&self, parsed: &ParsedRequest, year: i32) -> ResolutionResult {
        match self.parser.resolve(parsed, year).await {
            Ok(resolution) => resolution,
            Err(e) => {
                tracing::warn!(error = %e, "Resolution failed");
                let mut resolution = ResolutionResult::unresolved(RESOLUTION_ERROR_METHOD);
                resolution
                    .metadata
                    .insert("error".to_string(), Value::from(e.to_string()));
                resolution
            }
        }
    }

    fn status_for(&self, parsed: &ParsedRequest, resolution: &ResolutionResult) -> RequestStatus {
        if is_expansion_failure(resolution) {
            RequestStatus::ManualReview
        } else if parsed.request_type == RequestType::AgePreference {
            RequestStatus::Resolved
        } else if resolution.person.is_none() {
            RequestStatus::NotFound
        } else if resolution.confidence >= self.auto_resolve_threshold {
            RequestStatus::Resolved
        } else {
            RequestStatus::Pending
        }
    }

    /// Write one parsed request.
    ///
    /// Requests with a known identity (a resolved target, or an age
    /// preference) join an existing live request with that identity; the
    /// existing request keeps its primary source and gains a secondary one.
    async fn persist(
        &self,
        result: &ParseResult,
        parsed: &ParsedRequest,
        resolution: &ResolutionResult,
    ) -> Result<Persisted> {
        let source = &result.parse_request;
        let context = &source.requester;
        let field = if parsed.source_field.is_empty() {
            source.field_name.as_str()
        } else {
            parsed.source_field.as_str()
        };
        let is_age = parsed.request_type == RequestType::AgePreference;
        let target_id = if is_age {
            None
        } else {
            resolution.person.as_ref().map(|p| p.person_id)
        };

        let mut request = BunkRequest::new(
            context.requester_id,
            target_id,
            parsed.request_type,
            context.session_id,
            context.year,
        );

        if target_id.is_some() || is_age {
            if let Some(mut existing) = self.requests.find_live_by_identity(&request.identity()).await? {
                let linked = self
                    .provenance
                    .add_link(&existing.id, &source.original_request_id, true, Some(field))
                    .await?;
                if existing.add_source_field(field) {
                    self.requests
                        .update_source_fields(&existing.id, &existing.source_fields)
                        .await?;
                }
                tracing::debug!(
                    bunk_request = %existing.id,
                    original_request = %source.original_request_id,
                    linked,
                    "Reused existing bunk request"
                );
                return Ok(Persisted::Reused { linked });
            }
        }

        request.priority = self.default_priority;
        request.confidence_score = if is_age {
            parsed.confidence
        } else {
            resolution.confidence
        };
        request.status = self.status_for(parsed, resolution);
        request.add_source_field(field);

        let mut metadata = parsed.metadata.clone();
        for (key, value) in resolution.metadata.iter().chain(result.metadata.iter()) {
            metadata.insert(key.clone(), value.clone());
        }
        if let Some(name) = &parsed.target_name {
            metadata.insert(TARGET_NAME_KEY.to_string(), Value::from(name.as_str()));
        }
        metadata.insert(
            RESOLUTION_METHOD_KEY.to_string(),
            Value::from(resolution.method.as_str()),
        );
        request.metadata = metadata;

        let created = self.requests.create(&request).await?;
        if let Err(e) = self
            .provenance
            .add_link(&created.id, &source.original_request_id, true, Some(field))
            .await
        {
            // A request without provenance could never be invalidated
            if let Err(cleanup) = self.requests.delete(&created.id).await {
                tracing::error!(
                    bunk_request = %created.id,
                    error = %cleanup,
                    "Failed to remove request after link failure"
                );
            }
            return Err(e);
        }
        Ok(Persisted::Created)
    }
}
