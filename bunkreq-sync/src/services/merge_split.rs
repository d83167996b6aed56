//! Staff-driven merge and split of derived requests
//!
//! Merge soft-deletes the absorbed requests (`merged_into`) and moves their
//! provenance onto the kept request; split reverses it. What split needs in
//! order to undo a merge is recorded in the kept request's metadata:
//!
//! - `merged_from`: absorbed ids
//! - `merged_sources`: absorbed id -> original request ids it brought in
//! - `merged_source_fields`: absorbed id -> source fields it brought in
//! - `pre_merge_source_fields` / `pre_merge_sources`: the kept request's own
//!   fields and sources before its first merge
//! - `merge_history`: one entry per merge, split, or absorbed request
//!   dropped because its sources changed
//!
//! Every check runs before the first write, so a rejected call changes
//! nothing.

use crate::db::{ProvenanceStore, RequestStore};
use crate::models::{BunkRequest, RequestStatus, RequestType, SourceLink};
use bunkreq_common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

pub const MERGED_FROM_KEY: &str = "merged_from";
pub const MERGED_SOURCES_KEY: &str = "merged_sources";
pub const MERGED_SOURCE_FIELDS_KEY: &str = "merged_source_fields";
pub const PRE_MERGE_SOURCE_FIELDS_KEY: &str = "pre_merge_source_fields";
pub const PRE_MERGE_SOURCES_KEY: &str = "pre_merge_sources";
pub const MERGE_HISTORY_KEY: &str = "merge_history";
/// Set on requests recreated for ids whose record no longer exists
pub const SYNTHESIZED_FROM_KEY: &str = "synthesized_from";
pub const SPLIT_FROM_KEY: &str = "split_from";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub request_ids: Vec<String>,
    /// Survivor; its target is the merged request's target
    pub keep_target_from: String,
    pub final_type: RequestType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeOutcome {
    pub kept_id: String,
    pub absorbed_ids: Vec<String>,
    pub transferred_links: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitSource {
    pub absorbed_request_id: String,
    #[serde(default)]
    pub new_type: Option<RequestType>,
    #[serde(default)]
    pub new_target_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynthesizedRequest {
    /// Id listed in `merged_from` that had no record left
    pub legacy_id: String,
    pub request_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SplitOutcome {
    pub restored: Vec<String>,
    pub synthesized: Vec<SynthesizedRequest>,
}

enum SplitPlan {
    Restore(BunkRequest),
    Synthesize { legacy_id: String, request: BunkRequest },
}

fn string_list(metadata: &Map<String, Value>, key: &str) -> Vec<String> {
    match metadata.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn object(metadata: &Map<String, Value>, key: &str) -> Map<String, Value> {
    match metadata.get(key) {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}

fn list_entry(map: &Map<String, Value>, id: &str) -> Vec<String> {
    string_list(map, id)
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

fn push_history(metadata: &mut Map<String, Value>, entry: Value) {
    let mut history = match metadata.remove(MERGE_HISTORY_KEY) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    };
    history.push(entry);
    metadata.insert(MERGE_HISTORY_KEY.to_string(), Value::Array(history));
}

/// Merge-record changes after a source stopped justifying a kept request
#[derive(Debug, Default, PartialEq)]
pub(crate) struct StaleSource {
    pub changed: bool,
    /// Absorbed ids left with no recorded source
    pub orphaned: Vec<String>,
}

/// Remove `original` from the merge record held in a kept request's
/// `metadata`.
///
/// `field` is the source field of the stale link and `field_dropped` tells
/// whether the kept request lost it. An absorbed request keeps `field` in
/// its recorded fields only while one of its remaining sources, among
/// `links`, still carries it. Orphaned absorbed ids leave the record
/// entirely.
pub(crate) fn forget_merged_source(
    metadata: &mut Map<String, Value>,
    original: &str,
    field: Option<&str>,
    field_dropped: bool,
    links: &[SourceLink],
) -> StaleSource {
    let mut stale = StaleSource::default();

    let mut own_sources = string_list(metadata, PRE_MERGE_SOURCES_KEY);
    if own_sources.iter().any(|s| s == original) {
        own_sources.retain(|s| s != original);
        metadata.insert(PRE_MERGE_SOURCES_KEY.to_string(), Value::from(own_sources));
        stale.changed = true;
    }
    if let (Some(field), true) = (field, field_dropped) {
        let mut own_fields = string_list(metadata, PRE_MERGE_SOURCE_FIELDS_KEY);
        if own_fields.iter().any(|f| f == field) {
            own_fields.retain(|f| f != field);
            metadata.insert(PRE_MERGE_SOURCE_FIELDS_KEY.to_string(), Value::from(own_fields));
            stale.changed = true;
        }
    }

    let mut sources = object(metadata, MERGED_SOURCES_KEY);
    let mut fields = object(metadata, MERGED_SOURCE_FIELDS_KEY);
    let mut touched = false;
    for (absorbed_id, value) in sources.iter_mut() {
        let Value::Array(items) = value else { continue };
        let mut remaining: Vec<String> = items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        if !remaining.iter().any(|s| s == original) {
            continue;
        }
        remaining.retain(|s| s != original);
        touched = true;

        if remaining.is_empty() {
            stale.orphaned.push(absorbed_id.clone());
        } else if let Some(field) = field {
            let still_carried = links.iter().any(|l| {
                remaining.contains(&l.original_request_id) && l.source_field.as_deref() == Some(field)
            });
            if !still_carried && fields.contains_key(absorbed_id) {
                let mut absorbed_fields = list_entry(&fields, absorbed_id);
                absorbed_fields.retain(|f| f != field);
                fields.insert(absorbed_id.clone(), Value::from(absorbed_fields));
            }
        }
        *value = Value::from(remaining);
    }
    if !touched {
        return stale;
    }
    stale.changed = true;

    let mut merged_from = string_list(metadata, MERGED_FROM_KEY);
    for id in &stale.orphaned {
        merged_from.retain(|m| m != id);
        sources.remove(id);
        fields.remove(id);
    }
    if merged_from.is_empty() {
        for key in [
            MERGED_FROM_KEY,
            MERGED_SOURCES_KEY,
            MERGED_SOURCE_FIELDS_KEY,
            PRE_MERGE_SOURCE_FIELDS_KEY,
            PRE_MERGE_SOURCES_KEY,
        ] {
            metadata.remove(key);
        }
    } else {
        metadata.insert(MERGED_FROM_KEY.to_string(), Value::from(merged_from));
        metadata.insert(MERGED_SOURCES_KEY.to_string(), Value::Object(sources));
        metadata.insert(MERGED_SOURCE_FIELDS_KEY.to_string(), Value::Object(fields));
    }
    if !stale.orphaned.is_empty() {
        push_history(
            metadata,
            serde_json::json!({
                "action": "invalidate",
                "source": original,
                "dropped": stale.orphaned,
                "at": chrono::Utc::now().to_rfc3339(),
            }),
        );
    }
    stale
}

#[derive(Clone)]
pub struct MergeSplitCoordinator {
    requests: RequestStore,
    provenance: ProvenanceStore,
}

impl MergeSplitCoordinator {
    pub fn new(requests: RequestStore, provenance: ProvenanceStore) -> Self {
        Self {
            requests,
            provenance,
        }
    }

    /// Fold several live requests of one requester into `keep_target_from`.
    ///
    /// **Algorithm:**
    /// 1. Validate ids (at least two, no duplicates, keep among them), load
    ///    every request (missing: not found; already merged: invalid), and
    ///    require a shared requester and session
    /// 2. Record in the kept request's metadata what each absorbed request
    ///    contributes (sources, fields) plus the kept request's own
    ///    pre-merge state
    /// 3. Per absorbed request: move its links onto the kept request as
    ///    non-primary, then soft-delete it
    /// 4. Write the kept request: final type, field union, max confidence
    pub async fn merge(&self, merge: &MergeRequest) -> Result<MergeOutcome> {
        let ids = &merge.request_ids;
        if ids.len() < 2 {
            return Err(Error::InvalidInput(
                "Merge needs at least two requests".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        if let Some(duplicate) = ids.iter().find(|id| !seen.insert(id.as_str())) {
            return Err(Error::InvalidInput(format!(
                "Request {} listed more than once",
                duplicate
            )));
        }
        if !ids.contains(&merge.keep_target_from) {
            return Err(Error::InvalidInput(format!(
                "keep_target_from {} is not one of the merged requests",
                merge.keep_target_from
            )));
        }

        let mut kept = None;
        let mut absorbed = Vec::with_capacity(ids.len() - 1);
        for id in ids {
            let request = self.requests.require(id).await?;
            if let Some(parent) = &request.merged_into {
                return Err(Error::InvalidInput(format!(
                    "Request {} is already merged into {}",
                    id, parent
                )));
            }
            if *id == merge.keep_target_from {
                kept = Some(request);
            } else {
                absorbed.push(request);
            }
        }
        let Some(mut kept) = kept else {
            return Err(Error::Internal("kept request not loaded".to_string()));
        };

        for other in &absorbed {
            if other.requester_id != kept.requester_id {
                return Err(Error::InvalidInput(format!(
                    "Requests {} and {} belong to different requesters",
                    kept.id, other.id
                )));
            }
            if other.session_id != kept.session_id {
                return Err(Error::InvalidInput(format!(
                    "Requests {} and {} belong to different sessions",
                    kept.id, other.id
                )));
            }
        }
        if merge.final_type.requires_target() && kept.target_id.is_none() {
            return Err(Error::InvalidInput(format!(
                "Request {} has no target for a {} request",
                kept.id, merge.final_type
            )));
        }

        let absorbed_ids: Vec<String> = absorbed.iter().map(|r| r.id.clone()).collect();
        let absorbed_sources = self.provenance.sources_for_batch(&absorbed_ids).await?;
        let mut nested_children = Vec::new();
        for other in &absorbed {
            nested_children.extend(self.requests.merged_children(&other.id).await?);
        }

        let mut metadata = kept.metadata.clone();
        if !metadata.contains_key(PRE_MERGE_SOURCE_FIELDS_KEY) {
            let own_sources = self.provenance.sources_for(&kept.id).await?;
            metadata.insert(
                PRE_MERGE_SOURCE_FIELDS_KEY.to_string(),
                Value::from(kept.source_fields.clone()),
            );
            metadata.insert(PRE_MERGE_SOURCES_KEY.to_string(), Value::from(own_sources));
        }
        let mut merged_from = string_list(&metadata, MERGED_FROM_KEY);
        let mut merged_sources = object(&metadata, MERGED_SOURCES_KEY);
        let mut merged_fields = object(&metadata, MERGED_SOURCE_FIELDS_KEY);

        let mut confidence = kept.confidence_score;
        for other in &absorbed {
            push_unique(&mut merged_from, &other.id);
            let sources = absorbed_sources.get(&other.id).cloned().unwrap_or_default();
            merged_sources.insert(other.id.clone(), Value::from(sources));
            merged_fields.insert(other.id.clone(), Value::from(other.source_fields.clone()));

            // Requests the absorbed one had merged itself now hang off the kept one
            for nested in string_list(&other.metadata, MERGED_FROM_KEY) {
                push_unique(&mut merged_from, &nested);
            }
            for (key, value) in object(&other.metadata, MERGED_SOURCES_KEY) {
                merged_sources.entry(key).or_insert(value);
            }
            for (key, value) in object(&other.metadata, MERGED_SOURCE_FIELDS_KEY) {
                merged_fields.entry(key).or_insert(value);
            }

            for field in &other.source_fields {
                kept.add_source_field(field);
            }
            confidence = confidence.max(other.confidence_score);
        }

        metadata.insert(MERGED_FROM_KEY.to_string(), Value::from(merged_from));
        metadata.insert(MERGED_SOURCES_KEY.to_string(), Value::Object(merged_sources));
        metadata.insert(MERGED_SOURCE_FIELDS_KEY.to_string(), Value::Object(merged_fields));
        push_history(
            &mut metadata,
            serde_json::json!({
                "action": "merge",
                "absorbed": absorbed_ids,
                "final_type": merge.final_type.as_str(),
                "at": chrono::Utc::now().to_rfc3339(),
            }),
        );

        let mut transferred_links = 0;
        for other in &absorbed {
            transferred_links += self.provenance.transfer_all_sources(&other.id, &kept.id).await?;
            self.requests.soft_delete(&other.id, &kept.id).await?;
        }
        for child in &nested_children {
            self.requests.soft_delete(&child.id, &kept.id).await?;
        }

        kept.request_type = merge.final_type;
        kept.confidence_score = confidence;
        kept.metadata = metadata;
        self.requests.update(&kept).await?;
        self.ensure_primary(&kept.id).await?;

        tracing::info!(
            kept = %kept.id,
            absorbed = absorbed_ids.len(),
            transferred_links,
            "Merged bunk requests"
        );
        Ok(MergeOutcome {
            kept_id: kept.id,
            absorbed_ids,
            transferred_links,
        })
    }

    /// Undo merges into `request_id`, one entry per absorbed request.
    ///
    /// **Algorithm:**
    /// 1. Validate every entry: not the kept request itself, listed once,
    ///    and either a soft-deleted child of `request_id` (restore) or an id
    ///    in `merged_from` with no record left (synthesize)
    /// 2. Restore by clearing `merged_into` (applying the new type/target),
    ///    or create a fresh request for a synthesized id
    /// 3. Move the absorbed sources back; sources the kept request owned
    ///    before merging are copied rather than moved
    /// 4. Drop the absorbed fields from the kept request unless its
    ///    pre-merge fields, a remaining link, or another absorbed request
    ///    still accounts for them; drop the id from `merged_from`
    pub async fn split(&self, request_id: &str, entries: &[SplitSource]) -> Result<SplitOutcome> {
        if entries.is_empty() {
            return Err(Error::InvalidInput("Nothing to split".to_string()));
        }
        let mut kept = self.requests.require(request_id).await?;
        if let Some(parent) = &kept.merged_into {
            return Err(Error::InvalidInput(format!(
                "Request {} is itself merged into {}",
                request_id, parent
            )));
        }

        let children: HashMap<String, BunkRequest> = self
            .requests
            .merged_children(request_id)
            .await?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        let mut merged_from = string_list(&kept.metadata, MERGED_FROM_KEY);
        let mut merged_sources = object(&kept.metadata, MERGED_SOURCES_KEY);
        let mut merged_fields = object(&kept.metadata, MERGED_SOURCE_FIELDS_KEY);

        let mut plans = Vec::with_capacity(entries.len());
        let mut seen = HashSet::new();
        for entry in entries {
            let id = entry.absorbed_request_id.as_str();
            if id == request_id {
                return Err(Error::InvalidInput(format!(
                    "Cannot split request {} from itself",
                    request_id
                )));
            }
            if !seen.insert(id) {
                return Err(Error::InvalidInput(format!("Request {} listed more than once", id)));
            }

            if let Some(child) = children.get(id) {
                let mut restored = child.clone();
                restored.merged_into = None;
                // Recorded fields lose whatever a changed source took away
                if merged_fields.contains_key(id) {
                    restored.source_fields = list_entry(&merged_fields, id);
                }
                if let Some(request_type) = entry.new_type {
                    restored.request_type = request_type;
                }
                if let Some(target_id) = entry.new_target_id {
                    restored.target_id = Some(target_id);
                }
                if !restored.request_type.requires_target() {
                    restored.target_id = None;
                } else if restored.target_id.is_none() {
                    return Err(Error::InvalidInput(format!(
                        "Request {} needs a target for a {} request",
                        id, restored.request_type
                    )));
                }
                plans.push(SplitPlan::Restore(restored));
            } else if merged_from.iter().any(|m| m == id) && self.requests.get(id).await?.is_none() {
                let request_type = entry.new_type.unwrap_or(kept.request_type);
                let target_id = if request_type.requires_target() {
                    Some(entry.new_target_id.ok_or_else(|| {
                        Error::InvalidInput(format!(
                            "Request {} no longer exists; new_target_id is required to recreate it",
                            id
                        ))
                    })?)
                } else {
                    None
                };
                let mut request =
                    BunkRequest::new(kept.requester_id, target_id, request_type, kept.session_id, kept.year);
                request.priority = kept.priority;
                request.confidence_score = kept.confidence_score;
                request.status = RequestStatus::Pending;
                for field in list_entry(&merged_fields, id) {
                    request.add_source_field(&field);
                }
                request
                    .metadata
                    .insert(SYNTHESIZED_FROM_KEY.to_string(), Value::from(id));
                request
                    .metadata
                    .insert(SPLIT_FROM_KEY.to_string(), Value::from(request_id));
                plans.push(SplitPlan::Synthesize {
                    legacy_id: id.to_string(),
                    request,
                });
            } else {
                return Err(Error::InvalidInput(format!(
                    "Request {} is not a merged request of {}",
                    id, request_id
                )));
            }
        }

        let pre_merge_fields = kept
            .metadata
            .contains_key(PRE_MERGE_SOURCE_FIELDS_KEY)
            .then(|| string_list(&kept.metadata, PRE_MERGE_SOURCE_FIELDS_KEY));
        let own_sources: HashSet<String> = string_list(&kept.metadata, PRE_MERGE_SOURCES_KEY)
            .into_iter()
            .collect();

        let mut outcome = SplitOutcome::default();
        let mut released_fields: Vec<String> = Vec::new();
        for plan in plans {
            let (absorbed_id, new_id, fields) = match plan {
                SplitPlan::Restore(restored) => {
                    self.requests.update(&restored).await?;
                    outcome.restored.push(restored.id.clone());
                    let fields = match merged_fields.get(&restored.id) {
                        Some(_) => list_entry(&merged_fields, &restored.id),
                        None => restored.source_fields.clone(),
                    };
                    (restored.id.clone(), restored.id, fields)
                }
                SplitPlan::Synthesize { legacy_id, request } => {
                    let created = self.requests.create(&request).await?;
                    tracing::info!(
                        legacy_id = %legacy_id,
                        bunk_request = %created.id,
                        "Recreated merged request with no remaining record"
                    );
                    outcome.synthesized.push(SynthesizedRequest {
                        legacy_id: legacy_id.clone(),
                        request_id: created.id.clone(),
                    });
                    (legacy_id, created.id, created.source_fields)
                }
            };

            let originals = list_entry(&merged_sources, &absorbed_id);
            self.return_links(&kept.id, &new_id, &originals, &fields, &own_sources)
                .await?;

            merged_from.retain(|m| *m != absorbed_id);
            merged_sources.remove(&absorbed_id);
            merged_fields.remove(&absorbed_id);
            released_fields.extend(fields);
        }

        match pre_merge_fields {
            Some(pre_merge) => {
                let linked_fields: HashSet<String> = self
                    .provenance
                    .links_with_fields(&kept.id)
                    .await?
                    .into_iter()
                    .filter_map(|l| l.source_field)
                    .collect();
                let still_absorbed: HashSet<String> = merged_fields
                    .keys()
                    .flat_map(|id| list_entry(&merged_fields, id))
                    .collect();
                for field in &released_fields {
                    if !pre_merge.contains(field)
                        && !linked_fields.contains(field)
                        && !still_absorbed.contains(field)
                    {
                        kept.remove_source_field(field);
                    }
                }
            }
            None => tracing::debug!(
                bunk_request = %kept.id,
                "No pre-merge fields recorded, keeping source fields"
            ),
        }

        let mut metadata = kept.metadata.clone();
        if merged_from.is_empty() {
            for key in [
                MERGED_FROM_KEY,
                MERGED_SOURCES_KEY,
                MERGED_SOURCE_FIELDS_KEY,
                PRE_MERGE_SOURCE_FIELDS_KEY,
                PRE_MERGE_SOURCES_KEY,
            ] {
                metadata.remove(key);
            }
        } else {
            metadata.insert(MERGED_FROM_KEY.to_string(), Value::from(merged_from));
            metadata.insert(MERGED_SOURCES_KEY.to_string(), Value::Object(merged_sources));
            metadata.insert(MERGED_SOURCE_FIELDS_KEY.to_string(), Value::Object(merged_fields));
        }
        push_history(
            &mut metadata,
            serde_json::json!({
                "action": "split",
                "restored": outcome.restored,
                "synthesized": outcome.synthesized.iter().map(|s| s.legacy_id.as_str()).collect::<Vec<_>>(),
                "at": chrono::Utc::now().to_rfc3339(),
            }),
        );
        kept.metadata = metadata;
        self.requests.update(&kept).await?;
        self.ensure_primary(&kept.id).await?;

        tracing::info!(
            kept = %kept.id,
            restored = outcome.restored.len(),
            synthesized = outcome.synthesized.len(),
            "Split bunk request"
        );
        Ok(outcome)
    }

    /// Move links for `originals` from the kept request to `to_id`.
    ///
    /// With no recorded originals (merged before sources were recorded),
    /// non-primary links carrying one of `fields` are moved instead. The
    /// new link is created before the old one is removed.
    async fn return_links(
        &self,
        kept_id: &str,
        to_id: &str,
        originals: &[String],
        fields: &[String],
        own_sources: &HashSet<String>,
    ) -> Result<usize> {
        let kept_links = self.provenance.links_for(kept_id).await?;
        let chosen: Vec<&SourceLink> = if originals.is_empty() {
            kept_links
                .iter()
                .filter(|l| {
                    !l.is_primary
                        && !own_sources.contains(&l.original_request_id)
                        && l.source_field.as_ref().map_or(false, |f| fields.contains(f))
                })
                .collect()
        } else {
            kept_links
                .iter()
                .filter(|l| originals.contains(&l.original_request_id))
                .collect()
        };

        let mut moved = 0;
        for (i, link) in chosen.iter().enumerate() {
            self.provenance
                .add_link(to_id, &link.original_request_id, i == 0, link.source_field.as_deref())
                .await?;
            if !own_sources.contains(&link.original_request_id) {
                self.provenance
                    .remove_link(kept_id, &link.original_request_id)
                    .await?;
            }
            moved += 1;
        }
        self.ensure_primary(to_id).await?;

        tracing::debug!(from = %kept_id, to = %to_id, moved, "Returned source links");
        Ok(moved)
    }

    /// Promote the oldest link when a request has links but no primary
    async fn ensure_primary(&self, bunk_request_id: &str) -> Result<()> {
        let links = self.provenance.links_for(bunk_request_id).await?;
        if links.iter().any(|l| l.is_primary) {
            return Ok(());
        }
        if let Some(first) = links.first() {
            self.provenance
                .transfer_primary(bunk_request_id, &first.original_request_id)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, RecordStore};
    use std::sync::Arc;

    struct Fixture {
        coordinator: MergeSplitCoordinator,
        requests: RequestStore,
        provenance: ProvenanceStore,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let requests = RequestStore::new(store.clone());
        let provenance = ProvenanceStore::new(store);
        Fixture {
            coordinator: MergeSplitCoordinator::new(requests.clone(), provenance.clone()),
            requests,
            provenance,
        }
    }

    impl Fixture {
        async fn seed(&self, requester: i64, target: i64, field: &str, original: &str, confidence: f64) -> String {
            let mut request = BunkRequest::new(requester, Some(target), RequestType::BunkWith, 10, 2025);
            request.add_source_field(field);
            request.confidence_score = confidence;
            let id = self.requests.create(&request).await.unwrap().id;
            self.provenance.add_link(&id, original, true, Some(field)).await.unwrap();
            id
        }
    }

    fn merge_of(ids: &[&String], keep: &str) -> MergeRequest {
        MergeRequest {
            request_ids: ids.iter().map(|id| id.to_string()).collect(),
            keep_target_from: keep.to_string(),
            final_type: RequestType::BunkWith,
        }
    }

    #[tokio::test]
    async fn test_merge_validation_rejects_without_writes() {
        let f = fixture();
        let a = f.seed(1, 2, "share_bunk_with", "orig-a", 0.8).await;
        let other = f.seed(9, 2, "share_bunk_with", "orig-x", 0.8).await;

        let single = f.coordinator.merge(&merge_of(&[&a], &a)).await;
        assert!(matches!(single, Err(Error::InvalidInput(_))));

        let outside = f.coordinator.merge(&merge_of(&[&a, &other], "zzz")).await;
        assert!(matches!(outside, Err(Error::InvalidInput(_))));

        let mixed = f.coordinator.merge(&merge_of(&[&a, &other], &a)).await;
        assert!(matches!(mixed, Err(Error::InvalidInput(_))));

        let missing = "missing".to_string();
        let absent = f.coordinator.merge(&merge_of(&[&a, &missing], &a)).await;
        assert!(matches!(absent, Err(Error::NotFound(_))));

        assert!(f.requests.require(&other).await.unwrap().is_live());
        assert_eq!(f.provenance.count_sources(&a).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_merge_moves_provenance_and_soft_deletes() {
        let f = fixture();
        let a = f.seed(1, 2, "share_bunk_with", "orig-a", 0.7).await;
        let b = f.seed(1, 2, "bunking_notes", "orig-b", 0.9).await;

        let outcome = f.coordinator.merge(&merge_of(&[&a, &b], &a)).await.unwrap();
        assert_eq!(outcome.kept_id, a);
        assert_eq!(outcome.absorbed_ids, vec![b.clone()]);
        assert_eq!(outcome.transferred_links, 1);

        let kept = f.requests.require(&a).await.unwrap();
        assert_eq!(kept.source_fields, vec!["share_bunk_with", "bunking_notes"]);
        assert_eq!(kept.confidence_score, 0.9);
        assert_eq!(kept.metadata.get(MERGED_FROM_KEY), Some(&Value::from(vec![b.clone()])));

        let absorbed = f.requests.require(&b).await.unwrap();
        assert_eq!(absorbed.merged_into.as_deref(), Some(a.as_str()));

        let links = f.provenance.links_for(&a).await.unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links.iter().filter(|l| l.is_primary).count(), 1);
        assert_eq!(f.provenance.count_sources(&b).await.unwrap(), 0);

        // Absorbed requests cannot be merged again
        let c = f.seed(1, 2, "internal_notes", "orig-c", 0.5).await;
        let again = f.coordinator.merge(&merge_of(&[&b, &c], &c)).await;
        assert!(matches!(again, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_split_round_trip() {
        let f = fixture();
        let a = f.seed(1, 2, "share_bunk_with", "orig-a", 0.7).await;
        let b = f.seed(1, 2, "bunking_notes", "orig-b", 0.9).await;
        f.coordinator.merge(&merge_of(&[&a, &b], &a)).await.unwrap();

        let outcome = f
            .coordinator
            .split(
                &a,
                &[SplitSource {
                    absorbed_request_id: b.clone(),
                    new_type: Some(RequestType::NotBunkWith),
                    new_target_id: None,
                }],
            )
            .await
            .unwrap();
        assert_eq!(outcome.restored, vec![b.clone()]);
        assert!(outcome.synthesized.is_empty());

        let kept = f.requests.require(&a).await.unwrap();
        assert_eq!(kept.source_fields, vec!["share_bunk_with"]);
        assert!(kept.metadata.get(MERGED_FROM_KEY).is_none());
        assert_eq!(f.provenance.sources_for(&a).await.unwrap(), vec!["orig-a"]);

        let restored = f.requests.require(&b).await.unwrap();
        assert!(restored.merged_into.is_none());
        assert_eq!(restored.request_type, RequestType::NotBunkWith);
        assert_eq!(restored.target_id, Some(2));
        assert_eq!(f.provenance.primary_source(&b).await.unwrap().as_deref(), Some("orig-b"));
    }

    #[tokio::test]
    async fn test_split_rejections() {
        let f = fixture();
        let a = f.seed(1, 2, "share_bunk_with", "orig-a", 0.7).await;
        let b = f.seed(1, 2, "bunking_notes", "orig-b", 0.9).await;
        let stranger = f.seed(1, 3, "bunking_notes", "orig-s", 0.9).await;
        f.coordinator.merge(&merge_of(&[&a, &b], &a)).await.unwrap();

        let entry = |id: &str| SplitSource {
            absorbed_request_id: id.to_string(),
            new_type: None,
            new_target_id: None,
        };

        let itself = f.coordinator.split(&a, &[entry(&a)]).await;
        assert!(matches!(itself, Err(Error::InvalidInput(_))));

        // One bad entry rejects the whole call
        let mixed = f.coordinator.split(&a, &[entry(&b), entry(&stranger)]).await;
        assert!(matches!(mixed, Err(Error::InvalidInput(_))));
        assert!(!f.requests.require(&b).await.unwrap().is_live());
    }

    #[tokio::test]
    async fn test_split_synthesizes_hard_deleted_request() {
        let f = fixture();
        let a = f.seed(1, 2, "share_bunk_with", "orig-a", 0.7).await;
        let b = f.seed(1, 4, "bunking_notes", "orig-b", 0.9).await;
        f.coordinator.merge(&merge_of(&[&a, &b], &a)).await.unwrap();
        // Old merges removed the absorbed record outright
        f.requests.delete(&b).await.unwrap();

        let without_target = f
            .coordinator
            .split(
                &a,
                &[SplitSource {
                    absorbed_request_id: b.clone(),
                    new_type: None,
                    new_target_id: None,
                }],
            )
            .await;
        assert!(matches!(without_target, Err(Error::InvalidInput(_))));

        let outcome = f
            .coordinator
            .split(
                &a,
                &[SplitSource {
                    absorbed_request_id: b.clone(),
                    new_type: None,
                    new_target_id: Some(4),
                }],
            )
            .await
            .unwrap();
        assert!(outcome.restored.is_empty());
        assert_eq!(outcome.synthesized.len(), 1);
        assert_eq!(outcome.synthesized[0].legacy_id, b);

        let created = f.requests.require(&outcome.synthesized[0].request_id).await.unwrap();
        assert_eq!(created.target_id, Some(4));
        assert_eq!(created.source_fields, vec!["bunking_notes"]);
        assert_eq!(created.metadata.get(SYNTHESIZED_FROM_KEY), Some(&Value::from(b.as_str())));
        assert_eq!(
            f.provenance.sources_for(&created.id).await.unwrap(),
            vec!["orig-b"]
        );
    }

    fn link(original: &str, field: &str) -> SourceLink {
        SourceLink {
            id: format!("link-{}", original),
            bunk_request_id: "kept".to_string(),
            original_request_id: original.to_string(),
            is_primary: false,
            source_field: Some(field.to_string()),
        }
    }

    #[test]
    fn test_forget_merged_source_prunes_record() {
        let mut metadata = match serde_json::json!({
            "merged_from": ["b", "c"],
            "merged_sources": {"b": ["x"], "c": ["y", "z"]},
            "merged_source_fields": {"b": ["share_bunk_with"], "c": ["bunking_notes", "internal_notes"]},
            "pre_merge_source_fields": ["socialize_with"],
            "pre_merge_sources": ["own"],
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let links = vec![link("own", "socialize_with"), link("y", "bunking_notes"), link("z", "internal_notes")];

        let stale = forget_merged_source(&mut metadata, "x", Some("share_bunk_with"), true, &links);
        assert!(stale.changed);
        assert_eq!(stale.orphaned, vec!["b"]);
        assert_eq!(string_list(&metadata, MERGED_FROM_KEY), vec!["c"]);
        assert!(!object(&metadata, MERGED_SOURCES_KEY).contains_key("b"));
        assert_eq!(metadata[MERGE_HISTORY_KEY].as_array().map(Vec::len), Some(1));

        // c keeps z, and with it only the field z carries
        let stale = forget_merged_source(&mut metadata, "y", Some("bunking_notes"), true, &links);
        assert!(stale.orphaned.is_empty());
        assert_eq!(list_entry(&object(&metadata, MERGED_SOURCES_KEY), "c"), vec!["z"]);
        assert_eq!(
            list_entry(&object(&metadata, MERGED_SOURCE_FIELDS_KEY), "c"),
            vec!["internal_notes"]
        );

        // The kept request's own source leaves the pre-merge record
        let stale = forget_merged_source(&mut metadata, "own", Some("socialize_with"), true, &links);
        assert!(stale.changed);
        assert!(string_list(&metadata, PRE_MERGE_SOURCES_KEY).is_empty());
        assert!(string_list(&metadata, PRE_MERGE_SOURCE_FIELDS_KEY).is_empty());

        // Unknown sources change nothing
        let before = metadata.clone();
        let stale = forget_merged_source(&mut metadata, "elsewhere", None, false, &links);
        assert_eq!(stale, StaleSource::default());
        assert_eq!(metadata, before);
    }

    #[test]
    fn test_forget_last_absorbed_source_clears_record() {
        let mut metadata = match serde_json::json!({
            "merged_from": ["b"],
            "merged_sources": {"b": ["x"]},
            "merged_source_fields": {"b": ["bunking_notes"]},
            "pre_merge_source_fields": ["share_bunk_with"],
            "pre_merge_sources": ["own"],
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };

        let stale = forget_merged_source(&mut metadata, "x", Some("bunking_notes"), true, &[]);

        assert_eq!(stale.orphaned, vec!["b"]);
        for key in [MERGED_FROM_KEY, MERGED_SOURCES_KEY, PRE_MERGE_SOURCES_KEY] {
            assert!(!metadata.contains_key(key), "{} left behind", key);
        }
        assert!(metadata.contains_key(MERGE_HISTORY_KEY));
    }
}
