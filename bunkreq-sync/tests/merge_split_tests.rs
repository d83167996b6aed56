//! Merge/split coordinator integration tests
//!
//! Test Coverage:
//! - Merge then split round trip keeps the survivor's own fields
//! - Partial split of a three-way merge
//! - Shared fields stay while another absorbed request still carries them
//! - Rejected calls leave the store untouched
//! - Split after an absorbed request's source changed

mod helpers;

use bunkreq_common::Error;
use bunkreq_sync::models::RequestType;
use bunkreq_sync::services::merge_split::{MERGED_FROM_KEY, MERGE_HISTORY_KEY};
use bunkreq_sync::services::{MergeRequest, SplitSource};
use bunkreq_sync::SyncEngine;
use helpers::{memory_engine, seed_request};
use serde_json::Value;

fn merge(ids: &[&String], keep: &String) -> MergeRequest {
    MergeRequest {
        request_ids: ids.iter().map(|id| (*id).clone()).collect(),
        keep_target_from: keep.clone(),
        final_type: RequestType::BunkWith,
    }
}

fn split_entry(id: &str) -> SplitSource {
    SplitSource {
        absorbed_request_id: id.to_string(),
        new_type: None,
        new_target_id: None,
    }
}

fn merged_from(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

async fn three_requests(engine: &SyncEngine) -> (String, String, String) {
    let a = seed_request(
        engine,
        1,
        2,
        &[("orig-a1", "share_bunk_with"), ("orig-a2", "bunking_notes")],
        false,
    )
    .await;
    let b = seed_request(engine, 1, 2, &[("orig-b", "internal_notes")], false).await;
    let c = seed_request(engine, 1, 2, &[("orig-c", "socialize_with")], false).await;
    (a, b, c)
}

#[tokio::test]
async fn test_merge_split_round_trip() {
    let engine = memory_engine();
    let (a, b, _) = three_requests(&engine).await;
    let original_fields = engine.requests.require(&a).await.unwrap().source_fields;

    let outcome = engine.merge_split.merge(&merge(&[&a, &b], &a)).await.unwrap();
    assert_eq!(outcome.absorbed_ids, vec![b.clone()]);

    let split = engine.merge_split.split(&a, &[split_entry(&b)]).await.unwrap();
    assert_eq!(split.restored, vec![b.clone()]);

    let kept = engine.requests.require(&a).await.unwrap();
    for field in &original_fields {
        assert!(kept.source_fields.contains(field), "lost {}", field);
    }
    assert!(!kept.source_fields.contains(&"internal_notes".to_string()));
    assert!(merged_from(kept.metadata.get(MERGED_FROM_KEY)).is_empty());
    assert_eq!(
        kept.metadata
            .get(MERGE_HISTORY_KEY)
            .and_then(Value::as_array)
            .map(Vec::len),
        Some(2)
    );

    let restored = engine.requests.require(&b).await.unwrap();
    assert!(restored.merged_into.is_none());
    assert_eq!(engine.provenance.sources_for(&b).await.unwrap(), vec!["orig-b"]);
    assert_eq!(
        engine.provenance.sources_for(&a).await.unwrap(),
        vec!["orig-a1", "orig-a2"]
    );
}

#[tokio::test]
async fn test_partial_split_of_three_way_merge() {
    let engine = memory_engine();
    let (a, b, c) = three_requests(&engine).await;
    engine.merge_split.merge(&merge(&[&a, &b, &c], &a)).await.unwrap();

    let kept = engine.requests.require(&a).await.unwrap();
    assert_eq!(
        kept.source_fields,
        vec!["share_bunk_with", "bunking_notes", "internal_notes", "socialize_with"]
    );
    assert_eq!(engine.requests.merged_children(&a).await.unwrap().len(), 2);

    engine.merge_split.split(&a, &[split_entry(&c)]).await.unwrap();

    let kept = engine.requests.require(&a).await.unwrap();
    assert_eq!(merged_from(kept.metadata.get(MERGED_FROM_KEY)), vec![b.clone()]);
    assert!(kept.source_fields.contains(&"internal_notes".to_string()));
    assert!(!kept.source_fields.contains(&"socialize_with".to_string()));
    assert!(engine.requests.require(&c).await.unwrap().is_live());
    assert!(!engine.requests.require(&b).await.unwrap().is_live());

    // Splitting c again: it is no longer a merged request
    let again = engine.merge_split.split(&a, &[split_entry(&c)]).await;
    assert!(matches!(again, Err(Error::InvalidInput(_))));
}

#[tokio::test]
async fn test_shared_field_survives_split() {
    let engine = memory_engine();
    let a = seed_request(&engine, 1, 2, &[("orig-a", "share_bunk_with")], false).await;
    let b = seed_request(&engine, 1, 2, &[("orig-b", "bunking_notes")], false).await;
    let c = seed_request(&engine, 1, 2, &[("orig-c", "bunking_notes")], false).await;
    engine.merge_split.merge(&merge(&[&a, &b, &c], &a)).await.unwrap();

    engine.merge_split.split(&a, &[split_entry(&b)]).await.unwrap();

    // c still contributes bunking_notes through its transferred link
    let kept = engine.requests.require(&a).await.unwrap();
    assert_eq!(kept.source_fields, vec!["share_bunk_with", "bunking_notes"]);
}

#[tokio::test]
async fn test_rejected_merge_changes_nothing() {
    let engine = memory_engine();
    let a = seed_request(&engine, 1, 2, &[("orig-a", "share_bunk_with")], false).await;
    let b = seed_request(&engine, 1, 2, &[("orig-b", "bunking_notes")], false).await;
    let other_session = {
        let mut request = engine.requests.require(&b).await.unwrap();
        request.id = String::new();
        request.session_id = 99;
        engine.requests.create(&request).await.unwrap().id
    };

    let result = engine
        .merge_split
        .merge(&merge(&[&a, &b, &other_session], &a))
        .await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));
    assert_eq!(result.err().map(|e| e.http_status()), Some(400));

    assert!(engine.requests.require(&b).await.unwrap().is_live());
    assert_eq!(engine.provenance.sources_for(&b).await.unwrap(), vec!["orig-b"]);
    let kept = engine.requests.require(&a).await.unwrap();
    assert!(kept.metadata.get(MERGED_FROM_KEY).is_none());

    let missing = "missing".to_string();
    let not_found = engine.merge_split.merge(&merge(&[&a, &missing], &a)).await;
    assert_eq!(not_found.err().map(|e| e.http_status()), Some(404));
}

#[tokio::test]
async fn test_split_requires_merged_survivor() {
    let engine = memory_engine();
    let (a, b, _) = three_requests(&engine).await;
    engine.merge_split.merge(&merge(&[&a, &b], &a)).await.unwrap();

    // The absorbed request is not a survivor
    let from_absorbed = engine.merge_split.split(&b, &[split_entry(&a)]).await;
    assert!(matches!(from_absorbed, Err(Error::InvalidInput(_))));

    let empty = engine.merge_split.split(&a, &[]).await;
    assert!(matches!(empty, Err(Error::InvalidInput(_))));

    let unknown = engine.merge_split.split("missing", &[split_entry(&b)]).await;
    assert!(matches!(unknown, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_absorbed_request_dropped_when_its_source_changes() {
    let engine = memory_engine();
    let a = seed_request(&engine, 1, 2, &[("orig-a", "share_bunk_with")], false).await;
    let b = seed_request(&engine, 1, 2, &[("orig-b", "bunking_notes")], false).await;
    engine.merge_split.merge(&merge(&[&a, &b], &a)).await.unwrap();

    let result = engine.invalidation.handle_source_change("orig-b").await.unwrap();

    assert_eq!(result.unlinked_requests, vec![a.clone()]);
    assert_eq!(result.deleted_requests, vec![b.clone()]);
    let kept = engine.requests.require(&a).await.unwrap();
    assert_eq!(kept.source_fields, vec!["share_bunk_with"]);
    assert!(kept.metadata.get(MERGED_FROM_KEY).is_none());
    assert!(engine.requests.get(&b).await.unwrap().is_none());

    // Nothing stale is left to restore
    let split = engine.merge_split.split(&a, &[split_entry(&b)]).await;
    assert!(matches!(split, Err(Error::InvalidInput(_))));
    let again = engine.invalidation.handle_source_change("orig-b").await.unwrap();
    assert_eq!(again.total_affected(), 0);
}

#[tokio::test]
async fn test_split_after_one_absorbed_source_changes() {
    let engine = memory_engine();
    let a = seed_request(&engine, 1, 2, &[("orig-a", "share_bunk_with")], false).await;
    let b = seed_request(
        &engine,
        1,
        2,
        &[("orig-b1", "bunking_notes"), ("orig-b2", "internal_notes")],
        false,
    )
    .await;
    engine.merge_split.merge(&merge(&[&a, &b], &a)).await.unwrap();

    let result = engine.invalidation.handle_source_change("orig-b2").await.unwrap();
    assert_eq!(result.unlinked_requests, vec![a.clone()]);
    assert!(result.deleted_requests.is_empty());

    let split = engine.merge_split.split(&a, &[split_entry(&b)]).await.unwrap();

    assert_eq!(split.restored, vec![b.clone()]);
    let restored = engine.requests.require(&b).await.unwrap();
    assert!(restored.is_live());
    assert_eq!(restored.source_fields, vec!["bunking_notes"]);
    assert_eq!(engine.provenance.sources_for(&b).await.unwrap(), vec!["orig-b1"]);
    assert_eq!(
        engine.provenance.primary_source(&b).await.unwrap().as_deref(),
        Some("orig-b1")
    );

    let kept = engine.requests.require(&a).await.unwrap();
    assert_eq!(kept.source_fields, vec!["share_bunk_with"]);
    assert_eq!(engine.provenance.sources_for(&a).await.unwrap(), vec!["orig-a"]);

    // The restored request is reachable by invalidation again
    let stale = engine.invalidation.handle_source_change("orig-b1").await.unwrap();
    assert_eq!(stale.deleted_requests, vec![b]);
}
