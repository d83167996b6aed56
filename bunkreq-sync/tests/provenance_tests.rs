//! Provenance store integration tests
//!
//! Test Coverage:
//! - Primary uniqueness across add_link / transfer_primary / merge
//! - Batch lookups agree with the singular forms
//! - Duplicate links swallowed in single and batch adds
//! - Legacy links without a source field
//! - Multi-page scans and drains

mod helpers;

use bunkreq_common::db::SOURCE_LINKS;
use bunkreq_sync::db::ProvenanceStore;
use bunkreq_sync::models::{NewSourceLink, RequestType};
use bunkreq_sync::services::MergeRequest;
use bunkreq_sync::store::{Collection, MemoryStore, RecordStore};
use helpers::{memory_engine, seed_request};
use serde_json::{json, Value};
use std::sync::Arc;

fn small_pages() -> (ProvenanceStore, Arc<dyn RecordStore>) {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    (ProvenanceStore::new(store.clone()).with_page_size(3), store)
}

async fn primaries(provenance: &ProvenanceStore, id: &str) -> usize {
    provenance
        .links_for(id)
        .await
        .unwrap()
        .iter()
        .filter(|l| l.is_primary)
        .count()
}

#[tokio::test]
async fn test_primary_stays_unique() {
    let engine = memory_engine();
    let a = seed_request(&engine, 1, 2, &[("orig-a", "share_bunk_with")], false).await;
    let b = seed_request(&engine, 1, 2, &[("orig-b", "bunking_notes")], false).await;

    // A second primary request is demoted
    assert!(engine.provenance.add_link(&a, "orig-c", true, Some("internal_notes")).await.unwrap());
    assert_eq!(primaries(&engine.provenance, &a).await, 1);

    assert!(engine.provenance.transfer_primary(&a, "orig-c").await.unwrap());
    assert_eq!(primaries(&engine.provenance, &a).await, 1);
    assert_eq!(engine.provenance.primary_source(&a).await.unwrap().as_deref(), Some("orig-c"));

    assert!(!engine.provenance.transfer_primary(&a, "not-linked").await.unwrap());
    assert_eq!(engine.provenance.primary_source(&a).await.unwrap().as_deref(), Some("orig-c"));

    engine
        .merge_split
        .merge(&MergeRequest {
            request_ids: vec![a.clone(), b.clone()],
            keep_target_from: a.clone(),
            final_type: RequestType::BunkWith,
        })
        .await
        .unwrap();
    assert_eq!(engine.provenance.count_sources(&a).await.unwrap(), 3);
    assert_eq!(primaries(&engine.provenance, &a).await, 1);
}

#[tokio::test]
async fn test_duplicate_links_are_swallowed() {
    let (provenance, _) = small_pages();

    assert!(provenance.add_link("br", "orig", true, None).await.unwrap());
    assert!(!provenance.add_link("br", "orig", false, None).await.unwrap());

    let created = provenance
        .add_links_batch(&[
            NewSourceLink::new("br", "orig", false, None),
            NewSourceLink::new("br", "orig-2", true, Some("bunking_notes".to_string())),
            NewSourceLink::new("br", "orig-2", false, None),
            NewSourceLink::new("other", "orig", true, None),
        ])
        .await
        .unwrap();

    assert_eq!(created, 2);
    assert_eq!(provenance.count_sources("br").await.unwrap(), 2);
    assert_eq!(primaries(&provenance, "br").await, 1);
    assert_eq!(provenance.requests_for("orig").await.unwrap(), vec!["br", "other"]);
}

#[tokio::test]
async fn test_batch_lookup_matches_singular() {
    let (provenance, _) = small_pages();
    let ids: Vec<String> = (0..120).map(|i| format!("br-{}", i)).collect();
    for (i, id) in ids.iter().enumerate() {
        for n in 0..(i % 3) {
            provenance
                .add_link(id, &format!("orig-{}-{}", i, n), n == 0, None)
                .await
                .unwrap();
        }
    }

    let batch = provenance.sources_for_batch(&ids).await.unwrap();

    assert_eq!(batch.len(), ids.len());
    for id in &ids {
        assert_eq!(batch[id], provenance.sources_for(id).await.unwrap(), "{}", id);
    }
    assert!(batch["br-0"].is_empty());
}

#[tokio::test]
async fn test_legacy_link_without_field() {
    let (provenance, store) = small_pages();
    let links = Collection::new(store, SOURCE_LINKS);
    let legacy = match json!({"bunk_request": "br", "original_request": "old", "is_primary": true}) {
        Value::Object(map) => map,
        _ => unreachable!(),
    };
    links.create(legacy).await.unwrap();
    provenance.add_link("br", "new", false, Some("bunking_notes")).await.unwrap();

    let with_fields = provenance.links_with_fields("br").await.unwrap();

    assert_eq!(with_fields.len(), 2);
    assert_eq!(with_fields[0].original_request_id, "old");
    assert_eq!(with_fields[0].source_field, None);
    assert!(with_fields[0].is_primary);
    assert_eq!(with_fields[1].source_field.as_deref(), Some("bunking_notes"));
}

#[tokio::test]
async fn test_scans_cover_every_page() {
    let (provenance, _) = small_pages();
    for n in 0..10 {
        provenance
            .add_link("br", &format!("orig-{}", n), n == 0, None)
            .await
            .unwrap();
    }

    assert_eq!(provenance.links_for("br").await.unwrap().len(), 10);
    assert_eq!(provenance.count_sources("br").await.unwrap(), 10);
    assert!(!provenance.is_single_source("br").await.unwrap());

    assert_eq!(provenance.remove_all_links("br").await.unwrap(), 10);
    assert_eq!(provenance.count_sources("br").await.unwrap(), 0);
}

#[tokio::test]
async fn test_transfer_all_sources_skips_existing() {
    let (provenance, _) = small_pages();
    provenance.add_link("from", "shared", true, Some("share_bunk_with")).await.unwrap();
    provenance.add_link("from", "only-from", false, Some("bunking_notes")).await.unwrap();
    provenance.add_link("to", "shared", true, Some("share_bunk_with")).await.unwrap();

    let created = provenance.transfer_all_sources("from", "to").await.unwrap();

    assert_eq!(created, 1);
    assert_eq!(provenance.count_sources("from").await.unwrap(), 0);
    assert_eq!(provenance.sources_for("to").await.unwrap(), vec!["shared", "only-from"]);
    assert_eq!(primaries(&provenance, "to").await, 1);
}
