//! Seed data builders

use bunkreq_common::SyncConfig;
use bunkreq_sync::models::{BunkRequest, ParsedRequest, Person, RequestType, SourceRow};
use bunkreq_sync::store::{MemoryStore, RecordStore};
use bunkreq_sync::SyncEngine;
use serde_json::Map;
use std::sync::Arc;

pub const SESSION: i64 = 10;
pub const YEAR: i32 = 2025;

/// Engine over a fresh memory store with default configuration
pub fn memory_engine() -> SyncEngine {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    SyncEngine::new(store, SyncConfig::default())
}

/// Persist a bunk_with request linked to `(original, field)` sources (first is primary)
pub async fn seed_request(
    engine: &SyncEngine,
    requester_id: i64,
    target_id: i64,
    sources: &[(&str, &str)],
    locked: bool,
) -> String {
    let mut request = BunkRequest::new(requester_id, Some(target_id), RequestType::BunkWith, SESSION, YEAR);
    request.locked = locked;
    request.confidence_score = 0.9;
    for (_, field) in sources {
        request.add_source_field(field);
    }
    let id = engine.requests.create(&request).await.unwrap().id;
    for (i, (original, field)) in sources.iter().enumerate() {
        engine
            .provenance
            .add_link(&id, original, i == 0, Some(field))
            .await
            .unwrap();
    }
    id
}

pub fn row(requester_id: i64, field: &str, content: &str) -> SourceRow {
    SourceRow {
        requester_id,
        field: field.to_string(),
        session_id: SESSION,
        year: YEAR,
        content: content.to_string(),
    }
}

pub fn person(person_id: i64, first: &str, last: &str) -> Person {
    Person {
        person_id,
        first_name: first.to_string(),
        last_name: last.to_string(),
        household_id: None,
    }
}

pub fn bunk_with(target: &str) -> ParsedRequest {
    ParsedRequest {
        request_type: RequestType::BunkWith,
        target_name: Some(target.to_string()),
        source_field: String::new(),
        confidence: 0.9,
        metadata: Map::new(),
    }
}
