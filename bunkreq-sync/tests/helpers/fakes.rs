//! Test doubles for the store, parser and lookup seams

use async_trait::async_trait;
use bunkreq_common::{Error, Result};
use bunkreq_sync::models::{ParsedRequest, Person, RequesterContext, ResolutionResult};
use bunkreq_sync::services::request_deduplicator::normalize_text;
use bunkreq_sync::services::{HistoricalLookup, PriorBunkmates, RequestParser};
use bunkreq_sync::store::{Filter, ListResult, MemoryStore, Record, RecordStore};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Memory store that fails selected writes
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing_deletes: Mutex<HashSet<String>>,
    failing_creates: Mutex<HashSet<String>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delete of record `id` (any collection) fails
    pub fn fail_deletes_of(&self, id: &str) {
        if let Ok(mut ids) = self.failing_deletes.lock() {
            ids.insert(id.to_string());
        }
    }

    /// Every create in `collection` fails
    pub fn fail_creates_in(&self, collection: &str) {
        if let Ok(mut names) = self.failing_creates.lock() {
            names.insert(collection.to_string());
        }
    }

    pub fn heal(&self) {
        if let Ok(mut ids) = self.failing_deletes.lock() {
            ids.clear();
        }
        if let Ok(mut names) = self.failing_creates.lock() {
            names.clear();
        }
    }

    fn injected(what: &str) -> Error {
        Error::Internal(format!("injected failure: {}", what))
    }
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn create(&self, collection: &str, data: Map<String, Value>) -> Result<Record> {
        let fail = self
            .failing_creates
            .lock()
            .map(|names| names.contains(collection))
            .unwrap_or(false);
        if fail {
            return Err(Self::injected(collection));
        }
        self.inner.create(collection, data).await
    }

    async fn update(&self, collection: &str, id: &str, patch: Map<String, Value>) -> Result<Record> {
        self.inner.update(collection, id, patch).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let fail = self
            .failing_deletes
            .lock()
            .map(|ids| ids.contains(id))
            .unwrap_or(false);
        if fail {
            return Err(Self::injected(id));
        }
        self.inner.delete(collection, id).await
    }

    async fn get_by_id(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        self.inner.get_by_id(collection, id).await
    }

    async fn list(
        &self,
        collection: &str,
        filter: Option<&Filter>,
        page: u32,
        per_page: u32,
    ) -> Result<ListResult> {
        self.inner.list(collection, filter, page, per_page).await
    }
}

/// Parser answering from a script keyed by normalized text.
/// Texts scripted with `fail` return an error; unscripted texts parse to nothing.
#[derive(Default)]
pub struct ScriptedParser {
    parses: HashMap<String, Vec<ParsedRequest>>,
    failures: HashSet<String>,
    people: Vec<Person>,
    /// Resolution confidence per person id (default 1.0)
    confidence: HashMap<i64, f64>,
    parse_calls: AtomicUsize,
}

impl ScriptedParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parse(mut self, text: &str, requests: Vec<ParsedRequest>) -> Self {
        self.parses.insert(normalize_text(text), requests);
        self
    }

    pub fn with_failure(mut self, text: &str) -> Self {
        self.failures.insert(normalize_text(text));
        self
    }

    pub fn with_person(mut self, person: Person) -> Self {
        self.people.push(person);
        self
    }

    pub fn with_confidence(mut self, person_id: i64, confidence: f64) -> Self {
        self.confidence.insert(person_id, confidence);
        self
    }

    pub fn parse_calls(&self) -> usize {
        self.parse_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestParser for ScriptedParser {
    async fn parse(
        &self,
        request_text: &str,
        _field_name: &str,
        _requester: &RequesterContext,
    ) -> Result<Vec<ParsedRequest>> {
        self.parse_calls.fetch_add(1, Ordering::SeqCst);
        let key = normalize_text(request_text);
        if self.failures.contains(&key) {
            return Err(Error::Internal(format!("parser rejected '{}'", request_text)));
        }
        Ok(self.parses.get(&key).cloned().unwrap_or_default())
    }

    async fn resolve(&self, parsed: &ParsedRequest, _year: i32) -> Result<ResolutionResult> {
        if parsed.placeholder_kind().is_some() {
            return Ok(ResolutionResult::placeholder());
        }
        let wanted = parsed.target_name.as_deref().map(normalize_text);
        let found = self
            .people
            .iter()
            .find(|p| Some(normalize_text(&p.full_name())) == wanted);
        Ok(match found {
            Some(person) => {
                let confidence = self.confidence.get(&person.person_id).copied().unwrap_or(1.0);
                ResolutionResult::resolved(person.clone(), confidence, "scripted")
            }
            None => ResolutionResult::unresolved("scripted_miss"),
        })
    }
}

/// Fixed historical answers keyed by requester id
#[derive(Default)]
pub struct FakeLookup {
    pub prior: HashMap<i64, PriorBunkmates>,
    pub siblings: HashMap<i64, Vec<Person>>,
}

impl FakeLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_siblings(mut self, requester_id: i64, siblings: Vec<Person>) -> Self {
        self.siblings.insert(requester_id, siblings);
        self
    }

    pub fn with_prior(mut self, requester_id: i64, prior: PriorBunkmates) -> Self {
        self.prior.insert(requester_id, prior);
        self
    }
}

#[async_trait]
impl HistoricalLookup for FakeLookup {
    async fn find_prior_year_bunkmates(
        &self,
        requester_id: i64,
        _session_id: i64,
        _year: i32,
    ) -> Result<Option<PriorBunkmates>> {
        Ok(self.prior.get(&requester_id).cloned())
    }

    async fn find_siblings(&self, requester_id: i64, _year: i32) -> Result<Vec<Person>> {
        Ok(self.siblings.get(&requester_id).cloned().unwrap_or_default())
    }
}
