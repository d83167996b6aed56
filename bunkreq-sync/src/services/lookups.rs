//! Historical and relational lookups used by placeholder expansion
//!
//! Stateless query objects: every call reads the store, nothing is cached.

use crate::models::Person;
use crate::pagination::list_all;
use crate::store::{Collection, Filter, Record, RecordStore};
use async_trait::async_trait;
use bunkreq_common::config::DEFAULT_PAGE_SIZE;
use bunkreq_common::db::{BUNK_ASSIGNMENTS, PERSONS};
use bunkreq_common::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Requester's bunk in the previous year and who else is back this year
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriorBunkmates {
    pub prior_bunk: String,
    pub prior_year: i32,
    /// Other occupants of `prior_bunk` who are enrolled in the current year
    pub occupants: Vec<Person>,
}

#[async_trait]
pub trait HistoricalLookup: Send + Sync {
    /// None when the requester had no assignment in `year - 1`
    async fn find_prior_year_bunkmates(
        &self,
        requester_id: i64,
        session_id: i64,
        year: i32,
    ) -> Result<Option<PriorBunkmates>>;

    /// Other members of the requester's household enrolled in `year`
    async fn find_siblings(&self, requester_id: i64, year: i32) -> Result<Vec<Person>>;
}

/// Lookups over the `bunk_assignments` and `persons` collections
pub struct StoreHistoricalLookup {
    assignments: Collection,
    persons: Collection,
    page_size: u32,
}

impl StoreHistoricalLookup {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            assignments: Collection::new(store.clone(), BUNK_ASSIGNMENTS),
            persons: Collection::new(store, PERSONS),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    fn person_from_record(record: &Record) -> Option<Person> {
        Some(Person {
            person_id: record.i64_field("person_id")?,
            first_name: record.str_field("first_name").unwrap_or_default().to_string(),
            last_name: record.str_field("last_name").unwrap_or_default().to_string(),
            household_id: record.i64_field("household_id"),
        })
    }

    /// Enrolled persons among `person_ids` for `year`, keyed by id
    async fn enrolled(&self, person_ids: &[i64], year: i32) -> Result<HashMap<i64, Person>> {
        let mut enrolled = HashMap::new();
        for chunk in person_ids.chunks(50) {
            let Some(ids) = Filter::any_of("person_id", chunk.iter().copied()) else {
                continue;
            };
            let filter = Filter::eq("year", year).and(ids);
            for record in list_all(&self.persons, Some(&filter), self.page_size).await? {
                if let Some(person) = Self::person_from_record(&record) {
                    enrolled.insert(person.person_id, person);
                }
            }
        }
        Ok(enrolled)
    }
}

#[async_trait]
impl HistoricalLookup for StoreHistoricalLookup {
    async fn find_prior_year_bunkmates(
        &self,
        requester_id: i64,
        session_id: i64,
        year: i32,
    ) -> Result<Option<PriorBunkmates>> {
        let prior_year = year - 1;
        let own = Filter::eq("person_id", requester_id).and(Filter::eq("year", prior_year));
        let assignments = list_all(&self.assignments, Some(&own), self.page_size).await?;

        // Session ids are per-year, so prefer an exact match but accept any
        let chosen = assignments
            .iter()
            .find(|a| a.i64_field("session_id") == Some(session_id))
            .or_else(|| assignments.first());
        let Some(assignment) = chosen else {
            return Ok(None);
        };
        let Some(prior_bunk) = assignment.str_field("bunk").map(str::to_string) else {
            return Ok(None);
        };

        let mut bunk_filter = Filter::eq("bunk", prior_bunk.as_str()).and(Filter::eq("year", prior_year));
        if let Some(prior_session) = assignment.i64_field("session_id") {
            bunk_filter = bunk_filter.and(Filter::eq("session_id", prior_session));
        }
        let mut occupant_ids: Vec<i64> = Vec::new();
        for record in list_all(&self.assignments, Some(&bunk_filter), self.page_size).await? {
            match record.i64_field("person_id") {
                Some(id) if id != requester_id && !occupant_ids.contains(&id) => occupant_ids.push(id),
                _ => {}
            }
        }

        let mut enrolled = self.enrolled(&occupant_ids, year).await?;
        let occupants = occupant_ids
            .iter()
            .filter_map(|id| enrolled.remove(id))
            .collect();

        Ok(Some(PriorBunkmates {
            prior_bunk,
            prior_year,
            occupants,
        }))
    }

    async fn find_siblings(&self, requester_id: i64, year: i32) -> Result<Vec<Person>> {
        let me = Filter::eq("person_id", requester_id).and(Filter::eq("year", year));
        let household = self
            .persons
            .first(&me)
            .await?
            .and_then(|r| r.i64_field("household_id"));
        let Some(household_id) = household else {
            return Ok(Vec::new());
        };

        let filter = Filter::eq("household_id", household_id)
            .and(Filter::eq("year", year))
            .and(Filter::ne("person_id", requester_id));
        Ok(list_all(&self.persons, Some(&filter), self.page_size)
            .await?
            .iter()
            .filter_map(Self::person_from_record)
            .collect())
    }
}
