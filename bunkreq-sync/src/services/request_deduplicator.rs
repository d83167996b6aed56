//! Request deduplication for the parse stage
//!
//! Many requesters write the same text ("John Smith" in five forms), and
//! parsing is the expensive step. Requests are grouped by normalized text,
//! one representative per group is parsed, and its result is copied back
//! to every member.

use crate::models::{ParseRequest, ParseResult};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Metadata stamped on results copied from a representative
pub const DEDUPLICATED_KEY: &str = "deduplicated";
pub const ORIGINAL_REQUESTER_KEY: &str = "original_requester_id";

/// Lowercase, collapse whitespace runs to one space, trim
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Grouping produced by `deduplicate`
#[derive(Debug, Clone, Default)]
pub struct DeduplicationOutcome {
    /// One representative per normalized text, in first-seen order
    pub unique: Vec<ParseRequest>,
    /// Normalized text -> every request with that text, representative first
    pub groups: HashMap<String, Vec<ParseRequest>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct DeduplicationStats {
    pub total_requests: usize,
    pub unique_requests: usize,
    pub requests_saved: usize,
    pub savings_percentage: f64,
}

/// Stateless; holds no cache between runs
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestDeduplicator;

impl RequestDeduplicator {
    pub fn new() -> Self {
        Self
    }

    pub fn deduplicate(&self, requests: &[ParseRequest]) -> DeduplicationOutcome {
        let mut outcome = DeduplicationOutcome::default();

        for request in requests {
            let key = normalize_text(&request.request_text);
            let group = outcome.groups.entry(key).or_default();
            if group.is_empty() {
                outcome.unique.push(request.clone());
            }
            group.push(request.clone());
        }

        tracing::debug!(
            total = requests.len(),
            unique = outcome.unique.len(),
            "Deduplicated parse requests"
        );
        outcome
    }

    /// Fan parse results back out to every member of each group.
    ///
    /// `results` are index-aligned with `outcome.unique`. Output holds one
    /// result per original request, grouped by representative. A
    /// representative without a result yields failed results for its
    /// whole group.
    pub fn expand(&self, results: Vec<ParseResult>, outcome: &DeduplicationOutcome) -> Vec<ParseResult> {
        let mut results = results.into_iter();
        let mut expanded = Vec::new();

        for representative in &outcome.unique {
            let result = results.next().unwrap_or_else(|| {
                tracing::warn!(
                    requester_id = representative.requester.requester_id,
                    "No parse result for representative request"
                );
                ParseResult::failed(representative.clone(), "no parse result returned")
            });

            let key = normalize_text(&representative.request_text);
            let members = outcome.groups.get(&key).map(Vec::as_slice).unwrap_or(&[]);

            let copies: Vec<ParseResult> = members
                .iter()
                .skip(1)
                .map(|member| {
                    let mut copy = result.clone();
                    copy.parse_request = member.clone();
                    copy.metadata.insert(DEDUPLICATED_KEY.to_string(), Value::Bool(true));
                    copy.metadata.insert(
                        ORIGINAL_REQUESTER_KEY.to_string(),
                        Value::from(representative.requester.requester_id),
                    );
                    copy
                })
                .collect();

            // Representative keeps its result verbatim, ahead of its copies
            expanded.push(result);
            expanded.extend(copies);
        }

        expanded
    }

    pub fn stats(&self, outcome: &DeduplicationOutcome) -> DeduplicationStats {
        let total_requests: usize = outcome.groups.values().map(Vec::len).sum();
        let unique_requests = outcome.unique.len();
        let requests_saved = total_requests.saturating_sub(unique_requests);
        let savings_percentage = if total_requests == 0 {
            0.0
        } else {
            requests_saved as f64 / total_requests as f64 * 100.0
        };

        DeduplicationStats {
            total_requests,
            unique_requests,
            requests_saved,
            savings_percentage,
        }
    }
}
