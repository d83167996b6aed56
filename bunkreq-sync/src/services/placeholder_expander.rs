//! Placeholder expansion
//!
//! Turns shorthand requests ("same bunk as last year", "with my sibling")
//! into concrete parsed+resolved pairs, one per person found. Performs
//! read-only lookups; the output still goes through normal persistence.
//!
//! A placeholder is a parsed request whose target name is a recognized
//! marker and whose resolution method is `"placeholder"`.

use super::lookups::HistoricalLookup;
use crate::models::{
    ParseResult, ParsedRequest, Person, PlaceholderKind, RequestPair, RequestType,
    ResolutionResult,
};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;

pub const LAST_YEAR_BUNKMATES_CONFIDENCE: f64 = 0.90;
pub const SIBLING_CONFIDENCE: f64 = 0.95;

pub const LAST_YEAR_BUNKMATES_METHOD: &str = "last_year_bunkmates";
pub const SIBLING_METHOD: &str = "household_sibling";
pub const EXPANSION_FAILED_METHOD: &str = "placeholder_expansion_failed";

pub const EXPANSION_FAILED_KEY: &str = "expansion_failed";
pub const FAILURE_REASON_KEY: &str = "failure_reason";
pub const EXPANDED_FROM_KEY: &str = "expanded_from";

pub struct PlaceholderExpander {
    lookup: Arc<dyn HistoricalLookup>,
}

impl PlaceholderExpander {
    pub fn new(lookup: Arc<dyn HistoricalLookup>) -> Self {
        Self { lookup }
    }

    /// Expand every placeholder pair; other pairs pass through unchanged.
    ///
    /// **Algorithm:**
    /// 1. Find the first parsed request with a placeholder resolution
    /// 2. None: emit the pair as is
    /// 3. Otherwise split the pair: the remaining parsed requests form a
    ///    pass-through pair (examined again, in case it holds another
    ///    placeholder); the placeholder is replaced by one pair per
    ///    person found, or by a single failed-expansion pair
    pub async fn expand(&self, pairs: Vec<RequestPair>) -> Vec<RequestPair> {
        let mut queue: VecDeque<RequestPair> = pairs.into();
        let mut output = Vec::with_capacity(queue.len());

        while let Some((result, resolutions)) = queue.pop_front() {
            let found = result
                .parsed_requests
                .iter()
                .enumerate()
                .find_map(|(i, parsed)| {
                    let is_placeholder = resolutions.get(i).map_or(false, |r| r.is_placeholder());
                    match parsed.placeholder_kind() {
                        Some(kind) if is_placeholder => Some((i, kind)),
                        _ => None,
                    }
                });

            let Some((index, kind)) = found else {
                output.push((result, resolutions));
                continue;
            };

            let placeholder = result.parsed_requests[index].clone();
            let rest: Vec<usize> = (0..result.parsed_requests.len())
                .filter(|i| *i != index)
                .collect();
            if !rest.is_empty() {
                let mut passthrough = result.clone();
                passthrough.parsed_requests = rest
                    .iter()
                    .map(|i| result.parsed_requests[*i].clone())
                    .collect();
                let passthrough_resolutions = rest
                    .iter()
                    .filter_map(|i| resolutions.get(*i).cloned())
                    .collect();
                queue.push_front((passthrough, passthrough_resolutions));
            }

            let expanded = match kind {
                PlaceholderKind::LastYearBunkmates => {
                    self.expand_last_year_bunkmates(&result, &placeholder).await
                }
                PlaceholderKind::Sibling => self.expand_siblings(&result, &placeholder).await,
            };
            output.extend(expanded);
        }

        output
    }

    async fn expand_last_year_bunkmates(
        &self,
        result: &ParseResult,
        placeholder: &ParsedRequest,
    ) -> Vec<RequestPair> {
        let ctx = &result.parse_request.requester;
        let prior = match self
            .lookup
            .find_prior_year_bunkmates(ctx.requester_id, ctx.session_id, ctx.year)
            .await
        {
            Ok(prior) => prior,
            Err(e) => {
                tracing::warn!(
                    requester_id = ctx.requester_id,
                    error = %e,
                    "Prior-year bunkmate lookup failed"
                );
                return vec![failed_pair(result, placeholder, format!("Prior-year bunkmate lookup failed: {}", e))];
            }
        };

        let Some(prior) = prior else {
            return vec![failed_pair(
                result,
                placeholder,
                format!("No bunk assignment found for {}", ctx.year - 1),
            )];
        };
        if prior.occupants.is_empty() {
            return vec![failed_pair(
                result,
                placeholder,
                format!(
                    "No bunkmates from {} ({}) are enrolled in {}",
                    prior.prior_bunk, prior.prior_year, ctx.year
                ),
            )];
        }

        let mut metadata = Map::new();
        metadata.insert(
            EXPANDED_FROM_KEY.to_string(),
            Value::from(PlaceholderKind::LastYearBunkmates.marker()),
        );
        metadata.insert("prior_bunk".to_string(), Value::from(prior.prior_bunk.as_str()));
        metadata.insert("prior_year".to_string(), Value::from(prior.prior_year));

        tracing::info!(
            requester_id = ctx.requester_id,
            prior_bunk = %prior.prior_bunk,
            bunkmates = prior.occupants.len(),
            "Expanded last-year bunkmates placeholder"
        );

        prior
            .occupants
            .iter()
            .map(|person| {
                concrete_pair(
                    result,
                    placeholder,
                    RequestType::BunkWith,
                    person,
                    LAST_YEAR_BUNKMATES_CONFIDENCE,
                    LAST_YEAR_BUNKMATES_METHOD,
                    &metadata,
                )
            })
            .collect()
    }

    async fn expand_siblings(&self, result: &ParseResult, placeholder: &ParsedRequest) -> Vec<RequestPair> {
        let ctx = &result.parse_request.requester;
        let siblings = match self.lookup.find_siblings(ctx.requester_id, ctx.year).await {
            Ok(siblings) => siblings,
            Err(e) => {
                tracing::warn!(
                    requester_id = ctx.requester_id,
                    error = %e,
                    "Sibling lookup failed"
                );
                return vec![failed_pair(result, placeholder, format!("Sibling lookup failed: {}", e))];
            }
        };

        if siblings.is_empty() {
            return vec![failed_pair(
                result,
                placeholder,
                format!("No siblings found for {} in {}", ctx.requester_id, ctx.year),
            )];
        }

        tracing::info!(
            requester_id = ctx.requester_id,
            siblings = siblings.len(),
            request_type = %placeholder.request_type,
            "Expanded sibling placeholder"
        );

        siblings
            .iter()
            .map(|person| {
                let mut metadata = Map::new();
                metadata.insert(
                    EXPANDED_FROM_KEY.to_string(),
                    Value::from(PlaceholderKind::Sibling.marker()),
                );
                if let Some(household_id) = person.household_id {
                    metadata.insert("household_id".to_string(), Value::from(household_id));
                }
                // A parent may ask for siblings to be kept apart
                concrete_pair(
                    result,
                    placeholder,
                    placeholder.request_type,
                    person,
                    SIBLING_CONFIDENCE,
                    SIBLING_METHOD,
                    &metadata,
                )
            })
            .collect()
    }
}

fn concrete_pair(
    result: &ParseResult,
    placeholder: &ParsedRequest,
    request_type: RequestType,
    person: &Person,
    confidence: f64,
    method: &str,
    metadata: &Map<String, Value>,
) -> RequestPair {
    let mut parsed = placeholder.clone();
    parsed.request_type = request_type;
    parsed.target_name = Some(person.full_name());
    parsed.confidence = confidence;
    parsed.metadata.extend(metadata.clone());

    let mut resolution = ResolutionResult::resolved(person.clone(), confidence, method);
    resolution.metadata = metadata.clone();

    let mut expanded = result.clone();
    expanded.parsed_requests = vec![parsed];
    (expanded, vec![resolution])
}

/// Single pair standing in for an expansion that found nobody
fn failed_pair(result: &ParseResult, placeholder: &ParsedRequest, reason: String) -> RequestPair {
    tracing::debug!(
        requester_id = result.parse_request.requester.requester_id,
        reason = %reason,
        "Placeholder expansion failed"
    );

    let mut metadata = Map::new();
    metadata.insert(EXPANSION_FAILED_KEY.to_string(), Value::Bool(true));
    metadata.insert(FAILURE_REASON_KEY.to_string(), Value::from(reason));

    let mut parsed = placeholder.clone();
    parsed.confidence = 0.0;
    parsed.metadata.extend(metadata.clone());

    let mut resolution = ResolutionResult::unresolved(EXPANSION_FAILED_METHOD);
    resolution.metadata = metadata;

    let mut failed = result.clone();
    failed.parsed_requests = vec![parsed];
    (failed, vec![resolution])
}

/// True for pairs produced by a failed expansion
pub fn is_expansion_failure(resolution: &ResolutionResult) -> bool {
    resolution.method == EXPANSION_FAILED_METHOD
        || resolution.metadata.get(EXPANSION_FAILED_KEY) == Some(&Value::Bool(true))
}
