//! Parser/resolver boundary
//!
//! Parsing free text and matching names to people happen outside this
//! crate. `RequestParser` is the seam; `StaticRequestParser` answers from
//! a pre-parsed sync input file so the engine can run without a live
//! parser.

use crate::models::{ParsedRequest, Person, RequesterContext, ResolutionResult, SourceRow};
use crate::services::request_deduplicator::normalize_text;
use async_trait::async_trait;
use bunkreq_common::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

pub const EXACT_MATCH_METHOD: &str = "exact_match";
pub const AMBIGUOUS_MATCH_METHOD: &str = "ambiguous_match";
pub const NOT_FOUND_METHOD: &str = "not_found";

/// Confidence for one of several people sharing a name
pub const AMBIGUOUS_MATCH_CONFIDENCE: f64 = 0.5;

#[async_trait]
pub trait RequestParser: Send + Sync {
    async fn parse(
        &self,
        request_text: &str,
        field_name: &str,
        requester: &RequesterContext,
    ) -> Result<Vec<ParsedRequest>>;

    async fn resolve(&self, parsed: &ParsedRequest, year: i32) -> Result<ResolutionResult>;
}

/// Pre-parsed requests for one text
#[derive(Debug, Clone, Deserialize)]
pub struct ParsedText {
    pub text: String,
    pub requests: Vec<ParsedRequest>,
}

/// Contents of a `sync --input` file
#[derive(Debug, Clone, Deserialize)]
pub struct SyncInput {
    pub rows: Vec<SourceRow>,
    #[serde(default)]
    pub parsed: Vec<ParsedText>,
    /// People enrolled in the synced year
    #[serde(default)]
    pub people: Vec<Person>,
}

impl SyncInput {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Answers from pre-parsed text and a fixed list of people
pub struct StaticRequestParser {
    by_text: HashMap<String, Vec<ParsedRequest>>,
    people: Vec<Person>,
}

impl StaticRequestParser {
    pub fn new(parsed: Vec<ParsedText>, people: Vec<Person>) -> Self {
        let by_text = parsed
            .into_iter()
            .map(|p| (normalize_text(&p.text), p.requests))
            .collect();
        Self { by_text, people }
    }

    pub fn from_input(input: &SyncInput) -> Self {
        Self::new(input.parsed.clone(), input.people.clone())
    }
}

#[async_trait]
impl RequestParser for StaticRequestParser {
    async fn parse(
        &self,
        request_text: &str,
        field_name: &str,
        requester: &RequesterContext,
    ) -> Result<Vec<ParsedRequest>> {
        let Some(requests) = self.by_text.get(&normalize_text(request_text)) else {
            return Err(Error::InvalidInput(format!(
                "No parse available for text from requester {}",
                requester.requester_id
            )));
        };
        Ok(requests
            .iter()
            .cloned()
            .map(|mut request| {
                if request.source_field.is_empty() {
                    request.source_field = field_name.to_string();
                }
                request
            })
            .collect())
    }

    async fn resolve(&self, parsed: &ParsedRequest, _year: i32) -> Result<ResolutionResult> {
        if parsed.placeholder_kind().is_some() {
            return Ok(ResolutionResult::placeholder());
        }
        let Some(name) = parsed.target_name.as_deref() else {
            return Ok(ResolutionResult::unresolved(NOT_FOUND_METHOD));
        };

        let wanted = normalize_text(name);
        let matches: Vec<&Person> = self
            .people
            .iter()
            .filter(|p| normalize_text(&p.full_name()) == wanted)
            .collect();

        Ok(match matches.as_slice() {
            [] => ResolutionResult::unresolved(NOT_FOUND_METHOD),
            [only] => ResolutionResult::resolved((*only).clone(), 1.0, EXACT_MATCH_METHOD),
            [first, ..] => {
                let mut result = ResolutionResult::resolved(
                    (*first).clone(),
                    AMBIGUOUS_MATCH_CONFIDENCE,
                    AMBIGUOUS_MATCH_METHOD,
                );
                result
                    .metadata
                    .insert("candidates".to_string(), serde_json::Value::from(matches.len()));
                result
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PlaceholderKind, RequestType};
    use serde_json::Map;

    fn person(id: i64, first: &str, last: &str) -> Person {
        Person {
            person_id: id,
            first_name: first.to_string(),
            last_name: last.to_string(),
            household_id: None,
        }
    }

    fn parsed(target: &str) -> ParsedRequest {
        ParsedRequest {
            request_type: RequestType::BunkWith,
            target_name: Some(target.to_string()),
            source_field: String::new(),
            confidence: 0.9,
            metadata: Map::new(),
        }
    }

    fn context() -> RequesterContext {
        RequesterContext {
            requester_id: 1,
            session_id: 10,
            year: 2025,
        }
    }

    #[tokio::test]
    async fn test_parse_by_normalized_text() {
        let parser = StaticRequestParser::new(
            vec![ParsedText {
                text: "Jane Doe".to_string(),
                requests: vec![parsed("Jane Doe")],
            }],
            Vec::new(),
        );

        let requests = parser.parse("  jane   DOE", "share_bunk_with", &context()).await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].source_field, "share_bunk_with");

        assert!(parser.parse("unknown", "share_bunk_with", &context()).await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_outcomes() {
        let parser = StaticRequestParser::new(
            Vec::new(),
            vec![person(2, "Jane", "Doe"), person(3, "Sam", "Ray"), person(4, "Sam", "Ray")],
        );

        let exact = parser.resolve(&parsed("jane doe"), 2025).await.unwrap();
        assert_eq!(exact.person.map(|p| p.person_id), Some(2));
        assert_eq!(exact.method, EXACT_MATCH_METHOD);

        let ambiguous = parser.resolve(&parsed("Sam Ray"), 2025).await.unwrap();
        assert_eq!(ambiguous.confidence, AMBIGUOUS_MATCH_CONFIDENCE);

        let missing = parser.resolve(&parsed("Nobody"), 2025).await.unwrap();
        assert!(missing.person.is_none());

        let marker = parser
            .resolve(&parsed(PlaceholderKind::Sibling.marker()), 2025)
            .await
            .unwrap();
        assert!(marker.is_placeholder());
    }
}
