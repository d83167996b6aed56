//! Parser/resolver boundary types
//!
//! A `ParseRequest` is one source row's text plus who wrote it. The
//! external parser turns it into zero or more `ParsedRequest`s; the
//! resolver matches each parsed target name to a `Person`. The pipeline
//! carries `(ParseResult, Vec<ResolutionResult>)` pairs with resolutions
//! index-aligned to `ParseResult::parsed_requests`.

use super::bunk_request::RequestType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Resolution method the resolver reports for placeholder targets
pub const PLACEHOLDER_METHOD: &str = "placeholder";

/// Who a request text belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequesterContext {
    pub requester_id: i64,
    pub session_id: i64,
    pub year: i32,
}

/// Input to the parser: one source row's text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseRequest {
    pub request_text: String,
    pub field_name: String,
    pub requester: RequesterContext,
    /// Source row the text came from; becomes the provenance link
    pub original_request_id: String,
}

/// One structured request extracted from text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRequest {
    pub request_type: RequestType,
    /// Name as written, or a placeholder marker
    #[serde(default)]
    pub target_name: Option<String>,
    #[serde(default)]
    pub source_field: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ParsedRequest {
    pub fn placeholder_kind(&self) -> Option<PlaceholderKind> {
        self.target_name.as_deref().and_then(PlaceholderKind::from_marker)
    }
}

/// Parser output for one `ParseRequest`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseResult {
    pub parsed_requests: Vec<ParsedRequest>,
    pub is_valid: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// The request this result answers
    pub parse_request: ParseRequest,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ParseResult {
    pub fn success(parse_request: ParseRequest, parsed_requests: Vec<ParsedRequest>) -> Self {
        Self {
            parsed_requests,
            is_valid: true,
            error: None,
            parse_request,
            metadata: Map::new(),
        }
    }

    pub fn failed(parse_request: ParseRequest, reason: impl Into<String>) -> Self {
        Self {
            parsed_requests: Vec::new(),
            is_valid: false,
            error: Some(reason.into()),
            parse_request,
            metadata: Map::new(),
        }
    }
}

/// A person known to the resolver / historical lookups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub person_id: i64,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub household_id: Option<i64>,
}

impl Person {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }
}

/// Resolver output for one parsed request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionResult {
    pub person: Option<Person>,
    pub confidence: f64,
    pub method: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ResolutionResult {
    pub fn resolved(person: Person, confidence: f64, method: impl Into<String>) -> Self {
        Self {
            person: Some(person),
            confidence,
            method: method.into(),
            metadata: Map::new(),
        }
    }

    pub fn unresolved(method: impl Into<String>) -> Self {
        Self {
            person: None,
            confidence: 0.0,
            method: method.into(),
            metadata: Map::new(),
        }
    }

    pub fn placeholder() -> Self {
        Self::unresolved(PLACEHOLDER_METHOD)
    }

    pub fn is_placeholder(&self) -> bool {
        self.method == PLACEHOLDER_METHOD
    }
}

/// Pipeline unit: a parse result and its per-request resolutions
pub type RequestPair = (ParseResult, Vec<ResolutionResult>);

/// Shorthand targets that expand via historical lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlaceholderKind {
    LastYearBunkmates,
    Sibling,
}

impl PlaceholderKind {
    pub fn marker(&self) -> &'static str {
        match self {
            PlaceholderKind::LastYearBunkmates => "LAST_YEAR_BUNKMATES",
            PlaceholderKind::Sibling => "SIBLING",
        }
    }

    pub fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            "LAST_YEAR_BUNKMATES" => Some(PlaceholderKind::LastYearBunkmates),
            "SIBLING" => Some(PlaceholderKind::Sibling),
            _ => None,
        }
    }
}
