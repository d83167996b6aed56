//! Derived bunk request records
//!
//! A `BunkRequest` is the normalized, actionable preference produced by
//! parsing one or more source rows. `merged_into` set means the request was
//! absorbed by a staff merge and is soft-deleted.

use crate::store::{Filter, Literal, Record};
use bunkreq_common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Kind of preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    BunkWith,
    NotBunkWith,
    AgePreference,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::BunkWith => "bunk_with",
            RequestType::NotBunkWith => "not_bunk_with",
            RequestType::AgePreference => "age_preference",
        }
    }

    /// Person-targeted types carry a `target_id`
    pub fn requires_target(&self) -> bool {
        !matches!(self, RequestType::AgePreference)
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bunk_with" => Ok(RequestType::BunkWith),
            "not_bunk_with" => Ok(RequestType::NotBunkWith),
            "age_preference" => Ok(RequestType::AgePreference),
            other => Err(Error::InvalidInput(format!("Unknown request type '{}'", other))),
        }
    }
}

/// Review state of a derived request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Resolved,
    ManualReview,
    NotFound,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Resolved => "resolved",
            RequestStatus::ManualReview => "manual_review",
            RequestStatus::NotFound => "not_found",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "resolved" => Ok(RequestStatus::Resolved),
            "manual_review" => Ok(RequestStatus::ManualReview),
            "not_found" => Ok(RequestStatus::NotFound),
            other => Err(Error::InvalidInput(format!("Unknown request status '{}'", other))),
        }
    }
}

/// Fields that identify "the same request" across sources
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
    pub requester_id: i64,
    pub target_id: Option<i64>,
    pub request_type: RequestType,
    pub session_id: i64,
    pub year: i32,
}

impl RequestIdentity {
    /// Filter matching live requests with this identity
    pub fn live_filter(&self) -> Filter {
        Filter::eq("requester_id", self.requester_id)
            .and(Filter::eq("target_id", Literal::from(self.target_id)))
            .and(Filter::eq("request_type", self.request_type.as_str()))
            .and(Filter::eq("session_id", self.session_id))
            .and(Filter::eq("year", self.year))
            .and(Filter::eq("merged_into", Literal::Null))
    }
}

/// Derived, actionable bunk request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BunkRequest {
    /// Empty until persisted
    pub id: String,
    pub requester_id: i64,
    pub target_id: Option<i64>,
    pub request_type: RequestType,
    pub session_id: i64,
    pub year: i32,
    pub priority: i64,
    pub confidence_score: f64,
    /// Contributing field names, insertion-ordered, no duplicates
    pub source_fields: Vec<String>,
    pub status: RequestStatus,
    pub locked: bool,
    pub merged_into: Option<String>,
    pub metadata: Map<String, Value>,
}

impl BunkRequest {
    pub fn new(
        requester_id: i64,
        target_id: Option<i64>,
        request_type: RequestType,
        session_id: i64,
        year: i32,
    ) -> Self {
        Self {
            id: String::new(),
            requester_id,
            target_id,
            request_type,
            session_id,
            year,
            priority: 0,
            confidence_score: 0.0,
            source_fields: Vec::new(),
            status: RequestStatus::Pending,
            locked: false,
            merged_into: None,
            metadata: Map::new(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.merged_into.is_none()
    }

    pub fn identity(&self) -> RequestIdentity {
        RequestIdentity {
            requester_id: self.requester_id,
            target_id: self.target_id,
            request_type: self.request_type,
            session_id: self.session_id,
            year: self.year,
        }
    }

    /// Append a field name unless already present; true if added
    pub fn add_source_field(&mut self, field: &str) -> bool {
        if field.is_empty() || self.source_fields.iter().any(|f| f == field) {
            return false;
        }
        self.source_fields.push(field.to_string());
        true
    }

    /// True if the field was present
    pub fn remove_source_field(&mut self, field: &str) -> bool {
        let before = self.source_fields.len();
        self.source_fields.retain(|f| f != field);
        before != self.source_fields.len()
    }

    /// Persisted shape (the id is the record id, not a field)
    pub fn to_fields(&self) -> Result<Map<String, Value>> {
        let mut fields = Map::new();
        fields.insert("requester_id".into(), Value::from(self.requester_id));
        fields.insert("target_id".into(), self.target_id.map_or(Value::Null, Value::from));
        fields.insert("request_type".into(), Value::from(self.request_type.as_str()));
        fields.insert("session_id".into(), Value::from(self.session_id));
        fields.insert("year".into(), Value::from(self.year));
        fields.insert("priority".into(), Value::from(self.priority));
        fields.insert("confidence_score".into(), Value::from(self.confidence_score));
        fields.insert("source_fields".into(), Value::from(self.source_fields.clone()));
        fields.insert("status".into(), Value::from(self.status.as_str()));
        fields.insert("locked".into(), Value::Bool(self.locked));
        fields.insert(
            "merged_into".into(),
            self.merged_into.clone().map_or(Value::Null, Value::String),
        );
        fields.insert("metadata".into(), encode_metadata(&self.metadata)?);
        Ok(fields)
    }

    pub fn from_record(record: &Record) -> Result<Self> {
        let malformed = |field: &str| {
            Error::Internal(format!(
                "Bunk request {} has missing or invalid '{}'",
                record.id, field
            ))
        };

        let request_type: RequestType = record
            .str_field("request_type")
            .ok_or_else(|| malformed("request_type"))?
            .parse()?;
        let status: RequestStatus = match record.str_field("status") {
            Some(s) => s.parse()?,
            None => RequestStatus::Pending,
        };
        let year = record.i64_field("year").ok_or_else(|| malformed("year"))?;

        Ok(Self {
            id: record.id.clone(),
            requester_id: record
                .i64_field("requester_id")
                .ok_or_else(|| malformed("requester_id"))?,
            target_id: record.i64_field("target_id"),
            request_type,
            session_id: record
                .i64_field("session_id")
                .ok_or_else(|| malformed("session_id"))?,
            year: i32::try_from(year).map_err(|_| malformed("year"))?,
            priority: record.i64_field("priority").unwrap_or(0),
            confidence_score: record.f64_field("confidence_score").unwrap_or(0.0),
            source_fields: string_list(record.get("source_fields")),
            status,
            locked: record.bool_field("locked").unwrap_or(false),
            merged_into: record.str_field("merged_into").map(str::to_string),
            metadata: decode_metadata(&record.id, record.get("metadata")),
        })
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    if let Some(Value::Array(items)) = value {
        for item in items {
            if let Some(s) = item.as_str() {
                if !out.iter().any(|existing| existing == s) {
                    out.push(s.to_string());
                }
            }
        }
    }
    out
}

/// Metadata is stored as JSON text
fn encode_metadata(metadata: &Map<String, Value>) -> Result<Value> {
    Ok(Value::String(serde_json::to_string(metadata)?))
}

/// Accepts text or an object; anything unreadable degrades to an empty map
pub fn decode_metadata(record_id: &str, value: Option<&Value>) -> Map<String, Value> {
    match value {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(text)) if text.trim().is_empty() => Map::new(),
        Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                tracing::warn!(
                    bunk_request = %record_id,
                    "Unreadable request metadata, using empty map"
                );
                Map::new()
            }
        },
        Some(_) => {
            tracing::warn!(
                bunk_request = %record_id,
                "Request metadata has unexpected JSON type, using empty map"
            );
            Map::new()
        }
    }
}
