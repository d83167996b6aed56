//! Original source rows and change classification

use crate::store::{Filter, Record};
use bunkreq_common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One imported row of raw request text, before hashing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
    pub requester_id: i64,
    /// Import field name (e.g. "share_bunk_with", "bunking_notes")
    pub field: String,
    pub session_id: i64,
    pub year: i32,
    pub content: String,
}

impl SourceRow {
    /// Natural key filter: (requester_id, field, session_id, year)
    pub fn natural_key_filter(&self) -> Filter {
        Filter::eq("requester_id", self.requester_id)
            .and(Filter::eq("field", self.field.as_str()))
            .and(Filter::eq("session_id", self.session_id))
            .and(Filter::eq("year", self.year))
    }
}

/// Stored source row with its content hash
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OriginalRequest {
    pub id: String,
    pub requester_id: i64,
    pub field: String,
    pub session_id: i64,
    pub year: i32,
    pub content: String,
    pub content_hash: String,
    /// RFC 3339 timestamp of the import that last changed the content
    pub imported_at: String,
}

impl OriginalRequest {
    pub fn to_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("requester_id".into(), Value::from(self.requester_id));
        fields.insert("field".into(), Value::from(self.field.as_str()));
        fields.insert("session_id".into(), Value::from(self.session_id));
        fields.insert("year".into(), Value::from(self.year));
        fields.insert("content".into(), Value::from(self.content.as_str()));
        fields.insert("content_hash".into(), Value::from(self.content_hash.as_str()));
        fields.insert("imported_at".into(), Value::from(self.imported_at.as_str()));
        fields
    }

    pub fn from_record(record: &Record) -> Result<Self> {
        let malformed = |field: &str| {
            Error::Internal(format!(
                "Original request {} has missing or invalid '{}'",
                record.id, field
            ))
        };
        let year = record.i64_field("year").ok_or_else(|| malformed("year"))?;

        Ok(Self {
            id: record.id.clone(),
            requester_id: record
                .i64_field("requester_id")
                .ok_or_else(|| malformed("requester_id"))?,
            field: record
                .str_field("field")
                .ok_or_else(|| malformed("field"))?
                .to_string(),
            session_id: record
                .i64_field("session_id")
                .ok_or_else(|| malformed("session_id"))?,
            year: i32::try_from(year).map_err(|_| malformed("year"))?,
            content: record
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            content_hash: record
                .str_field("content_hash")
                .unwrap_or_default()
                .to_string(),
            imported_at: record
                .str_field("imported_at")
                .unwrap_or_default()
                .to_string(),
        })
    }
}

/// Result of comparing an imported row against what is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    New,
    Unchanged,
    Changed,
}
