//! Provenance junction records
//!
//! One `SourceLink` ties a derived request to one original source row.
//! A live request has at most one primary link.

use crate::store::Record;
use bunkreq_common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const FIELD_BUNK_REQUEST: &str = "bunk_request";
pub const FIELD_ORIGINAL_REQUEST: &str = "original_request";
pub const FIELD_IS_PRIMARY: &str = "is_primary";
pub const FIELD_SOURCE_FIELD: &str = "source_field";

/// Stored link
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceLink {
    /// Record id of the link row itself
    pub id: String,
    pub bunk_request_id: String,
    pub original_request_id: String,
    pub is_primary: bool,
    /// None on rows written before source fields were tracked
    pub source_field: Option<String>,
}

impl SourceLink {
    pub fn from_record(record: &Record) -> Result<Self> {
        let bunk_request_id = record
            .str_field(FIELD_BUNK_REQUEST)
            .ok_or_else(|| Error::Internal(format!("Source link {} has no bunk_request", record.id)))?;
        let original_request_id = record.str_field(FIELD_ORIGINAL_REQUEST).ok_or_else(|| {
            Error::Internal(format!("Source link {} has no original_request", record.id))
        })?;

        Ok(Self {
            id: record.id.clone(),
            bunk_request_id: bunk_request_id.to_string(),
            original_request_id: original_request_id.to_string(),
            is_primary: record.bool_field(FIELD_IS_PRIMARY).unwrap_or(false),
            source_field: record.str_field(FIELD_SOURCE_FIELD).map(str::to_string),
        })
    }

    pub fn with_field(&self) -> LinkWithField {
        LinkWithField {
            original_request_id: self.original_request_id.clone(),
            source_field: self.source_field.clone(),
            is_primary: self.is_primary,
        }
    }
}

/// Link to be created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSourceLink {
    pub bunk_request_id: String,
    pub original_request_id: String,
    pub is_primary: bool,
    pub source_field: Option<String>,
}

impl NewSourceLink {
    pub fn new(
        bunk_request_id: impl Into<String>,
        original_request_id: impl Into<String>,
        is_primary: bool,
        source_field: Option<String>,
    ) -> Self {
        Self {
            bunk_request_id: bunk_request_id.into(),
            original_request_id: original_request_id.into(),
            is_primary,
            source_field,
        }
    }

    pub fn to_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert(FIELD_BUNK_REQUEST.into(), Value::from(self.bunk_request_id.as_str()));
        fields.insert(
            FIELD_ORIGINAL_REQUEST.into(),
            Value::from(self.original_request_id.as_str()),
        );
        fields.insert(FIELD_IS_PRIMARY.into(), Value::Bool(self.is_primary));
        if let Some(field) = &self.source_field {
            fields.insert(FIELD_SOURCE_FIELD.into(), Value::from(field.as_str()));
        }
        fields
    }
}

/// Provenance entry as seen by split: which source contributed which field
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkWithField {
    pub original_request_id: String,
    pub source_field: Option<String>,
    pub is_primary: bool,
}
