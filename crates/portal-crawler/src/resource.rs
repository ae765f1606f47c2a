use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FetchError;
use crate::store::ContentHash;

/// A remote resource discovered on a listing page, not yet fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub url: String,
    /// Unique within one discovery pass
    pub external_id: String,
    /// Opaque comparable value, only ever tested for equality
    pub last_modified_hint: Option<String>,
    pub title: Option<String>,
}

impl ResourceDescriptor {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            external_id: url.clone(),
            url,
            last_modified_hint: None,
            title: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.last_modified_hint = Some(hint.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = id.into();
        self
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub content_hash: ContentHash,
    pub bytes: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
    pub source_url: String,
}

impl RawPayload {
    pub fn new(bytes: Vec<u8>, source_url: impl Into<String>) -> Self {
        Self {
            content_hash: ContentHash::of(&bytes),
            bytes,
            fetched_at: Utc::now(),
            source_url: source_url.into(),
        }
    }
}

impl fmt::Debug for RawPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawPayload")
            .field("content_hash", &self.content_hash)
            .field("len", &self.bytes.len())
            .field("fetched_at", &self.fetched_at)
            .field("source_url", &self.source_url)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Timestamp(DateTime<Utc>),
    Missing,
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
            Self::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            Self::Missing => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Stable business key
    pub record_id: String,
    pub fields: BTreeMap<String, FieldValue>,
    pub source_content_hash: ContentHash,
    pub parsed_at: DateTime<Utc>,
}

impl Record {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    /// The listing hint matches the one recorded on a previous run
    Unchanged,
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unchanged => f.write_str("unchanged"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Success(RawPayload),
    Skipped(SkipReason),
    Failed { error: FetchError, attempts: u32 },
}
