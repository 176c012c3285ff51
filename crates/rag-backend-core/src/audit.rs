//! Audit entry shape and catalog-mutation helpers.
//!
//! Entries are written one JSON object per line by an
//! [`AuditSink`](crate::store::AuditSink). Lifecycle entries (reindex
//! started/succeeded/failed, health checks) are built with
//! [`AuditEntry::new`]; per-source catalog mutations go through
//! [`AuditEntry::mutation`], which validates and normalizes the language tag.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Actor recorded on every entry written by this backend.
pub const ACTOR: &str = "rag-backend";

const ENGLISH: &str = "en";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LanguageError {
    #[error("language must not be empty")]
    Empty,
    #[error("language '{0}' is not a valid ISO code")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub status: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    /// Additional structured fields (e.g. health check results).
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl AuditEntry {
    pub fn new(
        timestamp: DateTime<Utc>,
        action: impl Into<String>,
        status: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            actor: ACTOR.to_string(),
            action: action.into(),
            status: status.into(),
            target: target.into(),
            details: None,
            trace_id: None,
            language: None,
            warning: None,
            extra: Map::new(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Build a catalog-mutation entry.
    ///
    /// Non-English languages are recorded with a
    /// `non_english_language:<code>` warning.
    pub fn mutation(timestamp: DateTime<Utc>, mutation: &SourceMutation) -> Result<Self, LanguageError> {
        let language = normalize_language(&mutation.language)?;
        let mut entry = Self::new(timestamp, &mutation.action, &mutation.status, &mutation.alias);
        entry.trace_id = mutation.trace_id.clone().filter(|t| !t.is_empty());
        entry.details = mutation.details.clone().filter(|d| !d.is_empty());
        if language != ENGLISH {
            entry.warning = Some(format!("non_english_language:{}", language));
        }
        entry.language = Some(language);
        Ok(entry)
    }
}

/// A change to one catalog source, as recorded in the audit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMutation {
    pub action: String,
    pub alias: String,
    pub status: String,
    pub language: String,
    pub trace_id: Option<String>,
    pub details: Option<String>,
}

static LANGUAGE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]{2,8}(-[a-z0-9]{2,8})*$").expect("language tag pattern"));

/// Lower-case and validate a language tag against
/// `^[a-z]{2,8}(-[a-z0-9]{2,8})*$`.
pub fn normalize_language(language: &str) -> Result<String, LanguageError> {
    let candidate = language.trim().to_lowercase();
    if candidate.is_empty() {
        return Err(LanguageError::Empty);
    }
    if LANGUAGE_TAG.is_match(&candidate) {
        Ok(candidate)
    } else {
        Err(LanguageError::Invalid(language.to_string()))
    }
}
