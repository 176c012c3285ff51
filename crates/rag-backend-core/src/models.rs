//! Core data models shared by the transport, orchestration, and recovery layers.
//!
//! Every type here is a plain value. Ingestion jobs in particular are never
//! mutated in place: each transition returns a fresh [`IngestionJob`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Category of a knowledge source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Man,
    Kiwix,
    Info,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::Man => "man",
            SourceType::Kiwix => "kiwix",
            SourceType::Info => "info",
        }
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "man" => Ok(SourceType::Man),
            "kiwix" => Ok(SourceType::Kiwix),
            "info" => Ok(SourceType::Info),
            other => Err(format!("unsupported source type '{}'", other)),
        }
    }
}

/// Lifecycle status of a knowledge source. Only `Active` sources are indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    PendingValidation,
    Active,
    Quarantined,
    Error,
}

impl SourceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceStatus::PendingValidation => "pending_validation",
            SourceStatus::Active => "active",
            SourceStatus::Quarantined => "quarantined",
            SourceStatus::Error => "error",
        }
    }
}

impl FromStr for SourceStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending_validation" => Ok(SourceStatus::PendingValidation),
            "active" => Ok(SourceStatus::Active),
            "quarantined" => Ok(SourceStatus::Quarantined),
            "error" => Ok(SourceStatus::Error),
            other => Err(format!("unsupported source status '{}'", other)),
        }
    }
}

/// Operational state of an ingestion job.
///
/// `Cancelled` is part of the wire contract but no code path in this
/// backend produces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl IngestionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IngestionStatus::Queued => "queued",
            IngestionStatus::Running => "running",
            IngestionStatus::Succeeded => "succeeded",
            IngestionStatus::Failed => "failed",
            IngestionStatus::Cancelled => "cancelled",
        }
    }

    /// True once the job can no longer transition.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            IngestionStatus::Succeeded | IngestionStatus::Failed | IngestionStatus::Cancelled
        )
    }
}

impl fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason an ingestion job was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IngestionTrigger {
    Init,
    #[default]
    Manual,
    Scheduled,
}

impl IngestionTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            IngestionTrigger::Init => "init",
            IngestionTrigger::Manual => "manual",
            IngestionTrigger::Scheduled => "scheduled",
        }
    }
}

impl FromStr for IngestionTrigger {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "init" => Ok(IngestionTrigger::Init),
            "manual" => Ok(IngestionTrigger::Manual),
            "scheduled" => Ok(IngestionTrigger::Scheduled),
            other => Err(format!("unsupported reindex trigger '{}'", other)),
        }
    }
}

/// Canonical record for one knowledge source in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub alias: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub location: String,
    pub language: String,
    pub size_bytes: u64,
    pub last_updated: DateTime<Utc>,
    pub status: SourceStatus,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl SourceRecord {
    pub fn is_active(&self) -> bool {
        self.status == SourceStatus::Active
    }
}

/// Last indexed state of a single source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub alias: String,
    pub checksum: String,
}

impl SourceSnapshot {
    pub fn new(alias: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            checksum: checksum.into(),
        }
    }

    /// Deterministic SHA-256 over the `alias` + `checksum` pairs, sorted by alias.
    pub fn digest(snapshots: &[SourceSnapshot]) -> String {
        let mut sorted: Vec<&SourceSnapshot> = snapshots.iter().collect();
        sorted.sort_by(|a, b| a.alias.cmp(&b.alias));

        let mut hasher = Sha256::new();
        for snapshot in sorted {
            hasher.update(snapshot.alias.as_bytes());
            hasher.update(snapshot.checksum.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Versioned set of sources and their index snapshots.
///
/// `version` increases by exactly one for every persisted mutation. A
/// catalog that has never been indexed has version `0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCatalog {
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub sources: Vec<SourceRecord>,
    #[serde(default)]
    pub snapshots: Vec<SourceSnapshot>,
}

impl SourceCatalog {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            version: 0,
            updated_at: now,
            sources: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    pub fn active_sources(&self) -> impl Iterator<Item = &SourceRecord> {
        self.sources.iter().filter(|s| s.is_active())
    }

    /// Aliases of active sources, in catalog order.
    pub fn active_aliases(&self) -> Vec<String> {
        self.active_sources().map(|s| s.alias.clone()).collect()
    }

    pub fn snapshot_for(&self, alias: &str) -> Option<&SourceSnapshot> {
        self.snapshots.iter().find(|s| s.alias == alias)
    }
}

/// Metadata for one ingestion (reindex) job.
///
/// Transitions are expressed as methods that return a new job; the
/// receiver is left untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub job_id: String,
    pub source_alias: String,
    pub status: IngestionStatus,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub documents_processed: u64,
    pub stage: Option<String>,
    pub percent_complete: Option<f64>,
    pub error_message: Option<String>,
    pub trigger: IngestionTrigger,
}

impl IngestionJob {
    /// A freshly triggered catalog-wide job, already running.
    pub fn started(job_id: impl Into<String>, trigger: IngestionTrigger, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            source_alias: "*".to_string(),
            status: IngestionStatus::Running,
            requested_at: now,
            started_at: Some(now),
            completed_at: None,
            documents_processed: 0,
            stage: Some("preparing_index".to_string()),
            percent_complete: Some(0.0),
            error_message: None,
            trigger,
        }
    }

    pub fn with_progress(&self, stage: impl Into<String>, documents_processed: u64, percent: f64) -> Self {
        Self {
            stage: Some(stage.into()),
            documents_processed,
            percent_complete: Some(percent),
            ..self.clone()
        }
    }

    pub fn succeeded(&self, now: DateTime<Utc>) -> Self {
        Self {
            status: IngestionStatus::Succeeded,
            completed_at: Some(now),
            stage: Some("completed".to_string()),
            percent_complete: Some(100.0),
            error_message: None,
            ..self.clone()
        }
    }

    pub fn failed(&self, now: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            status: IngestionStatus::Failed,
            completed_at: Some(now),
            stage: Some("failed".to_string()),
            error_message: Some(message.into()),
            ..self.clone()
        }
    }
}

/// Status of a persisted content index build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    Ready,
    Stale,
    Building,
    Failed,
}

/// Record describing one successful index build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentIndexVersion {
    pub index_id: String,
    pub status: IndexStatus,
    pub checksum: String,
    pub source_snapshot: Vec<SourceSnapshot>,
    pub size_bytes: u64,
    pub document_count: u64,
    pub trigger_job_id: String,
    pub built_at: DateTime<Utc>,
    pub freshness_expires_at: DateTime<Utc>,
}

/// One chunk of source content produced by a [`ChunkBuilder`](crate::store::ChunkBuilder).
///
/// `checksum` is the source checksum the chunk was built from; retrieval
/// compares it against the catalog snapshot to detect staleness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub id: String,
    pub alias: String,
    pub checksum: String,
    pub source_path: String,
    pub chunk_index: i64,
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 6, 12, 0, 0).unwrap()
    }

    #[test]
    fn job_transitions_leave_original_untouched() {
        let job = IngestionJob::started("reindex-1", IngestionTrigger::Manual, ts());
        let progressed = job.with_progress("ingesting:man-pages", 4, 50.0);
        let done = progressed.succeeded(ts());

        assert_eq!(job.stage.as_deref(), Some("preparing_index"));
        assert_eq!(job.documents_processed, 0);
        assert_eq!(progressed.status, IngestionStatus::Running);
        assert_eq!(done.status, IngestionStatus::Succeeded);
        assert_eq!(done.percent_complete, Some(100.0));
        assert_eq!(done.documents_processed, 4);
        assert!(done.status.is_terminal());
    }

    #[test]
    fn failed_job_keeps_progress_and_records_message() {
        let job = IngestionJob::started("reindex-2", IngestionTrigger::Init, ts())
            .with_progress("ingesting:info-pages", 2, 33.0);
        let failed = job.failed(ts(), "weaviate unavailable");
        assert_eq!(failed.status, IngestionStatus::Failed);
        assert_eq!(failed.stage.as_deref(), Some("failed"));
        assert_eq!(failed.percent_complete, Some(33.0));
        assert_eq!(failed.error_message.as_deref(), Some("weaviate unavailable"));
    }

    #[test]
    fn job_serializes_with_lowercase_enums() {
        let job = IngestionJob::started("reindex-3", IngestionTrigger::Scheduled, ts());
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["status"], "running");
        assert_eq!(value["trigger"], "scheduled");
        assert_eq!(value["source_alias"], "*");
        assert!(value["completed_at"].is_null());
    }

    #[test]
    fn trigger_parses_known_values_only() {
        assert_eq!("init".parse::<IngestionTrigger>(), Ok(IngestionTrigger::Init));
        assert_eq!("manual".parse::<IngestionTrigger>(), Ok(IngestionTrigger::Manual));
        assert!("nightly".parse::<IngestionTrigger>().is_err());
    }

    #[test]
    fn snapshot_digest_is_order_independent() {
        let a = vec![SourceSnapshot::new("b", "2"), SourceSnapshot::new("a", "1")];
        let b = vec![SourceSnapshot::new("a", "1"), SourceSnapshot::new("b", "2")];
        assert_eq!(SourceSnapshot::digest(&a), SourceSnapshot::digest(&b));
        assert_ne!(
            SourceSnapshot::digest(&a),
            SourceSnapshot::digest(&[SourceSnapshot::new("a", "1")])
        );
    }

    #[test]
    fn source_record_uses_type_key_on_the_wire() {
        let record = SourceRecord {
            alias: "man-pages".into(),
            source_type: SourceType::Man,
            location: "/usr/share/man".into(),
            language: "en".into(),
            size_bytes: 10,
            last_updated: ts(),
            status: SourceStatus::Active,
            checksum: Some("abc".into()),
            notes: None,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "man");
        assert_eq!(value["status"], "active");
        assert!(value.get("notes").is_none());
        let back: SourceRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }
}
