//! Catalog mutations: registering, updating, and retiring knowledge sources.
//!
//! Every mutation loads the catalog, applies one change, bumps the version
//! by one, saves it, and appends a `source_*` entry through
//! [`AuditSink::log_mutation`]. New sources start as `pending_validation`
//! and carry no snapshot, so they never affect the consistency guard until
//! an operator activates them and a reindex snapshots them.
//!
//! Sources leaving the `active` state lose their snapshot in the same
//! write, which keeps the snapshot set equal to the active set.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, LazyLock, Mutex};

use regex::Regex;
use serde::Serialize;

use crate::audit::{normalize_language, LanguageError, SourceMutation};
use crate::clock::Clock;
use crate::models::{SourceCatalog, SourceRecord, SourceStatus, SourceType};
use crate::store::{AuditSink, CatalogStore, ChecksumCalculator, SourceLocator};

pub const DEFAULT_LANGUAGE: &str = "en";
pub const ALIAS_MAX_LEN: usize = 31;

static ALIAS_SANITIZER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("alias sanitizer pattern"));

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("source '{0}' is not in the catalog")]
    UnknownSource(String),

    #[error("alias '{0}' is already registered")]
    DuplicateAlias(String),

    #[error("no changes requested for source '{0}'")]
    NothingToUpdate(String),

    #[error("a removal reason is required")]
    MissingReason,

    #[error(transparent)]
    Language(#[from] LanguageError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceCreateRequest {
    pub source_type: Option<SourceType>,
    pub location: String,
    /// Fixed alias; generated from the location when absent.
    pub alias: Option<String>,
    pub language: Option<String>,
    pub notes: Option<String>,
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceUpdateRequest {
    pub location: Option<String>,
    pub notes: Option<String>,
    pub language: Option<String>,
    pub status: Option<SourceStatus>,
    pub trace_id: Option<String>,
}

impl SourceUpdateRequest {
    fn is_empty(&self) -> bool {
        self.location.is_none() && self.notes.is_none() && self.language.is_none() && self.status.is_none()
    }
}

/// Result of one mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceMutationResult {
    pub source: SourceRecord,
    pub catalog_version: u64,
}

/// Collaborators used by [`SourceCatalogService`].
#[derive(Clone)]
pub struct CatalogDeps {
    pub catalog: Arc<dyn CatalogStore>,
    pub audit: Arc<dyn AuditSink>,
    pub checksums: Arc<dyn ChecksumCalculator>,
    pub locator: Arc<dyn SourceLocator>,
    pub clock: Arc<dyn Clock>,
}

pub struct SourceCatalogService {
    deps: CatalogDeps,
    write: Mutex<()>,
}

impl SourceCatalogService {
    pub fn new(deps: CatalogDeps) -> Self {
        Self {
            deps,
            write: Mutex::new(()),
        }
    }

    pub fn list(&self) -> Result<SourceCatalog, CatalogError> {
        Ok(self.deps.catalog.load()?)
    }

    /// Register a new source as `pending_validation`.
    pub fn create(&self, request: &SourceCreateRequest) -> Result<SourceMutationResult, CatalogError> {
        let _guard = self.write.lock().unwrap();
        let language = normalize_language(request.language.as_deref().unwrap_or(DEFAULT_LANGUAGE))?;
        let resolved = self.deps.locator.resolve(&request.location)?;
        let source_type = request.source_type.unwrap_or(SourceType::Man);

        let mut catalog = self.deps.catalog.load()?;
        let existing: HashSet<&str> = catalog.sources.iter().map(|s| s.alias.as_str()).collect();
        let alias = match request.alias.as_deref() {
            Some(fixed) => {
                let alias = slugify(fixed);
                if existing.contains(alias.as_str()) {
                    return Err(CatalogError::DuplicateAlias(alias));
                }
                alias
            }
            None => generate_alias(location_name(&resolved.path, resolved.is_file), source_type, &existing),
        };
        let checksum = self.deps.checksums.checksum(&resolved.path)?;
        let now = self.deps.clock.now();

        let record = SourceRecord {
            alias: alias.clone(),
            source_type,
            location: resolved.path.display().to_string(),
            language,
            size_bytes: resolved.size_bytes,
            last_updated: now,
            status: SourceStatus::PendingValidation,
            checksum: Some(checksum),
            notes: non_empty(request.notes.as_deref()),
        };
        catalog.sources.push(record.clone());
        catalog.sources.sort_by(|a, b| a.alias.cmp(&b.alias));

        let version = self.commit(catalog)?;
        tracing::info!(alias = %alias, catalog_version = version, "source registered");
        self.log(&record, "source_add", request.trace_id.as_deref(), Some(format!("location={}", record.location)));
        Ok(SourceMutationResult {
            source: record,
            catalog_version: version,
        })
    }

    /// Change location, notes, language, or status of one source.
    pub fn update(&self, alias: &str, request: &SourceUpdateRequest) -> Result<SourceMutationResult, CatalogError> {
        if request.is_empty() {
            return Err(CatalogError::NothingToUpdate(alias.to_string()));
        }
        let _guard = self.write.lock().unwrap();
        let language = request.language.as_deref().map(normalize_language).transpose()?;

        let mut catalog = self.deps.catalog.load()?;
        let index = position(&catalog, alias)?;
        let mut record = catalog.sources[index].clone();
        let mut changed: Vec<&str> = Vec::new();

        if let Some(location) = request.location.as_deref() {
            let resolved = self.deps.locator.resolve(location)?;
            record.checksum = Some(self.deps.checksums.checksum(&resolved.path)?);
            record.location = resolved.path.display().to_string();
            record.size_bytes = resolved.size_bytes;
            changed.push("location");
        }
        if let Some(language) = language {
            record.language = language;
            changed.push("language");
        }
        if let Some(notes) = request.notes.as_deref() {
            record.notes = non_empty(Some(notes));
            changed.push("notes");
        }
        if let Some(status) = request.status {
            record.status = status;
            changed.push("status");
        }
        record.last_updated = self.deps.clock.now();

        if !record.is_active() {
            catalog.snapshots.retain(|s| s.alias != record.alias);
        }
        catalog.sources[index] = record.clone();

        let version = self.commit(catalog)?;
        tracing::info!(alias, catalog_version = version, fields = ?changed, "source updated");
        self.log(&record, "source_update", request.trace_id.as_deref(), Some(format!("fields={}", changed.join(","))));
        Ok(SourceMutationResult {
            source: record,
            catalog_version: version,
        })
    }

    /// Quarantine a source and drop it from the indexed set.
    pub fn remove(&self, alias: &str, reason: &str, trace_id: Option<&str>) -> Result<SourceMutationResult, CatalogError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(CatalogError::MissingReason);
        }
        let _guard = self.write.lock().unwrap();

        let mut catalog = self.deps.catalog.load()?;
        let index = position(&catalog, alias)?;
        let record = {
            let record = &mut catalog.sources[index];
            record.status = SourceStatus::Quarantined;
            record.last_updated = self.deps.clock.now();
            record.clone()
        };
        catalog.snapshots.retain(|s| s.alias != record.alias);

        let version = self.commit(catalog)?;
        tracing::info!(alias, catalog_version = version, reason, "source quarantined");
        self.log(&record, "source_remove", trace_id, Some(format!("reason={}", reason)));
        Ok(SourceMutationResult {
            source: record,
            catalog_version: version,
        })
    }

    fn commit(&self, mut catalog: SourceCatalog) -> Result<u64, CatalogError> {
        catalog.version += 1;
        catalog.updated_at = self.deps.clock.now();
        self.deps.catalog.save(&catalog)?;
        Ok(catalog.version)
    }

    fn log(&self, record: &SourceRecord, action: &str, trace_id: Option<&str>, details: Option<String>) {
        let mutation = SourceMutation {
            action: action.to_string(),
            alias: record.alias.clone(),
            status: "success".to_string(),
            language: record.language.clone(),
            trace_id: trace_id.map(str::to_string),
            details,
        };
        if let Err(e) = self.deps.audit.log_mutation(self.deps.clock.now(), &mutation) {
            tracing::warn!(alias = %record.alias, action, error = %e, "failed to write source audit entry");
        }
    }
}

fn position(catalog: &SourceCatalog, alias: &str) -> Result<usize, CatalogError> {
    catalog
        .sources
        .iter()
        .position(|s| s.alias == alias)
        .ok_or_else(|| CatalogError::UnknownSource(alias.to_string()))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Files are named by their stem, directories by their final component.
fn location_name(path: &Path, is_file: bool) -> &str {
    let name = if is_file { path.file_stem() } else { path.file_name() };
    name.and_then(|n| n.to_str()).unwrap_or("")
}

/// Lower-case, collapse runs of anything outside `[a-z0-9]` to `-`.
pub fn slugify(value: &str) -> String {
    let lowered = value.to_lowercase();
    let slug = ALIAS_SANITIZER.replace_all(&lowered, "-");
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "source".to_string()
    } else {
        trim_alias(slug, "")
    }
}

fn trim_alias(alias: &str, suffix: &str) -> String {
    let budget = ALIAS_MAX_LEN.saturating_sub(suffix.len());
    let trimmed: String = alias.chars().take(budget).collect();
    let trimmed = trimmed.trim_end_matches('-');
    let trimmed = if trimmed.is_empty() { "source" } else { trimmed };
    format!("{}{}", trimmed, suffix)
}

/// A unique alias for `name`, suffixed `-2`, `-3`, ... on collision.
pub fn generate_alias(name: &str, source_type: SourceType, existing: &HashSet<&str>) -> String {
    let base = if name.chars().any(|c| c.is_ascii_alphanumeric()) {
        slugify(name)
    } else {
        slugify(source_type.as_str())
    };
    if !existing.contains(base.as_str()) {
        return base;
    }
    (2..)
        .map(|n| trim_alias(&base, &format!("-{}", n)))
        .find(|candidate| !existing.contains(candidate.as_str()))
        .unwrap_or(base)
}
