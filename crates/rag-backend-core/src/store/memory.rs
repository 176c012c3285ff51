//! In-memory collaborator implementations for tests.
//!
//! State lives behind `std::sync::RwLock`/`Mutex`; every method returns
//! immediately.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::audit::AuditEntry;
use crate::models::{ContentIndexVersion, IndexedDocument, SourceCatalog};

use super::{
    AuditSink, CatalogStore, ChecksumCalculator, ChunkBuilder, ChunkRequest, IndexVersionWriter, ResolvedLocation,
    SourceLocator,
};

/// Catalog held in memory. Counts saves so tests can assert persistence.
pub struct InMemoryCatalogStore {
    catalog: RwLock<SourceCatalog>,
    saves: Mutex<usize>,
}

impl InMemoryCatalogStore {
    pub fn new(catalog: SourceCatalog) -> Self {
        Self {
            catalog: RwLock::new(catalog),
            saves: Mutex::new(0),
        }
    }

    pub fn empty(now: DateTime<Utc>) -> Self {
        Self::new(SourceCatalog::empty(now))
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap()
    }

    pub fn current(&self) -> SourceCatalog {
        self.catalog.read().unwrap().clone()
    }
}

impl CatalogStore for InMemoryCatalogStore {
    fn load(&self) -> Result<SourceCatalog> {
        Ok(self.catalog.read().unwrap().clone())
    }

    fn save(&self, catalog: &SourceCatalog) -> Result<()> {
        *self.catalog.write().unwrap() = catalog.clone();
        *self.saves.lock().unwrap() += 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryIndexVersions {
    latest: RwLock<Option<ContentIndexVersion>>,
}

impl InMemoryIndexVersions {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexVersionWriter for InMemoryIndexVersions {
    fn save(&self, version: &ContentIndexVersion) -> Result<()> {
        *self.latest.write().unwrap() = Some(version.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<ContentIndexVersion>> {
        Ok(self.latest.read().unwrap().clone())
    }
}

/// Audit sink that keeps every entry in order.
#[derive(Default)]
pub struct RecordingAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap().clone()
    }

    /// `(action, status)` pairs, in append order.
    pub fn actions(&self) -> Vec<(String, String)> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.action.clone(), e.status.clone()))
            .collect()
    }
}

impl AuditSink for RecordingAuditSink {
    fn append(&self, entry: &AuditEntry) -> Result<()> {
        self.entries.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

/// Checksums looked up by location. Unknown locations are an error.
#[derive(Default)]
pub struct StaticChecksums {
    values: RwLock<HashMap<PathBuf, String>>,
}

impl StaticChecksums {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, path: impl Into<PathBuf>, checksum: impl Into<String>) {
        self.values.write().unwrap().insert(path.into(), checksum.into());
    }
}

impl ChecksumCalculator for StaticChecksums {
    fn checksum(&self, path: &Path) -> Result<String> {
        match self.values.read().unwrap().get(path) {
            Some(value) => Ok(value.clone()),
            None => bail!("no checksum registered for {}", path.display()),
        }
    }
}

/// Locations registered up front; anything else does not exist.
#[derive(Default)]
pub struct StaticLocations {
    known: RwLock<HashMap<String, ResolvedLocation>>,
}

impl StaticLocations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dir(&self, location: &str, size_bytes: u64) {
        self.insert(location, false, size_bytes);
    }

    pub fn add_file(&self, location: &str, size_bytes: u64) {
        self.insert(location, true, size_bytes);
    }

    fn insert(&self, location: &str, is_file: bool, size_bytes: u64) {
        self.known.write().unwrap().insert(
            location.to_string(),
            ResolvedLocation {
                path: PathBuf::from(location),
                is_file,
                size_bytes,
            },
        );
    }
}

impl SourceLocator for StaticLocations {
    fn resolve(&self, location: &str) -> Result<ResolvedLocation> {
        match self.known.read().unwrap().get(location) {
            Some(resolved) => Ok(resolved.clone()),
            None => bail!("source location {} does not exist", location),
        }
    }
}

/// Chunk builder that fabricates a fixed number of documents per source
/// and records which aliases it was asked to build.
pub struct ScriptedChunkBuilder {
    documents_per_source: usize,
    failing: RwLock<HashSet<String>>,
    built: Mutex<Vec<String>>,
}

impl ScriptedChunkBuilder {
    pub fn new(documents_per_source: usize) -> Self {
        Self {
            documents_per_source,
            failing: RwLock::new(HashSet::new()),
            built: Mutex::new(Vec::new()),
        }
    }

    /// Make every future build of `alias` fail.
    pub fn fail_on(&self, alias: &str) {
        self.failing.write().unwrap().insert(alias.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.write().unwrap().clear();
    }

    pub fn built_aliases(&self) -> Vec<String> {
        self.built.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChunkBuilder for ScriptedChunkBuilder {
    async fn build(&self, request: ChunkRequest<'_>) -> Result<Vec<IndexedDocument>> {
        self.built.lock().unwrap().push(request.alias.to_string());
        if self.failing.read().unwrap().contains(request.alias) {
            bail!("embedding service unavailable for {}", request.alias);
        }

        let total = self.documents_per_source;
        let documents = (0..total)
            .map(|i| {
                if let Some(progress) = request.progress {
                    progress(i + 1, total);
                }
                IndexedDocument {
                    id: format!("{}-{}", request.alias, i),
                    alias: request.alias.to_string(),
                    checksum: request.checksum.to_string(),
                    source_path: request.location.display().to_string(),
                    chunk_index: i as i64,
                    text: format!("{} chunk {}", request.alias, i),
                }
            })
            .collect();
        Ok(documents)
    }
}
