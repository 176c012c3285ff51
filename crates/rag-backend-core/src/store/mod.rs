//! Collaborator interfaces consumed by the reindex orchestrator and the
//! request handlers.
//!
//! Concrete adapters live in the `rag-backend` crate (JSON files, NDJSON
//! audit log, filesystem chunk builder). The [`memory`] module provides
//! in-process implementations for tests.
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`CatalogStore`] | Load and atomically replace the source catalog |
//! | [`IndexVersionWriter`] | Persist the record of the latest index build |
//! | [`AuditSink`] | Append-only audit log |
//! | [`ChecksumCalculator`] | Content checksum for a source location |
//! | [`SourceLocator`] | Expand and verify a source location |
//! | [`ChunkBuilder`] | Chunk, embed, and store the content of one source |
//!
//! Implementations serialize their own writes; callers never lock around them.

pub mod memory;

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::audit::{AuditEntry, SourceMutation};
use crate::models::{ContentIndexVersion, IndexedDocument, SourceCatalog, SourceType};

pub trait CatalogStore: Send + Sync {
    /// Load the current catalog. A store that has never been written returns
    /// an empty catalog with version `0`.
    fn load(&self) -> Result<SourceCatalog>;

    /// Replace the persisted catalog as a single atomic operation.
    fn save(&self, catalog: &SourceCatalog) -> Result<()>;
}

pub trait IndexVersionWriter: Send + Sync {
    fn save(&self, version: &ContentIndexVersion) -> Result<()>;

    fn load(&self) -> Result<Option<ContentIndexVersion>>;
}

pub trait AuditSink: Send + Sync {
    fn append(&self, entry: &AuditEntry) -> Result<()>;

    /// Record a catalog mutation with a normalized language tag.
    fn log_mutation(&self, timestamp: DateTime<Utc>, mutation: &SourceMutation) -> Result<()> {
        let entry = AuditEntry::mutation(timestamp, mutation)?;
        self.append(&entry)
    }
}

pub trait ChecksumCalculator: Send + Sync {
    fn checksum(&self, path: &Path) -> Result<String>;
}

/// A source location that exists, with its on-disk shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLocation {
    pub path: PathBuf,
    pub is_file: bool,
    pub size_bytes: u64,
}

pub trait SourceLocator: Send + Sync {
    /// Fails when the location does not exist.
    fn resolve(&self, location: &str) -> Result<ResolvedLocation>;
}

/// Progress callback: `(units_done, units_total)` within one source.
pub type ChunkProgress<'a> = &'a (dyn Fn(usize, usize) + Send + Sync);

/// Input to [`ChunkBuilder::build`] for one changed source.
pub struct ChunkRequest<'a> {
    pub alias: &'a str,
    pub checksum: &'a str,
    pub location: &'a Path,
    pub source_type: SourceType,
    pub progress: Option<ChunkProgress<'a>>,
}

/// Turns the content of one source into embedded, stored documents.
#[async_trait]
pub trait ChunkBuilder: Send + Sync {
    async fn build(&self, request: ChunkRequest<'_>) -> Result<Vec<IndexedDocument>>;
}
