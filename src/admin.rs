//! `/v1/admin/init`: bootstrap for a new installation.
//!
//! Ensures the backend's state directories exist, registers the configured
//! seed sources that are not yet in the catalog, then refuses with
//! `INDEX_MISSING`/`INDEX_STALE` until a reindex has produced a catalog
//! whose snapshots match its active sources.
//!
//! Seeds enter as `pending_validation`, so seeding never changes the
//! guard's verdict. A seed whose location cannot be resolved is skipped
//! with a warning.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use rag_backend_core::catalog::{SourceCatalogService, SourceCreateRequest};
use rag_backend_core::guard::ensure_index_current;
use rag_backend_core::models::SourceRecord;
use serde::Serialize;

use crate::error::HandlerResult;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InitReport {
    pub catalog_version: u64,
    pub created_directories: Vec<String>,
    /// Sources registered by this run.
    pub seeded_sources: Vec<SourceRecord>,
}

pub struct InitService {
    sources: Arc<SourceCatalogService>,
    directories: Vec<PathBuf>,
    seeds: Vec<SourceCreateRequest>,
}

impl InitService {
    /// `directories` are created (if missing) on every init, in order.
    pub fn new(sources: Arc<SourceCatalogService>, directories: Vec<PathBuf>, seeds: Vec<SourceCreateRequest>) -> Self {
        Self {
            sources,
            directories,
            seeds,
        }
    }

    pub fn init(&self) -> HandlerResult<InitReport> {
        let mut created_directories = Vec::with_capacity(self.directories.len());
        for dir in &self.directories {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
            created_directories.push(dir.display().to_string());
        }

        let seeded_sources = self.seed()?;
        let catalog = self.sources.list()?;
        ensure_index_current(&catalog)?;
        tracing::info!(
            catalog_version = catalog.version,
            sources = catalog.sources.len(),
            seeded = seeded_sources.len(),
            "admin init completed"
        );
        Ok(InitReport {
            catalog_version: catalog.version,
            created_directories,
            seeded_sources,
        })
    }

    fn seed(&self) -> HandlerResult<Vec<SourceRecord>> {
        let mut seeded = Vec::new();
        for seed in &self.seeds {
            let catalog = self.sources.list()?;
            let present = catalog.sources.iter().any(|s| {
                s.location == seed.location || seed.alias.as_deref().is_some_and(|alias| s.alias == alias)
            });
            if present {
                continue;
            }
            match self.sources.create(seed) {
                Ok(result) => seeded.push(result.source),
                Err(e) => tracing::warn!(location = %seed.location, error = %e, "skipping seed source"),
            }
        }
        Ok(seeded)
    }
}
