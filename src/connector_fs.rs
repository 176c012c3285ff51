//! Filesystem chunk builder.
//!
//! Walks a source location (a single file or a directory tree), keeps the
//! files matching the `[chunking]` include globs and none of the exclude
//! globs, splits each file into paragraph chunks, and replaces the source's
//! entry in the [`ChunkIndex`]. Files that are not valid UTF-8 are skipped.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use rag_backend_core::models::IndexedDocument;
use rag_backend_core::store::{ChunkBuilder, ChunkRequest};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::chunk::chunk_text;
use crate::config::ChunkingConfig;
use crate::search::ChunkIndex;

pub struct FsChunkBuilder {
    index: Arc<ChunkIndex>,
    max_tokens: usize,
    max_files: usize,
    include: GlobSet,
    exclude: GlobSet,
}

impl FsChunkBuilder {
    pub fn new(config: &ChunkingConfig, index: Arc<ChunkIndex>) -> Result<Self> {
        let mut excludes = vec!["**/.git/**".to_string()];
        excludes.extend(config.exclude_globs.iter().cloned());
        Ok(Self {
            index,
            max_tokens: config.max_tokens,
            max_files: config.max_files_per_source,
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
        })
    }

    /// Matching files under `root`, sorted by relative path.
    fn scan(&self, root: &Path) -> Result<Vec<(String, std::path::PathBuf)>> {
        if root.is_file() {
            let name = root
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            return Ok(vec![(name, root.to_path_buf())]);
        }
        if !root.is_dir() {
            bail!("source location does not exist: {}", root.display());
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            if self.exclude.is_match(&relative) || !self.include.is_match(&relative) {
                continue;
            }
            files.push((relative, entry.path().to_path_buf()));
            if files.len() >= self.max_files {
                tracing::debug!(root = %root.display(), limit = self.max_files, "file limit reached");
                break;
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl ChunkBuilder for FsChunkBuilder {
    async fn build(&self, request: ChunkRequest<'_>) -> Result<Vec<IndexedDocument>> {
        let files = self.scan(request.location)?;
        let total = files.len();
        let mut documents = Vec::new();

        for (done, (relative, path)) in files.iter().enumerate() {
            match tokio::fs::read_to_string(path).await {
                Ok(body) => {
                    for chunk in chunk_text(&body, self.max_tokens) {
                        documents.push(IndexedDocument {
                            id: document_id(request.alias, relative, chunk.index),
                            alias: request.alias.to_string(),
                            checksum: request.checksum.to_string(),
                            source_path: path.display().to_string(),
                            chunk_index: chunk.index,
                            text: chunk.text,
                        });
                    }
                }
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "skipping unreadable file");
                }
            }
            if let Some(progress) = request.progress {
                progress(done + 1, total);
            }
        }

        self.index
            .replace_source(request.alias, request.checksum, documents.clone())?;
        tracing::info!(
            alias = request.alias,
            source_type = ?request.source_type,
            files = total,
            chunks = documents.len(),
            "source chunked"
        );
        Ok(documents)
    }
}

fn document_id(alias: &str, relative: &str, index: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(alias.as_bytes());
    hasher.update([0u8]);
    hasher.update(relative.as_bytes());
    hasher.update(index.to_le_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
