//! Retrieval index over indexed chunks.
//!
//! The [`ChunkIndex`] holds the documents produced for every source,
//! grouped by alias and tagged with the source checksum they were built
//! from. It is optionally persisted as one JSON file next to the catalog.
//!
//! # Scoring
//!
//! Keyword scoring over lower-cased alphanumeric terms:
//!
//! 1. `raw = Σ over query terms of occurrences(term, chunk)`, with each
//!    distinct matched term adding a bonus of `1.0`.
//! 2. Chunks with `raw == 0` are dropped.
//! 3. Scores are min-max normalized to `[0, 1]` (a single hit scores `1.0`).
//! 4. Sort by score (desc), alias (asc), chunk index (asc); truncate.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::Result;
use rag_backend_core::models::IndexedDocument;
use serde::{Deserialize, Serialize};

use crate::storage::{read_json, write_json_atomic};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IndexedSource {
    checksum: String,
    documents: Vec<IndexedDocument>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub document: IndexedDocument,
    pub score: f64,
}

pub struct ChunkIndex {
    path: Option<PathBuf>,
    sources: RwLock<BTreeMap<String, IndexedSource>>,
}

impl ChunkIndex {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            sources: RwLock::new(BTreeMap::new()),
        }
    }

    /// Open (or lazily create) an index persisted at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let sources = read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path: Some(path),
            sources: RwLock::new(sources),
        })
    }

    /// Replace every document of `alias` with `documents`.
    pub fn replace_source(&self, alias: &str, checksum: &str, documents: Vec<IndexedDocument>) -> Result<()> {
        let mut sources = self.sources.write().unwrap();
        sources.insert(
            alias.to_string(),
            IndexedSource {
                checksum: checksum.to_string(),
                documents,
            },
        );
        if let Some(path) = &self.path {
            write_json_atomic(path, &*sources)?;
        }
        Ok(())
    }

    /// Checksum the documents of `alias` were built from.
    pub fn checksum_for(&self, alias: &str) -> Option<String> {
        self.sources
            .read()
            .unwrap()
            .get(alias)
            .map(|s| s.checksum.clone())
    }

    pub fn document_count(&self) -> usize {
        self.sources
            .read()
            .unwrap()
            .values()
            .map(|s| s.documents.len())
            .sum()
    }

    /// Best-scoring chunks among the given aliases.
    pub fn search(&self, query: &str, aliases: &[String], limit: usize) -> Vec<ScoredChunk> {
        let terms = tokenize(query);
        if terms.is_empty() || limit == 0 {
            return Vec::new();
        }
        let allowed: HashSet<&str> = aliases.iter().map(String::as_str).collect();

        let sources = self.sources.read().unwrap();
        let mut candidates: Vec<ScoredChunk> = sources
            .iter()
            .filter(|(alias, _)| allowed.contains(alias.as_str()))
            .flat_map(|(_, source)| source.documents.iter())
            .filter_map(|doc| {
                let raw = raw_score(&terms, &doc.text);
                (raw > 0.0).then(|| ScoredChunk {
                    document: doc.clone(),
                    score: raw,
                })
            })
            .collect();

        normalize(&mut candidates);
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.document.alias.cmp(&b.document.alias))
                .then_with(|| a.document.chunk_index.cmp(&b.document.chunk_index))
        });
        candidates.truncate(limit);
        candidates
    }
}

/// Lower-cased alphanumeric terms.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn raw_score(terms: &[String], text: &str) -> f64 {
    let tokens = tokenize(text);
    let mut score = 0.0;
    let mut seen = HashSet::new();
    for term in terms {
        let hits = tokens.iter().filter(|t| *t == term).count();
        if hits > 0 {
            score += hits as f64;
            if seen.insert(term) {
                score += 1.0;
            }
        }
    }
    score
}

fn normalize(candidates: &mut [ScoredChunk]) {
    let max = candidates.iter().map(|c| c.score).fold(f64::MIN, f64::max);
    let min = candidates.iter().map(|c| c.score).fold(f64::MAX, f64::min);
    let range = max - min;
    for c in candidates.iter_mut() {
        c.score = if range < f64::EPSILON {
            1.0
        } else {
            (c.score - min) / range
        };
    }
}
