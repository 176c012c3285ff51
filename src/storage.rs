//! File-backed collaborator implementations.
//!
//! | Type | File | Write discipline |
//! |------|------|------------------|
//! | [`JsonCatalogStore`] | `catalog.json` | temp file + rename, serialized by a mutex |
//! | [`JsonIndexVersionStore`] | `index_version.json` | temp file + rename |
//! | [`AuditLog`] | `audit.log` | one JSON object per line, append-only |

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rag_backend_core::audit::AuditEntry;
use rag_backend_core::clock::Clock;
use rag_backend_core::models::{ContentIndexVersion, SourceCatalog};
use rag_backend_core::store::{AuditSink, CatalogStore, IndexVersionWriter};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let bytes = serde_json::to_vec_pretty(value)?;
    {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(&bytes)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Read a JSON document, returning `None` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

pub struct JsonCatalogStore {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

impl JsonCatalogStore {
    pub fn new(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            clock,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CatalogStore for JsonCatalogStore {
    fn load(&self) -> Result<SourceCatalog> {
        Ok(read_json(&self.path)?.unwrap_or_else(|| SourceCatalog::empty(self.clock.now())))
    }

    fn save(&self, catalog: &SourceCatalog) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        write_json_atomic(&self.path, catalog)?;
        tracing::debug!(path = %self.path.display(), version = catalog.version, "catalog saved");
        Ok(())
    }
}

pub struct JsonIndexVersionStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonIndexVersionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

impl IndexVersionWriter for JsonIndexVersionStore {
    fn save(&self, version: &ContentIndexVersion) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        write_json_atomic(&self.path, version)
    }

    fn load(&self) -> Result<Option<ContentIndexVersion>> {
        read_json(&self.path)
    }
}

/// Newline-delimited JSON audit log.
pub struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Every entry in the log, oldest first.
    pub fn read_all(&self) -> Result<Vec<AuditEntry>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("Malformed audit log line"))
            .collect()
    }
}

impl AuditSink for AuditLog {
    fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().unwrap();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open audit log: {}", self.path.display()))?;
        file.write_all(&line)?;
        Ok(())
    }
}
