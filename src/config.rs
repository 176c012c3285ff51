//! TOML configuration.
//!
//! Loaded once at startup by [`load_config`] and passed down by reference
//! (or inside an `Arc`). Every section and field has a default, so an empty
//! file is a valid configuration.
//!
//! ```toml
//! [transport]
//! socket_path = "/run/user/1000/ragcli/backend.sock"
//! max_frame_bytes = 8388608
//!
//! [storage]
//! data_dir = "~/.local/share/ragcli"
//!
//! [reindex]
//! progress_every_sources = 1
//! progress_interval_ms = 2000
//! index_freshness_days = 30
//!
//! [chunking]
//! max_tokens = 512
//! max_files_per_source = 128
//! include_globs = ["**/*"]
//! exclude_globs = ["**/*.gz"]
//!
//! [health]
//! index_warn_age_days = 30
//! disk_warn_ratio = 0.10
//! disk_fail_ratio = 0.08
//!
//! [[init.seed_sources]]
//! type = "man"
//! location = "/usr/share/man"
//! alias = "man-pages"
//!
//! [logging]
//! filter = "info"
//! ```

use anyhow::{bail, Context, Result};
use rag_backend_core::catalog::SourceCreateRequest;
use rag_backend_core::models::SourceType;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub reindex: ReindexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub init: InitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

fn default_max_frame_bytes() -> usize {
    8 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReindexConfig {
    #[serde(default = "default_progress_every_sources")]
    pub progress_every_sources: usize,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    #[serde(default = "default_freshness_days")]
    pub index_freshness_days: i64,
}

impl Default for ReindexConfig {
    fn default() -> Self {
        Self {
            progress_every_sources: default_progress_every_sources(),
            progress_interval_ms: default_progress_interval_ms(),
            index_freshness_days: default_freshness_days(),
        }
    }
}

fn default_progress_every_sources() -> usize {
    1
}
fn default_progress_interval_ms() -> u64 {
    2000
}
fn default_freshness_days() -> i64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_max_files")]
    pub max_files_per_source: usize,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            max_files_per_source: default_max_files(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_max_tokens() -> usize {
    512
}
fn default_max_files() -> usize {
    128
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    #[serde(default = "default_freshness_days")]
    pub index_warn_age_days: i64,
    /// Free-space ratio at or below which `disk_capacity` warns.
    #[serde(default = "default_disk_warn_ratio")]
    pub disk_warn_ratio: f64,
    /// Free-space ratio at or below which `disk_capacity` fails.
    #[serde(default = "default_disk_fail_ratio")]
    pub disk_fail_ratio: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            index_warn_age_days: default_freshness_days(),
            disk_warn_ratio: default_disk_warn_ratio(),
            disk_fail_ratio: default_disk_fail_ratio(),
        }
    }
}

fn default_disk_warn_ratio() -> f64 {
    0.10
}
fn default_disk_fail_ratio() -> f64 {
    0.08
}

/// A source `init` registers when neither its alias nor its location is
/// already in the catalog.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SeedSource {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub location: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

impl SeedSource {
    fn new(source_type: SourceType, location: &str, alias: &str) -> Self {
        Self {
            source_type,
            location: location.to_string(),
            alias: Some(alias.to_string()),
            language: Some("en".to_string()),
        }
    }

    pub fn to_request(&self) -> SourceCreateRequest {
        SourceCreateRequest {
            source_type: Some(self.source_type),
            location: self.location.clone(),
            alias: self.alias.clone(),
            language: self.language.clone(),
            notes: None,
            trace_id: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InitConfig {
    #[serde(default = "default_seed_sources")]
    pub seed_sources: Vec<SeedSource>,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            seed_sources: default_seed_sources(),
        }
    }
}

fn default_seed_sources() -> Vec<SeedSource> {
    vec![
        SeedSource::new(SourceType::Man, "/usr/share/man", "man-pages"),
        SeedSource::new(SourceType::Info, "/usr/share/info", "info-pages"),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

fn default_filter() -> String {
    "info".to_string()
}

impl Config {
    /// Root of all persisted state.
    ///
    /// `[storage].data_dir`, else the platform data directory
    /// (`$XDG_DATA_HOME/ragcli` or `~/.local/share/ragcli`).
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.storage.data_dir {
            return expand_home(&dir.to_string_lossy());
        }
        let base = dirs::data_dir().context("could not determine user data directory; set [storage].data_dir")?;
        Ok(base.join("ragcli"))
    }

    pub fn socket_path(&self) -> Result<PathBuf> {
        match &self.transport.socket_path {
            Some(path) => expand_home(&path.to_string_lossy()),
            None => Ok(self.data_dir()?.join("backend.sock")),
        }
    }

    pub fn catalog_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("catalog.json"))
    }

    pub fn index_version_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("index_version.json"))
    }

    pub fn audit_log_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("audit.log"))
    }

    pub fn chunk_index_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("chunks.json"))
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(raw: &str) -> Result<PathBuf> {
    expand_home_from(raw, dirs::home_dir())
}

fn expand_home_from(raw: &str, home: Option<PathBuf>) -> Result<PathBuf> {
    if raw != "~" && !raw.starts_with("~/") {
        return Ok(PathBuf::from(raw));
    }
    let Some(home) = home else {
        bail!("cannot expand '{}': home directory is unknown", raw);
    };
    Ok(home.join(raw.trim_start_matches('~').trim_start_matches('/')))
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.max_files_per_source == 0 {
        bail!("chunking.max_files_per_source must be > 0");
    }
    if config.reindex.progress_every_sources == 0 {
        bail!("reindex.progress_every_sources must be >= 1");
    }
    if config.reindex.index_freshness_days < 1 {
        bail!("reindex.index_freshness_days must be >= 1");
    }
    let health = &config.health;
    if !(0.0..=1.0).contains(&health.disk_warn_ratio) || !(0.0..=health.disk_warn_ratio).contains(&health.disk_fail_ratio) {
        bail!("health ratios must satisfy 0 <= disk_fail_ratio <= disk_warn_ratio <= 1");
    }
    if config.transport.max_frame_bytes < 64 {
        bail!("transport.max_frame_bytes must be >= 64");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.transport.max_frame_bytes, 8 * 1024 * 1024);
        assert_eq!(config.reindex.progress_every_sources, 1);
        assert_eq!(config.reindex.progress_interval_ms, 2000);
        assert_eq!(config.chunking.max_tokens, 512);
        assert_eq!(config.health.index_warn_age_days, 30);
        assert_eq!(config.health.disk_warn_ratio, 0.10);
        assert_eq!(config.health.disk_fail_ratio, 0.08);
        assert_eq!(config.logging.filter, "info");
        let aliases: Vec<_> = config.init.seed_sources.iter().filter_map(|s| s.alias.as_deref()).collect();
        assert_eq!(aliases, vec!["man-pages", "info-pages"]);
    }

    #[test]
    fn seed_sources_can_be_replaced_or_emptied() {
        let config = parse_config(
            "[[init.seed_sources]]\ntype = \"kiwix\"\nlocation = \"/data/wiki.zim\"\n",
        )
        .unwrap();
        assert_eq!(config.init.seed_sources.len(), 1);
        let request = config.init.seed_sources[0].to_request();
        assert_eq!(request.source_type, Some(SourceType::Kiwix));
        assert_eq!(request.alias, None);

        let config = parse_config("[init]\nseed_sources = []\n").unwrap();
        assert!(config.init.seed_sources.is_empty());
    }

    #[test]
    fn example_config_parses() {
        let config = parse_config(include_str!("../config/rag-backend.example.toml")).unwrap();
        assert_eq!(config.chunking.exclude_globs, vec!["**/*.gz", "**/*.zim"]);
        assert!(config.transport.socket_path.is_none());
    }

    #[test]
    fn storage_paths_follow_data_dir() {
        let config = parse_config("[storage]\ndata_dir = \"/var/lib/ragcli\"\n").unwrap();
        assert_eq!(config.catalog_path().unwrap(), PathBuf::from("/var/lib/ragcli/catalog.json"));
        assert_eq!(config.audit_log_path().unwrap(), PathBuf::from("/var/lib/ragcli/audit.log"));
        assert_eq!(config.socket_path().unwrap(), PathBuf::from("/var/lib/ragcli/backend.sock"));
    }

    #[test]
    fn explicit_socket_path_wins() {
        let config = parse_config(
            "[storage]\ndata_dir = \"/data\"\n[transport]\nsocket_path = \"/tmp/rag.sock\"\n",
        )
        .unwrap();
        assert_eq!(config.socket_path().unwrap(), PathBuf::from("/tmp/rag.sock"));
    }

    #[test]
    fn tilde_expands_against_home() {
        let home = Some(PathBuf::from("/home/ada"));
        assert_eq!(
            expand_home_from("~/.local/share/ragcli", home.clone()).unwrap(),
            PathBuf::from("/home/ada/.local/share/ragcli")
        );
        assert_eq!(expand_home_from("~", home.clone()).unwrap(), PathBuf::from("/home/ada"));
        assert_eq!(expand_home_from("/srv/ragcli", home).unwrap(), PathBuf::from("/srv/ragcli"));
    }

    #[test]
    fn tilde_without_home_is_an_error() {
        let err = expand_home_from("~/ragcli", None).unwrap_err();
        assert!(err.to_string().contains("home directory is unknown"));
        assert_eq!(expand_home_from("relative/dir", None).unwrap(), PathBuf::from("relative/dir"));
    }

    #[test]
    fn rejects_zero_max_tokens() {
        let err = parse_config("[chunking]\nmax_tokens = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_tokens"));
    }

    #[test]
    fn rejects_zero_progress_every() {
        assert!(parse_config("[reindex]\nprogress_every_sources = 0\n").is_err());
    }

    #[test]
    fn rejects_fail_ratio_above_warn_ratio() {
        let err = parse_config("[health]\ndisk_warn_ratio = 0.05\ndisk_fail_ratio = 0.2\n").unwrap_err();
        assert!(err.to_string().contains("disk_fail_ratio"));
    }

    #[test]
    fn rejects_unknown_types() {
        assert!(parse_config("[chunking]\nmax_tokens = \"many\"\n").is_err());
    }
}
