//! Health diagnostics for `/v1/admin/health` and `rag-backend health`.
//!
//! | Component | PASS | WARN | FAIL |
//! |-----------|------|------|------|
//! | `disk_capacity` | free space above `disk_warn_ratio` | at or below `disk_warn_ratio` | at or below `disk_fail_ratio`, or unreadable |
//! | `index_freshness` | catalog updated recently | older than `index_warn_age_days` | never |
//! | `source_access` | every source usable | some `pending_validation` | quarantined/error sources, or none registered |
//! | `index_consistency` | guard passes | never | `INDEX_MISSING` / `INDEX_STALE` |
//!
//! The overall status is the worst component status.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rag_backend_core::clock::Clock;
use rag_backend_core::guard::ensure_index_current;
use rag_backend_core::models::{SourceCatalog, SourceStatus};
use rag_backend_core::store::CatalogStore;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::config::HealthConfig;

/// Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Pass,
    Warn,
    Fail,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Pass => "pass",
            HealthStatus::Warn => "warn",
            HealthStatus::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthComponent {
    DiskCapacity,
    IndexFreshness,
    SourceAccess,
    IndexConsistency,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheck {
    pub component: HealthComponent,
    pub status: HealthStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub metrics: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub overall_status: HealthStatus,
    pub generated_at: DateTime<Utc>,
    pub results: Vec<HealthCheck>,
}

impl HealthReport {
    /// Wire payload: the report plus the request's trace id.
    pub fn to_body(&self, trace_id: &str) -> Value {
        json!({
            "overall_status": self.overall_status,
            "trace_id": trace_id,
            "generated_at": self.generated_at,
            "results": self.results,
        })
    }
}

/// Capacity of the filesystem holding the backend's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

pub trait DiskGauge: Send + Sync {
    fn usage(&self) -> Result<DiskUsage>;
}

/// `statvfs(3)` on the data directory, or its nearest existing ancestor.
pub struct StatvfsGauge {
    path: PathBuf,
}

impl StatvfsGauge {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DiskGauge for StatvfsGauge {
    fn usage(&self) -> Result<DiskUsage> {
        let target = self
            .path
            .ancestors()
            .find(|p| p.exists())
            .unwrap_or_else(|| Path::new("."));
        let stats = nix::sys::statvfs::statvfs(target)
            .with_context(|| format!("Failed to stat filesystem at {}", target.display()))?;
        let fragment = stats.fragment_size() as u64;
        Ok(DiskUsage {
            total_bytes: (stats.blocks() as u64).saturating_mul(fragment),
            available_bytes: (stats.blocks_available() as u64).saturating_mul(fragment),
        })
    }
}

pub struct HealthService {
    catalog: Arc<dyn CatalogStore>,
    clock: Arc<dyn Clock>,
    disk: Arc<dyn DiskGauge>,
    warn_age: Duration,
    disk_warn_ratio: f64,
    disk_fail_ratio: f64,
}

impl HealthService {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        clock: Arc<dyn Clock>,
        disk: Arc<dyn DiskGauge>,
        config: &HealthConfig,
    ) -> Self {
        let disk_warn_ratio = config.disk_warn_ratio.clamp(0.0, 1.0);
        Self {
            catalog,
            clock,
            disk,
            warn_age: Duration::days(config.index_warn_age_days.max(0)),
            disk_warn_ratio,
            disk_fail_ratio: config.disk_fail_ratio.clamp(0.0, disk_warn_ratio),
        }
    }

    pub fn evaluate(&self) -> Result<HealthReport> {
        let catalog = self.catalog.load()?;
        let now = self.clock.now();
        let results = vec![
            self.disk_capacity(now),
            self.index_freshness(&catalog, now),
            source_access(&catalog, now),
            index_consistency(&catalog, now),
        ];
        let overall_status = results
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Pass);
        tracing::debug!(
            overall = overall_status.as_str(),
            catalog_version = catalog.version,
            "health evaluated"
        );
        Ok(HealthReport {
            overall_status,
            generated_at: now,
            results,
        })
    }

    fn disk_capacity(&self, now: DateTime<Utc>) -> HealthCheck {
        const REMEDIATION: &str = "Delete temporary files or expand the partition.";

        let usage = match self.disk.usage() {
            Ok(usage) if usage.total_bytes > 0 => usage,
            Ok(usage) => {
                return HealthCheck {
                    component: HealthComponent::DiskCapacity,
                    status: HealthStatus::Fail,
                    message: "Unable to determine disk capacity; total bytes reported as zero.".to_string(),
                    remediation: Some("Verify mount points and ensure the ragcli data volume is accessible.".to_string()),
                    timestamp: now,
                    metrics: metrics(json!({
                        "total_bytes": usage.total_bytes,
                        "available_bytes": usage.available_bytes,
                    })),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "disk usage lookup failed");
                return HealthCheck {
                    component: HealthComponent::DiskCapacity,
                    status: HealthStatus::Fail,
                    message: format!("Unable to determine disk capacity: {:#}", e),
                    remediation: Some("Verify mount points and ensure the ragcli data volume is accessible.".to_string()),
                    timestamp: now,
                    metrics: Map::new(),
                };
            }
        };

        let available = usage.available_bytes.min(usage.total_bytes);
        let ratio = available as f64 / usage.total_bytes as f64;
        let percent_free = ratio * 100.0;
        let (status, remediation) = if ratio <= self.disk_fail_ratio {
            (HealthStatus::Fail, Some(REMEDIATION.to_string()))
        } else if ratio <= self.disk_warn_ratio {
            (HealthStatus::Warn, Some(REMEDIATION.to_string()))
        } else {
            (HealthStatus::Pass, None)
        };

        HealthCheck {
            component: HealthComponent::DiskCapacity,
            status,
            message: format!("{:.0}% free space remaining", percent_free),
            remediation,
            timestamp: now,
            metrics: metrics(json!({
                "total_bytes": usage.total_bytes,
                "available_bytes": available,
                "percent_free": percent_free,
            })),
        }
    }

    fn index_freshness(&self, catalog: &SourceCatalog, now: DateTime<Utc>) -> HealthCheck {
        let age = (now - catalog.updated_at).max(Duration::zero());
        let days = age.num_days();
        let (status, message, remediation) = if age >= self.warn_age {
            (
                HealthStatus::Warn,
                format!("Active index is {} days old; refresh recommended.", days),
                Some("Run ragadmin reindex to refresh the knowledge index.".to_string()),
            )
        } else if days > 0 {
            (HealthStatus::Pass, format!("Index updated {} days ago.", days), None)
        } else {
            (HealthStatus::Pass, "Index recently updated.".to_string(), None)
        };

        HealthCheck {
            component: HealthComponent::IndexFreshness,
            status,
            message,
            remediation,
            timestamp: now,
            metrics: metrics(json!({
                "catalog_version": catalog.version,
                "age_seconds": age.num_seconds(),
                "snapshot_count": catalog.snapshots.len(),
            })),
        }
    }
}

fn source_access(catalog: &SourceCatalog, now: DateTime<Utc>) -> HealthCheck {
    let mut failing: Vec<&str> = Vec::new();
    let mut pending: Vec<&str> = Vec::new();
    let mut active = 0usize;
    for source in &catalog.sources {
        match source.status {
            SourceStatus::Quarantined | SourceStatus::Error => failing.push(&source.alias),
            SourceStatus::PendingValidation => pending.push(&source.alias),
            SourceStatus::Active => active += 1,
        }
    }
    failing.sort_unstable();
    pending.sort_unstable();

    let (status, message, remediation) = if !failing.is_empty() {
        (
            HealthStatus::Fail,
            format!("Sources require remediation: {}", failing.join(", ")),
            Some("Inspect the quarantined or failing sources and fix their locations.".to_string()),
        )
    } else if !pending.is_empty() {
        (
            HealthStatus::Warn,
            format!("Sources pending validation: {}", pending.join(", ")),
            Some("Run ragadmin reindex or complete validation for pending sources.".to_string()),
        )
    } else if catalog.sources.is_empty() {
        (
            HealthStatus::Fail,
            "No sources registered; ingestion must succeed before querying.".to_string(),
            Some("Register knowledge sources in the catalog, then run ragadmin reindex.".to_string()),
        )
    } else {
        (HealthStatus::Pass, "All sources accessible.".to_string(), None)
    };

    HealthCheck {
        component: HealthComponent::SourceAccess,
        status,
        message,
        remediation,
        timestamp: now,
        metrics: metrics(json!({
            "active_sources": active,
            "failing_sources": failing.len(),
            "pending_sources": pending.len(),
        })),
    }
}

fn index_consistency(catalog: &SourceCatalog, now: DateTime<Utc>) -> HealthCheck {
    let (status, message, remediation, code) = match ensure_index_current(catalog) {
        Ok(()) => (
            HealthStatus::Pass,
            "Index snapshots match the active catalog sources.".to_string(),
            None,
            Value::Null,
        ),
        Err(e) => (
            HealthStatus::Fail,
            e.message,
            Some(e.remediation),
            Value::from(e.code.as_str()),
        ),
    };
    let mut metrics = metrics(json!({
        "catalog_version": catalog.version,
        "snapshot_count": catalog.snapshots.len(),
    }));
    if !code.is_null() {
        metrics.insert("code".to_string(), code);
    }

    HealthCheck {
        component: HealthComponent::IndexConsistency,
        status,
        message,
        remediation,
        timestamp: now,
        metrics,
    }
}

fn metrics(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
