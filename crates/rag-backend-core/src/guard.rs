//! Catalog/index consistency guard.
//!
//! [`ensure_index_current`] is evaluated at the protocol boundary before a
//! query is served (and before certain admin operations), so staleness is
//! reported as a 409 instead of surfacing deep inside retrieval.
//!
//! Checks, in order:
//!
//! 1. `version == 0` or no snapshots → `INDEX_MISSING`
//! 2. duplicate snapshot aliases → `INDEX_STALE`
//! 3. snapshot alias set ≠ active-source alias set → `INDEX_STALE`
//! 4. an active source without a checksum, or whose checksum differs from its
//!    snapshot → `INDEX_STALE`

use std::collections::{HashMap, HashSet};

use crate::error::IndexUnavailable;
use crate::models::SourceCatalog;

pub fn ensure_index_current(catalog: &SourceCatalog) -> Result<(), IndexUnavailable> {
    if catalog.version == 0 || catalog.snapshots.is_empty() {
        return Err(IndexUnavailable::missing());
    }

    let snapshot_aliases: HashSet<&str> =
        catalog.snapshots.iter().map(|s| s.alias.as_str()).collect();
    if snapshot_aliases.len() != catalog.snapshots.len() {
        return Err(IndexUnavailable::stale(
            "Duplicate index snapshots detected for the catalog.",
            "Run ragadmin reindex to rebuild the index with a clean snapshot set.",
        ));
    }

    let active_aliases: HashSet<&str> = catalog.active_sources().map(|s| s.alias.as_str()).collect();
    if snapshot_aliases != active_aliases {
        return Err(IndexUnavailable::stale(
            "Index snapshots do not align with active catalog sources.",
            "Run ragadmin reindex to align the index with the current catalog.",
        ));
    }

    let snapshot_checksums: HashMap<&str, &str> = catalog
        .snapshots
        .iter()
        .map(|s| (s.alias.as_str(), s.checksum.as_str()))
        .collect();

    for source in catalog.active_sources() {
        let Some(checksum) = source.checksum.as_deref() else {
            return Err(IndexUnavailable::stale(
                format!("Source '{}' is active without a recorded checksum.", source.alias),
                "Run ragadmin reindex to validate and snapshot active sources.",
            ));
        };
        if snapshot_checksums.get(source.alias.as_str()) != Some(&checksum) {
            return Err(IndexUnavailable::stale(
                format!("Source '{}' has changed since the last index build.", source.alias),
                "Run ragadmin reindex to rebuild the index with the latest sources.",
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IndexErrorCode;
    use crate::models::{SourceRecord, SourceSnapshot, SourceStatus, SourceType};
    use chrono::Utc;

    fn source(alias: &str, status: SourceStatus, checksum: Option<&str>) -> SourceRecord {
        SourceRecord {
            alias: alias.to_string(),
            source_type: SourceType::Man,
            location: format!("/srv/{}", alias),
            language: "en".to_string(),
            size_bytes: 1,
            last_updated: Utc::now(),
            status,
            checksum: checksum.map(str::to_string),
            notes: None,
        }
    }

    fn current_catalog() -> SourceCatalog {
        SourceCatalog {
            version: 3,
            updated_at: Utc::now(),
            sources: vec![
                source("info-pages", SourceStatus::Active, Some("c2")),
                source("man-pages", SourceStatus::Active, Some("c1")),
                source("old-wiki", SourceStatus::Quarantined, Some("c9")),
            ],
            snapshots: vec![
                SourceSnapshot::new("info-pages", "c2"),
                SourceSnapshot::new("man-pages", "c1"),
            ],
        }
    }

    fn code_of(catalog: &SourceCatalog) -> Option<IndexErrorCode> {
        ensure_index_current(catalog).err().map(|e| e.code)
    }

    #[test]
    fn consistent_catalog_passes() {
        assert_eq!(ensure_index_current(&current_catalog()), Ok(()));
    }

    #[test]
    fn version_zero_is_missing() {
        let mut catalog = current_catalog();
        catalog.version = 0;
        assert_eq!(code_of(&catalog), Some(IndexErrorCode::Missing));
    }

    #[test]
    fn no_snapshots_is_missing() {
        let mut catalog = current_catalog();
        catalog.snapshots.clear();
        let err = ensure_index_current(&catalog).unwrap_err();
        assert_eq!(err.code, IndexErrorCode::Missing);
        assert!(err.remediation.contains("reindex"));
    }

    #[test]
    fn duplicate_snapshot_alias_is_stale() {
        let mut catalog = current_catalog();
        catalog.snapshots.push(SourceSnapshot::new("man-pages", "c1"));
        assert_eq!(code_of(&catalog), Some(IndexErrorCode::Stale));
    }

    #[test]
    fn alias_set_mismatch_is_stale() {
        let mut catalog = current_catalog();
        catalog.sources[2].status = SourceStatus::Active;
        assert_eq!(code_of(&catalog), Some(IndexErrorCode::Stale));
    }

    #[test]
    fn changed_checksum_is_stale() {
        let mut catalog = current_catalog();
        catalog.sources[1].checksum = Some("c1-changed".to_string());
        let err = ensure_index_current(&catalog).unwrap_err();
        assert_eq!(err.code, IndexErrorCode::Stale);
        assert!(err.message.contains("man-pages"));
    }

    #[test]
    fn active_source_without_checksum_is_stale() {
        let mut catalog = current_catalog();
        catalog.sources[0].checksum = None;
        assert_eq!(code_of(&catalog), Some(IndexErrorCode::Stale));
    }

    #[test]
    fn inactive_sources_are_ignored() {
        let mut catalog = current_catalog();
        catalog.sources[2].checksum = None;
        catalog.sources.push(source("pending", SourceStatus::PendingValidation, None));
        assert_eq!(ensure_index_current(&catalog), Ok(()));
    }
}
