//! SHA-256 content checksums and on-disk resolution for source locations.
//!
//! A file hashes its bytes. A directory hashes every regular file below it,
//! visited in sorted relative-path order, feeding the relative path and then
//! the file bytes, so renames change the checksum too.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rag_backend_core::store::{ChecksumCalculator, ResolvedLocation, SourceLocator};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::config::expand_home;

#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Checksums;

impl ChecksumCalculator for Sha256Checksums {
    fn checksum(&self, path: &Path) -> Result<String> {
        let mut hasher = Sha256::new();
        if path.is_file() {
            hash_file(&mut hasher, path)?;
        } else if path.is_dir() {
            for entry in WalkDir::new(path).sort_by_file_name() {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry.path().strip_prefix(path).unwrap_or(entry.path());
                hasher.update(relative.to_string_lossy().as_bytes());
                hasher.update([0u8]);
                hash_file(&mut hasher, entry.path())?;
            }
        } else {
            bail!("source location {} does not exist", path.display());
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

fn hash_file(hasher: &mut Sha256, path: &Path) -> Result<()> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(())
}

/// Size in bytes of a file, or the sum of the regular files under a directory.
pub fn source_size(path: &Path) -> Result<u64> {
    let metadata =
        fs::metadata(path).with_context(|| format!("Failed to stat {}", path.display()))?;
    if metadata.is_file() {
        return Ok(metadata.len());
    }
    let mut total = 0;
    for entry in WalkDir::new(path) {
        let entry = entry?;
        if entry.file_type().is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// Expand `~` and require the location to exist.
pub fn resolve_location(location: &str) -> Result<PathBuf> {
    let path = expand_home(location)?;
    if !path.exists() {
        bail!("source location {} does not exist", path.display());
    }
    Ok(path)
}

/// Resolves locations against the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSourceLocator;

impl SourceLocator for FsSourceLocator {
    fn resolve(&self, location: &str) -> Result<ResolvedLocation> {
        let path = resolve_location(location)?;
        Ok(ResolvedLocation {
            is_file: path.is_file(),
            size_bytes: source_size(&path)?,
            path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn file_checksum_matches_known_digest() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("a.txt");
        fs::write(&file, "abc").unwrap();
        assert_eq!(
            Sha256Checksums.checksum(&file).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(source_size(&file).unwrap(), 3);
    }

    #[test]
    fn directory_checksum_tracks_content_and_names() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("man1")).unwrap();
        fs::write(tmp.path().join("man1/ls.1"), "list").unwrap();
        fs::write(tmp.path().join("intro"), "hello").unwrap();

        let first = Sha256Checksums.checksum(tmp.path()).unwrap();
        assert_eq!(first, Sha256Checksums.checksum(tmp.path()).unwrap());
        assert_eq!(source_size(tmp.path()).unwrap(), 9);

        fs::write(tmp.path().join("man1/ls.1"), "list files").unwrap();
        let edited = Sha256Checksums.checksum(tmp.path()).unwrap();
        assert_ne!(first, edited);

        fs::rename(tmp.path().join("intro"), tmp.path().join("intro2")).unwrap();
        assert_ne!(edited, Sha256Checksums.checksum(tmp.path()).unwrap());
    }

    #[test]
    fn missing_location_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(Sha256Checksums.checksum(&tmp.path().join("nope")).is_err());
        let err = FsSourceLocator
            .resolve(&tmp.path().join("nope").display().to_string())
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn locator_reports_shape_and_size() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("bash.info");
        fs::write(&file, "shell").unwrap();
        let resolved = FsSourceLocator.resolve(&file.display().to_string()).unwrap();
        assert!(resolved.is_file);
        assert_eq!(resolved.size_bytes, 5);

        let dir = FsSourceLocator.resolve(&tmp.path().display().to_string()).unwrap();
        assert!(!dir.is_file);
        assert_eq!(dir.path, tmp.path());
    }
}
