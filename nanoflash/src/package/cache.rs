//! Local cache of downloaded firmware archives
//!
//! Layout: `{root}/{target}/{target}-{version}[-preview].zip`. The version
//! embedded in the file name is the only thing trusted: a cached archive is
//! reused forever once its version matches.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::SystemTime,
};

use log::{debug, warn};

use super::{archive_file_name, parse_version, PackageDescriptor, PackageSource};
use crate::Error;

const PREVIEW_SUFFIX: &str = "-preview";

/// A package archive present in the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedArchive {
    pub target: String,
    pub version: String,
    pub preview: bool,
    pub path: PathBuf,
    pub last_write: Option<SystemTime>,
}

impl CachedArchive {
    fn from_path(target: &str, path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?;
        let stem = file_name.strip_suffix(".zip")?;
        let rest = stem.strip_prefix(target)?.strip_prefix('-')?;

        let (version, preview) = match rest.strip_suffix(PREVIEW_SUFFIX) {
            Some(version) => (version, true),
            None => (rest, false),
        };

        if !version.starts_with(|c: char| c.is_ascii_digit()) {
            return None;
        }

        Some(Self {
            target: target.to_owned(),
            version: version.to_owned(),
            preview,
            path: path.to_owned(),
            last_write: fs::metadata(path).and_then(|m| m.modified()).ok(),
        })
    }

    /// Descriptor pointing at this cached archive
    pub fn descriptor(&self) -> Result<PackageDescriptor, Error> {
        Ok(PackageDescriptor {
            name: self.target.clone(),
            version: parse_version(&self.version)?,
            source: PackageSource::Cached(self.path.clone()),
            published: None,
            is_preview: self.preview,
            is_community: false,
        })
    }
}

/// Download cache rooted at a configurable directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageCache {
    root: PathBuf,
}

impl PackageCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the archives and the extracted files of `target`
    pub fn target_dir(&self, target: &str) -> PathBuf {
        self.root.join(target)
    }

    /// Where the archive of `target` at `version` lives, present or not
    pub fn archive_path(&self, target: &str, version: &str, preview: bool) -> PathBuf {
        self.target_dir(target)
            .join(archive_file_name(target, version, preview))
    }

    /// Exact cache hit for `{target, version, channel}`
    pub fn find(&self, target: &str, version: &str, preview: bool) -> Option<CachedArchive> {
        let path = self.archive_path(target, version, preview);

        if path.is_file() {
            CachedArchive::from_path(target, &path)
        } else {
            None
        }
    }

    /// All cached archives of `target` on the given channel
    pub fn archives(&self, target: &str, preview: bool) -> Vec<CachedArchive> {
        let Ok(entries) = fs::read_dir(self.target_dir(target)) else {
            return Vec::new();
        };

        let mut archives = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|e| CachedArchive::from_path(target, &e.path()))
            .filter(|a| a.preview == preview)
            .collect::<Vec<_>>();

        archives.sort_by_cached_key(|a| parse_version(&a.version).ok());
        archives
    }

    /// Newest cached archive of `target`, judged by the version in its name
    pub fn newest(&self, target: &str, preview: bool) -> Option<CachedArchive> {
        self.archives(target, preview).pop()
    }

    /// Delete the archives of the same target and channel that are older
    /// than `keep`, returning the number of files removed. Newer archives
    /// stay, so fetching an older version never drops the newest one.
    pub fn prune(&self, keep: &CachedArchive) -> Result<usize, Error> {
        let keep_version = parse_version(&keep.version)?;
        let mut removed = 0;

        for archive in self.archives(&keep.target, keep.preview) {
            let older = parse_version(&archive.version).is_ok_and(|v| v < keep_version);

            if older && archive.path != keep.path {
                debug!("Removing old package {}", archive.path.display());
                fs::remove_file(&archive.path)?;
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Remove everything below the cache root. Entries that can't be removed
    /// are skipped with a warning.
    pub fn clear(&self) -> Result<(), Error> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };

            if let Err(e) = removed {
                warn!("Failed to remove {}: {e}", path.display());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"zip").unwrap();
    }

    #[test]
    fn finds_exact_matches_only() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PackageCache::new(dir.path());

        touch(&cache.archive_path("ESP32_S3", "1.9.0", false));

        assert!(cache.find("ESP32_S3", "1.9.0", false).is_some());
        assert!(cache.find("ESP32_S3", "1.9.0", true).is_none());
        assert!(cache.find("ESP32_S3", "1.9.1", false).is_none());
        assert!(cache.find("ESP32_S3_ALL", "1.9.0", false).is_none());
    }

    #[test]
    fn newest_respects_channel() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PackageCache::new(dir.path());

        touch(&cache.archive_path("ESP32_REV0", "1.8.0", false));
        touch(&cache.archive_path("ESP32_REV0", "1.9.0", false));
        touch(&cache.archive_path("ESP32_REV0", "1.10.0-preview.4", true));

        let newest = cache.newest("ESP32_REV0", false).unwrap();
        assert_eq!(newest.version, "1.9.0");
        assert!(!newest.preview);

        let newest = cache.newest("ESP32_REV0", true).unwrap();
        assert_eq!(newest.version, "1.10.0-preview.4");
        assert!(newest.preview);
    }

    #[test]
    fn prune_keeps_other_channel() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PackageCache::new(dir.path());

        touch(&cache.archive_path("ST_STM32F769I_DISCOVERY", "1.8.0", false));
        touch(&cache.archive_path("ST_STM32F769I_DISCOVERY", "1.9.0", false));
        touch(&cache.archive_path("ST_STM32F769I_DISCOVERY", "1.9.0", true));

        let keep = cache.find("ST_STM32F769I_DISCOVERY", "1.9.0", false).unwrap();
        assert_eq!(cache.prune(&keep).unwrap(), 1);

        assert!(cache.find("ST_STM32F769I_DISCOVERY", "1.8.0", false).is_none());
        assert!(cache.find("ST_STM32F769I_DISCOVERY", "1.9.0", false).is_some());
        assert!(cache.find("ST_STM32F769I_DISCOVERY", "1.9.0", true).is_some());
    }

    #[test]
    fn prune_keeps_newer_archives() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PackageCache::new(dir.path());

        touch(&cache.archive_path("ESP32_S3", "1.7.2", false));
        touch(&cache.archive_path("ESP32_S3", "1.8.0", false));
        touch(&cache.archive_path("ESP32_S3", "1.9.0", false));

        let keep = cache.find("ESP32_S3", "1.8.0", false).unwrap();
        assert_eq!(cache.prune(&keep).unwrap(), 1);

        assert!(cache.find("ESP32_S3", "1.7.2", false).is_none());
        assert!(cache.find("ESP32_S3", "1.8.0", false).is_some());
        assert!(cache.find("ESP32_S3", "1.9.0", false).is_some());
        assert_eq!(cache.newest("ESP32_S3", false).unwrap().version, "1.9.0");
    }

    #[test]
    fn versions_compare_numerically() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PackageCache::new(dir.path());

        touch(&cache.archive_path("ESP32_S3", "1.9.0", false));
        touch(&cache.archive_path("ESP32_S3", "1.10.0", false));

        assert_eq!(cache.newest("ESP32_S3", false).unwrap().version, "1.10.0");
    }

    #[test]
    fn clear_removes_every_target() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PackageCache::new(dir.path().join("cache"));

        touch(&cache.archive_path("ESP32_S3", "1.9.0", false));
        touch(&cache.target_dir("ESP32_S3").join("nanoCLR.bin"));
        touch(&cache.archive_path("ST_STM32F769I_DISCOVERY", "1.9.0", false));

        cache.clear().unwrap();
        assert_eq!(fs::read_dir(cache.root()).unwrap().count(), 0);

        // nothing to clear
        PackageCache::new(dir.path().join("missing")).clear().unwrap();
    }
}
