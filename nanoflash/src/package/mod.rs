//! Firmware packages
//!
//! Packages are zip archives named `{target}-{version}[-preview].zip`. They
//! are found through a remote package index (or a local archive directory),
//! downloaded once into a per-target cache directory and extracted next to
//! it.
//!
//! The pipeline is [resolver::PackageResolver] → [fetcher::PackageFetcher],
//! with [cache::PackageCache] consulted by both. [obtain_firmware] runs the
//! whole pipeline.

use std::{fmt, path::PathBuf};

use chrono::{DateTime, Utc};
use log::warn;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::{progress::ProgressCallbacks, targets::Platform, Error};

pub mod cache;
pub mod fetcher;
pub mod index;
pub mod resolver;

pub use self::{
    cache::{CachedArchive, PackageCache},
    fetcher::{Downloader, ExtractedFirmwareSet, FetchOptions, HttpDownloader, PackageFetcher},
    index::{ArchiveIndex, HttpIndex, IndexQuery, IndexSettings, PackageIndex, PackageRecord},
    resolver::{ListOptions, PackageResolver},
};

/// Firmware release stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Stable,
    Preview,
    Community,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Stable => write!(f, "stable"),
            Channel::Preview => write!(f, "preview"),
            Channel::Community => write!(f, "community"),
        }
    }
}

/// Where the bytes of a package come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSource {
    /// Download URL of a package in a remote repository
    Remote(String),
    /// Zip file in a local archive directory
    Archive(PathBuf),
    /// Zip file already in the download cache
    Cached(PathBuf),
}

/// A single firmware package, as selected by the resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDescriptor {
    pub name: String,
    pub version: Version,
    pub source: PackageSource,
    pub published: Option<DateTime<Utc>>,
    pub is_preview: bool,
    pub is_community: bool,
}

impl PackageDescriptor {
    pub fn channel(&self) -> Channel {
        if self.is_preview {
            Channel::Preview
        } else if self.is_community {
            Channel::Community
        } else {
            Channel::Stable
        }
    }

    /// File name of the package archive
    pub fn archive_file_name(&self) -> String {
        archive_file_name(&self.name, &self.version.to_string(), self.is_preview)
    }
}

/// File name of a package archive for `target` at `version`
pub fn archive_file_name(target: &str, version: &str, preview: bool) -> String {
    if preview {
        format!("{target}-{version}-preview.zip")
    } else {
        format!("{target}-{version}.zip")
    }
}

/// Parse a version string, accepting a leading `v`
pub fn parse_version(version: &str) -> Result<Version, Error> {
    let trimmed = version.trim().trim_start_matches('v');
    Version::parse(trimmed).map_err(|e| Error::InvalidVersion(version.to_owned(), e))
}

/// What package the caller wants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRequest {
    pub target: String,
    /// Exact version, `None` for the latest one
    pub version: Option<Version>,
    pub preview: bool,
    pub platform: Option<Platform>,
}

impl PackageRequest {
    pub fn latest(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            version: None,
            preview: false,
            platform: None,
        }
    }
}

/// Settings shared by the whole package pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSettings {
    /// Root of the download cache
    pub cache_dir: PathBuf,
    /// When set, packages are only taken from this directory
    pub archive_dir: Option<PathBuf>,
    pub index: IndexSettings,
}

/// Resolve, download and extract the firmware for `request`. The returned
/// descriptor is the package that was actually extracted.
///
/// Failing to reach the package repository is only tolerated when
/// `options.use_existing_if_download_fails` is set and a package for the
/// target is already cached.
pub async fn obtain_firmware<I, D>(
    index: &I,
    downloader: &D,
    settings: &PackageSettings,
    request: &PackageRequest,
    options: FetchOptions,
    progress: &mut dyn ProgressCallbacks,
) -> Result<(PackageDescriptor, ExtractedFirmwareSet), Error>
where
    I: PackageIndex,
    D: Downloader,
{
    let cache = PackageCache::new(&settings.cache_dir);
    let resolver = PackageResolver::new(index, settings);
    let fetcher = PackageFetcher::new(downloader, &cache);

    let descriptor = match resolver.resolve(request).await {
        Ok(descriptor) => descriptor,
        Err(err @ Error::IndexQuery(_)) if options.use_existing_if_download_fails => {
            let cached = cache
                .newest(&request.target, request.preview)
                .ok_or(err)?;
            warn!(
                "Package repository unreachable, using cached package {}",
                cached.path.display()
            );
            cached.descriptor()?
        }
        Err(err) => return Err(err),
    };

    let firmware = fetcher.fetch(&descriptor, options, progress).await?;

    Ok((firmware.package.clone(), firmware))
}
