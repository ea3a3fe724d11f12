//! Package indexes
//!
//! [HttpIndex] queries a package repository API: every repository answers
//! `GET {base_url}/{repository}/?page=N&page_size=M&query=...` with a JSON
//! array of package records. [ArchiveIndex] lists the `.json` sidecar files
//! of a local archive directory instead.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::{archive_file_name, parse_version, PackageDescriptor, PackageSource};
use crate::{targets::Platform, Error};

/// Remote repository settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    /// Base URL of the package API
    pub base_url: String,
    /// Repository holding stable reference targets
    pub stable_repository: String,
    /// Repository holding preview reference targets
    pub preview_repository: String,
    /// Repository holding community targets
    pub community_repository: String,
    /// Page size used when listing
    pub page_size: u32,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.cloudsmith.io/v1/packages/net-nanoframework".into(),
            stable_repository: "nanoframework-images".into(),
            preview_repository: "nanoframework-images-dev".into(),
            community_repository: "nanoframework-images-community-targets".into(),
            page_size: 100,
        }
    }
}

/// A package as reported by the remote index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub name: String,
    pub version: String,
    #[serde(alias = "cdn_url", alias = "downloadUrl")]
    pub download_url: String,
    #[serde(default, alias = "uploaded_at", alias = "publishDate")]
    pub publish_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: serde_json::Value,
}

impl PackageRecord {
    /// Convert into a descriptor, `None` when the version is not semantic
    pub fn into_descriptor(self, is_preview: bool, is_community: bool) -> Option<PackageDescriptor> {
        let version = match parse_version(&self.version) {
            Ok(version) => version,
            Err(_) => {
                debug!(
                    "Ignoring package {} with unparsable version {}",
                    self.name, self.version
                );
                return None;
            }
        };

        Some(PackageDescriptor {
            name: self.name,
            version,
            source: PackageSource::Remote(self.download_url),
            published: self.publish_date,
            is_preview,
            is_community,
        })
    }
}

/// One query against a repository
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexQuery {
    /// Exact package name
    pub name: Option<String>,
    /// Exact version
    pub version: Option<String>,
    pub page: u32,
    pub page_size: u32,
    /// Only packages uploaded after this date
    pub uploaded_after: Option<DateTime<Utc>>,
}

impl IndexQuery {
    /// Query string understood by the repository search
    pub fn search_expression(&self) -> String {
        let mut terms = Vec::new();

        if let Some(name) = &self.name {
            terms.push(format!("name:^{name}$"));
        }
        if let Some(version) = &self.version {
            terms.push(format!("version:^{version}$"));
        }
        if let Some(date) = &self.uploaded_after {
            terms.push(format!("uploaded:>'{}'", date.format("%Y-%m-%d")));
        }

        terms.join(" ")
    }
}

/// Source of package records
#[allow(async_fn_in_trait)]
pub trait PackageIndex {
    /// Run `query` against `repository`
    async fn query(&self, repository: &str, query: &IndexQuery)
        -> Result<Vec<PackageRecord>, Error>;
}

/// [PackageIndex] backed by the remote package repository API
#[derive(Debug, Clone)]
pub struct HttpIndex {
    client: reqwest::Client,
    base_url: String,
}

impl HttpIndex {
    pub fn new(client: reqwest::Client, settings: &IndexSettings) -> Self {
        Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_owned(),
        }
    }
}

impl PackageIndex for HttpIndex {
    async fn query(
        &self,
        repository: &str,
        query: &IndexQuery,
    ) -> Result<Vec<PackageRecord>, Error> {
        let url = format!("{}/{repository}/", self.base_url);
        let page = query.page.max(1).to_string();
        let page_size = query.page_size.max(1).to_string();
        let expression = query.search_expression();

        debug!("Querying {url} with '{expression}' (page {page})");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("page", page.as_str()),
                ("page_size", page_size.as_str()),
                ("query", expression.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::IndexQuery(e.to_string()))?;

        // past the last page
        if response.status() == reqwest::StatusCode::NOT_FOUND && query.page > 1 {
            return Ok(Vec::new());
        }

        if !response.status().is_success() {
            return Err(Error::IndexQuery(format!(
                "{url} returned {}",
                response.status()
            )));
        }

        response
            .json::<Vec<PackageRecord>>()
            .await
            .map_err(|e| Error::IndexQuery(e.to_string()))
    }
}

/// Sidecar metadata stored next to every archived package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveSidecar {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub platform: Option<Platform>,
    #[serde(default)]
    pub is_preview: bool,
}

/// Local archive directory: one subdirectory per target holding
/// `{target}-{version}[-preview].zip` and a `.json` sidecar per archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveIndex {
    root: PathBuf,
}

impl ArchiveIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the archive for `{target, version, channel}`, present or not
    pub fn archive_path(&self, target: &str, version: &str, preview: bool) -> PathBuf {
        self.root
            .join(target)
            .join(archive_file_name(target, version, preview))
    }

    /// All sidecars below the archive root
    pub fn sidecars(&self) -> Result<Vec<(PathBuf, ArchiveSidecar)>, Error> {
        let mut sidecars = Vec::new();

        for entry in fs::read_dir(&self.root)? {
            let dir = entry?.path();
            if !dir.is_dir() {
                continue;
            }

            for file in fs::read_dir(&dir)? {
                let path = file?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }

                match fs::read_to_string(&path)
                    .map_err(Error::from)
                    .and_then(|s| serde_json::from_str::<ArchiveSidecar>(&s).map_err(Error::from))
                {
                    Ok(sidecar) => sidecars.push((path.with_extension("zip"), sidecar)),
                    Err(e) => warn!("Ignoring unreadable sidecar {}: {e}", path.display()),
                }
            }
        }

        Ok(sidecars)
    }

    /// Descriptors of all archived packages, filtered by platform and channel
    pub fn list(
        &self,
        platform: Option<Platform>,
        preview: bool,
    ) -> Result<Vec<PackageDescriptor>, Error> {
        let mut descriptors = self
            .sidecars()?
            .into_iter()
            .filter(|(_, sidecar)| sidecar.is_preview == preview)
            .filter(|(_, sidecar)| {
                platform.is_none()
                    || sidecar
                        .platform
                        .or_else(|| Platform::from_target_name(&sidecar.name))
                        == platform
            })
            .filter_map(|(path, sidecar)| {
                let version = parse_version(&sidecar.version).ok()?;
                Some(PackageDescriptor {
                    name: sidecar.name,
                    version,
                    source: PackageSource::Archive(path),
                    published: None,
                    is_preview: sidecar.is_preview,
                    is_community: false,
                })
            })
            .collect::<Vec<_>>();

        descriptors.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        Ok(descriptors)
    }
}
