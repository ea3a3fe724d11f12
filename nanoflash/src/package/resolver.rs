//! Select exactly one package for a target

use chrono::{Duration, Utc};
use log::{debug, info, warn};

use super::{
    index::{ArchiveIndex, IndexQuery, PackageIndex},
    PackageDescriptor, PackageRequest, PackageSettings, PackageSource,
};
use crate::{targets::Platform, Error};

/// Packages older than this get a staleness warning
const STALE_AFTER_DAYS: i64 = 60;

/// Options for listing every available package
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub platform: Option<Platform>,
    pub preview: bool,
    pub community: bool,
    pub uploaded_after: Option<chrono::DateTime<Utc>>,
}

pub struct PackageResolver<'a, I> {
    index: &'a I,
    settings: &'a PackageSettings,
}

impl<'a, I: PackageIndex> PackageResolver<'a, I> {
    pub fn new(index: &'a I, settings: &'a PackageSettings) -> Self {
        Self { index, settings }
    }

    /// Pick the package matching `request`.
    ///
    /// With an archive directory configured the network is never touched and
    /// the archive must hold the exact package. Otherwise the reference
    /// repository of the channel is queried, falling back to the community
    /// repository for stable requests.
    pub async fn resolve(&self, request: &PackageRequest) -> Result<PackageDescriptor, Error> {
        let descriptor = match &self.settings.archive_dir {
            Some(dir) => self.resolve_archived(&ArchiveIndex::new(dir), request)?,
            None => self.resolve_remote(request).await?,
        };

        if descriptor.name != request.target {
            return Err(Error::PackageNameMismatch {
                requested: request.target.clone(),
                found: descriptor.name,
            });
        }

        if let Some(published) = descriptor.published {
            if Utc::now() - published > Duration::days(STALE_AFTER_DAYS) {
                warn!(
                    "Package {} {} was published on {}, the index entry may be stale",
                    descriptor.name,
                    descriptor.version,
                    published.format("%Y-%m-%d")
                );
            }
        }

        info!(
            "Selected {} {} ({})",
            descriptor.name,
            descriptor.version,
            descriptor.channel()
        );

        Ok(descriptor)
    }

    fn resolve_archived(
        &self,
        archive: &ArchiveIndex,
        request: &PackageRequest,
    ) -> Result<PackageDescriptor, Error> {
        match &request.version {
            Some(version) => {
                let path =
                    archive.archive_path(&request.target, &version.to_string(), request.preview);

                if !path.is_file() {
                    return Err(Error::ArchiveNotFound(path));
                }

                Ok(PackageDescriptor {
                    name: request.target.clone(),
                    version: version.clone(),
                    source: PackageSource::Archive(path),
                    published: None,
                    is_preview: request.preview,
                    is_community: false,
                })
            }
            None => archive
                .list(None, request.preview)?
                .into_iter()
                .filter(|d| d.name == request.target)
                .filter(|d| matches!(&d.source, PackageSource::Archive(p) if p.is_file()))
                .max_by(|a, b| a.version.cmp(&b.version))
                .ok_or_else(|| Error::PackageNotFound {
                    target: request.target.clone(),
                    version: None,
                }),
        }
    }

    async fn resolve_remote(&self, request: &PackageRequest) -> Result<PackageDescriptor, Error> {
        let index = &self.settings.index;
        let query = IndexQuery {
            name: Some(request.target.clone()),
            version: request.version.as_ref().map(ToString::to_string),
            page: 1,
            page_size: index.page_size,
            uploaded_after: None,
        };

        let repository = if request.preview {
            &index.preview_repository
        } else {
            &index.stable_repository
        };

        let mut is_community = false;
        let mut records = self.index.query(repository, &query).await?;

        if records.is_empty() && !request.preview {
            debug!(
                "{} not found in {repository}, trying {}",
                request.target, index.community_repository
            );
            records = self
                .index
                .query(&index.community_repository, &query)
                .await?;
            is_community = true;
        }

        let candidates = records
            .into_iter()
            .filter_map(|r| r.into_descriptor(request.preview, is_community))
            .collect::<Vec<_>>();

        let selected = match &request.version {
            Some(version) => candidates.into_iter().find(|d| &d.version == version),
            // ties keep the repository's own ordering
            None => candidates
                .into_iter()
                .rev()
                .max_by(|a, b| a.version.cmp(&b.version)),
        };

        selected.ok_or_else(|| Error::PackageNotFound {
            target: request.target.clone(),
            version: request.version.as_ref().map(ToString::to_string),
        })
    }

    /// Every package available for the given filters. Remote repositories
    /// are paged through until a short page comes back.
    pub async fn list(&self, options: ListOptions) -> Result<Vec<PackageDescriptor>, Error> {
        if let Some(dir) = &self.settings.archive_dir {
            return ArchiveIndex::new(dir).list(options.platform, options.preview);
        }

        let index = &self.settings.index;
        let repository = match (options.preview, options.community) {
            (_, true) => &index.community_repository,
            (true, false) => &index.preview_repository,
            (false, false) => &index.stable_repository,
        };

        let mut descriptors = Vec::new();
        let mut page = 1;

        loop {
            let query = IndexQuery {
                name: None,
                version: None,
                page,
                page_size: index.page_size,
                uploaded_after: options.uploaded_after,
            };

            let records = self.index.query(repository, &query).await?;
            let count = records.len();

            descriptors.extend(
                records
                    .into_iter()
                    .filter_map(|r| r.into_descriptor(options.preview, options.community))
                    .filter(|d| {
                        options.platform.is_none()
                            || Platform::from_target_name(&d.name) == options.platform
                    }),
            );

            if count < index.page_size as usize {
                break;
            }
            page += 1;
        }

        Ok(descriptors)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::HashMap, path::PathBuf};

    use super::*;
    use crate::package::{index::PackageRecord, IndexSettings};

    #[derive(Default)]
    struct FakeIndex {
        repositories: HashMap<String, Vec<PackageRecord>>,
        queries: RefCell<Vec<String>>,
    }

    impl FakeIndex {
        fn with(mut self, repository: &str, name: &str, version: &str) -> Self {
            self.repositories
                .entry(repository.to_owned())
                .or_default()
                .push(PackageRecord {
                    name: name.to_owned(),
                    version: version.to_owned(),
                    download_url: format!("https://dl.example.com/{name}-{version}.zip"),
                    publish_date: Some(Utc::now()),
                    tags: serde_json::Value::Null,
                });
            self
        }
    }

    impl PackageIndex for FakeIndex {
        async fn query(
            &self,
            repository: &str,
            query: &IndexQuery,
        ) -> Result<Vec<PackageRecord>, Error> {
            self.queries.borrow_mut().push(repository.to_owned());

            Ok(self
                .repositories
                .get(repository)
                .into_iter()
                .flatten()
                .filter(|r| query.name.as_ref().map_or(true, |n| r.name.contains(n.as_str())))
                .filter(|r| {
                    query
                        .version
                        .as_ref()
                        .map_or(true, |v| r.version.contains(v.as_str()))
                })
                .cloned()
                .collect())
        }
    }

    fn settings() -> PackageSettings {
        PackageSettings {
            cache_dir: PathBuf::from("/tmp/unused"),
            archive_dir: None,
            index: IndexSettings::default(),
        }
    }

    #[tokio::test]
    async fn latest_picks_newest_version() {
        let index = FakeIndex::default()
            .with("nanoframework-images", "ESP32_PSRAM_REV0", "1.8.1")
            .with("nanoframework-images", "ESP32_PSRAM_REV0", "1.10.0")
            .with("nanoframework-images", "ESP32_PSRAM_REV0", "1.9.2");
        let settings = settings();
        let resolver = PackageResolver::new(&index, &settings);

        let request = PackageRequest::latest("ESP32_PSRAM_REV0");
        let first = resolver.resolve(&request).await.unwrap();
        let second = resolver.resolve(&request).await.unwrap();

        assert_eq!(first.version.to_string(), "1.10.0");
        assert_eq!(first, second);
        assert!(!first.is_community);
    }

    #[tokio::test]
    async fn explicit_version_never_falls_back_to_latest() {
        let index = FakeIndex::default()
            .with("nanoframework-images", "ESP32_PSRAM_REV0", "1.9.2");
        let settings = settings();
        let resolver = PackageResolver::new(&index, &settings);

        let mut request = PackageRequest::latest("ESP32_PSRAM_REV0");
        request.version = Some(semver::Version::new(1, 7, 0));

        let err = resolver.resolve(&request).await.unwrap_err();
        assert!(matches!(err, Error::PackageNotFound { .. }));
    }

    #[tokio::test]
    async fn falls_back_to_community_repository() {
        let index = FakeIndex::default().with(
            "nanoframework-images-community-targets",
            "ESP32_LILYGO",
            "1.9.0",
        );
        let settings = settings();
        let resolver = PackageResolver::new(&index, &settings);

        let descriptor = resolver
            .resolve(&PackageRequest::latest("ESP32_LILYGO"))
            .await
            .unwrap();
        assert!(descriptor.is_community);

        // preview requests never look at community targets
        let mut request = PackageRequest::latest("ESP32_LILYGO");
        request.preview = true;
        assert!(resolver.resolve(&request).await.is_err());
        assert_eq!(
            index.queries.borrow().last().unwrap(),
            "nanoframework-images-dev"
        );
    }

    #[tokio::test]
    async fn rejects_mismatched_name() {
        // the fake index matches on substrings, like a corrupted index would
        let index = FakeIndex::default().with("nanoframework-images", "ESP32_S3_ALL", "1.9.0");
        let settings = settings();
        let resolver = PackageResolver::new(&index, &settings);

        let err = resolver
            .resolve(&PackageRequest::latest("ESP32_S3"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PackageNameMismatch { .. }));
    }

    #[tokio::test]
    async fn archive_mode_requires_exact_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings();
        settings.archive_dir = Some(dir.path().to_owned());

        let index = FakeIndex::default().with("nanoframework-images", "ESP32_S3", "1.9.0");
        let resolver = PackageResolver::new(&index, &settings);

        let mut request = PackageRequest::latest("ESP32_S3");
        request.version = Some(semver::Version::new(1, 9, 0));

        let err = resolver.resolve(&request).await.unwrap_err();
        assert!(matches!(err, Error::ArchiveNotFound(_)));
        assert!(index.queries.borrow().is_empty());

        let archive = ArchiveIndex::new(dir.path());
        let path = archive.archive_path("ESP32_S3", "1.9.0", false);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"").unwrap();

        let descriptor = resolver.resolve(&request).await.unwrap();
        assert_eq!(descriptor.source, PackageSource::Archive(path));
    }

    #[tokio::test]
    async fn list_pages_through_index() {
        let mut index = FakeIndex::default();
        for patch in 0..5 {
            index = index.with("nanoframework-images", "ESP32_S3", &format!("1.9.{patch}"));
        }
        index = index.with("nanoframework-images", "ST_STM32F769I_DISCOVERY", "1.9.0");

        let mut settings = settings();
        settings.index.page_size = 100;
        let resolver = PackageResolver::new(&index, &settings);

        let all = resolver.list(ListOptions::default()).await.unwrap();
        assert_eq!(all.len(), 6);

        let esp32 = resolver
            .list(ListOptions {
                platform: Some(Platform::Esp32),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(esp32.len(), 5);
    }
}
