//! Download and extract firmware packages

use std::{
    collections::HashSet,
    fs,
    io,
    path::{Path, PathBuf},
};

use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;

use super::{cache::CachedArchive, PackageCache, PackageDescriptor, PackageSource};
use crate::{ihex, progress::ProgressCallbacks, targets::FlashSize, Error};

/// Extensions of the loose files an extraction leaves behind
const FIRMWARE_EXTENSIONS: &[&str] = &["bin", "hex", "s19", "dfu", "csv"];

const STAGING_DIR: &str = ".extract";

const BOOTLOADER_FILE: &str = "bootloader.bin";
const BOOTER_HEX_FILE: &str = "nanoBooter.hex";
const CLR_HEX_FILE: &str = "nanoCLR.hex";
const CLR_BIN_FILE: &str = "nanoCLR.bin";

/// Options for [PackageFetcher::fetch]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Fall back to the newest cached archive when the download fails
    pub use_existing_if_download_fails: bool,
}

/// Transfers a package archive to the local filesystem
#[allow(async_fn_in_trait)]
pub trait Downloader {
    /// Download `url` into `destination`. Any failure is a
    /// [Error::DownloadFailed].
    async fn download(
        &self,
        url: &str,
        destination: &Path,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error>;
}

/// [Downloader] streaming over HTTP(S)
#[derive(Debug, Clone, Default)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn stream_to(
        &self,
        url: &str,
        partial: &Path,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("server returned {}", response.status()));
        }

        progress.init(response.content_length());

        let mut file = tokio::fs::File::create(partial)
            .await
            .map_err(|e| e.to_string())?;
        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| e.to_string())?;
            file.write_all(&chunk).await.map_err(|e| e.to_string())?;

            downloaded += chunk.len() as u64;
            progress.update(downloaded);
        }

        file.flush().await.map_err(|e| e.to_string())?;
        progress.finish();

        Ok(())
    }
}

impl Downloader for HttpDownloader {
    async fn download(
        &self,
        url: &str,
        destination: &Path,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        let mut partial = destination.as_os_str().to_owned();
        partial.push(".downloading");
        let partial = PathBuf::from(partial);

        debug!("Downloading {url} to {}", partial.display());

        let result = match self.stream_to(url, &partial, progress).await {
            Ok(()) => tokio::fs::rename(&partial, destination)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e),
        };

        result.map_err(|reason| {
            let _ = fs::remove_file(&partial);
            Error::DownloadFailed {
                url: url.to_owned(),
                reason,
            }
        })
    }
}

/// The well-known files of an extracted package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFirmwareSet {
    /// The package that was actually extracted, which differs from the
    /// requested one after a cache fallback
    pub package: PackageDescriptor,
    pub location: PathBuf,
    pub bootloader: Option<PathBuf>,
    pub booter_hex: Option<PathBuf>,
    pub booter_start_address: Option<u32>,
    pub clr_hex: Option<PathBuf>,
    pub clr_bin: Option<PathBuf>,
    pub clr_start_address: Option<u32>,
}

impl ExtractedFirmwareSet {
    /// Locate the well-known files in `location` and recover the load
    /// addresses of the HEX images. Malformed HEX files are rejected here.
    pub fn discover(package: PackageDescriptor, location: PathBuf) -> Result<Self, Error> {
        let existing = |name: &str| Some(location.join(name)).filter(|p| p.is_file());

        let booter_hex = existing(BOOTER_HEX_FILE);
        let clr_hex = existing(CLR_HEX_FILE);

        let booter_start_address = booter_hex.as_deref().map(ihex::start_address).transpose()?;
        let clr_start_address = clr_hex.as_deref().map(ihex::start_address).transpose()?;

        Ok(Self {
            package,
            bootloader: existing(BOOTLOADER_FILE),
            booter_hex,
            booter_start_address,
            clr_hex,
            clr_bin: existing(CLR_BIN_FILE),
            clr_start_address,
            location,
        })
    }

    /// Partition table binary for the given flash size
    pub fn partition_table(&self, flash_size: FlashSize) -> Option<PathBuf> {
        Some(
            self.location
                .join(format!("partitions_{}.bin", flash_size.file_label())),
        )
        .filter(|p| p.is_file())
    }

    /// Partition table source for the given flash size
    pub fn partition_csv(&self, flash_size: FlashSize) -> Option<PathBuf> {
        Some(
            self.location
                .join(format!("partitions_nanoclr_{}.csv", flash_size.file_label())),
        )
        .filter(|p| p.is_file())
    }
}

/// Turns a resolved [PackageDescriptor] into files on disk
pub struct PackageFetcher<'a, D> {
    downloader: &'a D,
    cache: &'a PackageCache,
}

impl<'a, D: Downloader> PackageFetcher<'a, D> {
    pub fn new(downloader: &'a D, cache: &'a PackageCache) -> Self {
        Self { downloader, cache }
    }

    /// Fetch and extract `descriptor`, reusing the cached archive when one
    /// with the same version exists.
    pub async fn fetch(
        &self,
        descriptor: &PackageDescriptor,
        options: FetchOptions,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<ExtractedFirmwareSet, Error> {
        let (package, archive) = match &descriptor.source {
            PackageSource::Remote(url) => {
                let cached = self.obtain(descriptor, url, options, progress).await?;
                let package = if cached.version == descriptor.version.to_string() {
                    descriptor.clone()
                } else {
                    cached.descriptor()?
                };
                (package, cached.path)
            }
            PackageSource::Archive(path) | PackageSource::Cached(path) => {
                (descriptor.clone(), path.clone())
            }
        };

        let location = self.cache.target_dir(&package.name);
        extract(&archive, &location)?;
        info!("Extracted {} to {}", package.archive_file_name(), location.display());

        ExtractedFirmwareSet::discover(package, location)
    }

    async fn obtain(
        &self,
        descriptor: &PackageDescriptor,
        url: &str,
        options: FetchOptions,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<CachedArchive, Error> {
        let version = descriptor.version.to_string();

        if let Some(cached) = self
            .cache
            .find(&descriptor.name, &version, descriptor.is_preview)
        {
            info!("Using cached package {}", cached.path.display());
            return Ok(cached);
        }

        let destination = self
            .cache
            .archive_path(&descriptor.name, &version, descriptor.is_preview);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }

        info!("Downloading {}", descriptor.archive_file_name());

        match self.downloader.download(url, &destination, progress).await {
            Ok(()) => {
                let cached = self
                    .cache
                    .find(&descriptor.name, &version, descriptor.is_preview)
                    .ok_or_else(|| Error::DownloadFailed {
                        url: url.to_owned(),
                        reason: "archive missing after download".into(),
                    })?;

                if let Err(e) = self.cache.prune(&cached) {
                    warn!("Failed to remove old packages: {e}");
                }

                Ok(cached)
            }
            Err(err) if options.use_existing_if_download_fails => {
                let cached = self
                    .cache
                    .newest(&descriptor.name, descriptor.is_preview)
                    .ok_or(err)?;
                warn!(
                    "Download failed, using cached package {}",
                    cached.path.display()
                );
                Ok(cached)
            }
            Err(err) => Err(err),
        }
    }
}

/// Extract `archive` flat into `location`.
///
/// Files are unpacked into a staging directory first; loose firmware files
/// of a previous extraction are only purged once the whole archive has been
/// read successfully.
fn extract(archive: &Path, location: &Path) -> Result<(), Error> {
    if !archive.is_file() {
        return Err(Error::ArchiveNotFound(archive.to_owned()));
    }

    let staging = location.join(STAGING_DIR);
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;

    let result = unpack_flat(archive, &staging).and_then(|files| {
        purge_firmware_files(location)?;
        for file in files {
            fs::rename(staging.join(&file), location.join(&file))?;
        }
        Ok(())
    });

    if let Err(e) = fs::remove_dir_all(&staging) {
        debug!("Failed to remove {}: {e}", staging.display());
    }

    result
}

/// Unpack every file of `archive` into `staging` without its directories.
/// Of several entries with the same file name the last one wins.
fn unpack_flat(archive: &Path, staging: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut zip = zip::ZipArchive::new(fs::File::open(archive)?)?;
    let mut files = Vec::new();
    let mut seen = HashSet::new();

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        if entry.is_dir() {
            continue;
        }

        let Some(file_name) = entry
            .enclosed_name()
            .and_then(|p| p.file_name().map(PathBuf::from))
        else {
            warn!("Skipping archive entry with unsafe path: {}", entry.name());
            continue;
        };

        let mut out = fs::File::create(staging.join(&file_name))?;
        io::copy(&mut entry, &mut out)?;

        if seen.insert(file_name.clone()) {
            files.push(file_name);
        } else {
            warn!(
                "Archive entry {} replaces an earlier {}",
                entry.name(),
                file_name.display()
            );
        }
    }

    Ok(files)
}

fn purge_firmware_files(location: &Path) -> Result<(), Error> {
    for entry in fs::read_dir(location)? {
        let path = entry?.path();

        let is_firmware = path.is_file()
            && path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| FIRMWARE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));

        if is_firmware {
            fs::remove_file(&path)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
        let mut zip = zip::ZipWriter::new(fs::File::create(path).unwrap());
        for (name, contents) in files {
            zip.start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(contents).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn extraction_is_flat_and_purges_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pkg.zip");
        let location = dir.path().join("ESP32_S3");
        fs::create_dir_all(&location).unwrap();

        fs::write(location.join("old.dfu"), b"stale").unwrap();
        fs::write(location.join("notes.txt"), b"keep").unwrap();

        write_zip(
            &archive,
            &[
                ("bootloader.bin", b"boot"),
                ("firmware/nanoCLR.bin", b"clr"),
            ],
        );

        extract(&archive, &location).unwrap();

        assert!(location.join("bootloader.bin").is_file());
        assert!(location.join("nanoCLR.bin").is_file());
        assert!(!location.join("firmware").exists());
        assert!(!location.join("old.dfu").exists());
        assert!(location.join("notes.txt").exists());
        assert!(!location.join(STAGING_DIR).exists());
    }

    #[test]
    fn duplicate_file_names_keep_the_last_entry() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pkg.zip");
        let location = dir.path().join("ST_STM32F769I_DISCOVERY");
        fs::create_dir_all(&location).unwrap();

        write_zip(
            &archive,
            &[
                ("debug/nanoCLR.hex", b"debug"),
                ("release/nanoCLR.hex", b"release"),
                ("nanoBooter.hex", b"booter"),
            ],
        );

        extract(&archive, &location).unwrap();

        assert_eq!(fs::read(location.join("nanoCLR.hex")).unwrap(), b"release");
        assert_eq!(fs::read(location.join("nanoBooter.hex")).unwrap(), b"booter");
        assert!(!location.join(STAGING_DIR).exists());
    }

    #[test]
    fn corrupt_archive_keeps_previous_files() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pkg.zip");
        let location = dir.path().join("ESP32_S3");
        fs::create_dir_all(&location).unwrap();

        fs::write(location.join("nanoCLR.bin"), b"previous").unwrap();
        fs::write(&archive, b"not a zip").unwrap();

        assert!(matches!(
            extract(&archive, &location),
            Err(Error::Extract(_))
        ));
        assert_eq!(fs::read(location.join("nanoCLR.bin")).unwrap(), b"previous");
    }

    #[test]
    fn discover_rejects_malformed_hex() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(BOOTER_HEX_FILE), ":040000050800019955").unwrap();

        let package = PackageDescriptor {
            name: "ST_STM32F769I_DISCOVERY".into(),
            version: semver::Version::new(1, 9, 0),
            source: PackageSource::Cached(dir.path().join("x.zip")),
            published: None,
            is_preview: false,
            is_community: false,
        };

        let err = ExtractedFirmwareSet::discover(package, dir.path().to_owned()).unwrap_err();
        assert!(matches!(err, Error::InvalidHex { .. }));
    }

    #[test]
    fn discover_finds_partition_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("partitions_4mb.bin"), b"").unwrap();
        fs::write(dir.path().join("partitions_nanoclr_4mb.csv"), b"").unwrap();
        fs::write(dir.path().join(CLR_BIN_FILE), b"").unwrap();

        let package = PackageDescriptor {
            name: "ESP32_PSRAM_REV0".into(),
            version: semver::Version::new(1, 9, 0),
            source: PackageSource::Cached(dir.path().join("x.zip")),
            published: None,
            is_preview: false,
            is_community: false,
        };

        let set = ExtractedFirmwareSet::discover(package, dir.path().to_owned()).unwrap();
        assert!(set.clr_bin.is_some());
        assert!(set.clr_hex.is_none());
        assert!(set.partition_table(FlashSize::_4Mb).is_some());
        assert!(set.partition_table(FlashSize::_8Mb).is_none());
        assert!(set.partition_csv(FlashSize::_4Mb).is_some());
    }
}
