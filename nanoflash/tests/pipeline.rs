use std::{
    cell::{Cell, RefCell},
    fs,
    io::Write,
    path::Path,
};

use nanoflash::{
    package::{
        obtain_firmware, Downloader, FetchOptions, IndexQuery, IndexSettings, PackageIndex,
        PackageRecord, PackageRequest, PackageSettings, PackageSource,
    },
    progress::{DefaultProgressCallback, ProgressCallbacks},
    Error, ExitCode,
};
use pretty_assertions::assert_eq;

const BOOTER_HEX: &str = ":020000040800F2\n\
                          :10000000C0FF0120990100089D0100089F01000820\n";
const CLR_HEX: &str = ":020000021000EC\n\
                       :10400000C0FF0120990100089D0100089F010008E0\n";

/// Index answering from a fixed set of records per repository
#[derive(Default)]
struct FakeIndex {
    stable: Vec<PackageRecord>,
    community: Vec<PackageRecord>,
    unreachable: bool,
    queries: RefCell<Vec<(String, IndexQuery)>>,
}

impl PackageIndex for FakeIndex {
    async fn query(
        &self,
        repository: &str,
        query: &IndexQuery,
    ) -> Result<Vec<PackageRecord>, Error> {
        self.queries
            .borrow_mut()
            .push((repository.to_owned(), query.clone()));

        if self.unreachable {
            return Err(Error::IndexQuery("connection refused".into()));
        }

        let settings = IndexSettings::default();
        let records = if repository == settings.stable_repository {
            &self.stable
        } else if repository == settings.community_repository {
            &self.community
        } else {
            return Ok(Vec::new());
        };

        Ok(records
            .iter()
            .filter(|r| query.name.as_ref().is_none_or(|n| &r.name == n))
            .filter(|r| query.version.as_ref().is_none_or(|v| &r.version == v))
            .cloned()
            .collect())
    }
}

/// Downloader writing a prepared archive instead of going to the network
struct FakeDownloader {
    files: Vec<(&'static str, &'static [u8])>,
    fail: bool,
    downloads: Cell<usize>,
}

impl FakeDownloader {
    fn new(files: &[(&'static str, &'static [u8])]) -> Self {
        Self {
            files: files.to_vec(),
            fail: false,
            downloads: Cell::new(0),
        }
    }

    fn failing() -> Self {
        Self {
            files: Vec::new(),
            fail: true,
            downloads: Cell::new(0),
        }
    }
}

impl Downloader for FakeDownloader {
    async fn download(
        &self,
        url: &str,
        destination: &Path,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        self.downloads.set(self.downloads.get() + 1);

        if self.fail {
            return Err(Error::DownloadFailed {
                url: url.to_owned(),
                reason: "server returned 503 Service Unavailable".into(),
            });
        }

        progress.init(None);
        write_zip(destination, &self.files);
        progress.finish();

        Ok(())
    }
}

fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
    let mut zip = zip::ZipWriter::new(fs::File::create(path).unwrap());
    for (name, contents) in files {
        zip.start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(contents).unwrap();
    }
    zip.finish().unwrap();
}

fn record(name: &str, version: &str) -> PackageRecord {
    PackageRecord {
        name: name.into(),
        version: version.into(),
        download_url: format!("https://dl.example.com/{name}-{version}.zip"),
        publish_date: None,
        tags: serde_json::Value::Null,
    }
}

fn settings(cache: &Path) -> PackageSettings {
    PackageSettings {
        cache_dir: cache.to_owned(),
        archive_dir: None,
        index: IndexSettings::default(),
    }
}

#[tokio::test]
async fn newest_stable_package_is_downloaded_once() {
    let cache = tempfile::tempdir().unwrap();
    let settings = settings(cache.path());

    let index = FakeIndex {
        stable: vec![
            record("ESP32_PSRAM_REV0", "1.9.0"),
            record("ESP32_PSRAM_REV0", "1.10.2"),
            record("ESP32_PSRAM_REV0", "1.9.7"),
            record("ESP32_PSRAM_REV3", "1.11.0"),
        ],
        ..Default::default()
    };
    let downloader = FakeDownloader::new(&[
        ("bootloader.bin", b"boot"),
        ("nanoCLR.bin", b"clr"),
        ("partitions_4mb.bin", b"table"),
    ]);
    let request = PackageRequest::latest("ESP32_PSRAM_REV0");

    let (package, first) = obtain_firmware(
        &index,
        &downloader,
        &settings,
        &request,
        FetchOptions::default(),
        &mut DefaultProgressCallback,
    )
    .await
    .unwrap();

    assert_eq!(package.name, "ESP32_PSRAM_REV0");
    assert_eq!(package.version, semver::Version::new(1, 10, 2));
    assert_eq!(downloader.downloads.get(), 1);
    assert_eq!(first.location, cache.path().join("ESP32_PSRAM_REV0"));
    assert!(first.bootloader.is_some());
    assert!(first.clr_bin.is_some());
    assert!(cache
        .path()
        .join("ESP32_PSRAM_REV0")
        .join("ESP32_PSRAM_REV0-1.10.2.zip")
        .is_file());

    let (_, second) = obtain_firmware(
        &index,
        &downloader,
        &settings,
        &request,
        FetchOptions::default(),
        &mut DefaultProgressCallback,
    )
    .await
    .unwrap();

    assert_eq!(downloader.downloads.get(), 1);
    assert_eq!(first, second);
}

#[tokio::test]
async fn stable_miss_falls_back_to_community() {
    let cache = tempfile::tempdir().unwrap();
    let settings = settings(cache.path());

    let index = FakeIndex {
        community: vec![record("ESP32_LILYGO", "1.8.1")],
        ..Default::default()
    };
    let downloader = FakeDownloader::new(&[("nanoCLR.bin", b"clr")]);

    let (package, _) = obtain_firmware(
        &index,
        &downloader,
        &settings,
        &PackageRequest::latest("ESP32_LILYGO"),
        FetchOptions::default(),
        &mut DefaultProgressCallback,
    )
    .await
    .unwrap();

    assert!(package.is_community);

    let repositories = index
        .queries
        .borrow()
        .iter()
        .map(|(r, _)| r.clone())
        .collect::<Vec<_>>();
    let defaults = IndexSettings::default();
    assert_eq!(
        repositories,
        vec![defaults.stable_repository, defaults.community_repository]
    );
}

#[tokio::test]
async fn missing_explicit_version_is_not_found() {
    let cache = tempfile::tempdir().unwrap();
    let settings = settings(cache.path());

    let index = FakeIndex {
        stable: vec![record("ST_STM32F769I_DISCOVERY", "1.9.0")],
        ..Default::default()
    };
    let downloader = FakeDownloader::new(&[]);

    let request = PackageRequest {
        version: Some(semver::Version::new(1, 2, 3)),
        ..PackageRequest::latest("ST_STM32F769I_DISCOVERY")
    };

    let err = obtain_firmware(
        &index,
        &downloader,
        &settings,
        &request,
        FetchOptions::default(),
        &mut DefaultProgressCallback,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::PackageNotFound { .. }));
    assert_eq!(err.exit_code(), ExitCode::E9005);
    assert_eq!(downloader.downloads.get(), 0);
}

#[tokio::test]
async fn hex_load_addresses_are_recovered() {
    let cache = tempfile::tempdir().unwrap();
    let settings = settings(cache.path());

    let index = FakeIndex {
        stable: vec![record("ST_STM32F769I_DISCOVERY", "1.9.0")],
        ..Default::default()
    };
    let downloader = FakeDownloader::new(&[
        ("nanoBooter.hex", BOOTER_HEX.as_bytes()),
        ("nanoCLR.hex", CLR_HEX.as_bytes()),
    ]);

    let (_, firmware) = obtain_firmware(
        &index,
        &downloader,
        &settings,
        &PackageRequest::latest("ST_STM32F769I_DISCOVERY"),
        FetchOptions::default(),
        &mut DefaultProgressCallback,
    )
    .await
    .unwrap();

    assert_eq!(firmware.booter_start_address, Some(0x0800_0000));
    assert_eq!(firmware.clr_start_address, Some(0x0001_4000));
}

#[tokio::test]
async fn malformed_hex_fails_before_flashing() {
    let cache = tempfile::tempdir().unwrap();
    let settings = settings(cache.path());

    let index = FakeIndex {
        stable: vec![record("ST_STM32F769I_DISCOVERY", "1.9.0")],
        ..Default::default()
    };
    // start linear address record first
    let downloader = FakeDownloader::new(&[("nanoCLR.hex", b":040000050800019955\n")]);

    let err = obtain_firmware(
        &index,
        &downloader,
        &settings,
        &PackageRequest::latest("ST_STM32F769I_DISCOVERY"),
        FetchOptions::default(),
        &mut DefaultProgressCallback,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::InvalidHex { .. }));
    assert_eq!(err.exit_code(), ExitCode::E9003);
}

#[tokio::test]
async fn failed_download_can_use_cached_package() {
    let cache = tempfile::tempdir().unwrap();
    let settings = settings(cache.path());

    let target_dir = cache.path().join("ESP32_S3");
    fs::create_dir_all(&target_dir).unwrap();
    write_zip(
        &target_dir.join("ESP32_S3-1.9.0.zip"),
        &[("nanoCLR.bin", b"cached clr")],
    );

    let index = FakeIndex {
        stable: vec![record("ESP32_S3", "1.10.0")],
        ..Default::default()
    };
    let downloader = FakeDownloader::failing();
    let request = PackageRequest::latest("ESP32_S3");

    let err = obtain_firmware(
        &index,
        &downloader,
        &settings,
        &request,
        FetchOptions::default(),
        &mut DefaultProgressCallback,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::DownloadFailed { .. }));

    let options = FetchOptions {
        use_existing_if_download_fails: true,
    };
    let (package, firmware) = obtain_firmware(
        &index,
        &downloader,
        &settings,
        &request,
        options,
        &mut DefaultProgressCallback,
    )
    .await
    .unwrap();

    assert_eq!(package.version, semver::Version::new(1, 9, 0));
    assert!(matches!(package.source, PackageSource::Cached(_)));
    assert_eq!(
        fs::read(firmware.clr_bin.unwrap()).unwrap(),
        b"cached clr".to_vec()
    );
}

#[tokio::test]
async fn unreachable_index_can_use_cached_package() {
    let cache = tempfile::tempdir().unwrap();
    let settings = settings(cache.path());

    let index = FakeIndex {
        unreachable: true,
        ..Default::default()
    };
    let downloader = FakeDownloader::new(&[]);
    let request = PackageRequest::latest("ESP32_S3");

    let err = obtain_firmware(
        &index,
        &downloader,
        &settings,
        &request,
        FetchOptions {
            use_existing_if_download_fails: true,
        },
        &mut DefaultProgressCallback,
    )
    .await
    .unwrap_err();
    assert_eq!(err.exit_code(), ExitCode::E9008);

    let target_dir = cache.path().join("ESP32_S3");
    fs::create_dir_all(&target_dir).unwrap();
    write_zip(
        &target_dir.join("ESP32_S3-1.8.0.zip"),
        &[("nanoCLR.bin", b"clr")],
    );

    let (package, _) = obtain_firmware(
        &index,
        &downloader,
        &settings,
        &request,
        FetchOptions {
            use_existing_if_download_fails: true,
        },
        &mut DefaultProgressCallback,
    )
    .await
    .unwrap();

    assert_eq!(package.version, semver::Version::new(1, 8, 0));
    assert_eq!(downloader.downloads.get(), 0);
}
