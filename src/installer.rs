use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::env_detect::Host;
use crate::releases::{Channel, ReleaseError, ResolveTag};
use crate::supervisor::ReleaseFeed;

pub const COMPUTE_DOWNLOAD_BASE: &str =
    "https://github.com/firstbatchxyz/dkn-compute-node/releases/download";

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("requesting {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("download from {url} failed with status {status}")]
    Status { url: String, status: u16 },
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl DownloadError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DownloadError::Status { status: 404, .. })
    }
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("no compute node build for {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error("resolving fallback version: {0}")]
    Fallback(#[source] ReleaseError),
    #[error("setting execute permission on {path}: {source}")]
    Permissions {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Fetches a URL into a file.
pub trait Downloader {
    fn download(&self, url: &str, dest: &Path) -> Result<(), DownloadError>;
}

#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::blocking::Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self, ReleaseError> {
        // No overall timeout: binaries are large and links can be slow.
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("dkn-compute-launcher/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .timeout(None)
            .build()
            .map_err(ReleaseError::Client)?;
        Ok(Self { client })
    }
}

impl Downloader for HttpDownloader {
    fn download(&self, url: &str, dest: &Path) -> Result<(), DownloadError> {
        let request_err = |source| DownloadError::Request {
            url: url.to_string(),
            source,
        };
        let mut response = self.client.get(url).send().map_err(request_err)?;
        if !response.status().is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let write_err = |source| DownloadError::Write {
            path: dest.to_path_buf(),
            source,
        };
        let mut file = File::create(dest).map_err(write_err)?;
        if let Err(source) = response.copy_to(&mut file) {
            drop(file);
            let _ = fs::remove_file(dest);
            return Err(request_err(source));
        }
        file.sync_all().map_err(write_err)?;
        Ok(())
    }
}

/// Whether to grant execute permission right after downloading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permissions {
    Executable,
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installed {
    pub version: String,
    pub path: PathBuf,
}

/// Downloads compute node builds for one host platform.
#[derive(Debug, Clone)]
pub struct Installer<D, R> {
    downloader: D,
    resolver: R,
    platform: String,
    windows: bool,
    download_base: String,
}

impl<D: Downloader, R: ResolveTag> Installer<D, R> {
    pub fn for_host(host: &Host, downloader: D, resolver: R) -> Result<Self, InstallError> {
        let platform = host
            .asset_platform()
            .ok_or_else(|| InstallError::UnsupportedPlatform {
                os: host.os.clone(),
                arch: host.cpu_arch.clone(),
            })?;
        Ok(Self {
            downloader,
            resolver,
            platform,
            windows: host.is_windows(),
            download_base: COMPUTE_DOWNLOAD_BASE.to_string(),
        })
    }

    pub fn with_download_base(mut self, base: impl Into<String>) -> Self {
        self.download_base = base.into();
        self
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    pub fn asset_name(&self) -> String {
        let extension = if self.windows { ".exe" } else { "" };
        format!("dkn-compute-binary-{}{extension}", self.platform)
    }

    pub fn asset_url(&self, version: &str) -> String {
        format!("{}/{version}/{}", self.download_base, self.asset_name())
    }

    /// Downloads `version` to `dest`. A 404 means the release exists but its
    /// binaries are still building, so the previous stable version is
    /// installed instead; the returned version is the one on disk.
    pub fn install(
        &self,
        version: &str,
        dest: &Path,
        permissions: Permissions,
    ) -> Result<Installed, InstallError> {
        let installed_version = match self.downloader.download(&self.asset_url(version), dest) {
            Ok(()) => version.to_string(),
            Err(err) if err.is_not_found() => {
                warn!(%version, "compute node binaries are not built yet, falling back");
                println!(
                    "Warning: The latest compute binaries are currently being built. Downloading the previous version. You can restart the launcher in ~20 minutes to run the latest version."
                );
                let previous = self
                    .resolver
                    .resolve(Channel::PreviousStable)
                    .map_err(InstallError::Fallback)?;
                self.downloader
                    .download(&self.asset_url(&previous), dest)?;
                previous
            }
            Err(err) => return Err(err.into()),
        };

        if permissions == Permissions::Executable {
            make_executable(dest)?;
        }

        info!(version = %installed_version, path = %dest.display(), "installed compute node");
        Ok(Installed {
            version: installed_version,
            path: dest.to_path_buf(),
        })
    }
}

#[cfg(unix)]
pub fn make_executable(path: &Path) -> Result<(), InstallError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(|source| {
        InstallError::Permissions {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
pub fn make_executable(_path: &Path) -> Result<(), InstallError> {
    Ok(())
}

/// Update source for the supervisor: newest tag on one channel, installed
/// through an [`Installer`].
#[derive(Debug, Clone)]
pub struct ChannelFeed<D, R> {
    installer: Installer<D, R>,
    channel: Channel,
}

impl<D, R> ChannelFeed<D, R> {
    pub fn new(installer: Installer<D, R>, channel: Channel) -> Self {
        Self { installer, channel }
    }
}

impl<D: Downloader, R: ResolveTag> ReleaseFeed for ChannelFeed<D, R> {
    fn newest_version(&self) -> anyhow::Result<String> {
        Ok(self.installer.resolver().resolve(self.channel)?)
    }

    fn download(&self, version: &str, dest: &Path) -> anyhow::Result<String> {
        let installed = self.installer.install(version, dest, Permissions::Deferred)?;
        Ok(installed.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct FakeDownloader {
        missing: Vec<String>,
        requested: RefCell<Vec<String>>,
    }

    impl FakeDownloader {
        fn missing(versions: &[&str]) -> Self {
            Self {
                missing: versions.iter().map(|v| v.to_string()).collect(),
                requested: RefCell::new(Vec::new()),
            }
        }
    }

    impl Downloader for FakeDownloader {
        fn download(&self, url: &str, dest: &Path) -> Result<(), DownloadError> {
            self.requested.borrow_mut().push(url.to_string());
            if self.missing.iter().any(|v| url.contains(&format!("/{v}/"))) {
                return Err(DownloadError::Status {
                    url: url.to_string(),
                    status: 404,
                });
            }
            if url.contains("/broken/") {
                return Err(DownloadError::Status {
                    url: url.to_string(),
                    status: 500,
                });
            }
            fs::write(dest, url).map_err(|source| DownloadError::Write {
                path: dest.to_path_buf(),
                source,
            })
        }
    }

    struct FixedTags(&'static str);

    impl ResolveTag for FixedTags {
        fn resolve(&self, channel: Channel) -> Result<String, ReleaseError> {
            match channel {
                Channel::PreviousStable => Ok(self.0.to_string()),
                other => Err(ReleaseError::NoTagsFound(other)),
            }
        }
    }

    fn linux_host() -> Host {
        Host {
            os: "linux".to_string(),
            os_version: "test".to_string(),
            cpu_arch: "amd64".to_string(),
            ram_gb: 8,
        }
    }

    fn installer(missing: &[&str]) -> Installer<FakeDownloader, FixedTags> {
        Installer::for_host(&linux_host(), FakeDownloader::missing(missing), FixedTags("v1.9.0"))
            .unwrap()
            .with_download_base("https://example.test/download")
    }

    #[test]
    fn builds_platform_asset_urls() {
        let installer = installer(&[]);
        assert_eq!(installer.asset_name(), "dkn-compute-binary-linux-amd64");
        assert_eq!(
            installer.asset_url("v0.2.5"),
            "https://example.test/download/v0.2.5/dkn-compute-binary-linux-amd64"
        );

        let mut windows = linux_host();
        windows.os = "windows".to_string();
        let installer =
            Installer::for_host(&windows, FakeDownloader::missing(&[]), FixedTags("v1")).unwrap();
        assert_eq!(installer.asset_name(), "dkn-compute-binary-windows-amd64.exe");
    }

    #[test]
    fn falls_back_to_previous_stable_on_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("dkn-compute");
        let installer = installer(&["v2.0.0"]);

        let installed = installer
            .install("v2.0.0", &dest, Permissions::Executable)
            .unwrap();

        assert_eq!(installed.version, "v1.9.0");
        assert_eq!(installed.path, dest);
        assert_eq!(installer.downloader.requested.borrow().len(), 2);
        assert!(fs::read_to_string(&dest).unwrap().contains("/v1.9.0/"));
    }

    #[test]
    fn fallback_that_also_fails_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let installer = installer(&["v2.0.0", "v1.9.0"]);

        let err = installer
            .install("v2.0.0", &dir.path().join("bin"), Permissions::Executable)
            .unwrap_err();
        assert!(matches!(err, InstallError::Download(ref e) if e.is_not_found()));
    }

    #[test]
    fn other_statuses_do_not_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let installer = installer(&[]);

        let err = installer
            .install("broken", &dir.path().join("bin"), Permissions::Executable)
            .unwrap_err();
        assert!(matches!(err, InstallError::Download(DownloadError::Status { status: 500, .. })));
        assert_eq!(installer.downloader.requested.borrow().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn permissions_follow_install_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let installer = installer(&[]);

        let exec = dir.path().join("exec");
        installer.install("v1", &exec, Permissions::Executable).unwrap();
        let mode = fs::metadata(&exec).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);

        let deferred = dir.path().join("deferred");
        installer.install("v1", &deferred, Permissions::Deferred).unwrap();
        let mode = fs::metadata(&deferred).unwrap().permissions().mode();
        assert_eq!(mode & 0o100, 0);
    }

    #[test]
    fn rejects_unsupported_hosts() {
        let mut host = linux_host();
        host.cpu_arch = "riscv64".to_string();
        let result = Installer::for_host(&host, FakeDownloader::missing(&[]), FixedTags("v1"));
        assert!(matches!(result, Err(InstallError::UnsupportedPlatform { .. })));
    }
}
