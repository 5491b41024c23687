use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context;
use sysinfo::System;
use which::which;

#[derive(Debug, Clone)]
pub struct Host {
    pub os: String,
    pub os_version: String,
    pub cpu_arch: String,
    pub ram_gb: u64,
}

pub fn detect_host() -> Host {
    let mut system = System::new();
    system.refresh_memory();

    let os = normalize_os(std::env::consts::OS);
    let os_version = System::long_os_version()
        .or_else(System::os_version)
        .unwrap_or_else(|| "unknown".to_string());
    let cpu_arch = normalize_arch(std::env::consts::ARCH);
    let ram_gb = system.total_memory() / 1_073_741_824; // bytes to GiB

    Host {
        os,
        os_version,
        cpu_arch,
        ram_gb,
    }
}

impl Host {
    /// Platform segment of release artifact names, e.g. `linux-amd64`.
    ///
    /// Returns `None` for hosts the compute node is not built for.
    pub fn asset_platform(&self) -> Option<String> {
        let os = match self.os.as_str() {
            "linux" | "macos" | "windows" => self.os.as_str(),
            _ => return None,
        };
        let arch = match self.cpu_arch.as_str() {
            "amd64" | "arm64" => self.cpu_arch.as_str(),
            _ => return None,
        };
        Some(format!("{os}-{arch}"))
    }

    pub fn is_windows(&self) -> bool {
        self.os == "windows"
    }
}

fn normalize_os(raw: &str) -> String {
    match raw {
        "macos" | "darwin" => "macos".to_string(),
        other => other.to_lowercase(),
    }
}

fn normalize_arch(raw: &str) -> String {
    match raw {
        "x86_64" | "amd64" => "amd64".to_string(),
        "aarch64" | "arm64" => "arm64".to_string(),
        other => other.to_lowercase(),
    }
}

/// File name of the compute node executable on this platform.
pub fn compute_binary_name() -> &'static str {
    if cfg!(windows) {
        "dkn-compute.exe"
    } else {
        "dkn-compute"
    }
}

/// Directory the launcher keeps its `.env`, binaries and logs in.
///
/// Defaults to the directory holding the launcher executable.
pub fn resolve_working_dir(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(dir) = explicit {
        if dir.is_absolute() {
            return Ok(dir.to_path_buf());
        }
        let cwd = std::env::current_dir().context("resolving working directory")?;
        return Ok(cwd.join(dir));
    }

    let exe = std::env::current_exe().context("locating the launcher executable")?;
    exe.parent()
        .map(Path::to_path_buf)
        .context("launcher executable has no parent directory")
}

pub fn has_command(cmd: &str) -> bool {
    which(cmd).is_ok()
        || Command::new(cmd)
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::{Host, normalize_arch, normalize_os};

    fn host(os: &str, arch: &str) -> Host {
        Host {
            os: normalize_os(os),
            os_version: "test".to_string(),
            cpu_arch: normalize_arch(arch),
            ram_gb: 16,
        }
    }

    #[test]
    fn maps_rust_targets_to_asset_platforms() {
        assert_eq!(
            host("linux", "x86_64").asset_platform().as_deref(),
            Some("linux-amd64")
        );
        assert_eq!(
            host("macos", "aarch64").asset_platform().as_deref(),
            Some("macos-arm64")
        );
        assert_eq!(
            host("windows", "x86_64").asset_platform().as_deref(),
            Some("windows-amd64")
        );
    }

    #[test]
    fn rejects_unbuilt_platforms() {
        assert!(host("freebsd", "x86_64").asset_platform().is_none());
        assert!(host("linux", "riscv64").asset_platform().is_none());
    }

    #[test]
    fn resolves_relative_working_dir_against_cwd() {
        let dir = super::resolve_working_dir(Some(std::path::Path::new("node"))).unwrap();
        assert!(dir.is_absolute());
        assert!(dir.ends_with("node"));
    }
}
