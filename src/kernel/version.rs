//! Running-kernel version resolution.
//!
//! The release string is taken from `/proc/sys/kernel/osrelease` when the
//! file is readable, falling back to `uname -r` through the root shell and
//! finally to the `Linux version <token>` banner in `/proc/version`.
//! Resolution never fails: when nothing usable can be obtained, every field
//! of the result is the literal `"unknown"`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;

use crate::shell::{RootShell, ShellTransport};

/// Comparable keys derived from one kernel release string.
///
/// For `"5.15.123-g1234567-ab123456"`: `full` keeps the whole string,
/// `base` is `"5.15.123"` (up to the first `-`), `major_minor` is `"5.15"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelVersion {
    pub full: String,
    pub base: String,
    pub major_minor: String,
}

impl KernelVersion {
    /// Placeholder value used when no release string can be obtained.
    pub fn unknown() -> Self {
        KernelVersion {
            full: "unknown".to_string(),
            base: "unknown".to_string(),
            major_minor: "unknown".to_string(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.full == "unknown"
    }

    /// Derive `base` and `major_minor` from a raw release string.
    pub fn parse(release: &str) -> Self {
        let release = release.trim();
        if release.is_empty() {
            return KernelVersion::unknown();
        }
        let base = release.split('-').next().unwrap_or(release).to_string();
        let major_minor = base
            .split('.')
            .take(2)
            .collect::<Vec<_>>()
            .join(".");
        KernelVersion {
            full: release.to_string(),
            base,
            major_minor,
        }
    }

    /// Major component only, e.g. `"5"` for `5.15.123`.
    pub fn major(&self) -> Option<&str> {
        self.major_minor.split('.').next().filter(|s| !s.is_empty())
    }
}

impl std::fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full)
    }
}

/// OS version-file access, injectable so tests can supply fixtures.
pub trait SysInfoSource: Send + Sync {
    /// Content of the osrelease file, if readable.
    fn kernel_release(&self) -> Option<String>;
    /// Content of the version banner file, if readable.
    fn version_banner(&self) -> Option<String>;
}

/// Production source reading the real procfs nodes.
pub struct ProcSysInfo;

impl SysInfoSource for ProcSysInfo {
    fn kernel_release(&self) -> Option<String> {
        fs::read_to_string("/proc/sys/kernel/osrelease")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn version_banner(&self) -> Option<String> {
        fs::read_to_string("/proc/version")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

static LINUX_VERSION_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Linux version ([^ ]+)").expect("version banner pattern"));

/// Resolve the running kernel version. Never fails; see module docs for
/// the fallback order.
pub async fn resolve<T: ShellTransport>(
    sys: &dyn SysInfoSource,
    shell: &RootShell<T>,
) -> KernelVersion {
    let release = match sys.kernel_release() {
        Some(rel) if !rel.trim().is_empty() => rel,
        _ => shell.exec("uname -r").await.out.trim().to_string(),
    };

    if !release.trim().is_empty() {
        return KernelVersion::parse(&release);
    }

    if let Some(banner) = sys.version_banner() {
        if let Some(caps) = LINUX_VERSION_TOKEN.captures(&banner) {
            if let Some(token) = caps.get(1) {
                let parsed = KernelVersion::parse(token.as_str());
                if !parsed.is_unknown() {
                    return parsed;
                }
            }
        }
    }

    log::warn!("kernel version could not be resolved from any source");
    KernelVersion::unknown()
}

/// Fixed mapping from a kernel major.minor to the GKI Android release tag
/// used in artifact names.
pub fn android_release_tag(major_minor: &str) -> Option<&'static str> {
    match major_minor {
        "5.4" => Some("android11"),
        "5.10" => Some("android12"),
        "5.15" => Some("android13"),
        "6.1" => Some("android14"),
        "6.6" => Some("android15"),
        _ => None,
    }
}
