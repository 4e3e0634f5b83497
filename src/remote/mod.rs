//! Remote release-manifest lookup for module artifacts.
//!
//! Resolves the `.ko` asset matching the running kernel across a list of
//! hosted release manifests. The manifest supplier is behind the
//! [`ReleaseSource`] trait so the search logic is testable against fixture
//! manifests; [`GitHubReleaseClient`] is the production source.
//!
//! # Search order
//!
//! Releases are scanned newest first; within one release the four filename
//! patterns are tried most-specific first, and the first release/pattern
//! combination that matches wins. A more recent release with only a
//! generic-named asset therefore beats an older release with an exact
//! match. This manifest-outer/pattern-inner order is the documented choice;
//! the inverse nesting would also satisfy the matching contract but could
//! pick differently on adversarial manifest sets.

use std::collections::HashSet;
use std::time::Duration;

use futures::future::BoxFuture;
use regex::Regex;
use serde::Deserialize;
use tokio::time::sleep;

use crate::error::RemoteError;
use crate::kernel::version::{android_release_tag, KernelVersion};

const USER_AGENT: &str = "kmodctl/0.1.0";
const ACCEPT_HEADER: &str = "application/vnd.github.v3+json";
const MAX_FETCH_ATTEMPTS: u32 = 3;
const BACKOFF_UNIT: Duration = Duration::from_millis(800);

/// Default cap for [`list_ko_assets`].
pub const DEFAULT_KO_ASSET_LIMIT: usize = 15;

/// One downloadable file attached to a release.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    #[serde(rename = "browser_download_url")]
    pub download_url: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub sha256: Option<String>,
}

/// One release manifest. The API returns these newest first and the search
/// relies on that order.
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    #[serde(rename = "tag_name")]
    pub tag: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

/// A resolved module artifact, ready for a downloader collaborator.
#[derive(Debug, Clone)]
pub struct ModuleArtifact {
    pub name: String,
    /// Tag of the release the asset came from.
    pub version: String,
    pub download_url: String,
    pub sha256: Option<String>,
    pub size: u64,
    /// Kernel version encoded in the asset filename (last dash segment).
    pub kernel_version: String,
    pub android_tag: Option<String>,
}

/// A `.ko` asset surfaced by the flat listing, tagged with its release.
#[derive(Debug, Clone)]
pub struct KoAsset {
    pub name: String,
    pub download_url: String,
    pub size: u64,
    pub tag: String,
}

/// Supplier of release manifests, newest first.
pub trait ReleaseSource: Send + Sync {
    fn releases(&self) -> BoxFuture<'_, Result<Vec<Release>, RemoteError>>;
}

enum AssetMatcher {
    Exact(String),
    Pattern(Regex),
}

impl AssetMatcher {
    fn matches(&self, asset_name: &str) -> bool {
        match self {
            AssetMatcher::Exact(name) => asset_name == name,
            AssetMatcher::Pattern(re) => re.is_match(asset_name),
        }
    }
}

/// Filename matchers, most-specific first:
///
/// 1. `{name}-{androidTag}-{full}.ko`
/// 2. `{name}-{androidTag}-{majorMinor}[.patch].ko`
/// 3. `{name}-{base}.ko`
/// 4. `{name}-{majorMinor}.ko`
///
/// The android-tagged tiers are present only when the running kernel maps
/// to a known Android release tag.
fn asset_matchers(module_name: &str, kernel: &KernelVersion) -> Vec<AssetMatcher> {
    let mut matchers = Vec::new();
    if let Some(android) = android_release_tag(&kernel.major_minor) {
        matchers.push(AssetMatcher::Exact(format!(
            "{}-{}-{}.ko",
            module_name, android, kernel.full
        )));
        let pattern = format!(
            "^{}-{}-{}(\\.\\d+)?\\.ko$",
            regex::escape(module_name),
            regex::escape(android),
            regex::escape(&kernel.major_minor)
        );
        if let Ok(re) = Regex::new(&pattern) {
            matchers.push(AssetMatcher::Pattern(re));
        }
    }
    matchers.push(AssetMatcher::Exact(format!(
        "{}-{}.ko",
        module_name, kernel.base
    )));
    matchers.push(AssetMatcher::Exact(format!(
        "{}-{}.ko",
        module_name, kernel.major_minor
    )));
    matchers
}

/// Kernel version encoded in an asset filename: the segment after the last
/// dash, with the `.ko` suffix removed. `batt_design_override-android13-5.15.192.ko`
/// yields `5.15.192`.
pub fn extract_kernel_from_asset(asset_name: &str) -> Option<String> {
    let base = asset_name.strip_suffix(".ko")?;
    let last_dash = base.rfind('-')?;
    let segment = &base[last_dash + 1..];
    if segment.is_empty() {
        return None;
    }
    Some(segment.to_string())
}

/// Find the best asset for `module_name` on the running kernel.
///
/// `Ok(None)` means the manifests were fetched but nothing matched;
/// fetch failures propagate as [`RemoteError`].
pub async fn find_asset(
    source: &dyn ReleaseSource,
    module_name: &str,
    kernel: &KernelVersion,
) -> Result<Option<ModuleArtifact>, RemoteError> {
    let releases = source.releases().await?;
    let matchers = asset_matchers(module_name, kernel);
    let android = android_release_tag(&kernel.major_minor).map(str::to_string);

    for release in &releases {
        for matcher in &matchers {
            if let Some(asset) = release.assets.iter().find(|a| matcher.matches(&a.name)) {
                let kernel_version = extract_kernel_from_asset(&asset.name)
                    .unwrap_or_else(|| kernel.major_minor.clone());
                log::info!(
                    "resolved remote artifact {} in release {}",
                    asset.name,
                    release.tag
                );
                return Ok(Some(ModuleArtifact {
                    name: module_name.to_string(),
                    version: release.tag.clone(),
                    download_url: asset.download_url.clone(),
                    sha256: asset.sha256.clone(),
                    size: asset.size,
                    kernel_version,
                    android_tag: android.clone(),
                }));
            }
        }
    }

    log::debug!(
        "no remote artifact for {} on kernel {} across {} releases",
        module_name,
        kernel.major_minor,
        releases.len()
    );
    Ok(None)
}

/// All `.ko` assets across recent releases, newest first, de-duplicated by
/// filename and capped at `limit`.
pub async fn list_ko_assets(
    source: &dyn ReleaseSource,
    limit: usize,
) -> Result<Vec<KoAsset>, RemoteError> {
    let releases = source.releases().await?;
    let mut seen = HashSet::new();
    let mut result = Vec::new();

    'outer: for release in &releases {
        for asset in &release.assets {
            if result.len() >= limit {
                break 'outer;
            }
            if !asset.name.ends_with(".ko") || !seen.insert(asset.name.clone()) {
                continue;
            }
            result.push(KoAsset {
                name: asset.name.clone(),
                download_url: asset.download_url.clone(),
                size: asset.size,
                tag: release.tag.clone(),
            });
        }
    }

    Ok(result)
}

/// Production [`ReleaseSource`] backed by the GitHub releases API.
///
/// The base URL is injectable so tests can point the client at a local
/// mock server.
pub struct GitHubReleaseClient {
    http: reqwest::Client,
    base_url: String,
    owner: String,
    repo: String,
}

impl GitHubReleaseClient {
    pub fn new(owner: &str, repo: &str) -> Self {
        Self::with_base_url("https://api.github.com", owner, repo)
    }

    pub fn with_base_url(base_url: &str, owner: &str, repo: &str) -> Self {
        GitHubReleaseClient {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
        }
    }

    fn releases_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/releases",
            self.base_url, self.owner, self.repo
        )
    }

    /// One fetch attempt. Non-success statuses and transport errors are
    /// transient; a body that fails to decode is not.
    async fn fetch_once(&self) -> Result<Vec<Release>, RemoteError> {
        let response = self
            .http
            .get(self.releases_url())
            .header("User-Agent", USER_AGENT)
            .header("Accept", ACCEPT_HEADER)
            .send()
            .await
            .map_err(|e| RemoteError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Status(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| RemoteError::Http(e.to_string()))?;
        let releases: Vec<Release> = serde_json::from_str(&body)?;
        Ok(releases)
    }

    async fn fetch_with_retry(&self) -> Result<Vec<Release>, RemoteError> {
        let mut last = String::new();
        for attempt in 0..MAX_FETCH_ATTEMPTS {
            match self.fetch_once().await {
                Ok(releases) => return Ok(releases),
                // Decode failures will not improve on retry.
                Err(e @ RemoteError::Decode(_)) => return Err(e),
                Err(e) => {
                    log::warn!("release fetch attempt {} failed: {}", attempt + 1, e);
                    last = e.to_string();
                }
            }
            if attempt + 1 < MAX_FETCH_ATTEMPTS {
                sleep(BACKOFF_UNIT * (attempt + 1)).await;
            }
        }
        Err(RemoteError::Exhausted {
            attempts: MAX_FETCH_ATTEMPTS,
            last,
        })
    }
}

impl ReleaseSource for GitHubReleaseClient {
    fn releases(&self) -> BoxFuture<'_, Result<Vec<Release>, RemoteError>> {
        Box::pin(self.fetch_with_retry())
    }
}
