//! Release index lookup.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::version::Version;

/// Errors from release lookup.
#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("release index request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("release index returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("release index lists no published release")]
    NoRelease,

    #[error("neither a version nor a branch could be selected")]
    NothingSelected,
}

/// One published release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub version: Version,
    pub prerelease: bool,
    pub assets: Vec<String>,
}

/// Source of published releases.
#[async_trait]
pub trait ReleaseIndex: Send + Sync {
    /// Latest published (non pre-release) version.
    async fn latest_release(&self) -> Result<Version, ReleaseError>;
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    name: String,
}

/// GitHub releases API of the deployment repository.
///
/// The listing is fetched once per index and cached; build one index per
/// run and share it.
pub struct GithubReleaseIndex {
    client: reqwest::Client,
    url: String,
    releases: OnceCell<Vec<ReleaseInfo>>,
}

impl GithubReleaseIndex {
    pub fn new(url: impl Into<String>) -> Result<Self, ReleaseError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("edgeval/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
            releases: OnceCell::new(),
        })
    }

    /// All releases with a well-formed tag, newest first as served.
    pub async fn releases(&self) -> Result<&[ReleaseInfo], ReleaseError> {
        let releases = self
            .releases
            .get_or_try_init(|| async { self.fetch().await })
            .await?;
        Ok(releases.as_slice())
    }

    async fn fetch(&self) -> Result<Vec<ReleaseInfo>, ReleaseError> {
        debug!(url = %self.url, "Fetching release index");
        let response = self.client.get(&self.url).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ReleaseError::Api { status, body });
        }

        let raw: Vec<GithubRelease> = response.json().await?;
        let releases = raw
            .into_iter()
            .filter(|r| !r.draft)
            .filter_map(|r| match Version::parse(&r.tag_name) {
                Ok(version) => Some(ReleaseInfo {
                    version,
                    prerelease: r.prerelease,
                    assets: r.assets.into_iter().map(|a| a.name).collect(),
                }),
                Err(e) => {
                    warn!(tag = %r.tag_name, error = %e, "Skipping release with unexpected tag");
                    None
                }
            })
            .collect();

        Ok(releases)
    }
}

#[async_trait]
impl ReleaseIndex for GithubReleaseIndex {
    async fn latest_release(&self) -> Result<Version, ReleaseError> {
        self.releases()
            .await?
            .iter()
            .filter(|r| !r.prerelease)
            .map(|r| r.version)
            .max()
            .ok_or(ReleaseError::NoRelease)
    }
}

/// Index answering with a fixed version, for offline runs and tests.
#[derive(Debug, Clone, Default)]
pub struct FixedReleaseIndex {
    latest: Option<Version>,
}

impl FixedReleaseIndex {
    pub fn new(latest: Version) -> Self {
        Self {
            latest: Some(latest),
        }
    }

    /// An index that has no release at all.
    pub fn unavailable() -> Self {
        Self { latest: None }
    }
}

#[async_trait]
impl ReleaseIndex for FixedReleaseIndex {
    async fn latest_release(&self) -> Result<Version, ReleaseError> {
        self.latest.ok_or(ReleaseError::NoRelease)
    }
}
