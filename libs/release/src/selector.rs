//! Release selection.

use tracing::{debug, info};

use crate::index::{ReleaseError, ReleaseIndex};
use crate::version::Version;
use crate::{DEV_ORGANIZATION, RELEASE_ORGANIZATION};

/// What the caller asked to deploy.
///
/// Empty strings and the literal `None` (as produced by some job runners for
/// unset parameters) count as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseSelector {
    version: Option<Version>,
    engine_branch: Option<String>,
    deployment_branch: Option<String>,
}

impl ReleaseSelector {
    /// Select the latest published release.
    pub fn latest() -> Self {
        Self::default()
    }

    /// Pin a published release.
    pub fn version(version: Version) -> Self {
        Self {
            version: Some(version),
            ..Self::default()
        }
    }

    /// Build from raw run parameters.
    pub fn from_parts(
        version: Option<Version>,
        engine_branch: Option<&str>,
        deployment_branch: Option<&str>,
    ) -> Self {
        Self {
            version,
            engine_branch: normalize(engine_branch),
            deployment_branch: normalize(deployment_branch),
        }
    }

    /// Validate a development branch of the engine images.
    #[must_use]
    pub fn with_engine_branch(mut self, branch: &str) -> Self {
        self.engine_branch = normalize(Some(branch));
        self
    }

    /// Take deployment files from a branch of the deployment repository.
    #[must_use]
    pub fn with_deployment_branch(mut self, branch: &str) -> Self {
        self.deployment_branch = normalize(Some(branch));
        self
    }

    pub fn engine_branch(&self) -> Option<&str> {
        self.engine_branch.as_deref()
    }

    pub fn deployment_branch(&self) -> Option<&str> {
        self.deployment_branch.as_deref()
    }

    /// Resolve to a concrete image and deployment source.
    ///
    /// The index is only consulted when no version is pinned and at least
    /// one axis has no branch.
    pub async fn resolve(&self, index: &dyn ReleaseIndex) -> Result<ResolvedRelease, ReleaseError> {
        let needs_index =
            self.version.is_none() && (self.engine_branch.is_none() || self.deployment_branch.is_none());

        let version = match self.version {
            Some(v) => Some(v),
            None if needs_index => {
                let latest = index.latest_release().await?;
                info!(version = %latest, "No version pinned, using latest published release");
                Some(latest)
            }
            None => None,
        };

        let image = match (&self.engine_branch, version) {
            (Some(branch), _) => ImageSource::Branch(branch.clone()),
            (None, Some(v)) => ImageSource::Release(v),
            (None, None) => return Err(ReleaseError::NothingSelected),
        };

        let deployment = match (&self.deployment_branch, version) {
            (Some(branch), _) => DeploymentSource::Branch(branch.clone()),
            (None, Some(v)) => DeploymentSource::Release(v),
            (None, None) => return Err(ReleaseError::NothingSelected),
        };

        debug!(?image, ?deployment, "Release resolved");
        Ok(ResolvedRelease { image, deployment })
    }
}

fn normalize(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty() && *v != "None")
        .map(str::to_string)
}

/// Where the engine images come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Immutable published tag.
    Release(Version),
    /// Development build of a branch.
    Branch(String),
}

impl ImageSource {
    pub fn tag(&self) -> String {
        match self {
            Self::Release(v) => v.to_string(),
            Self::Branch(b) => b.clone(),
        }
    }

    pub fn organization(&self) -> &'static str {
        match self {
            Self::Release(_) => RELEASE_ORGANIZATION,
            Self::Branch(_) => DEV_ORGANIZATION,
        }
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Self::Branch(_))
    }
}

/// Where deployment files (compose files, chart) come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentSource {
    Release(Version),
    Branch(String),
}

impl DeploymentSource {
    /// Name used for the local folder holding the files.
    pub fn label(&self) -> String {
        match self {
            Self::Release(v) => v.to_string(),
            Self::Branch(b) => b.replace('/', "_"),
        }
    }
}

/// Outcome of resolving a selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRelease {
    pub image: ImageSource,
    pub deployment: DeploymentSource,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::FixedReleaseIndex;

    fn index() -> FixedReleaseIndex {
        FixedReleaseIndex::new(Version::new(2, 19, 1))
    }

    #[tokio::test]
    async fn test_branch_takes_precedence_over_version() {
        let selector = ReleaseSelector::version(Version::new(2, 4, 3)).with_engine_branch("feature-x");
        let resolved = selector.resolve(&index()).await.unwrap();

        assert_eq!(resolved.image.tag(), "feature-x");
        assert_eq!(resolved.image.organization(), DEV_ORGANIZATION);
        assert_eq!(
            resolved.deployment,
            DeploymentSource::Release(Version::new(2, 4, 3))
        );
    }

    #[tokio::test]
    async fn test_pinned_version_uses_release_organization() {
        let selector = ReleaseSelector::version(Version::new(2, 4, 3));
        let resolved = selector.resolve(&index()).await.unwrap();

        assert_eq!(resolved.image, ImageSource::Release(Version::new(2, 4, 3)));
        assert_eq!(resolved.image.organization(), RELEASE_ORGANIZATION);
    }

    #[tokio::test]
    async fn test_nothing_pinned_uses_latest() {
        let resolved = ReleaseSelector::latest().resolve(&index()).await.unwrap();
        assert_eq!(resolved.image.tag(), "2.19.1");
        assert_eq!(
            resolved.deployment,
            DeploymentSource::Release(Version::new(2, 19, 1))
        );
    }

    #[tokio::test]
    async fn test_both_branches_skip_index() {
        let selector = ReleaseSelector::latest()
            .with_engine_branch("feature-x")
            .with_deployment_branch("fix/chart");
        let resolved = selector.resolve(&FixedReleaseIndex::unavailable()).await.unwrap();

        assert_eq!(resolved.image, ImageSource::Branch("feature-x".to_string()));
        assert_eq!(resolved.deployment.label(), "fix_chart");
    }

    #[test]
    fn test_none_literal_is_absent() {
        let selector = ReleaseSelector::from_parts(None, Some("None"), Some("  "));
        assert!(selector.engine_branch().is_none());
        assert!(selector.deployment_branch().is_none());
    }
}
