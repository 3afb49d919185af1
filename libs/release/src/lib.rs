//! # edgeval-release
//!
//! Which engine build a validation run deploys.
//!
//! A run either pins a published release (`2.4.3`), or validates a
//! development branch whose images live in the development organization.
//! With neither, the latest published release is looked up in the release
//! index. Deployment files (compose files, helm chart) are selected on their
//! own axis: a deployment branch, else the pinned or latest release.

mod index;
mod selector;
mod version;

pub use index::{FixedReleaseIndex, GithubReleaseIndex, ReleaseError, ReleaseIndex, ReleaseInfo};
pub use selector::{DeploymentSource, ImageSource, ReleaseSelector, ResolvedRelease};
pub use version::{FormatError, Version};

/// Image organization for published releases.
pub const RELEASE_ORGANIZATION: &str = "sixsq";

/// Image organization for development branch builds.
pub const DEV_ORGANIZATION: &str = "nuvladev";

/// Release index of the deployment repository.
pub const DEPLOYMENT_RELEASES_URL: &str =
    "https://api.github.com/repos/nuvlaedge/deployment/releases";
