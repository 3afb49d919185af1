//! Engine lifecycle on a device, per orchestration backend.
//!
//! [`Backend`] is a closed set of two variants chosen once from the device
//! configuration by [`Backend::from_device`]. Both install, stop and purge
//! the engine, report whether it runs, and collect its logs. Readiness is
//! not awaited here; the driver polls the control plane for it.

mod docker;
mod kubernetes;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use edgeval_id::EdgeId;
use edgeval_release::{ReleaseError, ReleaseIndex, ReleaseSelector, ResolvedRelease};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::certificate::WatcherConfig;
use crate::config::BackendKind;
use crate::device::{quote, CommandResult, RemoteCommand, RemoteError, RemoteHost, REMOTE_LOG_DIR};

pub use docker::SingleHostBackend;
pub use kubernetes::{install_command, ClusterBackend, InstallParams};

/// Compose project (and label) of engine installs.
pub const PROJECT_NAME: &str = "nuvlaedge_validator";

/// Backend errors.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("`{command}` failed with exit code {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("unexpected output from `{command}`: {reason}")]
    Parse { command: String, reason: String },

    #[error("cannot resolve engine release: {0}")]
    Release(#[from] ReleaseError),

    #[error("unsupported backend '{0}'")]
    UnsupportedBackend(String),

    #[error("no namespace found for {0}")]
    NamespaceNotFound(String),

    #[error("cannot download {url} to the device")]
    Download { url: String },
}

impl BackendError {
    fn command_failed(command: &str, result: &CommandResult) -> Self {
        Self::CommandFailed {
            command: command.to_string(),
            exit_code: result.exit_code,
            stderr: result.stderr.trim().to_string(),
        }
    }
}

/// Everything a backend needs besides the device.
#[derive(Clone)]
pub struct BackendOptions {
    pub selector: ReleaseSelector,
    pub release_index: Arc<dyn ReleaseIndex>,

    /// Optional components installed with the engine.
    pub peripherals: BTreeSet<String>,

    /// Image registry prefix handed to the engine, if not the default one.
    pub image_registry: Option<String>,

    /// Local folder receiving logs, one subfolder per device.
    pub log_dir: PathBuf,

    pub watcher: WatcherConfig,

    /// Namespace discovery after a cluster install.
    pub namespace_attempts: u32,
    pub namespace_interval: Duration,
}

impl BackendOptions {
    pub fn new(selector: ReleaseSelector, release_index: Arc<dyn ReleaseIndex>) -> Self {
        Self {
            selector,
            release_index,
            peripherals: BTreeSet::new(),
            image_registry: None,
            log_dir: PathBuf::from("logs"),
            watcher: WatcherConfig::default(),
            namespace_attempts: 20,
            namespace_interval: Duration::from_secs(3),
        }
    }

    #[must_use]
    pub fn with_peripherals(mut self, peripherals: BTreeSet<String>) -> Self {
        self.peripherals = peripherals;
        self
    }

    #[must_use]
    pub fn with_image_registry(mut self, registry: Option<String>) -> Self {
        self.image_registry = registry;
        self
    }

    #[must_use]
    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = log_dir.into();
        self
    }

    #[must_use]
    pub fn with_watcher(mut self, watcher: WatcherConfig) -> Self {
        self.watcher = watcher;
        self
    }
}

impl std::fmt::Debug for BackendOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendOptions")
            .field("selector", &self.selector)
            .field("peripherals", &self.peripherals)
            .field("log_dir", &self.log_dir)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Engine configuration
// =============================================================================

/// Environment handed to the engine install, owned by one backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfiguration {
    image_tag: Option<String>,
    image_organization: Option<String>,
    image_registry: Option<String>,
    project_name: String,
    edge: Option<EdgeId>,
    overrides: BTreeMap<String, String>,
}

impl EngineConfiguration {
    pub fn new(project_name: &str) -> Self {
        Self {
            project_name: project_name.to_string(),
            ..Self::default()
        }
    }

    pub fn image_tag(&self) -> Option<&str> {
        self.image_tag.as_deref()
    }

    pub fn image_organization(&self) -> Option<&str> {
        self.image_organization.as_deref()
    }

    pub fn image_registry(&self) -> Option<&str> {
        self.image_registry.as_deref()
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    pub fn edge(&self) -> Option<EdgeId> {
        self.edge
    }

    fn apply_release(&mut self, release: &ResolvedRelease, registry: Option<&str>) {
        self.image_tag = Some(release.image.tag());
        self.image_organization = Some(release.image.organization().to_string());
        self.image_registry = registry.map(str::to_string);
    }

    /// Bind to an edge and replace the caller overrides.
    fn bind(&mut self, edge: EdgeId, overrides: Option<&BTreeMap<String, String>>) {
        self.edge = Some(edge);
        self.overrides = overrides.cloned().unwrap_or_default();
    }

    /// Fresh copy of the environment map; overrides win.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(tag) = &self.image_tag {
            env.insert("NE_IMAGE_TAG".to_string(), tag.clone());
        }
        if let Some(org) = &self.image_organization {
            env.insert("NE_IMAGE_ORGANIZATION".to_string(), org.clone());
        }
        if let Some(registry) = &self.image_registry {
            env.insert("NE_IMAGE_REGISTRY".to_string(), registry.clone());
        }
        env.insert("COMPOSE_PROJECT_NAME".to_string(), self.project_name.clone());
        if let Some(edge) = &self.edge {
            env.insert("NUVLABOX_UUID".to_string(), edge.to_string());
            env.insert("NUVLAEDGE_UUID".to_string(), edge.to_string());
        }
        env.extend(self.overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

// =============================================================================
// Shared pieces
// =============================================================================

/// State and helpers common to both variants.
struct BackendCore {
    host: RemoteHost,
    options: BackendOptions,
    release: OnceCell<ResolvedRelease>,
    engine: EngineConfiguration,
}

impl BackendCore {
    fn new(host: RemoteHost, options: BackendOptions) -> Self {
        Self {
            host,
            options,
            release: OnceCell::new(),
            engine: EngineConfiguration::new(PROJECT_NAME),
        }
    }

    /// Resolve the release selector, once per backend.
    async fn release(&self) -> Result<ResolvedRelease, BackendError> {
        let release = self
            .release
            .get_or_try_init(|| async {
                self.options
                    .selector
                    .resolve(self.options.release_index.as_ref())
                    .await
            })
            .await?;
        Ok(release.clone())
    }

    /// Resolve the release and bind the configuration to `edge`.
    async fn prepare(
        &mut self,
        edge: EdgeId,
        extra_env: Option<&BTreeMap<String, String>>,
    ) -> Result<ResolvedRelease, BackendError> {
        let release = self.release().await?;
        self.engine
            .apply_release(&release, self.options.image_registry.as_deref());
        self.engine.bind(edge, extra_env);
        info!(
            device = %self.host.device().alias,
            edge = %edge,
            tag = %release.image.tag(),
            organization = %release.image.organization(),
            development = release.image.is_development(),
            registry = ?self.engine.image_registry(),
            "Engine configuration prepared"
        );
        Ok(release)
    }

    /// Run a cleanup step; failures are logged and ignored.
    async fn best_effort(&self, command: RemoteCommand) {
        match self.host.execute(&command).await {
            Ok(result) if result.success() => {}
            Ok(result) => debug!(
                command = %command.command,
                exit_code = result.exit_code,
                "Cleanup step failed, ignoring"
            ),
            Err(e) => warn!(command = %command.command, error = %e, "Cleanup step failed, ignoring"),
        }
    }

    async fn collect_logs(&self, units: Vec<LogUnit>, privileged: bool) -> LogCollection {
        let mut collection = LogCollection::default();
        let local_dir = self.options.log_dir.join(&self.host.device().alias);

        if let Err(e) = tokio::fs::create_dir_all(&local_dir).await {
            warn!(dir = %local_dir.display(), error = %e, "Cannot create local log folder");
            collection.failed = units.into_iter().map(|u| u.name).collect();
            return collection;
        }

        let wrap = |command: String| {
            let cmd = RemoteCommand::new(command);
            if privileged {
                cmd.privileged()
            } else {
                cmd
            }
        };

        let prepared = self
            .host
            .execute(&wrap(format!("mkdir -p {REMOTE_LOG_DIR}")))
            .await;
        let ready = match prepared {
            Ok(result) if result.success() => true,
            Ok(result) => {
                warn!(exit_code = result.exit_code, "Cannot prepare remote log folder");
                false
            }
            Err(e) => {
                warn!(error = %e, "Cannot prepare remote log folder");
                false
            }
        };
        if !ready {
            collection.failed = units.into_iter().map(|u| u.name).collect();
            return collection;
        }

        let mut dumped = Vec::new();
        for unit in units {
            let remote = format!("{REMOTE_LOG_DIR}/{}.log", unit.name);
            let command = unit.dump_command.replace("{out}", &quote(&remote));
            match self.host.execute(&wrap(command)).await {
                Ok(result) if result.success() => dumped.push((unit.name, remote)),
                Ok(result) => {
                    warn!(unit = %unit.name, exit_code = result.exit_code, "Log dump failed");
                    collection.failed.push(unit.name);
                }
                Err(e) => {
                    warn!(unit = %unit.name, error = %e, "Log dump failed");
                    collection.failed.push(unit.name);
                }
            }
        }

        self.best_effort(wrap(format!("chmod -R a+r {REMOTE_LOG_DIR}")))
            .await;

        for (name, remote) in dumped {
            let local = local_dir.join(format!("{name}.log"));
            match self.host.fetch_remote_file(&remote, &local).await {
                Ok(()) => collection.collected.push(local),
                Err(e) => {
                    warn!(unit = %name, error = %e, "Log transfer failed");
                    collection.failed.push(name);
                }
            }
        }

        self.best_effort(wrap(format!("rm -rf {REMOTE_LOG_DIR}"))).await;

        info!(
            device = %self.host.device().alias,
            collected = collection.collected.len(),
            failed = collection.failed.len(),
            "Engine logs collected"
        );
        collection
    }

    async fn restart_system(&self) -> Result<CommandResult, BackendError> {
        info!(device = %self.host.device().alias, "Restarting device");
        match self.host.run_privileged("shutdown -r now").await {
            Ok(result) => Ok(result),
            Err(e) if e.is_connection_loss() => {
                debug!(error = %e, "Connection dropped by restart");
                Ok(CommandResult::ok(""))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn system_up_time(&self) -> Result<f64, BackendError> {
        let command = "awk '{print $1}' /proc/uptime";
        let result = self.host.run_command(command).await?;
        if !result.success() {
            return Err(BackendError::command_failed(command, &result));
        }
        parse_up_time(command, &result.stdout)
    }

    async fn authorized_keys(&self) -> Result<CommandResult, BackendError> {
        Ok(self.host.run_command("cat ~/.ssh/authorized_keys").await?)
    }
}

fn parse_up_time(command: &str, stdout: &str) -> Result<f64, BackendError> {
    let value = stdout.trim();
    if value.is_empty() {
        return Ok(0.0);
    }
    value.parse().map_err(|e| BackendError::Parse {
        command: command.to_string(),
        reason: format!("'{value}': {e}"),
    })
}

/// Remove from `expected` every name contained in one of `units`.
///
/// Returns true when nothing expected is left.
pub fn drain_matched<'a>(expected: &mut BTreeSet<String>, units: impl IntoIterator<Item = &'a str>) -> bool {
    for unit in units {
        expected.retain(|name| !unit.contains(name.as_str()));
    }
    expected.is_empty()
}

/// A workload unit whose log stream can be dumped to a file.
#[derive(Debug, Clone)]
struct LogUnit {
    name: String,
    /// Command writing the unit's logs to `{out}`.
    dump_command: String,
}

/// Result of a log collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogCollection {
    /// Local files written.
    pub collected: Vec<PathBuf>,
    /// Units whose logs could not be retrieved.
    pub failed: Vec<String>,
}

// =============================================================================
// Backend
// =============================================================================

/// Engine lifecycle on one device.
pub enum Backend {
    SingleHost(SingleHostBackend),
    Cluster(ClusterBackend),
}

impl Backend {
    /// Pick the variant from the device's backend tag.
    pub fn from_device(host: RemoteHost, options: BackendOptions) -> Result<Self, BackendError> {
        let kind = host
            .device()
            .backend_kind()
            .map_err(BackendError::UnsupportedBackend)?;

        debug!(device = %host.device().alias, backend = %kind, "Creating backend");
        Ok(match kind {
            BackendKind::Docker => Self::SingleHost(SingleHostBackend::new(host, options)),
            BackendKind::Kubernetes => Self::Cluster(ClusterBackend::new(host, options)),
        })
    }

    fn core(&self) -> &BackendCore {
        match self {
            Self::SingleHost(b) => &b.core,
            Self::Cluster(b) => &b.core,
        }
    }

    pub fn host(&self) -> &RemoteHost {
        &self.core().host
    }

    pub fn engine_configuration(&self) -> &EngineConfiguration {
        &self.core().engine
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::SingleHost(_) => BackendKind::Docker,
            Self::Cluster(_) => BackendKind::Kubernetes,
        }
    }

    /// Backend discriminator, `single-host` or `cluster`.
    pub fn coe_type(&self) -> &'static str {
        self.kind().coe_type()
    }

    /// Install and start the engine for `edge`. Does not wait for readiness.
    pub async fn start_engine(
        &mut self,
        edge: EdgeId,
        remove_existing: bool,
        extra_env: Option<&BTreeMap<String, String>>,
    ) -> Result<(), BackendError> {
        match self {
            Self::SingleHost(b) => b.start_engine(edge, remove_existing, extra_env).await,
            Self::Cluster(b) => b.start_engine(edge, remove_existing, extra_env).await,
        }
    }

    /// Stop the engine's workload, keeping its state.
    pub async fn stop_engine(&mut self) {
        match self {
            Self::SingleHost(b) => b.stop_engine().await,
            Self::Cluster(b) => b.stop_engine().await,
        }
    }

    /// Remove every trace of engine installs. Safe to call when nothing is installed.
    pub async fn purge_engine(&mut self, edge: Option<EdgeId>) {
        match self {
            Self::SingleHost(b) => b.purge_engine(edge).await,
            Self::Cluster(b) => b.purge_engine(edge).await,
        }
    }

    /// Best-effort liveness probe; false on any failure.
    pub async fn engine_running(&self) -> bool {
        match self {
            Self::SingleHost(b) => b.engine_running().await,
            Self::Cluster(b) => b.engine_running().await,
        }
    }

    /// Collect workload logs into `<log_dir>/<alias>/`.
    pub async fn get_engine_logs(&self) -> LogCollection {
        match self {
            Self::SingleHost(b) => b.get_engine_logs().await,
            Self::Cluster(b) => b.get_engine_logs().await,
        }
    }

    /// Drain from `expected` every peripheral found running; true if all were.
    pub async fn peripherals_running(&self, expected: &mut BTreeSet<String>) -> bool {
        match self {
            Self::SingleHost(b) => b.peripherals_running(expected).await,
            Self::Cluster(b) => b.peripherals_running(expected).await,
        }
    }

    pub async fn get_authorized_keys(&self) -> Result<CommandResult, BackendError> {
        self.core().authorized_keys().await
    }

    /// Stop and join background tasks.
    pub async fn finish_tasks(&mut self) {
        if let Self::Cluster(b) = self {
            b.finish_tasks().await;
        }
    }

    /// Trigger a reboot. A connection dropped by the reboot counts as success.
    pub async fn restart_system(&self) -> Result<CommandResult, BackendError> {
        self.core().restart_system().await
    }

    /// Seconds since boot.
    pub async fn get_system_up_time(&self) -> Result<f64, BackendError> {
        self.core().system_up_time().await
    }

    /// Wait after a reboot trigger before probing the device.
    pub fn reboot_grace(&self) -> Duration {
        match self {
            Self::SingleHost(_) => Duration::from_secs(10),
            Self::Cluster(_) => Duration::from_secs(30),
        }
    }

    /// Upper bound for a device to come back after a reboot.
    pub fn reboot_timeout(&self) -> Duration {
        match self {
            Self::SingleHost(_) => Duration::from_secs(180),
            Self::Cluster(_) => Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeval_release::ImageSource;
    use edgeval_release::{DeploymentSource, Version};

    #[test]
    fn test_snapshot_keys() {
        let mut engine = EngineConfiguration::new(PROJECT_NAME);
        engine.apply_release(
            &ResolvedRelease {
                image: ImageSource::Branch("feature-x".to_string()),
                deployment: DeploymentSource::Release(Version::new(2, 4, 3)),
            },
            None,
        );
        let edge = EdgeId::new();
        let overrides = BTreeMap::from([("NE_IMAGE_TAG".to_string(), "custom".to_string())]);
        engine.bind(edge, Some(&overrides));

        let env = engine.snapshot();
        assert_eq!(env["NE_IMAGE_TAG"], "custom");
        assert_eq!(env["NE_IMAGE_ORGANIZATION"], "nuvladev");
        assert_eq!(env["COMPOSE_PROJECT_NAME"], PROJECT_NAME);
        assert_eq!(env["NUVLAEDGE_UUID"], edge.to_string());
        assert!(!env.contains_key("NE_IMAGE_REGISTRY"));

        // Overrides are replaced, not accumulated
        engine.bind(edge, None);
        assert_eq!(engine.snapshot()["NE_IMAGE_TAG"], "feature-x");
    }

    #[test]
    fn test_snapshot_carries_registry() {
        let mut engine = EngineConfiguration::new(PROJECT_NAME);
        let release = ResolvedRelease {
            image: ImageSource::Release(Version::new(2, 4, 3)),
            deployment: DeploymentSource::Release(Version::new(2, 4, 3)),
        };
        engine.apply_release(&release, Some("registry.internal:5000/"));
        assert_eq!(engine.snapshot()["NE_IMAGE_REGISTRY"], "registry.internal:5000/");

        engine.apply_release(&release, None);
        assert!(!engine.snapshot().contains_key("NE_IMAGE_REGISTRY"));
    }

    #[test]
    fn test_drain_matched() {
        let mut expected = BTreeSet::from(["network".to_string(), "usb".to_string()]);
        assert!(!drain_matched(&mut expected, ["nuvlaedge_validator-network-manager-1"]));
        assert_eq!(expected, BTreeSet::from(["usb".to_string()]));
        assert!(drain_matched(&mut expected, ["peripheral-manager-usb"]));
    }

    #[test]
    fn test_parse_up_time() {
        assert_eq!(parse_up_time("awk", "120.5\n").unwrap(), 120.5);
        assert_eq!(parse_up_time("awk", "").unwrap(), 0.0);
        assert!(matches!(parse_up_time("awk", "abc"), Err(BackendError::Parse { .. })));
    }
}
