//! Cluster backend: the engine as a helm release on k3s.

use std::collections::{BTreeMap, BTreeSet};

use edgeval_converge::retry_find;
use edgeval_id::EdgeId;
use edgeval_release::{DeploymentSource, ImageSource};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{drain_matched, BackendCore, BackendError, BackendOptions, LogCollection, LogUnit};
use crate::certificate::{CertificateWatcher, WatcherHandle, KUBECONFIG_PATH};
use crate::device::{quote, quote_path, CommandResult, RemoteCommand, RemoteError, RemoteHost};

const HELM_REPO_URL: &str = "https://nuvlaedge.github.io/deployment";
const HELM_REPO_NAME: &str = "nuvlaedge";
const HELM_CHART_NAME: &str = "nuvlaedge";
const DEPLOYMENT_GIT_URL: &str = "https://github.com/nuvlaedge/deployment";

/// Inputs of the helm install command.
#[derive(Debug, Clone)]
pub struct InstallParams<'a> {
    pub edge: EdgeId,
    /// Chart reference: `repo/chart` or a local chart folder.
    pub chart: &'a str,
    /// Chart version, for repository charts.
    pub chart_version: Option<String>,
    pub hostname: &'a str,
    pub image: &'a ImageSource,
    pub peripherals: &'a BTreeSet<String>,
}

/// Build the helm install command line.
pub fn install_command(params: &InstallParams<'_>) -> String {
    let mut command = format!(
        "helm install {} {}",
        params.edge.workload_name(),
        params.chart
    );
    if let Some(version) = &params.chart_version {
        command.push_str(&format!(" --version {version}"));
    }
    command.push_str(&format!(
        " --set NUVLAEDGE_UUID={} --set vpnClient=true --set kubernetesNode={}",
        params.edge, params.hostname
    ));
    command.push_str(&format!(
        " --set nuvlaedge.image.tag={} --set nuvlaedge.image.organization={}",
        params.image.tag(),
        params.image.organization()
    ));
    for peripheral in params.peripherals {
        command.push_str(&format!(" --set peripherals.{peripheral}=true"));
    }
    command
}

#[derive(Debug, Deserialize)]
struct HelmRelease {
    name: String,
    namespace: String,
}

/// Engine as a helm release on a single-node cluster.
pub struct ClusterBackend {
    pub(super) core: BackendCore,
    namespace: Option<String>,
    watcher: Option<WatcherHandle>,
}

impl ClusterBackend {
    pub fn new(host: RemoteHost, options: BackendOptions) -> Self {
        Self {
            core: BackendCore::new(host, options),
            namespace: None,
            watcher: None,
        }
    }

    /// Namespace of the current install, once discovered.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// The running certificate watcher, if any.
    pub fn watcher(&self) -> Option<&WatcherHandle> {
        self.watcher.as_ref()
    }

    fn cluster_command(&self, command: &str) -> RemoteCommand {
        RemoteCommand::new(command)
            .with_var("KUBECONFIG", KUBECONFIG_PATH)
            .privileged()
    }

    async fn cluster(&self, command: &str) -> Result<CommandResult, RemoteError> {
        self.core.host.execute(&self.cluster_command(command)).await
    }

    async fn cluster_lines(&self, command: &str) -> Result<Vec<String>, RemoteError> {
        let result = self.cluster(command).await?;
        Ok(result.lines().map(str::to_string).collect())
    }

    /// Prepare the chart; returns the chart reference and version.
    async fn prepare_chart(
        &self,
        source: &DeploymentSource,
    ) -> Result<(String, Option<String>), BackendError> {
        match source {
            DeploymentSource::Release(version) => {
                // Registering twice fails harmlessly
                let add = format!("helm repo add {HELM_REPO_NAME} {HELM_REPO_URL}");
                self.core.best_effort(self.cluster_command(&add)).await;

                let update = "helm repo update";
                let result = self.cluster(update).await?;
                if !result.success() {
                    return Err(BackendError::command_failed(update, &result));
                }
                Ok((
                    format!("{HELM_REPO_NAME}/{HELM_CHART_NAME}"),
                    Some(version.to_string()),
                ))
            }
            DeploymentSource::Branch(branch) => {
                let root = self.core.host.validation_root().await?;
                let dir = quote_path(&format!("{root}/engines/deployment-{}", source.label()));
                let clone = format!(
                    "rm -rf {dir} && git clone --depth 1 --branch {} {DEPLOYMENT_GIT_URL} {dir}",
                    quote(branch)
                );
                let result = self.core.host.run_command(&clone).await?;
                if !result.success() {
                    return Err(BackendError::command_failed(&clone, &result));
                }
                Ok((format!("{dir}/helm"), None))
            }
        }
    }

    async fn discover_namespace(&self, edge: EdgeId) -> Option<String> {
        let key = edge.uuid().to_string();
        let options = &self.core.options;
        retry_find(options.namespace_attempts, options.namespace_interval, || {
            let key = key.clone();
            async move {
                match self
                    .cluster_lines("kubectl get namespaces --no-headers -o custom-columns=:metadata.name")
                    .await
                {
                    Ok(lines) => lines.into_iter().find(|ns| ns.contains(&key)),
                    Err(e) => {
                        debug!(error = %e, "Namespace lookup failed");
                        None
                    }
                }
            }
        })
        .await
    }

    pub(super) async fn start_engine(
        &mut self,
        edge: EdgeId,
        remove_existing: bool,
        extra_env: Option<&BTreeMap<String, String>>,
    ) -> Result<(), BackendError> {
        if remove_existing {
            debug!("Removing possible old engine installs");
            self.purge_engine(None).await;
        }

        let release = self.core.prepare(edge, extra_env).await?;
        let hostname = match &self.core.host.device().hostname {
            Some(h) => h.clone(),
            None => self.core.host.hostname().await?,
        };
        let (chart, chart_version) = self.prepare_chart(&release.deployment).await?;

        let command = install_command(&InstallParams {
            edge,
            chart: &chart,
            chart_version,
            hostname: &hostname,
            image: &release.image,
            peripherals: &self.core.options.peripherals,
        });

        info!(
            device = %self.core.host.device().alias,
            edge = %edge,
            release = %edge.workload_name(),
            "Installing engine chart"
        );

        let env = self.core.engine.snapshot();
        let result = self
            .core
            .host
            .execute(&self.cluster_command(&command).with_env(&env))
            .await?;
        if !result.success() {
            return Err(BackendError::command_failed(&command, &result));
        }

        let namespace = self
            .discover_namespace(edge)
            .await
            .ok_or_else(|| BackendError::NamespaceNotFound(edge.workload_name()))?;
        info!(namespace = %namespace, "Engine namespace found");
        self.namespace = Some(namespace.clone());

        if self.watcher.as_ref().is_none_or(WatcherHandle::is_finished) {
            let watcher = CertificateWatcher::new(
                self.core.host.clone(),
                namespace,
                self.core.options.watcher.clone(),
            );
            self.watcher = Some(watcher.spawn());
        }

        Ok(())
    }

    pub(super) async fn finish_tasks(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.join().await;
        }
    }

    pub(super) async fn stop_engine(&mut self) {
        let Some(namespace) = self.namespace.clone() else {
            debug!("No engine namespace known, nothing to stop");
            return;
        };
        let command = format!("kubectl scale deployment --all --replicas=0 -n {namespace}");
        self.core.best_effort(self.cluster_command(&command)).await;
    }

    pub(super) async fn purge_engine(&mut self, edge: Option<EdgeId>) {
        info!(device = %self.core.host.device().alias, edge = ?edge, "Purging engine");
        self.finish_tasks().await;
        self.stop_engine().await;

        match self.cluster("helm list --all-namespaces -o json").await {
            Ok(result) if result.success() => {
                let releases: Vec<HelmRelease> = match serde_json::from_str(result.stdout.trim()) {
                    Ok(releases) => releases,
                    Err(e) if result.stdout.trim().is_empty() => {
                        debug!(error = %e, "No helm releases listed");
                        Vec::new()
                    }
                    Err(e) => {
                        warn!(error = %e, "Cannot parse helm releases, skipping uninstall");
                        Vec::new()
                    }
                };
                for release in releases.iter().filter(|r| r.name.starts_with("nuvlaedge-")) {
                    let command = format!("helm uninstall {} -n {}", release.name, release.namespace);
                    self.core.best_effort(self.cluster_command(&command)).await;
                }
            }
            Ok(_) => debug!("helm list failed, skipping uninstall"),
            Err(e) => warn!(error = %e, "Cannot list helm releases"),
        }

        let listings = [
            ("namespace", "kubectl get namespaces --no-headers -o custom-columns=:metadata.name"),
            (
                "clusterrolebinding",
                "kubectl get clusterrolebindings --no-headers -o custom-columns=:metadata.name",
            ),
        ];
        for (kind, listing) in listings {
            match self.cluster_lines(listing).await {
                Ok(names) => {
                    for name in names.iter().filter(|n| n.starts_with("nuvlaedge")) {
                        let command = format!("kubectl delete {kind} {name}");
                        self.core.best_effort(self.cluster_command(&command)).await;
                    }
                }
                Err(e) => warn!(kind, error = %e, "Cannot list cluster resources"),
            }
        }

        match self.core.host.validation_root().await {
            Ok(root) => {
                self.core
                    .best_effort(RemoteCommand::new(format!("rm -rf {root}/engines/deployment-*")))
                    .await;
            }
            Err(e) => warn!(error = %e, "Cannot locate chart folder, leaving it"),
        }

        self.namespace = None;
    }

    async fn pods(&self, running_only: bool) -> Result<Vec<String>, RemoteError> {
        let Some(namespace) = &self.namespace else {
            return Ok(Vec::new());
        };
        let selector = if running_only {
            " --field-selector=status.phase=Running"
        } else {
            ""
        };
        self.cluster_lines(&format!(
            "kubectl get pods -n {namespace}{selector} --no-headers -o custom-columns=:metadata.name"
        ))
        .await
    }

    pub(super) async fn engine_running(&self) -> bool {
        match self.pods(true).await {
            Ok(pods) => !pods.is_empty(),
            Err(e) => {
                debug!(error = %e, "Cannot list engine pods");
                false
            }
        }
    }

    pub(super) async fn get_engine_logs(&self) -> LogCollection {
        let Some(namespace) = self.namespace.clone() else {
            warn!("No engine namespace known, no logs to collect");
            return LogCollection::default();
        };
        let pods = match self.pods(false).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(error = %e, "Cannot list engine pods for log collection");
                return LogCollection::default();
            }
        };

        let units = pods
            .into_iter()
            .map(|pod| LogUnit {
                dump_command: format!(
                    "KUBECONFIG={KUBECONFIG_PATH} kubectl logs {pod} -n {namespace} --all-containers > {{out}} 2>&1"
                ),
                name: pod,
            })
            .collect();

        self.core.collect_logs(units, true).await
    }

    pub(super) async fn peripherals_running(&self, expected: &mut BTreeSet<String>) -> bool {
        match self.pods(true).await {
            Ok(pods) => drain_matched(expected, pods.iter().map(String::as_str)),
            Err(e) => {
                warn!(error = %e, "Cannot list engine pods");
                false
            }
        }
    }
}
