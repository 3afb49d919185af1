//! Single-host backend: the engine as a docker compose project.

use std::collections::{BTreeMap, BTreeSet};

use edgeval_id::EdgeId;
use edgeval_release::DeploymentSource;
use tracing::{debug, info, warn};

use super::{
    drain_matched, BackendCore, BackendError, BackendOptions, LogCollection, LogUnit, PROJECT_NAME,
};
use crate::device::{RemoteCommand, RemoteHost};

const RELEASE_DOWNLOAD_LINK: &str = "https://github.com/nuvlaedge/deployment/releases/download";
const DEPLOYMENT_FILES_LINK: &str = "https://raw.githubusercontent.com/nuvlaedge/deployment";

const ENGINE_FILE: &str = "docker-compose.yml";

fn project_filter() -> String {
    format!("label=com.docker.compose.project={PROJECT_NAME}")
}

/// Compose file of a peripheral.
pub fn peripheral_file(peripheral: &str) -> String {
    format!("docker-compose.{peripheral}.yml")
}

/// Download link of a deployment file.
pub fn file_link(source: &DeploymentSource, file: &str) -> String {
    match source {
        DeploymentSource::Release(version) => format!("{RELEASE_DOWNLOAD_LINK}/{version}/{file}"),
        DeploymentSource::Branch(branch) => format!("{DEPLOYMENT_FILES_LINK}/{branch}/{file}"),
    }
}

/// Engine as a compose project on a single docker host.
pub struct SingleHostBackend {
    pub(super) core: BackendCore,
}

impl SingleHostBackend {
    pub fn new(host: RemoteHost, options: BackendOptions) -> Self {
        Self {
            core: BackendCore::new(host, options),
        }
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

        let root = self.core.host.validation_root().await?;
        let folder = format!("{root}/engines/{}", release.deployment.label());
        let mkdir = format!("mkdir -p {folder}");
        let created = self.core.host.run_command(&mkdir).await?;
        if !created.success() {
            return Err(BackendError::command_failed(&mkdir, &created));
        }

        let mut files = vec![ENGINE_FILE.to_string()];
        for peripheral in &self.core.options.peripherals {
            files.push(peripheral_file(peripheral));
        }

        let mut downloaded = Vec::with_capacity(files.len());
        for file in files {
            let url = file_link(&release.deployment, &file);
            if self.core.host.download_file(&url, &folder, &file).await {
                downloaded.push(file);
            } else if file == ENGINE_FILE {
                return Err(BackendError::Download { url });
            } else {
                warn!(url = %url, "Peripheral compose file unavailable, skipping");
            }
        }

        let command = format!(
            "docker compose -p {PROJECT_NAME} -f {} up -d",
            downloaded.join(" -f ")
        );
        let env = self.core.engine.snapshot();
        info!(
            device = %self.core.host.device().alias,
            edge = %edge,
            files = downloaded.len(),
            "Starting engine"
        );

        let result = self
            .core
            .host
            .execute(&RemoteCommand::new(&command).in_dir(&folder).with_env(&env))
            .await?;
        if !result.success() {
            return Err(BackendError::command_failed(&command, &result));
        }

        info!(edge = %edge, "Engine start command executed");
        Ok(())
    }

    pub(super) async fn stop_engine(&mut self) {
        let command = format!("docker ps -q --filter {} | xargs -r docker stop", project_filter());
        self.core.best_effort(RemoteCommand::new(command)).await;
    }

    pub(super) async fn purge_engine(&mut self, edge: Option<EdgeId>) {
        info!(device = %self.core.host.device().alias, edge = ?edge, "Purging engine");
        self.stop_engine().await;

        for command in [
            "docker service ls -q | xargs -r docker service rm".to_string(),
            "docker ps -aq | xargs -r docker rm -f".to_string(),
            "docker network prune -f".to_string(),
            "docker volume prune -f".to_string(),
        ] {
            self.core.best_effort(RemoteCommand::new(command)).await;
        }

        match self.core.host.validation_root().await {
            Ok(root) => {
                self.core
                    .best_effort(RemoteCommand::new(format!("rm -rf {root}/engines/*")))
                    .await;
            }
            Err(e) => warn!(error = %e, "Cannot locate engine folder, leaving it"),
        }
    }

    pub(super) async fn engine_running(&self) -> bool {
        match self
            .core
            .host
            .list_running_containers(Some(&project_filter()))
            .await
        {
            Ok(containers) => !containers.is_empty(),
            Err(e) => {
                debug!(error = %e, "Cannot list engine containers");
                false
            }
        }
    }

    pub(super) async fn get_engine_logs(&self) -> LogCollection {
        let containers = match self
            .core
            .host
            .list_containers(Some(&project_filter()), true)
            .await
        {
            Ok(containers) => containers,
            Err(e) => {
                warn!(error = %e, "Cannot list engine containers for log collection");
                return LogCollection::default();
            }
        };

        let units = containers
            .into_iter()
            .map(|c| LogUnit {
                dump_command: format!("docker logs {} > {{out}} 2>&1", c.id),
                name: c.names,
            })
            .collect();

        self.core.collect_logs(units, false).await
    }

    pub(super) async fn peripherals_running(&self, expected: &mut BTreeSet<String>) -> bool {
        match self
            .core
            .host
            .list_running_containers(Some(&project_filter()))
            .await
        {
            Ok(containers) => drain_matched(expected, containers.iter().map(|c| c.names.as_str())),
            Err(e) => {
                warn!(error = %e, "Cannot list engine containers");
                false
            }
        }
    }
}
