//! Bootstrap certificate approval for cluster installs.
//!
//! The engine's cluster identity is only trusted once its certificate
//! signing request is approved. The watcher runs next to a cluster install:
//! it finds the credentials manager pod, reads the request name from its
//! environment, and approves the request whenever it is not approved.
//!
//! ```text
//! SearchingPod ──pod found──▶ WaitingForRequest ──approved──▶ ApprovedIdle
//!                                      ▲                            │
//!                                      └──────── not approved ──────┘
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::device::{RemoteCommand, RemoteError, RemoteHost};

/// Cluster credentials file of k3s devices.
pub const KUBECONFIG_PATH: &str = "/etc/rancher/k3s/k3s.yaml";

/// Watcher configuration.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Cycle interval until the request is approved.
    pub unapproved_interval: Duration,

    /// Cycle interval once approved; catches renewals.
    pub approved_interval: Duration,

    /// Upper bound for `join`.
    pub join_timeout: Duration,

    /// Substring identifying the credentials manager pod.
    pub pod_pattern: String,

    /// Environment key holding the request name in that pod.
    pub csr_env_key: String,

    /// Request name that gets the namespace appended.
    pub generic_csr_name: String,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            unapproved_interval: Duration::from_secs(5),
            approved_interval: Duration::from_secs(60),
            join_timeout: Duration::from_secs(10),
            pod_pattern: "kubernetes-credentials-manager".to_string(),
            csr_env_key: "CSR_NAME".to_string(),
            generic_csr_name: "nuvlaedge-csr".to_string(),
        }
    }
}

/// Observable watcher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherStatus {
    SearchingPod,
    WaitingForRequest,
    ApprovedIdle,
}

/// Request name as read from the pod, made unique per namespace when generic.
pub fn csr_name(raw: &str, namespace: &str, generic: &str) -> String {
    let raw = raw.trim();
    if raw == generic {
        format!("{raw}-{namespace}")
    } else {
        raw.to_string()
    }
}

/// Approves the bootstrap certificate request of one namespace.
pub struct CertificateWatcher {
    host: RemoteHost,
    namespace: String,
    config: WatcherConfig,
    status: watch::Sender<WatcherStatus>,
    approvals: Arc<AtomicU32>,
    csr: Option<String>,
}

impl CertificateWatcher {
    pub fn new(host: RemoteHost, namespace: impl Into<String>, config: WatcherConfig) -> Self {
        let (status, _) = watch::channel(WatcherStatus::SearchingPod);
        Self {
            host,
            namespace: namespace.into(),
            config,
            status,
            approvals: Arc::new(AtomicU32::new(0)),
            csr: None,
        }
    }

    /// Start the watcher on its own task.
    pub fn spawn(self) -> WatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let status = self.status.subscribe();
        let approvals = Arc::clone(&self.approvals);
        let join_timeout = self.config.join_timeout;
        let namespace = self.namespace.clone();

        let task = tokio::spawn(self.run(shutdown_rx));

        WatcherHandle {
            namespace,
            shutdown: shutdown_tx,
            status,
            approvals,
            join_timeout,
            task: Some(task),
        }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(namespace = %self.namespace, "Starting certificate watcher");
        let mut consecutive_failures = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.cycle().await {
                Ok(()) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures <= 3 {
                        warn!(error = %e, consecutive_failures, "Certificate watcher cycle failed");
                    } else {
                        error!(error = %e, consecutive_failures, "Certificate watcher cycle failed repeatedly");
                    }
                }
            }

            let wait = match *self.status.borrow() {
                WatcherStatus::ApprovedIdle => self.config.approved_interval,
                _ => self.config.unapproved_interval,
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            namespace = %self.namespace,
            approvals = self.approvals.load(Ordering::SeqCst),
            "Certificate watcher stopped"
        );
    }

    /// One observation, at most one approval.
    async fn cycle(&mut self) -> Result<(), RemoteError> {
        match self.host.is_reachable(true).await {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                debug!(namespace = %self.namespace, "Device unreachable, skipping cycle");
                return Ok(());
            }
        }

        let csr = match &self.csr {
            Some(csr) => csr.clone(),
            None => match self.discover_request().await? {
                Some(csr) => {
                    info!(namespace = %self.namespace, csr = %csr, "Found certificate request name");
                    self.csr = Some(csr.clone());
                    self.status.send_replace(WatcherStatus::WaitingForRequest);
                    csr
                }
                None => return Ok(()),
            },
        };

        let conditions = self
            .kubectl(&format!(
                "kubectl get csr {csr} --no-headers -o custom-columns=:status.conditions[*].type"
            ))
            .await?;
        if !conditions.success() {
            debug!(csr = %csr, "Certificate request not created yet");
            return Ok(());
        }

        if conditions.stdout.contains("Approved") {
            if *self.status.borrow() != WatcherStatus::ApprovedIdle {
                info!(csr = %csr, "Certificate request approved");
            }
            self.status.send_replace(WatcherStatus::ApprovedIdle);
            return Ok(());
        }

        let approve = self
            .kubectl(&format!("kubectl certificate approve {csr}"))
            .await?;
        if approve.success() {
            self.approvals.fetch_add(1, Ordering::SeqCst);
            info!(csr = %csr, "Approved certificate request");
        } else {
            warn!(csr = %csr, stderr = %approve.stderr.trim(), "Approving certificate request failed");
        }
        self.status.send_replace(WatcherStatus::WaitingForRequest);
        Ok(())
    }

    async fn discover_request(&self) -> Result<Option<String>, RemoteError> {
        let pods = self
            .kubectl(&format!(
                "kubectl get pods -n {} --no-headers -o custom-columns=:metadata.name,:status.phase",
                self.namespace
            ))
            .await?;

        let pod = pods.lines().find_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            let phase = fields.next().unwrap_or_default();
            (name.contains(&self.config.pod_pattern) && phase == "Running").then(|| name.to_string())
        });
        let Some(pod) = pod else {
            debug!(namespace = %self.namespace, "Credentials manager pod not running yet");
            return Ok(None);
        };

        let env = self
            .kubectl(&format!(
                "kubectl exec -n {} {pod} -- printenv {}",
                self.namespace, self.config.csr_env_key
            ))
            .await?;
        let raw = env.stdout.trim();
        if !env.success() || raw.is_empty() {
            return Ok(None);
        }

        Ok(Some(csr_name(raw, &self.namespace, &self.config.generic_csr_name)))
    }

    async fn kubectl(&self, command: &str) -> Result<crate::device::CommandResult, RemoteError> {
        self.host
            .execute(
                &RemoteCommand::new(command)
                    .with_var("KUBECONFIG", KUBECONFIG_PATH)
                    .privileged(),
            )
            .await
    }
}

/// Handle to a running watcher.
pub struct WatcherHandle {
    namespace: String,
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<WatcherStatus>,
    approvals: Arc<AtomicU32>,
    join_timeout: Duration,
    task: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn status(&self) -> WatcherStatus {
        *self.status.borrow()
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> watch::Receiver<WatcherStatus> {
        self.status.clone()
    }

    /// Number of approve commands that succeeded.
    pub fn approvals(&self) -> u32 {
        self.approvals.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Ask the watcher to stop after its current cycle.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stop and wait for the watcher, at most the configured join timeout.
    ///
    /// Returns false if the task had to be aborted.
    pub async fn join(&mut self) -> bool {
        self.join_within(self.join_timeout).await
    }

    /// Stop and wait for the watcher, at most `timeout`.
    pub async fn join_within(&mut self, timeout: Duration) -> bool {
        self.stop();
        let Some(mut task) = self.task.take() else {
            return true;
        };

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(namespace = %self.namespace, error = %e, "Certificate watcher task panicked");
                true
            }
            Err(_) => {
                warn!(namespace = %self.namespace, ?timeout, "Certificate watcher did not stop in time, aborting");
                task.abort();
                false
            }
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            warn!(namespace = %self.namespace, "Certificate watcher dropped without join");
            let _ = self.shutdown.send(true);
            task.abort();
        }
    }
}
