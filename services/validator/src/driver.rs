//! Lifecycle driver for a validation run.
//!
//! The driver never sets the lifecycle state of an edge; the control plane
//! advances it as the engine registers. The driver starts the engine,
//! observes the state through polling, and cleans up afterwards.
//!
//! Every wait is bounded; a wait that runs out fails with the last value
//! it observed.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use edgeval_converge::{poll_until, ConvergeError, Convergence, PollPolicy};
use edgeval_id::{EdgeId, EdgeStatusId, ResourceId};
use edgeval_release::Version;
use futures_util::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, BackendError};
use crate::client::{ControlPlane, ControlPlaneError, OperationResponse, Resource};

/// Capability an operational engine must advertise.
pub const JOB_PULL_CAPABILITY: &str = "NUVLA_JOB_PULL";

/// Driver errors.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("timeout after {elapsed:?} waiting for {waiting_for} (last observed: {last_observed})")]
    Timeout {
        waiting_for: String,
        elapsed: Duration,
        last_observed: String,
    },

    #[error("capabilities missing after {elapsed:?}: {missing:?}")]
    MissingCapabilities {
        missing: Vec<String>,
        elapsed: Duration,
    },

    #[error("device did not restart within {timeout:?} (up time before: {initial}s, last observed: {last_observed:?})")]
    RebootTimeout {
        initial: f64,
        last_observed: Option<f64>,
        timeout: Duration,
    },

    #[error("job {job} ended in state {state}")]
    JobFailed { job: String, state: String },

    #[error("validation check failed: {0}")]
    CheckFailed(String),
}

impl From<ConvergeError> for DriverError {
    fn from(e: ConvergeError) -> Self {
        match e {
            ConvergeError::Timeout {
                resource,
                elapsed,
                last_observed,
            } => Self::Timeout {
                waiting_for: resource,
                elapsed,
                last_observed,
            },
        }
    }
}

// =============================================================================
// Observed state
// =============================================================================

/// Lifecycle state of an edge, in the order the control plane advances it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    New,
    Activated,
    Commissioned,
    Decommissioned,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Activated => "ACTIVATED",
            Self::Commissioned => "COMMISSIONED",
            Self::Decommissioned => "DECOMMISSIONED",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(Self::New),
            "ACTIVATED" => Ok(Self::Activated),
            "COMMISSIONED" => Ok(Self::Commissioned),
            "DECOMMISSIONED" => Ok(Self::Decommissioned),
            other => Err(other.to_string()),
        }
    }
}

/// Status string reported by the engine itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunStatus(String);

impl RunStatus {
    pub const OPERATIONAL: &'static str = "OPERATIONAL";
    pub const UNKNOWN: &'static str = "UNKNOWN";

    pub fn new(status: impl Into<String>) -> Self {
        Self(status.into())
    }

    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_operational(&self) -> bool {
        self.0 == Self::OPERATIONAL
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Timing of the driver's waits.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub commission: PollPolicy,
    pub operational: PollPolicy,
    pub capabilities: PollPolicy,
    pub decommission: PollPolicy,
    pub job: PollPolicy,
    /// Interval between up time probes after a reboot.
    pub reboot_poll_interval: Duration,
    pub required_capabilities: Vec<String>,
    /// Status refresh interval requested for created edges, in seconds.
    pub refresh_interval_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            commission: PollPolicy::new(Duration::from_secs(1), Duration::from_secs(600)),
            operational: PollPolicy::new(Duration::from_secs(1), Duration::from_secs(600)),
            capabilities: PollPolicy::new(Duration::from_secs(5), Duration::from_secs(180)),
            decommission: PollPolicy::new(Duration::from_secs(1), Duration::from_secs(300)),
            job: PollPolicy::new(Duration::from_secs(3), Duration::from_secs(180)),
            reboot_poll_interval: Duration::from_secs(5),
            required_capabilities: vec![JOB_PULL_CAPABILITY.to_string()],
            refresh_interval_secs: 30,
        }
    }
}

/// Drives edges through their lifecycle on the control plane.
pub struct LifecycleDriver {
    control_plane: Arc<dyn ControlPlane>,
    config: DriverConfig,
    history: Mutex<Vec<LifecycleState>>,
}

impl LifecycleDriver {
    pub fn new(control_plane: Arc<dyn ControlPlane>, config: DriverConfig) -> Self {
        Self {
            control_plane,
            config,
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn control_plane(&self) -> &dyn ControlPlane {
        self.control_plane.as_ref()
    }

    /// Every lifecycle state observed so far, in order.
    pub fn history(&self) -> Vec<LifecycleState> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, state: LifecycleState) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(state);
    }

    /// Register a new edge for the device `alias`.
    pub async fn create_edge(&self, alias: &str) -> Result<EdgeId, DriverError> {
        let body = json!({
            "name": format!("[{alias}] Validation"),
            "refresh-interval": self.config.refresh_interval_secs,
            "tags": ["nuvlaedge.validation=True", "cli.created=True"],
            "version": 2,
        });
        let id = self.control_plane.add(EdgeId::COLLECTION, &body).await?;
        let edge = EdgeId::parse(&id.to_string()).map_err(ControlPlaneError::from)?;
        info!(edge = %edge, device = %alias, "Edge created");
        Ok(edge)
    }

    async fn edge(&self, edge: EdgeId) -> Result<Resource, DriverError> {
        Ok(self.control_plane.get(&edge.to_resource_id(), None).await?)
    }

    /// Current lifecycle state, recorded in the history.
    pub async fn edge_state(&self, edge: EdgeId) -> Result<Option<LifecycleState>, DriverError> {
        let resource = self.edge(edge).await?;
        let state = resource.state().and_then(|s| s.parse().ok());
        if let Some(state) = state {
            self.record(state);
        }
        Ok(state)
    }

    /// Status resource of the edge, once the engine created it.
    async fn status_resource(&self, edge: EdgeId) -> Result<Resource, DriverError> {
        let resource = self.edge(edge).await?;
        let status_id = resource
            .status_resource()
            .ok_or_else(|| ControlPlaneError::MissingField {
                resource: edge.to_string(),
                field: "nuvlabox-status".to_string(),
            })?;
        let status_id = EdgeStatusId::parse(status_id).map_err(ControlPlaneError::from)?;
        Ok(self
            .control_plane
            .get(&status_id.to_resource_id(), None)
            .await?)
    }

    /// Engine status; `UNKNOWN` when it cannot be read.
    pub async fn run_status(&self, edge: EdgeId) -> RunStatus {
        match self.status_resource(edge).await {
            Ok(resource) => resource
                .status()
                .map(RunStatus::new)
                .unwrap_or_else(RunStatus::unknown),
            Err(e) => {
                debug!(edge = %edge, error = %e, "Status not readable");
                RunStatus::unknown()
            }
        }
    }

    /// Lifecycle state and engine status.
    pub async fn edge_status(
        &self,
        edge: EdgeId,
    ) -> Result<(Option<LifecycleState>, RunStatus), DriverError> {
        let state = self.edge_state(edge).await?;
        Ok((state, self.run_status(edge).await))
    }

    /// Start the engine and wait until the control plane reports the edge
    /// COMMISSIONED. ACTIVATED alone is not enough.
    pub async fn wait_for_commissioned(
        &self,
        backend: &mut Backend,
        edge: EdgeId,
        remove_existing: bool,
        extra_env: Option<&BTreeMap<String, String>>,
    ) -> Result<(), DriverError> {
        backend.start_engine(edge, remove_existing, extra_env).await?;

        info!(edge = %edge, "Waiting for edge to be commissioned");
        poll_until("edge commissioned", self.config.commission, || async move {
            match self.edge_state(edge).await {
                Ok(Some(LifecycleState::Commissioned)) => Convergence::Converged(()),
                Ok(Some(state)) => Convergence::Pending(state.to_string()),
                Ok(None) => Convergence::Pending("no state".to_string()),
                Err(e) => Convergence::Pending(e.to_string()),
            }
        })
        .await?;

        info!(edge = %edge, "Edge commissioned");
        Ok(())
    }

    /// Wait for an OPERATIONAL status, then for the required capabilities.
    pub async fn wait_for_operational(&self, edge: EdgeId) -> Result<(), DriverError> {
        info!(edge = %edge, "Waiting for engine to be operational");
        poll_until("engine operational", self.config.operational, || async move {
            let status = self.run_status(edge).await;
            if status.is_operational() {
                Convergence::Converged(())
            } else {
                Convergence::Pending(status.to_string())
            }
        })
        .await?;

        self.wait_for_capabilities(edge, &self.config.required_capabilities)
            .await
    }

    /// Wait until the edge advertises every capability in `required`.
    pub async fn wait_for_capabilities(
        &self,
        edge: EdgeId,
        required: &[String],
    ) -> Result<(), DriverError> {
        let started = Instant::now();
        let last_missing: Mutex<Option<Vec<String>>> = Mutex::new(None);
        let result = poll_until("edge capabilities", self.config.capabilities, || {
            let last_missing = &last_missing;
            async move {
                let present = match self.edge(edge).await {
                    Ok(resource) => resource.capabilities(),
                    Err(e) => return Convergence::Pending(e.to_string()),
                };
                let missing: Vec<String> = required
                    .iter()
                    .filter(|c| !present.contains(c))
                    .cloned()
                    .collect();
                if missing.is_empty() {
                    Convergence::Converged(())
                } else {
                    let observed = missing.join(",");
                    *last_missing.lock().unwrap_or_else(PoisonError::into_inner) = Some(missing);
                    Convergence::Pending(observed)
                }
            }
        })
        .await;

        match result {
            Ok(()) => {
                info!(edge = %edge, "Required capabilities present");
                Ok(())
            }
            Err(e) => {
                // Never read successfully: nothing required was confirmed
                let missing = last_missing
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                    .unwrap_or_else(|| required.to_vec());
                warn!(edge = %edge, last_observed = %e.last_observed(), ?missing, "Capabilities missing");
                Err(DriverError::MissingCapabilities {
                    missing,
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    /// Wait for the device's up time counter to reset after a reboot trigger.
    ///
    /// Returns the first up time observed below `initial_up_time`.
    pub async fn wait_for_reboot_recovery(
        &self,
        backend: &Backend,
        initial_up_time: f64,
    ) -> Result<f64, DriverError> {
        let policy = PollPolicy::new(self.config.reboot_poll_interval, backend.reboot_timeout())
            .with_initial_delay(backend.reboot_grace());
        let last_seen: Mutex<Option<f64>> = Mutex::new(None);

        info!(initial_up_time, timeout = ?policy.timeout, "Waiting for device to restart");
        let result = poll_until("device restart", policy, || {
            let last_seen = &last_seen;
            async move {
                match backend.get_system_up_time().await {
                    Ok(up) if up < initial_up_time => Convergence::Converged(up),
                    Ok(up) => {
                        *last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Some(up);
                        Convergence::Pending(up.to_string())
                    }
                    Err(e) => Convergence::Pending(format!("unreachable: {e}")),
                }
            }
        })
        .await;

        match result {
            Ok(up) => {
                info!(up_time = up, "Device restarted");
                Ok(up)
            }
            Err(_) => Err(DriverError::RebootTimeout {
                initial: initial_up_time,
                last_observed: *last_seen.lock().unwrap_or_else(PoisonError::into_inner),
                timeout: backend.reboot_timeout(),
            }),
        }
    }

    /// Invoke a named operation on the edge.
    pub async fn trigger_operation(
        &self,
        edge: EdgeId,
        name: &str,
        payload: Option<&Value>,
    ) -> Result<OperationResponse, DriverError> {
        info!(edge = %edge, operation = name, "Triggering operation");
        Ok(self
            .control_plane
            .operation(&edge.to_resource_id(), name, payload)
            .await?)
    }

    /// Ask the control plane to reboot the device; returns the job.
    pub async fn trigger_reboot_operation(&self, edge: EdgeId) -> Result<ResourceId, DriverError> {
        let response = self.trigger_operation(edge, "reboot", None).await?;
        response.job().ok_or_else(|| {
            DriverError::from(ControlPlaneError::MissingField {
                resource: edge.to_string(),
                field: "location".to_string(),
            })
        })
    }

    /// Wait for a job to reach SUCCESS. A FAILED job ends the wait early.
    pub async fn wait_for_job_success(&self, job: &ResourceId) -> Result<(), DriverError> {
        info!(job = %job, "Waiting for job");
        let outcome = poll_until("job success", self.config.job, || async move {
            match self.control_plane.get(job, Some(&["state"][..])).await {
                Ok(resource) => match resource.state() {
                    Some("SUCCESS") => Convergence::Converged(Ok(())),
                    Some(state @ ("FAILED" | "CANCELED")) => {
                        Convergence::Converged(Err(state.to_string()))
                    }
                    Some(state) => Convergence::Pending(state.to_string()),
                    None => Convergence::Pending("no state".to_string()),
                },
                Err(e) => Convergence::Pending(e.to_string()),
            }
        })
        .await?;

        outcome.map_err(|state| DriverError::JobFailed {
            job: job.to_string(),
            state,
        })
    }

    /// Fraction of samples reporting the edge online over `duration`.
    pub async fn sample_online(
        &self,
        edge: EdgeId,
        duration: Duration,
        interval: Duration,
    ) -> Result<f64, DriverError> {
        let deadline = Instant::now() + duration;
        let (mut online, mut total) = (0u32, 0u32);
        loop {
            let resource = self.edge(edge).await?;
            total += 1;
            if resource.online() == Some(true) {
                online += 1;
            }
            if Instant::now() + interval > deadline {
                break;
            }
            tokio::time::sleep(interval).await;
        }
        debug!(edge = %edge, online, total, "Online samples");
        Ok(f64::from(online) / f64::from(total))
    }

    /// Engine version reported in the edge's status.
    pub async fn engine_version(&self, edge: EdgeId) -> Result<Option<Version>, DriverError> {
        let status = self.status_resource(edge).await?;
        Ok(status.engine_version().and_then(|v| v.parse().ok()))
    }

    /// Installation parameters reported in the edge's status.
    pub async fn installation_parameters(&self, edge: EdgeId) -> Result<Option<Value>, DriverError> {
        let status = self.status_resource(edge).await?;
        Ok(status.installation_parameters().cloned())
    }

    /// Decommission the edge if needed, wait for it, then delete it.
    pub async fn decommission_and_delete(&self, edge: EdgeId) -> Result<(), DriverError> {
        let state = self.edge_state(edge).await?;
        if matches!(
            state,
            Some(LifecycleState::Commissioned | LifecycleState::Activated)
        ) {
            self.trigger_operation(edge, "decommission", None).await?;
            poll_until("edge decommissioned", self.config.decommission, || async move {
                match self.edge_state(edge).await {
                    Ok(Some(LifecycleState::Decommissioned | LifecycleState::New)) => {
                        Convergence::Converged(())
                    }
                    Ok(state) => Convergence::Pending(format!("{state:?}")),
                    Err(e) => Convergence::Pending(e.to_string()),
                }
            })
            .await?;
        }

        self.control_plane.delete(&edge.to_resource_id()).await?;
        info!(edge = %edge, "Edge deleted");
        Ok(())
    }

    /// Best-effort cleanup: logs, purge, decommission, delete.
    pub async fn teardown(&self, backend: &mut Backend, edge: EdgeId, collect_logs: bool) {
        info!(edge = %edge, collect_logs, "Tearing down");

        if collect_logs {
            let logs = backend.get_engine_logs().await;
            if !logs.failed.is_empty() {
                warn!(failed = ?logs.failed, "Some engine logs could not be collected");
            }
        }

        backend.purge_engine(Some(edge)).await;

        if let Err(e) = self.decommission_and_delete(edge).await {
            error!(edge = %edge, error = %e, "Removing the edge failed");
        }
    }
}

// =============================================================================
// Validation run
// =============================================================================

/// An edge created for one validation, with guaranteed cleanup.
pub struct ValidationRun {
    driver: LifecycleDriver,
    backend: Backend,
    edge: EdgeId,
    retrieve_logs: bool,
    torn_down: bool,
}

impl ValidationRun {
    /// Register a new edge for the backend's device.
    pub async fn setup(
        driver: LifecycleDriver,
        backend: Backend,
        retrieve_logs: bool,
    ) -> Result<Self, DriverError> {
        let edge = driver.create_edge(&backend.host().device().alias).await?;
        Ok(Self::new(driver, backend, edge, retrieve_logs))
    }

    pub fn new(driver: LifecycleDriver, backend: Backend, edge: EdgeId, retrieve_logs: bool) -> Self {
        Self {
            driver,
            backend,
            edge,
            retrieve_logs,
            torn_down: false,
        }
    }

    pub fn edge(&self) -> EdgeId {
        self.edge
    }

    pub fn driver(&self) -> &LifecycleDriver {
        &self.driver
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Driver, backend and edge at once.
    pub fn parts(&mut self) -> (&LifecycleDriver, &mut Backend, EdgeId) {
        (&self.driver, &mut self.backend, self.edge)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Run `body`, then tear down whatever it returned.
    ///
    /// Teardown failures are logged; the body's result is returned as is.
    /// A panicking body is torn down as a failure, then the panic resumes.
    pub async fn execute<T, F>(mut self, body: F) -> Result<T, DriverError>
    where
        F: for<'r> FnOnce(&'r mut ValidationRun) -> BoxFuture<'r, Result<T, DriverError>>,
    {
        let outcome = AssertUnwindSafe(body(&mut self)).catch_unwind().await;
        match outcome {
            Ok(result) => {
                if let Err(e) = &result {
                    error!(edge = %self.edge, error = %e, "Validation failed");
                }
                self.teardown(result.is_err()).await;
                result
            }
            Err(panic) => {
                error!(edge = %self.edge, "Validation panicked");
                self.teardown(true).await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Clean up the edge. Runs at most once; later calls do nothing.
    pub async fn teardown(&mut self, failed: bool) {
        if self.torn_down {
            debug!(edge = %self.edge, "Already torn down");
            return;
        }
        self.torn_down = true;

        let collect_logs = failed || self.retrieve_logs;
        self.driver
            .teardown(&mut self.backend, self.edge, collect_logs)
            .await;
    }
}

impl Drop for ValidationRun {
    fn drop(&mut self) {
        if !self.torn_down {
            warn!(edge = %self.edge, "Validation run dropped without teardown");
        }
    }
}
