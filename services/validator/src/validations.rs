//! Validation bodies run by the binary.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use edgeval_converge::{poll_until, Convergence, PollPolicy};
use tokio::time::Instant;
use tracing::info;

use crate::driver::{DriverError, LifecycleState, ValidationRun};

/// Validations the binary knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// Commission, reach OPERATIONAL, stay commissioned for a while.
    StandardEngineRun,
    /// Reboot a commissioned device and see the engine come back.
    DeviceRestart,
    /// Deploy the network peripheral and see it registered.
    PeripheralNetwork,
}

impl Validation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StandardEngineRun => "standard_engine_run",
            Self::DeviceRestart => "device_restart",
            Self::PeripheralNetwork => "peripheral_network",
        }
    }

    /// Peripherals that must be installed for this validation.
    pub fn required_peripherals(&self) -> BTreeSet<String> {
        match self {
            Self::PeripheralNetwork => BTreeSet::from(["network".to_string()]),
            _ => BTreeSet::new(),
        }
    }
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Validation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard_engine_run" => Ok(Self::StandardEngineRun),
            "device_restart" => Ok(Self::DeviceRestart),
            "peripheral_network" => Ok(Self::PeripheralNetwork),
            other => Err(format!("unknown validation '{other}'")),
        }
    }
}

/// Timing of the validation bodies.
#[derive(Debug, Clone)]
pub struct ValidationSettings {
    /// How long a standard run watches the commissioned edge.
    pub observe_for: Duration,
    pub observe_interval: Duration,
    /// Bound for peripherals to show up on the control plane.
    pub peripheral_registration: PollPolicy,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            observe_for: Duration::from_secs(300),
            observe_interval: Duration::from_secs(5),
            peripheral_registration: PollPolicy::new(Duration::from_secs(5), Duration::from_secs(300)),
        }
    }
}

/// Run `validation` on an edge. Teardown is the caller's.
pub async fn run_validation(
    validation: Validation,
    run: &mut ValidationRun,
    settings: &ValidationSettings,
) -> Result<(), DriverError> {
    info!(validation = %validation, edge = %run.edge(), "Starting validation");
    match validation {
        Validation::StandardEngineRun => standard_engine_run(run, settings).await,
        Validation::DeviceRestart => device_restart(run).await,
        Validation::PeripheralNetwork => peripheral_network(run, settings).await,
    }
}

async fn standard_engine_run(
    run: &mut ValidationRun,
    settings: &ValidationSettings,
) -> Result<(), DriverError> {
    let (driver, backend, edge) = run.parts();

    let (initial, _) = driver.edge_status(edge).await?;
    if initial != Some(LifecycleState::New) {
        return Err(DriverError::CheckFailed(format!(
            "initial state must be NEW, got {initial:?}"
        )));
    }

    driver.wait_for_commissioned(backend, edge, true, None).await?;
    driver.wait_for_operational(edge).await?;

    info!(edge = %edge, duration = ?settings.observe_for, "Observing commissioned edge");
    let deadline = Instant::now() + settings.observe_for;
    while Instant::now() < deadline {
        let state = driver.edge_state(edge).await?;
        if !matches!(
            state,
            Some(LifecycleState::Activated | LifecycleState::Commissioned)
        ) {
            return Err(DriverError::CheckFailed(format!(
                "edge left the commissioned state: {state:?}"
            )));
        }
        tokio::time::sleep(settings.observe_interval).await;
    }

    if !backend.engine_running().await {
        return Err(DriverError::CheckFailed("engine is not running".to_string()));
    }
    Ok(())
}

async fn device_restart(run: &mut ValidationRun) -> Result<(), DriverError> {
    let (driver, backend, edge) = run.parts();

    driver.wait_for_commissioned(backend, edge, true, None).await?;
    driver.wait_for_operational(edge).await?;

    let initial = backend.get_system_up_time().await?;
    backend.restart_system().await?;
    driver.wait_for_reboot_recovery(backend, initial).await?;
    driver.wait_for_operational(edge).await
}

async fn peripheral_network(
    run: &mut ValidationRun,
    settings: &ValidationSettings,
) -> Result<(), DriverError> {
    let (driver, backend, edge) = run.parts();

    driver.wait_for_commissioned(backend, edge, true, None).await?;
    driver.wait_for_operational(edge).await?;

    let mut expected = Validation::PeripheralNetwork.required_peripherals();
    if !backend.peripherals_running(&mut expected).await {
        return Err(DriverError::CheckFailed(format!(
            "peripherals not running: {expected:?}"
        )));
    }

    let filter = format!("created-by=\"{edge}\"");
    let filter = filter.as_str();
    poll_until(
        "peripheral registration",
        settings.peripheral_registration,
        || async move {
            match driver
                .control_plane()
                .search("nuvlabox-peripheral", filter)
                .await
            {
                Ok(found) if !found.is_empty() => Convergence::Converged(found.len()),
                Ok(_) => Convergence::Pending("no peripheral".to_string()),
                Err(e) => Convergence::Pending(e.to_string()),
            }
        },
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for v in [
            Validation::StandardEngineRun,
            Validation::DeviceRestart,
            Validation::PeripheralNetwork,
        ] {
            assert_eq!(v.name().parse::<Validation>(), Ok(v));
        }
        assert!("basic_app_deployment".parse::<Validation>().is_err());
    }
}
