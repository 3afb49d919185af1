//! edgeval Validator
//!
//! Runs one validation of the edge engine against one device:
//!
//! - **Setup**: registers a fresh edge on the control plane
//! - **Validation**: installs the engine and waits for it to converge
//! - **Teardown**: collects logs, purges the device, removes the edge

use std::sync::Arc;

use anyhow::{Context, Result};
use edgeval_release::{GithubReleaseIndex, DEPLOYMENT_RELEASES_URL};
use edgeval_validator::backend::{Backend, BackendOptions};
use edgeval_validator::client::NuvlaClient;
use edgeval_validator::config::{DeviceConfig, RunConfig};
use edgeval_validator::device::{RemoteHost, SshOptions};
use edgeval_validator::driver::{DriverConfig, LifecycleDriver, ValidationRun};
use edgeval_validator::validations::{run_validation, Validation, ValidationSettings};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = RunConfig::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting edgeval validator");

    let device = DeviceConfig::load(&config.device_config)?;
    let validation: Validation = config
        .validation
        .parse()
        .map_err(anyhow::Error::msg)?;
    info!(
        device = %device.alias,
        address = %device.address,
        backend = %device.backend,
        validation = %validation,
        control_plane_url = %config.control_plane_url,
        "Configuration loaded"
    );

    if device.is_excluded(validation.name()) {
        warn!(device = %device.alias, validation = %validation, "Validation excluded for this device, skipping");
        return Ok(());
    }

    // Control plane session
    let client = NuvlaClient::new(&config.control_plane_url)?;
    match (&config.api_key, &config.api_secret) {
        (Some(key), Some(secret)) => client.login_api_key(key, secret).await?,
        _ => warn!("No API key configured, using an anonymous session"),
    }

    // Target device
    let host = RemoteHost::over_ssh(device, SshOptions::default());
    if !host.is_reachable(false).await.unwrap_or(false) {
        anyhow::bail!("device {} is not reachable", host.address());
    }
    host.build_directory_tree().await;

    let index = Arc::new(GithubReleaseIndex::new(DEPLOYMENT_RELEASES_URL)?);
    let mut peripherals = config.peripherals.clone();
    peripherals.extend(validation.required_peripherals());
    let options = BackendOptions::new(config.selector(), index)
        .with_peripherals(peripherals)
        .with_image_registry(config.image_registry.clone())
        .with_log_dir(&config.log_dir);
    let backend = Backend::from_device(host, options)?;

    let driver = LifecycleDriver::new(Arc::new(client), DriverConfig::default());
    let run = ValidationRun::setup(driver, backend, config.retrieve_logs)
        .await
        .context("cannot create the edge for this run")?;

    let settings = ValidationSettings::default();
    let result = run
        .execute(move |run| Box::pin(async move { run_validation(validation, run, &settings).await }))
        .await;

    match result {
        Ok(()) => {
            info!(validation = %validation, "Validation passed");
            Ok(())
        }
        Err(e) => {
            error!(validation = %validation, error = %e, "Validation failed");
            Err(e.into())
        }
    }
}
