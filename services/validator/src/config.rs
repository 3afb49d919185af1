//! Configuration for a validation run.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use edgeval_release::{ReleaseSelector, Version};
use serde::Deserialize;

/// Default sudo password of the reference devices.
const DEFAULT_SUDO_PASSWORD: &str = "pi";

/// Run configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Control-plane endpoint.
    pub control_plane_url: String,

    /// API key credentials for the control plane.
    pub api_key: Option<String>,
    pub api_secret: Option<String>,

    /// TOML file describing the target device.
    pub device_config: PathBuf,

    /// Pinned engine release.
    pub engine_version: Option<Version>,

    /// Development branch of the engine images.
    pub engine_branch: Option<String>,

    /// Branch of the deployment files.
    pub deployment_branch: Option<String>,

    /// Registry the engine images are pulled from, when not the default one.
    pub image_registry: Option<String>,

    /// Optional components deployed with the engine.
    pub peripherals: BTreeSet<String>,

    /// Collect engine logs at teardown even when the run passed.
    pub retrieve_logs: bool,

    /// Local folder receiving collected logs.
    pub log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Name of the validation to run.
    pub validation: String,
}

impl RunConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let control_plane_url = non_empty("EDGEVAL_CONTROL_PLANE_URL")
            .unwrap_or_else(|| "https://nuvla.io".to_string());

        let device_config = non_empty("EDGEVAL_DEVICE_CONFIG")
            .map(PathBuf::from)
            .context("EDGEVAL_DEVICE_CONFIG must point at a device configuration file")?;

        let engine_version = non_empty("EDGEVAL_ENGINE_VERSION")
            .map(|v| v.parse::<Version>())
            .transpose()
            .context("EDGEVAL_ENGINE_VERSION is not a valid version")?;

        let peripherals = non_empty("EDGEVAL_PERIPHERALS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let retrieve_logs = non_empty("EDGEVAL_RETRIEVE_LOGS")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let log_dir = non_empty("EDGEVAL_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("logs"));

        let log_level = non_empty("EDGEVAL_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let validation =
            non_empty("EDGEVAL_VALIDATION").unwrap_or_else(|| "standard_engine_run".to_string());

        Ok(Self {
            control_plane_url,
            api_key: non_empty("EDGEVAL_API_KEY"),
            api_secret: non_empty("EDGEVAL_API_SECRET"),
            device_config,
            engine_version,
            engine_branch: non_empty("EDGEVAL_ENGINE_BRANCH"),
            deployment_branch: non_empty("EDGEVAL_DEPLOYMENT_BRANCH"),
            image_registry: non_empty("EDGEVAL_IMAGE_REGISTRY"),
            peripherals,
            retrieve_logs,
            log_dir,
            log_level,
            validation,
        })
    }

    /// Release selection for this run.
    pub fn selector(&self) -> ReleaseSelector {
        ReleaseSelector::from_parts(
            self.engine_version,
            self.engine_branch.as_deref(),
            self.deployment_branch.as_deref(),
        )
    }
}

/// Container orchestration technology of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Single-host container engine (docker compose).
    Docker,
    /// Kubernetes cluster (k3s).
    Kubernetes,
}

impl BackendKind {
    /// Backend discriminator reported by the validator.
    pub fn coe_type(&self) -> &'static str {
        match self {
            Self::Docker => "single-host",
            Self::Kubernetes => "cluster",
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "kubernetes" | "k8s" => Ok(Self::Kubernetes),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.coe_type())
    }
}

fn default_port() -> u16 {
    22
}

/// A target device, as described by its configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceConfig {
    pub alias: String,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub hostname: Option<String>,
    pub user: String,
    /// Backend tag: `docker`, `kubernetes` or `k8s`.
    pub backend: String,
    #[serde(default)]
    pub pub_key_path: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub excluded_tests: BTreeSet<String>,
}

impl DeviceConfig {
    /// Minimal device description; the login user is `pi`.
    pub fn new(alias: &str, address: &str, backend: &str) -> Self {
        Self {
            alias: alias.to_string(),
            address: address.to_string(),
            port: default_port(),
            hostname: None,
            user: "pi".to_string(),
            backend: backend.to_string(),
            pub_key_path: None,
            private_key_path: None,
            password: None,
            excluded_tests: BTreeSet::new(),
        }
    }

    /// Read a device file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read device configuration {}", path.display()))?;
        Self::from_toml(&raw)
            .with_context(|| format!("invalid device configuration {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        if config.private_key_path.is_none() && config.password.is_none() {
            anyhow::bail!("device '{}' has neither a private key nor a password", config.alias);
        }
        Ok(config)
    }

    pub fn backend_kind(&self) -> Result<BackendKind, String> {
        self.backend.parse()
    }

    /// Password answered to `sudo` prompts.
    pub fn sudo_password(&self) -> &str {
        self.password.as_deref().unwrap_or(DEFAULT_SUDO_PASSWORD)
    }

    /// Returns true if the named validation must be skipped on this device.
    pub fn is_excluded(&self, test_name: &str) -> bool {
        self.excluded_tests.contains(test_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_run_config_defaults() {
        let config = RunConfig::from_lookup(lookup(&[("EDGEVAL_DEVICE_CONFIG", "conf/pi.toml")])).unwrap();

        assert_eq!(config.control_plane_url, "https://nuvla.io");
        assert_eq!(config.device_config, PathBuf::from("conf/pi.toml"));
        assert!(config.engine_version.is_none());
        assert!(config.peripherals.is_empty());
        assert!(!config.retrieve_logs);
        assert_eq!(config.log_level, "info");
        assert!(config.image_registry.is_none());
        assert_eq!(config.validation, "standard_engine_run");
    }

    #[test]
    fn test_run_config_full() {
        let config = RunConfig::from_lookup(lookup(&[
            ("EDGEVAL_DEVICE_CONFIG", "conf/pi.toml"),
            ("EDGEVAL_ENGINE_VERSION", "2.4.3"),
            ("EDGEVAL_ENGINE_BRANCH", "feature-x"),
            ("EDGEVAL_PERIPHERALS", "network, usb,"),
            ("EDGEVAL_RETRIEVE_LOGS", "True"),
            ("EDGEVAL_IMAGE_REGISTRY", "registry.internal:5000/"),
            ("EDGEVAL_LOG_LEVEL", "debug"),
        ]))
        .unwrap();

        assert_eq!(config.engine_version, Some(Version::new(2, 4, 3)));
        assert_eq!(
            config.peripherals.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["network", "usb"]
        );
        assert!(config.retrieve_logs);
        assert_eq!(config.image_registry.as_deref(), Some("registry.internal:5000/"));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.selector().engine_branch(), Some("feature-x"));
    }

    #[test]
    fn test_run_config_rejects_bad_version() {
        let result = RunConfig::from_lookup(lookup(&[
            ("EDGEVAL_DEVICE_CONFIG", "conf/pi.toml"),
            ("EDGEVAL_ENGINE_VERSION", "2.4"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_run_config_requires_device() {
        assert!(RunConfig::from_lookup(lookup(&[])).is_err());
    }

    #[test]
    fn test_device_config_from_toml() {
        let device = DeviceConfig::from_toml(
            r#"
            alias = "rpi4"
            address = "192.168.1.20"
            user = "pi"
            backend = "k8s"
            private_key_path = "~/.ssh/id_ed25519"
            excluded_tests = ["test_engine_reboot"]
            "#,
        )
        .unwrap();

        assert_eq!(device.port, 22);
        assert_eq!(device.backend_kind(), Ok(BackendKind::Kubernetes));
        assert!(device.is_excluded("test_engine_reboot"));
        assert!(!device.is_excluded("test_standard_engine_run"));
        assert_eq!(device.sudo_password(), "pi");
    }

    #[test]
    fn test_device_config_requires_credentials() {
        let result = DeviceConfig::from_toml(
            r#"
            alias = "rpi4"
            address = "192.168.1.20"
            user = "pi"
            backend = "docker"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("Docker".parse::<BackendKind>(), Ok(BackendKind::Docker));
        assert_eq!("kubernetes".parse::<BackendKind>(), Ok(BackendKind::Kubernetes));
        assert_eq!("podman".parse::<BackendKind>(), Err("podman".to_string()));
    }
}
