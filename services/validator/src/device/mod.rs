//! Remote target devices.
//!
//! A [`RemoteHost`] executes commands on one device. Every operation opens
//! its own session through a [`Transport`] and closes it before returning,
//! so a connection dropped during a long operation (a reboot, a flaky link)
//! never leaves shared state behind.

mod command;
mod mock;
mod ssh;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::DeviceConfig;

pub use command::{quote, quote_path, RemoteCommand, SUDO_PROMPT};
pub use mock::{MockReply, MockTransport};
pub use ssh::{SshOptions, SshTransport};

/// Folder holding everything a validation run puts on a device.
pub const VALIDATION_ROOT: &str = ".nuvlaedge_validation";

/// Remote temp folder used while collecting logs.
pub const REMOTE_LOG_DIR: &str = "/tmp/nuvlaedge_validation_logs";

/// Remote transport errors.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("cannot connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("connection to {address} lost")]
    Disconnected { address: String },

    #[error("i/o error talking to remote host: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer of {path} failed: {reason}")]
    Transfer { path: String, reason: String },

    #[error("cannot parse output of `{command}`: {reason}")]
    Parse { command: String, reason: String },

    #[error("{address} closed the connection, device is restarting")]
    Rebooted { address: String },
}

impl RemoteError {
    /// True if the session went away mid-command.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Disconnected { .. } | Self::Rebooted { .. })
    }
}

/// Outcome of a remote command. A non-zero exit is data, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    /// Successful result with the given output.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed result with the given exit code and error output.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Non-empty trimmed stdout lines.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().map(str::trim).filter(|l| !l.is_empty())
    }
}

static SUDO_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[sudo\] password.*?").expect("sudo prompt pattern is valid"));

/// Answers an interactive prompt seen on stderr by writing to stdin.
#[derive(Debug, Clone)]
pub struct Responder {
    pub pattern: Regex,
    pub response: String,
}

impl Responder {
    /// Responder for the `sudo` password prompt.
    pub fn sudo(password: &str) -> Self {
        Self {
            pattern: SUDO_PATTERN.clone(),
            response: format!("{password}\n"),
        }
    }

    /// Returns true if `output` contains the prompt.
    pub fn matches(&self, output: &str) -> bool {
        self.pattern.is_match(output)
    }
}

/// One open connection to a device.
#[async_trait]
pub trait Session: Send {
    /// Run a command; `responder` answers prompts of privileged commands.
    async fn run(
        &mut self,
        command: &RemoteCommand,
        responder: Option<&Responder>,
    ) -> Result<CommandResult, RemoteError>;

    /// Copy a local file to the device.
    async fn put(&mut self, local: &Path, remote: &str) -> Result<(), RemoteError>;

    /// Copy a file from the device.
    async fn get(&mut self, remote: &str, local: &Path) -> Result<(), RemoteError>;

    /// Release the connection.
    async fn close(self: Box<Self>) -> Result<(), RemoteError>;
}

/// Opens sessions to a device.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Session>, RemoteError>;
}

/// A container as listed by `docker ps`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContainerRecord {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "Names")]
    pub names: String,
}

const CONTAINER_FORMAT: &str = r#"{"ID":"{{ .ID }}","Image":"{{ .Image }}","Names":"{{ .Names }}"}"#;

/// Parse JSON-lines `docker ps` output.
pub fn parse_container_lines(command: &str, output: &str) -> Result<Vec<ContainerRecord>, RemoteError> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| RemoteError::Parse {
                command: command.to_string(),
                reason: format!("{e} in line '{line}'"),
            })
        })
        .collect()
}

/// A target device reached through a [`Transport`].
///
/// Cloning is cheap; clones share the transport and cached facts but open
/// their own sessions.
#[derive(Clone)]
pub struct RemoteHost {
    transport: Arc<dyn Transport>,
    device: Arc<DeviceConfig>,
    responder: Responder,
    hostname: Arc<OnceCell<String>>,
    home: Arc<OnceCell<String>>,
}

impl std::fmt::Debug for RemoteHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHost")
            .field("alias", &self.device.alias)
            .field("address", &self.device.address)
            .finish_non_exhaustive()
    }
}

impl RemoteHost {
    pub fn new(device: DeviceConfig, transport: Arc<dyn Transport>) -> Self {
        let responder = Responder::sudo(device.sudo_password());
        Self {
            transport,
            device: Arc::new(device),
            responder,
            hostname: Arc::new(OnceCell::new()),
            home: Arc::new(OnceCell::new()),
        }
    }

    /// Host reached with the system OpenSSH client.
    pub fn over_ssh(device: DeviceConfig, options: SshOptions) -> Self {
        let transport = SshTransport::new(&device, options);
        Self::new(device, Arc::new(transport))
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }

    pub fn address(&self) -> &str {
        &self.device.address
    }

    /// Open a session. The caller owns it and must close it.
    pub async fn connect(&self) -> Result<Box<dyn Session>, RemoteError> {
        self.transport.connect().await
    }

    async fn release(&self, session: Box<dyn Session>) {
        if let Err(e) = session.close().await {
            debug!(address = %self.address(), error = %e, "Closing session failed");
        }
    }

    /// Check that the device answers a trivial command.
    ///
    /// Connection failures give `Ok(false)`. A connection the device closed
    /// mid-command gives `Err(RemoteError::Rebooted)` so callers polling
    /// through a restart can tell it apart.
    pub async fn is_reachable(&self, silent: bool) -> Result<bool, RemoteError> {
        match self.run_command("hostname").await {
            Ok(result) => {
                if !silent {
                    info!(address = %self.address(), host = %result.stdout.trim(), "Device reachable");
                }
                Ok(result.success())
            }
            Err(e @ RemoteError::Rebooted { .. }) => Err(e),
            Err(e) => {
                if !silent {
                    warn!(address = %self.address(), error = %e, "Device not reachable");
                }
                Ok(false)
            }
        }
    }

    /// Run a fully specified command in a fresh session.
    pub async fn execute(&self, command: &RemoteCommand) -> Result<CommandResult, RemoteError> {
        debug!(
            address = %self.address(),
            command = %command.command,
            privileged = command.privileged,
            dir = ?command.dir,
            "Running remote command"
        );

        let mut session = self.connect().await?;
        let responder = command.privileged.then_some(&self.responder);
        let result = session.run(command, responder).await;
        self.release(session).await;

        if let Ok(r) = &result {
            if !r.success() {
                debug!(
                    address = %self.address(),
                    command = %command.command,
                    exit_code = r.exit_code,
                    stderr = %r.stderr.trim(),
                    "Remote command failed"
                );
            }
        }
        result
    }

    pub async fn run_command(&self, command: &str) -> Result<CommandResult, RemoteError> {
        self.execute(&RemoteCommand::new(command)).await
    }

    pub async fn run_command_with_env(
        &self,
        command: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<CommandResult, RemoteError> {
        self.execute(&RemoteCommand::new(command).with_env(env)).await
    }

    pub async fn run_privileged(&self, command: &str) -> Result<CommandResult, RemoteError> {
        self.execute(&RemoteCommand::new(command).privileged()).await
    }

    /// Run a command with `dir` as working directory, for this call only.
    pub async fn run_command_in_directory(
        &self,
        command: &str,
        dir: &str,
        env: Option<&BTreeMap<String, String>>,
    ) -> Result<CommandResult, RemoteError> {
        let mut cmd = RemoteCommand::new(command).in_dir(dir);
        if let Some(env) = env {
            cmd = cmd.with_env(env);
        }
        self.execute(&cmd).await
    }

    /// Fetch `url` on the device with bounded retries. Never fails; returns
    /// false when every attempt failed.
    pub async fn download_file(&self, url: &str, dir: &str, name: &str) -> bool {
        let command = format!(
            "wget {} -t 3 -T 5 -O {}/{}",
            quote(url),
            quote_path(dir),
            quote(name)
        );
        match self.run_command(&command).await {
            Ok(result) if result.success() => true,
            Ok(result) => {
                warn!(url, exit_code = result.exit_code, "Download failed on device");
                false
            }
            Err(e) => {
                warn!(url, error = %e, "Download failed on device");
                false
            }
        }
    }

    /// Copy a local file to the device.
    pub async fn send_file(&self, local: &Path, remote: &str) -> Result<(), RemoteError> {
        debug!(address = %self.address(), local = %local.display(), remote, "Sending file");
        let mut session = self.connect().await?;
        let result = session.put(local, remote).await;
        self.release(session).await;
        result
    }

    /// Copy a file from the device.
    pub async fn fetch_remote_file(&self, remote: &str, local: &Path) -> Result<(), RemoteError> {
        debug!(address = %self.address(), remote, local = %local.display(), "Fetching file");
        let mut session = self.connect().await?;
        let result = session.get(remote, local).await;
        self.release(session).await;
        result
    }

    /// Containers currently running, optionally narrowed by a `docker ps` filter.
    pub async fn list_running_containers(
        &self,
        filter: Option<&str>,
    ) -> Result<Vec<ContainerRecord>, RemoteError> {
        self.list_containers(filter, false).await
    }

    /// Containers listed by `docker ps`, stopped ones included when `all` is set.
    pub async fn list_containers(
        &self,
        filter: Option<&str>,
        all: bool,
    ) -> Result<Vec<ContainerRecord>, RemoteError> {
        let mut command = String::from("docker ps");
        if all {
            command.push_str(" -a");
        }
        if let Some(filter) = filter {
            command.push_str(&format!(" --filter {}", quote(filter)));
        }
        command.push_str(&format!(" --format {}", quote(CONTAINER_FORMAT)));

        let result = self.run_command(&command).await?;
        if !result.success() {
            return Err(RemoteError::Parse {
                command,
                reason: format!("exit code {}: {}", result.exit_code, result.stderr.trim()),
            });
        }
        parse_container_lines(&command, &result.stdout)
    }

    /// Hostname as reported by the device, resolved once.
    pub async fn hostname(&self) -> Result<String, RemoteError> {
        self.hostname
            .get_or_try_init(|| async { self.read_fact("hostname").await })
            .await
            .cloned()
    }

    /// Home directory of the login user, resolved once.
    pub async fn home_dir(&self) -> Result<String, RemoteError> {
        self.home
            .get_or_try_init(|| async { self.read_fact("echo $HOME").await })
            .await
            .cloned()
    }

    /// Absolute path of the validation folder on the device.
    pub async fn validation_root(&self) -> Result<String, RemoteError> {
        let home = self.home_dir().await?;
        Ok(format!("{}/{VALIDATION_ROOT}", home.trim_end_matches('/')))
    }

    async fn read_fact(&self, command: &str) -> Result<String, RemoteError> {
        let result = self.run_command(command).await?;
        let value = result.stdout.trim();
        if !result.success() || value.is_empty() {
            return Err(RemoteError::Parse {
                command: command.to_string(),
                reason: format!("no output (exit code {})", result.exit_code),
            });
        }
        Ok(value.to_string())
    }

    /// Create the validation folder layout. Failures are logged only.
    pub async fn build_directory_tree(&self) {
        let command = format!("mkdir -p ~/{VALIDATION_ROOT}/deployer ~/{VALIDATION_ROOT}/engines");
        match self.run_command(&command).await {
            Ok(result) if result.success() => {}
            Ok(result) => warn!(stderr = %result.stderr.trim(), "Could not create validation folders"),
            Err(e) => warn!(error = %e, "Could not create validation folders"),
        }
    }
}
