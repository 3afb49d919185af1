//! Transport over the system OpenSSH client.
//!
//! `connect` starts a control master (`ssh -M -N -S <socket>`); commands and
//! copies in the session are multiplexed over its socket. The master is
//! killed when the session is dropped, so a session is released on every
//! exit path even if `close` is never reached.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use edgeval_id::Uuid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{CommandResult, RemoteCommand, RemoteError, Responder, Session, Transport};
use crate::config::DeviceConfig;

/// OpenSSH client settings.
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// Connect timeout passed to `ssh`.
    pub connect_timeout: Duration,

    /// Folder for control sockets. Keep the path short; sockets have a
    /// length limit.
    pub control_dir: PathBuf,

    /// Upper bound for a graceful master shutdown.
    pub close_timeout: Duration,

    pub ssh_binary: String,
    pub scp_binary: String,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            control_dir: std::env::temp_dir(),
            close_timeout: Duration::from_secs(5),
            ssh_binary: "ssh".to_string(),
            scp_binary: "scp".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct SshTarget {
    user: String,
    address: String,
    port: u16,
    identity: Option<PathBuf>,
    password: Option<String>,
}

impl SshTarget {
    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }
}

/// Sessions through the system `ssh` binary.
pub struct SshTransport {
    target: SshTarget,
    options: SshOptions,
}

impl SshTransport {
    pub fn new(device: &DeviceConfig, options: SshOptions) -> Self {
        Self {
            target: SshTarget {
                user: device.user.clone(),
                address: device.address.clone(),
                port: device.port,
                identity: device.private_key_path.as_deref().map(expand_home),
                password: device.password.clone(),
            },
            options,
        }
    }

    /// `ssh`, wrapped in `sshpass -e` when only a password is known.
    fn master_command(&self) -> Command {
        match (&self.target.identity, &self.target.password) {
            (None, Some(password)) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg(&self.options.ssh_binary).env("SSHPASS", password);
                cmd
            }
            _ => Command::new(&self.options.ssh_binary),
        }
    }

    fn connection_args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.target.port.to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
        ];
        if let Some(identity) = &self.target.identity {
            args.extend([
                "-i".to_string(),
                identity.display().to_string(),
                "-o".to_string(),
                "IdentitiesOnly=yes".to_string(),
                "-o".to_string(),
                "BatchMode=yes".to_string(),
            ]);
        } else if self.target.password.is_none() {
            args.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
        }
        args
    }

    fn connect_error(&self, reason: impl Into<String>) -> RemoteError {
        RemoteError::Connect {
            address: self.target.address.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&self) -> Result<Box<dyn Session>, RemoteError> {
        let socket = self
            .options
            .control_dir
            .join(format!("edgeval-{}.sock", Uuid::new_v4().simple()));

        let mut master = self
            .master_command()
            .arg("-M")
            .arg("-N")
            .arg("-S")
            .arg(&socket)
            .args(self.connection_args())
            .arg(self.target.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.connect_error(format!("cannot spawn ssh: {e}")))?;

        // Wait for the control socket to appear
        let deadline =
            tokio::time::Instant::now() + self.options.connect_timeout + Duration::from_secs(5);
        while !socket.exists() {
            if let Some(status) = master.try_wait()? {
                let mut stderr = String::new();
                if let Some(mut pipe) = master.stderr.take() {
                    pipe.read_to_string(&mut stderr).await.ok();
                }
                return Err(self.connect_error(format!("ssh exited with {status}: {}", stderr.trim())));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(self.connect_error("control socket did not appear"));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        debug!(address = %self.target.address, socket = %socket.display(), "SSH session opened");

        Ok(Box::new(SshSession {
            target: self.target.clone(),
            options: self.options.clone(),
            socket,
            master,
        }))
    }
}

struct SshSession {
    target: SshTarget,
    options: SshOptions,
    socket: PathBuf,
    master: Child,
}

impl SshSession {
    fn client(&self) -> Command {
        let mut cmd = Command::new(&self.options.ssh_binary);
        cmd.arg("-S")
            .arg(&self.socket)
            .arg("-o")
            .arg("ControlMaster=no")
            .arg("-p")
            .arg(self.target.port.to_string());
        cmd
    }

    fn scp(&self) -> Command {
        let mut cmd = Command::new(&self.options.scp_binary);
        cmd.arg("-q")
            .arg("-o")
            .arg(format!("ControlPath={}", self.socket.display()))
            .arg("-P")
            .arg(self.target.port.to_string());
        cmd
    }

    fn classify_exit(&self, stderr: &str) -> RemoteError {
        let address = self.target.address.clone();
        let lowered = stderr.to_ascii_lowercase();
        if lowered.contains("closed by remote host")
            || lowered.contains("connection reset")
            || lowered.contains("broken pipe")
        {
            RemoteError::Rebooted { address }
        } else {
            RemoteError::Disconnected { address }
        }
    }

    async fn copy(&self, mut cmd: Command, path: &str) -> Result<(), RemoteError> {
        let output = cmd.stdin(Stdio::null()).kill_on_drop(true).output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(RemoteError::Transfer {
                path: path.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl Session for SshSession {
    async fn run(
        &mut self,
        command: &RemoteCommand,
        responder: Option<&Responder>,
    ) -> Result<CommandResult, RemoteError> {
        let mut child = self
            .client()
            .arg(self.target.destination())
            .arg("--")
            .arg(command.render())
            .stdin(if responder.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child.stdin.take();
        let mut stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::other("ssh stdout was not captured")
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| {
            std::io::Error::other("ssh stderr was not captured")
        })?;

        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await.map(|_| buf)
        });

        // Watch stderr for prompts until the remote side closes it
        let mut err_buf = Vec::new();
        let mut answered = 0usize;
        let mut chunk = [0u8; 1024];
        loop {
            let n = stderr.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            err_buf.extend_from_slice(&chunk[..n]);

            if let (Some(responder), Some(pipe)) = (responder, stdin.as_mut()) {
                let pending = String::from_utf8_lossy(&err_buf[answered..]);
                if responder.matches(&pending) {
                    pipe.write_all(responder.response.as_bytes()).await?;
                    pipe.flush().await?;
                    answered = err_buf.len();
                }
            }
        }
        drop(stdin);

        let status = child.wait().await?;
        let out_buf = stdout_task.await.map_err(std::io::Error::other)??;
        let stderr = String::from_utf8_lossy(&err_buf).into_owned();

        let exit_code = status.code().unwrap_or(-1);
        // ssh reports its own failures as 255, so a remote command exiting
        // 255 is also classified as a disconnect.
        if exit_code == 255 {
            return Err(self.classify_exit(&stderr));
        }

        Ok(CommandResult {
            exit_code,
            stdout: String::from_utf8_lossy(&out_buf).into_owned(),
            stderr,
        })
    }

    async fn put(&mut self, local: &Path, remote: &str) -> Result<(), RemoteError> {
        let mut cmd = self.scp();
        cmd.arg(local)
            .arg(format!("{}:{remote}", self.target.destination()));
        self.copy(cmd, remote).await
    }

    async fn get(&mut self, remote: &str, local: &Path) -> Result<(), RemoteError> {
        let mut cmd = self.scp();
        cmd.arg(format!("{}:{remote}", self.target.destination()))
            .arg(local);
        self.copy(cmd, remote).await
    }

    async fn close(mut self: Box<Self>) -> Result<(), RemoteError> {
        let exit = self
            .client()
            .arg("-O")
            .arg("exit")
            .arg(self.target.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = exit {
            debug!(error = %e, "Control master exit request failed");
        }

        match tokio::time::timeout(self.options.close_timeout, self.master.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(address = %self.target.address, "Control master did not exit, killing it");
                self.master.start_kill().ok();
            }
        }
        Ok(())
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if self.socket.exists() {
            std::fs::remove_file(&self.socket).ok();
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => Path::new(&home).join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(private_key: Option<&str>, password: Option<&str>) -> SshTransport {
        let mut device = DeviceConfig::new("pi-1", "10.0.0.5", "docker");
        device.private_key_path = private_key.map(str::to_string);
        device.password = password.map(str::to_string);
        SshTransport::new(&device, SshOptions::default())
    }

    #[test]
    fn test_key_auth_runs_in_batch_mode() {
        let args = transport(Some("/keys/id_ed25519"), None).connection_args();
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"/keys/id_ed25519".to_string()));
        assert!(args.contains(&"ConnectTimeout=30".to_string()));
    }

    #[test]
    fn test_password_auth_goes_through_sshpass() {
        let t = transport(None, Some("secret"));
        assert!(!t.connection_args().contains(&"BatchMode=yes".to_string()));
        let cmd = t.master_command();
        assert_eq!(cmd.as_std().get_program(), "sshpass");
    }

    #[test]
    fn test_exit_255_is_classified_by_stderr() {
        let t = transport(Some("/keys/id_ed25519"), None);
        assert!(matches!(
            t.classify_exit("Connection to 10.0.0.5 closed by remote host."),
            RemoteError::Rebooted { address } if address == "10.0.0.5"
        ));
        assert!(matches!(
            t.classify_exit("ssh: connect to host 10.0.0.5 port 22: No route to host"),
            RemoteError::Disconnected { .. }
        ));
        // A remote command exiting 255 on its own prints nothing from ssh.
        assert!(matches!(t.classify_exit(""), RemoteError::Disconnected { .. }));
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/abs/key"), PathBuf::from("/abs/key"));
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(expand_home("~/.ssh/key"), Path::new(&home).join(".ssh/key"));
        }
    }
}
