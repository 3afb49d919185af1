//! Shell rendering for remote commands.

use std::collections::BTreeMap;

/// Prompt passed to `sudo -p`; matched by the default responder.
pub const SUDO_PROMPT: &str = "[sudo] password: ";

/// A command to run on a remote device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteCommand {
    /// The shell command line, as typed.
    pub command: String,

    /// Variables exported before the command runs.
    pub env: BTreeMap<String, String>,

    /// Working directory for this command only.
    pub dir: Option<String>,

    /// Run through `sudo`, answering the password prompt.
    pub privileged: bool,
}

impl RemoteCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    #[must_use]
    pub fn with_env(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    #[must_use]
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Render to a single POSIX shell line.
    ///
    /// Privileged commands wrap the whole script (exports included) in
    /// `sudo -S sh -c`, since sudo resets the caller's environment.
    pub fn render(&self) -> String {
        let mut script = String::new();
        for (key, value) in &self.env {
            script.push_str(&format!("export {key}={}; ", quote(value)));
        }
        if let Some(dir) = &self.dir {
            script.push_str(&format!("cd {} && ", quote_path(dir)));
        }
        script.push_str(&self.command);

        if self.privileged {
            format!("sudo -S -p {} sh -c {}", quote(SUDO_PROMPT), quote(&script))
        } else {
            script
        }
    }
}

/// Single-quote a value for a POSIX shell.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Quote a path, leaving a leading `~/` outside the quotes so it still expands.
pub fn quote_path(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => format!("~/{}", quote(rest)),
        None => quote(path),
    }
}
