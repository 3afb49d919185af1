//! Scripted in-memory transport for tests and dry runs.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{CommandResult, RemoteCommand, RemoteError, Responder, Session, Transport};

const MOCK_ADDRESS: &str = "mock-device";

/// What a scripted command answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    Output(CommandResult),
    /// The session dies mid-command.
    Disconnect,
    /// The device closes the connection (restart in progress).
    Rebooted,
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    replies: VecDeque<MockReply>,
}

#[derive(Debug, Default)]
struct MockState {
    rules: Vec<Rule>,
    executed: Vec<RemoteCommand>,
    sent: Vec<(String, String)>,
    fetched: Vec<String>,
    failing_fetches: Vec<String>,
    files: BTreeMap<String, Vec<u8>>,
    unreachable: bool,
    latency: Duration,
}

/// Transport answering commands from substring rules.
///
/// The most recently added rule whose pattern is contained in the command
/// wins. A rule with several replies hands them out in order and repeats
/// the last one. Unmatched commands succeed with empty output. `hostname`
/// and `echo $HOME` have default answers.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    connections: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let mock = Self {
            state: Arc::new(Mutex::new(MockState::default())),
            connections: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
        };
        mock.on("hostname", "mock-device\n");
        mock.on("echo $HOME", "/home/pi\n");
        mock
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer commands containing `pattern` with `stdout`.
    pub fn on(&self, pattern: &str, stdout: &str) -> &Self {
        self.on_result(pattern, CommandResult::ok(stdout))
    }

    pub fn on_result(&self, pattern: &str, result: CommandResult) -> &Self {
        self.on_reply(pattern, MockReply::Output(result))
    }

    pub fn on_reply(&self, pattern: &str, reply: MockReply) -> &Self {
        self.on_sequence(pattern, vec![reply])
    }

    /// Answer successive matching commands with `replies`, repeating the last.
    pub fn on_sequence(&self, pattern: &str, replies: Vec<MockReply>) -> &Self {
        self.lock().rules.push(Rule {
            pattern: pattern.to_string(),
            replies: replies.into(),
        });
        self
    }

    /// Successive stdout values for matching commands.
    pub fn on_outputs(&self, pattern: &str, outputs: &[&str]) -> &Self {
        self.on_sequence(
            pattern,
            outputs
                .iter()
                .map(|o| MockReply::Output(CommandResult::ok(*o)))
                .collect(),
        )
    }

    /// Refuse every connection while set.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Delay every command by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Content served for a remote path on `get`.
    pub fn set_file(&self, remote: &str, content: &[u8]) {
        self.lock().files.insert(remote.to_string(), content.to_vec());
    }

    /// Fail fetches of remote paths containing `pattern`.
    pub fn fail_fetch(&self, pattern: &str) {
        self.lock().failing_fetches.push(pattern.to_string());
    }

    /// Every command run so far.
    pub fn executed(&self) -> Vec<RemoteCommand> {
        self.lock().executed.clone()
    }

    /// Command lines run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().executed.iter().map(|c| c.command.clone()).collect()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.lock()
            .executed
            .iter()
            .filter(|c| c.command.contains(pattern))
            .count()
    }

    /// Index of the first command containing `pattern`.
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.lock()
            .executed
            .iter()
            .position(|c| c.command.contains(pattern))
    }

    /// Remote paths successfully fetched.
    pub fn fetched(&self) -> Vec<String> {
        self.lock().fetched.clone()
    }

    /// `(local, remote)` pairs sent.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.lock().sent.clone()
    }

    /// Sessions opened so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Sessions opened and not closed.
    pub fn open_sessions(&self) -> usize {
        self.connections() - self.closed.load(Ordering::SeqCst)
    }

    fn reply_for(&self, command: &RemoteCommand) -> MockReply {
        let mut state = self.lock();
        state.executed.push(command.clone());

        let rule = state
            .rules
            .iter_mut()
            .rev()
            .find(|r| command.command.contains(&r.pattern));

        match rule {
            Some(rule) if rule.replies.len() > 1 => rule
                .replies
                .pop_front()
                .unwrap_or_else(|| MockReply::Output(CommandResult::default())),
            Some(rule) => rule
                .replies
                .front()
                .cloned()
                .unwrap_or_else(|| MockReply::Output(CommandResult::default())),
            None => MockReply::Output(CommandResult::default()),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<Box<dyn Session>, RemoteError> {
        if self.lock().unreachable {
            return Err(RemoteError::Connect {
                address: MOCK_ADDRESS.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            transport: self.clone(),
        }))
    }
}

struct MockSession {
    transport: MockTransport,
}

#[async_trait]
impl Session for MockSession {
    async fn run(
        &mut self,
        command: &RemoteCommand,
        _responder: Option<&Responder>,
    ) -> Result<CommandResult, RemoteError> {
        let latency = self.transport.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        debug!(command = %command.command, "[MOCK] Running command");
        match self.transport.reply_for(command) {
            MockReply::Output(result) => Ok(result),
            MockReply::Disconnect => Err(RemoteError::Disconnected {
                address: MOCK_ADDRESS.to_string(),
            }),
            MockReply::Rebooted => Err(RemoteError::Rebooted {
                address: MOCK_ADDRESS.to_string(),
            }),
        }
    }

    async fn put(&mut self, local: &Path, remote: &str) -> Result<(), RemoteError> {
        self.transport
            .lock()
            .sent
            .push((local.display().to_string(), remote.to_string()));
        Ok(())
    }

    async fn get(&mut self, remote: &str, local: &Path) -> Result<(), RemoteError> {
        let content = {
            let state = self.transport.lock();
            if state.failing_fetches.iter().any(|p| remote.contains(p)) {
                return Err(RemoteError::Transfer {
                    path: remote.to_string(),
                    reason: "no such file".to_string(),
                });
            }
            state
                .files
                .get(remote)
                .cloned()
                .unwrap_or_else(|| format!("[MOCK] content of {remote}\n").into_bytes())
        };

        tokio::fs::write(local, content).await?;
        self.transport.lock().fetched.push(remote.to_string());
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), RemoteError> {
        self.transport.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
