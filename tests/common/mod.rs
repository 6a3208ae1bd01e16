#![allow(dead_code)]

use async_trait::async_trait;
use once_cell::sync::Lazy;
use simbridge::errors::ToolError;
use simbridge::services::config::{AuthMethod, RemoteTarget};
use simbridge::services::logger::Logger;
use simbridge::services::session::{ExecOutput, SessionManager, SshSession, SshTransport};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

pub static ENV_LOCK: Lazy<AsyncMutex<()>> = Lazy::new(|| AsyncMutex::new(()));

/// Session that runs each command line through the local `sh`, which is
/// close enough to a remote login shell for quoting and exit codes.
pub struct FakeSession {
    alive: AtomicBool,
    fail_next: AtomicBool,
    lines: Mutex<Vec<String>>,
}

impl FakeSession {
    pub fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            fail_next: AtomicBool::new(false),
            lines: Mutex::new(Vec::new()),
        }
    }

    /// The next `exec` fails as if the TCP connection dropped.
    pub fn break_next_exec(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

#[async_trait]
impl SshSession for FakeSession {
    async fn exec(&self, command_line: &str) -> Result<ExecOutput, ToolError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            self.alive.store(false, Ordering::SeqCst);
            return Err(ToolError::connection("Connection reset by peer"));
        }
        self.lines.lock().unwrap().push(command_line.to_string());
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command_line)
            .output()
            .await
            .map_err(|err| ToolError::internal(err.to_string()))?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<u64, ToolError> {
        let bytes = tokio::fs::copy(remote_path, local_path).await?;
        Ok(bytes)
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Succeed,
    Refuse,
    RejectCredentials,
}

/// Hands out `FakeSession`s and counts how often it was dialed. Outcomes are
/// consumed in order; once the script runs out, connects succeed.
pub struct FakeTransport {
    connects: AtomicUsize,
    script: Mutex<Vec<ConnectOutcome>>,
    delay: Duration,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(outcomes: Vec<ConnectOutcome>) -> Self {
        Self {
            connects: AtomicUsize::new(0),
            script: Mutex::new(outcomes),
            delay: Duration::ZERO,
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn last_session(&self) -> Option<Arc<FakeSession>> {
        self.sessions.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl SshTransport for FakeTransport {
    async fn connect(
        &self,
        target: &RemoteTarget,
        _timeout: Duration,
    ) -> Result<Arc<dyn SshSession>, ToolError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let outcome = {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                ConnectOutcome::Succeed
            } else {
                script.remove(0)
            }
        };
        match outcome {
            ConnectOutcome::Succeed => {
                let session = Arc::new(FakeSession::new());
                self.sessions.lock().unwrap().push(session.clone());
                Ok(session)
            }
            ConnectOutcome::Refuse => Err(ToolError::connection(format!(
                "Failed to connect to {}: Connection refused",
                target.label()
            ))),
            ConnectOutcome::RejectCredentials => Err(ToolError::authentication(format!(
                "Authentication failed for {}",
                target.username()
            ))),
        }
    }
}

pub fn target() -> RemoteTarget {
    RemoteTarget::new("mac-mini.lan", 22, "ci", AuthMethod::Agent).unwrap()
}

pub fn session_manager(transport: Arc<FakeTransport>) -> Arc<SessionManager> {
    Arc::new(SessionManager::new(
        Logger::new("test"),
        target(),
        transport,
        Duration::from_secs(1),
    ))
}
