use crate::errors::ToolError;
use crate::services::config::RemoteTarget;
use crate::services::logger::Logger;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// A live secure-shell session. Implementations must tolerate being called
/// from several tasks; the runner serializes command execution on top.
#[async_trait]
pub trait SshSession: Send + Sync {
    /// Runs one command line through the remote account's login shell.
    async fn exec(&self, command_line: &str) -> Result<ExecOutput, ToolError>;

    /// Copies a remote file to `local_path`, returning the byte count.
    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<u64, ToolError>;

    /// Cheap liveness probe (a keepalive round).
    async fn is_alive(&self) -> bool;

    async fn close(&self);
}

#[async_trait]
pub trait SshTransport: Send + Sync {
    async fn connect(
        &self,
        target: &RemoteTarget,
        timeout: Duration,
    ) -> Result<Arc<dyn SshSession>, ToolError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Broken,
}

type PendingConnect = Shared<BoxFuture<'static, Result<Arc<dyn SshSession>, ToolError>>>;

enum Slot {
    Disconnected,
    Connecting {
        generation: u64,
        pending: PendingConnect,
    },
    Ready {
        generation: u64,
        session: Arc<dyn SshSession>,
    },
    Broken,
}

impl Slot {
    fn state(&self) -> SessionState {
        match self {
            Slot::Disconnected => SessionState::Disconnected,
            Slot::Connecting { .. } => SessionState::Connecting,
            Slot::Ready { .. } => SessionState::Ready,
            Slot::Broken => SessionState::Broken,
        }
    }
}

enum Lease {
    Ready(u64, Arc<dyn SshSession>),
    Pending(u64, PendingConnect),
}

/// Owns the one pooled session for the configured target.
///
/// The slot lock is a plain mutex and is never held across an await point;
/// establishment runs inside a shared future so concurrent callers that find
/// the slot `Connecting` wait on the same outcome instead of dialing again.
pub struct SessionManager {
    target: RemoteTarget,
    transport: Arc<dyn SshTransport>,
    connect_timeout: Duration,
    logger: Logger,
    slot: Mutex<Slot>,
    generation: AtomicU64,
    connects: AtomicU64,
}

impl SessionManager {
    pub fn new(
        logger: Logger,
        target: RemoteTarget,
        transport: Arc<dyn SshTransport>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            target,
            transport,
            connect_timeout,
            logger: logger.child("session"),
            slot: Mutex::new(Slot::Disconnected),
            generation: AtomicU64::new(0),
            connects: AtomicU64::new(0),
        }
    }

    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }

    pub fn status(&self) -> SessionState {
        self.lock_slot().state()
    }

    /// Number of establishment attempts started so far.
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn summary(&self) -> Value {
        serde_json::json!({
            "target": self.target.label(),
            "state": self.status(),
            "connect_attempts": self.connect_count(),
        })
    }

    pub async fn acquire(&self) -> Result<Arc<dyn SshSession>, ToolError> {
        self.lease().await.map(|(_, session)| session)
    }

    /// Marks the current session broken and drops it. The next `acquire`
    /// reconnects.
    pub async fn discard(&self) {
        let previous = {
            let mut slot = self.lock_slot();
            std::mem::replace(&mut *slot, Slot::Broken)
        };
        self.close_slot(previous, "discarded").await;
    }

    /// Tears the session down for shutdown.
    pub async fn release(&self) {
        let previous = {
            let mut slot = self.lock_slot();
            std::mem::replace(&mut *slot, Slot::Disconnected)
        };
        self.close_slot(previous, "released").await;
    }

    /// Runs `op` against the pooled session, retrying exactly once when the
    /// first attempt fails with a lost connection. The broken session is
    /// discarded before the retry. When the retry fails too, its error is
    /// returned with the first failure attached under `first_attempt`.
    pub async fn with_reconnect<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, ToolError>
    where
        F: FnMut(Arc<dyn SshSession>) -> Fut,
        Fut: Future<Output = Result<T, ToolError>>,
    {
        let first = match self.attempt(&mut op).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_connection_lost() => err,
            Err(err) => return Err(err),
        };
        self.logger.warn(
            "Connection lost; reconnecting once",
            Some(&serde_json::json!({
                "operation": operation,
                "target": self.target.label(),
                "error": first.message,
            })),
        );
        match self.attempt(&mut op).await {
            Ok(value) => {
                self.logger.info(
                    "Reconnected",
                    Some(&serde_json::json!({ "operation": operation })),
                );
                Ok(value)
            }
            Err(err) => Err(err.with_detail("first_attempt", first_attempt_detail(&first))),
        }
    }

    async fn attempt<T, F, Fut>(&self, op: &mut F) -> Result<T, ToolError>
    where
        F: FnMut(Arc<dyn SshSession>) -> Fut,
        Fut: Future<Output = Result<T, ToolError>>,
    {
        let (generation, session) = self.lease().await?;
        let result = op(session).await;
        if matches!(&result, Err(err) if err.is_connection_lost()) {
            self.discard_generation(generation).await;
        }
        result
    }

    async fn lease(&self) -> Result<(u64, Arc<dyn SshSession>), ToolError> {
        if let Some((generation, session)) = self.ready_session() {
            if session.is_alive().await {
                return Ok((generation, session));
            }
            self.logger.warn(
                "Pooled session failed its health probe",
                Some(&serde_json::json!({ "target": self.target.label() })),
            );
            self.discard_generation(generation).await;
        }

        match self.join_or_start() {
            Lease::Ready(generation, session) => Ok((generation, session)),
            Lease::Pending(generation, pending) => {
                let outcome = pending.await;
                self.settle(generation, &outcome);
                outcome.map(|session| (generation, session))
            }
        }
    }

    fn ready_session(&self) -> Option<(u64, Arc<dyn SshSession>)> {
        match &*self.lock_slot() {
            Slot::Ready {
                generation,
                session,
            } => Some((*generation, session.clone())),
            _ => None,
        }
    }

    fn join_or_start(&self) -> Lease {
        let mut slot = self.lock_slot();
        match &*slot {
            Slot::Ready {
                generation,
                session,
            } => return Lease::Ready(*generation, session.clone()),
            Slot::Connecting {
                generation,
                pending,
            } => return Lease::Pending(*generation, pending.clone()),
            Slot::Disconnected | Slot::Broken => {}
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.logger.info(
            "Establishing SSH session",
            Some(&serde_json::json!({
                "target": self.target.label(),
                "auth": self.target.auth().label(),
                "generation": generation,
            })),
        );
        let transport = self.transport.clone();
        let target = self.target.clone();
        let timeout = self.connect_timeout;
        let pending = async move { transport.connect(&target, timeout).await }
            .boxed()
            .shared();
        *slot = Slot::Connecting {
            generation,
            pending: pending.clone(),
        };
        Lease::Pending(generation, pending)
    }

    fn settle(&self, generation: u64, outcome: &Result<Arc<dyn SshSession>, ToolError>) {
        let mut slot = self.lock_slot();
        let current = matches!(&*slot, Slot::Connecting { generation: g, .. } if *g == generation);
        if !current {
            return;
        }
        match outcome {
            Ok(session) => {
                self.logger.info(
                    "SSH session ready",
                    Some(&serde_json::json!({ "target": self.target.label() })),
                );
                *slot = Slot::Ready {
                    generation,
                    session: session.clone(),
                };
            }
            Err(err) => {
                self.logger.error(
                    "SSH session establishment failed",
                    Some(&serde_json::json!({
                        "target": self.target.label(),
                        "code": err.code,
                        "error": err.message,
                    })),
                );
                *slot = Slot::Disconnected;
            }
        }
    }

    async fn discard_generation(&self, generation: u64) {
        let previous = {
            let mut slot = self.lock_slot();
            let current = matches!(&*slot, Slot::Ready { generation: g, .. } if *g == generation);
            if !current {
                return;
            }
            std::mem::replace(&mut *slot, Slot::Broken)
        };
        self.close_slot(previous, "broken").await;
    }

    async fn close_slot(&self, previous: Slot, reason: &str) {
        if let Slot::Ready { session, .. } = previous {
            self.logger.debug(
                "Closing SSH session",
                Some(&serde_json::json!({
                    "target": self.target.label(),
                    "reason": reason,
                })),
            );
            session.close().await;
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|err| err.into_inner())
    }
}

fn first_attempt_detail(err: &ToolError) -> Value {
    serde_json::json!({
        "code": err.code,
        "message": err.message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::config::AuthMethod;
    use std::sync::atomic::AtomicBool;

    struct StubSession {
        alive: AtomicBool,
    }

    #[async_trait]
    impl SshSession for StubSession {
        async fn exec(&self, command_line: &str) -> Result<ExecOutput, ToolError> {
            Ok(ExecOutput {
                stdout: command_line.to_string(),
                stderr: String::new(),
                exit_code: 0,
            })
        }

        async fn download(&self, _remote: &str, _local: &Path) -> Result<u64, ToolError> {
            Ok(0)
        }

        async fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    struct StubTransport {
        refuse: bool,
    }

    #[async_trait]
    impl SshTransport for StubTransport {
        async fn connect(
            &self,
            _target: &RemoteTarget,
            _timeout: Duration,
        ) -> Result<Arc<dyn SshSession>, ToolError> {
            if self.refuse {
                return Err(ToolError::connection("Connection refused"));
            }
            Ok(Arc::new(StubSession {
                alive: AtomicBool::new(true),
            }))
        }
    }

    fn manager(refuse: bool) -> SessionManager {
        let target = RemoteTarget::new("mac", 22, "ci", AuthMethod::Agent).expect("target");
        SessionManager::new(
            Logger::new("test"),
            target,
            Arc::new(StubTransport { refuse }),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn state_follows_lifecycle() {
        let manager = manager(false);
        assert_eq!(manager.status(), SessionState::Disconnected);
        manager.acquire().await.expect("session");
        assert_eq!(manager.status(), SessionState::Ready);
        manager.discard().await;
        assert_eq!(manager.status(), SessionState::Broken);
        manager.acquire().await.expect("session");
        assert_eq!(manager.connect_count(), 2);
        manager.release().await;
        assert_eq!(manager.status(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn failed_establishment_leaves_slot_disconnected() {
        let manager = manager(true);
        let err = manager.acquire().await.err().expect("refused");
        assert!(err.is_connection_lost());
        assert_eq!(manager.status(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn retry_failure_carries_first_attempt() {
        let manager = manager(true);
        let err = manager
            .with_reconnect("probe", |session| async move { session.exec("true").await })
            .await
            .err()
            .expect("both attempts refused");
        assert_eq!(manager.connect_count(), 2);
        let first = err
            .details
            .as_ref()
            .and_then(|d| d.get("first_attempt"))
            .expect("first_attempt");
        assert_eq!(first.get("code").and_then(Value::as_str), Some("CONNECTION_ERROR"));
    }
}
