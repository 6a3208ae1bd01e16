use crate::constants::{limits, network};
use crate::errors::{ToolError, ToolErrorKind};
use crate::services::config::{AuthMethod, RemoteTarget};
use crate::services::logger::Logger;
use crate::services::session::{ExecOutput, SshSession, SshTransport};
use crate::utils::fs_atomic::{ensure_dir_for_file, finalize_temp_file, temp_sibling_path};
use async_trait::async_trait;
use base64::Engine;
use ssh2::{ErrorCode, Session};
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

// libssh2 session error codes that mean the transport itself is gone.
const LIBSSH2_ERROR_SOCKET_NONE: i32 = -1;
const LIBSSH2_ERROR_BANNER_RECV: i32 = -2;
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_CHANNEL_CLOSED: i32 = -26;
const LIBSSH2_ERROR_SOCKET_TIMEOUT: i32 = -30;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;
const LIBSSH2_ERROR_BAD_SOCKET: i32 = -45;
const LIBSSH2_ERROR_EAGAIN: i32 = -37;

const CONNECTION_LOST_CODES: &[i32] = &[
    LIBSSH2_ERROR_SOCKET_NONE,
    LIBSSH2_ERROR_BANNER_RECV,
    LIBSSH2_ERROR_SOCKET_SEND,
    LIBSSH2_ERROR_TIMEOUT,
    LIBSSH2_ERROR_SOCKET_DISCONNECT,
    LIBSSH2_ERROR_CHANNEL_CLOSED,
    LIBSSH2_ERROR_SOCKET_TIMEOUT,
    LIBSSH2_ERROR_SOCKET_RECV,
    LIBSSH2_ERROR_BAD_SOCKET,
];

const AUTHENTICATION_CODES: &[i32] = &[
    -15, // PASSWORD_EXPIRED
    -18, // AUTHENTICATION_FAILED
    -19, // PUBLICKEY_UNVERIFIED
];

const SFTP_NO_SUCH_FILE: i32 = 2;
const SFTP_PERMISSION_DENIED: i32 = 3;

/// Failures at the ssh2 boundary, before they become a `ToolError`.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("cannot resolve SSH host {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("SSH handshake failed: {0}")]
    Handshake(#[source] ssh2::Error),
    #[error("SSH authentication failed for {user} ({method}): {reason}")]
    Authentication {
        user: String,
        method: &'static str,
        reason: String,
    },
    #[error("SSH host key mismatch (expected {expected}, got {observed})")]
    HostKeyMismatch { expected: String, observed: String },
    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),
    #[error("SSH I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub fn kind(&self) -> ToolErrorKind {
        match self {
            TransportError::Resolve { .. }
            | TransportError::Connect { .. }
            | TransportError::Handshake(_) => ToolErrorKind::Connection,
            TransportError::Authentication { .. } | TransportError::HostKeyMismatch { .. } => {
                ToolErrorKind::Authentication
            }
            TransportError::Ssh(err) => classify_ssh_error(err),
            TransportError::Io(err) => classify_io_error(err),
        }
    }
}

impl From<TransportError> for ToolError {
    fn from(err: TransportError) -> Self {
        let message = err.to_string();
        match (&err, err.kind()) {
            (TransportError::HostKeyMismatch { .. }, _) => ToolError::authentication(message)
                .with_hint("The server key changed. Verify the host, then update SIMBRIDGE_SSH_HOST_KEY_SHA256."),
            (_, ToolErrorKind::Authentication) => ToolError::authentication(message).with_hint(
                "Check SIMBRIDGE_SSH_USER and the configured key, password or agent identity.",
            ),
            (_, ToolErrorKind::Connection) => ToolError::connection(message),
            (_, ToolErrorKind::NotFound) => ToolError::not_found(message),
            (_, kind) => ToolError::new(kind, "SSH_ERROR", message),
        }
    }
}

pub fn classify_ssh_error(err: &ssh2::Error) -> ToolErrorKind {
    match err.code() {
        ErrorCode::Session(code) if CONNECTION_LOST_CODES.contains(&code) => {
            ToolErrorKind::Connection
        }
        ErrorCode::Session(code) if AUTHENTICATION_CODES.contains(&code) => {
            ToolErrorKind::Authentication
        }
        ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => ToolErrorKind::NotFound,
        ErrorCode::SFTP(SFTP_PERMISSION_DENIED) => ToolErrorKind::CommandFailed,
        _ => ToolErrorKind::Internal,
    }
}

pub fn classify_io_error(err: &io::Error) -> ToolErrorKind {
    match err.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::TimedOut => ToolErrorKind::Connection,
        io::ErrorKind::NotFound => ToolErrorKind::NotFound,
        _ => ToolErrorKind::Internal,
    }
}

/// Dials real SSH servers with libssh2.
pub struct Ssh2Transport {
    logger: Logger,
}

impl Ssh2Transport {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger: logger.child("ssh"),
        }
    }
}

#[async_trait]
impl SshTransport for Ssh2Transport {
    async fn connect(
        &self,
        target: &RemoteTarget,
        timeout: Duration,
    ) -> Result<Arc<dyn SshSession>, ToolError> {
        let target = target.clone();
        let label = target.label();
        let (session, observed) =
            tokio::task::spawn_blocking(move || connect_session(&target, timeout))
                .await
                .map_err(|_| ToolError::internal("SSH connect task failed"))??;
        self.logger.info(
            "SSH host key",
            Some(&serde_json::json!({
                "target": label,
                "fingerprint_sha256": observed,
            })),
        );
        Ok(Arc::new(Ssh2Session::new(session, label, self.logger.clone())))
    }
}

fn connect_session(
    target: &RemoteTarget,
    timeout: Duration,
) -> Result<(Session, Option<String>), TransportError> {
    let addrs = (target.host(), target.port())
        .to_socket_addrs()
        .map_err(|source| TransportError::Resolve {
            host: target.host().to_string(),
            source,
        })?
        .collect::<Vec<_>>();

    let mut last_error = None;
    let mut stream = None;
    for addr in &addrs {
        match TcpStream::connect_timeout(addr, timeout) {
            Ok(tcp) => {
                stream = Some(tcp);
                break;
            }
            Err(source) => last_error = Some((addr.to_string(), source)),
        }
    }
    let tcp = match (stream, last_error) {
        (Some(tcp), _) => tcp,
        (None, Some((addr, source))) => return Err(TransportError::Connect { addr, source }),
        (None, None) => {
            return Err(TransportError::Resolve {
                host: target.host().to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
            })
        }
    };

    let mut session = Session::new()?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout.as_millis().min(u128::from(u32::MAX)) as u32);
    session.handshake().map_err(TransportError::Handshake)?;

    let observed = fingerprint_host_key_sha256(&session);
    if let Some(expected) = target.host_key_fingerprint() {
        if observed.as_deref() != Some(expected) {
            return Err(TransportError::HostKeyMismatch {
                expected: expected.to_string(),
                observed: observed.unwrap_or_else(|| "unknown".to_string()),
            });
        }
    }

    authenticate(&session, target)?;

    // Handshake and auth are bounded; commands such as package installs are not.
    session.set_timeout(0);
    session.set_keepalive(true, network::KEEPALIVE_INTERVAL_SECS);
    Ok((session, observed))
}

fn authenticate(session: &Session, target: &RemoteTarget) -> Result<(), TransportError> {
    let user = target.username();
    let method = target.auth().label();
    let result = match target.auth() {
        AuthMethod::PrivateKey { path, passphrase } => {
            session.userauth_pubkey_file(user, None, path, passphrase.as_deref())
        }
        AuthMethod::Password(password) => session.userauth_password(user, password),
        AuthMethod::Agent => session.userauth_agent(user),
    };
    if let Err(err) = result {
        if classify_ssh_error(&err) == ToolErrorKind::Connection {
            return Err(TransportError::Ssh(err));
        }
        return Err(TransportError::Authentication {
            user: user.to_string(),
            method,
            reason: err.message().to_string(),
        });
    }
    if !session.authenticated() {
        return Err(TransportError::Authentication {
            user: user.to_string(),
            method,
            reason: "server did not accept the credentials".to_string(),
        });
    }
    Ok(())
}

fn fingerprint_host_key_sha256(session: &Session) -> Option<String> {
    let hash = session.host_key_hash(ssh2::HashType::Sha256)?;
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    Some(format!("SHA256:{}", encoded))
}

/// One authenticated libssh2 session. libssh2 handles are not safe for
/// concurrent use, so every operation holds `inner` for its duration.
pub struct Ssh2Session {
    inner: Arc<Mutex<Session>>,
    label: String,
    logger: Logger,
}

impl Ssh2Session {
    fn new(session: Session, label: String, logger: Logger) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
            label,
            logger,
        }
    }

    async fn with_session<T, F>(&self, name: &'static str, op: F) -> Result<T, ToolError>
    where
        F: FnOnce(&Session) -> Result<T, TransportError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let session = lock_session(&inner);
            op(&session)
        })
        .await
        .map_err(|_| ToolError::internal(format!("SSH {} task failed", name)))?
        .map_err(ToolError::from)
    }
}

fn lock_session(inner: &Mutex<Session>) -> MutexGuard<'_, Session> {
    inner.lock().unwrap_or_else(|err| err.into_inner())
}

#[async_trait]
impl SshSession for Ssh2Session {
    async fn exec(&self, command_line: &str) -> Result<ExecOutput, ToolError> {
        let command_line = command_line.to_string();
        self.logger.debug(
            "ssh exec",
            Some(&serde_json::json!({ "target": self.label, "command": command_line })),
        );
        self.with_session("exec", move |session| exec_blocking(session, &command_line))
            .await
    }

    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<u64, ToolError> {
        let remote = remote_path.to_string();
        let local = local_path.to_path_buf();
        self.with_session("download", move |session| {
            sftp_download(session, &remote, &local)
        })
        .await
    }

    async fn is_alive(&self) -> bool {
        self.with_session("keepalive", |session| {
            session.keepalive_send()?;
            Ok(())
        })
        .await
        .is_ok()
    }

    async fn close(&self) {
        let _ = self
            .with_session("disconnect", |session| {
                session.disconnect(None, "simbridge shutting down", None)?;
                Ok(())
            })
            .await;
    }
}

fn exec_blocking(session: &Session, command_line: &str) -> Result<ExecOutput, TransportError> {
    let mut channel = session.channel_session()?;
    channel.exec(command_line)?;

    session.set_blocking(false);
    let pumped = pump_channel(session, &mut channel);
    session.set_blocking(true);
    let (stdout, stderr) = pumped?;

    channel.wait_close()?;
    let exit_code = channel.exit_status()?;
    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
        exit_code,
    })
}

fn pump_channel(
    session: &Session,
    channel: &mut ssh2::Channel,
) -> Result<(Vec<u8>, Vec<u8>), TransportError> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut stderr_stream = channel.stderr();
    let keepalive_every = Duration::from_secs(u64::from(network::KEEPALIVE_INTERVAL_SECS));
    let mut last_activity = Instant::now();
    let mut buf = [0u8; 8192];

    loop {
        let mut progressed = false;
        progressed |= read_available(channel, &mut buf, &mut stdout)?;
        progressed |= read_available(&mut stderr_stream, &mut buf, &mut stderr)?;

        if channel.eof() {
            break;
        }
        if progressed {
            last_activity = Instant::now();
            continue;
        }
        if last_activity.elapsed() >= keepalive_every {
            match session.keepalive_send() {
                Ok(_) => {}
                Err(err) if is_would_block(&err) => {}
                Err(err) => return Err(TransportError::Ssh(err)),
            }
            last_activity = Instant::now();
        }
        std::thread::sleep(Duration::from_millis(network::CHANNEL_POLL_INTERVAL_MS));
    }
    Ok((stdout, stderr))
}

fn read_available<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    out: &mut Vec<u8>,
) -> Result<bool, TransportError> {
    match reader.read(buf) {
        Ok(0) => Ok(false),
        Ok(n) => {
            let room = limits::MAX_CAPTURE_BYTES.saturating_sub(out.len());
            out.extend_from_slice(&buf[..n.min(room)]);
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(err) => Err(TransportError::Io(err)),
    }
}

fn is_would_block(err: &ssh2::Error) -> bool {
    err.code() == ErrorCode::Session(LIBSSH2_ERROR_EAGAIN)
}

fn sftp_download(session: &Session, remote: &str, local: &Path) -> Result<u64, TransportError> {
    let sftp = session.sftp()?;
    let mut remote_file = sftp.open(Path::new(remote))?;
    ensure_dir_for_file(local)?;
    let tmp_path: PathBuf = temp_sibling_path(local);
    let copied = (|| -> Result<u64, TransportError> {
        let mut tmp_file = std::fs::File::create(&tmp_path)?;
        let bytes = io::copy(&mut remote_file, &mut tmp_file)?;
        tmp_file.sync_all()?;
        Ok(bytes)
    })();
    match copied {
        Ok(bytes) => {
            finalize_temp_file(&tmp_path, local)?;
            Ok(bytes)
        }
        Err(err) => {
            let _ = std::fs::remove_file(&tmp_path);
            Err(err)
        }
    }
}
