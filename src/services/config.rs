use crate::constants::{env, limits, network, toolchain};
use crate::errors::ToolError;
use crate::utils::user_paths::expand_home_path;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// How the bridge authenticates. Exactly one method is selected, in priority
/// order: private key, password, local agent.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    PrivateKey {
        path: PathBuf,
        passphrase: Option<String>,
    },
    Password(String),
    Agent,
}

impl AuthMethod {
    pub fn select(
        key_path: Option<&str>,
        passphrase: Option<&str>,
        password: Option<&str>,
    ) -> Self {
        let non_empty = |value: Option<&str>| {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        if let Some(path) = non_empty(key_path) {
            return AuthMethod::PrivateKey {
                path: expand_home_path(path),
                passphrase: passphrase.filter(|p| !p.is_empty()).map(str::to_string),
            };
        }
        if let Some(password) = password.filter(|p| !p.is_empty()) {
            return AuthMethod::Password(password.to_string());
        }
        AuthMethod::Agent
    }

    pub fn label(&self) -> &'static str {
        match self {
            AuthMethod::PrivateKey { .. } => "private_key",
            AuthMethod::Password(_) => "password",
            AuthMethod::Agent => "agent",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::PrivateKey { path, passphrase } => f
                .debug_struct("PrivateKey")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
            AuthMethod::Password(_) => f.write_str("Password(<redacted>)"),
            AuthMethod::Agent => f.write_str("Agent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    host: String,
    port: u16,
    username: String,
    auth: AuthMethod,
    host_key_fingerprint: Option<String>,
}

impl RemoteTarget {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        auth: AuthMethod,
    ) -> Result<Self, ToolError> {
        let host = host.into().trim().to_string();
        let username = username.into().trim().to_string();
        if host.is_empty() {
            return Err(ToolError::invalid_params("SSH host must be a non-empty string"));
        }
        if username.is_empty() {
            return Err(ToolError::invalid_params(
                "SSH username must be a non-empty string",
            ));
        }
        if port < limits::MIN_PORT {
            return Err(ToolError::invalid_params(format!(
                "Port must be an integer between {} and {}",
                limits::MIN_PORT,
                limits::MAX_PORT
            )));
        }
        Ok(Self {
            host,
            port,
            username,
            auth,
            host_key_fingerprint: None,
        })
    }

    pub fn with_host_key_fingerprint(mut self, fingerprint: Option<String>) -> Self {
        self.host_key_fingerprint = fingerprint.and_then(|raw| normalize_fingerprint_sha256(&raw));
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn auth(&self) -> &AuthMethod {
        &self.auth
    }

    pub fn host_key_fingerprint(&self) -> Option<&str> {
        self.host_key_fingerprint.as_deref()
    }

    pub fn label(&self) -> String {
        if self.port == network::SSH_DEFAULT_PORT {
            format!("{}@{}", self.username, self.host)
        } else {
            format!("{}@{}:{}", self.username, self.host, self.port)
        }
    }

    pub fn same_endpoint(&self, host: &str, username: &str) -> bool {
        self.host.eq_ignore_ascii_case(host.trim()) && self.username == username.trim()
    }

    pub fn summary(&self) -> Value {
        serde_json::json!({
            "host": self.host,
            "port": self.port,
            "username": self.username,
            "auth": self.auth.label(),
            "host_key_pinned": self.host_key_fingerprint.is_some(),
        })
    }
}

pub fn normalize_fingerprint_sha256(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches('=');
    if trimmed.is_empty() {
        return None;
    }
    let body = match trimmed.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("sha256:") => trimmed[7..].trim(),
        _ => trimmed,
    };
    Some(format!("SHA256:{}", body))
}

/// Rejects pins that cannot match any host key.
fn parse_fingerprint(raw: &str) -> Result<Option<String>, ToolError> {
    let Some(normalized) = normalize_fingerprint_sha256(raw) else {
        return Ok(None);
    };
    let body = normalized.trim_start_matches("SHA256:");
    let is_base64 = !body.is_empty()
        && body
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'+' || byte == b'/');
    if !is_base64 {
        return Err(ToolError::invalid_params(format!(
            "{}: expected a base64 SHA-256 host key fingerprint",
            env::SSH_HOST_KEY_SHA256
        ))
        .with_hint("Copy the value printed by `ssh-keygen -lf <host key>`, e.g. SHA256:abc..."));
    }
    Ok(Some(normalized))
}

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub target: Option<RemoteTarget>,
    pub port: u16,
    pub default_username: Option<String>,
    pub auth: AuthMethod,
    pub host_key_fingerprint: Option<String>,
    pub connect_timeout: Duration,
    pub daemon_grace: Duration,
    pub tool_overrides: BTreeMap<String, String>,
    pub filtered_tools: BTreeSet<String>,
}

impl BridgeConfig {
    /// Local mode: no remote target, defaults everywhere.
    pub fn local() -> Self {
        Self {
            target: None,
            port: network::SSH_DEFAULT_PORT,
            default_username: None,
            auth: AuthMethod::Agent,
            host_key_fingerprint: None,
            connect_timeout: Duration::from_millis(network::TIMEOUT_SSH_CONNECT_MS),
            daemon_grace: Duration::from_millis(toolchain::DAEMON_GRACE_MS),
            tool_overrides: BTreeMap::new(),
            filtered_tools: BTreeSet::new(),
        }
    }

    pub fn from_env() -> Result<Self, ToolError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ToolError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let port = match read(env::SSH_PORT) {
            Some(raw) => parse_port(&raw)?,
            None => network::SSH_DEFAULT_PORT,
        };
        let default_username = read(env::SSH_USER).or_else(|| read("USER"));
        let password = lookup(env::SSH_PASSWORD);
        let passphrase = lookup(env::SSH_KEY_PASSPHRASE);
        let auth = AuthMethod::select(
            read(env::SSH_KEY_PATH).as_deref(),
            passphrase.as_deref(),
            password.as_deref(),
        );
        let host_key_fingerprint = match read(env::SSH_HOST_KEY_SHA256) {
            Some(raw) => parse_fingerprint(&raw)?,
            None => None,
        };

        let connect_timeout = Duration::from_millis(parse_millis(
            read(env::CONNECT_TIMEOUT_MS),
            env::CONNECT_TIMEOUT_MS,
            network::TIMEOUT_SSH_CONNECT_MS,
        )?);
        let daemon_grace = Duration::from_millis(parse_millis(
            read(env::DAEMON_GRACE_MS),
            env::DAEMON_GRACE_MS,
            toolchain::DAEMON_GRACE_MS,
        )?);

        let mut tool_overrides = BTreeMap::new();
        if let Some(path) = read(env::IDB_PATH) {
            tool_overrides.insert(toolchain::CLIENT_TOOL.to_string(), path);
        }

        let filtered_tools = read(env::FILTERED_TOOLS)
            .map(|raw| {
                raw.split(',')
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let mut config = Self {
            target: None,
            port,
            default_username,
            auth,
            host_key_fingerprint,
            connect_timeout,
            daemon_grace,
            tool_overrides,
            filtered_tools,
        };

        if let Some(host) = read(env::SSH_HOST) {
            let username = config.default_username.clone().ok_or_else(|| {
                ToolError::invalid_params(format!(
                    "{} is set but no SSH username is configured",
                    env::SSH_HOST
                ))
                .with_hint(format!("Set {} to the remote account name.", env::SSH_USER))
            })?;
            config.target = Some(config.target_for(&host, None, &username)?);
        }
        Ok(config)
    }

    pub fn is_remote(&self) -> bool {
        self.target.is_some()
    }

    /// Builds a target for an ad-hoc host, reusing the configured
    /// credentials and host key pin. `port` defaults to the configured one.
    pub fn target_for(
        &self,
        host: &str,
        port: Option<u16>,
        username: &str,
    ) -> Result<RemoteTarget, ToolError> {
        Ok(
            RemoteTarget::new(host, port.unwrap_or(self.port), username, self.auth.clone())?
                .with_host_key_fingerprint(self.host_key_fingerprint.clone()),
        )
    }

    pub fn summary(&self) -> Value {
        serde_json::json!({
            "mode": if self.is_remote() { "remote" } else { "local" },
            "target": self.target.as_ref().map(RemoteTarget::summary),
            "connect_timeout_ms": self.connect_timeout.as_millis() as u64,
            "daemon_grace_ms": self.daemon_grace.as_millis() as u64,
            "tool_overrides": self.tool_overrides,
            "filtered_tools": self.filtered_tools,
        })
    }
}

fn parse_port(raw: &str) -> Result<u16, ToolError> {
    raw.parse::<u16>()
        .ok()
        .filter(|port| *port >= limits::MIN_PORT)
        .ok_or_else(|| {
            ToolError::invalid_params(format!(
                "{}: port must be an integer between {} and {}",
                env::SSH_PORT,
                limits::MIN_PORT,
                limits::MAX_PORT
            ))
        })
}

fn parse_millis(raw: Option<String>, key: &str, fallback: u64) -> Result<u64, ToolError> {
    let Some(raw) = raw else {
        return Ok(fallback);
    };
    raw.parse::<u64>().map_err(|_| {
        ToolError::invalid_params(format!("{}: expected milliseconds, got '{}'", key, raw))
    })
}
