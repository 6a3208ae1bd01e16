use serde::Serialize;
use serde_json::Value;
use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    InvalidParams,
    NotFound,
    Timeout,
    Connection,
    Authentication,
    CommandFailed,
    SetupFailed,
    Internal,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub retryable: bool,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            hint: None,
            details: None,
            retryable: matches!(kind, ToolErrorKind::Timeout | ToolErrorKind::Connection),
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Adds one key to `details`, keeping whatever is already there.
    pub fn with_detail(mut self, key: &str, value: Value) -> Self {
        let mut map = match self.details.take() {
            Some(Value::Object(map)) => map,
            Some(other) => {
                let mut map = serde_json::Map::new();
                map.insert("previous".to_string(), other);
                map
            }
            None => serde_json::Map::new(),
        };
        map.insert(key.to_string(), value);
        self.details = Some(Value::Object(map));
        self
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::InvalidParams, "INVALID_PARAMS", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::NotFound, "NOT_FOUND", message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Timeout, "TIMEOUT", message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Connection, "CONNECTION_ERROR", message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(
            ToolErrorKind::Authentication,
            "AUTHENTICATION_ERROR",
            message,
        )
    }

    pub fn command_failed(command: &str, exit_code: i32, stderr: &str) -> Self {
        let trimmed = stderr.trim();
        let message = if trimmed.is_empty() {
            format!("Command '{}' exited with status {}", command, exit_code)
        } else {
            format!(
                "Command '{}' exited with status {}: {}",
                command, exit_code, trimmed
            )
        };
        Self::new(
            ToolErrorKind::CommandFailed,
            "COMMAND_EXECUTION_ERROR",
            message,
        )
        .with_details(serde_json::json!({
            "command": command,
            "exit_code": exit_code,
            "stderr": stderr,
        }))
    }

    pub fn setup_failed(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::SetupFailed, "SETUP_ACTION_FAILURE", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Internal, "INTERNAL", message)
    }

    pub fn is_connection_lost(&self) -> bool {
        self.kind == ToolErrorKind::Connection
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.details
            .as_ref()
            .and_then(|d| d.get("exit_code"))
            .and_then(|v| v.as_i64())
            .map(|v| v as i32)
    }

    pub fn stderr(&self) -> Option<&str> {
        self.details
            .as_ref()
            .and_then(|d| d.get("stderr"))
            .and_then(|v| v.as_str())
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for ToolError {}

impl From<std::io::Error> for ToolError {
    fn from(err: std::io::Error) -> Self {
        ToolError::internal(err.to_string())
    }
}
