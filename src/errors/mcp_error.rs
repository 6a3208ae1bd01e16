use crate::errors::{ToolError, ToolErrorKind};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(i32)]
pub enum ErrorCode {
    ConnectionClosed = -32000,
    RequestTimeout = -32001,
    ParseError = -32700,
    InvalidRequest = -32600,
    MethodNotFound = -32601,
    InvalidParams = -32602,
    InternalError = -32603,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct McpError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl McpError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// JSON-RPC view of a failed tool call. The text keeps the fields a model
    /// needs to react (kind, code, retryable, hint); `data` carries the full
    /// structured error.
    pub fn from_tool_error(tool: &str, error: &ToolError) -> Self {
        let kind = serde_json::to_value(error.kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let mut lines = vec![
            "SimbridgeError".to_string(),
            format!("tool: {}", tool),
            format!("kind: {}", kind),
            format!("code: {}", error.code),
            format!("retryable: {}", error.retryable),
            format!("message: {}", error.message),
        ];
        if let Some(hint) = &error.hint {
            lines.push(format!("hint: {}", hint));
        }
        let code = match error.kind {
            ToolErrorKind::InvalidParams => ErrorCode::InvalidParams,
            ToolErrorKind::Timeout => ErrorCode::RequestTimeout,
            ToolErrorKind::Connection => ErrorCode::ConnectionClosed,
            ToolErrorKind::NotFound | ToolErrorKind::Authentication => ErrorCode::InvalidRequest,
            ToolErrorKind::CommandFailed | ToolErrorKind::SetupFailed | ToolErrorKind::Internal => {
                ErrorCode::InternalError
            }
        };
        let data = serde_json::to_value(error).unwrap_or(Value::Null);
        Self::new(code, lines.join("\n")).with_data(data)
    }
}

impl fmt::Display for McpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for McpError {}
