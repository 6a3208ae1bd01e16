use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::errors::ToolError;
use crate::services::logger::Logger;

use serde_json::Value;

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(&self, args: Value) -> Result<Value, ToolError>;
}

/// Dispatches tool calls by name and wraps results with call metadata.
#[derive(Clone)]
pub struct ToolExecutor {
    logger: Logger,
    handlers: Arc<HashMap<String, Arc<dyn ToolHandler>>>,
}

impl ToolExecutor {
    pub fn new(logger: Logger, handlers: HashMap<String, Arc<dyn ToolHandler>>) -> Self {
        Self {
            logger: logger.child("executor"),
            handlers: Arc::new(handlers),
        }
    }

    pub fn has_tool(&self, tool: &str) -> bool {
        self.handlers.contains_key(tool)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn execute(&self, tool: &str, args: Value) -> Result<Value, ToolError> {
        let Some(handler) = self.handlers.get(tool).cloned() else {
            return Err(
                ToolError::not_found(format!("Unknown tool: {}", tool)).with_hint(format!(
                    "Available tools: {}",
                    self.tool_names().join(", ")
                )),
            );
        };
        let trace_id = args
            .get("trace_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let args = strip_call_fields(args);

        let started = Instant::now();
        self.logger.debug(
            "tool call",
            Some(&serde_json::json!({ "tool": tool, "trace_id": trace_id })),
        );
        let result = handler.handle(args).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(result) => Ok(serde_json::json!({
                "ok": true,
                "result": result,
                "meta": {
                    "tool": tool,
                    "trace_id": trace_id,
                    "duration_ms": duration_ms,
                },
            })),
            Err(err) => {
                self.logger.warn(
                    "tool call failed",
                    Some(&serde_json::json!({
                        "tool": tool,
                        "trace_id": trace_id,
                        "code": err.code,
                        "duration_ms": duration_ms,
                    })),
                );
                Err(err)
            }
        }
    }
}

fn strip_call_fields(args: Value) -> Value {
    match args {
        Value::Object(mut map) => {
            map.remove("trace_id");
            Value::Object(map)
        }
        Value::Null => Value::Object(Default::default()),
        other => other,
    }
}
