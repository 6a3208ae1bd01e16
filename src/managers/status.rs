use crate::errors::ToolError;
use crate::managers::runner::{CommandExecutor, CommandRunner};
use crate::services::config::BridgeConfig;
use crate::services::logger::Logger;
use crate::services::tool_executor::ToolHandler;
use crate::utils::scratch::ScratchDir;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// The `remote_status` tool: a read-only snapshot for diagnostics. It never
/// opens a session on its own.
pub struct StatusManager {
    logger: Logger,
    config: Arc<BridgeConfig>,
    runner: Arc<CommandRunner>,
    scratch: Arc<ScratchDir>,
}

impl StatusManager {
    pub fn new(
        logger: Logger,
        config: Arc<BridgeConfig>,
        runner: Arc<CommandRunner>,
        scratch: Arc<ScratchDir>,
    ) -> Self {
        Self {
            logger,
            config,
            runner,
            scratch,
        }
    }

    pub fn snapshot(&self) -> Value {
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "mode": if self.runner.is_remote() { "remote" } else { "local" },
            "config": self.config.summary(),
            "session": self.runner.session().map(|session| session.summary()),
            "tool_paths": self.runner.tool_paths().snapshot(),
            "scratch_dir": self.scratch.root().display().to_string(),
            "log": self.logger.stats(),
        })
    }
}

#[async_trait]
impl ToolHandler for StatusManager {
    async fn handle(&self, _args: Value) -> Result<Value, ToolError> {
        Ok(self.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn local_snapshot_has_no_session() {
        let logger = Logger::new("test");
        let manager = StatusManager::new(
            logger.clone(),
            Arc::new(BridgeConfig::local()),
            Arc::new(CommandRunner::local(logger, BTreeMap::new())),
            Arc::new(ScratchDir::with_root(std::env::temp_dir().join("simbridge-status-test"))),
        );
        let snapshot = manager.handle(Value::Null).await.expect("snapshot");
        assert_eq!(snapshot["mode"], "local");
        assert!(snapshot["session"].is_null());
        assert_eq!(snapshot["tool_paths"], serde_json::json!({}));
        assert_eq!(snapshot["config"]["mode"], "local");
    }
}
