use crate::errors::ToolError;
use crate::managers::runner::CommandRunner;
use crate::managers::setup::SetupManager;
use crate::managers::status::StatusManager;
use crate::managers::transfer::FileTransfer;
use crate::mcp::catalog::tool_catalog;
use crate::services::config::BridgeConfig;
use crate::services::logger::Logger;
use crate::services::session::{SessionManager, SshTransport};
use crate::services::ssh::Ssh2Transport;
use crate::services::tool_executor::{ToolExecutor, ToolHandler};
use crate::services::validation::Validation;
use crate::utils::scratch::ScratchDir;
use std::collections::HashMap;
use std::sync::Arc;

pub struct App {
    pub logger: Logger,
    pub config: Arc<BridgeConfig>,
    pub runner: Arc<CommandRunner>,
    pub transfer: Arc<FileTransfer>,
    pub scratch: Arc<ScratchDir>,
    pub setup: Arc<SetupManager>,
    pub tool_executor: Arc<ToolExecutor>,
}

impl App {
    fn validate_tool_wiring(handlers: &HashMap<String, Arc<dyn ToolHandler>>) -> Result<(), ToolError> {
        let mut missing: Vec<String> = tool_catalog()
            .iter()
            .filter(|tool| !handlers.contains_key(&tool.name))
            .map(|tool| tool.name.clone())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort();
        Err(ToolError::internal("Tool wiring is incomplete")
            .with_hint("Every tool in tool_catalog.json must have a handler.")
            .with_details(serde_json::json!({ "missing_tools": missing })))
    }

    pub fn initialize(config: BridgeConfig) -> Result<Self, ToolError> {
        let logger = Logger::new("simbridge");
        let transport: Arc<dyn SshTransport> = Arc::new(Ssh2Transport::new(logger.clone()));
        Self::initialize_with(logger, config, transport)
    }

    /// Wires every component around `transport`. Tests pass a fake.
    pub fn initialize_with(
        logger: Logger,
        config: BridgeConfig,
        transport: Arc<dyn SshTransport>,
    ) -> Result<Self, ToolError> {
        let config = Arc::new(config);
        let validation = Validation::new();
        let scratch = Arc::new(ScratchDir::new());

        let session = config.target.clone().map(|target| {
            Arc::new(SessionManager::new(
                logger.clone(),
                target,
                transport.clone(),
                config.connect_timeout,
            ))
        });
        let runner = Arc::new(match session.clone() {
            Some(session) => {
                CommandRunner::remote(logger.clone(), session, config.tool_overrides.clone())
            }
            None => CommandRunner::local(logger.clone(), config.tool_overrides.clone()),
        });
        let transfer = Arc::new(FileTransfer::new(logger.clone(), session, scratch.clone()));

        let setup = Arc::new(SetupManager::new(
            logger.clone(),
            validation,
            config.clone(),
            runner.clone(),
            transport,
        ));
        let status = Arc::new(StatusManager::new(
            logger.clone(),
            config.clone(),
            runner.clone(),
            scratch.clone(),
        ));

        let mut handlers: HashMap<String, Arc<dyn ToolHandler>> = HashMap::new();
        handlers.insert("remote_setup".to_string(), setup.clone());
        handlers.insert("remote_status".to_string(), status);
        Self::validate_tool_wiring(&handlers)?;

        let tool_executor = Arc::new(ToolExecutor::new(logger.clone(), handlers));
        logger.info(
            "Initialized",
            Some(&serde_json::json!({
                "mode": if config.is_remote() { "remote" } else { "local" },
                "target": config.target.as_ref().map(|target| target.label()),
            })),
        );

        Ok(Self {
            logger,
            config,
            runner,
            transfer,
            scratch,
            setup,
            tool_executor,
        })
    }

    /// Releases the pooled session and removes the scratch directory.
    pub async fn shutdown(&self) {
        if let Some(session) = self.runner.session() {
            session.release().await;
        }
        if let Err(err) = self.scratch.cleanup() {
            self.logger.warn(
                "Failed to remove scratch directory",
                Some(&serde_json::json!({
                    "path": self.scratch.root().display().to_string(),
                    "error": err.to_string(),
                })),
            );
        }
        self.logger.info("Shut down", Some(&self.logger.stats()));
    }
}
