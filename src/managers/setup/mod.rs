pub mod actions;
pub mod checks;
pub mod report;

use crate::constants::{limits, localhost, toolchain};
use crate::errors::{ToolError, ToolErrorKind};
use crate::managers::runner::{CommandExecutor, CommandRunner};
use crate::services::config::BridgeConfig;
use crate::services::logger::Logger;
use crate::services::session::{SessionManager, SshTransport};
use crate::services::tool_executor::ToolHandler;
use crate::services::validation::Validation;
use crate::utils::shell::CommandArgs;
use crate::utils::text::{first_line, tail_lines, truncate_utf8_prefix};
use actions::{companion_log_tail_script, start_companion_script, ActionKind};
use async_trait::async_trait;
use checks::{parse_simulators, preferred_device, simulator_list_script, CheckId, CheckResult};
use report::{ActionOutcome, ActionStatus, GateOutcome, ReconciliationReport, Verification};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// How long the daemon gets to come up before its single liveness poll.
    pub daemon_grace: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            daemon_grace: Duration::from_millis(toolchain::DAEMON_GRACE_MS),
        }
    }
}

/// Analyze, gate, apply and verify against whatever host `executor` targets.
pub struct ReconcileEngine<'a> {
    executor: &'a dyn CommandExecutor,
    options: EngineOptions,
    logger: Logger,
}

impl<'a> ReconcileEngine<'a> {
    pub fn new(logger: &Logger, executor: &'a dyn CommandExecutor, options: EngineOptions) -> Self {
        Self {
            executor,
            options,
            logger: logger.child("setup"),
        }
    }

    /// Fails only when the transport breaks after the host proved reachable;
    /// every expected condition lands in the report.
    pub async fn run(
        &self,
        target: &str,
        dry_run: bool,
        auto_confirm: bool,
    ) -> Result<ReconciliationReport, ToolError> {
        let (checks, analysis_halted) = self.analyze().await?;
        let plan = derive_plan(&checks);
        let mut report = ReconciliationReport {
            target: target.to_string(),
            remote: self.executor.is_remote(),
            dry_run,
            auto_confirm,
            checks,
            analysis_halted,
            plan,
            gate: GateOutcome::DryRun,
            actions: Vec::new(),
            verification: None,
        };

        if let Some(gate) = evaluate_gate(dry_run, auto_confirm, &report.checks, &report.plan) {
            self.logger.info(
                "Reconciliation stopped at gate",
                Some(&serde_json::json!({
                    "target": target,
                    "gate": gate,
                    "pending": report.plan.len(),
                })),
            );
            report.gate = gate;
            return Ok(report);
        }

        report.actions = self.apply_plan(&report.plan).await;
        let failed = report
            .actions
            .iter()
            .any(|outcome| outcome.status == ActionStatus::Failed);
        if failed {
            report.gate = GateOutcome::PartiallyApplied;
        } else {
            report.gate = GateOutcome::Applied;
            report.verification = Some(self.verify().await);
        }
        Ok(report)
    }

    async fn analyze(&self) -> Result<(Vec<CheckResult>, bool), ToolError> {
        let mut results = Vec::with_capacity(CheckId::ALL.len());
        for id in CheckId::ALL {
            let result = if id == CheckId::Ssh {
                self.check_reachability().await
            } else {
                self.evaluate(id).await?
            };
            self.logger.debug(
                "check",
                Some(&serde_json::json!({
                    "name": result.name,
                    "status": result.status,
                    "detail": result.detail,
                })),
            );
            let halt = id.halts_analysis() && !result.is_satisfied();
            results.push(result);
            if halt {
                return Ok((results, true));
            }
        }
        Ok((results, false))
    }

    async fn check_reachability(&self) -> CheckResult {
        let Some(script) = CheckId::Ssh.probe_script() else {
            return CheckResult::failed(CheckId::Ssh, "");
        };
        match self.executor.run_script(&script).await {
            Ok(_) if self.executor.is_remote() => CheckResult::satisfied(CheckId::Ssh, "connected"),
            Ok(_) => CheckResult::satisfied(CheckId::Ssh, "local execution, no SSH needed"),
            Err(err) => CheckResult::failed(CheckId::Ssh, err.message),
        }
    }

    async fn evaluate(&self, id: CheckId) -> Result<CheckResult, ToolError> {
        match id {
            CheckId::Ssh => return Ok(self.check_reachability().await),
            CheckId::IdbCompanion => {
                return Ok(match self.executor.resolve_tool(toolchain::DAEMON_TOOL).await? {
                    Some(path) => CheckResult::satisfied(id, path),
                    None => CheckResult::failed(id, ""),
                });
            }
            CheckId::Simulators => return self.check_simulators().await,
            _ => {}
        }
        let Some(script) = id.probe_script() else {
            return Ok(CheckResult::failed(id, ""));
        };
        match self.executor.run_script(&script).await {
            Ok(output) => Ok(CheckResult::satisfied(id, first_line(output.stdout.trim()))),
            Err(err) if err.kind == ToolErrorKind::CommandFailed => Ok(CheckResult::failed(
                id,
                first_line(err.stderr().unwrap_or("").trim()),
            )),
            Err(err) => Err(err),
        }
    }

    async fn check_simulators(&self) -> Result<CheckResult, ToolError> {
        let id = CheckId::Simulators;
        let output = match self.executor.run_script(&simulator_list_script()).await {
            Ok(output) => output,
            Err(err) if err.kind == ToolErrorKind::CommandFailed => {
                return Ok(CheckResult::failed(id, ""));
            }
            Err(err) => return Err(err),
        };
        let devices = match parse_simulators(&output.stdout) {
            Ok(devices) => devices,
            Err(err) => {
                return Ok(CheckResult::failed(
                    id,
                    format!("could not parse simctl output: {}", err),
                ))
            }
        };
        let Some(preferred) = preferred_device(&devices) else {
            return Ok(CheckResult::failed(id, ""));
        };
        let booted = devices.iter().filter(|device| device.is_booted()).count();
        Ok(CheckResult::satisfied(
            id,
            format!(
                "{} available ({} booted), e.g. {} ({})",
                devices.len(),
                booted,
                preferred.name,
                preferred.runtime
            ),
        ))
    }

    async fn apply_plan(&self, plan: &[ActionKind]) -> Vec<ActionOutcome> {
        let mut ordered = plan.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut outcomes = Vec::with_capacity(ordered.len());
        let mut aborted = false;
        for action in ordered {
            if aborted {
                outcomes.push(ActionOutcome::not_run(action));
                continue;
            }
            self.logger.info(
                "Applying action",
                Some(&serde_json::json!({ "action": action.name() })),
            );
            let outcome = self.apply_action(action).await;
            if outcome.status == ActionStatus::Failed {
                self.logger.error(
                    "Action failed; remaining actions will not run",
                    Some(&serde_json::json!({
                        "action": action.name(),
                        "error": outcome.error.as_ref().map(|err| err.message.clone()),
                    })),
                );
                aborted = true;
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn apply_action(&self, action: ActionKind) -> ActionOutcome {
        let precondition = action.precondition();
        match self.evaluate(precondition).await {
            Ok(check) if check.is_satisfied() => {
                return ActionOutcome::skipped(action, format!("already satisfied: {}", check.detail))
            }
            Ok(_) => {}
            Err(err) => return ActionOutcome::failed(action, action_error(action, &err)),
        }

        let applied = match action {
            ActionKind::StartCompanion => self.start_companion().await,
            _ => match action.apply_script() {
                Some(script) => self.executor.run_script(&script).await.map(|_| ()),
                None => Ok(()),
            },
        };
        for tool in action.invalidates() {
            self.executor.invalidate_tool(tool);
        }
        if let Err(err) = applied {
            return ActionOutcome::failed(action, self.with_log_tail(action, action_error(action, &err)).await);
        }

        if action == ActionKind::StartCompanion {
            tokio::time::sleep(self.options.daemon_grace).await;
        }
        match self.evaluate(precondition).await {
            Ok(check) if check.is_satisfied() => ActionOutcome::applied(action, check.detail),
            Ok(check) => {
                let err = ToolError::setup_failed(format!(
                    "{} did not take effect: {}",
                    action.name(),
                    check.detail
                ))
                .with_details(serde_json::json!({ "action": action.name() }));
                ActionOutcome::failed(action, self.with_log_tail(action, err).await)
            }
            Err(err) => ActionOutcome::failed(action, action_error(action, &err)),
        }
    }

    async fn start_companion(&self) -> Result<(), ToolError> {
        self.executor.invalidate_tool(toolchain::DAEMON_TOOL);
        let binary = self
            .executor
            .resolve_tool(toolchain::DAEMON_TOOL)
            .await?
            .ok_or_else(|| ToolError::setup_failed("idb_companion binary not found"))?;
        let output = self.executor.run_script(&simulator_list_script()).await?;
        let devices = parse_simulators(&output.stdout).map_err(|err| {
            ToolError::setup_failed(format!("could not parse simctl output: {}", err))
        })?;
        let device = preferred_device(&devices)
            .ok_or_else(|| ToolError::setup_failed("no simulator device to attach to"))?;
        self.logger.info(
            "Starting idb_companion",
            Some(&serde_json::json!({
                "binary": binary,
                "udid": device.udid,
                "device": device.name,
                "log": toolchain::DAEMON_LOG_PATH,
            })),
        );
        self.executor
            .run_script(&start_companion_script(&binary, &device.udid))
            .await?;
        Ok(())
    }

    async fn with_log_tail(&self, action: ActionKind, err: ToolError) -> ToolError {
        if action != ActionKind::StartCompanion {
            return err;
        }
        let tail = self
            .executor
            .run_script(&companion_log_tail_script(limits::LOG_TAIL_LINES))
            .await
            .map(|output| tail_lines(&output.stdout, limits::LOG_TAIL_LINES))
            .unwrap_or_default();
        err.with_detail("log_tail", Value::String(tail))
    }

    async fn verify(&self) -> Verification {
        let args = CommandArgs::new().option("list-targets").into_vec();
        match self.executor.execute(toolchain::CLIENT_TOOL, &args).await {
            Ok(output) => Verification {
                success: true,
                targets: output
                    .stdout
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect(),
                error: None,
            },
            Err(err) => Verification {
                success: false,
                targets: Vec::new(),
                error: Some(err.message),
            },
        }
    }
}

/// Needed actions in analysis order; apply sorts them into dependency order.
pub fn derive_plan(checks: &[CheckResult]) -> Vec<ActionKind> {
    checks
        .iter()
        .filter(|check| !check.is_satisfied())
        .filter_map(|check| check.id.remedy())
        .collect()
}

/// `None` means proceed to apply.
pub fn evaluate_gate(
    dry_run: bool,
    auto_confirm: bool,
    checks: &[CheckResult],
    plan: &[ActionKind],
) -> Option<GateOutcome> {
    if dry_run {
        return Some(GateOutcome::DryRun);
    }
    let requirements: Vec<String> = checks
        .iter()
        .filter(|check| check.id.is_requirement() && !check.is_satisfied())
        .map(|check| check.name.to_string())
        .collect();
    if !requirements.is_empty() {
        return Some(GateOutcome::Blocked { requirements });
    }
    if plan.is_empty() {
        return Some(GateOutcome::UpToDate);
    }
    if !auto_confirm {
        return Some(GateOutcome::AwaitingConfirmation {
            pending: plan.len(),
        });
    }
    None
}

fn action_error(action: ActionKind, cause: &ToolError) -> ToolError {
    let stderr = cause
        .stderr()
        .map(|text| truncate_utf8_prefix(&tail_lines(text, limits::LOG_TAIL_LINES), limits::DETAIL_MAX_BYTES));
    ToolError::setup_failed(format!(
        "{} failed: {}",
        action.name(),
        first_line(&cause.message)
    ))
    .with_details(serde_json::json!({
        "action": action.name(),
        "cause": {
            "code": cause.code,
            "exit_code": cause.exit_code(),
            "stderr": stderr,
        },
    }))
}

#[derive(Debug, Clone, Default)]
pub struct SetupRequest {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub dry_run: bool,
    pub auto_confirm: bool,
}

/// The `remote_setup` tool: picks the runner for the requested host and
/// drives a `ReconcileEngine` with it.
pub struct SetupManager {
    logger: Logger,
    validation: Validation,
    config: Arc<BridgeConfig>,
    runner: Arc<CommandRunner>,
    transport: Arc<dyn SshTransport>,
}

struct SelectedRunner {
    runner: Arc<CommandRunner>,
    label: String,
    ad_hoc_session: Option<Arc<SessionManager>>,
}

impl SetupManager {
    pub fn new(
        logger: Logger,
        validation: Validation,
        config: Arc<BridgeConfig>,
        runner: Arc<CommandRunner>,
        transport: Arc<dyn SshTransport>,
    ) -> Self {
        Self {
            logger: logger.child("setup"),
            validation,
            config,
            runner,
            transport,
        }
    }

    /// Textual report for `host` (the configured target when `None`).
    pub async fn reconcile(
        &self,
        host: Option<&str>,
        username: Option<&str>,
        dry_run: bool,
        auto_confirm: bool,
    ) -> Result<String, ToolError> {
        let request = SetupRequest {
            host: host.map(str::to_string),
            port: None,
            username: username.map(str::to_string),
            dry_run,
            auto_confirm,
        };
        Ok(self.reconcile_report(&request).await?.render())
    }

    pub async fn reconcile_report(
        &self,
        request: &SetupRequest,
    ) -> Result<ReconciliationReport, ToolError> {
        let selected = self.select_runner(request)?;
        self.logger.info(
            "Reconciling environment",
            Some(&serde_json::json!({
                "target": selected.label,
                "dry_run": request.dry_run,
                "auto_confirm": request.auto_confirm,
            })),
        );
        let options = EngineOptions {
            daemon_grace: self.config.daemon_grace,
        };
        let engine = ReconcileEngine::new(&self.logger, selected.runner.as_ref(), options);
        let result = engine
            .run(&selected.label, request.dry_run, request.auto_confirm)
            .await;
        if let Some(session) = selected.ad_hoc_session {
            session.release().await;
        }
        result
    }

    fn select_runner(&self, request: &SetupRequest) -> Result<SelectedRunner, ToolError> {
        let shared = |label: String| SelectedRunner {
            runner: self.runner.clone(),
            label,
            ad_hoc_session: None,
        };
        let configured_label = self
            .config
            .target
            .as_ref()
            .map(|target| target.label())
            .unwrap_or_else(|| "local host".to_string());

        let Some(host) = request.host.as_deref() else {
            return Ok(shared(configured_label));
        };

        if localhost::NAMES.contains(&host) && request.username.is_none() && request.port.is_none() {
            if !self.runner.is_remote() {
                return Ok(shared("local host".to_string()));
            }
            let runner = CommandRunner::local(self.logger.clone(), self.config.tool_overrides.clone());
            return Ok(SelectedRunner {
                runner: Arc::new(runner),
                label: "local host".to_string(),
                ad_hoc_session: None,
            });
        }

        if let Some(target) = self.config.target.as_ref() {
            let username = request.username.as_deref().unwrap_or(target.username());
            let same_port = request.port.map_or(true, |port| port == target.port());
            if same_port && target.same_endpoint(host, username) {
                return Ok(shared(target.label()));
            }
        }

        let username = request
            .username
            .clone()
            .or_else(|| self.config.default_username.clone())
            .ok_or_else(|| {
                ToolError::invalid_params("username is required for an unconfigured host")
                    .with_hint("Pass username, or set SIMBRIDGE_SSH_USER.")
            })?;
        let target = self.config.target_for(host, request.port, &username)?;
        let label = target.label();
        let session = Arc::new(SessionManager::new(
            self.logger.clone(),
            target,
            self.transport.clone(),
            self.config.connect_timeout,
        ));
        let runner = CommandRunner::remote(
            self.logger.clone(),
            session.clone(),
            self.config.tool_overrides.clone(),
        );
        Ok(SelectedRunner {
            runner: Arc::new(runner),
            label,
            ad_hoc_session: Some(session),
        })
    }

    fn parse_request(&self, args: &Value) -> Result<SetupRequest, ToolError> {
        let host = self
            .validation
            .ensure_optional_string(args.get("host"), "host", true)?;
        let username = self
            .validation
            .ensure_optional_string(args.get("username"), "username", true)?;
        let port = match args.get("port").filter(|v| !v.is_null()) {
            Some(value) => Some(self.validation.ensure_port(Some(value), self.config.port)?),
            None => None,
        };
        Ok(SetupRequest {
            host,
            port,
            username,
            dry_run: self
                .validation
                .ensure_optional_bool(args.get("dry_run"), "dry_run", false)?,
            auto_confirm: self.validation.ensure_optional_bool(
                args.get("auto_confirm"),
                "auto_confirm",
                false,
            )?,
        })
    }
}

#[async_trait]
impl ToolHandler for SetupManager {
    async fn handle(&self, args: Value) -> Result<Value, ToolError> {
        let request = self.parse_request(&args)?;
        let report = self.reconcile_report(&request).await?;
        Ok(serde_json::json!({
            "text": report.render(),
            "report": report,
        }))
    }
}
