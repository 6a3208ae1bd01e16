use async_trait::async_trait;
use simbridge::errors::{ToolError, ToolErrorKind};
use simbridge::managers::runner::{CommandExecutor, CommandOutput};
use simbridge::managers::setup::actions::{companion_log_tail_script, ActionKind};
use simbridge::managers::setup::checks::{simulator_list_script, CheckId, CheckStatus};
use simbridge::managers::setup::report::{ActionStatus, GateOutcome};
use simbridge::managers::setup::{EngineOptions, ReconcileEngine};
use simbridge::services::logger::Logger;
use std::sync::Mutex;
use std::time::Duration;

const SIMCTL_JSON: &str = r#"{"devices":{"com.apple.CoreSimulator.SimRuntime.iOS-17-4":[
    {"udid":"AAAA-1111","name":"iPhone 15","state":"Shutdown","isAvailable":true}
]}}"#;

/// What is installed on the pretend Mac. Probes read it, remediation
/// scripts flip it.
#[derive(Debug, Clone)]
struct HostState {
    reachable: bool,
    macos: bool,
    xcode: bool,
    brew: bool,
    brew_on_path: bool,
    python: bool,
    pip: bool,
    companion: bool,
    fb_idb: bool,
    idb_on_path: bool,
    companion_running: bool,
    companion_starts: bool,
    python_bundles_pip: bool,
    ensurepip_broken: bool,
}

impl HostState {
    fn provisioned() -> Self {
        Self {
            reachable: true,
            macos: true,
            xcode: true,
            brew: true,
            brew_on_path: true,
            python: true,
            pip: true,
            companion: true,
            fb_idb: true,
            idb_on_path: true,
            companion_running: true,
            companion_starts: true,
            python_bundles_pip: false,
            ensurepip_broken: false,
        }
    }

    fn fresh_mac() -> Self {
        Self {
            brew: false,
            brew_on_path: false,
            python: false,
            pip: false,
            companion: false,
            fb_idb: false,
            idb_on_path: false,
            companion_running: false,
            ..Self::provisioned()
        }
    }
}

struct FakeHost {
    state: Mutex<HostState>,
    applied: Mutex<Vec<&'static str>>,
    invalidated: Mutex<Vec<String>>,
}

impl FakeHost {
    fn new(state: HostState) -> Self {
        Self {
            state: Mutex::new(state),
            applied: Mutex::new(Vec::new()),
            invalidated: Mutex::new(Vec::new()),
        }
    }

    fn applied(&self) -> Vec<&'static str> {
        self.applied.lock().unwrap().clone()
    }

    fn invalidated(&self) -> Vec<String> {
        self.invalidated.lock().unwrap().clone()
    }

    fn probe(&self, id: CheckId) -> bool {
        let state = self.state.lock().unwrap();
        match id {
            CheckId::Ssh => state.reachable,
            CheckId::Macos => state.macos,
            CheckId::Xcode => state.xcode,
            CheckId::Simulators => state.xcode,
            CheckId::Homebrew => state.brew,
            CheckId::HomebrewPath => state.brew_on_path,
            CheckId::Python => state.python,
            CheckId::Pip => state.pip,
            CheckId::IdbCompanion => state.companion,
            CheckId::FbIdb => state.fb_idb,
            CheckId::IdbPath => state.idb_on_path,
            CheckId::CompanionRunning => state.companion_running,
        }
    }

    fn apply(&self, action: ActionKind) {
        self.applied.lock().unwrap().push(action.name());
        let mut state = self.state.lock().unwrap();
        match action {
            ActionKind::InstallHomebrew => state.brew = true,
            ActionKind::RegisterHomebrewPath => state.brew_on_path = true,
            ActionKind::InstallPython => {
                state.python = true;
                state.pip |= state.python_bundles_pip;
            }
            ActionKind::ConfigurePip => state.pip = true,
            ActionKind::InstallCompanion => state.companion = true,
            ActionKind::InstallClient => state.fb_idb = true,
            ActionKind::RegisterClientPath => state.idb_on_path = true,
            ActionKind::StartCompanion => state.companion_running = state.companion_starts,
        }
    }
}

const ACTIONS: [ActionKind; 7] = [
    ActionKind::InstallHomebrew,
    ActionKind::RegisterHomebrewPath,
    ActionKind::InstallPython,
    ActionKind::ConfigurePip,
    ActionKind::InstallCompanion,
    ActionKind::InstallClient,
    ActionKind::RegisterClientPath,
];

fn ok(stdout: &str) -> Result<CommandOutput, ToolError> {
    Ok(CommandOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
    })
}

#[async_trait]
impl CommandExecutor for FakeHost {
    fn is_remote(&self) -> bool {
        true
    }

    async fn execute(&self, command: &str, args: &[String]) -> Result<CommandOutput, ToolError> {
        if command == "idb" && args == ["list-targets"] && self.probe(CheckId::CompanionRunning) {
            return ok("iPhone 15 | AAAA-1111 | Shutdown | simulator | iOS 17.4\n");
        }
        Err(ToolError::command_failed(command, 1, "Failed to connect to companion"))
    }

    async fn run_script(&self, script: &str) -> Result<CommandOutput, ToolError> {
        if !self.probe(CheckId::Ssh) {
            return Err(ToolError::connection("Connection refused"));
        }
        if script == simulator_list_script() {
            return if self.probe(CheckId::Simulators) {
                ok(SIMCTL_JSON)
            } else {
                Err(ToolError::command_failed("xcrun", 72, "xcrun: error: unable to find utility"))
            };
        }
        if script == companion_log_tail_script(20) {
            return ok("companion: failed to boot simulator\n");
        }
        if script.starts_with("pkill -x idb_companion") {
            self.apply(ActionKind::StartCompanion);
            return ok("");
        }
        for id in CheckId::ALL {
            if id.probe_script().as_deref() == Some(script) {
                return if self.probe(id) {
                    ok(&format!("{} present\n", id.name()))
                } else {
                    Err(ToolError::command_failed(id.name(), 1, ""))
                };
            }
        }
        for action in ACTIONS {
            if action.apply_script().as_deref() == Some(script) {
                if action == ActionKind::ConfigurePip && self.state.lock().unwrap().ensurepip_broken {
                    return Err(ToolError::command_failed(
                        "sh -c python3 -m ensurepip --upgrade ...",
                        1,
                        "ensurepip is disabled in this build of Python\n",
                    ));
                }
                self.apply(action);
                return ok("");
            }
        }
        panic!("unexpected script: {script}");
    }

    async fn resolve_tool(&self, tool: &str) -> Result<Option<String>, ToolError> {
        let found = match tool {
            "idb_companion" => self.probe(CheckId::IdbCompanion),
            "idb" => self.probe(CheckId::IdbPath),
            _ => false,
        };
        Ok(found.then(|| format!("/opt/homebrew/bin/{tool}")))
    }

    fn invalidate_tool(&self, tool: &str) {
        self.invalidated.lock().unwrap().push(tool.to_string());
    }
}

fn engine(host: &FakeHost) -> ReconcileEngine<'_> {
    ReconcileEngine::new(
        &Logger::new("test"),
        host,
        EngineOptions {
            daemon_grace: Duration::from_millis(1),
        },
    )
}

#[tokio::test]
async fn dry_run_reports_the_plan_and_changes_nothing() {
    let host = FakeHost::new(HostState::fresh_mac());
    let report = engine(&host).run("mac", true, true).await.expect("report");

    assert_eq!(report.gate, GateOutcome::DryRun);
    assert_eq!(report.plan.len(), 8);
    assert!(report.actions.is_empty());
    assert!(host.applied().is_empty());
    assert!(report.render().contains("Dry run: no changes were made."));
}

#[tokio::test]
async fn missing_requirement_blocks_even_with_auto_confirm() {
    let host = FakeHost::new(HostState {
        xcode: false,
        ..HostState::fresh_mac()
    });
    let report = engine(&host).run("mac", false, true).await.expect("report");

    assert_eq!(
        report.gate,
        GateOutcome::Blocked {
            requirements: vec!["xcode".to_string(), "simulators".to_string()]
        }
    );
    assert!(host.applied().is_empty());
    let xcode = report.checks.iter().find(|c| c.name == "xcode").expect("xcode");
    assert_eq!(xcode.status, CheckStatus::Blocking);
}

#[tokio::test]
async fn unreachable_host_halts_analysis() {
    let host = FakeHost::new(HostState {
        reachable: false,
        ..HostState::provisioned()
    });
    let report = engine(&host).run("mac", false, true).await.expect("report");

    assert!(report.analysis_halted);
    assert_eq!(report.checks.len(), 1);
    assert_eq!(
        report.gate,
        GateOutcome::Blocked {
            requirements: vec!["ssh".to_string()]
        }
    );
}

#[tokio::test]
async fn non_macos_host_stops_after_the_platform_check() {
    let host = FakeHost::new(HostState {
        macos: false,
        ..HostState::fresh_mac()
    });
    let report = engine(&host).run("linux-box", false, true).await.expect("report");

    assert!(report.analysis_halted);
    let names: Vec<&str> = report.checks.iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["ssh", "macos"]);
    assert!(report.plan.is_empty());
    assert!(host.applied().is_empty());
}

#[tokio::test]
async fn provisioned_host_is_up_to_date() {
    let host = FakeHost::new(HostState::provisioned());
    let report = engine(&host).run("mac", false, false).await.expect("report");
    assert_eq!(report.gate, GateOutcome::UpToDate);
    assert!(report.render().contains("Nothing to do."));
}

#[tokio::test]
async fn confirmation_gate_then_dependency_ordered_apply() {
    let host = FakeHost::new(HostState::fresh_mac());

    let pending = engine(&host).run("mac", false, false).await.expect("report");
    assert_eq!(pending.gate, GateOutcome::AwaitingConfirmation { pending: 8 });
    assert!(host.applied().is_empty());
    assert!(pending.render().contains("auto_confirm=true"));

    let report = engine(&host).run("mac", false, true).await.expect("report");
    assert_eq!(report.gate, GateOutcome::Applied);
    assert_eq!(
        host.applied(),
        vec![
            "install_homebrew",
            "register_homebrew_path",
            "install_python3",
            "configure_pip",
            "install_idb_companion",
            "install_fb_idb",
            "register_idb_path",
            "start_idb_companion",
        ]
    );
    let verification = report.verification.expect("verified");
    assert!(verification.success);
    assert_eq!(verification.targets.len(), 1);

    let again = engine(&host).run("mac", false, true).await.expect("report");
    assert_eq!(again.gate, GateOutcome::UpToDate);
}

#[tokio::test]
async fn satisfied_precondition_skips_the_action() {
    let host = FakeHost::new(HostState {
        python: false,
        pip: false,
        python_bundles_pip: true,
        ..HostState::provisioned()
    });
    let report = engine(&host).run("mac", false, true).await.expect("report");

    assert_eq!(report.plan, vec![ActionKind::InstallPython, ActionKind::ConfigurePip]);
    assert_eq!(report.gate, GateOutcome::Applied);
    assert_eq!(report.outcome_of(ActionKind::ConfigurePip), Some(ActionStatus::Skipped));
    assert_eq!(host.applied(), vec!["install_python3"]);
}

#[tokio::test]
async fn daemon_that_never_comes_up_fails_with_log_tail() {
    let host = FakeHost::new(HostState {
        fb_idb: false,
        companion_running: false,
        companion_starts: false,
        ..HostState::provisioned()
    });
    let report = engine(&host).run("mac", false, true).await.expect("report");

    assert_eq!(report.gate, GateOutcome::PartiallyApplied);
    assert_eq!(report.outcome_of(ActionKind::InstallClient), Some(ActionStatus::Applied));
    assert_eq!(report.outcome_of(ActionKind::StartCompanion), Some(ActionStatus::Failed));
    assert!(report.verification.is_none());

    let failed = report
        .actions
        .iter()
        .find(|outcome| outcome.action == ActionKind::StartCompanion)
        .and_then(|outcome| outcome.error.as_ref())
        .expect("error");
    let tail = failed.details.as_ref().expect("details")["log_tail"]
        .as_str()
        .expect("tail");
    assert!(tail.contains("failed to boot simulator"));
    assert!(report.render().contains("failed to boot simulator"));
}

#[tokio::test]
async fn first_failure_leaves_later_actions_unrun() {
    let host = FakeHost::new(HostState {
        ensurepip_broken: true,
        ..HostState::fresh_mac()
    });
    let report = engine(&host).run("mac", false, true).await.expect("report");

    assert_eq!(report.gate, GateOutcome::PartiallyApplied);
    assert!(report.verification.is_none());
    assert_eq!(
        report.applied_actions(),
        vec![
            ActionKind::InstallHomebrew,
            ActionKind::RegisterHomebrewPath,
            ActionKind::InstallPython,
        ]
    );
    assert_eq!(
        host.applied(),
        vec!["install_homebrew", "register_homebrew_path", "install_python3"]
    );
    assert_eq!(report.outcome_of(ActionKind::ConfigurePip), Some(ActionStatus::Failed));
    for later in [
        ActionKind::InstallCompanion,
        ActionKind::InstallClient,
        ActionKind::RegisterClientPath,
        ActionKind::StartCompanion,
    ] {
        assert_eq!(report.outcome_of(later), Some(ActionStatus::NotRun), "{}", later.name());
    }

    let err = report
        .actions
        .iter()
        .find(|outcome| outcome.action == ActionKind::ConfigurePip)
        .and_then(|outcome| outcome.error.as_ref())
        .expect("error");
    assert_eq!(err.kind, ToolErrorKind::SetupFailed);
    let cause = &err.details.as_ref().expect("details")["cause"];
    assert_eq!(cause["exit_code"], 1);
    assert!(cause["stderr"]
        .as_str()
        .is_some_and(|stderr| stderr.contains("ensurepip is disabled")));
}

#[tokio::test]
async fn installs_invalidate_cached_tool_paths() {
    let host = FakeHost::new(HostState {
        companion: false,
        fb_idb: false,
        ..HostState::provisioned()
    });
    let report = engine(&host).run("mac", false, true).await.expect("report");
    assert_eq!(report.gate, GateOutcome::Applied);

    let invalidated = host.invalidated();
    assert!(invalidated.iter().any(|tool| tool == "idb_companion"));
    assert!(invalidated.iter().any(|tool| tool == "idb"));
}
