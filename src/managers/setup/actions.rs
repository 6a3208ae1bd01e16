use crate::constants::toolchain;
use crate::managers::setup::checks::CheckId;
use crate::utils::shell::escape_shell_value;
use serde::Serialize;

/// Remediation steps. Declaration order is dependency order: sorting a plan
/// yields the order actions must run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    InstallHomebrew,
    RegisterHomebrewPath,
    InstallPython,
    ConfigurePip,
    InstallCompanion,
    InstallClient,
    RegisterClientPath,
    StartCompanion,
}

impl ActionKind {
    pub fn name(self) -> &'static str {
        match self {
            ActionKind::InstallHomebrew => "install_homebrew",
            ActionKind::RegisterHomebrewPath => "register_homebrew_path",
            ActionKind::InstallPython => "install_python3",
            ActionKind::ConfigurePip => "configure_pip",
            ActionKind::InstallCompanion => "install_idb_companion",
            ActionKind::InstallClient => "install_fb_idb",
            ActionKind::RegisterClientPath => "register_idb_path",
            ActionKind::StartCompanion => "start_idb_companion",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ActionKind::InstallHomebrew => "Install Homebrew non-interactively",
            ActionKind::RegisterHomebrewPath => "Add `brew shellenv` to the login profile",
            ActionKind::InstallPython => "brew install python",
            ActionKind::ConfigurePip => "Bootstrap pip with ensurepip",
            ActionKind::InstallCompanion => "brew tap facebook/fb && brew install idb-companion",
            ActionKind::InstallClient => "pip install --user fb-idb",
            ActionKind::RegisterClientPath => "Add the Python user bin directory to the login profile",
            ActionKind::StartCompanion => "Launch idb_companion against a simulator",
        }
    }

    /// The check that proves this action is unnecessary. It is evaluated
    /// before applying (skip when satisfied) and again afterwards.
    pub fn precondition(self) -> CheckId {
        match self {
            ActionKind::InstallHomebrew => CheckId::Homebrew,
            ActionKind::RegisterHomebrewPath => CheckId::HomebrewPath,
            ActionKind::InstallPython => CheckId::Python,
            ActionKind::ConfigurePip => CheckId::Pip,
            ActionKind::InstallCompanion => CheckId::IdbCompanion,
            ActionKind::InstallClient => CheckId::FbIdb,
            ActionKind::RegisterClientPath => CheckId::IdbPath,
            ActionKind::StartCompanion => CheckId::CompanionRunning,
        }
    }

    /// Tools whose cached paths are stale once this action has run.
    pub fn invalidates(self) -> &'static [&'static str] {
        match self {
            ActionKind::InstallHomebrew | ActionKind::RegisterHomebrewPath => &["brew"],
            ActionKind::InstallPython => &[toolchain::INTERPRETER],
            ActionKind::InstallCompanion => &[toolchain::DAEMON_TOOL],
            ActionKind::InstallClient | ActionKind::RegisterClientPath => {
                &[toolchain::CLIENT_TOOL]
            }
            ActionKind::ConfigurePip | ActionKind::StartCompanion => &[],
        }
    }

    /// Install or registration script. The daemon start needs a resolved
    /// binary and a device, see `start_companion_script`.
    pub fn apply_script(self) -> Option<String> {
        let script = match self {
            ActionKind::InstallHomebrew => format!(
                "NONINTERACTIVE=1 /bin/bash -c \"$(curl -fsSL {})\"",
                toolchain::HOMEBREW_INSTALL_URL
            ),
            ActionKind::RegisterHomebrewPath => {
                let prefixes = toolchain::HOMEBREW_PREFIXES.join(" ");
                [
                    "brew_bin=".to_string(),
                    format!(
                        "for b in {}; do if [ -x \"$b\" ]; then brew_bin=$b; break; fi; done",
                        prefixes
                    ),
                    "[ -n \"$brew_bin\" ] || { echo 'brew not found under known prefixes' >&2; exit 1; }"
                        .to_string(),
                    "line=\"eval \\\"\\$($brew_bin shellenv)\\\"\"".to_string(),
                    append_profile_line_script(),
                ]
                .join("\n")
            }
            ActionKind::InstallPython => "brew install python".to_string(),
            ActionKind::ConfigurePip => format!(
                "{} -m ensurepip --upgrade || {} -m ensurepip --user --upgrade",
                toolchain::INTERPRETER,
                toolchain::INTERPRETER
            ),
            ActionKind::InstallCompanion => format!(
                "brew tap {} && brew install {}",
                toolchain::DAEMON_TAP,
                toolchain::DAEMON_FORMULA
            ),
            ActionKind::InstallClient => {
                let install = format!(
                    "{} -m pip install --user --upgrade {}",
                    toolchain::INTERPRETER,
                    toolchain::CLIENT_PACKAGE
                );
                // Homebrew's Python refuses user installs without this flag.
                format!("{install} || {install} --break-system-packages")
            }
            ActionKind::RegisterClientPath => [
                format!(
                    "base=$({} -m site --user-base) || exit 1",
                    toolchain::INTERPRETER
                ),
                "line=\"export PATH=\\\"$base/bin:\\$PATH\\\"\"".to_string(),
                append_profile_line_script(),
            ]
            .join("\n"),
            ActionKind::StartCompanion => return None,
        };
        Some(script)
    }
}

/// Appends `$line` to the login profile unless it is already there.
fn append_profile_line_script() -> String {
    let profile = toolchain::SHELL_PROFILE;
    format!(
        "touch \"{profile}\"\ngrep -qxF \"$line\" \"{profile}\" || printf '%s\\n' \"$line\" >> \"{profile}\""
    )
}

/// Kills any previous daemon and relaunches it detached, logging to a file.
pub fn start_companion_script(binary: &str, udid: &str) -> String {
    let log = toolchain::DAEMON_LOG_PATH;
    [
        format!("pkill -x {} >/dev/null 2>&1 || true", toolchain::DAEMON_TOOL),
        format!(
            "nohup {} --udid {} > {} 2>&1 < /dev/null &",
            escape_shell_value(binary),
            escape_shell_value(udid),
            log
        ),
        "exit 0".to_string(),
    ]
    .join("\n")
}

pub fn companion_log_tail_script(lines: usize) -> String {
    format!(
        "tail -n {} {} 2>/dev/null || true",
        lines,
        toolchain::DAEMON_LOG_PATH
    )
}
