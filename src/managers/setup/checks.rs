use crate::constants::toolchain;
use crate::managers::setup::actions::ActionKind;
use crate::utils::shell::escape_shell_value;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Satisfied,
    Missing,
    Blocking,
}

impl CheckStatus {
    pub fn marker(self) -> &'static str {
        match self {
            CheckStatus::Satisfied => "ok",
            CheckStatus::Missing => "missing",
            CheckStatus::Blocking => "blocking",
        }
    }
}

/// Everything the engine inspects on a host, in analysis order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CheckId {
    Ssh,
    Macos,
    Xcode,
    Simulators,
    Homebrew,
    HomebrewPath,
    Python,
    Pip,
    IdbCompanion,
    FbIdb,
    IdbPath,
    CompanionRunning,
}

impl CheckId {
    pub const ALL: [CheckId; 12] = [
        CheckId::Ssh,
        CheckId::Macos,
        CheckId::Xcode,
        CheckId::Simulators,
        CheckId::Homebrew,
        CheckId::HomebrewPath,
        CheckId::Python,
        CheckId::Pip,
        CheckId::IdbCompanion,
        CheckId::FbIdb,
        CheckId::IdbPath,
        CheckId::CompanionRunning,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CheckId::Ssh => "ssh",
            CheckId::Macos => "macos",
            CheckId::Xcode => "xcode",
            CheckId::Simulators => "simulators",
            CheckId::Homebrew => "homebrew",
            CheckId::HomebrewPath => "homebrew_path",
            CheckId::Python => "python3",
            CheckId::Pip => "pip",
            CheckId::IdbCompanion => "idb_companion",
            CheckId::FbIdb => "fb_idb",
            CheckId::IdbPath => "idb_path",
            CheckId::CompanionRunning => "idb_companion_running",
        }
    }

    /// Requirements cannot be fixed by this tool; a failure blocks apply.
    pub fn is_requirement(self) -> bool {
        matches!(
            self,
            CheckId::Ssh | CheckId::Macos | CheckId::Xcode | CheckId::Simulators
        )
    }

    /// A blocking failure here makes every later check meaningless.
    pub fn halts_analysis(self) -> bool {
        matches!(self, CheckId::Ssh | CheckId::Macos)
    }

    pub fn remedy(self) -> Option<ActionKind> {
        match self {
            CheckId::Homebrew => Some(ActionKind::InstallHomebrew),
            CheckId::HomebrewPath => Some(ActionKind::RegisterHomebrewPath),
            CheckId::Python => Some(ActionKind::InstallPython),
            CheckId::Pip => Some(ActionKind::ConfigurePip),
            CheckId::IdbCompanion => Some(ActionKind::InstallCompanion),
            CheckId::FbIdb => Some(ActionKind::InstallClient),
            CheckId::IdbPath => Some(ActionKind::RegisterClientPath),
            CheckId::CompanionRunning => Some(ActionKind::StartCompanion),
            CheckId::Ssh | CheckId::Macos | CheckId::Xcode | CheckId::Simulators => None,
        }
    }

    pub fn failure_status(self) -> CheckStatus {
        if self.is_requirement() {
            CheckStatus::Blocking
        } else {
            CheckStatus::Missing
        }
    }

    /// Message used when a probe fails without printing anything useful.
    pub fn failure_detail(self) -> &'static str {
        match self {
            CheckId::Ssh => "host unreachable",
            CheckId::Macos => "host is not running macOS",
            CheckId::Xcode => "xcrun simctl unavailable; install Xcode and select it with xcode-select",
            CheckId::Simulators => "no available simulator devices; create one in Xcode",
            CheckId::Homebrew => "Homebrew is not installed",
            CheckId::HomebrewPath => "brew is installed but not on PATH",
            CheckId::Python => "python3 not found",
            CheckId::Pip => "pip is not available for python3",
            CheckId::IdbCompanion => "idb_companion binary not found",
            CheckId::FbIdb => "fb-idb Python package not installed",
            CheckId::IdbPath => "idb client is not on PATH",
            CheckId::CompanionRunning => "idb_companion is not running",
        }
    }

    /// Shell probe for the check: exit 0 means satisfied and the first stdout
    /// line is the detail. `None` for checks the engine evaluates itself.
    pub fn probe_script(self) -> Option<String> {
        let script = match self {
            CheckId::Ssh => "echo connected".to_string(),
            CheckId::Macos => [
                "[ \"$(uname -s)\" = Darwin ] || { echo \"host is $(uname -s), not macOS\" >&2; exit 1; }",
                "printf 'macOS %s\\n' \"$(sw_vers -productVersion)\"",
            ]
            .join("\n"),
            CheckId::Xcode => [
                "xcrun simctl help >/dev/null 2>&1 || exit 1",
                "xcode-select -p",
            ]
            .join("\n"),
            CheckId::Simulators => simulator_list_script(),
            CheckId::Homebrew => {
                let prefixes = toolchain::HOMEBREW_PREFIXES.join(" ");
                [
                    "p=$(command -v brew 2>/dev/null) && { printf '%s\\n' \"$p\"; exit 0; }".to_string(),
                    format!(
                        "for b in {}; do if [ -x \"$b\" ]; then printf '%s\\n' \"$b\"; exit 0; fi; done",
                        prefixes
                    ),
                    "exit 1".to_string(),
                ]
                .join("\n")
            }
            CheckId::HomebrewPath => absolute_command_script("brew"),
            CheckId::Python => [
                absolute_command_script(toolchain::INTERPRETER),
                format!("{} --version >/dev/null 2>&1", toolchain::INTERPRETER),
            ]
            .join("\n"),
            CheckId::Pip => format!("{} -m pip --version", toolchain::INTERPRETER),
            CheckId::IdbCompanion => return None,
            CheckId::FbIdb => format!(
                "v=$({} -m pip show {} 2>/dev/null | sed -n 's/^Version: //p')\n[ -n \"$v\" ] || exit 1\nprintf '{} %s\\n' \"$v\"",
                toolchain::INTERPRETER,
                toolchain::CLIENT_PACKAGE,
                toolchain::CLIENT_PACKAGE
            ),
            CheckId::IdbPath => absolute_command_script(toolchain::CLIENT_TOOL),
            CheckId::CompanionRunning => format!(
                "pids=$(pgrep -x {}) || exit 1\nprintf 'pid %s\\n' \"$(printf '%s' \"$pids\" | tr '\\n' ' ')\"",
                toolchain::DAEMON_TOOL
            ),
        };
        Some(script)
    }
}

/// Succeeds only when `command -v` yields an absolute path, so aliases and
/// shell functions do not count as installed binaries.
fn absolute_command_script(tool: &str) -> String {
    format!(
        "p=$(command -v {} 2>/dev/null) || exit 1\ncase \"$p\" in /*) printf '%s\\n' \"$p\";; *) exit 1;; esac",
        escape_shell_value(tool)
    )
}

pub fn simulator_list_script() -> String {
    "xcrun simctl list devices available -j".to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    #[serde(skip)]
    pub id: CheckId,
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckResult {
    pub fn satisfied(id: CheckId, detail: impl Into<String>) -> Self {
        Self {
            id,
            name: id.name(),
            status: CheckStatus::Satisfied,
            detail: detail.into(),
        }
    }

    pub fn failed(id: CheckId, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            id,
            name: id.name(),
            status: id.failure_status(),
            detail: if detail.trim().is_empty() {
                id.failure_detail().to_string()
            } else {
                detail
            },
        }
    }

    pub fn is_satisfied(&self) -> bool {
        self.status == CheckStatus::Satisfied
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SimulatorDevice {
    pub udid: String,
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(skip)]
    pub runtime: String,
}

impl SimulatorDevice {
    pub fn is_booted(&self) -> bool {
        self.state.eq_ignore_ascii_case("booted")
    }
}

#[derive(Debug, Deserialize)]
struct SimctlDeviceList {
    #[serde(default)]
    devices: BTreeMap<String, Vec<Value>>,
}

/// Parses `xcrun simctl list devices available -j`. Entries that do not look
/// like devices are ignored.
pub fn parse_simulators(raw: &str) -> Result<Vec<SimulatorDevice>, serde_json::Error> {
    let list: SimctlDeviceList = serde_json::from_str(raw)?;
    let mut out = Vec::new();
    for (runtime, entries) in list.devices {
        for entry in entries {
            if entry.get("isAvailable").and_then(Value::as_bool) == Some(false) {
                continue;
            }
            if let Ok(mut device) = serde_json::from_value::<SimulatorDevice>(entry) {
                device.runtime = runtime
                    .rsplit('.')
                    .next()
                    .unwrap_or(runtime.as_str())
                    .to_string();
                out.push(device);
            }
        }
    }
    Ok(out)
}

/// Booted devices first; the daemon is pointed at the first one.
pub fn preferred_device(devices: &[SimulatorDevice]) -> Option<&SimulatorDevice> {
    devices
        .iter()
        .find(|device| device.is_booted())
        .or_else(|| devices.first())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMCTL_JSON: &str = r#"{
      "devices": {
        "com.apple.CoreSimulator.SimRuntime.iOS-17-5": [
          {"udid": "AAA", "name": "iPhone 15", "state": "Shutdown", "isAvailable": true},
          {"udid": "BBB", "name": "iPhone 15 Pro", "state": "Booted", "isAvailable": true}
        ],
        "com.apple.CoreSimulator.SimRuntime.watchOS-10-5": [
          {"udid": "CCC", "name": "Watch", "state": "Shutdown", "isAvailable": false}
        ]
      }
    }"#;

    #[test]
    fn parses_available_devices_and_prefers_booted() {
        let devices = parse_simulators(SIMCTL_JSON).expect("json");
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].runtime, "iOS-17-5");
        let preferred = preferred_device(&devices).expect("device");
        assert_eq!(preferred.udid, "BBB");
    }

    #[test]
    fn empty_device_list_has_no_preference() {
        let devices = parse_simulators(r#"{"devices": {}}"#).expect("json");
        assert!(preferred_device(&devices).is_none());
    }

    #[test]
    fn requirement_failures_block_and_others_are_missing() {
        assert_eq!(CheckResult::failed(CheckId::Xcode, "").status, CheckStatus::Blocking);
        let pip = CheckResult::failed(CheckId::Pip, "");
        assert_eq!(pip.status, CheckStatus::Missing);
        assert_eq!(pip.detail, "pip is not available for python3");
    }

    #[test]
    fn every_non_requirement_has_a_remedy() {
        for id in CheckId::ALL {
            assert_eq!(id.remedy().is_some(), !id.is_requirement(), "{}", id.name());
        }
    }

    #[test]
    fn analysis_order_matches_declaration() {
        let names: Vec<_> = CheckId::ALL.iter().map(|id| id.name()).collect();
        assert_eq!(names.first(), Some(&"ssh"));
        assert_eq!(names.last(), Some(&"idb_companion_running"));
        assert!(CheckId::IdbCompanion.probe_script().is_none());
    }
}
