use crate::errors::ToolError;
use crate::managers::setup::actions::ActionKind;
use crate::managers::setup::checks::{CheckResult, CheckStatus};
use serde::Serialize;
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GateOutcome {
    DryRun,
    Blocked { requirements: Vec<String> },
    UpToDate,
    AwaitingConfirmation { pending: usize },
    Applied,
    PartiallyApplied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Applied,
    Skipped,
    Failed,
    NotRun,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub action: ActionKind,
    pub status: ActionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ActionOutcome {
    pub fn applied(action: ActionKind, detail: impl Into<String>) -> Self {
        Self {
            action,
            status: ActionStatus::Applied,
            detail: Some(detail.into()),
            error: None,
        }
    }

    pub fn skipped(action: ActionKind, detail: impl Into<String>) -> Self {
        Self {
            action,
            status: ActionStatus::Skipped,
            detail: Some(detail.into()),
            error: None,
        }
    }

    pub fn failed(action: ActionKind, error: ToolError) -> Self {
        Self {
            action,
            status: ActionStatus::Failed,
            detail: None,
            error: Some(error),
        }
    }

    pub fn not_run(action: ActionKind) -> Self {
        Self {
            action,
            status: ActionStatus::NotRun,
            detail: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    pub success: bool,
    pub targets: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub target: String,
    pub remote: bool,
    pub dry_run: bool,
    pub auto_confirm: bool,
    pub checks: Vec<CheckResult>,
    pub analysis_halted: bool,
    pub plan: Vec<ActionKind>,
    pub gate: GateOutcome,
    pub actions: Vec<ActionOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verification>,
}

impl ReconciliationReport {
    pub fn missing_requirements(&self) -> Vec<&CheckResult> {
        self.checks
            .iter()
            .filter(|check| check.status == CheckStatus::Blocking)
            .collect()
    }

    pub fn applied_actions(&self) -> Vec<ActionKind> {
        self.actions
            .iter()
            .filter(|outcome| outcome.status == ActionStatus::Applied)
            .map(|outcome| outcome.action)
            .collect()
    }

    pub fn outcome_of(&self, action: ActionKind) -> Option<ActionStatus> {
        self.actions
            .iter()
            .find(|outcome| outcome.action == action)
            .map(|outcome| outcome.status)
    }

    /// Human-readable report, as returned to tool callers and the CLI.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Environment check for {}", self.target);
        out.push('\n');
        let width = self
            .checks
            .iter()
            .map(|check| check.name.len())
            .max()
            .unwrap_or(0);
        for check in &self.checks {
            let _ = writeln!(
                out,
                "  [{:<8}] {:<width$}  {}",
                check.status.marker(),
                check.name,
                check.detail,
                width = width
            );
        }
        if self.analysis_halted {
            out.push_str("  Remaining checks were not run.\n");
        }

        let blocking = self.missing_requirements();
        if !blocking.is_empty() {
            out.push_str("\nMissing requirements (must be fixed by hand):\n");
            for check in blocking {
                let _ = writeln!(out, "  - {}: {}", check.name, check.detail);
            }
        }
        if !self.plan.is_empty() {
            let _ = writeln!(out, "\nNeeded actions ({}):", self.plan.len());
            for (idx, action) in self.plan.iter().enumerate() {
                let _ = writeln!(out, "  {}. {}: {}", idx + 1, action.name(), action.description());
            }
        }

        out.push('\n');
        match &self.gate {
            GateOutcome::DryRun => {
                out.push_str("Dry run: no changes were made.\n");
            }
            GateOutcome::Blocked { .. } => {
                out.push_str(
                    "Setup is blocked: fix the missing requirements above, then run remote_setup again. No actions were applied.\n",
                );
            }
            GateOutcome::UpToDate => {
                out.push_str("Everything is in place. Nothing to do.\n");
            }
            GateOutcome::AwaitingConfirmation { pending } => {
                let _ = writeln!(
                    out,
                    "{} action(s) pending. Run remote_setup again with auto_confirm=true to apply them.",
                    pending
                );
            }
            GateOutcome::Applied | GateOutcome::PartiallyApplied => {
                out.push_str("Results:\n");
                for outcome in &self.actions {
                    let note = match (&outcome.detail, &outcome.error) {
                        (_, Some(err)) => err.message.clone(),
                        (Some(detail), None) => detail.clone(),
                        (None, None) => String::new(),
                    };
                    let _ = writeln!(
                        out,
                        "  {:<8} {}{}",
                        status_label(outcome.status),
                        outcome.action.name(),
                        if note.is_empty() {
                            String::new()
                        } else {
                            format!(": {}", note)
                        }
                    );
                    if let Some(tail) = outcome
                        .error
                        .as_ref()
                        .and_then(|err| err.details.as_ref())
                        .and_then(|details| details.get("log_tail"))
                        .and_then(|tail| tail.as_str())
                        .filter(|tail| !tail.trim().is_empty())
                    {
                        for line in tail.lines() {
                            let _ = writeln!(out, "           | {}", line);
                        }
                    }
                }
                if let Some(verification) = &self.verification {
                    out.push('\n');
                    if verification.success {
                        let _ = writeln!(
                            out,
                            "Verification: idb list-targets reports {} target(s).",
                            verification.targets.len()
                        );
                        for target in &verification.targets {
                            let _ = writeln!(out, "  {}", target);
                        }
                    } else {
                        let _ = writeln!(
                            out,
                            "Verification failed: {}",
                            verification.error.as_deref().unwrap_or("unknown error")
                        );
                    }
                }
            }
        }
        out
    }
}

fn status_label(status: ActionStatus) -> &'static str {
    match status {
        ActionStatus::Applied => "applied",
        ActionStatus::Skipped => "skipped",
        ActionStatus::Failed => "FAILED",
        ActionStatus::NotRun => "not run",
    }
}
