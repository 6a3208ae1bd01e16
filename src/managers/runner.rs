use crate::constants::{limits, toolchain};
use crate::errors::{ToolError, ToolErrorKind};
use crate::services::logger::Logger;
use crate::services::session::SessionManager;
use crate::services::tool_paths::ToolPathCache;
use crate::utils::shell::{
    escape_shell_value, join_escaped, with_profile_prelude, wrap_remote_script,
};
use crate::utils::text::{first_line, truncate_utf8_prefix};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::RegexSet;
use serde::Serialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// The seam between callers (reconciliation, automation tools) and wherever
/// commands actually run.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    fn is_remote(&self) -> bool;

    /// Runs `command` with an explicit argument vector.
    async fn execute(&self, command: &str, args: &[String]) -> Result<CommandOutput, ToolError>;

    /// Runs a fixed shell script built from constants and escaped values.
    async fn run_script(&self, script: &str) -> Result<CommandOutput, ToolError>;

    /// Resolves a logical tool name to an absolute path, `None` when absent.
    async fn resolve_tool(&self, tool: &str) -> Result<Option<String>, ToolError>;

    fn invalidate_tool(&self, tool: &str);
}

static SETUP_SIGNATURES: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)command not found",
        r"(?i)no such file or directory",
        r"(?i)permission denied",
        r"(?i)connection refused",
        r"(?i)companion.*(not reachable|unreachable|failed to connect)",
        r"(?i)failed to connect to companion",
        r"(?i)no module named",
        r"(?i)xcrun: error",
        r"(?i)is not installed",
    ])
    .expect("setup signatures must compile")
});

const SETUP_HINT: &str = "The remote toolchain looks incomplete. Run the remote_setup tool with dry_run=true to see what is missing, then again with auto_confirm=true to fix it.";

enum Mode {
    Local,
    Remote(Arc<SessionManager>),
}

/// Executes commands on this host or through the pooled SSH session.
///
/// Every public entry point takes `exec_lock`, so commands from concurrent
/// callers queue instead of interleaving; the `_unlocked` helpers assume the
/// lock is held.
pub struct CommandRunner {
    mode: Mode,
    tool_paths: Arc<ToolPathCache>,
    overrides: BTreeMap<String, String>,
    exec_lock: Mutex<()>,
    logger: Logger,
}

impl CommandRunner {
    pub fn local(logger: Logger, overrides: BTreeMap<String, String>) -> Self {
        Self::build(logger, Mode::Local, overrides)
    }

    pub fn remote(
        logger: Logger,
        session: Arc<SessionManager>,
        overrides: BTreeMap<String, String>,
    ) -> Self {
        Self::build(logger, Mode::Remote(session), overrides)
    }

    fn build(logger: Logger, mode: Mode, overrides: BTreeMap<String, String>) -> Self {
        Self {
            mode,
            tool_paths: Arc::new(ToolPathCache::new()),
            overrides,
            exec_lock: Mutex::new(()),
            logger: logger.child("runner"),
        }
    }

    pub fn session(&self) -> Option<&Arc<SessionManager>> {
        match &self.mode {
            Mode::Local => None,
            Mode::Remote(session) => Some(session),
        }
    }

    pub fn tool_paths(&self) -> &ToolPathCache {
        &self.tool_paths
    }

    async fn execute_unlocked(
        &self,
        command: &str,
        args: &[String],
    ) -> Result<CommandOutput, ToolError> {
        let program = self
            .resolve_unlocked(command)
            .await?
            .unwrap_or_else(|| command.to_string());
        match &self.mode {
            Mode::Local => spawn_local(&program, args).await,
            Mode::Remote(session) => {
                let line = join_escaped(&program, args);
                run_remote(session, &line, wrap_remote_script(&line)).await
            }
        }
    }

    async fn run_script_unlocked(&self, script: &str) -> Result<CommandOutput, ToolError> {
        let label = script_label(script);
        match &self.mode {
            Mode::Local => {
                let args = vec!["-c".to_string(), with_profile_prelude(script)];
                spawn_local("/bin/sh", &args)
                    .await
                    .map_err(|err| relabel(err, &label))
            }
            Mode::Remote(session) => {
                run_remote(session, &label, wrap_remote_script(script)).await
            }
        }
    }

    async fn resolve_unlocked(&self, tool: &str) -> Result<Option<String>, ToolError> {
        if let Some(path) = self.overrides.get(tool) {
            return Ok(Some(path.clone()));
        }
        if tool.contains('/') {
            return Ok(Some(tool.to_string()));
        }
        if let Some(path) = self.tool_paths.get(tool) {
            return Ok(Some(path));
        }

        let resolved = match self.run_script_unlocked(&resolution_script(tool)).await {
            Ok(output) => Some(first_line(&output.stdout).trim().to_string())
                .filter(|path| path.starts_with('/')),
            Err(err) if err.kind == ToolErrorKind::CommandFailed => None,
            Err(err) => return Err(err),
        };

        match resolved.as_deref() {
            Some(path) => {
                self.logger.debug(
                    "Resolved tool path",
                    Some(&serde_json::json!({ "tool": tool, "path": path })),
                );
                self.tool_paths.insert(tool, path);
            }
            None => self.logger.debug(
                "Tool not found; falling back to bare name",
                Some(&serde_json::json!({ "tool": tool })),
            ),
        }
        Ok(resolved)
    }

    fn enrich(&self, err: ToolError) -> ToolError {
        // Transport failures say nothing about the remote toolchain.
        if !self.is_remote() || err.kind != ToolErrorKind::CommandFailed {
            return err;
        }
        let haystack = format!("{}\n{}", err.message, err.stderr().unwrap_or(""));
        if !SETUP_SIGNATURES.is_match(&haystack) {
            return err;
        }
        err.with_hint(SETUP_HINT)
            .with_detail("setup_suggested", serde_json::Value::Bool(true))
    }

    fn log_failure(&self, what: &str, err: &ToolError) {
        self.logger.warn(
            "Command failed",
            Some(&serde_json::json!({
                "command": truncate_utf8_prefix(what, limits::DETAIL_MAX_BYTES),
                "code": err.code,
                "exit_code": err.exit_code(),
            })),
        );
    }
}

#[async_trait]
impl CommandExecutor for CommandRunner {
    fn is_remote(&self) -> bool {
        matches!(self.mode, Mode::Remote(_))
    }

    async fn execute(&self, command: &str, args: &[String]) -> Result<CommandOutput, ToolError> {
        let _guard = self.exec_lock.lock().await;
        self.logger.debug(
            "execute",
            Some(&serde_json::json!({ "command": command, "args": args })),
        );
        self.execute_unlocked(command, args).await.map_err(|err| {
            self.log_failure(command, &err);
            self.enrich(err)
        })
    }

    async fn run_script(&self, script: &str) -> Result<CommandOutput, ToolError> {
        let _guard = self.exec_lock.lock().await;
        self.run_script_unlocked(script).await.map_err(|err| {
            self.log_failure(&script_label(script), &err);
            self.enrich(err)
        })
    }

    async fn resolve_tool(&self, tool: &str) -> Result<Option<String>, ToolError> {
        let _guard = self.exec_lock.lock().await;
        self.resolve_unlocked(tool).await
    }

    fn invalidate_tool(&self, tool: &str) {
        if self.tool_paths.invalidate(tool) {
            self.logger.debug(
                "Invalidated cached tool path",
                Some(&serde_json::json!({ "tool": tool })),
            );
        }
    }
}

async fn spawn_local(program: &str, args: &[String]) -> Result<CommandOutput, ToolError> {
    let display = join_escaped(program, args);
    let output = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await;
    let output = match output {
        Ok(output) => output,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ToolError::command_failed(
                &display,
                127,
                &format!("{}: command not found", program),
            ));
        }
        Err(err) => {
            return Err(ToolError::internal(format!(
                "Failed to spawn {}: {}",
                program, err
            )))
        }
    };
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if output.status.success() {
        return Ok(CommandOutput { stdout, stderr });
    }
    // Killed by a signal: no exit code.
    let exit_code = output.status.code().unwrap_or(-1);
    Err(ToolError::command_failed(&display, exit_code, &stderr))
}

async fn run_remote(
    session: &SessionManager,
    display: &str,
    line: String,
) -> Result<CommandOutput, ToolError> {
    let output = session
        .with_reconnect(display, |ssh| {
            let line = line.clone();
            async move { ssh.exec(&line).await }
        })
        .await?;
    if output.exit_code != 0 {
        return Err(ToolError::command_failed(
            display,
            output.exit_code,
            &output.stderr,
        ));
    }
    Ok(CommandOutput {
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

fn script_label(script: &str) -> String {
    let head = first_line(script.trim_start());
    let label = if script.trim().lines().count() > 1 {
        format!("sh -c {} ...", head)
    } else {
        format!("sh -c {}", head)
    };
    truncate_utf8_prefix(&label, limits::DETAIL_MAX_BYTES)
}

fn relabel(err: ToolError, label: &str) -> ToolError {
    if err.kind != ToolErrorKind::CommandFailed {
        return err;
    }
    let exit_code = err.exit_code().unwrap_or(-1);
    let stderr = err.stderr().unwrap_or("").to_string();
    ToolError::command_failed(label, exit_code, &stderr)
}

/// `command -v`, then the well-known install prefixes, then the Python user
/// base. Only absolute paths count: `command -v` reports aliases and
/// functions by name.
pub fn resolution_script(tool: &str) -> String {
    let dirs = toolchain::WELL_KNOWN_BIN_DIRS
        .iter()
        .map(|dir| format!("\"{}\"", dir))
        .collect::<Vec<_>>()
        .join(" ");
    [
        format!("tool={}", escape_shell_value(tool)),
        "p=$(command -v \"$tool\" 2>/dev/null)".to_string(),
        "case \"$p\" in /*) printf '%s\\n' \"$p\"; exit 0;; esac".to_string(),
        format!(
            "for d in {}; do if [ -x \"$d/$tool\" ]; then printf '%s\\n' \"$d/$tool\"; exit 0; fi; done",
            dirs
        ),
        format!(
            "base=$({} -m site --user-base 2>/dev/null)",
            toolchain::INTERPRETER
        ),
        "if [ -n \"$base\" ] && [ -x \"$base/bin/$tool\" ]; then printf '%s\\n' \"$base/bin/$tool\"; exit 0; fi"
            .to_string(),
        "exit 1".to_string(),
    ]
    .join("\n")
}
