use crate::constants::toolchain::PROFILE_FILES;

fn is_shell_safe(byte: u8) -> bool {
    byte.is_ascii_alphanumeric()
        || matches!(byte, b'_' | b'-' | b'.' | b'/' | b':' | b'=' | b'@' | b'%' | b'+' | b',')
}

/// Quotes one argument for a POSIX shell. Safe tokens are left bare so
/// logged command lines stay readable.
pub fn escape_shell_value(value: &str) -> String {
    if !value.is_empty() && value.bytes().all(is_shell_safe) {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

pub fn join_escaped<S: AsRef<str>>(program: &str, args: &[S]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(escape_shell_value(program));
    parts.extend(args.iter().map(|arg| escape_shell_value(arg.as_ref())));
    parts.join(" ")
}

/// Sources the login profiles so PATH edits written by remediation are
/// visible to non-interactive remote commands. Each profile is dry-run in a
/// subshell first: a syntax error in a sourced file would otherwise kill `sh`.
pub fn profile_prelude() -> String {
    let files = PROFILE_FILES
        .iter()
        .map(|file| format!("\"{}\"", file))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "for __sb_profile in {}; do if [ -f \"$__sb_profile\" ] && ( . \"$__sb_profile\" ) >/dev/null 2>&1 </dev/null; then . \"$__sb_profile\" >/dev/null 2>&1 </dev/null; fi; done; unset __sb_profile",
        files
    )
}

pub fn with_profile_prelude(script: &str) -> String {
    format!("{}\n{}", profile_prelude(), script)
}

/// Wraps a script so it runs under `/bin/sh` with the profile prelude,
/// whatever the remote account's login shell is.
pub fn wrap_remote_script(script: &str) -> String {
    format!("/bin/sh -c {}", escape_shell_value(&with_profile_prelude(script)))
}

/// Argument vector builder that keeps option flags apart from positional
/// values. Positionals always follow an explicit `--`, so a value such as
/// `-5` or `--help` typed by a model can never be parsed as an option.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandArgs {
    options: Vec<String>,
    positionals: Vec<String>,
}

impl CommandArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn option(mut self, value: impl Into<String>) -> Self {
        self.options.push(value.into());
        self
    }

    pub fn option_value(mut self, flag: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push(flag.into());
        self.options.push(value.into());
        self
    }

    pub fn positional(mut self, value: impl Into<String>) -> Self {
        self.positionals.push(value.into());
        self
    }

    pub fn into_vec(self) -> Vec<String> {
        let mut out = self.options;
        if !self.positionals.is_empty() {
            out.push("--".to_string());
            out.extend(self.positionals);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_tokens_stay_bare() {
        assert_eq!(escape_shell_value("list-targets"), "list-targets");
        assert_eq!(escape_shell_value("/opt/homebrew/bin/idb"), "/opt/homebrew/bin/idb");
    }

    #[test]
    fn metacharacters_are_single_quoted() {
        assert_eq!(escape_shell_value(""), "''");
        assert_eq!(escape_shell_value("a b"), "'a b'");
        assert_eq!(escape_shell_value("$(rm -rf ~)"), "'$(rm -rf ~)'");
        assert_eq!(escape_shell_value("it's"), "'it'\\''s'");
        assert_eq!(escape_shell_value("say \"hi\"; ls"), "'say \"hi\"; ls'");
    }

    #[test]
    fn join_escaped_quotes_each_argument_separately() {
        let line = join_escaped("idb", &["ui", "text", "hello; world"]);
        assert_eq!(line, "idb ui text 'hello; world'");
    }

    #[test]
    fn command_args_put_positionals_after_marker() {
        let args = CommandArgs::new()
            .option("ui")
            .option("tap")
            .option_value("--udid", "ABC")
            .positional("-10")
            .positional("20")
            .into_vec();
        assert_eq!(args, vec!["ui", "tap", "--udid", "ABC", "--", "-10", "20"]);
    }

    #[test]
    fn command_args_without_positionals_has_no_marker() {
        let args = CommandArgs::new().option("list-targets").into_vec();
        assert_eq!(args, vec!["list-targets"]);
    }

    #[test]
    fn wrapped_script_runs_under_sh_with_prelude() {
        let wrapped = wrap_remote_script("command -v brew");
        assert!(wrapped.starts_with("/bin/sh -c '"));
        assert!(wrapped.contains(".zprofile"));
        assert!(wrapped.contains("command -v brew"));
    }
}
