pub mod network {
    pub const SSH_DEFAULT_PORT: u16 = 22;
    pub const TIMEOUT_SSH_CONNECT_MS: u64 = 10_000;
    pub const KEEPALIVE_INTERVAL_SECS: u32 = 30;
    pub const CHANNEL_POLL_INTERVAL_MS: u64 = 20;
}

pub mod limits {
    pub const MAX_PORT: u16 = 65_535;
    pub const MIN_PORT: u16 = 1;
    pub const MAX_CAPTURE_BYTES: usize = 4 * 1024 * 1024;
    pub const LOG_TAIL_LINES: usize = 20;
    pub const DETAIL_MAX_BYTES: usize = 2_048;
}

pub mod env {
    pub const SSH_HOST: &str = "SIMBRIDGE_SSH_HOST";
    pub const SSH_PORT: &str = "SIMBRIDGE_SSH_PORT";
    pub const SSH_USER: &str = "SIMBRIDGE_SSH_USER";
    pub const SSH_KEY_PATH: &str = "SIMBRIDGE_SSH_KEY_PATH";
    pub const SSH_KEY_PASSPHRASE: &str = "SIMBRIDGE_SSH_KEY_PASSPHRASE";
    pub const SSH_PASSWORD: &str = "SIMBRIDGE_SSH_PASSWORD";
    pub const SSH_HOST_KEY_SHA256: &str = "SIMBRIDGE_SSH_HOST_KEY_SHA256";
    pub const CONNECT_TIMEOUT_MS: &str = "SIMBRIDGE_CONNECT_TIMEOUT_MS";
    pub const IDB_PATH: &str = "SIMBRIDGE_IDB_PATH";
    pub const FILTERED_TOOLS: &str = "SIMBRIDGE_FILTERED_TOOLS";
    pub const DAEMON_GRACE_MS: &str = "SIMBRIDGE_DAEMON_GRACE_MS";
}

pub mod toolchain {
    pub const CLIENT_TOOL: &str = "idb";
    pub const DAEMON_TOOL: &str = "idb_companion";
    pub const CLIENT_PACKAGE: &str = "fb-idb";
    pub const DAEMON_FORMULA: &str = "idb-companion";
    pub const DAEMON_TAP: &str = "facebook/fb";
    pub const INTERPRETER: &str = "python3";
    pub const DAEMON_LOG_PATH: &str = "/tmp/simbridge-idb_companion.log";
    pub const DAEMON_GRACE_MS: u64 = 3_000;
    pub const SHELL_PROFILE: &str = "$HOME/.zprofile";
    pub const PROFILE_FILES: &[&str] = &["$HOME/.zprofile", "$HOME/.bash_profile", "$HOME/.profile"];
    pub const WELL_KNOWN_BIN_DIRS: &[&str] = &["/opt/homebrew/bin", "/usr/local/bin", "$HOME/.local/bin"];
    pub const HOMEBREW_PREFIXES: &[&str] = &["/opt/homebrew/bin/brew", "/usr/local/bin/brew"];
    pub const HOMEBREW_INSTALL_URL: &str =
        "https://raw.githubusercontent.com/Homebrew/install/HEAD/install.sh";
}

pub mod localhost {
    pub const NAMES: &[&str] = &["localhost", "127.0.0.1", "::1"];
}
