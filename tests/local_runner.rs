mod common;
use common::ENV_LOCK;

use simbridge::managers::runner::{CommandExecutor, CommandRunner};
use simbridge::managers::setup::actions::ActionKind;
use simbridge::managers::setup::checks::CheckId;
use simbridge::services::logger::Logger;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Restores an environment variable when dropped.
struct EnvVar {
    key: &'static str,
    previous: Option<OsString>,
}

impl EnvVar {
    fn set(key: &'static str, value: impl AsRef<std::ffi::OsStr>) -> Self {
        let previous = std::env::var_os(key);
        std::env::set_var(key, value);
        Self { key, previous }
    }
}

impl Drop for EnvVar {
    fn drop(&mut self) {
        match &self.previous {
            Some(value) => std::env::set_var(self.key, value),
            None => std::env::remove_var(self.key),
        }
    }
}

fn write_executable(path: &Path, body: &str) {
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    std::fs::write(path, body).expect("write");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
}

fn runner() -> CommandRunner {
    CommandRunner::local(Logger::new("test"), BTreeMap::new())
}

#[tokio::test]
async fn registered_client_path_is_visible_to_later_local_commands() {
    let _env = ENV_LOCK.lock().await;
    let home = tempfile::tempdir().expect("tempdir");
    let user_base = home.path().join("userbase");
    let client = user_base.join("bin").join("idb");
    write_executable(
        &client,
        "#!/bin/sh\necho 'iPhone 15 | AAAA-1111 | Booted | simulator | iOS 17.4'\n",
    );
    // Stands in for the interpreter the registration asks for its user base.
    let stub_bin = home.path().join("stub-bin");
    write_executable(
        &stub_bin.join("python3"),
        &format!(
            "#!/bin/sh\n[ \"$*\" = \"-m site --user-base\" ] || exit 1\nprintf '%s\\n' '{}'\n",
            user_base.display()
        ),
    );
    let inherited = std::env::var("PATH").unwrap_or_default();
    let _home = EnvVar::set("HOME", home.path());
    let _path = EnvVar::set("PATH", format!("{}:{}", stub_bin.display(), inherited));

    let runner = runner();
    let probe = CheckId::IdbPath.probe_script().expect("probe");
    runner
        .run_script(&probe)
        .await
        .expect_err("idb is not on PATH yet");

    let register = ActionKind::RegisterClientPath.apply_script().expect("script");
    runner.run_script(&register).await.expect("register");
    let profile = std::fs::read_to_string(home.path().join(".zprofile")).expect("profile");
    assert!(profile.contains(&format!("{}/bin", user_base.display())));

    let found = runner.run_script(&probe).await.expect("idb on PATH");
    assert_eq!(found.stdout.trim(), client.display().to_string());

    let targets = runner
        .execute("idb", &["list-targets".to_string()])
        .await
        .expect("idb list-targets");
    assert!(targets.stdout.contains("AAAA-1111"));
    assert_eq!(
        runner.tool_paths().get("idb"),
        Some(client.display().to_string())
    );
}

#[tokio::test]
async fn broken_profile_does_not_break_local_scripts() {
    let _env = ENV_LOCK.lock().await;
    let home = tempfile::tempdir().expect("tempdir");
    std::fs::write(home.path().join(".zprofile"), "if then fi (\n").expect("profile");
    let _home = EnvVar::set("HOME", home.path());

    let out = runner().run_script("echo still-here").await.expect("script");
    assert_eq!(out.stdout, "still-here\n");
}
