mod common;
use common::{session_manager, FakeTransport};

use simbridge::managers::transfer::FileTransfer;
use simbridge::services::logger::Logger;
use simbridge::utils::scratch::ScratchDir;
use std::sync::Arc;

#[tokio::test]
async fn remote_download_lands_in_scratch_and_survives_a_reconnect() {
    let source = tempfile::tempdir().expect("tempdir");
    let remote = source.path().join("screen shot.png");
    std::fs::write(&remote, b"png-bytes").expect("write");

    let scratch_root = tempfile::tempdir().expect("tempdir");
    let scratch = Arc::new(ScratchDir::with_root(scratch_root.path().join("scratch")));
    let transport = Arc::new(FakeTransport::new());
    let session = session_manager(transport.clone());
    let transfer = FileTransfer::new(Logger::new("test"), Some(session.clone()), scratch);

    session.acquire().await.expect("session");
    transport.last_session().expect("session").set_alive(false);

    let remote_str = remote.to_str().expect("utf8 path");
    let local = transfer.download_to_scratch(remote_str).await.expect("download");
    assert_eq!(std::fs::read(&local).expect("read"), b"png-bytes");
    assert!(local.starts_with(scratch_root.path()));
    assert!(local
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with("screen_shot.png")));
    assert_eq!(transport.connects(), 2);
}

#[tokio::test]
async fn local_mode_returns_the_path_untouched() {
    let scratch = Arc::new(ScratchDir::with_root(std::env::temp_dir().join("simbridge-unused")));
    let transfer = FileTransfer::new(Logger::new("test"), None, scratch.clone());
    let path = transfer
        .download_to_scratch("/tmp/capture.mp4")
        .await
        .expect("local");
    assert_eq!(path, std::path::PathBuf::from("/tmp/capture.mp4"));
    assert!(!scratch.root().exists());
}

#[tokio::test]
async fn empty_remote_path_is_rejected() {
    let scratch = Arc::new(ScratchDir::with_root(std::env::temp_dir().join("simbridge-unused-2")));
    let transfer = FileTransfer::new(
        Logger::new("test"),
        Some(session_manager(Arc::new(FakeTransport::new()))),
        scratch,
    );
    let err = transfer
        .download(" ", std::path::Path::new("/tmp/x"))
        .await
        .expect_err("empty");
    assert_eq!(err.code, "INVALID_PARAMS");
}
