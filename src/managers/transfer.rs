use crate::errors::ToolError;
use crate::services::logger::Logger;
use crate::services::session::SessionManager;
use crate::utils::scratch::ScratchDir;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Pulls artifacts (screenshots, recordings) off the remote host over SFTP,
/// sharing the runner's pooled session. A session found broken here is
/// discarded for every other user as well.
pub struct FileTransfer {
    session: Option<Arc<SessionManager>>,
    scratch: Arc<ScratchDir>,
    logger: Logger,
}

impl FileTransfer {
    pub fn new(
        logger: Logger,
        session: Option<Arc<SessionManager>>,
        scratch: Arc<ScratchDir>,
    ) -> Self {
        Self {
            session,
            scratch,
            logger: logger.child("transfer"),
        }
    }

    /// Copies `remote_path` to `local_path`. Locally the file already lives
    /// where the automation tool wrote it, so this is a no-op.
    pub async fn download(&self, remote_path: &str, local_path: &Path) -> Result<(), ToolError> {
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };
        if remote_path.trim().is_empty() {
            return Err(ToolError::invalid_params("remote_path must not be empty"));
        }
        let started = Instant::now();
        let label = format!("download {}", remote_path);
        let bytes = session
            .with_reconnect(&label, |ssh| {
                let local = local_path.to_path_buf();
                async move { ssh.download(remote_path, &local).await }
            })
            .await
            .map_err(|err| {
                self.logger.warn(
                    "Download failed",
                    Some(&serde_json::json!({
                        "remote_path": remote_path,
                        "code": err.code,
                    })),
                );
                err
            })?;
        self.logger.debug(
            "Downloaded file",
            Some(&serde_json::json!({
                "remote_path": remote_path,
                "local_path": local_path.display().to_string(),
                "bytes": bytes,
                "duration_ms": started.elapsed().as_millis() as u64,
            })),
        );
        Ok(())
    }

    /// Downloads into the process scratch directory and returns the local
    /// path. Locally the remote path is returned unchanged.
    pub async fn download_to_scratch(&self, remote_path: &str) -> Result<PathBuf, ToolError> {
        if self.session.is_none() {
            return Ok(PathBuf::from(remote_path));
        }
        let file_name = Path::new(remote_path)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("artifact");
        let local_path = self.scratch.file_path(file_name)?;
        self.download(remote_path, &local_path).await?;
        Ok(local_path)
    }
}
