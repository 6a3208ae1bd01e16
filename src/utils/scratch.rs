use crate::utils::fs_atomic::random_token;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Per-process directory for transient artifacts pulled from the remote
/// host. Created on first use and removed on shutdown.
#[derive(Debug)]
pub struct ScratchDir {
    root: PathBuf,
    created: AtomicBool,
}

impl ScratchDir {
    pub fn new() -> Self {
        Self::with_root(std::env::temp_dir().join(format!("simbridge-{}", std::process::id())))
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            created: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure(&self) -> io::Result<&Path> {
        if !self.created.load(Ordering::Acquire) {
            std::fs::create_dir_all(&self.root)?;
            self.created.store(true, Ordering::Release);
        }
        Ok(&self.root)
    }

    /// Unique path inside the scratch directory that keeps the file name
    /// (and extension) of `hint`.
    pub fn file_path(&self, hint: &str) -> io::Result<PathBuf> {
        let root = self.ensure()?;
        let name = Path::new(hint)
            .file_name()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("artifact");
        let sanitized: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        Ok(root.join(format!("{}-{}", random_token(8), sanitized)))
    }

    pub fn cleanup(&self) -> io::Result<()> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        self.created.store(false, Ordering::Release);
        Ok(())
    }
}

impl Default for ScratchDir {
    fn default() -> Self {
        Self::new()
    }
}
