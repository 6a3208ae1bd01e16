use rand::{distributions::Alphanumeric, Rng};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn ensure_dir_for_file(path: impl AsRef<Path>) -> io::Result<()> {
    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

pub fn temp_sibling_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("temp");
    parent.join(format!(".{}.{}.tmp", file_name, random_token(8)))
}

/// Moves a fully written temp file over `dest`, removing the temp file when
/// the rename fails.
pub fn finalize_temp_file(tmp: &Path, dest: &Path) -> io::Result<()> {
    if let Err(err) = fs::rename(tmp, dest) {
        let _ = fs::remove_file(tmp);
        return Err(err);
    }
    Ok(())
}
