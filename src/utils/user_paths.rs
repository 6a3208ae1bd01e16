use std::path::{Path, PathBuf};

pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Expands a leading `~` so key paths from the environment work as typed.
pub fn expand_home_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let Some(text) = path.to_str() else {
        return path.to_path_buf();
    };
    match (text, home_dir()) {
        ("~", Some(home)) => home,
        (text, Some(home)) if text.starts_with("~/") => home.join(&text[2..]),
        _ => path.to_path_buf(),
    }
}
