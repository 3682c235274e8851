//! Pulse Node -- library crate for the remote logging runtime.
//!
//! Re-exports all internal modules so integration tests and main.rs can
//! wire producers, viewers and the local API together.

pub mod config;
pub mod connection;
pub mod device;
pub mod discovery;
pub mod event_source;
pub mod preferences;
pub mod producer;
pub mod session_task;
pub mod viewer;

use std::path::{Path, PathBuf};

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Read the API bearer token, generating one on first use.
pub fn load_or_create_token(path: &Path) -> anyhow::Result<String> {
    if path.exists() {
        let token = std::fs::read_to_string(path)?.trim().to_string();
        return Ok(token);
    }

    use rand::Rng;
    let token: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(48)
        .map(char::from)
        .collect();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, &token)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(path = %path.display(), "generated bearer token");
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde_leaves_absolute_paths() {
        assert_eq!(expand_tilde("/var/lib/pulse.db"), PathBuf::from("/var/lib/pulse.db"));
    }

    #[test]
    fn test_token_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/api-token");
        let first = load_or_create_token(&path).unwrap();
        assert_eq!(first.len(), 48);
        assert_eq!(load_or_create_token(&path).unwrap(), first);
    }
}
