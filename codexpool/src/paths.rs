//! File-path resolution for the broker's persisted state.
//!
//! Precedence for the base directory: explicit argument > XDG variable >
//! `$HOME/.config` fallback. Relative XDG values are rejected (ignored), per
//! the XDG basedir rules.

use std::path::{Path, PathBuf};

pub const CONFIG_DIR_NAME: &str = "codexpool";
pub const AUTH_FILE_NAME: &str = "auth.json";
pub const SNAPSHOTS_FILE_NAME: &str = "rate-limit-snapshots.json";
pub const AFFINITY_FILE_NAME: &str = "session-affinity.json";
pub const QUARANTINE_DIR_NAME: &str = "corrupt";
/// Pre-multi-account single-record oauth file written by earlier releases.
pub const LEGACY_OAUTH_FILE_NAME: &str = "oauth.json";
/// v4-schema auth file written by the predecessor tool.
pub const LEGACY_V4_FILE_NAME: &str = "auth-v4.json";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid session key")]
pub struct InvalidSessionKey;

fn env_path(var: &str) -> Option<PathBuf> {
    let raw = std::env::var(var).ok()?;
    absolute_path(&raw)
}

fn absolute_path(raw: &str) -> Option<PathBuf> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let path = PathBuf::from(trimmed);
    if path.is_absolute() {
        Some(path)
    } else {
        tracing::debug!(value = trimmed, "ignoring relative XDG path");
        None
    }
}

fn home_dir() -> PathBuf {
    env_path("HOME")
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// The broker's own config directory.
pub fn config_dir() -> PathBuf {
    resolve_config_dir(std::env::var("XDG_CONFIG_HOME").ok().as_deref())
}

fn resolve_config_dir(xdg_config_home: Option<&str>) -> PathBuf {
    if let Some(base) = xdg_config_home.and_then(absolute_path) {
        return base.join(CONFIG_DIR_NAME);
    }
    home_dir().join(".config").join(CONFIG_DIR_NAME)
}

pub fn auth_file_path() -> PathBuf {
    config_dir().join(AUTH_FILE_NAME)
}

pub fn snapshots_file_path() -> PathBuf {
    config_dir().join(SNAPSHOTS_FILE_NAME)
}

pub fn affinity_file_path() -> PathBuf {
    config_dir().join(AFFINITY_FILE_NAME)
}

/// Quarantine directory for a given auth file (sibling `corrupt/`).
pub fn quarantine_dir_for(auth_path: &Path) -> PathBuf {
    auth_path
        .parent()
        .map(|p| p.join(QUARANTINE_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(QUARANTINE_DIR_NAME))
}

pub fn legacy_oauth_file_path() -> PathBuf {
    config_dir().join(LEGACY_OAUTH_FILE_NAME)
}

pub fn legacy_v4_file_path() -> PathBuf {
    config_dir().join(LEGACY_V4_FILE_NAME)
}

/// The `opencode` host's own auth file, consulted for legacy import only.
pub fn opencode_auth_file_path() -> PathBuf {
    resolve_opencode_auth_file(std::env::var("XDG_DATA_HOME").ok().as_deref())
}

fn resolve_opencode_auth_file(xdg_data_home: Option<&str>) -> PathBuf {
    let base = match xdg_data_home.and_then(absolute_path) {
        Some(base) => base,
        None => home_dir().join(".local").join("share"),
    };
    base.join("opencode").join("auth.json")
}

/// Session keys become path components; anything that could escape the
/// sessions directory is rejected.
pub fn validate_session_key(key: &str) -> Result<(), InvalidSessionKey> {
    if key.is_empty() || key.contains('/') || key.contains('\\') || key.contains("..") {
        return Err(InvalidSessionKey);
    }
    Ok(())
}

/// Path of a client session file under `sessions_dir`, used by the
/// session-affinity pruner's existence probe.
pub fn session_file_path(sessions_dir: &Path, key: &str) -> Result<PathBuf, InvalidSessionKey> {
    validate_session_key(key)?;
    Ok(sessions_dir.join(format!("{key}.json")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_xdg_value_wins() {
        let dir = resolve_config_dir(Some("/xdg/config"));
        assert_eq!(dir, PathBuf::from("/xdg/config").join(CONFIG_DIR_NAME));
    }

    #[test]
    fn relative_xdg_value_is_rejected() {
        let dir = resolve_config_dir(Some("relative/config"));
        assert!(dir.ends_with(Path::new(".config").join(CONFIG_DIR_NAME)));
    }

    #[test]
    fn opencode_path_uses_data_home() {
        let p = resolve_opencode_auth_file(Some("/data"));
        assert_eq!(p, PathBuf::from("/data/opencode/auth.json"));
    }

    #[test]
    fn session_key_safety() {
        assert!(validate_session_key("ses_abc-123").is_ok());
        assert_eq!(validate_session_key(""), Err(InvalidSessionKey));
        assert_eq!(validate_session_key("a/b"), Err(InvalidSessionKey));
        assert_eq!(validate_session_key("a\\b"), Err(InvalidSessionKey));
        assert_eq!(validate_session_key("..evil"), Err(InvalidSessionKey));
    }

    #[test]
    fn session_file_path_joins_key() {
        let p = session_file_path(Path::new("/tmp/sessions"), "ses_1").unwrap();
        assert_eq!(p, PathBuf::from("/tmp/sessions/ses_1.json"));
        assert!(session_file_path(Path::new("/tmp/sessions"), "../x").is_err());
    }
}
