//! Atomic JSON persistence with owner-only modes and corrupt-file quarantine.
//!
//! Writes go to a uniquely named temp file in the target directory, get
//! fsynced, then renamed over the target so concurrent readers never observe
//! a partial file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum JsonReadError {
    #[error("file not found")]
    Missing,
    #[error("corrupt JSON: {0}")]
    Corrupt(#[source] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read and parse a JSON file. `ENOENT` maps to [`JsonReadError::Missing`]
/// so callers can substitute the empty record; parse failures map to
/// [`JsonReadError::Corrupt`] and the caller decides whether to quarantine.
pub fn read_json(path: &Path) -> Result<serde_json::Value, JsonReadError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(JsonReadError::Missing),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes).map_err(JsonReadError::Corrupt)
}

/// Stable serialization: two-space indentation plus a trailing newline.
pub fn to_canonical_json(value: &serde_json::Value) -> serde_json::Result<String> {
    let mut body = serde_json::to_string_pretty(value)?;
    body.push('\n');
    Ok(body)
}

pub fn write_json_atomic(path: &Path, value: &serde_json::Value) -> anyhow::Result<()> {
    let body = to_canonical_json(value)?;
    write_bytes_atomic(path, body.as_bytes())
}

/// Atomic replace: temp file in the target directory, fsync, chmod 0600,
/// rename, then directory fsync on POSIX.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| anyhow::anyhow!("path has no parent directory: {}", path.display()))?;
    fs::create_dir_all(parent)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("path has no file name: {}", path.display()))?;
    let tmp = parent.join(format!(
        "{file_name}.tmp.{}.{:08x}",
        std::process::id(),
        rand::random::<u32>()
    ));

    let write_result = (|| -> anyhow::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600));
        }
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if write_result.is_err() {
        let _ = fs::remove_file(&tmp);
        return write_result;
    }

    sync_dir(parent)?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    use std::io::ErrorKind;
    let handle = fs::File::open(dir)?;
    match handle.sync_all() {
        Ok(()) => Ok(()),
        // Some filesystems refuse directory fsync with EPERM/EINVAL.
        Err(e) if matches!(e.kind(), ErrorKind::PermissionDenied | ErrorKind::InvalidInput) => {
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Move a corrupt file into `quarantine_dir` under a timestamped name and
/// retain only the `keep` most recent quarantined copies of that file.
pub fn quarantine(
    path: &Path,
    quarantine_dir: &Path,
    now_ms: i64,
    keep: usize,
) -> std::io::Result<Option<PathBuf>> {
    let file_name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name.to_string(),
        None => return Ok(None),
    };
    if !path.exists() {
        return Ok(None);
    }
    fs::create_dir_all(quarantine_dir)?;
    let dest = quarantine_dir.join(format!("{file_name}.{now_ms}"));
    fs::rename(path, &dest)?;

    let prefix = format!("{file_name}.");
    let mut stamped: Vec<(i64, PathBuf)> = Vec::new();
    for entry in fs::read_dir(quarantine_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stamp) = name.strip_prefix(&prefix) else {
            continue;
        };
        if let Ok(ts) = stamp.parse::<i64>() {
            stamped.push((ts, entry.path()));
        }
    }
    stamped.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, old) in stamped.into_iter().skip(keep.max(1)) {
        let _ = fs::remove_file(old);
    }
    Ok(Some(dest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_file_reads_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_json(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, JsonReadError::Missing));
    }

    #[test]
    fn corrupt_file_reads_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, b"{not json").unwrap();
        let err = read_json(&path).unwrap_err();
        assert!(matches!(err, JsonReadError::Corrupt(_)));
    }

    #[test]
    fn atomic_write_round_trips_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_json_atomic(&path, &json!({"a": 1})).unwrap();
        let value = read_json(&path).unwrap();
        assert_eq!(value, json!({"a": 1}));

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn canonical_json_is_indented_with_trailing_newline() {
        let body = to_canonical_json(&json!({"a": {"b": 1}})).unwrap();
        assert!(body.ends_with('\n'));
        assert!(body.contains("  \"a\""));
    }

    #[cfg(unix)]
    #[test]
    fn written_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_json_atomic(&path, &json!({})).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn quarantine_rotates_old_copies() {
        let dir = tempfile::tempdir().unwrap();
        let qdir = dir.path().join("corrupt");
        let path = dir.path().join("auth.json");
        for i in 0..4 {
            fs::write(&path, b"{broken").unwrap();
            quarantine(&path, &qdir, 1_000 + i, 2).unwrap();
        }
        let kept: Vec<_> = fs::read_dir(&qdir).unwrap().filter_map(|e| e.ok()).collect();
        assert_eq!(kept.len(), 2);
        assert!(!path.exists());
    }

    #[test]
    fn quarantine_of_absent_file_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let out = quarantine(
            &dir.path().join("auth.json"),
            &dir.path().join("corrupt"),
            1,
            3,
        )
        .unwrap();
        assert!(out.is_none());
    }
}
