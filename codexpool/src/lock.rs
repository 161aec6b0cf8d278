//! Exclusive sentinel-file locking for state files shared between processes.
//!
//! The lock lives on a sibling `<target>.lock` file (locking the target
//! itself would race the atomic-rename replace). Acquisition is a bounded
//! try-lock loop so a wedged holder cannot hang the client indefinitely.

use fs2::FileExt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 20;
const BACKOFF_MIN_MS: u64 = 10;
const BACKOFF_MAX_MS: u64 = 100;

#[derive(Debug, Clone, Copy, Default)]
pub struct LockOptions {
    /// A lock file older than this is treated as abandoned and stolen.
    pub stale_ms: Option<u64>,
}

pub fn lock_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("state");
    target.with_file_name(format!("{name}.lock"))
}

fn lock_age_ms(lock_path: &Path) -> Option<u64> {
    let modified = fs::metadata(lock_path).ok()?.modified().ok()?;
    modified.elapsed().ok().map(|age| age.as_millis() as u64)
}

fn open_lock_file(lock_path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path)
}

/// Run `f` while holding the exclusive lock for `target`. The lock is
/// released on every exit path, including when `f` errors.
pub fn with_lock<T>(
    target: &Path,
    opts: LockOptions,
    f: impl FnOnce() -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
        }
    }

    let lock_path = lock_path_for(target);
    let mut lock_file = open_lock_file(&lock_path)?;
    let mut attempt = 0u32;
    loop {
        match lock_file.try_lock_exclusive() {
            Ok(()) => break,
            Err(_) if attempt + 1 < MAX_ATTEMPTS => {
                if let Some(stale_ms) = opts.stale_ms {
                    if lock_age_ms(&lock_path).is_some_and(|age| age > stale_ms) {
                        tracing::warn!(lock = %lock_path.display(), "stealing stale lock");
                        let _ = fs::remove_file(&lock_path);
                        lock_file = open_lock_file(&lock_path)?;
                    }
                }
                attempt += 1;
                let jitter = rand::random::<u64>() % (BACKOFF_MAX_MS - BACKOFF_MIN_MS + 1);
                std::thread::sleep(Duration::from_millis(BACKOFF_MIN_MS + jitter));
            }
            Err(e) => {
                anyhow::bail!(
                    "timed out waiting for lock on {} after {} attempts: {}",
                    target.display(),
                    MAX_ATTEMPTS,
                    e
                );
            }
        }
    }

    // Touch so the holder's age is observable to stale-lock stealers.
    let _ = writeln!(&lock_file, "{}", std::process::id());
    let out = f();
    let _ = FileExt::unlock(&lock_file);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_closure_value() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("auth.json");
        let out = with_lock(&target, LockOptions::default(), || Ok(21 * 2)).unwrap();
        assert_eq!(out, 42);
        assert!(lock_path_for(&target).exists());
    }

    #[test]
    fn releases_lock_after_error() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("auth.json");
        let err: anyhow::Result<()> = with_lock(&target, LockOptions::default(), || {
            anyhow::bail!("boom")
        });
        assert!(err.is_err());
        // A second acquisition must succeed immediately.
        with_lock(&target, LockOptions::default(), || Ok(())).unwrap();
    }

    #[test]
    fn waits_for_concurrent_holder() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("auth.json");
        let lock_path = lock_path_for(&target);
        let holder = open_lock_file(&lock_path).unwrap();
        holder.lock_exclusive().unwrap();

        let target_clone = target.clone();
        let waiter = std::thread::spawn(move || {
            with_lock(&target_clone, LockOptions::default(), || Ok(7)).unwrap()
        });

        std::thread::sleep(Duration::from_millis(50));
        FileExt::unlock(&holder).unwrap();
        assert_eq!(waiter.join().unwrap(), 7);
    }

    #[test]
    fn unlocked_stale_sentinel_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("auth.json");
        fs::write(lock_path_for(&target), b"12345\n").unwrap();
        let out = with_lock(&target, LockOptions { stale_ms: Some(1) }, || Ok(1)).unwrap();
        assert_eq!(out, 1);
    }
}
