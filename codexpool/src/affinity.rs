//! Persistent sticky/hybrid session assignments.
//!
//! The in-memory maps owned by the broker are authoritative; this file is a
//! cache that survives restarts. Loads sanitize aggressively (the file is
//! shared between processes and versions), saves are best-effort, and stale
//! entries are pruned lazily against a session-existence probe.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::account::AuthMode;
use crate::lock::{self, LockOptions};
use crate::paths;
use crate::persist::{self, JsonReadError};

/// Session keys tracked per map before the oldest are evicted.
pub const MAX_TRACKED_SESSIONS: usize = 200;

const AFFINITY_LOCK_STALE_MS: u64 = 30_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModeRecord {
    pub seen_session_keys: HashMap<String, i64>,
    pub sticky_by_session_key: HashMap<String, String>,
    pub hybrid_by_session_key: HashMap<String, String>,
}

impl ModeRecord {
    pub fn is_empty(&self) -> bool {
        self.seen_session_keys.is_empty()
            && self.sticky_by_session_key.is_empty()
            && self.hybrid_by_session_key.is_empty()
    }
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionAffinityFile {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native: Option<ModeRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codex: Option<ModeRecord>,
}

impl Default for SessionAffinityFile {
    fn default() -> Self {
        Self {
            version: 1,
            native: None,
            codex: None,
        }
    }
}

impl SessionAffinityFile {
    pub fn mode_record(&self, mode: AuthMode) -> Option<&ModeRecord> {
        match mode {
            AuthMode::Native => self.native.as_ref(),
            AuthMode::Codex => self.codex.as_ref(),
        }
    }

    pub fn mode_record_mut(&mut self, mode: AuthMode) -> Option<&mut ModeRecord> {
        match mode {
            AuthMode::Native => self.native.as_mut(),
            AuthMode::Codex => self.codex.as_mut(),
        }
    }

    /// Install a mode's record; empty records are dropped instead.
    pub fn set_mode_record(&mut self, mode: AuthMode, record: ModeRecord) {
        let slot = match mode {
            AuthMode::Native => &mut self.native,
            AuthMode::Codex => &mut self.codex,
        };
        *slot = if record.is_empty() {
            None
        } else {
            Some(record)
        };
    }

    pub fn is_empty(&self) -> bool {
        self.native.is_none() && self.codex.is_none()
    }

    /// Drop entries whose session no longer exists on disk, honoring a
    /// grace period from the session's `lastSeen` so brand-new sessions the
    /// client has not flushed yet survive.
    pub fn prune(
        &mut self,
        session_exists: &dyn Fn(&str) -> bool,
        now_ms: i64,
        missing_grace_ms: i64,
    ) {
        for mode in AuthMode::ALL {
            let Some(record) = self.mode_record_mut(mode) else {
                continue;
            };
            let seen = record.seen_session_keys.clone();
            let keep = |key: &str| {
                if session_exists(key) {
                    return true;
                }
                let last_seen = seen.get(key).copied().unwrap_or(0);
                now_ms - last_seen <= missing_grace_ms
            };
            record.seen_session_keys.retain(|key, _| keep(key));
            record.sticky_by_session_key.retain(|key, _| keep(key));
            record.hybrid_by_session_key.retain(|key, _| keep(key));
            if record.is_empty() {
                self.set_mode_record(mode, ModeRecord::default());
            }
        }
    }
}

/// Evict entries beyond the cap, lowest `lastSeen` first. Assignment maps
/// use the seen map's timestamps as their age; unknown sessions age as 0.
fn cap_record(record: &mut ModeRecord) {
    let ages: HashMap<String, i64> = record.seen_session_keys.clone();
    evict_over_cap(&mut record.seen_session_keys, &ages);
    evict_over_cap(&mut record.sticky_by_session_key, &ages);
    evict_over_cap(&mut record.hybrid_by_session_key, &ages);
}

fn evict_over_cap<V>(map: &mut HashMap<String, V>, ages: &HashMap<String, i64>) {
    if map.len() <= MAX_TRACKED_SESSIONS {
        return;
    }
    let mut keys: Vec<(i64, String)> = map
        .keys()
        .map(|k| (ages.get(k).copied().unwrap_or(0), k.clone()))
        .collect();
    keys.sort();
    let excess = map.len() - MAX_TRACKED_SESSIONS;
    for (_, key) in keys.into_iter().take(excess) {
        map.remove(&key);
    }
}

fn sanitize_mode(raw: &serde_json::Value) -> ModeRecord {
    let mut record = ModeRecord::default();
    let Some(obj) = raw.as_object() else {
        return record;
    };

    if let Some(seen) = obj.get("seenSessionKeys").and_then(|v| v.as_object()) {
        for (key, value) in seen {
            if paths::validate_session_key(key).is_err() {
                continue;
            }
            let Some(last_seen) = value.as_i64().or_else(|| {
                value
                    .as_f64()
                    .filter(|f| f.is_finite())
                    .map(|f| f as i64)
            }) else {
                continue;
            };
            record.seen_session_keys.insert(key.clone(), last_seen);
        }
    }

    for (field, target) in [
        ("stickyBySessionKey", &mut record.sticky_by_session_key),
        ("hybridBySessionKey", &mut record.hybrid_by_session_key),
    ] {
        if let Some(map) = obj.get(field).and_then(|v| v.as_object()) {
            for (key, value) in map {
                if paths::validate_session_key(key).is_err() {
                    continue;
                }
                let Some(identity) = value.as_str().filter(|s| !s.is_empty()) else {
                    continue;
                };
                target.insert(key.clone(), identity.to_string());
            }
        }
    }

    cap_record(&mut record);
    record
}

fn sanitize_file(value: &serde_json::Value) -> SessionAffinityFile {
    let mut file = SessionAffinityFile::default();
    let Some(obj) = value.as_object() else {
        return file;
    };
    for mode in AuthMode::ALL {
        if let Some(raw) = obj.get(mode.as_str()) {
            file.set_mode_record(mode, sanitize_mode(raw));
        }
    }
    file
}

#[derive(Debug, Clone)]
pub struct SessionAffinityStore {
    path: PathBuf,
}

impl SessionAffinityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> Self {
        Self::new(paths::affinity_file_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and sanitize. Missing or corrupt files yield the empty record;
    /// this is a cache, not a source of truth.
    pub fn load(&self) -> SessionAffinityFile {
        match persist::read_json(&self.path) {
            Ok(value) => sanitize_file(&value),
            Err(JsonReadError::Missing) => SessionAffinityFile::default(),
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "ignoring unreadable session-affinity file"
                );
                SessionAffinityFile::default()
            }
        }
    }

    /// Best-effort save under the file lock; failures are logged and
    /// swallowed.
    pub fn save(&self, file: &SessionAffinityFile) {
        if file.is_empty() && !self.path.exists() {
            return;
        }
        let mut capped = file.clone();
        for mode in AuthMode::ALL {
            if let Some(record) = capped.mode_record_mut(mode) {
                cap_record(record);
            }
        }
        let result = lock::with_lock(
            &self.path,
            LockOptions {
                stale_ms: Some(AFFINITY_LOCK_STALE_MS),
            },
            || {
                let value = serde_json::to_value(&capped)?;
                persist::write_json_atomic(&self.path, &value)
            },
        );
        if let Err(err) = result {
            tracing::warn!(
                path = %self.path.display(),
                error = %err,
                "failed to persist session affinity"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionAffinityStore::new(dir.path().join("session-affinity.json"));
        assert!(store.load().is_empty());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionAffinityStore::new(dir.path().join("session-affinity.json"));
        let mut file = SessionAffinityFile::default();
        let mut record = ModeRecord::default();
        record.seen_session_keys.insert("ses_1".into(), 100);
        record
            .sticky_by_session_key
            .insert("ses_1".into(), "a|a@b.c|plus".into());
        file.set_mode_record(AuthMode::Native, record);
        store.save(&file);

        let loaded = store.load();
        assert_eq!(loaded.version, 1);
        let record = loaded.mode_record(AuthMode::Native).unwrap();
        assert_eq!(
            record.sticky_by_session_key.get("ses_1").map(String::as_str),
            Some("a|a@b.c|plus")
        );
    }

    #[test]
    fn sanitize_drops_invalid_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session-affinity.json");
        fs::write(
            &path,
            serde_json::to_string(&json!({
                "version": 1,
                "native": {
                    "seenSessionKeys": {"ses_ok": 5, "": 9, "bad": "not-a-number"},
                    "stickyBySessionKey": {
                        "ses_ok": "id_1",
                        "../evil": "id_2",
                        "ses_empty": ""
                    },
                    "hybridBySessionKey": {"ses_ok": 17}
                }
            }))
            .unwrap(),
        )
        .unwrap();

        let loaded = SessionAffinityStore::new(path).load();
        let record = loaded.mode_record(AuthMode::Native).unwrap();
        assert_eq!(record.seen_session_keys.len(), 1);
        assert_eq!(record.sticky_by_session_key.len(), 1);
        assert!(record.hybrid_by_session_key.is_empty());
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session-affinity.json");
        fs::write(&path, b"{nope").unwrap();
        assert!(SessionAffinityStore::new(path).load().is_empty());
    }

    #[test]
    fn cap_evicts_lowest_last_seen_first() {
        let mut record = ModeRecord::default();
        for i in 0..(MAX_TRACKED_SESSIONS + 5) {
            let key = format!("ses_{i}");
            record.seen_session_keys.insert(key.clone(), i as i64);
            record
                .sticky_by_session_key
                .insert(key, format!("id_{i}"));
        }
        cap_record(&mut record);
        assert_eq!(record.seen_session_keys.len(), MAX_TRACKED_SESSIONS);
        assert_eq!(record.sticky_by_session_key.len(), MAX_TRACKED_SESSIONS);
        // The five oldest are gone.
        for i in 0..5 {
            assert!(!record.seen_session_keys.contains_key(&format!("ses_{i}")));
        }
        assert!(record
            .seen_session_keys
            .contains_key(&format!("ses_{}", MAX_TRACKED_SESSIONS + 4)));
    }

    #[test]
    fn prune_honors_existence_probe_and_grace() {
        let mut file = SessionAffinityFile::default();
        let mut record = ModeRecord::default();
        record.seen_session_keys.insert("ses_live".into(), 1_000);
        record.seen_session_keys.insert("ses_gone_old".into(), 1_000);
        record.seen_session_keys.insert("ses_gone_new".into(), 9_500);
        record
            .sticky_by_session_key
            .insert("ses_gone_old".into(), "id".into());
        record
            .sticky_by_session_key
            .insert("ses_live".into(), "id".into());
        file.set_mode_record(AuthMode::Native, record);

        let exists = |key: &str| key == "ses_live";
        file.prune(&exists, 10_000, 1_000);

        let record = file.mode_record(AuthMode::Native).unwrap();
        assert!(record.seen_session_keys.contains_key("ses_live"));
        assert!(record.seen_session_keys.contains_key("ses_gone_new"));
        assert!(!record.seen_session_keys.contains_key("ses_gone_old"));
        assert!(!record.sticky_by_session_key.contains_key("ses_gone_old"));
        assert!(record.sticky_by_session_key.contains_key("ses_live"));
    }
}
