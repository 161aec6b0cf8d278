//! Per-identity rate-limit snapshots parsed from response headers.
//!
//! Snapshots feed the status dashboard collaborator; they are a cache and
//! never gate selection. A header-less probe response must not overwrite a
//! good snapshot, so parsing yields `None` when no limits are present.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::lock::{self, LockOptions};
use crate::paths;
use crate::persist::{self, JsonReadError};

const SNAPSHOT_LOCK_STALE_MS: u64 = 30_000;
const HEADER_PREFIX: &str = "x-ratelimit-";
const LEFT_PCT_SUFFIX: &str = "-left-percent";
const RESETS_SUFFIX: &str = "-resets-after-seconds";
const MODEL_FAMILY_HEADER: &str = "x-ratelimit-model-family";
const CREDITS_HAS_HEADER: &str = "x-ratelimit-credits-has";
const CREDITS_REMAINING_HEADER: &str = "x-ratelimit-credits-remaining";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitWindow {
    pub name: String,
    /// Rounded percent remaining, clamped to 0..=100.
    pub left_pct: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resets_at: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreditsInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_credits: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSnapshot {
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_family: Option<String>,
    pub limits: Vec<RateLimitWindow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credits: Option<CreditsInfo>,
}

/// `identityKey -> snapshot`. A `BTreeMap` keeps the serialized order
/// stable so idempotent saves skip the write.
pub type SnapshotMap = BTreeMap<String, RateLimitSnapshot>;

/// Build a snapshot from a lower-cased header map. Returns `None` when the
/// headers carry no limit windows at all.
pub fn snapshot_from_headers(
    headers: &HashMap<String, String>,
    now_ms: i64,
) -> Option<RateLimitSnapshot> {
    let mut limits = Vec::new();
    for (header, value) in headers {
        let Some(rest) = header.strip_prefix(HEADER_PREFIX) else {
            continue;
        };
        let Some(name) = rest.strip_suffix(LEFT_PCT_SUFFIX) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        let Ok(raw_pct) = value.trim().parse::<f64>() else {
            continue;
        };
        if !raw_pct.is_finite() {
            continue;
        }
        let left_pct = raw_pct.round().clamp(0.0, 100.0) as u8;

        let resets_at = headers
            .get(&format!("{HEADER_PREFIX}{name}{RESETS_SUFFIX}"))
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(|secs| now_ms + (secs * 1000.0) as i64);

        limits.push(RateLimitWindow {
            name: name.to_string(),
            left_pct,
            resets_at,
        });
    }
    if limits.is_empty() {
        return None;
    }
    limits.sort_by(|a, b| a.name.cmp(&b.name));

    let credits_has = headers
        .get(CREDITS_HAS_HEADER)
        .map(|v| v.trim().eq_ignore_ascii_case("true"));
    let credits_remaining = headers
        .get(CREDITS_REMAINING_HEADER)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|f| f.is_finite());
    let credits = if credits_has.is_some() || credits_remaining.is_some() {
        Some(CreditsInfo {
            has_credits: credits_has,
            remaining: credits_remaining,
        })
    } else {
        None
    };

    Some(RateLimitSnapshot {
        updated_at: now_ms,
        model_family: headers.get(MODEL_FAMILY_HEADER).cloned(),
        limits,
        credits,
    })
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> Self {
        Self::new(paths::snapshots_file_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or corrupt files read as empty; snapshots are disposable.
    pub fn load(&self) -> SnapshotMap {
        match persist::read_json(&self.path) {
            Ok(value) => serde_json::from_value(value).unwrap_or_else(|err| {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "ignoring malformed snapshot file"
                );
                SnapshotMap::new()
            }),
            Err(JsonReadError::Missing) => SnapshotMap::new(),
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "ignoring unreadable snapshot file"
                );
                SnapshotMap::new()
            }
        }
    }

    /// Lock-then-atomic-rename mutation, same discipline as the auth store.
    pub fn save_with(
        &self,
        mutate: impl FnOnce(&mut SnapshotMap),
    ) -> anyhow::Result<()> {
        lock::with_lock(
            &self.path,
            LockOptions {
                stale_ms: Some(SNAPSHOT_LOCK_STALE_MS),
            },
            || {
                let before = std::fs::read(&self.path).ok();
                let mut map = self.load();
                mutate(&mut map);
                let value = serde_json::to_value(&map)?;
                let body = persist::to_canonical_json(&value)?;
                if before.as_deref() != Some(body.as_bytes()) {
                    persist::write_bytes_atomic(&self.path, body.as_bytes())?;
                }
                Ok(())
            },
        )
    }

    /// Record a snapshot for an identity; best-effort, errors logged.
    pub fn record(&self, identity_key: &str, snapshot: RateLimitSnapshot) {
        let result = self.save_with(|map| {
            map.insert(identity_key.to_string(), snapshot);
        });
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to persist rate-limit snapshot");
        }
    }

    /// Drop snapshots for identities that no longer exist in the auth file.
    pub fn prune(&self, live_identities: &HashSet<String>) {
        let result = self.save_with(|map| {
            map.retain(|key, _| live_identities.contains(key));
        });
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to prune rate-limit snapshots");
        }
    }
}
