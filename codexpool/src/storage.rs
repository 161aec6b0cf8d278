//! The persistent account store: load, migrate, normalize, save.
//!
//! Every mutation goes through `save_with`, which holds the exclusive file
//! lock from read to atomic rename. Loads migrate the legacy on-disk shapes
//! and re-derive identity keys, so callers only ever see normalized state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::account::{AccountRecord, AuthFile, AuthMode, OAuthDomain, OpenAIAuth};
use crate::identity;
use crate::lock::{self, LockOptions};
use crate::paths;
use crate::persist::{self, JsonReadError};

/// Quarantined auth-file copies retained per file name.
const QUARANTINE_KEEP: usize = 5;
/// A file lock older than this is assumed abandoned by a dead process.
const LOCK_STALE_MS: u64 = 30_000;

/// Whether the file is the broker's own (`Scoped`) or the host's shared auth
/// file (`Host`). The host file may carry other providers' top-level keys,
/// which must be preserved verbatim; the scoped file must not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFileKind {
    Scoped,
    Host,
}

#[derive(Debug, Clone)]
pub struct AuthStorage {
    path: PathBuf,
    kind: AuthFileKind,
}

/// Token fields committed after a successful refresh or login.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenUpdate {
    pub access: String,
    pub refresh: String,
    /// Epoch milliseconds.
    pub expires: i64,
}

impl AuthStorage {
    pub fn new(path: impl Into<PathBuf>, kind: AuthFileKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    /// The broker's own auth file at the default config path.
    pub fn scoped_default() -> Self {
        Self::new(paths::auth_file_path(), AuthFileKind::Scoped)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_options(&self) -> LockOptions {
        LockOptions {
            stale_ms: Some(LOCK_STALE_MS),
        }
    }

    /// Load under the file lock.
    pub fn load(&self) -> anyhow::Result<AuthFile> {
        lock::with_lock(&self.path, self.lock_options(), || self.load_unlocked())
    }

    /// Load without taking the file lock; acceptable for read-only tooling
    /// that can live with a torn view under concurrent writers.
    pub fn load_without_lock(&self) -> anyhow::Result<AuthFile> {
        self.load_unlocked()
    }

    fn load_unlocked(&self) -> anyhow::Result<AuthFile> {
        let mut auth = self.read_raw()?;
        normalize_auth_file(&mut auth, self.kind);
        Ok(auth)
    }

    fn read_raw(&self) -> anyhow::Result<AuthFile> {
        let value = match persist::read_json(&self.path) {
            Ok(value) => value,
            Err(JsonReadError::Missing) => return Ok(AuthFile::default()),
            Err(JsonReadError::Corrupt(err)) => {
                self.quarantine_corrupt(&err.to_string())?;
                return Ok(AuthFile::default());
            }
            Err(JsonReadError::Io(err)) => return Err(err.into()),
        };
        match serde_json::from_value::<AuthFile>(value) {
            Ok(auth) => Ok(auth),
            Err(err) => {
                self.quarantine_corrupt(&err.to_string())?;
                Ok(AuthFile::default())
            }
        }
    }

    fn quarantine_corrupt(&self, reason: &str) -> anyhow::Result<()> {
        tracing::warn!(
            path = %self.path.display(),
            reason,
            "auth file is corrupt, quarantining and continuing with an empty store"
        );
        let quarantine_dir = paths::quarantine_dir_for(&self.path);
        persist::quarantine(&self.path, &quarantine_dir, crate::now_ms(), QUARANTINE_KEEP)?;
        Ok(())
    }

    /// Read-mutate-write under the exclusive lock. The write is skipped when
    /// the serialized form is unchanged, so identity mutations leave the
    /// on-disk bytes (and mtime) alone.
    pub fn save_with<T>(
        &self,
        mutate: impl FnOnce(&mut AuthFile) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        lock::with_lock(&self.path, self.lock_options(), || {
            let before = std::fs::read(&self.path).ok();
            let mut auth = self.load_unlocked()?;
            let out = mutate(&mut auth)?;
            normalize_auth_file(&mut auth, self.kind);
            let value = serde_json::to_value(&auth)?;
            let body = persist::to_canonical_json(&value)?;
            if before.as_deref() != Some(body.as_bytes()) {
                persist::write_bytes_atomic(&self.path, body.as_bytes())?;
            }
            Ok(out)
        })
    }

    /// Put an account on cooldown (or clear it with `None`). Fail-silent
    /// when the account is absent or disabled: silent accounts are a config
    /// problem, not a quota problem.
    pub fn set_account_cooldown(
        &self,
        mode: AuthMode,
        identity_key: &str,
        until_ms: Option<i64>,
    ) -> anyhow::Result<bool> {
        self.save_with(|auth| {
            let Some(acct) = auth
                .openai
                .as_mut()
                .and_then(|o| o.domain_mut(mode))
                .and_then(|d| d.account_by_identity_mut(identity_key))
            else {
                return Ok(false);
            };
            if !acct.enabled {
                return Ok(false);
            }
            acct.cooldown_until = until_ms;
            Ok(true)
        })
    }

    /// Replace an account's token triple. Fail-silent on absence.
    pub fn update_account_tokens(
        &self,
        mode: AuthMode,
        identity_key: &str,
        tokens: &TokenUpdate,
    ) -> anyhow::Result<bool> {
        self.save_with(|auth| {
            let Some(acct) = auth
                .openai
                .as_mut()
                .and_then(|o| o.domain_mut(mode))
                .and_then(|d| d.account_by_identity_mut(identity_key))
            else {
                return Ok(false);
            };
            acct.access = Some(tokens.access.clone());
            acct.refresh = Some(tokens.refresh.clone());
            acct.expires = Some(tokens.expires);
            Ok(true)
        })
    }

    /// Fold a completed browser-OAuth result into the store and make it the
    /// active account for `mode`. Returns the account's identity key.
    pub fn upsert_account_from_login(
        &self,
        mode: AuthMode,
        tokens: TokenUpdate,
        id_token: Option<&str>,
    ) -> anyhow::Result<String> {
        let mut incoming = AccountRecord {
            access: Some(tokens.access),
            refresh: Some(tokens.refresh),
            expires: Some(tokens.expires),
            ..Default::default()
        };
        if let Some(claims) = id_token.and_then(identity::parse_claims) {
            incoming.account_id = claims.account_id;
            incoming.email = claims.email;
            incoming.plan = claims.plan;
        }
        incoming.add_auth_type(mode);
        incoming.synchronize_identity();
        let key = incoming.identity_key.clone();

        self.save_with(|auth| {
            let domain = auth.ensure_openai().ensure_domain(mode);
            if let Some(existing) = domain.account_by_identity_mut(&key) {
                existing.access = incoming.access.clone();
                existing.refresh = incoming.refresh.clone();
                existing.expires = incoming.expires;
                existing.enabled = true;
                existing.cooldown_until = None;
                existing.refresh_lease_until = None;
                existing.add_auth_type(mode);
            } else {
                domain.accounts.push(incoming.clone());
            }
            domain.active_identity_key = Some(key.clone());
            Ok(())
        })?;
        Ok(key)
    }

    /// One-shot migration of pre-multi-account install data into this file.
    pub fn import_legacy_install_data(
        &self,
        sources: &LegacyImportSources,
    ) -> anyhow::Result<LegacyImport> {
        let mut found: Vec<(&'static str, Vec<AccountRecord>)> = Vec::new();
        if let Some(path) = &sources.single_record {
            if let Some(accounts) = read_single_record_source(path) {
                found.push(("single_record", accounts));
            }
        }
        if let Some(path) = &sources.v4 {
            if let Some(accounts) = read_v4_source(path) {
                found.push(("v4", accounts));
            }
        }
        if let Some(path) = &sources.host {
            if let Some(accounts) = read_host_source(path) {
                found.push(("host", accounts));
            }
        }
        if found.is_empty() {
            return Ok(LegacyImport::default());
        }

        let sources_used: Vec<String> = found.iter().map(|(name, _)| name.to_string()).collect();
        let imported = self.save_with(|auth| {
            let mut imported = 0usize;
            for (_, accounts) in &found {
                for record in accounts {
                    if !record.enabled {
                        continue;
                    }
                    let mut record = record.clone();
                    record.synchronize_identity();
                    let modes = if record.auth_types.is_empty() {
                        vec![AuthMode::Native]
                    } else {
                        record.auth_types.clone()
                    };
                    let mut added = false;
                    for mode in modes {
                        let domain = auth.ensure_openai().ensure_domain(mode);
                        if domain.account_by_identity(&record.identity_key).is_none() {
                            let mut copy = record.clone();
                            copy.add_auth_type(mode);
                            domain.accounts.push(copy);
                            added = true;
                        }
                    }
                    if added {
                        imported += 1;
                    }
                }
            }
            Ok(imported)
        })?;
        Ok(LegacyImport {
            imported,
            sources_used,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct LegacyImportSources {
    /// Pre-multi-account single-record oauth file from earlier releases.
    pub single_record: Option<PathBuf>,
    /// The predecessor tool's v4-schema auth file.
    pub v4: Option<PathBuf>,
    /// The opencode host's auth file (its `openai` entry only).
    pub host: Option<PathBuf>,
}

impl LegacyImportSources {
    pub fn default_locations() -> Self {
        Self {
            single_record: Some(paths::legacy_oauth_file_path()),
            v4: Some(paths::legacy_v4_file_path()),
            host: Some(paths::opencode_auth_file_path()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyImport {
    pub imported: usize,
    pub sources_used: Vec<String>,
}

// ---------------------------------------------------------------------------
// Migration + normalization, applied on every load
// ---------------------------------------------------------------------------

pub(crate) fn normalize_auth_file(auth: &mut AuthFile, kind: AuthFileKind) {
    if kind == AuthFileKind::Scoped {
        auth.extra.clear();
    }
    let Some(openai) = auth.openai.as_mut() else {
        return;
    };

    // Legacy single-record oauth becomes one native-domain account.
    if openai.is_legacy_single_record() {
        let record = AccountRecord {
            access: openai.access.take(),
            refresh: openai.refresh.take(),
            expires: openai.expires.take(),
            auth_types: vec![AuthMode::Native],
            ..Default::default()
        };
        openai.ensure_domain(AuthMode::Native).accounts.push(record);
    } else {
        openai.refresh = None;
        openai.access = None;
        openai.expires = None;
    }

    // A bare union list with no domains splits by each account's authTypes.
    if !openai.accounts.is_empty() && openai.native.is_none() && openai.codex.is_none() {
        let accounts = std::mem::take(&mut openai.accounts);
        for record in accounts {
            let modes = if record.auth_types.is_empty() {
                vec![AuthMode::Native]
            } else {
                record.auth_types.clone()
            };
            for mode in modes {
                openai.ensure_domain(mode).accounts.push(record.clone());
            }
        }
    }

    for mode in AuthMode::ALL {
        if let Some(domain) = openai.domain_mut(mode) {
            normalize_domain(domain, mode);
        }
    }

    reconcile_across_domains(openai);

    for mode in AuthMode::ALL {
        if let Some(domain) = openai.domain_mut(mode) {
            fixup_active(domain);
        }
    }

    rebuild_union(openai);
}

fn normalize_domain(domain: &mut OAuthDomain, mode: AuthMode) {
    for record in &mut domain.accounts {
        record.add_auth_type(mode);
        record.synchronize_identity();
    }

    // Same canonical identity twice in one domain is the same account and
    // merges; duplicate fingerprints may be distinct accounts and get a
    // `|dup:N` suffix instead.
    let mut kept: Vec<AccountRecord> = Vec::with_capacity(domain.accounts.len());
    let mut fingerprint_counts: HashMap<String, usize> = HashMap::new();
    for record in domain.accounts.drain(..) {
        if identity::is_legacy_fingerprint(&record.identity_key) {
            let count = fingerprint_counts
                .entry(record.identity_key.clone())
                .or_insert(0);
            *count += 1;
            if *count > 1 {
                let mut record = record;
                record.identity_key = format!("{}|dup:{}", record.identity_key, *count);
                kept.push(record);
                continue;
            }
            kept.push(record);
            continue;
        }
        if let Some(existing) = kept
            .iter_mut()
            .find(|e| e.identity_key == record.identity_key)
        {
            let merged = merge_records(existing, &record);
            *existing = merged;
        } else {
            kept.push(record);
        }
    }
    domain.accounts = kept;
}

/// Reconcile the same identity held by both domains: tokens from the record
/// with the later expiry, `authTypes` unioned, `enabled` OR-ed.
fn reconcile_across_domains(openai: &mut OpenAIAuth) {
    if let (Some(native), Some(codex)) = (openai.native.as_mut(), openai.codex.as_mut()) {
        for record in &mut native.accounts {
            if let Some(twin) = codex
                .accounts
                .iter_mut()
                .find(|c| c.identity_key == record.identity_key)
            {
                let merged = merge_records(record, twin);
                *record = merged.clone();
                *twin = merged;
            }
        }
    }
}

fn fixup_active(domain: &mut OAuthDomain) {
    let valid = domain
        .active_account()
        .map(|a| a.enabled)
        .unwrap_or(false);
    if !valid {
        domain.active_identity_key = domain.first_enabled().map(|a| a.identity_key.clone());
    }
}

/// Recompute the denormalized union view plus the top-level legacy fields.
fn rebuild_union(openai: &mut OpenAIAuth) {
    let mut union: Vec<AccountRecord> = Vec::new();
    for (_, domain) in openai.domains() {
        for record in &domain.accounts {
            if let Some(existing) = union
                .iter_mut()
                .find(|e| e.identity_key == record.identity_key)
            {
                let merged = merge_records(existing, record);
                *existing = merged;
            } else {
                union.push(record.clone());
            }
        }
    }
    openai.accounts = union;
    if openai.native.is_some() || openai.codex.is_some() {
        openai.auth_type = Some("oauth".to_string());
    }
    openai.active_identity_key = openai
        .native
        .as_ref()
        .and_then(|d| d.active_identity_key.clone())
        .or_else(|| {
            openai
                .codex
                .as_ref()
                .and_then(|d| d.active_identity_key.clone())
        });
}

fn merge_records(a: &AccountRecord, b: &AccountRecord) -> AccountRecord {
    let (primary, secondary) = if b.expires.unwrap_or(0) > a.expires.unwrap_or(0) {
        (b, a)
    } else {
        (a, b)
    };
    let mut merged = primary.clone();
    merged.enabled = a.enabled || b.enabled;
    for mode in &secondary.auth_types {
        merged.add_auth_type(*mode);
    }
    if merged.account_id.is_none() {
        merged.account_id = secondary.account_id.clone();
    }
    if merged.email.is_none() {
        merged.email = secondary.email.clone();
    }
    if merged.plan.is_none() {
        merged.plan = secondary.plan.clone();
    }
    if merged.label.is_none() {
        merged.label = secondary.label.clone();
    }
    merged.last_used = a.last_used.max(b.last_used);
    merged.cooldown_until = a.cooldown_until.max(b.cooldown_until);
    merged.refresh_lease_until = a.refresh_lease_until.max(b.refresh_lease_until);
    merged
}

// ---------------------------------------------------------------------------
// Legacy import readers (foreign files, read without our lock)
// ---------------------------------------------------------------------------

fn read_value(path: &Path) -> Option<serde_json::Value> {
    match persist::read_json(path) {
        Ok(value) => Some(value),
        Err(JsonReadError::Missing) => None,
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "skipping unreadable legacy source");
            None
        }
    }
}

fn record_from_legacy_oauth(value: &serde_json::Value) -> Option<AccountRecord> {
    let obj = value.as_object()?;
    let refresh = obj.get("refresh")?.as_str()?.to_string();
    Some(AccountRecord {
        refresh: Some(refresh),
        access: obj
            .get("access")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        expires: obj.get("expires").and_then(|v| v.as_i64()),
        auth_types: vec![AuthMode::Native],
        ..Default::default()
    })
}

fn read_single_record_source(path: &Path) -> Option<Vec<AccountRecord>> {
    let value = read_value(path)?;
    let record = record_from_legacy_oauth(value.get("openai").unwrap_or(&value))?;
    Some(vec![record])
}

fn read_v4_source(path: &Path) -> Option<Vec<AccountRecord>> {
    let value = read_value(path)?;
    if value.get("version").and_then(|v| v.as_i64()) != Some(4) {
        return None;
    }
    let raw = value.get("accounts")?.as_array()?;
    let accounts: Vec<AccountRecord> = raw
        .iter()
        .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
        .collect();
    if accounts.is_empty() {
        None
    } else {
        Some(accounts)
    }
}

fn read_host_source(path: &Path) -> Option<Vec<AccountRecord>> {
    let value = read_value(path)?;
    let record = record_from_legacy_oauth(value.get("openai")?)?;
    Some(vec![record])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::encode_test_token;
    use serde_json::json;
    use std::fs;

    fn scoped_store() -> (tempfile::TempDir, AuthStorage) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        (dir, AuthStorage::new(path, AuthFileKind::Scoped))
    }

    fn token_for(account_id: &str, email: &str, plan: &str) -> String {
        encode_test_token(&json!({
            "chatgpt_account_id": account_id,
            "email": email,
            "chatgpt_plan_type": plan,
        }))
    }

    #[test]
    fn legacy_single_record_migrates_to_native_domain() {
        let (_dir, store) = scoped_store();
        let access = token_for("acc_1", "a@b.c", "plus");
        fs::write(
            store.path(),
            serde_json::to_string(&json!({
                "openai": {"type": "oauth", "refresh": "rt_1", "access": access, "expires": 99}
            }))
            .unwrap(),
        )
        .unwrap();

        let auth = store.load().unwrap();
        let native = auth.domain(AuthMode::Native).unwrap();
        assert_eq!(native.accounts.len(), 1);
        assert_eq!(native.accounts[0].identity_key, "acc_1|a@b.c|plus");
        assert_eq!(native.accounts[0].refresh.as_deref(), Some("rt_1"));
        assert_eq!(
            native.active_identity_key.as_deref(),
            Some("acc_1|a@b.c|plus")
        );
        let openai = auth.openai.as_ref().unwrap();
        assert!(openai.refresh.is_none());
        assert_eq!(openai.accounts.len(), 1);
    }

    #[test]
    fn bare_union_list_splits_by_auth_types() {
        let (_dir, store) = scoped_store();
        fs::write(
            store.path(),
            serde_json::to_string(&json!({
                "openai": {"accounts": [
                    {"identityKey": "a|x@y.z|plus", "refresh": "rt_a", "enabled": true,
                     "authTypes": ["native", "codex"]},
                    {"identityKey": "b|q@y.z|pro", "refresh": "rt_b", "enabled": true},
                ]}
            }))
            .unwrap(),
        )
        .unwrap();

        let auth = store.load().unwrap();
        assert_eq!(auth.domain(AuthMode::Native).unwrap().accounts.len(), 2);
        assert_eq!(auth.domain(AuthMode::Codex).unwrap().accounts.len(), 1);
    }

    #[test]
    fn cross_domain_twins_prefer_later_expiry_and_or_enabled() {
        let (_dir, store) = scoped_store();
        fs::write(
            store.path(),
            serde_json::to_string(&json!({
                "openai": {
                    "native": {"accounts": [
                        {"identityKey": "a|a@b.c|plus", "accountId": "a", "email": "a@b.c",
                         "plan": "plus", "refresh": "rt_old", "access": "at_old",
                         "expires": 100, "enabled": false}
                    ]},
                    "codex": {"accounts": [
                        {"identityKey": "a|a@b.c|plus", "accountId": "a", "email": "a@b.c",
                         "plan": "plus", "refresh": "rt_new", "access": "at_new",
                         "expires": 200, "enabled": true}
                    ]}
                }
            }))
            .unwrap(),
        )
        .unwrap();

        let auth = store.load().unwrap();
        let native = &auth.domain(AuthMode::Native).unwrap().accounts[0];
        assert_eq!(native.refresh.as_deref(), Some("rt_new"));
        assert!(native.enabled);
        assert!(native.has_auth_type(AuthMode::Native));
        assert!(native.has_auth_type(AuthMode::Codex));
        assert_eq!(auth.openai.as_ref().unwrap().accounts.len(), 1);
    }

    #[test]
    fn migration_is_idempotent() {
        let (_dir, store) = scoped_store();
        let access = token_for("acc_2", "m@n.o", "pro");
        fs::write(
            store.path(),
            serde_json::to_string(&json!({
                "openai": {"type": "oauth", "refresh": "rt_2", "access": access, "expires": 50}
            }))
            .unwrap(),
        )
        .unwrap();

        let once = store.load().unwrap();
        store.save_with(|_| Ok(())).unwrap();
        let twice = store.load().unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn identity_save_leaves_bytes_untouched() {
        let (_dir, store) = scoped_store();
        store
            .upsert_account_from_login(
                AuthMode::Native,
                TokenUpdate {
                    access: token_for("acc_3", "p@q.r", "plus"),
                    refresh: "rt_3".into(),
                    expires: 777,
                },
                None,
            )
            .unwrap();
        let before = fs::read(store.path()).unwrap();
        store.save_with(|_| Ok(())).unwrap();
        let after = fs::read(store.path()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn active_pointer_moves_off_disabled_accounts() {
        let (_dir, store) = scoped_store();
        fs::write(
            store.path(),
            serde_json::to_string(&json!({
                "openai": {"native": {
                    "activeIdentityKey": "a|a@b.c|plus",
                    "accounts": [
                        {"identityKey": "a|a@b.c|plus", "accountId": "a", "email": "a@b.c",
                         "plan": "plus", "refresh": "rt_a", "enabled": false},
                        {"identityKey": "b|b@b.c|plus", "accountId": "b", "email": "b@b.c",
                         "plan": "plus", "refresh": "rt_b", "enabled": true},
                    ]
                }}
            }))
            .unwrap(),
        )
        .unwrap();

        let auth = store.load().unwrap();
        assert_eq!(
            auth.domain(AuthMode::Native)
                .unwrap()
                .active_identity_key
                .as_deref(),
            Some("b|b@b.c|plus")
        );
    }

    #[test]
    fn duplicate_fingerprints_get_dup_suffix() {
        let (_dir, store) = scoped_store();
        fs::write(
            store.path(),
            serde_json::to_string(&json!({
                "openai": {"native": {"accounts": [
                    {"refresh": "rt_same", "enabled": true},
                    {"refresh": "rt_same", "enabled": true},
                ]}}
            }))
            .unwrap(),
        )
        .unwrap();

        let auth = store.load().unwrap();
        let keys: Vec<&str> = auth
            .domain(AuthMode::Native)
            .unwrap()
            .accounts
            .iter()
            .map(|a| a.identity_key.as_str())
            .collect();
        assert_eq!(keys.len(), 2);
        assert_ne!(keys[0], keys[1]);
        assert!(keys[1].ends_with("|dup:2"));
    }

    #[test]
    fn corrupt_auth_file_is_quarantined() {
        let (dir, store) = scoped_store();
        fs::write(store.path(), b"{definitely not json").unwrap();
        let auth = store.load().unwrap();
        assert!(auth.openai.is_none());
        assert!(!store.path().exists());
        let quarantined: Vec<_> = fs::read_dir(dir.path().join("corrupt"))
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(quarantined.len(), 1);
    }

    #[test]
    fn scoped_save_strips_foreign_keys_host_save_keeps_them() {
        let (_dir, scoped) = scoped_store();
        fs::write(
            scoped.path(),
            serde_json::to_string(&json!({
                "anthropic": {"key": "sk-x"},
                "openai": {"native": {"accounts": [
                    {"identityKey": "a|a@b.c|plus", "accountId": "a", "email": "a@b.c",
                     "plan": "plus", "refresh": "rt_a"}
                ]}}
            }))
            .unwrap(),
        )
        .unwrap();
        scoped.save_with(|_| Ok(())).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(scoped.path()).unwrap()).unwrap();
        assert!(value.get("anthropic").is_none());

        let dir = tempfile::tempdir().unwrap();
        let host = AuthStorage::new(dir.path().join("auth.json"), AuthFileKind::Host);
        fs::write(
            host.path(),
            serde_json::to_string(&json!({
                "anthropic": {"key": "sk-x"},
                "openai": {"native": {"accounts": [
                    {"identityKey": "a|a@b.c|plus", "accountId": "a", "email": "a@b.c",
                     "plan": "plus", "refresh": "rt_a"}
                ]}}
            }))
            .unwrap(),
        )
        .unwrap();
        host.save_with(|_| Ok(())).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(host.path()).unwrap()).unwrap();
        assert_eq!(value["anthropic"]["key"], "sk-x");
    }

    #[test]
    fn cooldown_is_fail_silent_for_disabled_and_absent() {
        let (_dir, store) = scoped_store();
        store
            .save_with(|auth| {
                let domain = auth.ensure_openai().ensure_domain(AuthMode::Native);
                domain.accounts.push(AccountRecord {
                    identity_key: "a|a@b.c|plus".into(),
                    account_id: Some("a".into()),
                    email: Some("a@b.c".into()),
                    plan: Some("plus".into()),
                    refresh: Some("rt_a".into()),
                    enabled: false,
                    ..Default::default()
                });
                Ok(())
            })
            .unwrap();

        assert!(!store
            .set_account_cooldown(AuthMode::Native, "a|a@b.c|plus", Some(10))
            .unwrap());
        assert!(!store
            .set_account_cooldown(AuthMode::Native, "missing|x|y", Some(10))
            .unwrap());
        let auth = store.load().unwrap();
        assert!(auth.domain(AuthMode::Native).unwrap().accounts[0]
            .cooldown_until
            .is_none());
    }

    #[test]
    fn token_update_replaces_the_triple() {
        let (_dir, store) = scoped_store();
        let key = store
            .upsert_account_from_login(
                AuthMode::Codex,
                TokenUpdate {
                    access: token_for("acc_4", "t@u.v", "plus"),
                    refresh: "rt_4".into(),
                    expires: 10,
                },
                None,
            )
            .unwrap();

        let updated = store
            .update_account_tokens(
                AuthMode::Codex,
                &key,
                &TokenUpdate {
                    access: token_for("acc_4", "t@u.v", "plus"),
                    refresh: "rt_4b".into(),
                    expires: 20,
                },
            )
            .unwrap();
        assert!(updated);
        let auth = store.load().unwrap();
        let acct = &auth.domain(AuthMode::Codex).unwrap().accounts[0];
        assert_eq!(acct.refresh.as_deref(), Some("rt_4b"));
        assert_eq!(acct.expires, Some(20));
    }

    #[test]
    fn legacy_import_folds_enabled_accounts() {
        let (_dir, store) = scoped_store();
        let foreign = tempfile::tempdir().unwrap();
        let v4_path = foreign.path().join("auth-v4.json");
        fs::write(
            &v4_path,
            serde_json::to_string(&json!({
                "version": 4,
                "accounts": [
                    {"identityKey": "v|v@w.x|plus", "accountId": "v", "email": "v@w.x",
                     "plan": "plus", "refresh": "rt_v", "enabled": true},
                    {"identityKey": "d|d@w.x|plus", "accountId": "d", "email": "d@w.x",
                     "plan": "plus", "refresh": "rt_d", "enabled": false},
                ]
            }))
            .unwrap(),
        )
        .unwrap();
        let host_path = foreign.path().join("host-auth.json");
        fs::write(
            &host_path,
            serde_json::to_string(&json!({
                "openai": {"type": "oauth", "refresh": "rt_host", "access": null, "expires": 5}
            }))
            .unwrap(),
        )
        .unwrap();

        let report = store
            .import_legacy_install_data(&LegacyImportSources {
                single_record: Some(foreign.path().join("absent.json")),
                v4: Some(v4_path),
                host: Some(host_path),
            })
            .unwrap();
        assert_eq!(report.imported, 2);
        assert_eq!(report.sources_used, vec!["v4", "host"]);

        let auth = store.load().unwrap();
        let native = auth.domain(AuthMode::Native).unwrap();
        assert_eq!(native.accounts.len(), 2);
        assert!(native.account_by_identity("v|v@w.x|plus").is_some());
    }
}
