//! Persisted account and auth-file shapes.

use serde::{Deserialize, Serialize};

use crate::identity;

// ---------------------------------------------------------------------------
// Auth domains and rotation strategies
// ---------------------------------------------------------------------------

/// The two auth domains the broker tracks: requests spoofed as the upstream
/// client (`native`) versus requests made as the codex tool itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Native,
    Codex,
}

impl AuthMode {
    pub const ALL: [AuthMode; 2] = [AuthMode::Native, AuthMode::Codex];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::Native => "native",
            AuthMode::Codex => "codex",
        }
    }
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    Sticky,
    Hybrid,
    RoundRobin,
}

impl RotationStrategy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "sticky" => Some(RotationStrategy::Sticky),
            "hybrid" => Some(RotationStrategy::Hybrid),
            "round_robin" | "round-robin" => Some(RotationStrategy::RoundRobin),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Account records
// ---------------------------------------------------------------------------

/// One authenticated credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountRecord {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub identity_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh: Option<String>,
    /// Epoch milliseconds at which `access` expires.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
    pub enabled: bool,
    /// Ineligible for selection until this time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<i64>,
    /// An in-flight refresh holds this advisory lease.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_lease_until: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub auth_types: Vec<AuthMode>,
}

impl Default for AccountRecord {
    fn default() -> Self {
        Self {
            identity_key: String::new(),
            account_id: None,
            email: None,
            plan: None,
            label: None,
            access: None,
            refresh: None,
            expires: None,
            enabled: true,
            cooldown_until: None,
            refresh_lease_until: None,
            last_used: None,
            auth_types: Vec::new(),
        }
    }
}

impl AccountRecord {
    /// Selection eligibility: enabled, not cooling down, no live lease.
    pub fn is_eligible(&self, now_ms: i64) -> bool {
        self.enabled
            && self.cooldown_until.unwrap_or(0) <= now_ms
            && self.refresh_lease_until.unwrap_or(0) <= now_ms
    }

    /// True when the stored bearer is still usable past the refresh buffer.
    pub fn access_is_fresh(&self, now_ms: i64, buffer_ms: i64) -> bool {
        self.access.is_some() && self.expires.unwrap_or(0) > now_ms + buffer_ms
    }

    pub fn has_auth_type(&self, mode: AuthMode) -> bool {
        self.auth_types.contains(&mode)
    }

    pub fn add_auth_type(&mut self, mode: AuthMode) {
        if !self.has_auth_type(mode) {
            self.auth_types.push(mode);
        }
    }

    pub fn display_label(&self) -> String {
        if let Some(label) = self.label.as_deref().map(str::trim) {
            if !label.is_empty() {
                return label.to_string();
            }
        }
        if let Some(email) = self.email.as_deref() {
            return email.to_string();
        }
        if let Some(plan) = self.plan.as_deref() {
            return format!("{plan} account");
        }
        let prefix: String = self.identity_key.chars().take(10).collect();
        format!("account-{prefix}")
    }

    /// Normalize display fields, adopt richer claims from the access token,
    /// and re-derive the identity key. Records whose identity is still
    /// partial keep (or gain) a legacy fingerprint key.
    pub fn synchronize_identity(&mut self) {
        self.email = normalize_lower(self.email.take());
        self.plan = normalize_lower(self.plan.take());
        self.account_id = normalize_trim(self.account_id.take());

        if let Some(access) = self.access.clone() {
            if let Some(claims) = identity::parse_claims(&access) {
                if self.account_id.is_none() {
                    self.account_id = normalize_trim(claims.account_id);
                }
                if self.email.is_none() {
                    self.email = normalize_lower(claims.email);
                }
                if self.plan.is_none() {
                    self.plan = normalize_lower(claims.plan);
                }
            }
        }

        if self.account_id.is_some() && self.email.is_some() && self.plan.is_some() {
            self.identity_key = identity::build_identity_key(
                self.account_id.as_deref(),
                self.email.as_deref(),
                self.plan.as_deref(),
            );
        } else if self.identity_key.is_empty() {
            self.identity_key = identity::legacy_fingerprint(
                self.refresh.as_deref(),
                self.email.as_deref(),
                self.plan.as_deref(),
            );
        }
    }
}

fn normalize_trim(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn normalize_lower(value: Option<String>) -> Option<String> {
    normalize_trim(value).map(|s| s.to_lowercase())
}

// ---------------------------------------------------------------------------
// Domains and the auth file root
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OAuthDomain {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RotationStrategy>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub accounts: Vec<AccountRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_identity_key: Option<String>,
}

impl OAuthDomain {
    pub fn account_by_identity(&self, identity_key: &str) -> Option<&AccountRecord> {
        self.accounts.iter().find(|a| a.identity_key == identity_key)
    }

    pub fn account_by_identity_mut(&mut self, identity_key: &str) -> Option<&mut AccountRecord> {
        self.accounts
            .iter_mut()
            .find(|a| a.identity_key == identity_key)
    }

    pub fn first_enabled(&self) -> Option<&AccountRecord> {
        self.accounts.iter().find(|a| a.enabled)
    }

    /// The account the `activeIdentityKey` pointer currently designates.
    pub fn active_account(&self) -> Option<&AccountRecord> {
        let key = self.active_identity_key.as_deref()?;
        self.account_by_identity(key)
    }
}

/// The `openai` object of the auth file: two domains plus a denormalized
/// union view kept for legacy tooling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OpenAIAuth {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub auth_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RotationStrategy>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub accounts: Vec<AccountRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_identity_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native: Option<OAuthDomain>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codex: Option<OAuthDomain>,
    // Pre-multi-account single-record oauth fields; cleared by migration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
}

impl OpenAIAuth {
    /// True for the legacy shape: a bare refresh/access pair with no
    /// account list or domains.
    pub fn is_legacy_single_record(&self) -> bool {
        self.refresh.is_some()
            && self.accounts.is_empty()
            && self.native.is_none()
            && self.codex.is_none()
    }

    pub fn domain(&self, mode: AuthMode) -> Option<&OAuthDomain> {
        match mode {
            AuthMode::Native => self.native.as_ref(),
            AuthMode::Codex => self.codex.as_ref(),
        }
    }

    pub fn domain_mut(&mut self, mode: AuthMode) -> Option<&mut OAuthDomain> {
        match mode {
            AuthMode::Native => self.native.as_mut(),
            AuthMode::Codex => self.codex.as_mut(),
        }
    }

    pub fn ensure_domain(&mut self, mode: AuthMode) -> &mut OAuthDomain {
        let slot = match mode {
            AuthMode::Native => &mut self.native,
            AuthMode::Codex => &mut self.codex,
        };
        slot.get_or_insert_with(OAuthDomain::default)
    }

    pub fn domains(&self) -> impl Iterator<Item = (AuthMode, &OAuthDomain)> {
        AuthMode::ALL
            .iter()
            .filter_map(|mode| self.domain(*mode).map(|d| (*mode, d)))
    }
}

/// Root of the persisted auth file. Top-level keys other than `openai`
/// belong to the host and are preserved verbatim when the file lives at the
/// host path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openai: Option<OpenAIAuth>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AuthFile {
    pub fn ensure_openai(&mut self) -> &mut OpenAIAuth {
        self.openai.get_or_insert_with(OpenAIAuth::default)
    }

    pub fn domain(&self, mode: AuthMode) -> Option<&OAuthDomain> {
        self.openai.as_ref().and_then(|o| o.domain(mode))
    }
}
