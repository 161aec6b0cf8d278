//! Unverified identity extraction from issuer tokens.
//!
//! Tokens are opaque to the broker; only the middle JWT segment is decoded
//! for account hints. No signature verification happens here, so the claims
//! are never trusted for anything beyond display and identity keying.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

const AUTH_CLAIMS: &str = "https://api.openai.com/auth";
const PROFILE_CLAIMS: &str = "https://api.openai.com/profile";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityClaims {
    pub account_id: Option<String>,
    pub email: Option<String>,
    pub plan: Option<String>,
}

fn non_empty(value: Option<&serde_json::Value>) -> Option<String> {
    let s = value?.as_str()?.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Decode the payload segment of a token and pull out the identity hints.
/// Claims may live at the top level or under the vendor-namespaced objects.
/// Returns `None` for anything that is not a JWT-shaped object payload.
pub fn parse_claims(token: &str) -> Option<IdentityClaims> {
    let mut segments = token.split('.');
    segments.next()?;
    let payload = segments.next()?;
    let raw = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&raw).ok()?;
    let top = value.as_object()?;

    let auth = top.get(AUTH_CLAIMS).and_then(|v| v.as_object());
    let profile = top.get(PROFILE_CLAIMS).and_then(|v| v.as_object());

    let account_id = non_empty(top.get("chatgpt_account_id"))
        .or_else(|| non_empty(auth.and_then(|a| a.get("chatgpt_account_id"))));
    let email = non_empty(top.get("email"))
        .or_else(|| non_empty(profile.and_then(|p| p.get("email"))))
        .or_else(|| non_empty(auth.and_then(|a| a.get("email"))));
    let plan = non_empty(top.get("chatgpt_plan_type"))
        .or_else(|| non_empty(auth.and_then(|a| a.get("chatgpt_plan_type"))))
        .or_else(|| non_empty(top.get("plan")));

    Some(IdentityClaims {
        account_id,
        email,
        plan,
    })
}

/// Canonical identity key: `accountId|email|plan` with email and plan
/// lower-cased and trimmed. Unknown segments stay empty.
pub fn build_identity_key(
    account_id: Option<&str>,
    email: Option<&str>,
    plan: Option<&str>,
) -> String {
    let account_id = account_id.map(str::trim).unwrap_or("");
    let email = email.map(|s| s.trim().to_lowercase()).unwrap_or_default();
    let plan = plan.map(|s| s.trim().to_lowercase()).unwrap_or_default();
    format!("{account_id}|{email}|{plan}")
}

pub const LEGACY_FINGERPRINT_PREFIX: &str = "legacy:";

/// Fallback key for records whose identity cannot be fully derived, built
/// from the refresh-token prefix plus whatever fields are known.
pub fn legacy_fingerprint(
    refresh: Option<&str>,
    email: Option<&str>,
    plan: Option<&str>,
) -> String {
    let prefix: String = refresh.unwrap_or("").chars().take(12).collect();
    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(b"|");
    hasher.update(email.map(|s| s.trim().to_lowercase()).unwrap_or_default());
    hasher.update(b"|");
    hasher.update(plan.map(|s| s.trim().to_lowercase()).unwrap_or_default());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    format!("{LEGACY_FINGERPRINT_PREFIX}{hex}")
}

pub fn is_legacy_fingerprint(key: &str) -> bool {
    key.starts_with(LEGACY_FINGERPRINT_PREFIX)
}

#[cfg(test)]
pub(crate) fn encode_test_token(payload: &serde_json::Value) -> String {
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("eyJhbGciOiJub25lIn0.{body}.sig")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_key_lowercases_email_and_plan() {
        let key = build_identity_key(Some("acc"), Some("User@Example.com"), Some("Plus"));
        assert_eq!(key, "acc|user@example.com|plus");
    }

    #[test]
    fn blank_segments_stay_empty() {
        assert_eq!(build_identity_key(None, Some("a@b.c"), None), "|a@b.c|");
    }

    #[test]
    fn parses_top_level_claims() {
        let token = encode_test_token(&json!({
            "chatgpt_account_id": "acc_1",
            "email": "user@example.com",
            "chatgpt_plan_type": "plus",
        }));
        let claims = parse_claims(&token).unwrap();
        assert_eq!(claims.account_id.as_deref(), Some("acc_1"));
        assert_eq!(claims.email.as_deref(), Some("user@example.com"));
        assert_eq!(claims.plan.as_deref(), Some("plus"));
    }

    #[test]
    fn parses_namespaced_claims() {
        let token = encode_test_token(&json!({
            "https://api.openai.com/auth": {
                "chatgpt_account_id": "acc_2",
                "chatgpt_plan_type": "pro",
            },
            "https://api.openai.com/profile": { "email": "ns@example.com" },
        }));
        let claims = parse_claims(&token).unwrap();
        assert_eq!(claims.account_id.as_deref(), Some("acc_2"));
        assert_eq!(claims.email.as_deref(), Some("ns@example.com"));
        assert_eq!(claims.plan.as_deref(), Some("pro"));
    }

    #[test]
    fn rejects_non_object_payloads() {
        let array = URL_SAFE_NO_PAD.encode("[1,2,3]");
        assert!(parse_claims(&format!("h.{array}.s")).is_none());
        let null = URL_SAFE_NO_PAD.encode("null");
        assert!(parse_claims(&format!("h.{null}.s")).is_none());
        assert!(parse_claims("not-a-jwt").is_none());
    }

    #[test]
    fn fingerprint_is_stable_and_tagged() {
        let a = legacy_fingerprint(Some("rt_abcdef123456xyz"), Some("U@E.com"), None);
        let b = legacy_fingerprint(Some("rt_abcdef123456xyz"), Some("u@e.com "), None);
        assert_eq!(a, b);
        assert!(is_legacy_fingerprint(&a));
        let c = legacy_fingerprint(Some("rt_other"), Some("u@e.com"), None);
        assert_ne!(a, c);
    }
}
