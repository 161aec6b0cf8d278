//! Refresh-token exchange against the issuer's token endpoint.
//!
//! The refresher only performs the exchange and shapes the error; the
//! terminal/transient classification is consumed by the acquire path, which
//! decides whether to disable the account or put it on a short cooldown.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

pub const ISSUER_BASE_URL: &str = "https://auth.openai.com";
pub const TOKEN_ENDPOINT_PATH: &str = "/oauth/token";
/// Public client id of the codex CLI.
pub const OAUTH_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

/// Codes that permanently invalidate the stored grant. Anything else,
/// including `invalid_token`, is transient.
const TERMINAL_OAUTH_CODES: &[&str] = &[
    "invalid_grant",
    "invalid_refresh_token",
    "refresh_token_revoked",
    "token_revoked",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedTokens {
    pub access: String,
    pub refresh: String,
    /// Epoch milliseconds.
    pub expires: i64,
    pub id_token: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("oauth error {code:?}: {description:?}")]
    Oauth {
        code: Option<String>,
        description: Option<String>,
    },
    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("invalid token response: {0}")]
    Json(#[from] serde_json::Error),
}

impl RefreshError {
    pub fn oauth_code(&self) -> Option<&str> {
        match self {
            RefreshError::Oauth { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// True when the issuer revoked the grant and the user must
    /// re-authenticate; the account gets disabled rather than cooled down.
    pub fn is_terminal(&self) -> bool {
        self.oauth_code()
            .is_some_and(|code| TERMINAL_OAUTH_CODES.contains(&code))
    }
}

#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, RefreshError>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenResponse {
    Success {
        access_token: String,
        #[serde(default)]
        refresh_token: Option<String>,
        #[serde(default)]
        expires_in: Option<i64>,
        #[serde(default)]
        id_token: Option<String>,
    },
    Error {
        error: String,
        #[serde(default)]
        error_description: Option<String>,
    },
}

/// Production refresher talking to the real issuer.
#[derive(Debug, Clone)]
pub struct HttpTokenRefresher {
    client: reqwest::Client,
    token_url: String,
}

impl HttpTokenRefresher {
    pub fn new() -> anyhow::Result<Self> {
        let url = url::Url::parse(ISSUER_BASE_URL)?.join(TOKEN_ENDPOINT_PATH)?;
        Self::with_token_url(url.as_str())
    }

    pub fn with_token_url(token_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            token_url: token_url.to_string(),
        })
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, RefreshError> {
        let response = self
            .client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&[
                ("client_id", OAUTH_CLIENT_ID),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        parse_token_response(status.as_u16(), &body, refresh_token, crate::now_ms())
    }
}

fn parse_token_response(
    status: u16,
    body: &str,
    old_refresh: &str,
    now_ms: i64,
) -> Result<RefreshedTokens, RefreshError> {
    match serde_json::from_str::<TokenResponse>(body) {
        Ok(TokenResponse::Success {
            access_token,
            refresh_token,
            expires_in,
            id_token,
        }) => Ok(RefreshedTokens {
            access: access_token,
            refresh: refresh_token.unwrap_or_else(|| old_refresh.to_string()),
            expires: now_ms + expires_in.unwrap_or(3600) * 1000,
            id_token,
        }),
        Ok(TokenResponse::Error {
            error,
            error_description,
        }) => Err(RefreshError::Oauth {
            code: Some(error),
            description: error_description,
        }),
        Err(err) => {
            if (200..300).contains(&status) {
                Err(err.into())
            } else {
                Err(RefreshError::Http {
                    status,
                    body: body.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_body_maps_to_tokens() {
        let body = r#"{"access_token":"at_new","refresh_token":"rt_new","expires_in":60,"id_token":"idt"}"#;
        let tokens = parse_token_response(200, body, "rt_old", 1_000).unwrap();
        assert_eq!(tokens.access, "at_new");
        assert_eq!(tokens.refresh, "rt_new");
        assert_eq!(tokens.expires, 61_000);
        assert_eq!(tokens.id_token.as_deref(), Some("idt"));
    }

    #[test]
    fn missing_refresh_token_keeps_the_old_one() {
        let body = r#"{"access_token":"at_new","expires_in":10}"#;
        let tokens = parse_token_response(200, body, "rt_old", 0).unwrap();
        assert_eq!(tokens.refresh, "rt_old");
    }

    #[test]
    fn oauth_error_body_becomes_typed_error() {
        let body = r#"{"error":"invalid_grant","error_description":"revoked"}"#;
        let err = parse_token_response(400, body, "rt", 0).unwrap_err();
        assert_eq!(err.oauth_code(), Some("invalid_grant"));
        assert!(err.is_terminal());
    }

    #[test]
    fn invalid_token_is_not_terminal() {
        let body = r#"{"error":"invalid_token"}"#;
        let err = parse_token_response(401, body, "rt", 0).unwrap_err();
        assert_eq!(err.oauth_code(), Some("invalid_token"));
        assert!(!err.is_terminal());
    }

    #[test]
    fn unparsable_error_body_keeps_the_status() {
        let err = parse_token_response(502, "<html>bad gateway</html>", "rt", 0).unwrap_err();
        match err {
            RefreshError::Http { status, .. } => assert_eq!(status, 502),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!parse_token_response(503, "x", "rt", 0).unwrap_err().is_terminal());
    }
}
