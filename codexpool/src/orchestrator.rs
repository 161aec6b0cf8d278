//! The outbound request loop: acquire credentials, attach them, observe
//! 429s, rotate accounts, and surface a synthetic exhausted response when
//! every attempt is rate limited.
//!
//! `fetch` is an injected capability so tests substitute fakes without
//! shimming global state; the production impl wraps `reqwest`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::account::{AuthMode, RotationStrategy};
use crate::acquire::{AcquireError, AcquireRequest, AcquiredAuth, AuthBroker};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Flat backoff applied when a 429 carries no usable Retry-After.
pub const FALLBACK_RATE_LIMIT_BACKOFF_MS: i64 = 5_000;
const RATE_LIMIT_TOAST_DEBOUNCE_MS: i64 = 60_000;
const SESSION_TOAST_DEBOUNCE_MS: i64 = 15_000;
const SEEN_SESSION_TTL_MS: i64 = 6 * 60 * 60 * 1000;
const MAX_SEEN_SESSIONS: usize = 200;

/// Header the upstream uses to mark spawned sub-work.
pub const SUBAGENT_HEADER: &str = "x-initiator";
pub const SUBAGENT_HEADER_VALUE: &str = "subagent";
pub const ACCOUNT_ID_HEADER: &str = "chatgpt-account-id";
/// JSON body field identifying the client-side chat turn.
pub const SESSION_KEY_FIELD: &str = "prompt_cache_key";

// ---------------------------------------------------------------------------
// Request/response shapes and the fetch capability
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl OutboundRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(slot) = self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            slot.1 = value;
        } else {
            self.headers.push((name.to_string(), value));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundResponse {
    pub status: u16,
    /// Lower-cased header names.
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl OutboundResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect(),
            body: body.into(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[async_trait]
pub trait HttpFetch: Send + Sync {
    async fn fetch(&self, request: OutboundRequest) -> Result<OutboundResponse, FetchError>;
}

/// Production fetch backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestFetch {
    client: reqwest::Client,
}

impl ReqwestFetch {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpFetch for ReqwestFetch {
    async fn fetch(&self, request: OutboundRequest) -> Result<OutboundResponse, FetchError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).to_string(),
                )
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(OutboundResponse::new(status, headers, body))
    }
}

// ---------------------------------------------------------------------------
// Observation hooks and toasts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// First session observed since this process started.
    Resume,
    /// A session key never seen before.
    New,
    /// A known session different from the previous request's.
    Switch,
    /// Same session as the previous request.
    Seen,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToastEvent {
    Session {
        kind: SessionKind,
        session_key: String,
        account_label: String,
    },
    AccountSwitch {
        from_identity_key: Option<String>,
        to_label: String,
    },
    RateLimited {
        account_label: String,
        retry_at_ms: i64,
    },
}

#[derive(Default)]
pub struct OrchestratorHooks {
    pub on_toast: Option<Box<dyn Fn(&ToastEvent) + Send + Sync>>,
    pub on_session_observed: Option<Box<dyn Fn(&str, SessionKind) + Send + Sync>>,
    pub on_attempt_request: Option<Box<dyn Fn(&OutboundRequest) + Send + Sync>>,
    pub on_attempt_response: Option<Box<dyn Fn(&OutboundResponse) + Send + Sync>>,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Acquire(#[from] AcquireError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[derive(Debug, Default)]
struct OrchestratorState {
    last_session_key: Option<String>,
    seen_sessions: HashMap<String, i64>,
    last_account_key: Option<String>,
    session_toast_at: HashMap<String, i64>,
    rate_limit_toast_at: HashMap<String, i64>,
}

// ---------------------------------------------------------------------------
// The orchestrator
// ---------------------------------------------------------------------------

pub struct FetchOrchestrator {
    broker: Arc<dyn AuthBroker>,
    fetch: Arc<dyn HttpFetch>,
    mode: AuthMode,
    max_attempts: u32,
    quiet: bool,
    pid_offset: bool,
    strategy_override: Option<RotationStrategy>,
    hooks: OrchestratorHooks,
    state: Mutex<OrchestratorState>,
}

impl FetchOrchestrator {
    pub fn new(broker: Arc<dyn AuthBroker>, fetch: Arc<dyn HttpFetch>, mode: AuthMode) -> Self {
        Self {
            broker,
            fetch,
            mode,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            quiet: false,
            pid_offset: false,
            strategy_override: None,
            hooks: OrchestratorHooks::default(),
            state: Mutex::new(OrchestratorState::default()),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn with_pid_offset(mut self, pid_offset: bool) -> Self {
        self.pid_offset = pid_offset;
        self
    }

    pub fn with_strategy_override(mut self, strategy: Option<RotationStrategy>) -> Self {
        self.strategy_override = strategy;
        self
    }

    pub fn with_hooks(mut self, hooks: OrchestratorHooks) -> Self {
        self.hooks = hooks;
        self
    }

    fn state_guard(&self) -> MutexGuard<'_, OrchestratorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run one outbound request with bounded 429 retries. Non-429 responses
    /// are returned as-is; exhausting every attempt yields a synthetic 429.
    pub async fn execute(
        &self,
        base: OutboundRequest,
    ) -> Result<OutboundResponse, OrchestratorError> {
        let now = crate::now_ms();
        let is_subagent = base
            .header(SUBAGENT_HEADER)
            .is_some_and(|v| v.eq_ignore_ascii_case(SUBAGENT_HEADER_VALUE));
        let session_key = extract_session_key(base.body.as_deref());
        let session_kind = session_key
            .as_deref()
            .map(|key| self.observe_session(key, is_subagent, now));
        if let (Some(key), Some(kind)) = (session_key.as_deref(), session_kind) {
            if let Some(hook) = &self.hooks.on_session_observed {
                hook(key, kind);
            }
        }

        let mut last_backoff_ms: Option<i64> = None;
        for attempt in 0..self.max_attempts {
            let request = AcquireRequest {
                mode: self.mode,
                session_key: session_key.clone(),
                is_subagent,
                pid_offset: self.pid_offset,
                strategy_override: self.strategy_override,
            };
            let auth = match self.broker.acquire(&request).await {
                Ok(auth) => auth,
                Err(AcquireError::AllAccountsCoolingDown { retry_at_ms }) => {
                    let wait = retry_at_ms.map(|at| (at - crate::now_ms()).max(0));
                    return Ok(synthetic_rate_limited(wait));
                }
                Err(AcquireError::RefreshFailed(err)) if attempt + 1 < self.max_attempts => {
                    tracing::debug!(error = %err, "refresh failed, retrying with another account");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let now = crate::now_ms();
            if attempt == 0 {
                if let (Some(key), Some(kind)) = (session_key.as_deref(), session_kind) {
                    self.toast_session(key, kind, &auth, now);
                }
            }
            self.toast_account_switch(&auth, now);

            let mut request = base.clone();
            request.set_header("authorization", format!("Bearer {}", auth.access));
            if let Some(account_id) = &auth.account_id {
                request.set_header(ACCOUNT_ID_HEADER, account_id.clone());
            }

            if let Some(hook) = &self.hooks.on_attempt_request {
                hook(&request);
            }
            let response = self.fetch.fetch(request).await?;
            if let Some(hook) = &self.hooks.on_attempt_response {
                hook(&response);
            }

            if response.status != 429 {
                return Ok(response);
            }

            let now = crate::now_ms();
            let retry_after_ms = response
                .header("retry-after")
                .and_then(|v| parse_retry_after_ms(v, now));
            let backoff_ms = retry_after_ms
                .unwrap_or(0)
                .max(FALLBACK_RATE_LIMIT_BACKOFF_MS);
            last_backoff_ms = Some(backoff_ms);
            tracing::debug!(
                identity_key = %auth.identity_key,
                backoff_ms,
                "upstream rate limited, cooling account down"
            );
            if !auth.identity_key.is_empty() {
                if let Err(err) = self
                    .broker
                    .set_cooldown(self.mode, &auth.identity_key, now + backoff_ms)
                    .await
                {
                    tracing::warn!(error = %err, "failed to persist cooldown");
                }
            }
            self.toast_rate_limited(&auth, now + backoff_ms, now);
        }

        Ok(synthetic_rate_limited(last_backoff_ms))
    }

    /// Classify the session key against the LRU of recently seen sessions.
    /// Subagent requests observe without mutating.
    fn observe_session(&self, session_key: &str, is_subagent: bool, now: i64) -> SessionKind {
        let mut state = self.state_guard();
        if is_subagent {
            return SessionKind::Seen;
        }
        state
            .seen_sessions
            .retain(|_, at| now - *at <= SEEN_SESSION_TTL_MS);

        let kind = if state.last_session_key.is_none() {
            SessionKind::Resume
        } else if !state.seen_sessions.contains_key(session_key) {
            SessionKind::New
        } else if state.last_session_key.as_deref() != Some(session_key) {
            SessionKind::Switch
        } else {
            SessionKind::Seen
        };

        state.seen_sessions.insert(session_key.to_string(), now);
        if state.seen_sessions.len() > MAX_SEEN_SESSIONS {
            if let Some(oldest) = state
                .seen_sessions
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(k, _)| k.clone())
            {
                state.seen_sessions.remove(&oldest);
            }
        }
        state.last_session_key = Some(session_key.to_string());
        kind
    }

    fn emit_toast(&self, event: ToastEvent) {
        if self.quiet {
            return;
        }
        if let Some(hook) = &self.hooks.on_toast {
            hook(&event);
        }
    }

    fn toast_session(&self, session_key: &str, kind: SessionKind, auth: &AcquiredAuth, now: i64) {
        if kind == SessionKind::Seen {
            return;
        }
        let debounce_key = format!("session:{session_key}");
        if !self.debounce(&debounce_key, SESSION_TOAST_DEBOUNCE_MS, now, false) {
            return;
        }
        self.emit_toast(ToastEvent::Session {
            kind,
            session_key: session_key.to_string(),
            account_label: auth.label.clone(),
        });
    }

    fn toast_account_switch(&self, auth: &AcquiredAuth, now: i64) {
        let from = {
            let mut state = self.state_guard();
            if state.last_account_key.as_deref() == Some(auth.identity_key.as_str()) {
                return;
            }
            let from = state.last_account_key.clone();
            state.last_account_key = Some(auth.identity_key.clone());
            from
        };
        // First resolution of the run is not a switch.
        if from.is_none() {
            return;
        }
        let debounce_key = format!("account:{}", auth.identity_key);
        if !self.debounce(&debounce_key, SESSION_TOAST_DEBOUNCE_MS, now, false) {
            return;
        }
        self.emit_toast(ToastEvent::AccountSwitch {
            from_identity_key: from,
            to_label: auth.label.clone(),
        });
    }

    fn toast_rate_limited(&self, auth: &AcquiredAuth, retry_at_ms: i64, now: i64) {
        if !self.debounce(&auth.identity_key, RATE_LIMIT_TOAST_DEBOUNCE_MS, now, true) {
            return;
        }
        self.emit_toast(ToastEvent::RateLimited {
            account_label: auth.label.clone(),
            retry_at_ms,
        });
    }

    /// Returns true when the toast should fire and records the emission.
    fn debounce(&self, key: &str, window_ms: i64, now: i64, rate_limit_map: bool) -> bool {
        let mut state = self.state_guard();
        let map = if rate_limit_map {
            &mut state.rate_limit_toast_at
        } else {
            &mut state.session_toast_at
        };
        if map.get(key).is_some_and(|last| now - last < window_ms) {
            return false;
        }
        map.insert(key.to_string(), now);
        true
    }
}

/// Pull the session key out of the request body's `prompt_cache_key` field.
/// Keys that fail the path-safety check are ignored.
fn extract_session_key(body: Option<&str>) -> Option<String> {
    let body = body?;
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let key = value.get(SESSION_KEY_FIELD)?.as_str()?;
    match crate::paths::validate_session_key(key) {
        Ok(()) => Some(key.to_string()),
        Err(_) => {
            tracing::debug!("ignoring unsafe session key in request body");
            None
        }
    }
}

/// `Retry-After` may be seconds or an HTTP date.
pub fn parse_retry_after_ms(value: &str, now_ms: i64) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(seconds) = value.parse::<f64>() {
        if seconds.is_finite() && seconds >= 0.0 {
            return Some((seconds * 1000.0) as i64);
        }
        return None;
    }
    let when = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    Some((when.timestamp_millis() - now_ms).max(0))
}

/// The synthetic exhausted-quota response.
fn synthetic_rate_limited(wait_ms: Option<i64>) -> OutboundResponse {
    let message = match wait_ms {
        Some(ms) if ms > 0 => {
            let minutes = (ms + 59_999) / 60_000;
            let minutes = minutes.max(1);
            if minutes == 1 {
                "All accounts are rate limited. Try again in 1 minute.".to_string()
            } else {
                format!("All accounts are rate limited. Try again in {minutes} minutes.")
            }
        }
        _ => "All accounts are rate limited. Try again in a short while.".to_string(),
    };
    let body = serde_json::json!({
        "error": {
            "code": "all_accounts_rate_limited",
            "message": message,
        }
    });
    let mut headers = vec![("content-type".to_string(), "application/json".to_string())];
    if let Some(ms) = wait_ms.filter(|ms| *ms > 0) {
        headers.push(("retry-after".to_string(), ((ms + 999) / 1000).to_string()));
    }
    OutboundResponse::new(429, headers, body.to_string())
}
