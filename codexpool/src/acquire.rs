//! Per-request credential acquisition: select, lease, refresh, commit.
//!
//! The file lock is never held across network I/O. A refresh is claimed by
//! stamping `refreshLeaseUntil` under the lock, performed outside it, then
//! committed under a second lock only if the claim is still intact. Claims
//! invalidated by a concurrent actor are discarded without touching the
//! account's enabled/cooldown state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::account::{AccountRecord, AuthMode, OAuthDomain, RotationStrategy};
use crate::affinity::{ModeRecord, SessionAffinityFile, SessionAffinityStore, MAX_TRACKED_SESSIONS};
use crate::identity;
use crate::paths;
use crate::refresh::{RefreshError, RefreshedTokens, TokenRefresher};
use crate::rotation::{self, RotationDecision, SelectInput, StickySessionState};
use crate::storage::AuthStorage;

pub const DEFAULT_LEASE_MS: i64 = 120_000;
pub const DEFAULT_REFRESH_BUFFER_MS: i64 = 60_000;
pub const DEFAULT_FAILURE_COOLDOWN_MS: i64 = 30_000;

#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub mode: AuthMode,
    pub session_key: Option<String>,
    pub is_subagent: bool,
    pub pid_offset: bool,
    pub strategy_override: Option<RotationStrategy>,
}

impl AcquireRequest {
    pub fn new(mode: AuthMode) -> Self {
        Self {
            mode,
            session_key: None,
            is_subagent: false,
            pid_offset: false,
            strategy_override: None,
        }
    }
}

/// Bearer credentials handed to the fetch orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredAuth {
    pub access: String,
    pub identity_key: String,
    pub account_id: Option<String>,
    pub email: Option<String>,
    pub plan: Option<String>,
    pub label: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("all accounts are cooling down")]
    AllAccountsCoolingDown { retry_at_ms: Option<i64> },
    #[error("selected account has no identity or refresh token")]
    MissingAccountIdentity,
    #[error("invalid session key")]
    InvalidSessionKey,
    #[error("account refresh failed: {0}")]
    RefreshFailed(#[source] RefreshError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// The acquire surface the orchestrator consumes; a trait so tests can
/// substitute a scripted broker.
#[async_trait]
pub trait AuthBroker: Send + Sync {
    async fn acquire(&self, request: &AcquireRequest) -> Result<AcquiredAuth, AcquireError>;
    async fn set_cooldown(
        &self,
        mode: AuthMode,
        identity_key: &str,
        until_ms: i64,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct BrokerOptions {
    pub lease_ms: i64,
    pub refresh_buffer_ms: i64,
    pub failure_cooldown_ms: i64,
    pub pid: u32,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            lease_ms: DEFAULT_LEASE_MS,
            refresh_buffer_ms: DEFAULT_REFRESH_BUFFER_MS,
            failure_cooldown_ms: DEFAULT_FAILURE_COOLDOWN_MS,
            pid: std::process::id(),
        }
    }
}

#[derive(Debug)]
struct ModeRotation {
    sticky: StickySessionState,
    hybrid: StickySessionState,
    seen: HashMap<String, i64>,
}

impl Default for ModeRotation {
    fn default() -> Self {
        Self {
            sticky: StickySessionState::new(MAX_TRACKED_SESSIONS),
            hybrid: StickySessionState::new(MAX_TRACKED_SESSIONS),
            seen: HashMap::new(),
        }
    }
}

impl ModeRotation {
    fn from_record(record: &ModeRecord) -> Self {
        Self {
            sticky: StickySessionState::with_assignments(
                record.sticky_by_session_key.clone(),
                MAX_TRACKED_SESSIONS,
            ),
            hybrid: StickySessionState::with_assignments(
                record.hybrid_by_session_key.clone(),
                MAX_TRACKED_SESSIONS,
            ),
            seen: record.seen_session_keys.clone(),
        }
    }

    fn to_record(&self) -> ModeRecord {
        ModeRecord {
            seen_session_keys: self.seen.clone(),
            sticky_by_session_key: self.sticky.assignments().clone(),
            hybrid_by_session_key: self.hybrid.assignments().clone(),
        }
    }
}

pub struct CredentialBroker {
    storage: AuthStorage,
    affinity: SessionAffinityStore,
    refresher: Arc<dyn TokenRefresher>,
    opts: BrokerOptions,
    rotation: Mutex<HashMap<AuthMode, ModeRotation>>,
    decision_hook: Option<Box<dyn Fn(&RotationDecision) + Send + Sync>>,
}

pub(crate) struct RefreshClaim {
    pub(crate) identity_key: String,
    pub(crate) refresh: String,
    pub(crate) lease_until: i64,
    pub(crate) advance_active: bool,
}

enum Phase1 {
    Fresh(AcquiredAuth),
    Claim(RefreshClaim),
    NoneEligible { retry_at: Option<i64> },
    MissingIdentity,
}

enum Attempt {
    Done(AcquiredAuth),
    Stale(String),
}

impl CredentialBroker {
    pub fn new(
        storage: AuthStorage,
        affinity: SessionAffinityStore,
        refresher: Arc<dyn TokenRefresher>,
        opts: BrokerOptions,
    ) -> Self {
        let file = affinity.load();
        let mut rotation = HashMap::new();
        for mode in AuthMode::ALL {
            if let Some(record) = file.mode_record(mode) {
                rotation.insert(mode, ModeRotation::from_record(record));
            }
        }
        Self {
            storage,
            affinity,
            refresher,
            opts,
            rotation: Mutex::new(rotation),
            decision_hook: None,
        }
    }

    /// Install a debug hook observing every rotation decision.
    pub fn with_decision_hook(
        mut self,
        hook: impl Fn(&RotationDecision) + Send + Sync + 'static,
    ) -> Self {
        self.decision_hook = Some(Box::new(hook));
        self
    }

    pub fn storage(&self) -> &AuthStorage {
        &self.storage
    }

    fn rotation_guard(&self) -> MutexGuard<'_, HashMap<AuthMode, ModeRotation>> {
        self.rotation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One acquisition: selects an eligible account, refreshes it if the
    /// bearer is near expiry, and returns the credentials. Identities whose
    /// claim goes stale mid-refresh are skipped for the rest of this call.
    pub async fn acquire_auth(
        &self,
        request: &AcquireRequest,
    ) -> Result<AcquiredAuth, AcquireError> {
        if let Some(key) = request.session_key.as_deref() {
            paths::validate_session_key(key).map_err(|_| AcquireError::InvalidSessionKey)?;
        }

        let mut stale: HashSet<String> = HashSet::new();
        let out = loop {
            match self.acquire_once(request, &stale).await {
                Ok(Attempt::Done(auth)) => break Ok(auth),
                Ok(Attempt::Stale(identity_key)) => {
                    tracing::debug!(
                        identity_key = %identity_key,
                        "refresh claim went stale, reselecting"
                    );
                    stale.insert(identity_key);
                }
                Err(err) => break Err(err),
            }
        };

        if !request.is_subagent {
            self.persist_affinity();
        }
        out
    }

    async fn acquire_once(
        &self,
        request: &AcquireRequest,
        stale: &HashSet<String>,
    ) -> Result<Attempt, AcquireError> {
        let now = crate::now_ms();
        let phase1 = {
            let mut rotation = self.rotation_guard();
            let mode_rotation = rotation.entry(request.mode).or_default();
            if let Some(key) = request.session_key.as_deref() {
                if !request.is_subagent {
                    mode_rotation.seen.insert(key.to_string(), now);
                }
            }
            self.select_or_claim(request, mode_rotation, stale, now)?
        };

        match phase1 {
            Phase1::NoneEligible { retry_at } => Err(AcquireError::AllAccountsCoolingDown {
                retry_at_ms: retry_at,
            }),
            Phase1::MissingIdentity => Err(AcquireError::MissingAccountIdentity),
            Phase1::Fresh(auth) => Ok(Attempt::Done(auth)),
            Phase1::Claim(claim) => self.refresh_and_settle(request.mode, claim).await,
        }
    }

    /// Step 1-4 of the acquire algorithm, entirely under the save lock.
    fn select_or_claim(
        &self,
        request: &AcquireRequest,
        mode_rotation: &mut ModeRotation,
        stale: &HashSet<String>,
        now: i64,
    ) -> Result<Phase1, AcquireError> {
        let mode = request.mode;
        let opts = self.opts;
        let hook = self.decision_hook.as_deref();
        let on_decision = move |decision: &RotationDecision| {
            if let Some(hook) = hook {
                hook(decision);
            }
        };

        let phase1 = self.storage.save_with(|auth| {
            let openai = auth.ensure_openai();
            let strategy = request
                .strategy_override
                .or_else(|| openai.domain(mode).and_then(|d| d.strategy))
                .or(openai.strategy)
                .unwrap_or(RotationStrategy::Sticky);
            let domain = openai.ensure_domain(mode);

            let sticky_state = match strategy {
                RotationStrategy::Sticky => Some(&mut mode_rotation.sticky),
                RotationStrategy::Hybrid => Some(&mut mode_rotation.hybrid),
                RotationStrategy::RoundRobin => None,
            };
            let input = SelectInput {
                accounts: &domain.accounts,
                strategy,
                active_identity_key: domain.active_identity_key.as_deref(),
                now_ms: now,
                pid_offset: request.pid_offset,
                pid: opts.pid,
                session_key: request.session_key.as_deref(),
                record_affinity: !request.is_subagent,
                excluded_identities: Some(stale),
            };
            let Some(idx) = rotation::select(&input, sticky_state, Some(&on_decision)) else {
                return Ok(Phase1::NoneEligible {
                    retry_at: earliest_unmask(&domain.accounts, now),
                });
            };

            let advance_active = matches!(
                strategy,
                RotationStrategy::RoundRobin | RotationStrategy::Hybrid
            );
            let account = &mut domain.accounts[idx];
            if silent_account(account) {
                return Ok(Phase1::MissingIdentity);
            }
            let Some(refresh) = account.refresh.clone() else {
                return Ok(Phase1::MissingIdentity);
            };

            if account.access_is_fresh(now, opts.refresh_buffer_ms) {
                let Some(auth_out) = acquired_from(account) else {
                    return Ok(Phase1::MissingIdentity);
                };
                let identity_key = account.identity_key.clone();
                if advance_active {
                    account.last_used = Some(now);
                    domain.active_identity_key = Some(identity_key);
                }
                return Ok(Phase1::Fresh(auth_out));
            }

            let lease_until = now + opts.lease_ms;
            account.refresh_lease_until = Some(lease_until);
            Ok(Phase1::Claim(RefreshClaim {
                identity_key: account.identity_key.clone(),
                refresh,
                lease_until,
                advance_active,
            }))
        })?;
        Ok(phase1)
    }

    /// Steps 5-7: network refresh outside the lock, then settle under it.
    async fn refresh_and_settle(
        &self,
        mode: AuthMode,
        claim: RefreshClaim,
    ) -> Result<Attempt, AcquireError> {
        let result = self.refresher.refresh(&claim.refresh).await;
        let now = crate::now_ms();
        let opts = self.opts;

        match result {
            Ok(tokens) => {
                let settled = self.storage.save_with(|auth| {
                    let domain = auth.ensure_openai().ensure_domain(mode);
                    Ok(settle_refresh_success(
                        domain,
                        &claim,
                        &tokens,
                        now,
                        opts.refresh_buffer_ms,
                        opts.failure_cooldown_ms,
                        claim.advance_active,
                    ))
                })?;
                match settled {
                    SettleSuccess::Committed(account) => match acquired_from(&account) {
                        Some(auth) => Ok(Attempt::Done(auth)),
                        None => Err(AcquireError::MissingAccountIdentity),
                    },
                    SettleSuccess::Stale => Ok(Attempt::Stale(claim.identity_key)),
                }
            }
            Err(err) => {
                let terminal = err.is_terminal();
                let settled = self.storage.save_with(|auth| {
                    let domain = auth.ensure_openai().ensure_domain(mode);
                    Ok(settle_refresh_failure(
                        domain,
                        &claim,
                        terminal,
                        now,
                        opts.failure_cooldown_ms,
                    ))
                })?;
                match settled {
                    SettleFailure::Stale => Ok(Attempt::Stale(claim.identity_key)),
                    SettleFailure::Disabled => {
                        tracing::warn!(
                            identity_key = %claim.identity_key,
                            error = %err,
                            "refresh token rejected, disabling account"
                        );
                        Err(AcquireError::RefreshFailed(err))
                    }
                    SettleFailure::CoolingDown => {
                        tracing::debug!(
                            identity_key = %claim.identity_key,
                            error = %err,
                            "transient refresh failure, cooling down"
                        );
                        Err(AcquireError::RefreshFailed(err))
                    }
                }
            }
        }
    }

    /// Write the in-memory affinity maps back to disk. Best-effort: these
    /// are caches, not sources of truth.
    fn persist_affinity(&self) {
        let file = {
            let rotation = self.rotation_guard();
            let mut file = SessionAffinityFile::default();
            for (mode, mode_rotation) in rotation.iter() {
                file.set_mode_record(*mode, mode_rotation.to_record());
            }
            file
        };
        self.affinity.save(&file);
    }
}

#[async_trait]
impl AuthBroker for CredentialBroker {
    async fn acquire(&self, request: &AcquireRequest) -> Result<AcquiredAuth, AcquireError> {
        self.acquire_auth(request).await
    }

    async fn set_cooldown(
        &self,
        mode: AuthMode,
        identity_key: &str,
        until_ms: i64,
    ) -> anyhow::Result<()> {
        self.storage
            .set_account_cooldown(mode, identity_key, Some(until_ms))?;
        Ok(())
    }
}

/// An account with no usable identity: no refresh token, or nothing beyond
/// a bare fingerprint to key per-account state on. Such accounts are a
/// config problem and must not be cooled down.
fn silent_account(account: &AccountRecord) -> bool {
    account.refresh.is_none()
        || account.identity_key.is_empty()
        || (identity::is_legacy_fingerprint(&account.identity_key)
            && account.account_id.is_none()
            && account.email.is_none())
}

fn acquired_from(account: &AccountRecord) -> Option<AcquiredAuth> {
    Some(AcquiredAuth {
        access: account.access.clone()?,
        identity_key: account.identity_key.clone(),
        account_id: account.account_id.clone(),
        email: account.email.clone(),
        plan: account.plan.clone(),
        label: account.display_label(),
    })
}

/// Earliest time any enabled account becomes selectable again.
fn earliest_unmask(accounts: &[AccountRecord], now: i64) -> Option<i64> {
    accounts
        .iter()
        .filter(|a| a.enabled)
        .filter_map(|a| {
            let at = a
                .cooldown_until
                .unwrap_or(0)
                .max(a.refresh_lease_until.unwrap_or(0));
            (at > now).then_some(at)
        })
        .min()
}

pub(crate) enum SettleSuccess {
    Committed(AccountRecord),
    Stale,
}

pub(crate) enum SettleFailure {
    CoolingDown,
    Disabled,
    Stale,
}

/// Commit refreshed tokens if (and only if) the claim is intact: same lease,
/// same refresh token, account still present and enabled.
pub(crate) fn settle_refresh_success(
    domain: &mut OAuthDomain,
    claim: &RefreshClaim,
    tokens: &RefreshedTokens,
    now_ms: i64,
    buffer_ms: i64,
    failure_cooldown_ms: i64,
    advance_active: bool,
) -> SettleSuccess {
    let Some(account) = domain.account_by_identity_mut(&claim.identity_key) else {
        return SettleSuccess::Stale;
    };
    if !account.enabled
        || account.refresh_lease_until != Some(claim.lease_until)
        || account.refresh.as_deref() != Some(claim.refresh.as_str())
    {
        return SettleSuccess::Stale;
    }

    account.access = Some(tokens.access.clone());
    account.refresh = Some(tokens.refresh.clone());
    account.expires = Some(tokens.expires);
    account.refresh_lease_until = None;
    if tokens.expires <= now_ms + buffer_ms {
        // The issuer handed back an already-stale token; a short cooldown
        // stops a refresh thrash loop.
        account.cooldown_until = Some(now_ms + failure_cooldown_ms);
    }
    account.synchronize_identity();
    if advance_active {
        account.last_used = Some(now_ms);
        let identity_key = account.identity_key.clone();
        let snapshot = account.clone();
        domain.active_identity_key = Some(identity_key);
        return SettleSuccess::Committed(snapshot);
    }
    SettleSuccess::Committed(account.clone())
}

/// Clear our lease and classify the failure. A lease replaced by a
/// concurrent actor means the claim is stale and nothing is touched.
pub(crate) fn settle_refresh_failure(
    domain: &mut OAuthDomain,
    claim: &RefreshClaim,
    terminal: bool,
    now_ms: i64,
    failure_cooldown_ms: i64,
) -> SettleFailure {
    let Some(account) = domain.account_by_identity_mut(&claim.identity_key) else {
        return SettleFailure::Stale;
    };
    if account.refresh_lease_until != Some(claim.lease_until) {
        return SettleFailure::Stale;
    }
    account.refresh_lease_until = None;
    if terminal {
        account.enabled = false;
        account.cooldown_until = None;
        SettleFailure::Disabled
    } else {
        account.cooldown_until = Some(now_ms + failure_cooldown_ms);
        SettleFailure::CoolingDown
    }
}
