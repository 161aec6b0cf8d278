//! Background refresh of tokens about to expire.
//!
//! Each tick claims due accounts one at a time with the same lease protocol
//! the request path uses, so a foreground acquire and this loop never
//! double-refresh an identity. Errors are swallowed; the loop is
//! best-effort and the request path remains the fallback.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::account::AuthMode;
use crate::acquire::{
    settle_refresh_failure, settle_refresh_success, RefreshClaim, SettleFailure, SettleSuccess,
    DEFAULT_FAILURE_COOLDOWN_MS, DEFAULT_LEASE_MS, DEFAULT_REFRESH_BUFFER_MS,
};
use crate::refresh::TokenRefresher;
use crate::storage::AuthStorage;

pub const DEFAULT_PROACTIVE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub refreshed: usize,
    pub cooled_down: usize,
    pub disabled: usize,
    pub stale: usize,
}

pub struct ProactiveRefresher {
    storage: AuthStorage,
    refresher: Arc<dyn TokenRefresher>,
    buffer_ms: i64,
    lease_ms: i64,
    failure_cooldown_ms: i64,
}

impl ProactiveRefresher {
    pub fn new(storage: AuthStorage, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            storage,
            refresher,
            buffer_ms: DEFAULT_REFRESH_BUFFER_MS,
            lease_ms: DEFAULT_LEASE_MS,
            failure_cooldown_ms: DEFAULT_FAILURE_COOLDOWN_MS,
        }
    }

    pub fn with_buffer_ms(mut self, buffer_ms: i64) -> Self {
        self.buffer_ms = buffer_ms;
        self
    }

    /// Refresh every due account across both domains. Bounded by the number
    /// of eligible accounts: each loop iteration either claims a new
    /// identity or stops.
    pub async fn run_one_tick(&self, now_ms: i64) -> TickReport {
        let mut report = TickReport::default();
        for mode in AuthMode::ALL {
            let mut stale: HashSet<String> = HashSet::new();
            loop {
                let claim = match self.claim_next_due(mode, &stale, now_ms) {
                    Ok(Some(claim)) => claim,
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "proactive refresh could not read auth file");
                        break;
                    }
                };

                let result = self.refresher.refresh(&claim.refresh).await;
                let settle_now = crate::now_ms();
                let settled = match result {
                    Ok(tokens) => self.storage.save_with(|auth| {
                        let domain = auth.ensure_openai().ensure_domain(mode);
                        Ok(Settled::Success(settle_refresh_success(
                            domain,
                            &claim,
                            &tokens,
                            settle_now,
                            self.buffer_ms,
                            self.failure_cooldown_ms,
                            false,
                        )))
                    }),
                    Err(err) => {
                        let terminal = err.is_terminal();
                        let identity_key = claim.identity_key.clone();
                        let outcome = self.storage.save_with(|auth| {
                            let domain = auth.ensure_openai().ensure_domain(mode);
                            Ok(Settled::Failure(settle_refresh_failure(
                                domain,
                                &claim,
                                terminal,
                                settle_now,
                                self.failure_cooldown_ms,
                            )))
                        });
                        if terminal {
                            tracing::warn!(
                                identity_key = %identity_key,
                                error = %err,
                                "proactive refresh rejected, disabling account"
                            );
                        } else {
                            tracing::debug!(
                                identity_key = %identity_key,
                                error = %err,
                                "proactive refresh failed, will retry next tick"
                            );
                        }
                        outcome
                    }
                };

                match settled {
                    Ok(Settled::Success(SettleSuccess::Committed(_))) => report.refreshed += 1,
                    Ok(Settled::Success(SettleSuccess::Stale))
                    | Ok(Settled::Failure(SettleFailure::Stale)) => {
                        report.stale += 1;
                        stale.insert(claim.identity_key.clone());
                    }
                    Ok(Settled::Failure(SettleFailure::Disabled)) => report.disabled += 1,
                    Ok(Settled::Failure(SettleFailure::CoolingDown)) => report.cooled_down += 1,
                    Err(err) => {
                        tracing::warn!(error = %err, "proactive refresh could not settle");
                        break;
                    }
                }
            }
        }
        report
    }

    /// Under the save lock, stamp a lease on the first enabled account whose
    /// token is due and which nothing else is touching.
    fn claim_next_due(
        &self,
        mode: AuthMode,
        stale: &HashSet<String>,
        now_ms: i64,
    ) -> anyhow::Result<Option<RefreshClaim>> {
        let buffer_ms = self.buffer_ms;
        let lease_until = now_ms + self.lease_ms;
        self.storage.save_with(|auth| {
            let Some(domain) = auth.openai.as_mut().and_then(|o| o.domain_mut(mode)) else {
                return Ok(None);
            };
            for account in &mut domain.accounts {
                if !account.enabled || account.identity_key.is_empty() {
                    continue;
                }
                if stale.contains(&account.identity_key) {
                    continue;
                }
                let Some(expires) = account.expires else {
                    continue;
                };
                if expires > now_ms + buffer_ms {
                    continue;
                }
                if account.cooldown_until.unwrap_or(0) > now_ms
                    || account.refresh_lease_until.unwrap_or(0) > now_ms
                {
                    continue;
                }
                let Some(refresh) = account.refresh.clone() else {
                    continue;
                };
                account.refresh_lease_until = Some(lease_until);
                return Ok(Some(RefreshClaim {
                    identity_key: account.identity_key.clone(),
                    refresh,
                    lease_until,
                    advance_active: false,
                }));
            }
            Ok(None)
        })
    }

    /// Drive `run_one_tick` on a timer until the handle is stopped. The
    /// first (immediate) interval tick is skipped.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> ProactiveHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.run_one_tick(crate::now_ms()).await;
                        if report != TickReport::default() {
                            tracing::debug!(
                                refreshed = report.refreshed,
                                cooled_down = report.cooled_down,
                                disabled = report.disabled,
                                stale = report.stale,
                                "proactive refresh tick"
                            );
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        ProactiveHandle { stop_tx, task }
    }
}

enum Settled {
    Success(SettleSuccess),
    Failure(SettleFailure),
}

pub struct ProactiveHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ProactiveHandle {
    /// Signal the loop to exit and wait for the in-flight tick to drain.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountRecord;
    use crate::acquire::tests::{fresh_token, seed_store, FakeRefresher};
    use crate::refresh::RefreshError;

    fn due_account(name: &str, expires: i64) -> AccountRecord {
        AccountRecord {
            identity_key: format!("{name}|{name}@x.y|plus"),
            account_id: Some(name.to_string()),
            email: Some(format!("{name}@x.y")),
            plan: Some("plus".to_string()),
            access: Some("at_old".to_string()),
            refresh: Some(format!("rt_{name}")),
            expires: Some(expires),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn due_token_is_refreshed_and_lease_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let now = crate::now_ms();
        let storage = seed_store(&dir, vec![due_account("a", now + 30_000)]);
        let refresher = Arc::new(FakeRefresher::new(vec![Ok(fresh_token("a@x.y"))]));
        let proactive = ProactiveRefresher::new(storage.clone(), refresher);

        let report = proactive.run_one_tick(now).await;
        assert_eq!(report.refreshed, 1);

        let file = storage.load().unwrap();
        let account = &file.domain(AuthMode::Native).unwrap().accounts[0];
        assert!(account.expires.unwrap() > now + 60_000);
        assert!(account.refresh_lease_until.is_none());
        assert!(account.cooldown_until.is_none());
    }

    #[tokio::test]
    async fn fresh_tokens_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let now = crate::now_ms();
        let storage = seed_store(&dir, vec![due_account("a", now + 3_600_000)]);
        let refresher = Arc::new(FakeRefresher::new(vec![]));
        let proactive = ProactiveRefresher::new(storage.clone(), refresher.clone());

        let report = proactive.run_one_tick(now).await;
        assert_eq!(report, TickReport::default());
        assert!(refresher.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_and_cooling_accounts_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let now = crate::now_ms();
        let mut disabled = due_account("a", now);
        disabled.enabled = false;
        let mut cooling = due_account("b", now);
        cooling.cooldown_until = Some(now + 60_000);
        let storage = seed_store(&dir, vec![disabled, cooling]);
        let refresher = Arc::new(FakeRefresher::new(vec![]));
        let proactive = ProactiveRefresher::new(storage, refresher.clone());

        let report = proactive.run_one_tick(now).await;
        assert_eq!(report, TickReport::default());
        assert!(refresher.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn every_due_account_is_refreshed_in_one_tick() {
        let dir = tempfile::tempdir().unwrap();
        let now = crate::now_ms();
        let storage = seed_store(
            &dir,
            vec![due_account("a", now + 1_000), due_account("b", now + 2_000)],
        );
        let refresher = Arc::new(FakeRefresher::new(vec![
            Ok(fresh_token("a@x.y")),
            Ok(fresh_token("b@x.y")),
        ]));
        let proactive = ProactiveRefresher::new(storage, refresher.clone());

        let report = proactive.run_one_tick(now).await;
        assert_eq!(report.refreshed, 2);
        assert_eq!(refresher.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn terminal_rejection_disables_the_account() {
        let dir = tempfile::tempdir().unwrap();
        let now = crate::now_ms();
        let storage = seed_store(&dir, vec![due_account("a", now)]);
        let refresher = Arc::new(FakeRefresher::new(vec![Err(RefreshError::Oauth {
            code: Some("refresh_token_revoked".into()),
            description: None,
        })]));
        let proactive = ProactiveRefresher::new(storage.clone(), refresher);

        let report = proactive.run_one_tick(now).await;
        assert_eq!(report.disabled, 1);

        let file = storage.load().unwrap();
        let account = &file.domain(AuthMode::Native).unwrap().accounts[0];
        assert!(!account.enabled);
        assert!(account.cooldown_until.is_none());
    }

    #[tokio::test]
    async fn transient_failure_cools_down_until_next_tick() {
        let dir = tempfile::tempdir().unwrap();
        let now = crate::now_ms();
        let storage = seed_store(&dir, vec![due_account("a", now)]);
        let refresher = Arc::new(FakeRefresher::new(vec![Err(RefreshError::Http {
            status: 503,
            body: "unavailable".into(),
        })]));
        let proactive = ProactiveRefresher::new(storage.clone(), refresher);

        let report = proactive.run_one_tick(now).await;
        assert_eq!(report.cooled_down, 1);

        let file = storage.load().unwrap();
        let account = &file.domain(AuthMode::Native).unwrap().accounts[0];
        assert!(account.enabled);
        assert!(account.cooldown_until.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_loop_ticks_and_stops_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let storage = seed_store(&dir, vec![]);
        let refresher = Arc::new(FakeRefresher::new(vec![]));
        let proactive = Arc::new(ProactiveRefresher::new(storage, refresher));

        let handle = proactive.spawn(Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        handle.stop().await;
    }
}
