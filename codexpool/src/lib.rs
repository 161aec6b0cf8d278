pub mod account;
pub mod acquire;
pub mod affinity;
pub mod identity;
pub mod lock;
pub mod orchestrator;
pub mod paths;
pub mod persist;
pub mod proactive;
pub mod refresh;
pub mod rotation;
pub mod settings;
pub mod snapshots;
pub mod storage;
pub mod tools;

// Re-exports for convenience
pub use account::{AccountRecord, AuthFile, AuthMode, OAuthDomain, OpenAIAuth, RotationStrategy};
pub use acquire::{
    AcquireError, AcquireRequest, AcquiredAuth, AuthBroker, BrokerOptions, CredentialBroker,
};
pub use affinity::{SessionAffinityFile, SessionAffinityStore};
pub use identity::{build_identity_key, parse_claims, IdentityClaims};
pub use orchestrator::{
    FetchError, FetchOrchestrator, HttpFetch, OrchestratorError, OrchestratorHooks,
    OutboundRequest, OutboundResponse, ReqwestFetch, SessionKind, ToastEvent,
};
pub use paths::InvalidSessionKey;
pub use proactive::{ProactiveHandle, ProactiveRefresher, TickReport};
pub use refresh::{HttpTokenRefresher, RefreshError, RefreshedTokens, TokenRefresher};
pub use rotation::{RotationDecision, StickySessionState};
pub use settings::Settings;
pub use snapshots::{snapshot_from_headers, RateLimitSnapshot, SnapshotStore};
pub use storage::{AuthFileKind, AuthStorage, LegacyImport, LegacyImportSources, TokenUpdate};
pub use tools::{
    list_accounts_for_tools, parse_display_index, remove_account_by_index,
    switch_account_by_index, toggle_account_enabled_by_index, AccountOpError, AccountRow,
};

/// Current time in epoch milliseconds.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
