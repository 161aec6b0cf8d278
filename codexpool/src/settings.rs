//! Environment flags recognized by the broker.

use crate::account::RotationStrategy;
use crate::acquire::DEFAULT_REFRESH_BUFFER_MS;

pub const ENV_PROACTIVE_REFRESH: &str = "CODEXPOOL_PROACTIVE_REFRESH";
pub const ENV_REFRESH_BUFFER_MS: &str = "CODEXPOOL_REFRESH_BUFFER_MS";
pub const ENV_QUIET: &str = "CODEXPOOL_QUIET";
pub const ENV_ROTATION_STRATEGY: &str = "CODEXPOOL_ROTATION_STRATEGY";
pub const ENV_STICKY_PID_OFFSET: &str = "CODEXPOOL_STICKY_PID_OFFSET";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Enables the background proactive-refresh loop.
    pub proactive_refresh: bool,
    /// How far before expiry a token counts as due.
    pub refresh_buffer_ms: i64,
    /// Suppress toasts.
    pub quiet: bool,
    /// Overrides the rotation strategy stored in the auth file.
    pub strategy_override: Option<RotationStrategy>,
    /// Spread concurrent processes across accounts by pid.
    pub sticky_pid_offset: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            proactive_refresh: false,
            refresh_buffer_ms: DEFAULT_REFRESH_BUFFER_MS,
            quiet: false,
            strategy_override: None,
            sticky_pid_offset: false,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Settings::default();
        Self {
            proactive_refresh: lookup(ENV_PROACTIVE_REFRESH)
                .map(|v| parse_bool(&v))
                .unwrap_or(defaults.proactive_refresh),
            refresh_buffer_ms: lookup(ENV_REFRESH_BUFFER_MS)
                .and_then(|v| v.trim().parse::<i64>().ok())
                .filter(|ms| *ms >= 0)
                .unwrap_or(defaults.refresh_buffer_ms),
            quiet: lookup(ENV_QUIET)
                .map(|v| parse_bool(&v))
                .unwrap_or(defaults.quiet),
            strategy_override: lookup(ENV_ROTATION_STRATEGY)
                .and_then(|v| RotationStrategy::parse(&v)),
            sticky_pid_offset: lookup(ENV_STICKY_PID_OFFSET)
                .map(|v| parse_bool(&v))
                .unwrap_or(defaults.sticky_pid_offset),
        }
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
