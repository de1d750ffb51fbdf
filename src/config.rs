//! Client tuning knobs.
//!
//! DESIGN
//! ======
//! Defaults match the timings the notebook engine expects from its browser
//! client. Every knob can be overridden through `NOTEBOOK_*` environment
//! variables; unparsable values fall back to the default.

use std::time::Duration;

use crate::state::idle::BondDedupPolicy;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_ERROR_GRACE_MS: u64 = 1_000;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 500;
const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;
const DEFAULT_KEEPALIVE_MS: u64 = 28_000;
const DEFAULT_RECENT_FRAMES: usize = 100;

/// Runtime configuration for a notebook session.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfig {
    /// Upper bound on the socket handshake.
    pub connect_timeout: Duration,
    /// How long a socket that reported an error gets to recover.
    pub error_grace_period: Duration,
    /// Pause before reconnecting after an unexpected close.
    pub reconnect_delay: Duration,
    /// Pause between attempts when a connect attempt fails outright.
    pub retry_delay: Duration,
    /// Interval between keepalive pings.
    pub keepalive_interval: Duration,
    /// Capacity of the recent inbound frame ring buffer.
    pub recent_frames: usize,
    /// Reconnect automatically after an unexpected close.
    pub auto_reconnect: bool,
    /// Whether an unchanged first bond value is sent.
    pub bond_dedup: BondDedupPolicy,
    /// Read-only preview: patch failures cannot be recovered by resync.
    pub static_preview: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            error_grace_period: Duration::from_millis(DEFAULT_ERROR_GRACE_MS),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            keepalive_interval: Duration::from_millis(DEFAULT_KEEPALIVE_MS),
            recent_frames: DEFAULT_RECENT_FRAMES,
            auto_reconnect: true,
            bond_dedup: BondDedupPolicy::default(),
            static_preview: false,
        }
    }
}

impl ClientConfig {
    /// Load config from environment with defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let bond_dedup = std::env::var("NOTEBOOK_BOND_DEDUP")
            .ok()
            .and_then(|raw| BondDedupPolicy::parse(&raw))
            .unwrap_or_default();

        Self {
            connect_timeout: env_millis("NOTEBOOK_CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS),
            error_grace_period: env_millis("NOTEBOOK_ERROR_GRACE_MS", DEFAULT_ERROR_GRACE_MS),
            reconnect_delay: env_millis("NOTEBOOK_RECONNECT_DELAY_MS", DEFAULT_RECONNECT_DELAY_MS),
            retry_delay: env_millis("NOTEBOOK_RETRY_DELAY_MS", DEFAULT_RETRY_DELAY_MS),
            keepalive_interval: env_millis("NOTEBOOK_KEEPALIVE_MS", DEFAULT_KEEPALIVE_MS),
            recent_frames: env_parse("NOTEBOOK_RECENT_FRAMES", DEFAULT_RECENT_FRAMES),
            auto_reconnect: env_parse("NOTEBOOK_AUTO_RECONNECT", true),
            bond_dedup,
            static_preview: env_parse("NOTEBOOK_STATIC_PREVIEW", false),
        }
    }
}

fn env_millis(key: &str, default: u64) -> Duration {
    Duration::from_millis(env_parse(key, default))
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
