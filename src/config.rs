//! Client configuration parsed from environment variables.
//!
//! One default request timeout replaces per-call-site literals; callers
//! override it per request through `RequestOptions`.

use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_STREAM_IDLE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_STREAM_SWEEP_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_INITIAL_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// Window applied to requests that do not pass their own timeout.
    pub request_timeout: Duration,
    /// Frames held while disconnected. The oldest is dropped on overflow.
    pub queue_capacity: usize,
    /// A stream with no chunk for this long is evicted as incomplete.
    pub stream_idle_timeout: Duration,
    /// How often the reader task checks for idle streams.
    pub stream_sweep_interval: Duration,
    /// Emit a partial update for every non-final chunk.
    pub emit_partials: bool,
    pub reconnect_initial_backoff: Duration,
    pub reconnect_max_backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            stream_idle_timeout: Duration::from_millis(DEFAULT_STREAM_IDLE_TIMEOUT_MS),
            stream_sweep_interval: Duration::from_millis(DEFAULT_STREAM_SWEEP_INTERVAL_MS),
            emit_partials: true,
            reconnect_initial_backoff: Duration::from_millis(DEFAULT_RECONNECT_INITIAL_MS),
            reconnect_max_backoff: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
        }
    }
}

impl ClientConfig {
    /// Build config from process environment.
    ///
    /// Optional:
    /// - `SWITCHBOARD_REQUEST_TIMEOUT_MS`: default 30000
    /// - `SWITCHBOARD_QUEUE_CAPACITY`: default 256, minimum 1
    /// - `SWITCHBOARD_STREAM_IDLE_TIMEOUT_MS`: default 30000
    /// - `SWITCHBOARD_STREAM_SWEEP_INTERVAL_MS`: default 1000
    /// - `SWITCHBOARD_EMIT_PARTIALS`: `true` (default) or `false`
    /// - `SWITCHBOARD_RECONNECT_INITIAL_MS`: default 1000
    /// - `SWITCHBOARD_RECONNECT_MAX_MS`: default 10000
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Unparseable values fall
    /// back to their defaults.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let millis = |key: &str, default: u64| Duration::from_millis(parse_or(&lookup, key, default));

        let initial = millis("SWITCHBOARD_RECONNECT_INITIAL_MS", DEFAULT_RECONNECT_INITIAL_MS);
        let max = millis("SWITCHBOARD_RECONNECT_MAX_MS", DEFAULT_RECONNECT_MAX_MS);

        Self {
            request_timeout: millis("SWITCHBOARD_REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS),
            queue_capacity: parse_or(&lookup, "SWITCHBOARD_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY).max(1),
            stream_idle_timeout: millis("SWITCHBOARD_STREAM_IDLE_TIMEOUT_MS", DEFAULT_STREAM_IDLE_TIMEOUT_MS),
            stream_sweep_interval: millis("SWITCHBOARD_STREAM_SWEEP_INTERVAL_MS", DEFAULT_STREAM_SWEEP_INTERVAL_MS)
                .max(Duration::from_millis(1)),
            emit_partials: parse_or(&lookup, "SWITCHBOARD_EMIT_PARTIALS", true),
            reconnect_initial_backoff: initial,
            reconnect_max_backoff: max.max(initial),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
