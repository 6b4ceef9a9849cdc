//! Bus configuration: the operational knobs of the delivery/retry pipeline
//! plus notify-strategy selection, loaded from the environment with typed
//! defaults (mirrors how the teacher's `NatsConfig` layers env vars over
//! defaults rather than requiring a config file).

use std::env;
use std::time::Duration;

/// Which `NotifyStrategy` to wire up. `Auto` follows the selection policy:
/// prefer bus if a bus URL is configured, else server if the store supports
/// LISTEN/NOTIFY, else polling. All non-polling selections are composed
/// with polling as a safety net.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyStrategyKind {
    Auto,
    Bus,
    Server,
    Polling,
}

impl NotifyStrategyKind {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "bus" => NotifyStrategyKind::Bus,
            "server" => NotifyStrategyKind::Server,
            "polling" => NotifyStrategyKind::Polling,
            _ => NotifyStrategyKind::Auto,
        }
    }
}

/// Tunables for the delivery/retry pipeline. All fields have defaults
/// matching the spec; `from_env` overlays environment variables on top.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub poll_interval_ms: u64,
    pub batch_size: i64,
    pub max_attempts: i32,
    pub retry_delay_ms: i64,
    pub max_delay_ms: i64,
    pub notify_strategy: NotifyStrategyKind,
    pub bus_url: Option<String>,
    pub server_notify_channel: String,
    pub bus_notify_subject: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            batch_size: 100,
            max_attempts: 20,
            retry_delay_ms: 1000,
            max_delay_ms: 3_600_000,
            notify_strategy: NotifyStrategyKind::Auto,
            bus_url: None,
            server_notify_channel: "eventrelay_delivery".to_string(),
            bus_notify_subject: "eventrelay.delivery".to_string(),
        }
    }
}

impl BusConfig {
    /// Overlay `EVENTRELAY_*` environment variables onto the defaults.
    /// Malformed numeric values are ignored in favor of the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_u64("EVENTRELAY_POLL_INTERVAL_MS") {
            config.poll_interval_ms = v;
        }
        if let Some(v) = env_i64("EVENTRELAY_BATCH_SIZE") {
            config.batch_size = v;
        }
        if let Some(v) = env_i32("EVENTRELAY_MAX_ATTEMPTS") {
            config.max_attempts = v;
        }
        if let Some(v) = env_i64("EVENTRELAY_RETRY_DELAY_MS") {
            config.retry_delay_ms = v;
        }
        if let Some(v) = env_i64("EVENTRELAY_MAX_DELAY_MS") {
            config.max_delay_ms = v;
        }
        if let Ok(raw) = env::var("EVENTRELAY_NOTIFY_STRATEGY") {
            config.notify_strategy = NotifyStrategyKind::parse(&raw);
        }
        if let Ok(url) = env::var("EVENTRELAY_BUS_URL") {
            config.bus_url = Some(url);
        }
        if let Ok(channel) = env::var("EVENTRELAY_SERVER_NOTIFY_CHANNEL") {
            config.server_notify_channel = channel;
        }
        if let Ok(subject) = env::var("EVENTRELAY_BUS_NOTIFY_SUBJECT") {
            config.bus_notify_subject = subject;
        }

        config
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_i64(key: &str) -> Option<i64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_i32(key: &str) -> Option<i32> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = BusConfig::default();
        assert_eq!(config.poll_interval_ms, 5000);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.max_attempts, 20);
        assert_eq!(config.retry_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 3_600_000);
        assert_eq!(config.notify_strategy, NotifyStrategyKind::Auto);
    }

    #[test]
    fn notify_strategy_kind_parses_case_insensitively() {
        assert_eq!(NotifyStrategyKind::parse("Bus"), NotifyStrategyKind::Bus);
        assert_eq!(
            NotifyStrategyKind::parse("SERVER"),
            NotifyStrategyKind::Server
        );
        assert_eq!(
            NotifyStrategyKind::parse("polling"),
            NotifyStrategyKind::Polling
        );
        assert_eq!(
            NotifyStrategyKind::parse("nonsense"),
            NotifyStrategyKind::Auto
        );
    }
}
