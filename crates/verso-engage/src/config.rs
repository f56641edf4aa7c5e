use std::env;
use std::time::Duration;

use crate::dedup;
use crate::feed::DEFAULT_PAGE_LIMIT;

/// Client-side configuration, env-var driven with sensible defaults.
#[derive(Debug, Clone)]
pub struct EngageConfig {
    /// Base URL of the REST layer.
    pub api_base: String,
    /// WebSocket URL of the fanout gateway.
    pub gateway_url: String,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub heartbeat_interval: Duration,
    pub dedup_capacity: usize,
    pub dedup_ttl: Duration,
    pub page_limit: usize,
}

impl EngageConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_base: env::var("VERSO_API_BASE").unwrap_or(defaults.api_base),
            gateway_url: env::var("VERSO_GATEWAY_URL").unwrap_or(defaults.gateway_url),
            reconnect_initial: env_millis("VERSO_RECONNECT_INITIAL_MS")
                .unwrap_or(defaults.reconnect_initial),
            reconnect_max: env_millis("VERSO_RECONNECT_MAX_MS").unwrap_or(defaults.reconnect_max),
            heartbeat_interval: env_millis("VERSO_HEARTBEAT_MS")
                .unwrap_or(defaults.heartbeat_interval),
            dedup_capacity: env::var("VERSO_DEDUP_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.dedup_capacity),
            dedup_ttl: env_millis("VERSO_DEDUP_TTL_MS").unwrap_or(defaults.dedup_ttl),
            page_limit: env::var("VERSO_PAGE_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.page_limit),
        }
    }
}

impl Default for EngageConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:3000".to_string(),
            gateway_url: "ws://localhost:8080".to_string(),
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            dedup_capacity: dedup::DEFAULT_CAPACITY,
            dedup_ttl: dedup::DEFAULT_TTL,
            page_limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}
