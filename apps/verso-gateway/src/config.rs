use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Redis URL for the cross-process fanout bus. Unset means in-process
    /// fanout only, which is fine for a single gateway instance.
    pub redis_url: Option<String>,
    pub heartbeat_check_seconds: u64,
    pub heartbeat_timeout_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("VERSO_GATEWAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            redis_url: env::var("REDIS_URL").ok(),
            heartbeat_check_seconds: env::var("VERSO_HEARTBEAT_CHECK")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            heartbeat_timeout_seconds: env::var("VERSO_HEARTBEAT_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(600),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            redis_url: None,
            heartbeat_check_seconds: 60,
            heartbeat_timeout_seconds: 600,
        }
    }
}
