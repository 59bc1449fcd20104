use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use kindred_coordinator::CoordinatorConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_addr: SocketAddr,
    /// Database file; `None` runs on an in-memory database (dev only).
    pub db_path: Option<PathBuf>,
    pub jwt_secret: String,
    pub token_ttl: Duration,
    pub coordinator: CoordinatorConfig,
    pub rate_limit_per_sec: f64,
    pub rate_limit_burst: f64,
    /// Inbound WebSocket frame budget, per connection.
    pub ws_frames_per_sec: f64,
    pub ws_frame_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            db_path: Some(PathBuf::from("./kindred.db")),
            jwt_secret: "dev-secret-change-me".to_string(),
            token_ttl: Duration::from_secs(24 * 3600),
            coordinator: CoordinatorConfig::default(),
            rate_limit_per_sec: 10.0,
            rate_limit_burst: 30.0,
            ws_frames_per_sec: 20.0,
            ws_frame_burst: 40.0,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("KINDRED_HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid KINDRED_HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("KINDRED_DB_PATH") {
            if path == ":memory:" {
                config.db_path = None;
            } else {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        if let Ok(secret) = std::env::var("KINDRED_JWT_SECRET") {
            if !secret.is_empty() {
                config.jwt_secret = secret;
            }
        }

        if let Some(secs) = env_u64("KINDRED_TOKEN_TTL_SECS") {
            config.token_ttl = Duration::from_secs(secs);
        }

        if let Some(ms) = env_u64("KINDRED_TICK_INTERVAL_MS") {
            config.coordinator.tick_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("KINDRED_BALLOT_TTL_SECS") {
            config.coordinator.ballot_ttl = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("KINDRED_SEND_QUEUE") {
            config.coordinator.send_queue = n as usize;
        }
        if let Some(ms) = env_u64("KINDRED_SEND_TIMEOUT_MS") {
            config.coordinator.send_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("KINDRED_MAX_CONTENT_BYTES") {
            config.coordinator.max_content_bytes = n as usize;
        }
        if let Some(n) = env_u64("KINDRED_PAGE_SIZE_MAX") {
            config.coordinator.page_size_max = n as u32;
        }

        if let Ok(val) = std::env::var("KINDRED_RATE_LIMIT_PER_SEC") {
            if let Ok(rate) = val.parse::<f64>() {
                config.rate_limit_per_sec = rate;
            }
        }
        if let Ok(val) = std::env::var("KINDRED_RATE_LIMIT_BURST") {
            if let Ok(burst) = val.parse::<f64>() {
                config.rate_limit_burst = burst;
            }
        }
        if let Ok(val) = std::env::var("KINDRED_WS_FRAMES_PER_SEC") {
            if let Ok(rate) = val.parse::<f64>() {
                config.ws_frames_per_sec = rate;
            }
        }
        if let Ok(val) = std::env::var("KINDRED_WS_FRAME_BURST") {
            if let Ok(burst) = val.parse::<f64>() {
                config.ws_frame_burst = burst;
            }
        }

        config
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    match val.parse::<u64>() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(var = name, value = %val, "invalid numeric env var, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.coordinator.tick_interval, Duration::from_secs(3));
        assert_eq!(config.coordinator.ballot_ttl, Duration::from_secs(120));
    }
}
