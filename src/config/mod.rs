//! Config Module - Configuration management
//!
//! Defaults mirror the production presence deployment; every knob can be
//! overridden from a TOML file or from environment variables.

use serde::{Deserialize, Serialize};

/// Main configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub presence: PresenceConfig,
    pub reaper: ReaperConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Cap on non-self subscriptions per socket.
    pub max_subscriptions_per_socket: usize,
    /// Pending outbound statuses buffered per socket before old ones drop.
    pub outbound_buffer_size: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

/// Presence key layout and timing knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PresenceConfig {
    pub heartbeat_window_seconds: i64,
    pub min_interval_seconds: i64,
    pub state_ttl_seconds: u64,
    pub num_shards: u32,
    pub scored_set_key_prefix: String,
    pub state_key_prefix: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReaperConfig {
    pub poll_interval_seconds: f64,
    pub batch_size: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_subscriptions_per_socket: 500,
            outbound_buffer_size: 64,
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_window_seconds: 30,
            min_interval_seconds: 5,
            state_ttl_seconds: 86400, // 1 day
            num_shards: 1,
            scored_set_key_prefix: "onlineUsers".to_string(),
            state_key_prefix: "presence:state".to_string(),
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 1.0,
            batch_size: 500,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            redis: RedisConfig::default(),
            presence: PresenceConfig::default(),
            reaper: ReaperConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load from a TOML file, then apply environment overrides.
    pub async fn load(path: &str) -> Result<Config, String> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("Failed to read config {}: {}", path, e))?;
        let mut config: Config =
            toml::from_str(&content).map_err(|e| format!("Invalid TOML in {}: {}", path, e))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides; used when no config file is given.
    pub fn from_env() -> Config {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<String>("REDIS_URL") {
            self.redis.url = v;
        }
        if let Some(v) = env_parse::<i64>("HEARTBEAT_WINDOW_SECONDS") {
            self.presence.heartbeat_window_seconds = v;
        }
        if let Some(v) = env_parse::<i64>("MIN_INTERVAL_SECONDS") {
            self.presence.min_interval_seconds = v;
        }
        if let Some(v) = env_parse::<u64>("STATE_TTL_SECONDS") {
            self.presence.state_ttl_seconds = v;
        }
        if let Some(v) = env_parse::<u32>("NUM_SHARDS") {
            self.presence.num_shards = v;
        }
        if let Some(v) = env_parse::<String>("SCORED_SET_KEY_PREFIX") {
            self.presence.scored_set_key_prefix = v;
        }
        if let Some(v) = env_parse::<String>("STATE_KEY_PREFIX") {
            self.presence.state_key_prefix = v;
        }
        if let Some(v) = env_parse::<f64>("POLL_INTERVAL_SECONDS") {
            self.reaper.poll_interval_seconds = v;
        }
        if let Some(v) = env_parse::<usize>("REAPER_BATCH_SIZE") {
            self.reaper.batch_size = v;
        }
        if let Some(v) = env_parse::<usize>("MAX_SUBSCRIPTIONS_PER_SOCKET") {
            self.server.max_subscriptions_per_socket = v;
        }
    }

    /// Validate config
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("Invalid server port".to_string());
        }
        if self.presence.num_shards == 0 {
            errors.push("num_shards must be > 0".to_string());
        }
        if self.presence.heartbeat_window_seconds <= 0 {
            errors.push("heartbeat_window_seconds must be > 0".to_string());
        }
        if self.presence.min_interval_seconds >= self.presence.heartbeat_window_seconds {
            errors.push("min_interval_seconds must be below heartbeat_window_seconds".to_string());
        }
        if self.reaper.batch_size == 0 {
            errors.push("reaper batch_size must be > 0".to_string());
        }
        if self.reaper.poll_interval_seconds <= 0.0 {
            errors.push("reaper poll_interval_seconds must be > 0".to_string());
        }
        if self.server.outbound_buffer_size == 0 {
            errors.push("outbound_buffer_size must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Export config as TOML
    pub fn export_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| format!("Failed to serialize: {}", e))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_deployment() {
        let config = Config::default();
        assert_eq!(config.presence.heartbeat_window_seconds, 30);
        assert_eq!(config.presence.min_interval_seconds, 5);
        assert_eq!(config.presence.state_ttl_seconds, 86400);
        assert_eq!(config.presence.num_shards, 1);
        assert_eq!(config.presence.scored_set_key_prefix, "onlineUsers");
        assert_eq!(config.presence.state_key_prefix, "presence:state");
        assert_eq!(config.reaper.batch_size, 500);
        assert_eq!(config.server.max_subscriptions_per_socket, 500);
    }

    #[test]
    fn test_validate_rejects_zero_shards() {
        let mut config = Config::default();
        config.presence.num_shards = 0;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("num_shards")));
    }

    #[test]
    fn test_validate_rejects_min_interval_above_window() {
        let mut config = Config::default();
        config.presence.min_interval_seconds = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = Config::default();
        let toml = config.export_toml().unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.server.port, config.server.port);
        assert_eq!(
            parsed.presence.scored_set_key_prefix,
            config.presence.scored_set_key_prefix
        );
    }
}
