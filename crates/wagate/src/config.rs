use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;

use serde::Deserialize;
use thiserror::Error;
use wagate_protocol::ClientConfig;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Ok(serde_saphyr::from_str(&contents)?)
    }

    /// Apply `REDIS_HOST` / `REDIS_PORT` to both Redis tiers.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    fn apply_env_with(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(host) = lookup("REDIS_HOST") {
            self.store.primary.host = host.clone();
            self.store.secondary.host = host;
        }
        if let Some(raw) = lookup("REDIS_PORT") {
            let port = raw
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidEnv {
                    key: "REDIS_PORT",
                    value: raw,
                })?;
            self.store.primary.port = port;
            self.store.secondary.port = port;
        }
        Ok(())
    }
}

// ============================================================================
// ServerConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Must exceed the connect deadline, or the transport cuts pending connects short.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_request_timeout() -> u64 {
    240
}

// ============================================================================
// StoreConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub primary: RedisConfig,
    #[serde(default)]
    pub secondary: RedisConfig,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            primary: RedisConfig::default(),
            secondary: RedisConfig::default(),
            key_prefix: default_key_prefix(),
            command_timeout_ms: default_command_timeout(),
            sessions_dir: default_sessions_dir(),
        }
    }
}

impl StoreConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn default_key_prefix() -> String {
    "wagate:session:".to_string()
}

fn default_command_timeout() -> u64 {
    10_000
}

fn default_sessions_dir() -> PathBuf {
    PathBuf::from("./sessions")
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            host: default_redis_host(),
            port: default_redis_port(),
        }
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

fn default_enabled() -> bool {
    true
}

fn default_redis_host() -> String {
    "redis".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

// ============================================================================
// ProtocolConfig
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: default_bridge_command(),
            args: Vec::new(),
        }
    }
}

fn default_bridge_command() -> String {
    "wagate-bridge".to_string()
}

// ============================================================================
// LifecycleConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_connect_deadline")]
    pub connect_deadline_seconds: u64,
    #[serde(default = "default_fallback_delay")]
    pub fallback_delay_ms: u64,
    #[serde(default = "default_eviction_delay")]
    pub eviction_delay_ms: u64,
    #[serde(default = "default_enabled")]
    pub auto_reconnect: bool,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Base of the contact link encoded in fallback QR codes.
    #[serde(default = "default_fallback_link_base")]
    pub fallback_link_base: String,
    /// How long an idle, disconnected instance stays visible in `/instances/{id}`.
    #[serde(default = "default_snapshot_ttl")]
    pub snapshot_ttl_seconds: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            connect_deadline_seconds: default_connect_deadline(),
            fallback_delay_ms: default_fallback_delay(),
            eviction_delay_ms: default_eviction_delay(),
            auto_reconnect: default_enabled(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            fallback_link_base: default_fallback_link_base(),
            snapshot_ttl_seconds: default_snapshot_ttl(),
        }
    }
}

impl LifecycleConfig {
    pub fn connect_deadline(&self) -> Duration {
        Duration::from_secs(self.connect_deadline_seconds)
    }

    pub fn fallback_delay(&self) -> Duration {
        Duration::from_millis(self.fallback_delay_ms)
    }

    pub fn eviction_delay(&self) -> Duration {
        Duration::from_millis(self.eviction_delay_ms)
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_seconds)
    }
}

fn default_connect_deadline() -> u64 {
    180
}

fn default_fallback_delay() -> u64 {
    5_000
}

fn default_eviction_delay() -> u64 {
    3_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_snapshot_ttl() -> u64 {
    3_600
}

fn default_fallback_link_base() -> String {
    "https://wa.me/".to_string()
}

// ============================================================================
// ConfigError
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.request_timeout_seconds, 240);
        assert_eq!(config.store.primary.url(), "redis://redis:6379/");
        assert_eq!(config.store.secondary.url(), "redis://redis:6379/");
        assert_eq!(config.store.command_timeout(), Duration::from_secs(10));
        assert_eq!(config.store.sessions_dir, PathBuf::from("./sessions"));
        assert_eq!(config.lifecycle.connect_deadline(), Duration::from_secs(180));
        assert_eq!(config.lifecycle.fallback_delay(), Duration::from_secs(5));
        assert_eq!(config.lifecycle.eviction_delay(), Duration::from_secs(3));
        assert!(config.lifecycle.auto_reconnect);
        assert_eq!(config.lifecycle.snapshot_ttl(), Duration::from_secs(3_600));
        assert_eq!(config.protocol.bridge.command, "wagate-bridge");
    }

    #[tokio::test]
    async fn test_load_missing_file_returns_defaults() {
        let tmp_dir = TempDir::new().unwrap();
        let missing_path = tmp_dir.path().join("missing-config.yaml");
        let config = Config::load(missing_path.to_str().unwrap()).await.unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 3000);
    }

    #[tokio::test]
    async fn test_load_valid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
server:
  host: "127.0.0.1"
  port: 4000
store:
  primary:
    host: "cache-a"
  secondary:
    enabled: false
  sessions_dir: "/var/lib/wagate/sessions"
protocol:
  bridge:
    command: "node"
    args: ["bridge.js"]
  client:
    connect_timeout_ms: 20000
    retry_delays:
      method_not_allowed_ms: 9000
lifecycle:
  connect_deadline_seconds: 60
  auto_reconnect: false
"#
        )
        .unwrap();

        let config = Config::load(file.path().to_str().unwrap()).await.unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.store.primary.host, "cache-a");
        assert_eq!(config.store.primary.port, 6379);
        assert!(!config.store.secondary.enabled);
        assert_eq!(
            config.store.sessions_dir,
            PathBuf::from("/var/lib/wagate/sessions")
        );
        assert_eq!(config.protocol.bridge.command, "node");
        assert_eq!(config.protocol.bridge.args, vec!["bridge.js".to_string()]);
        assert_eq!(config.protocol.client.connect_timeout_ms, 20_000);
        assert_eq!(config.protocol.client.retry_delays.method_not_allowed_ms, 9_000);
        // untouched entries keep their tuned defaults
        assert_eq!(config.protocol.client.retry_delays.rate_limited_ms, 10_000);
        assert_eq!(config.lifecycle.connect_deadline_seconds, 60);
        assert!(!config.lifecycle.auto_reconnect);
    }

    #[tokio::test]
    async fn test_load_invalid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid: yaml: content: [").unwrap();

        let result = Config::load(file.path().to_str().unwrap()).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_env_overrides_both_redis_tiers() {
        let env = HashMap::from([("REDIS_HOST", "10.0.0.5"), ("REDIS_PORT", "6380")]);
        let mut config = Config::default();
        config
            .apply_env_with(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.store.primary.url(), "redis://10.0.0.5:6380/");
        assert_eq!(config.store.secondary.url(), "redis://10.0.0.5:6380/");
    }

    #[test]
    fn test_env_rejects_bad_port() {
        let mut config = Config::default();
        let err = config
            .apply_env_with(|key| (key == "REDIS_PORT").then(|| "not-a-port".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("REDIS_PORT"));
    }

    #[test]
    fn test_config_error_display() {
        let io_error = ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "test",
        ));
        assert!(io_error.to_string().contains("failed to read config file"));
    }
}
