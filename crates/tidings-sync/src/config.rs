//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default app id used for topic naming.
pub const DEFAULT_APP_ID: &str = "tidings";

/// Default WebSocket endpoint.
pub const DEFAULT_WS_URL: &str = "ws://localhost:8080/api/ws";

/// Default REST base URL.
pub const DEFAULT_API_URL: &str = "http://localhost:8080";

/// Auto-reconnect behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive failed attempts (0 = retry forever).
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Growth factor between attempts.
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 1.5,
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.min(64) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }
}

/// Configuration for a [`SyncEngine`](crate::SyncEngine).
///
/// ```rust
/// use std::time::Duration;
/// use tidings_sync::SyncConfig;
///
/// let config = SyncConfig::new("acme")
///     .with_ws_url("wss://chat.acme.dev/api/ws")
///     .with_mutation_timeout(Duration::from_secs(5));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Application id, the namespace of every topic.
    pub app_id: String,
    /// WebSocket endpoint for the pub/sub transport.
    pub ws_url: String,
    /// Base URL of the REST API.
    pub api_url: String,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
    /// Time a mutation may wait for the server before rolling back.
    #[serde(with = "millis")]
    pub mutation_timeout: Duration,
    /// How long a typing indicator lives without a refresh.
    #[serde(with = "millis")]
    pub typing_ttl: Duration,
    /// Deleted ids remembered per topic.
    pub tombstone_capacity: usize,
    /// Capacity of the cache update broadcast channel.
    pub update_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            reconnect: ReconnectConfig::default(),
            mutation_timeout: Duration::from_secs(10),
            typing_ttl: Duration::from_secs(6),
            tombstone_capacity: 1024,
            update_buffer: 1024,
        }
    }
}

impl SyncConfig {
    /// Defaults with the given app id.
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            ..Self::default()
        }
    }

    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = url.into();
        self
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_mutation_timeout(mut self, timeout: Duration) -> Self {
        self.mutation_timeout = timeout;
        self
    }

    pub fn with_typing_ttl(mut self, ttl: Duration) -> Self {
        self.typing_ttl = ttl;
        self
    }

    pub fn with_tombstone_capacity(mut self, capacity: usize) -> Self {
        self.tombstone_capacity = capacity;
        self
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_id.is_empty() {
            return Err(ConfigError::EmptyAppId);
        }
        if self.app_id.contains(':') {
            return Err(ConfigError::InvalidAppId(self.app_id.clone()));
        }
        if self.mutation_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("mutation_timeout"));
        }
        if self.typing_ttl.is_zero() {
            return Err(ConfigError::ZeroDuration("typing_ttl"));
        }
        if self.reconnect.initial_delay.is_zero() {
            return Err(ConfigError::ZeroDuration("reconnect.initial_delay"));
        }
        if self.reconnect.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoff(self.reconnect.backoff_multiplier));
        }
        Ok(())
    }
}

/// Durations as integer milliseconds in serialized config.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
