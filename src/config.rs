//! Gateway configuration.
//!
//! Every section has working defaults, so an empty JSON object is a valid
//! configuration. Durations are written in milliseconds (`*_ms` keys).
//!
//! ```
//! use amqp_gateway::config::GatewayConfig;
//!
//! let config = GatewayConfig::from_json(r#"{
//!     "bind": "0.0.0.0:5672",
//!     "lookup": { "tenant": "public", "timeout_ms": 2000 }
//! }"#).unwrap();
//!
//! assert_eq!(config.lookup.tenant.as_deref(), Some("public"));
//! assert_eq!(config.tuning.frame_max, 131_072);
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::{default_server_properties, ConnectionSettings};
use crate::error::{ConfigError, GatewayError, Result};
use crate::protocol::{DEFAULT_FRAME_MAX, FRAME_MIN_SIZE};
use crate::router::ForwardMode;
use crate::writer::WriterConfig;

/// Serde helper for `Duration` as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Default listen address.
pub const DEFAULT_BIND: &str = "127.0.0.1:5682";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    /// Concurrent client sessions; excess connections are dropped.
    pub max_connections: usize,
    /// Time allowed for each client handshake step.
    #[serde(rename = "handshake_timeout_ms", with = "duration_ms")]
    pub handshake_timeout: Duration,
    pub tuning: TuningConfig,
    pub lookup: LookupConfig,
    pub routing: RoutingConfig,
    pub writer: WriterConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 5682)),
            max_connections: 10_000,
            handshake_timeout: Duration::from_secs(10),
            tuning: TuningConfig::default(),
            lookup: LookupConfig::default(),
            routing: RoutingConfig::default(),
            writer: WriterConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError("max_connections must be at least 1".into()));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError("handshake_timeout_ms must be non-zero".into()));
        }
        self.tuning.validate()?;
        self.lookup.validate()?;
        self.routing.validate()?;
        if self.writer.max_pending_frames == 0 {
            return Err(ConfigError("writer.max_pending_frames must be at least 1".into()));
        }
        Ok(())
    }
}

/// Limits offered to clients during tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    pub frame_max: u32,
    /// Frame size limit before tuning completes.
    pub initial_frame_max: u32,
    pub channel_max: u16,
    /// Heartbeat interval in seconds; 0 disables.
    pub heartbeat: u16,
    /// Missed intervals tolerated before a peer is declared dead.
    pub heartbeat_grace: u32,
    pub mechanisms: Vec<String>,
    pub locales: String,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            frame_max: DEFAULT_FRAME_MAX,
            initial_frame_max: FRAME_MIN_SIZE,
            channel_max: 2047,
            heartbeat: 60,
            heartbeat_grace: 2,
            mechanisms: vec!["PLAIN".into(), "AMQPLAIN".into()],
            locales: "en_US".into(),
        }
    }
}

impl TuningConfig {
    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.frame_max < FRAME_MIN_SIZE {
            return Err(ConfigError(format!(
                "tuning.frame_max {} is below the protocol minimum {FRAME_MIN_SIZE}",
                self.frame_max
            )));
        }
        if self.initial_frame_max < FRAME_MIN_SIZE {
            return Err(ConfigError(format!(
                "tuning.initial_frame_max {} is below the protocol minimum {FRAME_MIN_SIZE}",
                self.initial_frame_max
            )));
        }
        if self.initial_frame_max > self.frame_max {
            return Err(ConfigError(format!(
                "tuning.initial_frame_max {} exceeds tuning.frame_max {}",
                self.initial_frame_max, self.frame_max
            )));
        }
        if self.heartbeat_grace == 0 {
            return Err(ConfigError("tuning.heartbeat_grace must be at least 1".into()));
        }
        if self.mechanisms.is_empty() {
            return Err(ConfigError("tuning.mechanisms must not be empty".into()));
        }
        Ok(())
    }

    /// Server side of the handshake.
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            channel_max: self.channel_max,
            frame_max: self.frame_max,
            heartbeat: self.heartbeat,
            mechanisms: self.mechanisms.clone(),
            locales: self.locales.clone(),
            server_properties: default_server_properties(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    /// Key of this protocol in a broker's advertised `protocols` map.
    pub protocol_name: String,
    /// Prefixed to every namespace, `tenant/vhost`.
    pub tenant: Option<String>,
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    #[serde(rename = "ownership_ttl_ms", with = "duration_ms")]
    pub ownership_ttl: Duration,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            protocol_name: "amqp".into(),
            tenant: None,
            timeout: Duration::from_secs(5),
            ownership_ttl: Duration::from_secs(300),
        }
    }
}

impl LookupConfig {
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn ownership_ttl(&self) -> Duration {
        self.ownership_ttl
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.protocol_name.trim().is_empty() {
            return Err(ConfigError("lookup.protocol_name must not be empty".into()));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError("lookup.timeout_ms must be non-zero".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Attempts per session, the first one included.
    pub max_attempts: u32,
    #[serde(rename = "initial_backoff_ms", with = "duration_ms")]
    pub initial_backoff: Duration,
    #[serde(rename = "max_backoff_ms", with = "duration_ms")]
    pub max_backoff: Duration,
    pub forward_mode: ForwardMode,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            forward_mode: ForwardMode::Opaque,
        }
    }
}

impl RoutingConfig {
    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError("routing.max_attempts must be at least 1".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError("routing.connect_timeout_ms must be non-zero".into()));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError(
                "routing.initial_backoff_ms must not exceed routing.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}
