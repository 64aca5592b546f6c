use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::Credentials;
use crate::backoff::{BackoffStrategy, ReconnectPolicy};
use crate::error::ConfigError;
use crate::heartbeat::HeartbeatConfig;
use crate::queue::{BatchWindow, QueueConfig};

// =============================================================================
// File config (figment-deserialized from defaults / courier.toml / env vars)
// =============================================================================
//
//   courier.toml:    url = "wss://chat.example.com/ws"
//                    [heartbeat]
//                    timeout_ms = 60000
//
//   env var:         COURIER_HEARTBEAT__TIMEOUT_MS=60000   (double underscore = nesting)

/// Top-level tunables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportFileConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Reconnection attempts after an unexpected close.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Report unrecognized message types on the `error` stream.
    #[serde(default)]
    pub strict_types: bool,
    #[serde(default)]
    pub backoff: BackoffFileConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatFileConfig,
    #[serde(default)]
    pub queue: QueueFileConfig,
    #[serde(default)]
    pub auth: Option<AuthFileConfig>,
}

impl TransportFileConfig {
    /// Extract the layered file config without validating it.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        load_config(config_file)
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }
}

impl Default for TransportFileConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_retries: default_max_retries(),
            strict_types: false,
            backoff: BackoffFileConfig::default(),
            heartbeat: HeartbeatFileConfig::default(),
            queue: QueueFileConfig::default(),
            auth: None,
        }
    }
}

/// Reconnect backoff (lives under `[backoff]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackoffFileConfig {
    #[serde(default)]
    pub strategy: BackoffStrategy,
    #[serde(default = "default_backoff_factor")]
    pub factor: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for BackoffFileConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Liveness tunables (lives under `[heartbeat]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatFileConfig {
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_missed")]
    pub max_missed: u32,
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
}

impl Default for HeartbeatFileConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_heartbeat_timeout_ms(),
            max_missed: default_max_missed(),
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

/// Outbound queue tunables (lives under `[queue]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueFileConfig {
    /// Raw-send retries per message before it fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Batch by default. Absent means every message goes out on its own.
    #[serde(default)]
    pub batch: Option<BatchFileConfig>,
}

impl Default for QueueFileConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_interval_ms: default_retry_interval_ms(),
            drain_interval_ms: default_drain_interval_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            batch: None,
        }
    }
}

/// Default batch window (lives under `[queue.batch]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchFileConfig {
    #[serde(default = "default_batch_max_size")]
    pub max_size: usize,
    #[serde(default = "default_batch_timeout_ms")]
    pub timeout_ms: u64,
}

/// Credentials sent right after the socket opens (lives under `[auth]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthFileConfig {
    pub token: String,
    pub user_id: String,
    /// Give up on an unanswered handshake after this long.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_reconnect_interval_ms() -> u64 {
    5000
}
fn default_heartbeat_interval_ms() -> u64 {
    30_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_heartbeat_timeout_ms() -> u64 {
    90_000
}
fn default_max_missed() -> u32 {
    3
}
fn default_check_interval_ms() -> u64 {
    1000
}
fn default_retry_interval_ms() -> u64 {
    1000
}
fn default_drain_interval_ms() -> u64 {
    1000
}
fn default_ack_timeout_ms() -> u64 {
    30_000
}
fn default_batch_max_size() -> usize {
    10
}
fn default_batch_timeout_ms() -> u64 {
    5000
}

/// Build a figment that layers: defaults → TOML file → COURIER_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `COURIER_URL=ws://localhost:8080/ws`  →  `url = "ws://localhost:8080/ws"`
///   `COURIER_QUEUE__ACK_TIMEOUT_MS=5000`  →  `queue.ack_timeout_ms = 5000`
pub fn load_config(config_file: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(TransportFileConfig::default()));
    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("COURIER_").split("__"))
}

// =============================================================================
// Runtime config (validated, durations instead of milliseconds)
// =============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct AuthConfig {
    pub credentials: Credentials,
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransportConfig {
    pub url: String,
    pub reconnect: ReconnectPolicy,
    /// Reconnection attempts after an unexpected close.
    pub max_retries: u32,
    pub heartbeat: HeartbeatConfig,
    pub queue: QueueConfig,
    /// Period of the background drain.
    pub drain_interval: Duration,
    /// `None` skips the handshake.
    pub auth: Option<AuthConfig>,
    pub strict_types: bool,
}

impl TransportConfig {
    /// Defaults for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectPolicy::fixed(Duration::from_millis(
                default_reconnect_interval_ms(),
            )),
            max_retries: default_max_retries(),
            heartbeat: HeartbeatConfig::default(),
            queue: QueueConfig::default(),
            drain_interval: Duration::from_millis(default_drain_interval_ms()),
            auth: None,
            strict_types: false,
        }
    }

    pub fn with_auth(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.auth = Some(AuthConfig {
            credentials: Credentials {
                token: token.into(),
                user_id: user_id.into(),
            },
            timeout: None,
        });
        self
    }

    /// Resolve defaults, `config_file` and the environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::from_file(&TransportFileConfig::load(config_file)?)
    }

    pub fn from_file(fc: &TransportFileConfig) -> Result<Self, ConfigError> {
        let ms = Duration::from_millis;

        let reconnect_interval = ms(fc.reconnect_interval_ms);
        let reconnect = match fc.backoff.strategy {
            BackoffStrategy::Fixed => ReconnectPolicy::fixed(reconnect_interval),
            BackoffStrategy::Exponential => {
                if fc.backoff.factor < 1.0 || !fc.backoff.factor.is_finite() {
                    return Err(ConfigError::invalid(
                        "backoff.factor",
                        "must be a finite number >= 1",
                    ));
                }
                ReconnectPolicy::exponential(
                    reconnect_interval,
                    fc.backoff.factor,
                    ms(fc.backoff.max_delay_ms),
                )
            }
        };

        let batch = match &fc.queue.batch {
            Some(batch) if batch.max_size == 0 => {
                return Err(ConfigError::invalid(
                    "queue.batch.max_size",
                    "must be at least 1",
                ));
            }
            Some(batch) => Some(BatchWindow {
                max_size: batch.max_size,
                timeout: ms(batch.timeout_ms),
            }),
            None => None,
        };

        let config = Self {
            url: fc.url.clone(),
            reconnect,
            max_retries: fc.max_retries,
            heartbeat: HeartbeatConfig {
                interval: ms(fc.heartbeat_interval_ms),
                timeout: ms(fc.heartbeat.timeout_ms),
                max_missed: fc.heartbeat.max_missed,
                check_interval: ms(fc.heartbeat.check_interval_ms),
            },
            queue: QueueConfig {
                max_retries: fc.queue.max_retries,
                retry_interval: ms(fc.queue.retry_interval_ms),
                ack_timeout: ms(fc.queue.ack_timeout_ms),
                batch,
            },
            drain_interval: ms(fc.queue.drain_interval_ms),
            auth: fc.auth.as_ref().map(|a| AuthConfig {
                credentials: Credentials {
                    token: a.token.clone(),
                    user_id: a.user_id.clone(),
                },
                timeout: a.timeout_ms.map(ms),
            }),
            strict_types: fc.strict_types,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::invalid("url", "is required"));
        }
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ConfigError::invalid(
                "url",
                format!("`{}` is not a ws:// or wss:// URL", self.url),
            ));
        }

        let positive = [
            ("heartbeat_interval_ms", self.heartbeat.interval),
            ("heartbeat.timeout_ms", self.heartbeat.timeout),
            ("heartbeat.check_interval_ms", self.heartbeat.check_interval),
            ("queue.drain_interval_ms", self.drain_interval),
        ];
        for (field, value) in positive {
            if value.is_zero() {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }
        if self.heartbeat.max_missed == 0 {
            return Err(ConfigError::invalid(
                "heartbeat.max_missed",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_match_documented_values() {
        let config = TransportConfig::new("ws://localhost/ws");
        assert_eq!(config.reconnect.delay(1), Duration::from_millis(5000));
        assert_eq!(config.heartbeat.interval, Duration::from_millis(30_000));
        assert_eq!(config.heartbeat.timeout, Duration::from_millis(90_000));
        assert_eq!(config.heartbeat.max_missed, 3);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.queue.ack_timeout, Duration::from_millis(30_000));
        assert!(config.queue.batch.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_defaults_agree_with_runtime_defaults() {
        let mut file = TransportFileConfig::default();
        file.url = "ws://localhost/ws".into();
        let config = TransportConfig::from_file(&file).unwrap();
        assert_eq!(config, TransportConfig::new("ws://localhost/ws"));
    }

    #[test]
    fn toml_and_env_layer_over_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "courier.toml",
                r#"
                url = "ws://from-file/ws"
                max_retries = 5
                strict_types = true

                [backoff]
                strategy = "exponential"

                [queue.batch]
                max_size = 4

                [auth]
                token = "t0k3n"
                user_id = "ada"
                timeout_ms = 10000
                "#,
            )?;
            jail.set_env("COURIER_URL", "wss://from-env/ws");
            jail.set_env("COURIER_HEARTBEAT__TIMEOUT_MS", "60000");

            let config = TransportConfig::load(Some(Path::new("courier.toml")))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.url, "wss://from-env/ws");
            assert_eq!(config.max_retries, 5);
            assert!(config.strict_types);
            assert_eq!(config.heartbeat.timeout, Duration::from_millis(60_000));
            assert_eq!(config.reconnect.delay(2), Duration::from_millis(10_000));
            assert_eq!(
                config.queue.batch,
                Some(BatchWindow {
                    max_size: 4,
                    timeout: Duration::from_millis(5000),
                })
            );
            let auth = config.auth.expect("auth section");
            assert_eq!(auth.credentials.user_id, "ada");
            assert_eq!(auth.timeout, Some(Duration::from_secs(10)));
            Ok(())
        });
    }

    #[test]
    fn missing_url_is_rejected() {
        Jail::expect_with(|_jail| {
            let err = TransportConfig::load(None).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { field: "url", .. }));
            Ok(())
        });
    }

    #[test]
    fn non_websocket_url_is_rejected() {
        let config = TransportConfig::new("http://localhost");
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let mut file = TransportFileConfig::default();
        file.url = "ws://localhost/ws".into();
        file.heartbeat.check_interval_ms = 0;
        let err = TransportConfig::from_file(&file).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "heartbeat.check_interval_ms",
                ..
            }
        ));
    }

    #[test]
    fn empty_batch_is_rejected() {
        let mut file = TransportFileConfig::default();
        file.url = "ws://localhost/ws".into();
        file.queue.batch = Some(BatchFileConfig {
            max_size: 0,
            timeout_ms: 100,
        });
        assert!(TransportConfig::from_file(&file).is_err());
    }
}
