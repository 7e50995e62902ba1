//! Configuration for the broker session and its ingestion pipeline.
//!
//! All types deserialize with serde and carry `validator` constraints, so a
//! bad value fails when the configuration is loaded rather than on the first
//! connect. Every section has full defaults; an empty TOML table is a valid
//! configuration.
//!
//! ```ignore
//! let config: Config = toml::from_str(r#"
//!     keep_alive = 30
//!
//!     [reconnect]
//!     max_delay = 120
//!
//!     [queue]
//!     max_history = 5000
//! "#)?;
//! config.validate()?;
//! ```
//!
//! The broker address and credentials are deliberately not part of this
//! struct: they are arguments of [`Session::connect`](crate::Session::connect)
//! so one session can be pointed at different brokers over its lifetime.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Session-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// MQTT client identifier.
    ///
    /// An empty string asks for a generated `mqviz_<uuid>` identifier. The
    /// identifier is fixed when the session is built and reused across
    /// reconnects, so a persistent broker session survives a dropped link.
    ///
    /// # Validation
    /// - Length: 0-64 characters
    #[validate(length(max = 64, message = "Client ID must not exceed 64 characters"))]
    pub client_id: String,

    /// Keep-alive interval in seconds.
    ///
    /// The client pings the broker when the link is otherwise idle. A dead
    /// link is detected after roughly 1.5x this interval.
    ///
    /// # Validation
    /// - Range: 5-3600 seconds
    #[validate(range(
        min = 5,
        max = 3600,
        message = "Keep alive must be between 5 and 3600 seconds"
    ))]
    pub keep_alive: u64,

    /// Whether to request a clean session from the broker.
    pub clean_session: bool,

    /// Maximum number of QoS 1/2 packets in flight.
    #[validate(range(
        min = 1,
        max = 1000,
        message = "Max inflight must be between 1 and 1000"
    ))]
    pub max_inflight: u16,

    /// Capacity of the protocol client's outgoing request channel.
    ///
    /// Subscribe and unsubscribe requests are handed over without waiting; a
    /// full channel turns into an immediate `NetworkFailure`.
    #[validate(range(
        min = 1,
        max = 1024,
        message = "Request channel capacity must be between 1 and 1024"
    ))]
    pub request_channel_capacity: usize,

    /// Largest incoming and outgoing packet in bytes.
    #[validate(range(
        min = 64,
        max = 268_435_455,
        message = "Max packet size must be between 64 bytes and 256 MiB"
    ))]
    pub max_packet_size: usize,

    /// TCP + CONNACK timeout in seconds.
    #[validate(range(
        min = 1,
        max = 300,
        message = "Connection timeout must be between 1 and 300 seconds"
    ))]
    pub connection_timeout: u64,

    /// TLS settings. `None` connects over plain TCP.
    #[validate(nested)]
    pub tls: Option<TlsConfig>,

    #[validate(nested)]
    pub reconnect: ReconnectConfig,

    #[validate(nested)]
    pub queue: QueueConfig,

    /// Buffer size of the broadcast event stream.
    ///
    /// A subscriber that falls further behind than this loses the oldest
    /// events and observes a `Lagged` error.
    #[validate(range(
        min = 1,
        max = 65_536,
        message = "Event channel capacity must be between 1 and 65536"
    ))]
    pub event_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            client_id: String::new(),
            keep_alive: 60,
            clean_session: true,
            max_inflight: 100,
            request_channel_capacity: 64,
            max_packet_size: 10 * 1024 * 1024,
            connection_timeout: 30,
            tls: None,
            reconnect: ReconnectConfig::default(),
            queue: QueueConfig::default(),
            event_channel_capacity: 1024,
        }
    }
}

impl Config {
    /// The configured client id, or a freshly generated one when empty.
    pub fn resolve_client_id(&self) -> String {
        let trimmed = self.client_id.trim();
        if trimmed.is_empty() {
            format!("mqviz_{}", Uuid::new_v4().simple())
        } else {
            trimmed.to_string()
        }
    }

    pub fn keep_alive_duration(&self) -> Duration {
        Duration::from_secs(self.keep_alive)
    }
}

/// Automatic reconnection policy.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reconnect after a failed connect or a lost session.
    pub auto: bool,

    /// Delay before the first reconnect attempt, in seconds.
    #[validate(range(
        min = 1,
        max = 3600,
        message = "Base reconnect delay must be between 1 and 3600 seconds"
    ))]
    pub base_delay: u64,

    /// Upper bound for any reconnect delay, in seconds.
    #[validate(range(
        min = 1,
        max = 86_400,
        message = "Max reconnect delay must be between 1 and 86400 seconds"
    ))]
    pub max_delay: u64,

    /// Give up after this many consecutive attempts. `0` retries forever.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            auto: true,
            base_delay: 1,
            max_delay: 60,
            max_attempts: 0,
        }
    }
}

/// Ingestion pipeline sizing.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct QueueConfig {
    /// Capacity of the incoming queue between the network task and the worker.
    #[validate(range(
        min = 1,
        max = 1_000_000,
        message = "Queue size must be between 1 and 1000000"
    ))]
    pub max_queue_size: usize,

    /// Number of processed messages kept for `get_recent_messages`.
    #[validate(range(
        min = 1,
        max = 1_000_000,
        message = "History size must be between 1 and 1000000"
    ))]
    pub max_history: usize,

    /// Sliding window for the message rate, in seconds.
    #[validate(range(
        min = 1,
        max = 3600,
        message = "Rate window must be between 1 and 3600 seconds"
    ))]
    pub rate_window: u64,

    /// How long the worker waits for a message before re-checking shutdown.
    #[validate(range(
        min = 10,
        max = 10_000,
        message = "Poll interval must be between 10 and 10000 ms"
    ))]
    pub poll_interval_ms: u64,

    /// Bound on waiting for the worker to exit during disconnect.
    #[validate(range(
        min = 10,
        max = 60_000,
        message = "Shutdown timeout must be between 10 and 60000 ms"
    ))]
    pub shutdown_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            max_history: 1_000,
            rate_window: 60,
            poll_interval_ms: 500,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// TLS material for an encrypted broker link.
///
/// The CA certificate is mandatory once TLS is configured. Client certificate
/// and key enable mutual TLS and must be given together.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_tls_pairing"))]
pub struct TlsConfig {
    #[validate(custom(
        function = "validate_file_path",
        message = "CA certificate file does not exist"
    ))]
    pub ca_cert_path: Option<String>,

    #[validate(custom(
        function = "validate_file_path",
        message = "Client certificate file does not exist"
    ))]
    pub client_cert_path: Option<String>,

    #[validate(custom(
        function = "validate_file_path",
        message = "Client key file does not exist"
    ))]
    pub client_key_path: Option<String>,
}

impl TlsConfig {
    pub fn new(
        ca_cert_path: impl Into<String>,
        client_cert_path: impl Into<String>,
        client_key_path: impl Into<String>,
    ) -> Self {
        TlsConfig {
            ca_cert_path: Some(ca_cert_path.into()),
            client_cert_path: Some(client_cert_path.into()),
            client_key_path: Some(client_key_path.into()),
        }
    }

    pub fn with_ca_only(ca_cert_path: impl Into<String>) -> Self {
        TlsConfig {
            ca_cert_path: Some(ca_cert_path.into()),
            client_cert_path: None,
            client_key_path: None,
        }
    }

    pub fn has_client_auth(&self) -> bool {
        self.client_cert_path.is_some() && self.client_key_path.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.ca_cert_path.is_some()
    }
}

fn validate_tls_pairing(tls: &TlsConfig) -> Result<(), ValidationError> {
    if tls.ca_cert_path.is_none() {
        return Err(ValidationError::new("missing_ca_cert")
            .with_message("CA certificate path is required".into()));
    }

    if tls.client_cert_path.is_some() != tls.client_key_path.is_some() {
        return Err(ValidationError::new("incomplete_client_auth").with_message(
            "Both client certificate and key must be provided or neither".into(),
        ));
    }

    Ok(())
}

fn validate_file_path(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(
            ValidationError::new("empty_path").with_message("File path cannot be empty".into())
        );
    }

    let path_obj = Path::new(path);

    if !path_obj.exists() {
        return Err(ValidationError::new("file_not_found")
            .with_message(format!("File does not exist: {path}").into()));
    }

    if !path_obj.is_file() {
        return Err(ValidationError::new("not_a_file")
            .with_message(format!("Path is not a file: {path}").into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.max_queue_size, 10_000);
        assert_eq!(config.queue.max_history, 1_000);
        assert_eq!(config.queue.rate_window, 60);
        assert_eq!(config.reconnect.base_delay, 1);
        assert_eq!(config.reconnect.max_delay, 60);
        assert!(config.reconnect.auto);
    }

    #[test]
    fn test_resolve_client_id() {
        let mut config = Config::default();
        let generated = config.resolve_client_id();
        assert!(generated.starts_with("mqviz_"));
        assert_ne!(generated, config.resolve_client_id());

        config.client_id = "dashboard-1".into();
        assert_eq!(config.resolve_client_id(), "dashboard-1");
    }

    #[test]
    fn test_keep_alive_out_of_range() {
        let config = Config {
            keep_alive: 1,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("keep_alive"));
    }

    #[test]
    fn test_nested_queue_validation() {
        let mut config = Config::default();
        config.queue.max_queue_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tls_missing_file() {
        let mut config = Config::default();
        config.tls = Some(TlsConfig::with_ca_only("/nonexistent/ca.crt"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tls_ca_only_valid() {
        let mut ca = NamedTempFile::new().unwrap();
        writeln!(ca, "-----BEGIN CERTIFICATE-----").unwrap();

        let tls = TlsConfig::with_ca_only(ca.path().to_string_lossy());
        assert!(tls.is_enabled());
        assert!(!tls.has_client_auth());
        assert!(tls.validate().is_ok());
    }

    #[test]
    fn test_tls_incomplete_client_auth() {
        let ca = NamedTempFile::new().unwrap();
        let cert = NamedTempFile::new().unwrap();

        let tls = TlsConfig {
            ca_cert_path: Some(ca.path().to_string_lossy().into_owned()),
            client_cert_path: Some(cert.path().to_string_lossy().into_owned()),
            client_key_path: None,
        };
        assert!(tls.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            keep_alive = 30

            [reconnect]
            max_delay = 120
            "#,
        )
        .unwrap();

        assert_eq!(config.keep_alive, 30);
        assert_eq!(config.reconnect.max_delay, 120);
        assert_eq!(config.reconnect.base_delay, 1);
        assert_eq!(config.queue.poll_interval(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }
}
