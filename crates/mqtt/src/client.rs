//! rumqttc client construction with TLS support.
//!
//! `ClientBuilder` turns a validated [`Config`] plus a per-connect
//! [`ConnectRequest`] into an `AsyncClient`/`EventLoop` pair. A fresh pair is
//! built for every connect attempt, so the broker address and credentials can
//! change between attempts without rebuilding the session.
//!
//! ```ignore
//! let (client, event_loop) = ClientBuilder::new("viewer", "localhost", 1883, 64)
//!     .keep_alive(Duration::from_secs(30))
//!     .credentials("user", "secret")
//!     .build()?;
//! ```

use std::{fs, time::Duration};

use rumqttc::{AsyncClient, EventLoop, MqttOptions, NetworkOptions, TlsConfiguration, Transport};

use super::{
    config::{Config, TlsConfig},
    error::SessionError,
    protocol::ConnectRequest,
};

/// Fluent builder for an `AsyncClient` and its `EventLoop`.
///
/// The `AsyncClient` is cheap to clone and thread-safe. The `EventLoop` must
/// be polled by exactly one task.
pub struct ClientBuilder {
    opts: MqttOptions,

    /// Capacity of the client's outgoing request channel.
    cap: usize,

    /// TCP + CONNACK timeout in seconds, applied to the event loop.
    connection_timeout: u64,

    /// Certificate paths, loaded at `build()` time.
    tls_config: Option<TlsConfig>,
}

impl ClientBuilder {
    pub fn new(
        client_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        cap: usize,
    ) -> Self {
        Self {
            opts: MqttOptions::new(client_id, host, port),
            cap,
            connection_timeout: 5,
            tls_config: None,
        }
    }

    /// Applies session configuration to a single connect request.
    pub fn from_request(request: &ConnectRequest, config: &Config) -> Self {
        let mut builder = Self::new(
            request.client_id.clone(),
            request.host.clone(),
            request.port,
            config.request_channel_capacity,
        )
        .keep_alive(request.keep_alive)
        .clean_session(config.clean_session)
        .max_inflight(config.max_inflight)
        .max_packet_size(config.max_packet_size, config.max_packet_size)
        .connection_timeout(config.connection_timeout);

        if let Some(creds) = &request.credentials {
            builder = builder.credentials(
                creds.username.clone(),
                creds.password.clone().unwrap_or_default(),
            );
        }

        if let Some(tls) = config.tls.as_ref().filter(|tls| tls.is_enabled()) {
            builder.tls_config = Some(tls.clone());
        }

        builder
    }

    pub fn keep_alive(mut self, interval: Duration) -> Self {
        self.opts.set_keep_alive(interval);
        self
    }

    pub fn max_packet_size(mut self, incoming: usize, outgoing: usize) -> Self {
        self.opts.set_max_packet_size(incoming, outgoing);
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.opts.set_clean_session(clean);
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.opts.set_credentials(username, password);
        self
    }

    pub fn max_inflight(mut self, max: u16) -> Self {
        self.opts.set_inflight(max);
        self
    }

    pub fn connection_timeout(mut self, secs: u64) -> Self {
        self.connection_timeout = secs;
        self
    }

    fn load_file(path: &str) -> Result<Vec<u8>, SessionError> {
        Ok(fs::read(path)?)
    }

    fn build_tls_transport(tls_config: &TlsConfig) -> Result<Transport, SessionError> {
        let ca_path = tls_config
            .ca_cert_path
            .as_deref()
            .ok_or_else(|| SessionError::ClientSetup("CA certificate path is required".into()))?;
        let ca = Self::load_file(ca_path)?;

        let client_auth = match (
            tls_config.client_cert_path.as_deref(),
            tls_config.client_key_path.as_deref(),
        ) {
            (Some(cert), Some(key)) => Some((Self::load_file(cert)?, Self::load_file(key)?)),
            (None, None) => None,
            _ => {
                return Err(SessionError::ClientSetup(
                    "Both client certificate and key must be provided or neither".into(),
                ))
            }
        };

        Ok(Transport::Tls(TlsConfiguration::Simple {
            ca,
            client_auth,
            alpn: None,
        }))
    }

    /// Loads TLS material (if any) and creates the client pair.
    pub fn build(self) -> Result<(AsyncClient, EventLoop), SessionError> {
        let mut opts = self.opts;

        if let Some(tls) = &self.tls_config {
            opts.set_transport(Self::build_tls_transport(tls)?);
        }

        let (client, mut event_loop) = AsyncClient::new(opts, self.cap);

        let mut network = NetworkOptions::new();
        network.set_connection_timeout(self.connection_timeout);
        event_loop.set_network_options(network);

        Ok((client, event_loop))
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Write};

    use tempfile::TempDir;

    use super::*;
    use crate::protocol::Credentials;

    struct TestFiles {
        _temp_dir: TempDir,
        ca_cert: String,
        client_cert: String,
        client_key: String,
    }

    impl TestFiles {
        fn new() -> std::io::Result<Self> {
            let temp_dir = TempDir::new()?;

            let ca_cert = temp_dir.path().join("ca.crt");
            let client_cert = temp_dir.path().join("client.crt");
            let client_key = temp_dir.path().join("client.key");

            File::create(&ca_cert)?.write_all(b"ca certificate content")?;
            File::create(&client_cert)?.write_all(b"client certificate content")?;
            File::create(&client_key)?.write_all(b"client key content")?;

            Ok(TestFiles {
                _temp_dir: temp_dir,
                ca_cert: ca_cert.to_string_lossy().into_owned(),
                client_cert: client_cert.to_string_lossy().into_owned(),
                client_key: client_key.to_string_lossy().into_owned(),
            })
        }
    }

    fn request() -> ConnectRequest {
        ConnectRequest {
            host: "localhost".into(),
            port: 1883,
            keep_alive: Duration::from_secs(30),
            credentials: Some(Credentials::new("user", None)),
            client_id: "test_client".into(),
        }
    }

    #[test]
    fn test_builder_from_request() {
        let builder = ClientBuilder::from_request(&request(), &Config::default());
        assert_eq!(builder.cap, Config::default().request_channel_capacity);
        assert!(builder.tls_config.is_none());
        assert_eq!(builder.opts.keep_alive(), Duration::from_secs(30));
        assert_eq!(builder.opts.client_id(), "test_client");
        assert_eq!(builder.connection_timeout, 30);
    }

    #[test]
    fn test_build_tcp_client() {
        let result = ClientBuilder::new("test_client", "localhost", 1883, 10).build();
        assert!(result.is_ok());
    }

    fn tls_builder(tls: TlsConfig) -> ClientBuilder {
        let config = Config {
            tls: Some(tls),
            ..Default::default()
        };
        ClientBuilder::from_request(&request(), &config)
    }

    #[test]
    fn test_build_with_tls_files() {
        let files = TestFiles::new().expect("Failed to create test files");

        let builder = tls_builder(TlsConfig::new(
            &files.ca_cert,
            &files.client_cert,
            &files.client_key,
        ));
        assert!(builder.tls_config.is_some());
        assert!(builder.build().is_ok());
    }

    #[test]
    fn test_build_with_ca_only() {
        let files = TestFiles::new().expect("Failed to create test files");

        let builder = tls_builder(TlsConfig::with_ca_only(&files.ca_cert));
        assert!(builder.tls_config.is_some());
        assert!(builder.build().is_ok());
    }

    #[test]
    fn test_build_with_missing_ca_fails() {
        let result = tls_builder(TlsConfig::with_ca_only("/nonexistent/ca.crt")).build();
        assert!(matches!(result, Err(SessionError::Io(_))));
    }
}
