//! mqviz_mqtt: resilient MQTT session with buffered message ingestion.
//!
//! The crate keeps one broker session alive across network trouble and turns
//! the incoming publish stream into bounded, rate-measured history.
//!
//! ## Modules
//!
//! * `session`: [`Session`], the connection state machine. Owns the status,
//!   reconnect scheduling and the subscription registry.
//! * `pipeline`: background worker moving messages from the incoming queue
//!   into history and statistics.
//! * `connection`: [`MqttProtocol`], the `rumqttc` implementation of
//!   [`ProtocolClient`].
//! * `events`: observer lists, the status `watch` channel and the
//!   [`SessionEvent`] broadcast stream.
//! * `config`: validated settings for all of the above.
//!
//! ```ignore
//! use std::sync::Arc;
//! use mqviz_mqtt::{Config, MqttProtocol, Session};
//!
//! let config = Config::default();
//! let protocol = Arc::new(MqttProtocol::new(config.clone())?);
//! let session = Session::new(protocol, config)?;
//!
//! session.on_message(|m| println!("{} -> {}", m.topic, m.payload));
//! session.subscribe_to_topic("sensors/#", 0)?;
//! session.connect("localhost", 1883, None)?;
//! ```

pub mod backoff;
pub mod buffer;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod message;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod state;
pub mod stats;
pub mod topic;

pub use config::{Config, QueueConfig, ReconnectConfig, TlsConfig};
pub use connection::MqttProtocol;
pub use error::SessionError;
pub use events::SessionEvent;
pub use message::Message;
pub use protocol::{Credentials, ProtocolClient, ProtocolHandler};
pub use session::{ConnectionInfo, Session};
pub use state::ConnectionStatus;
pub use stats::StatisticsSnapshot;
pub use topic::{is_valid_topic_filter, validate_topic_filter};

pub type Result<T> = std::result::Result<T, SessionError>;
