//! mqviz: headless MQTT traffic monitor
//!
//! Loads a TOML configuration, keeps a resilient session to one broker,
//! subscribes to the configured topic filters and periodically reports
//! ingestion statistics. The session itself lives in the `mqviz_mqtt` crate;
//! this crate wires it into a long-running process.
//!
//! ## Modules
//!
//! * `config`: Configuration structures, loading, validation, and defaults.
//!   TOML files validated with the `validator` crate.
//!
//! * `core`: Runtime components:
//!   - Readiness derived from the session status
//!   - Periodic statistics reporter
//!
//! * `logger`: Logging initialization using `tracing`.
//!   Console output in compact, pretty or JSON format and optional systemd
//!   journald integration.

pub mod config;
pub mod core;
pub mod logger;
