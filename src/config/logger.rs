//! Logging configuration structures and validation logic.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Available formats for console log output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

/// Top-level logging configuration.
///
/// Controls the global log level and the output targets (console and/or
/// journald). `RUST_LOG`, when set, overrides `level`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggerConfig {
    /// Global log level or filter directive, e.g. `info` or
    /// `info,mqviz_mqtt=debug`.
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,

    #[validate(nested)]
    pub console: Option<ConsoleConfig>,

    #[validate(nested)]
    pub journald: Option<JournaldConfig>,
}

/// Accepts a plain level or a comma separated directive list whose bare
/// entries are levels.
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid = |l: &str| {
        matches!(
            l.trim().to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error" | "off"
        )
    };

    let ok = !level.trim().is_empty()
        && level.split(',').all(|directive| match directive.split_once('=') {
            Some((target, l)) => !target.trim().is_empty() && valid(l),
            None => valid(directive),
        });

    if ok {
        Ok(())
    } else {
        let mut err = ValidationError::new("invalid_log_level");
        err.message = Some(format!("Invalid log level: {}", level).into());
        Err(err)
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            level: "info".to_string(),
            console: Some(ConsoleConfig::default()),
            journald: None,
        }
    }
}

/// Configuration for console log output.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,

    pub format: LogFormat,

    /// Include the log target (module path) in output.
    pub show_target: bool,

    pub show_thread_ids: bool,

    /// Include span close events in output.
    pub show_spans: bool,

    pub ansi_colors: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        ConsoleConfig {
            enabled: true,
            format: LogFormat::default(),
            show_target: false,
            show_thread_ids: false,
            show_spans: false,
            ansi_colors: true,
        }
    }
}

/// Configuration for systemd journald output (Unix only).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct JournaldConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Identifier used for journal entries. Must be non-empty.
    #[serde(default = "default_identifier")]
    #[validate(length(min = 1))]
    pub identifier: String,
}

fn default_identifier() -> String {
    "mqviz".to_string()
}

impl Default for JournaldConfig {
    fn default() -> Self {
        JournaldConfig {
            enabled: false,
            identifier: default_identifier(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_validation() {
        for ok in ["info", "DEBUG", "warn,mqviz_mqtt=trace", "off"] {
            assert!(validate_log_level(ok).is_ok(), "{ok}");
        }
        for bad in ["", "verbose", "info,=debug", "mqviz=loud"] {
            assert!(validate_log_level(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_parse_format_and_journald() {
        let config: LoggerConfig = toml::from_str(
            r#"
            level = "debug"
            [console]
            format = "json"
            [journald]
            enabled = true
            "#,
        )
        .unwrap();

        assert_eq!(config.console.unwrap().format, LogFormat::Json);
        let journald = config.journald.unwrap();
        assert!(journald.enabled);
        assert_eq!(journald.identifier, "mqviz");
    }

    #[test]
    fn test_empty_identifier_rejected() {
        let config = LoggerConfig {
            journald: Some(JournaldConfig {
                enabled: true,
                identifier: String::new(),
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
