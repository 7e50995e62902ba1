//! Topic filter validation and QoS parsing.
//!
//! The session itself does not validate topics; callers at the boundary
//! (configuration loading, UI input) run filters through
//! [`validate_topic_filter`] before subscribing.

use rumqttc::QoS;

use super::error::SessionError;

const FORBIDDEN_CHARS: [char; 4] = ['\0', '\t', '\n', '\r'];

/// Checks an MQTT topic filter.
///
/// A filter is valid when it is non-blank, contains no NUL/TAB/CR/LF,
/// every `/`-separated level holding `+` or `#` is exactly that wildcard,
/// and `#` only appears as the last level.
///
/// ```ignore
/// assert!(validate_topic_filter("sensor/+/data").is_ok());
/// assert!(validate_topic_filter("home/#").is_ok());
/// assert!(validate_topic_filter("sensor/#/data").is_err());
/// ```
pub fn validate_topic_filter(topic: &str) -> Result<(), SessionError> {
    let invalid = |reason: &str| SessionError::InvalidTopic {
        topic: topic.to_string(),
        reason: reason.to_string(),
    };

    if topic.trim().is_empty() {
        return Err(invalid("topic must not be empty"));
    }

    if topic.contains(FORBIDDEN_CHARS) {
        return Err(invalid("topic contains control characters"));
    }

    let levels: Vec<&str> = topic.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        if level.contains('+') && *level != "+" {
            return Err(invalid("'+' must occupy an entire level"));
        }
        if level.contains('#') {
            if *level != "#" {
                return Err(invalid("'#' must occupy an entire level"));
            }
            if index != levels.len() - 1 {
                return Err(invalid("'#' is only allowed as the last level"));
            }
        }
    }

    Ok(())
}

/// Boolean form of [`validate_topic_filter`].
pub fn is_valid_topic_filter(topic: &str) -> bool {
    validate_topic_filter(topic).is_ok()
}

/// Converts a numeric QoS into the protocol client's representation.
pub fn qos_from_u8(qos: u8) -> Result<QoS, SessionError> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(SessionError::InvalidQos(other)),
    }
}

pub fn qos_to_u8(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}
