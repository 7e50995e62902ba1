//! Broker target and startup subscriptions.

use mqviz_mqtt::{validate_topic_filter, Credentials};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Where to connect at startup.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_credentials"))]
pub struct BrokerConfig {
    /// Broker hostname or IP address.
    #[validate(length(min = 1, message = "Broker host must not be empty"))]
    pub host: String,

    /// Broker port, usually 1883 (TCP) or 8883 (TLS).
    #[validate(range(min = 1, message = "Broker port must not be 0"))]
    pub port: u16,

    pub username: Option<String>,

    /// Only sent together with `username`.
    pub password: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
        }
    }
}

impl BrokerConfig {
    /// Credentials for the connect request, if a username is configured.
    pub fn credentials(&self) -> Option<Credentials> {
        self.username
            .as_ref()
            .filter(|u| !u.is_empty())
            .map(|u| Credentials::new(u.clone(), self.password.clone()))
    }
}

fn validate_credentials(config: &BrokerConfig) -> Result<(), ValidationError> {
    let has_user = config.username.as_ref().is_some_and(|u| !u.is_empty());
    if config.password.is_some() && !has_user {
        let mut err = ValidationError::new("password_without_username");
        err.message = Some("A broker password requires a username".into());
        return Err(err);
    }
    Ok(())
}

/// One topic filter subscribed at startup.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SubscriptionConfig {
    #[validate(custom(function = "validate_topic"))]
    pub topic: String,

    #[serde(default)]
    #[validate(range(max = 2, message = "QoS must be 0, 1, or 2"))]
    pub qos: u8,
}

fn validate_topic(topic: &str) -> Result<(), ValidationError> {
    validate_topic_filter(topic).map_err(|e| {
        let mut err = ValidationError::new("invalid_topic_filter");
        err.message = Some(e.to_string().into());
        err
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_need_username() {
        let mut broker = BrokerConfig::default();
        assert_eq!(broker.credentials(), None);

        broker.password = Some("pw".into());
        assert!(broker.validate().is_err());

        broker.username = Some("user".into());
        assert!(broker.validate().is_ok());
        assert_eq!(
            broker.credentials(),
            Some(Credentials::new("user", Some("pw".to_string())))
        );
    }

    #[test]
    fn test_zero_port_rejected() {
        let broker = BrokerConfig {
            port: 0,
            ..Default::default()
        };
        assert!(broker.validate().is_err());
    }

    #[test]
    fn test_subscription_validation() {
        let ok = SubscriptionConfig {
            topic: "sensor/+/data".into(),
            qos: 2,
        };
        assert!(ok.validate().is_ok());

        let bad_qos = SubscriptionConfig {
            topic: "a".into(),
            qos: 3,
        };
        assert!(bad_qos.validate().is_err());

        let bad_topic = SubscriptionConfig {
            topic: "a+/b".into(),
            qos: 0,
        };
        let errors = bad_topic.validate().unwrap_err().to_string();
        assert!(errors.contains("'+' must occupy an entire level"));
    }
}
