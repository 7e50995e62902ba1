use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::protocol::Delivery;

/// A received message as kept in the history buffer.
///
/// Built once by the ingestion worker from a raw [`Delivery`] and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,

    /// Payload decoded as UTF-8; invalid sequences become U+FFFD.
    pub payload: String,

    /// Wall-clock arrival time, seconds since the Unix epoch.
    pub timestamp: f64,

    pub qos: u8,

    pub retain: bool,

    /// Broker packet id, absent for QoS 0.
    pub id: Option<u16>,
}

impl Message {
    /// Decodes a delivery stamped with the given arrival time.
    pub fn from_delivery(delivery: &Delivery, timestamp: f64) -> Self {
        Self {
            topic: delivery.topic.clone(),
            payload: String::from_utf8_lossy(&delivery.payload).into_owned(),
            timestamp,
            qos: delivery.qos,
            retain: delivery.retain,
            id: delivery.pkid,
        }
    }
}

/// Current wall-clock time in fractional seconds since the Unix epoch.
///
/// A clock set before 1970 reads as 0.0 rather than failing.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_delivery_decodes_payload() {
        let delivery = Delivery {
            topic: "sensor/1".into(),
            payload: b"21.5".to_vec(),
            qos: 1,
            retain: true,
            pkid: Some(7),
        };

        let msg = Message::from_delivery(&delivery, 100.0);
        assert_eq!(msg.topic, "sensor/1");
        assert_eq!(msg.payload, "21.5");
        assert_eq!(msg.timestamp, 100.0);
        assert_eq!(msg.qos, 1);
        assert!(msg.retain);
        assert_eq!(msg.id, Some(7));
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let delivery = Delivery {
            topic: "raw".into(),
            payload: vec![0x66, 0xff, 0x6f],
            qos: 0,
            retain: false,
            pkid: None,
        };

        let msg = Message::from_delivery(&delivery, 0.0);
        assert_eq!(msg.payload, "f\u{fffd}o");
        assert_eq!(msg.id, None);
    }

    #[test]
    fn test_now_secs_is_after_2020() {
        assert!(now_secs() > 1_577_836_800.0);
    }
}
