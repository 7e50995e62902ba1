//! Bookkeeping for topic subscriptions.
//!
//! A topic filter lives in exactly one of two maps:
//!
//! * **active**: the protocol client accepted a subscribe for it on the
//!   current (or last) broker session
//! * **pending**: requested while offline, to be subscribed on the next
//!   successful CONNACK
//!
//! The registry never talks to the network. The session decides when entries
//! move and keeps the registry under its connection lock.

use std::collections::BTreeMap;

/// Active and pending subscriptions with their requested QoS.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegistry {
    active: BTreeMap<String, u8>,
    pending: BTreeMap<String, u8>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an offline subscribe request.
    ///
    /// Returns `false` without changes when the topic is already pending or
    /// active.
    pub fn queue_pending(&mut self, topic: &str, qos: u8) -> bool {
        if self.active.contains_key(topic) || self.pending.contains_key(topic) {
            return false;
        }
        self.pending.insert(topic.to_string(), qos);
        true
    }

    /// Records an accepted subscribe. Replaces any previous QoS for the topic.
    pub fn mark_active(&mut self, topic: &str, qos: u8) {
        self.pending.remove(topic);
        self.active.insert(topic.to_string(), qos);
    }

    /// Moves an active topic back to pending, e.g. when resubscribing failed.
    pub fn demote(&mut self, topic: &str) -> bool {
        match self.active.remove(topic) {
            Some(qos) => {
                self.pending.insert(topic.to_string(), qos);
                true
            }
            None => false,
        }
    }

    pub fn remove_active(&mut self, topic: &str) -> Option<u8> {
        self.active.remove(topic)
    }

    pub fn is_active(&self, topic: &str) -> bool {
        self.active.contains_key(topic)
    }

    pub fn is_pending(&self, topic: &str) -> bool {
        self.pending.contains_key(topic)
    }

    /// Active topics with their QoS, sorted by topic.
    pub fn active(&self) -> BTreeMap<String, u8> {
        self.active.clone()
    }

    pub fn active_topics(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }

    pub fn pending_topics(&self) -> Vec<String> {
        self.pending.keys().cloned().collect()
    }

    pub fn active_entries(&self) -> Vec<(String, u8)> {
        self.active.iter().map(|(t, q)| (t.clone(), *q)).collect()
    }

    pub fn pending_entries(&self) -> Vec<(String, u8)> {
        self.pending.iter().map(|(t, q)| (t.clone(), *q)).collect()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_pending_is_idempotent() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.queue_pending("a/#", 1));
        assert!(!registry.queue_pending("a/#", 2));
        assert_eq!(registry.pending_entries(), vec![("a/#".to_string(), 1)]);
    }

    #[test]
    fn test_mark_active_moves_out_of_pending() {
        let mut registry = SubscriptionRegistry::new();
        registry.queue_pending("sensor/+/data", 0);
        registry.mark_active("sensor/+/data", 0);

        assert!(registry.is_active("sensor/+/data"));
        assert!(!registry.is_pending("sensor/+/data"));
        assert!(registry.pending_topics().is_empty());
    }

    #[test]
    fn test_active_topic_is_not_queued() {
        let mut registry = SubscriptionRegistry::new();
        registry.mark_active("x", 1);
        assert!(!registry.queue_pending("x", 1));
        assert!(!registry.is_pending("x"));
    }

    #[test]
    fn test_demote_and_remove() {
        let mut registry = SubscriptionRegistry::new();
        registry.mark_active("x", 2);
        assert!(registry.demote("x"));
        assert!(registry.is_pending("x"));
        assert!(!registry.is_active("x"));
        assert!(!registry.demote("x"));

        registry.mark_active("x", 2);
        assert_eq!(registry.remove_active("x"), Some(2));
        assert_eq!(registry.active_len(), 0);
        assert_eq!(registry.pending_len(), 0);
    }

    #[test]
    fn test_mark_active_replaces_qos() {
        let mut registry = SubscriptionRegistry::new();
        registry.mark_active("x", 0);
        registry.mark_active("x", 2);
        assert_eq!(registry.active().get("x"), Some(&2));
    }
}
