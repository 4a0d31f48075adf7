//! Per-connection subscription tracking.
//!
//! Every session a WebSocket client subscribes to delivers into the same
//! per-connection queue under one [`SubscriberId`]. The manager remembers
//! which sessions that is, so a disconnect can unsubscribe from all of them.

use std::collections::HashSet;

use crate::domain::{SessionKey, SubscriberId};

/// Sessions a single WebSocket connection is subscribed to.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    id: SubscriberId,
    sessions: HashSet<SessionKey>,
}

impl SubscriptionManager {
    /// Creates an empty manager with a fresh subscriber id.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscriber id this connection uses in every session.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Records a subscription. Returns `false` if it was already recorded.
    pub fn subscribe(&mut self, key: SessionKey) -> bool {
        self.sessions.insert(key)
    }

    /// Forgets a subscription. Returns `false` if there was none.
    pub fn unsubscribe(&mut self, key: &SessionKey) -> bool {
        self.sessions.remove(key)
    }

    /// Number of subscribed sessions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Removes and returns every subscription.
    pub fn drain(&mut self) -> Vec<SessionKey> {
        self.sessions.drain().collect()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn key(s: &str) -> SessionKey {
        let Ok(key) = SessionKey::new(s) else {
            panic!("valid key");
        };
        key
    }

    #[test]
    fn empty_has_no_subscriptions() {
        let mut mgr = SubscriptionManager::new();
        assert_eq!(mgr.count(), 0);
        assert!(mgr.drain().is_empty());
    }

    #[test]
    fn subscribe_is_idempotent() {
        let mut mgr = SubscriptionManager::new();
        assert!(mgr.subscribe(key("nb1")));
        assert!(!mgr.subscribe(key("nb1")));
        assert_eq!(mgr.count(), 1);
    }

    #[test]
    fn unsubscribe_removes_session() {
        let mut mgr = SubscriptionManager::new();
        mgr.subscribe(key("nb1"));
        assert!(mgr.unsubscribe(&key("nb1")));
        assert!(!mgr.unsubscribe(&key("nb1")));
        assert_eq!(mgr.count(), 0);
    }

    #[test]
    fn drain_empties_the_set() {
        let mut mgr = SubscriptionManager::new();
        mgr.subscribe(key("a"));
        mgr.subscribe(key("b"));
        let mut drained = mgr.drain();
        drained.sort();
        assert_eq!(drained, vec![key("a"), key("b")]);
        assert_eq!(mgr.count(), 0);
    }
}
