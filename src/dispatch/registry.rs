//! Subscription registry
//!
//! Observers are stored per (kind, join, direction) in insertion order.
//! Duplicates are allowed; each registration gets its own id.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::join::{JoinKey, JoinValue, SignalKind};

/// Receives join value changes
pub trait SignalObserver: Send + Sync {
    fn on_change(&self, kind: SignalKind, join: u16, value: &JoinValue);
}

impl<F> SignalObserver for F
where
    F: Fn(SignalKind, u16, &JoinValue) + Send + Sync,
{
    fn on_change(&self, kind: SignalKind, join: u16, value: &JoinValue) {
        self(kind, join, value)
    }
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SubscriptionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

type ObserverList = Vec<(SubscriptionId, Arc<dyn SignalObserver>)>;

#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: AtomicU64,
    observers: RwLock<HashMap<JoinKey, ObserverList>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, key: JoinKey, observer: Arc<dyn SignalObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.observers.write().entry(key).or_default().push((id, observer));
        id
    }

    /// Remove one registration; `false` if the id is unknown
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.write();

        let Some(key) = observers
            .iter()
            .find(|(_, list)| list.iter().any(|(sid, _)| *sid == id))
            .map(|(key, _)| *key)
        else {
            return false;
        };

        if let Some(list) = observers.get_mut(&key) {
            list.retain(|(sid, _)| *sid != id);
            if list.is_empty() {
                observers.remove(&key);
            }
        }
        true
    }

    /// Observers for `key` at this instant, in registration order
    ///
    /// The list is copied out so observers run without holding the lock and
    /// may themselves subscribe or unsubscribe.
    pub fn observers_for(&self, key: &JoinKey) -> ObserverList {
        self.observers.read().get(key).cloned().unwrap_or_default()
    }

    /// Total number of registrations
    pub fn len(&self) -> usize {
        self.observers.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::Direction;

    fn noop() -> Arc<dyn SignalObserver> {
        Arc::new(|_: SignalKind, _: u16, _: &JoinValue| {})
    }

    #[test]
    fn test_subscribe_preserves_order_and_duplicates() {
        let registry = SubscriptionRegistry::new();
        let key = JoinKey::new(SignalKind::Digital, 1, Direction::Incoming);
        let observer = noop();

        let a = registry.subscribe(key, Arc::clone(&observer));
        let b = registry.subscribe(key, observer);
        let c = registry.subscribe(key, noop());

        let ids: Vec<_> = registry.observers_for(&key).iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![a, b, c]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_keys_are_exact() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(JoinKey::new(SignalKind::Digital, 1, Direction::Incoming), noop());

        assert!(registry
            .observers_for(&JoinKey::new(SignalKind::Digital, 1, Direction::Outgoing))
            .is_empty());
        assert!(registry
            .observers_for(&JoinKey::new(SignalKind::Analog, 1, Direction::Incoming))
            .is_empty());
    }

    #[test]
    fn test_unsubscribe() {
        let registry = SubscriptionRegistry::new();
        let key = JoinKey::new(SignalKind::Serial, 101, Direction::Incoming);
        let a = registry.subscribe(key, noop());
        let b = registry.subscribe(key, noop());

        assert!(registry.unsubscribe(a));
        assert!(!registry.unsubscribe(a));

        let ids: Vec<_> = registry.observers_for(&key).iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![b]);

        assert!(registry.unsubscribe(b));
        assert!(registry.is_empty());
    }
}
