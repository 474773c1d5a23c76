//! JoinStateStore - in-memory mirror of every join's last known value
//!
//! Entries are keyed by (kind, join, direction). Each key update happens under
//! the DashMap shard lock for that key, so a reader on another thread sees
//! either the old or the new value, never a torn one, and `get()` never waits
//! on network I/O.

use chrono::NaiveDateTime;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::trace;

use crate::join::{Direction, JoinEvent, JoinKey, JoinValue, SignalKind};

/// Last applied value per join, for both directions
#[derive(Default)]
pub struct JoinStateStore {
    entries: DashMap<JoinKey, JoinValue>,
    /// Most recent processor clock reading
    processor_time: RwLock<Option<NaiveDateTime>>,
}

impl JoinStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the stored value for the event's key
    ///
    /// Returns `true` when the value differs from the previous one (an unset
    /// key counts as holding the kind's default).
    pub fn apply(&self, event: &JoinEvent) -> bool {
        self.apply_with(event, |_| {})
    }

    /// Like [`apply`](Self::apply), but runs `on_change` while the key is
    /// still locked when the value changed
    ///
    /// Concurrent updates of one key therefore reach `on_change` in the same
    /// order they were stored. `on_change` must not touch the store.
    pub fn apply_with<F>(&self, event: &JoinEvent, on_change: F) -> bool
    where
        F: FnOnce(&JoinEvent),
    {
        let mut entry = self
            .entries
            .entry(event.key())
            .or_insert_with(|| JoinValue::default_for(event.kind));

        if *entry == event.value {
            return false;
        }

        trace!("🔁 {} {} -> {}", event.key(), *entry, event.value);
        *entry = event.value.clone();
        on_change(event);
        true
    }

    /// Current value of a join; the kind's default when never set
    pub fn read(&self, kind: SignalKind, join: u16, direction: Direction) -> JoinValue {
        self.entries
            .get(&JoinKey::new(kind, join, direction))
            .map(|value| value.clone())
            .unwrap_or_else(|| JoinValue::default_for(kind))
    }

    /// Every join seen for `direction`, ordered by kind then join number
    pub fn snapshot(&self, direction: Direction) -> Vec<JoinEvent> {
        let mut events: Vec<JoinEvent> = self
            .entries
            .iter()
            .filter(|entry| entry.key().direction == direction)
            .map(|entry| JoinEvent::new(entry.key().join, direction, entry.value().clone()))
            .collect();
        events.sort_by_key(|event| (event.kind, event.join));
        events
    }

    /// Number of stored entries, both directions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set_processor_time(&self, at: NaiveDateTime) {
        *self.processor_time.write() = Some(at);
    }

    pub fn processor_time(&self) -> Option<NaiveDateTime> {
        *self.processor_time.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_unset_joins_read_as_default() {
        let store = JoinStateStore::new();
        assert_eq!(
            store.read(SignalKind::Digital, 1, Direction::Incoming),
            JoinValue::Digital(false)
        );
        assert_eq!(
            store.read(SignalKind::Analog, 1, Direction::Outgoing),
            JoinValue::Analog(0)
        );
        assert_eq!(
            store.read(SignalKind::Serial, 1, Direction::Incoming),
            JoinValue::Serial(String::new())
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_apply_reports_changes_only() {
        let store = JoinStateStore::new();

        assert!(store.apply(&JoinEvent::incoming(12, 32456u16)));
        assert!(!store.apply(&JoinEvent::incoming(12, 32456u16)));
        assert!(store.apply(&JoinEvent::incoming(12, 0u16)));

        // Applying the default to an unset key is not a change
        assert!(!store.apply(&JoinEvent::incoming(3, false)));
        assert_eq!(
            store.read(SignalKind::Analog, 12, Direction::Incoming),
            JoinValue::Analog(0)
        );
    }

    #[test]
    fn test_directions_are_independent() {
        let store = JoinStateStore::new();
        store.apply(&JoinEvent::outgoing(1, true));

        assert_eq!(
            store.read(SignalKind::Digital, 1, Direction::Outgoing),
            JoinValue::Digital(true)
        );
        assert_eq!(
            store.read(SignalKind::Digital, 1, Direction::Incoming),
            JoinValue::Digital(false)
        );
    }

    #[test]
    fn test_apply_with_runs_callback_on_change() {
        let store = JoinStateStore::new();
        let mut seen = Vec::new();

        store.apply_with(&JoinEvent::incoming(101, "Hello Crestron!"), |e| {
            seen.push(e.clone())
        });
        store.apply_with(&JoinEvent::incoming(101, "Hello Crestron!"), |e| {
            seen.push(e.clone())
        });

        assert_eq!(seen, vec![JoinEvent::incoming(101, "Hello Crestron!")]);
    }

    #[test]
    fn test_snapshot_is_sorted_and_filtered() {
        let store = JoinStateStore::new();
        store.apply(&JoinEvent::outgoing(101, "text"));
        store.apply(&JoinEvent::outgoing(5, true));
        store.apply(&JoinEvent::outgoing(2, true));
        store.apply(&JoinEvent::outgoing(12, 7u16));
        store.apply(&JoinEvent::incoming(1, true));

        let snapshot = store.snapshot(Direction::Outgoing);
        let keys: Vec<_> = snapshot.iter().map(|e| (e.kind, e.join)).collect();
        assert_eq!(
            keys,
            vec![
                (SignalKind::Digital, 2),
                (SignalKind::Digital, 5),
                (SignalKind::Analog, 12),
                (SignalKind::Serial, 101),
            ]
        );
        assert!(snapshot.iter().all(|e| e.direction == Direction::Outgoing));
    }

    #[test]
    fn test_concurrent_apply_and_read() {
        let store = Arc::new(JoinStateStore::new());

        let writers: Vec<_> = (0..4u16)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for value in 0..1000u16 {
                        store.apply(&JoinEvent::incoming(t + 1, value));
                    }
                })
            })
            .collect();

        for _ in 0..1000 {
            let value = store.read(SignalKind::Analog, 1, Direction::Incoming);
            assert!(value.as_analog().is_some());
        }

        for writer in writers {
            writer.join().unwrap();
        }
        for join in 1..=4 {
            assert_eq!(
                store.read(SignalKind::Analog, join, Direction::Incoming),
                JoinValue::Analog(999)
            );
        }
    }

    #[test]
    fn test_processor_time() {
        let store = JoinStateStore::new();
        assert!(store.processor_time().is_none());

        let at = chrono::NaiveDate::from_ymd_opt(2024, 7, 21)
            .unwrap()
            .and_hms_opt(13, 45, 9)
            .unwrap();
        store.set_processor_time(at);
        assert_eq!(store.processor_time(), Some(at));
    }
}
