//! Press-safety monitor
//!
//! Tracks digital joins held "pressed" by this client. Held joins are
//! repeated with the latching frame while the link is up so the processor
//! does not auto-release them, and are released locally when the link drops
//! so observers never see a button stuck high.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use tracing::info;

use crate::codec::CipMessage;
use crate::join::{Direction, JoinEvent, JoinValue, SignalKind};
use crate::state::JoinStateStore;

#[derive(Default)]
pub struct PressSafetyMonitor {
    pressed: Mutex<BTreeSet<u16>>,
}

impl PressSafetyMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the join was not already pressed
    pub fn mark_pressed(&self, join: u16) -> bool {
        self.mark_pressed_with(join, || {})
    }

    /// Returns `true` if the join was pressed
    pub fn mark_released(&self, join: u16) -> bool {
        self.mark_released_with(join, || {})
    }

    /// Mark `join` pressed and run `record` before the set is unlocked
    pub fn mark_pressed_with(&self, join: u16, record: impl FnOnce()) -> bool {
        let mut pressed = self.pressed.lock();
        let inserted = pressed.insert(join);
        record();
        inserted
    }

    /// Mark `join` released and run `record` before the set is unlocked
    pub fn mark_released_with(&self, join: u16, record: impl FnOnce()) -> bool {
        let mut pressed = self.pressed.lock();
        let removed = pressed.remove(&join);
        record();
        removed
    }

    pub fn is_pressed(&self, join: u16) -> bool {
        self.pressed.lock().contains(&join)
    }

    /// Pressed joins in ascending order
    pub fn pressed(&self) -> Vec<u16> {
        self.pressed.lock().iter().copied().collect()
    }

    /// Latching-high frames for pressed joins whose outgoing value is still high
    pub fn keep_alive_frames(&self, store: &JoinStateStore) -> Vec<CipMessage> {
        self.pressed
            .lock()
            .iter()
            .filter(|join| {
                store.read(SignalKind::Digital, **join, Direction::Outgoing) == JoinValue::Digital(true)
            })
            .map(|join| CipMessage::DigitalLatching {
                join: *join,
                value: true,
            })
            .collect()
    }

    /// Empty the set, passing the outgoing release event for each join that
    /// was pressed to `record` while the set is still locked
    ///
    /// Returns the released joins.
    pub fn force_release(&self, mut record: impl FnMut(&JoinEvent)) -> Vec<u16> {
        let mut pressed = self.pressed.lock();
        let joins: Vec<u16> = std::mem::take(&mut *pressed).into_iter().collect();
        if !joins.is_empty() {
            info!("🖐️ Force-releasing {} pressed join(s): {:?}", joins.len(), joins);
        }
        for join in &joins {
            record(&JoinEvent::outgoing(*join, false));
        }
        joins
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_press_release_bookkeeping() {
        let monitor = PressSafetyMonitor::new();

        assert!(monitor.mark_pressed(5));
        assert!(!monitor.mark_pressed(5));
        assert!(monitor.mark_pressed(2));
        assert_eq!(monitor.pressed(), vec![2, 5]);

        assert!(monitor.mark_released(5));
        assert!(!monitor.mark_released(5));
        assert!(!monitor.is_pressed(5));
        assert!(monitor.is_pressed(2));
    }

    #[test]
    fn test_force_release_clears_set() {
        let monitor = PressSafetyMonitor::new();
        monitor.mark_pressed(1);
        monitor.mark_pressed(7);

        let mut events = Vec::new();
        assert_eq!(monitor.force_release(|event| events.push(event.clone())), vec![1, 7]);
        assert_eq!(
            events,
            vec![JoinEvent::outgoing(1, false), JoinEvent::outgoing(7, false)]
        );
        assert!(monitor.pressed().is_empty());
        assert!(monitor.force_release(|_| {}).is_empty());
    }

    #[test]
    fn test_concurrent_press_and_force_release_agree_with_mirror() {
        let monitor = Arc::new(PressSafetyMonitor::new());
        let store = Arc::new(JoinStateStore::new());

        for _ in 0..500 {
            let presser = {
                let monitor = Arc::clone(&monitor);
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    monitor.mark_pressed_with(9, || {
                        store.apply(&JoinEvent::outgoing(9, true));
                    });
                })
            };
            monitor.force_release(|event| {
                store.apply(event);
            });
            presser.join().unwrap();

            let high = store.read(SignalKind::Digital, 9, Direction::Outgoing) == JoinValue::Digital(true);
            assert_eq!(monitor.is_pressed(9), high);
        }
    }

    #[test]
    fn test_keep_alive_skips_joins_already_low() {
        let monitor = PressSafetyMonitor::new();
        let store = JoinStateStore::new();

        monitor.mark_pressed(3);
        monitor.mark_pressed(4);
        store.apply(&JoinEvent::outgoing(3, true));
        store.apply(&JoinEvent::outgoing(4, false));

        assert_eq!(
            monitor.keep_alive_frames(&store),
            vec![CipMessage::DigitalLatching { join: 3, value: true }]
        );
    }
}
