//! Tracks which edge connections currently serve traffic.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::connection::{ConnIndex, Event, EventSink};

#[derive(Debug, Default)]
pub struct ConnTracker {
    connections: Mutex<HashMap<ConnIndex, bool>>,
}

impl ConnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_active_conns(&self) -> usize {
        self.lock().values().filter(|serving| **serving).count()
    }

    pub fn is_serving(&self, index: ConnIndex) -> bool {
        self.lock().get(&index).copied().unwrap_or(false)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnIndex, bool>> {
        // The map holds plain booleans, so a poisoned guard is still consistent.
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EventSink for ConnTracker {
    fn on_tunnel_event(&self, event: Event) {
        match event.kind.serving() {
            Some(serving) => {
                self.lock().insert(event.index, serving);
            }
            None => {
                tracing::debug!(
                    conn_index = %event.index,
                    event = %event.kind,
                    "Connection event does not change readiness"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::EventKind;
    use std::sync::Arc;
    use strum::IntoEnumIterator;

    #[test]
    fn test_starts_with_no_active_connections() {
        let tracker = ConnTracker::new();
        assert_eq!(tracker.count_active_conns(), 0);
        assert!(!tracker.is_serving(ConnIndex::new(0)));
    }

    #[test]
    fn test_connected_last_means_serving() {
        let tracker = ConnTracker::new();
        for kind in [
            EventKind::RegisteringTunnel,
            EventKind::Disconnected,
            EventKind::Reconnecting,
            EventKind::Connected,
        ] {
            tracker.on_tunnel_event(Event::new(0, kind));
        }
        assert!(tracker.is_serving(ConnIndex::new(0)));
        assert_eq!(tracker.count_active_conns(), 1);
    }

    #[test]
    fn test_every_other_state_event_clears_serving() {
        for kind in EventKind::iter().filter(|k| k.serving() == Some(false)) {
            let tracker = ConnTracker::new();
            tracker.on_tunnel_event(Event::new(0, EventKind::Connected));
            tracker.on_tunnel_event(Event::new(0, kind.clone()));
            assert!(
                !tracker.is_serving(ConnIndex::new(0)),
                "{} should clear readiness",
                kind
            );
        }
    }

    #[test]
    fn test_set_url_keeps_state() {
        let tracker = ConnTracker::new();
        tracker.on_tunnel_event(Event::new(2, EventKind::Connected));
        tracker.on_tunnel_event(Event::new(
            2,
            EventKind::SetUrl("edge.example.com".to_string()),
        ));
        assert!(tracker.is_serving(ConnIndex::new(2)));
    }

    #[test]
    fn test_aggregate_count() {
        let tracker = ConnTracker::new();
        tracker.on_tunnel_event(Event::new(1, EventKind::Connected));
        tracker.on_tunnel_event(Event::new(2, EventKind::Connected));
        tracker.on_tunnel_event(Event::new(3, EventKind::Connected));
        tracker.on_tunnel_event(Event::new(3, EventKind::Unregistering));
        assert_eq!(tracker.count_active_conns(), 2);
    }

    #[test]
    fn test_concurrent_updates_per_index() {
        let tracker = Arc::new(ConnTracker::new());
        let handles: Vec<_> = (0..8u8)
            .map(|index| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        tracker.on_tunnel_event(Event::new(index, EventKind::Reconnecting));
                        let _ = tracker.count_active_conns();
                        tracker.on_tunnel_event(Event::new(index, EventKind::Connected));
                    }
                    if index % 2 == 1 {
                        tracker.on_tunnel_event(Event::new(index, EventKind::Disconnected));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.count_active_conns(), 4);
    }
}
