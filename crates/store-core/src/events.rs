//! Event infrastructure for the store.
//!
//! Provides `StoreEvent` for the host app's debug/monitoring surface and
//! `EventBus` for subscriptions. The bus is thread-safe for multi-threaded
//! Tokio runtimes; wrap it in `Arc` to subscribe.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by the store for real-time monitoring.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StoreEvent {
    /// A document finished loading from its log directory.
    DocumentOpened {
        /// Document identity (note id or the folder tree).
        document: String,
        /// Log files skipped as corrupt or unreadable during the scan.
        skipped: usize,
    },
    /// A document came up with no usable state at all.
    DocumentDegraded {
        document: String,
        /// How many log files were present but unusable.
        skipped: usize,
    },
    /// A local update was written and merged.
    UpdateAppended {
        document: String,
        seq: u64,
        /// Log filename the update landed in.
        file: String,
    },
    /// A remote file was merged into an open document.
    RemoteApplied { document: String, file: String },
    /// A snapshot was written by the compactor.
    SnapshotWritten {
        document: String,
        file: String,
        /// Raw files the snapshot made deletion-eligible.
        superseded: usize,
    },
    /// A pack was written by the compactor.
    PackWritten {
        document: String,
        file: String,
        superseded: usize,
    },
    /// A garbage collection run finished.
    GcCompleted {
        files_deleted: usize,
        bytes_reclaimed: u64,
    },
    /// A storage migration run finished.
    MigrationCompleted {
        files_migrated: usize,
        errors: usize,
    },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus for publishing store events to subscribers.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Arc<dyn Fn(StoreEvent) + Send + Sync>)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(StoreEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // Use try_write to avoid deadlock if Drop runs during panic unwinding
        // while a read lock is held (e.g., during emit).
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: StoreEvent) {
        // Clone the callback list to prevent deadlock if a callback calls subscribe.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn sample_event() -> StoreEvent {
        StoreEvent::UpdateAppended {
            document: "note:n1".into(),
            seq: 1,
            file: "x.crdtlog".into(),
        }
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let _sub = bus.subscribe(move |_event| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(sample_event());
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        {
            let _sub = bus.subscribe(move |_event| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            });
            bus.emit(sample_event());
            assert_eq!(count.load(Ordering::Relaxed), 1);
            // _sub dropped here
        }

        bus.emit(sample_event());
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_multiple_subscribers() {
        let bus = Arc::new(EventBus::new());
        let count1 = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::new(AtomicUsize::new(0));

        let count1_clone = Arc::clone(&count1);
        let count2_clone = Arc::clone(&count2);

        let _sub1 = bus.subscribe(move |_| {
            count1_clone.fetch_add(1, Ordering::Relaxed);
        });
        let _sub2 = bus.subscribe(move |_| {
            count2_clone.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(sample_event());

        assert_eq!(count1.load(Ordering::Relaxed), 1);
        assert_eq!(count2.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_event_serialization() {
        let event = StoreEvent::GcCompleted {
            files_deleted: 4,
            bytes_reclaimed: 2048,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"gcCompleted\""));
        assert!(json.contains("\"files_deleted\":4"));
    }
}
