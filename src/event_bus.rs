// =============================================================================
// Event Bus — synchronous, ordered, panic-isolated fan-out of trading events
// =============================================================================
//
// Listeners are registered once before the scheduler starts and are never
// removed at runtime in this crate, but `unsubscribe` is provided because
// tests rely on it to assert that a deregistered listener stops receiving
// deliveries. Delivery happens on the publisher's own task in registration
// order; a listener that panics is isolated so the rest of the list still
// gets the event.
// =============================================================================

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::error;
use uuid::Uuid;

use crate::types::VolatilityClass;

#[derive(Debug, Clone)]
pub enum Event {
    PositionOpened { ticket: u64, symbol: String },
    PositionModified { ticket: u64 },
    PositionClosed { ticket: u64, profit: f64 },
    PositionGrouped { ticket: u64, group_id: Uuid },
    TrailingUpdated { ticket: u64, new_stop_loss: f64 },
    ScalingTriggered { group_id: Uuid, level: u32, opened: usize },
    ScalingCompleted { group_id: Uuid },
    VolatilityChanged { symbol: String, class: VolatilityClass },
    MarginWarning,
    MarginCritical,
    MarginSafe,
    ProfitTargetReached { closed: usize },
    StagnantClosed { ticket: u64 },
    Error { source: String, message: String },
}

type Listener = Box<dyn Fn(&Event) + Send + Sync>;

struct Entry {
    id: u64,
    listener: Listener,
}

/// Thread-safe publish/subscribe hub. Cloning shares the same underlying
/// listener list (`Arc`-backed), matching the way the rest of the control
/// plane shares state.
#[derive(Clone)]
pub struct EventBus {
    listeners: Arc<RwLock<Vec<Entry>>>,
    next_id: Arc<std::sync::atomic::AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(std::sync::atomic::AtomicU64::new(1)),
        }
    }

    /// Register a listener; returns a handle that can be passed to
    /// `unsubscribe`.
    pub fn subscribe<F>(&self, listener: F) -> u64
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.listeners.write().push(Entry {
            id,
            listener: Box::new(listener),
        });
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.listeners.write().retain(|e| e.id != id);
    }

    /// Deliver `event` to every listener in registration order. A panicking
    /// listener is caught and logged; it never prevents delivery to the
    /// remaining listeners and never propagates to the caller.
    pub fn publish(&self, event: Event) {
        let listeners = self.listeners.read();
        for entry in listeners.iter() {
            let result = catch_unwind(AssertUnwindSafe(|| (entry.listener)(&event)));
            if let Err(panic) = result {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "listener panicked".to_string());
                error!(listener_id = entry.id, error = %msg, "event listener panicked, continuing delivery");
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delivers_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(RwLock::new(Vec::new()));

        let o1 = order.clone();
        bus.subscribe(move |_| o1.write().push(1));
        let o2 = order.clone();
        bus.subscribe(move |_| o2.write().push(2));

        bus.publish(Event::MarginSafe);
        assert_eq!(*order.read(), vec![1, 2]);
    }

    #[test]
    fn panicking_listener_does_not_stop_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe(|_| panic!("boom"));
        let hits2 = hits.clone();
        bus.subscribe(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(Event::MarginSafe);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let id = bus.subscribe(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(Event::MarginSafe);
        bus.unsubscribe(id);
        bus.publish(Event::MarginSafe);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
