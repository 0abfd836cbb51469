//! Event dispatcher.
//!
//! Handlers register per [`EventCategory`] and run in registration order. A
//! handler that returns an error or panics is logged and skipped; the other
//! handlers and the read loop carry on.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use log::warn;

use crate::types::{Event, EventCategory};

/// Error a handler may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Event handler type.
pub type EventHandler = Arc<dyn Fn(&Event) -> Result<(), HandlerError> + Send + Sync>;

/// Registration token returned by [`EventDispatcher::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
pub struct EventDispatcher {
    handlers: RwLock<HashMap<EventCategory, Vec<(HandlerId, EventHandler)>>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one category.
    pub fn on<F>(&self, category: EventCategory, handler: F) -> HandlerId
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        handlers.entry(category).or_default().push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        for list in handlers.values_mut() {
            if let Some(pos) = list.iter().position(|(h, _)| *h == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn handler_count(&self, category: EventCategory) -> usize {
        let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
        handlers.get(&category).map_or(0, Vec::len)
    }

    /// Deliver an event to every handler of its category.
    pub fn dispatch(&self, event: &Event) {
        let category = event.category();
        // Snapshot so handlers may register or remove handlers themselves.
        let targets: Vec<(HandlerId, EventHandler)> = {
            let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
            match handlers.get(&category) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        for (id, handler) in targets {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{:?} handler {:?} failed: {}", category, id, e),
                Err(_) => warn!("{:?} handler {:?} panicked", category, id),
            }
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PairingCodeEvent, QrEvent};
    use std::sync::Mutex;
    use std::time::Duration;

    fn qr(code: &str) -> Event {
        Event::Qr(QrEvent {
            code: code.into(),
            timeout: Duration::from_secs(60),
        })
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let seen = seen.clone();
            dispatcher.on(EventCategory::Qr, move |_| {
                seen.lock().unwrap().push(n);
                Ok(())
            });
        }
        dispatcher.dispatch(&qr("a"));
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_failures_are_isolated() {
        let dispatcher = EventDispatcher::new();
        let delivered = Arc::new(Mutex::new(0));

        dispatcher.on(EventCategory::Qr, |_| Err("boom".into()));
        dispatcher.on(EventCategory::Qr, |_| panic!("handler bug"));
        let counter = delivered.clone();
        dispatcher.on(EventCategory::Qr, move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        dispatcher.dispatch(&qr("a"));
        dispatcher.dispatch(&qr("b"));
        assert_eq!(*delivered.lock().unwrap(), 2);
    }

    #[test]
    fn test_off_and_category_routing() {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        let id = dispatcher.on(EventCategory::PairingCode, move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        dispatcher.dispatch(&qr("not for pairing code handlers"));
        dispatcher.dispatch(&Event::PairingCode(PairingCodeEvent {
            code: "ABCD-EFGH".into(),
        }));
        assert_eq!(*hits.lock().unwrap(), 1);

        assert!(dispatcher.off(id));
        assert!(!dispatcher.off(id));
        assert_eq!(dispatcher.handler_count(EventCategory::PairingCode), 0);
    }
}
