//! Pub/Sub Event Bus for decoupled component communication.
//!
//! Architecture:
//! - Components subscribe to an event *name* with a handler closure
//! - publish() invokes the handlers for that name immediately, in the caller's context
//! - The handler's captured state is its context (receiver)
//!
//! Callback order: FIFO (first-subscribed, first-called) within same event name.
//! Cross-name order undefined - don't rely on ordering between different event names.
//!
//! Handlers return `Result`. The first `Err` stops the remaining dispatch for
//! that publish and is handed back to the publisher as [`DispatchError`].
//!
//! Re-entrancy: the handler list is snapshotted before dispatch and no lock is
//! held while handlers run, so a handler may publish, subscribe or unsubscribe.
//! Changes made during a dispatch take effect from the next publish.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use log::{trace, warn};

use super::events::AppEvent;

/// Event handler. Identity (for idempotent subscribe/unsubscribe) is the `Arc` allocation.
pub type Handler = Arc<dyn Fn(&AppEvent) -> anyhow::Result<()> + Send + Sync>;

/// Wrap a closure as a [`Handler`]
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&AppEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn same_handler(a: &Handler, b: &Handler) -> bool {
    // Compare data pointers only; vtable pointers may differ across codegen units
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// A handler aborted dispatch
#[derive(Debug)]
pub struct DispatchError {
    pub event: String,
    /// Position of the failing handler in subscription order
    pub index: usize,
    pub source: anyhow::Error,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler #{} for '{}' failed: {}", self.index, self.event, self.source)
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.source)
    }
}

/// Process-wide pub/sub registry.
///
/// Cloning yields another handle to the same registry; the application
/// creates one bus and hands clones to every component.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<String, Vec<Handler>>>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("event_names", &self.subscribers.read().map(|s| s.len()).unwrap_or(0))
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to `event_name`.
    ///
    /// Subscribing the same handler to the same name twice is a no-op.
    /// Returns true if the handler was added.
    pub fn subscribe(&self, event_name: &str, handler: &Handler) -> bool {
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        let list = subs.entry(event_name.to_string()).or_default();
        if list.iter().any(|h| same_handler(h, handler)) {
            trace!("EventBus: duplicate subscribe to '{}' ignored", event_name);
            return false;
        }
        list.push(Arc::clone(handler));
        true
    }

    /// Publish `event` to every handler subscribed to `event.name()`.
    pub fn publish(&self, event: &AppEvent) -> Result<(), DispatchError> {
        let name = event.name();
        let handlers: Vec<Handler> = match self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            Some(list) => list.clone(),
            None => return Ok(()),
        };

        trace!("EventBus: '{}' -> {} handler(s)", name, handlers.len());
        for (index, h) in handlers.iter().enumerate() {
            if let Err(source) = h(event) {
                warn!("EventBus: dispatch of '{}' aborted at handler #{}: {}", name, index, source);
                return Err(DispatchError {
                    event: name.to_string(),
                    index,
                    source,
                });
            }
        }
        Ok(())
    }

    /// Publish and log (instead of return) a dispatch failure.
    ///
    /// For publishers that have no caller to report to, e.g. inside completion callbacks.
    pub fn emit(&self, event: AppEvent) {
        // Failure already logged by publish()
        let _ = self.publish(&event);
    }

    /// Remove every registration of `handler` for `event_name`
    pub fn unsubscribe(&self, event_name: &str, handler: &Handler) {
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = subs.get_mut(event_name) {
            list.retain(|h| !same_handler(h, handler));
            if list.is_empty() {
                subs.remove(event_name);
            }
        }
    }

    /// Clear subscribers for one event name
    pub fn unsubscribe_all(&self, event_name: &str) {
        self.subscribers.write().unwrap_or_else(|e| e.into_inner()).remove(event_name);
    }

    /// Clear all subscribers
    pub fn clear(&self) {
        self.subscribers.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Number of handlers registered for `event_name`
    pub fn subscriber_count(&self, event_name: &str) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event_name)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    pub fn has_subscribers(&self, event_name: &str) -> bool {
        self.subscriber_count(event_name) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::names;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Mutex;

    fn counting(counter: &Arc<AtomicI32>, by: i32) -> Handler {
        let c = Arc::clone(counter);
        handler(move |_| {
            c.fetch_add(by, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_subscribe_publish_immediate() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicI32::new(0));
        bus.subscribe(names::APP_READY, &counting(&counter, 10));

        bus.publish(&AppEvent::AppReady).unwrap();
        // Callback was invoked before publish returned
        assert_eq!(counter.load(Ordering::SeqCst), 10);

        bus.publish(&AppEvent::LogOut).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_duplicate_subscribe_invoked_once() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicI32::new(0));
        let h = counting(&counter, 1);

        assert!(bus.subscribe(names::LOG_OUT, &h));
        assert!(!bus.subscribe(names::LOG_OUT, &h));
        assert_eq!(bus.subscriber_count(names::LOG_OUT), 1);

        bus.publish(&AppEvent::LogOut).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Same handler under another name is a separate registration
        assert!(bus.subscribe(names::APP_READY, &h));
    }

    #[test]
    fn test_subscription_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let s = Arc::clone(&seen);
            bus.subscribe(
                names::VIEW_RENDERED,
                &handler(move |e| {
                    if let AppEvent::ViewRendered(id) = e {
                        s.lock().unwrap().push(format!("{}:{}", tag, id));
                    }
                    Ok(())
                }),
            );
        }

        bus.publish(&AppEvent::ViewRendered("home".into())).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["a:home", "b:home", "c:home"]);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicI32::new(0));
        let h = counting(&counter, 10);
        let other = counting(&counter, 1);
        bus.subscribe(names::APP_READY, &h);
        bus.subscribe(names::APP_READY, &other);

        bus.unsubscribe(names::APP_READY, &h);
        bus.publish(&AppEvent::AppReady).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        bus.unsubscribe_all(names::APP_READY);
        assert!(!bus.has_subscribers(names::APP_READY));
    }

    #[test]
    fn test_failing_handler_aborts_dispatch() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicI32::new(0));
        bus.subscribe(names::LOG_OUT, &counting(&counter, 1));
        bus.subscribe(names::LOG_OUT, &handler(|_| Err(anyhow::anyhow!("boom"))));
        bus.subscribe(names::LOG_OUT, &counting(&counter, 100));

        let err = bus.publish(&AppEvent::LogOut).unwrap_err();
        assert_eq!(err.index, 1);
        assert_eq!(err.event, "log_out");
        // Third handler never ran
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reentrant_publish_and_subscribe() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicI32::new(0));
        let late = counting(&counter, 100);

        let inner_bus = bus.clone();
        let late_clone = Arc::clone(&late);
        bus.subscribe(
            names::APP_READY,
            &handler(move |_| {
                inner_bus.subscribe(names::APP_READY, &late_clone);
                inner_bus.publish(&AppEvent::LogOut)?;
                Ok(())
            }),
        );
        bus.subscribe(names::LOG_OUT, &counting(&counter, 1));

        bus.publish(&AppEvent::AppReady).unwrap();
        // Nested publish ran; handler added mid-dispatch not called this round
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        bus.publish(&AppEvent::AppReady).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 102);
    }
}
