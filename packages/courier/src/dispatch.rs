//! Typed publish/subscribe registry for classified inbound events.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::protocol::Envelope;

/// Subscription categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Every inbound envelope, regardless of type.
    Message,
    Heartbeat,
    Auth,
    Error,
    System,
    Chat,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Message,
        Category::Heartbeat,
        Category::Auth,
        Category::Error,
        Category::System,
        Category::Chat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Heartbeat => "heartbeat",
            Self::Auth => "auth",
            Self::Error => "error",
            Self::System => "system",
            Self::Chat => "chat",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a handler receives.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub category: Category,
    pub envelope: Envelope,
}

/// A subscriber callback. Clones share identity, so the same `Handler`
/// value passed to `on` can later be passed to `off`.
#[derive(Clone)]
pub struct Handler(Arc<dyn Fn(&Event) + Send + Sync>);

impl Handler {
    pub fn new(f: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    fn call(&self, event: &Event) {
        (self.0)(event)
    }

    fn same(&self, other: &Handler) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler")
            .field(&Arc::as_ptr(&self.0).cast::<()>())
            .finish()
    }
}

/// Category → ordered handler set.
///
/// Handlers run synchronously in registration order. The registry lock is
/// released before handlers run, so a handler may call `on`/`off` itself; such
/// changes take effect from the next event.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: RwLock<HashMap<Category, Vec<Handler>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `category`. Registering the same handler twice
    /// is a no-op.
    pub fn on(&self, category: Category, handler: Handler) {
        let mut map = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let set = map.entry(category).or_default();
        if !set.iter().any(|h| h.same(&handler)) {
            set.push(handler);
        }
    }

    /// Unregister `handler`. Unknown handlers are ignored.
    pub fn off(&self, category: Category, handler: &Handler) {
        let mut map = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(set) = map.get_mut(&category) {
            set.retain(|h| !h.same(handler));
        }
    }

    pub fn handler_count(&self, category: Category) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&category)
            .map_or(0, Vec::len)
    }

    /// Deliver `envelope` to every handler of `category`.
    pub fn emit(&self, category: Category, envelope: &Envelope) {
        let snapshot: Vec<Handler> = {
            let map = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            match map.get(&category) {
                Some(set) if !set.is_empty() => set.clone(),
                _ => return,
            }
        };

        let event = Event {
            category,
            envelope: envelope.clone(),
        };
        for handler in &snapshot {
            handler.call(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Handler {
        let log = log.clone();
        Handler::new(move |event| {
            log.lock()
                .unwrap()
                .push(format!("{tag}:{}", event.envelope.kind()));
        })
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = EventDispatcher::new();
        dispatcher.on(Category::Chat, recorder(&log, "first"));
        dispatcher.on(Category::Chat, recorder(&log, "second"));

        dispatcher.emit(Category::Chat, &Envelope::chat("m", "c", "hi"));

        assert_eq!(*log.lock().unwrap(), vec!["first:chat", "second:chat"]);
    }

    #[test]
    fn registering_twice_delivers_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = EventDispatcher::new();
        let handler = recorder(&log, "h");
        dispatcher.on(Category::System, handler.clone());
        dispatcher.on(Category::System, handler.clone());
        assert_eq!(dispatcher.handler_count(Category::System), 1);

        dispatcher.emit(Category::System, &Envelope::heartbeat());
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn off_removes_only_the_given_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = EventDispatcher::new();
        let a = recorder(&log, "a");
        let b = recorder(&log, "b");
        dispatcher.on(Category::Error, a.clone());
        dispatcher.on(Category::Error, b);

        dispatcher.off(Category::Error, &a);
        dispatcher.off(Category::Error, &a);
        dispatcher.emit(Category::Error, &Envelope::error("X", "boom"));

        assert_eq!(*log.lock().unwrap(), vec!["b:error"]);
    }

    #[test]
    fn off_for_unknown_category_is_noop() {
        let dispatcher = EventDispatcher::new();
        let handler = Handler::new(|_| {});
        dispatcher.off(Category::Auth, &handler);
        assert_eq!(dispatcher.handler_count(Category::Auth), 0);
    }

    #[test]
    fn handler_may_unsubscribe_itself() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let count = Arc::new(Mutex::new(0));
        let slot: Arc<Mutex<Option<Handler>>> = Arc::new(Mutex::new(None));

        let handler = {
            let dispatcher = dispatcher.clone();
            let count = count.clone();
            let slot = slot.clone();
            Handler::new(move |_| {
                *count.lock().unwrap() += 1;
                if let Some(me) = slot.lock().unwrap().as_ref() {
                    dispatcher.off(Category::Message, me);
                }
            })
        };
        *slot.lock().unwrap() = Some(handler.clone());
        dispatcher.on(Category::Message, handler);

        dispatcher.emit(Category::Message, &Envelope::heartbeat());
        dispatcher.emit(Category::Message, &Envelope::heartbeat());
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
