//! Change notifications
//!
//! Observers subscribe per [`ChangeKind`] and receive zero-argument
//! notifications; they pull state through the machine's accessors.
//! Handlers run synchronously in subscription order. The handler list is
//! copied before dispatch, so a handler may subscribe or unsubscribe
//! without affecting the dispatch in progress.

use std::sync::{Arc, Mutex, MutexGuard};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Connectivity,
    Product,
    Statistics,
    Alerts,
}

pub type Handler = Arc<dyn Fn() + Send + Sync>;

/// Returned by [`EventBus::subscribe`]; pass to [`EventBus::unsubscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    kind: ChangeKind,
    id: u64,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: Vec<(ChangeKind, u64, Handler)>,
}

#[derive(Default)]
pub struct EventBus {
    registry: Mutex<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self, kind: ChangeKind, handler: Handler) -> Subscription {
        let mut registry = self.registry();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.handlers.push((kind, id, handler));
        Subscription { kind, id }
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.registry()
            .handlers
            .retain(|(kind, id, _)| !(*kind == subscription.kind && *id == subscription.id));
    }

    pub fn notify(&self, kind: ChangeKind) {
        let handlers: Vec<Handler> = self
            .registry()
            .handlers
            .iter()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, _, handler)| handler.clone())
            .collect();

        trace!("Notifying {} {:?} listeners", handlers.len(), kind);
        for handler in handlers {
            handler();
        }
    }

    pub fn subscriber_count(&self, kind: ChangeKind) -> usize {
        self.registry()
            .handlers
            .iter()
            .filter(|(k, _, _)| *k == kind)
            .count()
    }
}
