/// Routes inbound events to handlers of the active conversation
use super::protocol::{EventKind, InboundEvent};
use crate::utils::{read_lock, write_lock};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, trace};

/// Event callback. Identity is the `Arc` allocation, not the closure body.
pub type Handler = Arc<dyn Fn(&InboundEvent) + Send + Sync>;

/// Wrap a closure as a [`Handler`]
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&InboundEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

fn same_handler(a: &Handler, b: &Handler) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[derive(Default)]
struct Scope {
    conversation_id: Option<String>,
    handlers: HashMap<EventKind, Vec<Handler>>,
}

/// Event dispatcher shared by the connection manager and the session facade
#[derive(Clone, Default)]
pub struct EventDispatcher {
    scope: Arc<RwLock<Scope>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `conversation_id` the active conversation.
    ///
    /// Every handler of the previous scope is dropped. Returns how many were removed.
    pub fn scope_to(&self, conversation_id: Option<String>) -> usize {
        let mut scope = write_lock(&self.scope);
        let removed = scope.handlers.values().map(Vec::len).sum();
        debug!(
            "Dispatcher scope {:?} -> {:?} ({} handlers dropped)",
            scope.conversation_id, conversation_id, removed
        );
        scope.handlers.clear();
        scope.conversation_id = conversation_id;
        removed
    }

    pub fn active_conversation(&self) -> Option<String> {
        read_lock(&self.scope).conversation_id.clone()
    }

    /// Register `handler` for `kind`; returns false if it was already registered
    pub fn subscribe(&self, kind: EventKind, handler: &Handler) -> bool {
        let mut scope = write_lock(&self.scope);
        let list = scope.handlers.entry(kind).or_default();
        if list.iter().any(|h| same_handler(h, handler)) {
            return false;
        }
        list.push(handler.clone());
        true
    }

    /// Remove `handler` from `kind`; returns whether it was registered
    pub fn unsubscribe(&self, kind: EventKind, handler: &Handler) -> bool {
        let mut scope = write_lock(&self.scope);
        match scope.handlers.get_mut(&kind) {
            Some(list) => {
                let before = list.len();
                list.retain(|h| !same_handler(h, handler));
                before != list.len()
            }
            None => false,
        }
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        read_lock(&self.scope)
            .handlers
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Deliver `event` to the handlers of the active conversation.
    ///
    /// Events tagged with another conversation are dropped. Handlers run after
    /// the scope lock is released, so they may subscribe or unsubscribe.
    pub fn dispatch(&self, event: &InboundEvent) -> usize {
        let kind = event.kind();
        let targets: Vec<Handler> = {
            let scope = read_lock(&self.scope);
            let Some(active) = scope.conversation_id.as_deref() else {
                trace!("Dropping {} event: no active conversation", kind);
                return 0;
            };
            if let Some(conversation_id) = event.conversation_id() {
                if conversation_id != active {
                    debug!(
                        "Dropping {} event for inactive conversation {}",
                        kind, conversation_id
                    );
                    return 0;
                }
            }
            match scope.handlers.get(&kind) {
                Some(list) => list.clone(),
                None => return 0,
            }
        };

        for handler in &targets {
            handler(event);
        }
        targets.len()
    }
}
