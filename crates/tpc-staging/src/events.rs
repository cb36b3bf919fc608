//! Apply-time event bus
//!
//! Handlers are plain closures, delivered synchronously in registration order.
//! The first failing handler aborts the emit and the error propagates to the
//! caller of `apply`.

use crate::error::{Result, TxError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tpc_model::PendingNode;

/// Event category handlers subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A pending node was materialized in the host store
    NodeCreated,
}

/// Event delivered to handlers
#[derive(Debug)]
pub enum CoreEvent<'a, N> {
    /// A pending node was materialized
    NodeCreated {
        /// Node as it was buffered
        pending: &'a PendingNode<N>,
        /// Node as it now exists in the host store
        node: &'a N,
    },
}

impl<N> CoreEvent<'_, N> {
    /// Category of this event
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::NodeCreated { .. } => EventKind::NodeCreated,
        }
    }
}

/// Event handler
pub type Handler<N> = Arc<dyn Fn(&CoreEvent<'_, N>) -> Result<()> + Send + Sync>;

/// Registry of event handlers
pub struct EventBus<N> {
    handlers: RwLock<HashMap<EventKind, Vec<Handler<N>>>>,
}

impl<N> EventBus<N> {
    /// Create empty bus
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler for `kind`
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&CoreEvent<'_, N>) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Number of handlers registered for `kind`
    #[must_use]
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Deliver `event` to every handler of its kind
    ///
    /// Handlers run outside the registry lock, so a handler may register
    /// further handlers; those only see later events.
    ///
    /// # Errors
    /// Returns the first handler error; later handlers are skipped.
    pub fn emit(&self, event: &CoreEvent<'_, N>) -> Result<()> {
        let handlers = self
            .handlers
            .read()
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();

        for handler in handlers {
            handler(event).map_err(|err| match err {
                TxError::Observer(_) => err,
                other => TxError::observer(other.to_string()),
            })?;
        }
        Ok(())
    }
}

impl<N> Default for EventBus<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N> fmt::Debug for EventBus<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read();
        f.debug_struct("EventBus")
            .field("kinds", &handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tpc_model::{NodeDescriptor, NodeRef};

    fn pending() -> PendingNode<u32> {
        PendingNode::create(NodeDescriptor::new(NodeRef::Real(1), NodeRef::Real(0))).unwrap()
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let bus = EventBus::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            bus.on(EventKind::NodeCreated, move |_| {
                seen.lock().push(tag);
                Ok(())
            });
        }

        let pending = pending();
        bus.emit(&CoreEvent::NodeCreated {
            pending: &pending,
            node: &9,
        })
        .unwrap();
        assert_eq!(*seen.lock(), vec!["first", "second"]);
    }

    #[test]
    fn failing_handler_aborts_emit() {
        let bus = EventBus::<u32>::new();
        let reached = Arc::new(Mutex::new(false));

        bus.on(EventKind::NodeCreated, |_| {
            Err(TxError::invalid_argument("handler refused"))
        });
        let flag = Arc::clone(&reached);
        bus.on(EventKind::NodeCreated, move |_| {
            *flag.lock() = true;
            Ok(())
        });

        let pending = pending();
        let err = bus
            .emit(&CoreEvent::NodeCreated {
                pending: &pending,
                node: &9,
            })
            .unwrap_err();
        assert!(matches!(err, TxError::Observer(_)));
        assert!(!*reached.lock());
        assert_eq!(bus.handler_count(EventKind::NodeCreated), 2);
    }
}
