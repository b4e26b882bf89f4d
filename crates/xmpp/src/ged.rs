//! Global events dispatcher.
//!
//! Handlers subscribe to an event name with a priority band. Raising an
//! event runs its handlers in ascending priority order until one of them
//! stops propagation. Handlers registered with the same priority run in
//! registration order. A handler may mark the event processed without
//! stopping it; later handlers still run and the mark is reported at the end.

use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::{debug, error, warn};

use crate::events::{Event, EventKind};

/// Priority bands. Lower values run first.
pub mod priority {
    pub const PRECORE: i32 = 10;
    pub const CORE: i32 = 20;
    pub const POSTCORE: i32 = 30;
    pub const PREGUI: i32 = 40;
    pub const PREGUI1: i32 = 50;
    pub const GUI1: i32 = 60;
    pub const POSTGUI1: i32 = 70;
    pub const PREGUI2: i32 = 80;
    pub const GUI2: i32 = 90;
    pub const POSTGUI2: i32 = 100;
    pub const POSTGUI: i32 = 110;
}

/// What a handler wants to happen after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    /// Let lower-priority handlers see the event.
    Continue,
    /// Stop propagation.
    Stop,
    /// Mark the event as already processed. Lower-priority handlers still run.
    Processed,
}

/// How a dispatch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Completed,
    Stopped,
    Processed,
}

impl Dispatch {
    /// Whether a handler cut the dispatch short.
    pub fn stopped(self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Whether a handler marked the event processed.
    pub fn processed(self) -> bool {
        matches!(self, Self::Processed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

pub type EventHandler = Arc<dyn Fn(&Event) -> anyhow::Result<HandlerResult> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    priority: i32,
    id: HandlerId,
    handler: EventHandler,
}

/// Priority-ordered publish/subscribe bus shared by every account.
#[derive(Default)]
pub struct Ged {
    handlers: RwLock<HashMap<String, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl Ged {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to `event_name`.
    pub fn register_event_handler<F>(&self, event_name: &str, priority: i32, handler: F) -> HandlerId
    where
        F: Fn(&Event) -> anyhow::Result<HandlerResult> + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let list = handlers.entry(event_name.to_string()).or_default();
        let pos = list
            .iter()
            .position(|r| r.priority > priority)
            .unwrap_or(list.len());
        list.insert(pos, Registration {
            priority,
            id,
            handler: Arc::new(handler),
        });
        debug!(event = event_name, priority, %id, "registered event handler");
        id
    }

    /// Unsubscribe a handler. Returns false if it was not registered.
    pub fn remove_event_handler(&self, event_name: &str, priority: i32, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let removed = handlers.get_mut(event_name).and_then(|list| {
            let pos = list
                .iter()
                .position(|r| r.id == id && r.priority == priority)?;
            Some(list.remove(pos))
        });
        if removed.is_none() {
            warn!(event = event_name, priority, %id, "event handler not registered");
            return false;
        }
        if handlers.get(event_name).is_some_and(Vec::is_empty) {
            handlers.remove(event_name);
        }
        true
    }

    /// Number of handlers subscribed to `event_name`.
    pub fn handler_count(&self, event_name: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_name)
            .map_or(0, Vec::len)
    }

    /// Build an event for `account` and dispatch it.
    pub fn raise(&self, account: &str, kind: EventKind) -> Dispatch {
        self.raise_event(&Event::new(account, kind))
    }

    /// Run every handler of the event in priority order.
    ///
    /// Handlers are snapshotted first, so a handler may (un)subscribe
    /// without deadlocking. A failing or panicking handler is logged and
    /// the remaining handlers still run.
    pub fn raise_event(&self, event: &Event) -> Dispatch {
        let name = event.name();
        let snapshot: Vec<Registration> = {
            let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            match handlers.get(name) {
                Some(list) => list.clone(),
                None => return Dispatch::Completed,
            }
        };

        let mut processed = false;
        for reg in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| (reg.handler)(event)));
            match outcome {
                Ok(Ok(HandlerResult::Continue)) => {},
                Ok(Ok(HandlerResult::Stop)) => return Dispatch::Stopped,
                Ok(Ok(HandlerResult::Processed)) => processed = true,
                Ok(Err(e)) => {
                    error!(
                        event = name,
                        account = %event.account,
                        handler = %reg.id,
                        error = %e,
                        "error while running an event handler"
                    );
                },
                Err(_) => {
                    error!(
                        event = name,
                        account = %event.account,
                        handler = %reg.id,
                        "event handler panicked"
                    );
                },
            }
        }
        if processed {
            Dispatch::Processed
        } else {
            Dispatch::Completed
        }
    }
}

/// Tracks the subscriptions of one consumer so they can be dropped together.
pub struct EventHelper {
    ged: Arc<Ged>,
    registered: Vec<(String, i32, HandlerId)>,
}

impl EventHelper {
    pub fn new(ged: Arc<Ged>) -> Self {
        Self {
            ged,
            registered: Vec::new(),
        }
    }

    pub fn register_event<F>(&mut self, event_name: &str, priority: i32, handler: F) -> HandlerId
    where
        F: Fn(&Event) -> anyhow::Result<HandlerResult> + Send + Sync + 'static,
    {
        let id = self.ged.register_event_handler(event_name, priority, handler);
        self.registered.push((event_name.to_string(), priority, id));
        id
    }

    pub fn unregister_events(&mut self) {
        for (name, priority, id) in self.registered.drain(..) {
            self.ged.remove_event_handler(&name, priority, id);
        }
    }
}

impl Drop for EventHelper {
    fn drop(&mut self) {
        self.unregister_events();
    }
}
