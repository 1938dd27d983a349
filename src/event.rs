//! In-process event plumbing.
//!
//! Every event kind (mastership, replica info, device, link) flows through
//! the same three pieces:
//!
//! - [`Event`]: a `{kind, subject, time}` record.
//! - [`ListenerRegistry`]: the set of [`EventListener`]s for one event type.
//!   Delivery is synchronous on the posting thread and each listener is
//!   isolated: an error or a panic in one callback is logged and counted,
//!   and the remaining listeners still run.
//! - [`EventDispatcher`]: routes a posted event to the registry registered
//!   as the sink for its type.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::{debug, warn};

use crate::errors::ControlError;
use crate::metrics::LISTENER_FAILURES_TOTAL;

/// A timestamped notification about a subject.
pub trait Event: fmt::Debug + Clone + Send + Sync + 'static {
    /// Discriminant describing what happened.
    type Kind: fmt::Debug + Copy + PartialEq + Send + Sync;
    /// What the event is about.
    type Subject: fmt::Debug;

    /// Name used in logs and metric labels.
    const NAME: &'static str;

    fn kind(&self) -> Self::Kind;
    fn subject(&self) -> &Self::Subject;
    fn time(&self) -> DateTime<Utc>;
}

/// Callback interface for events of type `E`.
///
/// Callbacks run on the thread that posted the event and must not block.
pub trait EventListener<E>: Send + Sync {
    /// Handle one event. An `Err` is logged and does not affect other listeners.
    fn event(&self, event: &E) -> anyhow::Result<()>;

    /// Return `false` to skip an event without invoking [`EventListener::event`].
    fn is_relevant(&self, _event: &E) -> bool {
        true
    }

    /// Human-readable name for failure reports.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<E, F> EventListener<E> for F
where
    F: Fn(&E) -> anyhow::Result<()> + Send + Sync,
{
    fn event(&self, event: &E) -> anyhow::Result<()> {
        self(event)
    }
}

fn same_listener<E>(a: &Arc<dyn EventListener<E>>, b: &Arc<dyn EventListener<E>>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Listeners for one event type.
pub struct ListenerRegistry<E> {
    listeners: RwLock<Vec<Arc<dyn EventListener<E>>>>,
}

impl<E: Event> ListenerRegistry<E> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener. Adding the same listener twice is a no-op.
    pub fn add(&self, listener: Arc<dyn EventListener<E>>) {
        let mut listeners = self.listeners.write().expect("rwlock poisoned");
        if !listeners.iter().any(|l| same_listener(l, &listener)) {
            listeners.push(listener);
        }
    }

    /// Unregister a listener. Returns whether it was registered.
    pub fn remove(&self, listener: &Arc<dyn EventListener<E>>) -> bool {
        let mut listeners = self.listeners.write().expect("rwlock poisoned");
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().expect("rwlock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every relevant listener, in registration order.
    ///
    /// Returns the number of listeners that failed.
    pub fn process(&self, event: &E) -> usize {
        // Snapshot so callbacks may add or remove listeners.
        let listeners: Vec<_> = self.listeners.read().expect("rwlock poisoned").clone();
        let mut failures = 0;
        for listener in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                if listener.is_relevant(event) {
                    listener.event(event)
                } else {
                    Ok(())
                }
            }));
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{e:#}"),
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };
            failures += 1;
            let err = ControlError::ListenerFailure {
                listener: listener.name().to_string(),
                message,
            };
            counter!(LISTENER_FAILURES_TOTAL, "event" => E::NAME).increment(1);
            warn!(
                event = E::NAME,
                kind = ?event.kind(),
                code = err.code(),
                error = %err,
                "Listener failed"
            );
        }
        failures
    }
}

impl<E: Event> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Synchronous pub/sub bus keyed by event type.
pub struct EventDispatcher {
    sinks: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            sinks: RwLock::new(HashMap::new()),
        }
    }

    /// Route events of type `E` to `registry`, replacing any previous sink.
    pub fn add_sink<E: Event>(&self, registry: Arc<ListenerRegistry<E>>) {
        let mut sinks = self.sinks.write().expect("rwlock poisoned");
        sinks.insert(TypeId::of::<E>(), registry);
    }

    pub fn remove_sink<E: Event>(&self) {
        let mut sinks = self.sinks.write().expect("rwlock poisoned");
        sinks.remove(&TypeId::of::<E>());
    }

    /// The registry currently receiving events of type `E`.
    pub fn sink<E: Event>(&self) -> Option<Arc<ListenerRegistry<E>>> {
        let sinks = self.sinks.read().expect("rwlock poisoned");
        let sink = sinks.get(&TypeId::of::<E>())?.clone();
        sink.downcast::<ListenerRegistry<E>>().ok()
    }

    /// Deliver `event` to its sink on the calling thread.
    pub fn post<E: Event>(&self, event: E) {
        match self.sink::<E>() {
            Some(registry) => {
                registry.process(&event);
            }
            None => debug!(event = E::NAME, kind = ?event.kind(), "No sink registered, dropping event"),
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
