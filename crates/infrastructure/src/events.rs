//! Task queue notifications.
//!
//! Handlers run synchronously on the settling task, outside the queue lock.
//! A panicking handler is logged and skipped; it never reaches the queue.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use cadence_errors::CadenceError;
use tracing::warn;

use crate::task_queue::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TaskComplete,
    TaskError,
    Idle,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::TaskComplete => write!(f, "task_complete"),
            EventKind::TaskError => write!(f, "task_error"),
            EventKind::Idle => write!(f, "idle"),
        }
    }
}

#[derive(Debug)]
pub enum QueueEvent<'a, T> {
    TaskComplete { id: TaskId, result: &'a T },
    TaskError { id: TaskId, error: &'a CadenceError },
    Idle,
}

impl<T> QueueEvent<'_, T> {
    pub fn kind(&self) -> EventKind {
        match self {
            QueueEvent::TaskComplete { .. } => EventKind::TaskComplete,
            QueueEvent::TaskError { .. } => EventKind::TaskError,
            QueueEvent::Idle => EventKind::Idle,
        }
    }
}

pub type EventHandler<T> = Arc<dyn Fn(&QueueEvent<'_, T>) + Send + Sync>;

struct Registration<T> {
    id: u64,
    kind: EventKind,
    handler: EventHandler<T>,
}

struct Handlers<T> {
    registrations: Mutex<Vec<Registration<T>>>,
    next_id: AtomicU64,
}

impl<T> Handlers<T> {
    fn lock(&self) -> MutexGuard<'_, Vec<Registration<T>>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct EventBus<T> {
    handlers: Arc<Handlers<T>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self {
            handlers: Arc::new(Handlers {
                registrations: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }
}

impl<T> EventBus<T> {
    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }
}

impl<T> fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handler_count())
            .finish()
    }
}

impl<T: 'static> EventBus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for events of `kind`. Past events are not replayed.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&QueueEvent<'_, T>) + Send + Sync + 'static,
    {
        let id = self.handlers.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().push(Registration {
            id,
            kind,
            handler: Arc::new(handler),
        });

        let handlers: Weak<Handlers<T>> = Arc::downgrade(&self.handlers);
        Subscription {
            kind,
            remove: Some(Box::new(move || {
                if let Some(handlers) = handlers.upgrade() {
                    handlers.lock().retain(|registration| registration.id != id);
                }
            })),
        }
    }

    pub fn emit(&self, event: &QueueEvent<'_, T>) {
        let kind = event.kind();
        let matching: Vec<EventHandler<T>> = self
            .handlers
            .lock()
            .iter()
            .filter(|registration| registration.kind == kind)
            .map(|registration| registration.handler.clone())
            .collect();

        for handler in matching {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                warn!(
                    event = %kind,
                    panic = panic_message(panic.as_ref()),
                    "Queue event handler panicked"
                );
            }
        }
    }
}

/// Keeps a handler registered. Dropping it unsubscribes; call
/// [`Subscription::detach`] to keep the handler for the bus's lifetime.
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    kind: EventKind,
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }

    pub fn detach(mut self) {
        self.remove = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("active", &self.remove.is_some())
            .finish()
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
