//! In-process router for inbound events.
//!
//! Listeners are keyed by event name only. Correlating a message with a
//! particular object is the handler's job: it inspects `target_id` /
//! `callback_id` and ignores messages that are not meant for it.
//!
//! Delivery runs on the caller (the reader task), in registration order. The
//! registry lock is released before any handler runs, so handlers may register
//! or remove listeners themselves.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;

use crate::wire::Event;

/// What a listener wants after it has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenerAction {
    #[default]
    Keep,
    Remove,
}

/// Failure inside a single handler. Isolated by the dispatcher.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct HandlerError(Box<dyn std::error::Error + Send + Sync>);

impl HandlerError {
    pub fn new(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(err.into())
    }

    pub fn msg(message: impl Into<String>) -> Self {
        Self(message.into().into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err)
    }
}

impl From<crate::wire::WriteError> for HandlerError {
    fn from(err: crate::wire::WriteError) -> Self {
        Self::new(err)
    }
}

pub type HandlerResult = Result<ListenerAction, HandlerError>;

pub type Handler = Arc<dyn Fn(&Event) -> HandlerResult + Send + Sync>;

/// Opaque registration handle, unique per dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

#[cfg(test)]
impl ListenerHandle {
    pub(crate) fn for_tests(n: u64) -> Self {
        Self(n)
    }
}

struct Listener {
    handle: ListenerHandle,
    handler: Handler,
    removed: AtomicBool,
}

/// Why a listener did not complete normally.
#[derive(Debug)]
pub enum HandlerFailure {
    Error {
        handle: ListenerHandle,
        error: HandlerError,
    },
    Panicked {
        handle: ListenerHandle,
        message: String,
    },
}

impl HandlerFailure {
    pub fn handle(&self) -> ListenerHandle {
        match self {
            Self::Error { handle, .. } | Self::Panicked { handle, .. } => *handle,
        }
    }
}

impl std::fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error { error, .. } => write!(f, "handler failed: {error}"),
            Self::Panicked { message, .. } => write!(f, "handler panicked: {message}"),
        }
    }
}

/// Outcome of delivering one event.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Listeners that were invoked.
    pub delivered: usize,
    /// Listeners that asked to be removed and were.
    pub removed: usize,
    pub failures: Vec<HandlerFailure>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Default)]
pub struct Dispatcher {
    listeners: DashMap<String, Vec<Arc<Listener>>>,
    next_handle: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener<F>(&self, name: impl Into<String>, handler: F) -> ListenerHandle
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.add_handler(name, Arc::new(handler))
    }

    pub fn add_handler(&self, name: impl Into<String>, handler: Handler) -> ListenerHandle {
        let handle = ListenerHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let name = name.into();
        tracing::trace!(event = %name, ?handle, "Adding listener");
        self.listeners
            .entry(name)
            .or_default()
            .push(Arc::new(Listener {
                handle,
                handler,
                removed: AtomicBool::new(false),
            }));
        handle
    }

    /// Remove a listener. Unknown or already-removed handles are ignored.
    pub fn remove_listener(&self, name: &str, handle: ListenerHandle) {
        let now_empty = match self.listeners.get_mut(name) {
            Some(mut entry) => {
                entry.retain(|l| {
                    if l.handle == handle {
                        l.removed.store(true, Ordering::Release);
                        false
                    } else {
                        true
                    }
                });
                entry.is_empty()
            }
            None => return,
        };
        if now_empty {
            self.listeners.remove_if(name, |_, v| v.is_empty());
        }
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners.get(name).map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.iter().all(|entry| entry.value().is_empty())
    }

    /// Deliver `event` to every listener registered for its name.
    ///
    /// No listeners is not an error; the report is simply empty.
    pub fn dispatch(&self, event: &Event) -> DispatchReport {
        let snapshot: Vec<Arc<Listener>> = match self.listeners.get(&event.name) {
            Some(entry) => entry.value().clone(),
            None => return DispatchReport::default(),
        };

        let mut report = DispatchReport::default();
        for listener in snapshot {
            // Removed by an earlier handler in this same dispatch, or concurrently.
            if listener.removed.load(Ordering::Acquire) {
                continue;
            }

            report.delivered += 1;
            let outcome = catch_unwind(AssertUnwindSafe(|| (listener.handler)(event)));
            match outcome {
                Ok(Ok(ListenerAction::Keep)) => {}
                Ok(Ok(ListenerAction::Remove)) => {
                    self.remove_listener(&event.name, listener.handle);
                    report.removed += 1;
                }
                Ok(Err(error)) => {
                    report.failures.push(HandlerFailure::Error {
                        handle: listener.handle,
                        error,
                    });
                }
                Err(payload) => {
                    report.failures.push(HandlerFailure::Panicked {
                        handle: listener.handle,
                        message: panic_message(payload.as_ref()),
                    });
                }
            }
        }
        report
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
