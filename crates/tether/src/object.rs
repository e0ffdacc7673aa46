//! Addressable object: the base every remote-backed entity embeds.
//!
//! An object holds its identifier, a lifecycle token derived from its parent
//! (usually the bridge's shutdown token), and shared handles to the dispatcher
//! and writer. Closing it cancels the token exactly once, which unblocks every
//! synchronous call still waiting on the object.
//!
//! Listeners are not unregistered on close. Handlers registered through an
//! object must tolerate outliving it.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::call::{synchronous_event, synchronous_event_matching};
use crate::dispatcher::{Dispatcher, HandlerResult, ListenerAction, ListenerHandle};
use crate::error::BridgeError;
use crate::identifier::Identifier;
use crate::wire::{Event, EventWriter};

pub struct Object {
    id: Identifier,
    token: CancellationToken,
    dispatcher: Arc<Dispatcher>,
    writer: Arc<dyn EventWriter>,
    call_timeout: Option<Duration>,
}

impl Object {
    pub fn new(
        parent: &CancellationToken,
        dispatcher: Arc<Dispatcher>,
        writer: Arc<dyn EventWriter>,
        id: Identifier,
    ) -> Self {
        Self {
            id,
            token: parent.child_token(),
            dispatcher,
            writer,
            call_timeout: None,
        }
    }

    /// Bound every [`call`](Self::call) on this object by `timeout`.
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn id(&self) -> &Identifier {
        &self.id
    }

    /// The object's lifecycle token. Cancelling it closes the object.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn writer(&self) -> &Arc<dyn EventWriter> {
        &self.writer
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fail fast once the object is closed.
    pub fn ensure_alive(&self) -> Result<(), BridgeError> {
        if self.token.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }
        Ok(())
    }

    /// Close the object. Idempotent.
    pub fn close(&self) {
        if !self.token.is_cancelled() {
            tracing::debug!(id = %self.id, "Closing object");
        }
        self.token.cancel();
    }

    /// Register a listener for `name`. The handler sees every event with that
    /// name and filters for itself.
    pub fn on<F>(&self, name: impl Into<String>, handler: F) -> ListenerHandle
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.dispatcher.add_listener(name, handler)
    }

    /// Register a listener that only sees `name` events addressed to this object.
    pub fn on_targeted<F>(&self, name: impl Into<String>, handler: F) -> ListenerHandle
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        let id = self.id.clone();
        self.dispatcher.add_listener(name, move |event| {
            if !event.targets(&id) {
                return Ok(ListenerAction::Keep);
            }
            handler(event)
        })
    }

    pub fn off(&self, name: &str, handle: ListenerHandle) {
        self.dispatcher.remove_listener(name, handle);
    }

    /// Write a fire-and-forget command.
    pub async fn write(&self, event: Event) -> Result<(), BridgeError> {
        self.ensure_alive()?;
        self.writer.write(event).await?;
        Ok(())
    }

    /// Write `event` and wait for the first `expected` event, bounded by the
    /// object's configured call timeout if any.
    pub async fn call(&self, event: Event, expected: &str) -> Result<Event, BridgeError> {
        match self.call_timeout {
            Some(timeout) => self.call_with_timeout(event, expected, timeout).await,
            None => {
                synchronous_event(
                    &self.token,
                    &self.dispatcher,
                    self.writer.as_ref(),
                    event,
                    expected,
                )
                .await
            }
        }
    }

    /// Like [`call`](Self::call), but only an `expected` event addressed to this
    /// object completes it.
    pub async fn call_targeted(&self, event: Event, expected: &str) -> Result<Event, BridgeError> {
        let id = self.id.clone();
        let bounded = self.derive_token();
        let call = synchronous_event_matching(
            &bounded.token,
            &self.dispatcher,
            self.writer.as_ref(),
            event,
            expected,
            move |e| e.targets(&id),
        );
        bounded.run(call).await
    }

    /// Write `event` and wait at most `timeout` for `expected`.
    ///
    /// The deadline is a child of the object's token, so closing the object
    /// still reports [`BridgeError::Cancelled`].
    pub async fn call_with_timeout(
        &self,
        event: Event,
        expected: &str,
        timeout: Duration,
    ) -> Result<Event, BridgeError> {
        let bounded = BoundedToken {
            token: self.token.child_token(),
            timeout: Some(timeout),
        };
        let call = synchronous_event(
            &bounded.token,
            &self.dispatcher,
            self.writer.as_ref(),
            event,
            expected,
        );
        bounded.run(call).await
    }

    fn derive_token(&self) -> BoundedToken {
        BoundedToken {
            token: self.token.child_token(),
            timeout: self.call_timeout,
        }
    }
}

/// Child token with an optional deadline.
struct BoundedToken {
    token: CancellationToken,
    timeout: Option<Duration>,
}

impl BoundedToken {
    async fn run<F>(&self, call: F) -> Result<Event, BridgeError>
    where
        F: Future<Output = Result<Event, BridgeError>>,
    {
        let Some(timeout) = self.timeout else {
            return call.await;
        };

        tokio::pin!(call);
        tokio::select! {
            biased;
            result = &mut call => result,
            _ = tokio::time::sleep(timeout) => {
                self.token.cancel();
                // The call observes the cancelled token and unregisters its listener.
                match call.await {
                    Err(BridgeError::Cancelled) => Err(BridgeError::Timeout(timeout)),
                    other => other,
                }
            }
        }
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("id", &self.id)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}
