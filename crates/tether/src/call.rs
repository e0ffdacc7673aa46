//! Synchronous calls: write a command, then wait for a named response event.
//!
//! Flow:
//! 1. Fail fast if the lifecycle token is already cancelled
//! 2. Register a one-shot listener for the expected event
//! 3. Write the command (on failure: drop the listener, return the error)
//! 4. Wait for the response or cancellation, whichever comes first
//!
//! Cancellation is observed in both steps 3 and 4, so a call stuck behind a
//! peer that stopped reading still unblocks.
//!
//! There is no built-in timeout. A call whose response never arrives waits
//! until its token is cancelled; callers that want a deadline derive a
//! time-bounded child token (see [`Object::call_with_timeout`]).
//!
//! Routing is by name only, so two calls waiting on the same event name are
//! both satisfied by one inbound message. Callers that need to tell responses
//! apart filter with [`synchronous_event_matching`].
//!
//! [`Object::call_with_timeout`]: crate::object::Object::call_with_timeout

use std::sync::Mutex;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{Dispatcher, ListenerAction, ListenerHandle};
use crate::error::BridgeError;
use crate::wire::{Event, EventWriter};

/// Removes a provisional listener when the call ends, however it ends.
///
/// Covers the paths the dispatcher does not: write failure, cancellation, and
/// the call future being dropped (e.g. by an outer `tokio::time::timeout`).
struct ListenerGuard<'a> {
    dispatcher: &'a Dispatcher,
    name: &'a str,
    handle: ListenerHandle,
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        self.dispatcher.remove_listener(self.name, self.handle);
    }
}

/// Write `event` and wait for the first `expected` event.
pub async fn synchronous_event(
    token: &CancellationToken,
    dispatcher: &Dispatcher,
    writer: &dyn EventWriter,
    event: Event,
    expected: &str,
) -> Result<Event, BridgeError> {
    synchronous_event_matching(token, dispatcher, writer, event, expected, |_| true).await
}

/// Like [`synchronous_event`], but only an `expected` event accepted by
/// `matches` completes the call. Others are left for other listeners.
pub async fn synchronous_event_matching<P>(
    token: &CancellationToken,
    dispatcher: &Dispatcher,
    writer: &dyn EventWriter,
    event: Event,
    expected: &str,
    matches: P,
) -> Result<Event, BridgeError>
where
    P: Fn(&Event) -> bool + Send + Sync + 'static,
{
    if token.is_cancelled() {
        return Err(BridgeError::Cancelled);
    }

    let (tx, rx) = oneshot::channel();
    let slot = Mutex::new(Some(tx));
    let handle = dispatcher.add_listener(expected, move |inbound| {
        if !matches(inbound) {
            return Ok(ListenerAction::Keep);
        }
        if let Ok(mut slot) = slot.lock()
            && let Some(tx) = slot.take()
        {
            // Receiver gone means the call was abandoned; nothing to deliver to.
            let _ = tx.send(inbound.clone());
        }
        Ok(ListenerAction::Remove)
    });
    let _guard = ListenerGuard {
        dispatcher,
        name: expected,
        handle,
    };

    tracing::trace!(command = %event.name, %expected, "Sending synchronous command");
    // The write can stall behind transport backpressure; cancellation still wins.
    tokio::select! {
        biased;
        _ = token.cancelled() => {
            tracing::debug!(%expected, "Synchronous call cancelled while writing");
            return Err(BridgeError::Cancelled);
        }
        written = writer.write(event) => written?,
    }

    tokio::select! {
        biased;
        response = rx => match response {
            Ok(response) => Ok(response),
            Err(_) => Err(BridgeError::ListenerRemoved(expected.to_string())),
        },
        _ = token.cancelled() => {
            tracing::debug!(%expected, "Synchronous call cancelled while waiting");
            Err(BridgeError::Cancelled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::Identifier;
    use crate::test_support::{FailingWriter, StalledWriter, spawn_peer, wait_until};
    use crate::wire::ChannelWriter;
    use std::sync::Arc;
    use std::time::Duration;

    fn echo_peer(command: &Event) -> Vec<Event> {
        match command.name.as_str() {
            "session.cmd.clear.cache" => vec![
                Event::new("session.event.cleared.cache")
                    .with_target(command.target_id.clone().unwrap()),
            ],
            _ => vec![],
        }
    }

    #[tokio::test]
    async fn returns_the_response_event() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (writer, rx) = ChannelWriter::new();
        let _peer = spawn_peer(Arc::clone(&dispatcher), rx, echo_peer);
        let token = CancellationToken::new();

        let response = synchronous_event(
            &token,
            &dispatcher,
            &writer,
            Event::new("session.cmd.clear.cache").with_target(Identifier::from("1")),
            "session.event.cleared.cache",
        )
        .await
        .unwrap();

        assert_eq!(response.name, "session.event.cleared.cache");
        assert_eq!(response.target_id, Some(Identifier::from("1")));
        assert_eq!(dispatcher.listener_count("session.event.cleared.cache"), 0);
    }

    #[tokio::test]
    async fn response_dispatched_before_write_returns_is_not_lost() {
        struct InstantReply {
            dispatcher: Arc<Dispatcher>,
        }

        #[async_trait::async_trait]
        impl EventWriter for InstantReply {
            async fn write(&self, event: Event) -> Result<(), crate::wire::WriteError> {
                self.send(event)
            }
            fn send(&self, _event: Event) -> Result<(), crate::wire::WriteError> {
                self.dispatcher.dispatch(&Event::new("pong"));
                Ok(())
            }
        }

        let dispatcher = Arc::new(Dispatcher::new());
        let writer = InstantReply {
            dispatcher: Arc::clone(&dispatcher),
        };
        let token = CancellationToken::new();

        let response = synchronous_event(&token, &dispatcher, &writer, Event::new("ping"), "pong")
            .await
            .unwrap();
        assert_eq!(response.name, "pong");
    }

    #[tokio::test]
    async fn already_cancelled_token_writes_nothing() {
        let dispatcher = Dispatcher::new();
        let writer = FailingWriter::default();
        let token = CancellationToken::new();
        token.cancel();

        let err = synchronous_event(&token, &dispatcher, &writer, Event::new("x"), "y")
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(writer.attempts.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(dispatcher.is_empty());
    }

    #[tokio::test]
    async fn write_failure_returns_error_and_removes_listener() {
        let dispatcher = Dispatcher::new();
        let writer = FailingWriter::default();
        let token = CancellationToken::new();

        let err = synchronous_event(&token, &dispatcher, &writer, Event::new("x"), "y")
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::Write(_)));
        assert_eq!(dispatcher.listener_count("y"), 0);
        assert_eq!(dispatcher.dispatch(&Event::new("y")).delivered, 0);
    }

    #[tokio::test]
    async fn cancellation_unblocks_and_cleans_up() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (writer, _rx) = ChannelWriter::new();
        let token = CancellationToken::new();

        let call = {
            let dispatcher = Arc::clone(&dispatcher);
            let token = token.clone();
            tokio::spawn(async move {
                synchronous_event(&token, &dispatcher, &writer, Event::new("x"), "never").await
            })
        };

        wait_until(|| dispatcher.listener_count("never") == 1).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .expect("call did not unblock")
            .unwrap();
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(dispatcher.listener_count("never"), 0);
        assert_eq!(dispatcher.dispatch(&Event::new("never")).delivered, 0);
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_stalled_write() {
        let dispatcher = Arc::new(Dispatcher::new());
        let writer = Arc::new(StalledWriter::default());
        let token = CancellationToken::new();

        let call = {
            let dispatcher = Arc::clone(&dispatcher);
            let writer = Arc::clone(&writer);
            let token = token.clone();
            tokio::spawn(async move {
                synchronous_event(&token, &dispatcher, &*writer, Event::new("x"), "never").await
            })
        };

        wait_until(|| writer.attempts.load(std::sync::atomic::Ordering::SeqCst) == 1).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .expect("stalled write did not unblock")
            .unwrap();
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(dispatcher.listener_count("never"), 0);
    }

    #[tokio::test]
    async fn dropped_call_future_does_not_leak_listener() {
        let dispatcher = Dispatcher::new();
        let (writer, _rx) = ChannelWriter::new();
        let token = CancellationToken::new();

        let result = tokio::time::timeout(
            Duration::from_millis(20),
            synchronous_event(&token, &dispatcher, &writer, Event::new("x"), "never"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(dispatcher.listener_count("never"), 0);
    }

    #[tokio::test]
    async fn calls_on_distinct_events_complete_independently() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (writer, _rx) = ChannelWriter::new();
        let writer = Arc::new(writer);
        let token = CancellationToken::new();

        let spawn_call = |expected: &'static str| {
            let dispatcher = Arc::clone(&dispatcher);
            let writer = Arc::clone(&writer);
            let token = token.clone();
            tokio::spawn(async move {
                synchronous_event(&token, &dispatcher, &*writer, Event::new("cmd"), expected).await
            })
        };
        let a = spawn_call("a.done");
        let b = spawn_call("b.done");

        wait_until(|| {
            dispatcher.listener_count("a.done") == 1 && dispatcher.listener_count("b.done") == 1
        })
        .await;

        dispatcher.dispatch(&Event::new("a.done"));
        let a = a.await.unwrap().unwrap();
        assert_eq!(a.name, "a.done");
        assert!(!b.is_finished());
        assert_eq!(dispatcher.listener_count("b.done"), 1);

        dispatcher.dispatch(&Event::new("b.done"));
        assert_eq!(b.await.unwrap().unwrap().name, "b.done");
    }

    #[tokio::test]
    async fn one_broadcast_satisfies_every_waiter_on_that_name() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (writer, _rx) = ChannelWriter::new();
        let writer = Arc::new(writer);
        let token = CancellationToken::new();

        let calls: Vec<_> = (0..2)
            .map(|_| {
                let dispatcher = Arc::clone(&dispatcher);
                let writer = Arc::clone(&writer);
                let token = token.clone();
                tokio::spawn(async move {
                    synchronous_event(&token, &dispatcher, &*writer, Event::new("cmd"), "done")
                        .await
                })
            })
            .collect();

        wait_until(|| dispatcher.listener_count("done") == 2).await;
        let report = dispatcher.dispatch(&Event::new("done").with_field("n", 1u32));
        assert_eq!(report.delivered, 2);
        assert_eq!(report.removed, 2);

        for call in calls {
            assert_eq!(call.await.unwrap().unwrap().field("n"), Some(&serde_json::json!(1)));
        }
    }

    #[tokio::test]
    async fn matching_call_ignores_other_targets() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (writer, _rx) = ChannelWriter::new();
        let token = CancellationToken::new();
        let mine = Identifier::from("2");

        let call = {
            let dispatcher = Arc::clone(&dispatcher);
            let mine = mine.clone();
            tokio::spawn(async move {
                synchronous_event_matching(
                    &token,
                    &dispatcher,
                    &writer,
                    Event::new("cmd"),
                    "done",
                    move |e| e.targets(&mine),
                )
                .await
            })
        };

        wait_until(|| dispatcher.listener_count("done") == 1).await;
        let report = dispatcher.dispatch(&Event::new("done").with_target(Identifier::from("1")));
        assert_eq!(report.removed, 0);
        assert_eq!(dispatcher.listener_count("done"), 1);

        dispatcher.dispatch(&Event::new("done").with_target(mine.clone()));
        assert_eq!(call.await.unwrap().unwrap().target_id, Some(mine));
    }

    #[tokio::test]
    async fn externally_removed_listener_is_reported() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (writer, _rx) = ChannelWriter::new();
        let token = CancellationToken::new();

        let call = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                synchronous_event(&token, &dispatcher, &writer, Event::new("cmd"), "done").await
            })
        };

        // Drop the registry entry out from under the call: the handler (and
        // its sender) goes away, which the call observes as a closed channel.
        wait_until(|| dispatcher.listener_count("done") == 1).await;
        let handle = crate::dispatcher::ListenerHandle::for_tests(0);
        dispatcher.remove_listener("done", handle);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::ListenerRemoved(name) if name == "done"));
    }
}
