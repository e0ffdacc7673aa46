//! Fakes shared by unit tests.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::dispatcher::Dispatcher;
use crate::wire::{CodecError, Event, EventWriter, WriteError};

/// Writer whose every write fails like a broken pipe.
#[derive(Default)]
pub(crate) struct FailingWriter {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl EventWriter for FailingWriter {
    async fn write(&self, event: Event) -> Result<(), WriteError> {
        self.send(event)
    }

    fn send(&self, _event: Event) -> Result<(), WriteError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(WriteError::Transport(CodecError::Io(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "peer went away",
        ))))
    }
}

/// Writer whose writes never complete, like a peer that stopped reading.
#[derive(Default)]
pub(crate) struct StalledWriter {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl EventWriter for StalledWriter {
    async fn write(&self, _event: Event) -> Result<(), WriteError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }

    fn send(&self, _event: Event) -> Result<(), WriteError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fake remote runtime: reads what the host wrote and dispatches whatever
/// `respond` returns for it, as the reader task would.
pub(crate) fn spawn_peer<F>(
    dispatcher: Arc<Dispatcher>,
    mut rx: mpsc::UnboundedReceiver<Event>,
    respond: F,
) -> JoinHandle<Vec<Event>>
where
    F: Fn(&Event) -> Vec<Event> + Send + 'static,
{
    tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            for reply in respond(&event) {
                dispatcher.dispatch(&reply);
            }
            seen.push(event);
        }
        seen
    })
}

/// Poll until `cond` holds, yielding to other tasks in between.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    panic!("condition not met in time");
}
