//! Bridge: wires a transport to the dispatcher and hands out objects.
//!
//! One reader task pulls frames off the transport and dispatches them in
//! receive order. Any number of tasks write and call through the shared
//! writer. Shutting the bridge down cancels the root token, which closes every
//! object it created and unblocks every pending call.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::dispatcher::{Dispatcher, HandlerResult, ListenerHandle};
use crate::error::BridgeError;
use crate::identifier::IdentifierGenerator;
use crate::object::Object;
use crate::session::Session;
use crate::wire::{EventCodec, EventWriter, FramedEventWriter};

pub struct Bridge {
    token: CancellationToken,
    dispatcher: Arc<Dispatcher>,
    writer: Arc<dyn EventWriter>,
    ids: Arc<IdentifierGenerator>,
    config: BridgeConfig,
    /// Writer pump spawned by [`connect`](Self::connect), taken by
    /// [`shutdown_and_wait`](Self::shutdown_and_wait).
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl Bridge {
    /// Build a bridge around an existing writer.
    ///
    /// Nothing reads from the peer until inbound events are fed to
    /// [`dispatcher`](Self::dispatcher), either by [`run_reader`] or by hand.
    pub fn new(config: BridgeConfig, writer: Arc<dyn EventWriter>) -> Self {
        Self::with_token(config, writer, CancellationToken::new())
    }

    /// Connect over a byte transport and spawn the reader and writer tasks.
    ///
    /// Must be called inside a tokio runtime. The returned handle resolves when
    /// the reader stops: `Ok` on shutdown or peer EOF, `Err` on a framing or
    /// transport error. The writer task is awaited through
    /// [`shutdown_and_wait`](Self::shutdown_and_wait).
    pub fn connect<R, W>(
        config: BridgeConfig,
        reader: R,
        writer: W,
    ) -> (Self, JoinHandle<Result<(), BridgeError>>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let token = CancellationToken::new();
        let (framed, pump) = FramedEventWriter::spawn(
            writer,
            EventCodec::with_max_length(config.max_frame_length),
            token.child_token(),
        );
        let bridge = Self::with_token(config, Arc::new(framed), token);
        if let Ok(mut slot) = bridge.writer_task.lock() {
            *slot = Some(pump);
        }

        let reader_task = tokio::spawn(run_reader(
            reader,
            Arc::clone(&bridge.dispatcher),
            bridge.token.clone(),
            bridge.config.clone(),
        ));
        (bridge, reader_task)
    }

    fn with_token(
        config: BridgeConfig,
        writer: Arc<dyn EventWriter>,
        token: CancellationToken,
    ) -> Self {
        let ids = match &config.id_prefix {
            Some(prefix) => IdentifierGenerator::with_prefix(prefix.clone()),
            None => IdentifierGenerator::new(),
        };
        tracing::debug!(
            version = crate::VERSION,
            max_frame_length = config.max_frame_length,
            call_timeout = ?config.call_timeout,
            "Bridge created"
        );
        Self {
            token,
            dispatcher: Arc::new(Dispatcher::new()),
            writer,
            ids: Arc::new(ids),
            config,
            writer_task: Mutex::new(None),
        }
    }

    /// A new object with a fresh identifier, closed when the bridge shuts down.
    pub fn new_object(&self) -> Object {
        let object = Object::new(
            &self.token,
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.writer),
            self.ids.next(),
        )
        .with_call_timeout(self.config.call_timeout);
        tracing::debug!(id = %object.id(), "Created object");
        object
    }

    pub fn new_session(&self) -> Session {
        Session::new(self.new_object())
    }

    /// Listen for events that are not tied to any object.
    pub fn on<F>(&self, name: impl Into<String>, handler: F) -> ListenerHandle
    where
        F: Fn(&crate::wire::Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.dispatcher.add_listener(name, handler)
    }

    pub fn off(&self, name: &str, handle: ListenerHandle) {
        self.dispatcher.remove_listener(name, handle);
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn writer(&self) -> &Arc<dyn EventWriter> {
        &self.writer
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Cancel the root token. Idempotent.
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("Shutting down bridge");
        }
        self.token.cancel();
    }

    /// Shut down, then wait for the writer task to exit.
    ///
    /// Returns at once for bridges built with [`new`](Self::new), and on every
    /// call after the first.
    pub async fn shutdown_and_wait(&self) {
        self.shutdown();
        let task = self.writer_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::warn!(error = %e, "Writer task failed");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("config", &self.config)
            .field("shut_down", &self.token.is_cancelled())
            .finish()
    }
}

/// Read frames from `reader` and dispatch them until the token is cancelled,
/// the peer closes the stream, or the transport fails.
///
/// Malformed frames and listener failures are logged and skipped. EOF and
/// transport errors cancel `token`: with the peer gone no pending call can be
/// answered.
pub async fn run_reader<R>(
    reader: R,
    dispatcher: Arc<Dispatcher>,
    token: CancellationToken,
    config: BridgeConfig,
) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut frames = FramedRead::new(reader, EventCodec::with_max_length(config.max_frame_length));

    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::debug!("Reader stopping: bridge shut down");
                return Ok(());
            }
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(Ok(event))) => {
                tracing::trace!(event = %event.name, target_id = ?event.target_id, "Dispatching event");
                let report = dispatcher.dispatch(&event);
                for failure in &report.failures {
                    tracing::warn!(
                        event = %event.name,
                        target_id = ?event.target_id,
                        %failure,
                        "Listener failed"
                    );
                }
            }
            Some(Ok(Err(e))) => {
                tracing::warn!(error = %e, "Dropping malformed frame");
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Transport error, stopping reader");
                token.cancel();
                return Err(e.into());
            }
            None => {
                tracing::info!("Peer closed the connection");
                token.cancel();
                return Ok(());
            }
        }
    }
}
