//! Outbound side of the bridge: the only code that touches the wire.
//!
//! Writes are never retried. After a partial write the peer's state is unknown,
//! so the error goes straight back to the caller.

use async_trait::async_trait;
use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use super::codec::{CodecError, EventCodec};
use super::event::Event;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("writer is closed")]
    Closed,
    #[error(transparent)]
    Transport(#[from] CodecError),
}

/// Sends events to the peer.
///
/// Implementations must be safe to call from many tasks at once and must never
/// interleave two messages on the wire.
#[async_trait]
pub trait EventWriter: Send + Sync {
    /// Transmit one event, returning once it is on the wire.
    async fn write(&self, event: Event) -> Result<(), WriteError>;

    /// Queue one event without waiting.
    ///
    /// For synchronous contexts such as dispatch handlers. Only queueing
    /// failures are returned; transmission failures are reported out of band.
    fn send(&self, event: Event) -> Result<(), WriteError>;
}

struct Outbound {
    event: Event,
    ack: Option<oneshot::Sender<Result<(), WriteError>>>,
}

/// Writer over any byte sink, framing with [`EventCodec`].
///
/// A single pump task owns the sink and writes queued events in FIFO order, so
/// concurrent callers never interleave frames.
pub struct FramedEventWriter {
    tx: mpsc::UnboundedSender<Outbound>,
    closed: CancellationToken,
}

impl FramedEventWriter {
    /// Spawn the pump for `io`. Must be called inside a tokio runtime.
    ///
    /// Cancelling `closed` (or calling [`close`](Self::close)) stops the pump;
    /// events still queued at that point fail with [`WriteError::Closed`].
    pub fn spawn<W>(io: W, codec: EventCodec, closed: CancellationToken) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = FramedWrite::new(io, codec);
        let task = tokio::spawn(run_pump(sink, rx, closed.clone()));
        (Self { tx, closed }, task)
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    fn enqueue(&self, outbound: Outbound) -> Result<(), WriteError> {
        if self.closed.is_cancelled() {
            return Err(WriteError::Closed);
        }
        self.tx.send(outbound).map_err(|_| WriteError::Closed)
    }
}

#[async_trait]
impl EventWriter for FramedEventWriter {
    async fn write(&self, event: Event) -> Result<(), WriteError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.enqueue(Outbound {
            event,
            ack: Some(ack_tx),
        })?;
        ack_rx.await.unwrap_or(Err(WriteError::Closed))
    }

    fn send(&self, event: Event) -> Result<(), WriteError> {
        self.enqueue(Outbound { event, ack: None })
    }
}

async fn run_pump<W>(
    mut sink: FramedWrite<W, EventCodec>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send,
{
    let mut interrupted = false;
    loop {
        let next = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            next = rx.recv() => next,
        };
        let Some(Outbound { event, ack }) = next else {
            break;
        };

        let name = event.name.clone();
        tracing::trace!(event = %name, target_id = ?event.target_id, "Writing event");
        let result = tokio::select! {
            biased;
            _ = closed.cancelled() => {
                // The frame may be partly on the wire; the stream is unusable either way.
                tracing::debug!(event = %name, "Writer closed while a write was in flight");
                if let Some(ack) = ack {
                    let _ = ack.send(Err(WriteError::Closed));
                }
                interrupted = true;
                break;
            }
            result = sink.send(event) => result.map_err(WriteError::from),
        };

        match ack {
            Some(ack) => {
                // Caller may have given up waiting; the frame is on the wire either way.
                let _ = ack.send(result);
            }
            None => {
                if let Err(e) = result {
                    tracing::warn!(event = %name, error = %e, "Failed to write queued event");
                }
            }
        }
    }

    rx.close();
    let mut dropped = 0usize;
    while let Ok(Outbound { ack, .. }) = rx.try_recv() {
        dropped += 1;
        if let Some(ack) = ack {
            let _ = ack.send(Err(WriteError::Closed));
        }
    }
    if dropped > 0 {
        tracing::debug!(dropped, "Writer closed with events still queued");
    }

    // Closing flushes, which would block again behind the stalled peer.
    if !interrupted && let Err(e) = sink.close().await {
        tracing::debug!(error = %e, "Error closing transport sink");
    }
    tracing::debug!("Writer pump exiting");
}

/// Writer that hands events to an in-process channel.
///
/// Useful when the transport lives elsewhere, or to drive a bridge without a
/// real peer.
#[derive(Clone)]
pub struct ChannelWriter {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelWriter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventWriter for ChannelWriter {
    async fn write(&self, event: Event) -> Result<(), WriteError> {
        self.send(event)
    }

    fn send(&self, event: Event) -> Result<(), WriteError> {
        self.tx.send(event).map_err(|_| WriteError::Closed)
    }
}
