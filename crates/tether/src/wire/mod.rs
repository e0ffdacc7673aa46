//! Wire layer for host-runtime communication.
//!
//! - **event**: the message type shared by both directions
//! - **codec**: newline-delimited JSON framing for AsyncRead/AsyncWrite
//! - **writer**: the outbound half, the only code that touches the transport

pub mod codec;
pub mod event;
pub mod writer;

pub use codec::{CodecError, EventCodec, InboundFrame};
pub use event::Event;
pub use writer::{ChannelWriter, EventWriter, FramedEventWriter, WriteError};
