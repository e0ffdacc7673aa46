//! tether: drive a child UI runtime over a duplex message channel.
//!
//! The host sends commands and receives events as newline-delimited JSON.
//! Remote entities are addressed by [`Identifier`]; a [`Bridge`] hands out
//! [`Object`]s and [`Session`]s bound to its lifecycle.

mod call;
mod identifier;

pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod object;
pub mod session;
pub mod wire;

#[cfg(test)]
mod test_support;

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use bridge::{Bridge, run_reader};
pub use call::{synchronous_event, synchronous_event_matching};
pub use config::BridgeConfig;
pub use dispatcher::{
    DispatchReport, Dispatcher, Handler, HandlerError, HandlerFailure, HandlerResult,
    ListenerAction, ListenerHandle,
};
pub use error::BridgeError;
pub use identifier::{Identifier, IdentifierGenerator};
pub use logging::init_tracing;
pub use object::Object;
pub use session::{
    BeforeRequestDecision, FilterOptions, ProxyOptions, Session, SessionCookie, SessionError,
};
pub use tokio_util::sync::CancellationToken;
pub use wire::{
    ChannelWriter, CodecError, Event, EventCodec, EventWriter, FramedEventWriter, InboundFrame,
    WriteError,
};
