//! Errors surfaced by bridge operations.

use std::time::Duration;

use crate::wire::{CodecError, WriteError};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The object's lifecycle token was cancelled before or during the call.
    #[error("operation cancelled: object is closed")]
    Cancelled,
    /// A deadline derived from the lifecycle token expired.
    #[error("no response within {0:?}")]
    Timeout(Duration),
    /// The response listener was removed by someone else before it fired.
    #[error("listener for {0} was removed before a response arrived")]
    ListenerRemoved(String),
    #[error("write failed: {0}")]
    Write(#[from] WriteError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl BridgeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
