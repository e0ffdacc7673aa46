//! Identifiers for addressable remote objects.
//!
//! Allocation is monotonic: an identifier is never handed out twice by the same
//! generator, so a disposed object's id cannot be picked up by a new one.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Opaque identifier of an object living on the other side of the bridge.
///
/// Also used for correlation ids received from the peer (`callbackId`), which
/// the bridge never mints itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mints process-unique identifiers.
///
/// Lock-free; safe to share behind an `Arc` across tasks.
#[derive(Debug, Default)]
pub struct IdentifierGenerator {
    prefix: Option<String>,
    counter: AtomicU64,
}

impl IdentifierGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generator whose ids are `{prefix}{n}`, for keeping several bridges in one
    /// process apart.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> Identifier {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        match &self.prefix {
            Some(prefix) => Identifier(format!("{prefix}{n}")),
            None => Identifier(n.to_string()),
        }
    }
}
