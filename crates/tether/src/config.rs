//! Bridge configuration.

use std::time::Duration;

use crate::wire::codec::DEFAULT_MAX_FRAME_LENGTH;

/// Settings shared by everything a [`Bridge`](crate::bridge::Bridge) creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Longest accepted frame in bytes, in either direction.
    pub max_frame_length: usize,
    /// Deadline for every synchronous call. `None` waits until the object closes.
    pub call_timeout: Option<Duration>,
    /// Prepended to every generated identifier.
    pub id_prefix: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            call_timeout: None,
            id_prefix: None,
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides from the environment:
    ///
    /// - `TETHER_MAX_FRAME_LENGTH`: bytes
    /// - `TETHER_CALL_TIMEOUT_MS`: milliseconds, `0` disables the deadline
    /// - `TETHER_ID_PREFIX`
    ///
    /// Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup("TETHER_MAX_FRAME_LENGTH") {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.max_frame_length = n,
                _ => tracing::warn!(
                    value = %raw,
                    default = config.max_frame_length,
                    "Invalid TETHER_MAX_FRAME_LENGTH, using default"
                ),
            }
        }

        if let Some(raw) = lookup("TETHER_CALL_TIMEOUT_MS") {
            match raw.trim().parse::<u64>() {
                Ok(0) => config.call_timeout = None,
                Ok(ms) => config.call_timeout = Some(Duration::from_millis(ms)),
                Err(_) => tracing::warn!(
                    value = %raw,
                    "Invalid TETHER_CALL_TIMEOUT_MS, calls will not time out"
                ),
            }
        }

        if let Some(prefix) = lookup("TETHER_ID_PREFIX")
            && !prefix.is_empty()
        {
            config.id_prefix = Some(prefix);
        }

        config
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = Some(prefix.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = BridgeConfig::new();
        assert_eq!(config.max_frame_length, 16 * 1024 * 1024);
        assert_eq!(config.call_timeout, None);
        assert_eq!(config.id_prefix, None);
        assert_eq!(BridgeConfig::from_lookup(lookup(&[])), config);
    }

    #[test]
    fn builder_overrides() {
        let config = BridgeConfig::new()
            .with_max_frame_length(4096)
            .with_call_timeout(Some(Duration::from_secs(5)))
            .with_id_prefix("w");
        assert_eq!(config.max_frame_length, 4096);
        assert_eq!(config.call_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.id_prefix.as_deref(), Some("w"));
    }

    #[test]
    fn reads_environment() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("TETHER_MAX_FRAME_LENGTH", "1024"),
            ("TETHER_CALL_TIMEOUT_MS", "250"),
            ("TETHER_ID_PREFIX", "host-"),
        ]));
        assert_eq!(config.max_frame_length, 1024);
        assert_eq!(config.call_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.id_prefix.as_deref(), Some("host-"));
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("TETHER_MAX_FRAME_LENGTH", "lots"),
            ("TETHER_CALL_TIMEOUT_MS", "-3"),
            ("TETHER_ID_PREFIX", ""),
        ]));
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn zero_timeout_disables_deadline() {
        let config = BridgeConfig::from_lookup(lookup(&[("TETHER_CALL_TIMEOUT_MS", "0")]));
        assert_eq!(config.call_timeout, None);
    }
}
