//! Protocol configuration.
//!
//! [`ProtocolConfig`] can be built in code or loaded from JSON:
//!
//! ```
//! use signalwire::config::ProtocolConfig;
//! use std::time::Duration;
//!
//! let config = ProtocolConfig::from_json(r#"{ "timeout_ms": 2500 }"#).unwrap();
//! assert_eq!(config.timeout, Some(Duration::from_millis(2500)));
//! assert_eq!(config.max_concurrent_signals, 256);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default timeout for pending signal I/O.
pub const DEFAULT_TIMEOUT: Option<Duration> = Some(Duration::from_secs(10));

/// Sentinel for "wait forever".
pub const NO_TIMEOUT: Option<Duration> = None;

/// Default bound on waiting for in-flight signals during deactivation.
pub const DEFAULT_DEACTIVATION_GRACE: Duration = Duration::from_secs(10);

/// Default maximum concurrently executing reactors.
pub const DEFAULT_MAX_CONCURRENT_SIGNALS: usize = 256;

/// Wire value of [`NO_TIMEOUT`].
const NO_TIMEOUT_MILLIS: i64 = -1;

/// Configuration of a [`SignalProtocol`](crate::SignalProtocol).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Time to wait for the next buffer of a signal (`None` = forever).
    #[serde(rename = "timeout_ms", with = "timeout_millis")]
    pub timeout: Option<Duration>,
    /// How long deactivation waits for in-flight signals to drain.
    #[serde(rename = "deactivation_grace_ms", with = "duration_millis")]
    pub deactivation_grace: Duration,
    /// Maximum number of reactors executing at once.
    pub max_concurrent_signals: usize,
    /// Push local timeout changes to the peer.
    pub send_timeout_changes: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            deactivation_grace: DEFAULT_DEACTIVATION_GRACE,
            max_concurrent_signals: DEFAULT_MAX_CONCURRENT_SIGNALS,
            send_timeout_changes: true,
        }
    }
}

impl ProtocolConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Encode a timeout as milliseconds, `-1` meaning no timeout.
pub fn timeout_to_millis(timeout: Option<Duration>) -> i64 {
    match timeout {
        Some(duration) => i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
        None => NO_TIMEOUT_MILLIS,
    }
}

/// Decode a timeout from milliseconds. Any negative value means no timeout.
pub fn timeout_from_millis(millis: i64) -> Option<Duration> {
    u64::try_from(millis).ok().map(Duration::from_millis)
}

mod timeout_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        timeout: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(super::timeout_to_millis(*timeout))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let millis = i64::deserialize(deserializer)?;
        Ok(super::timeout_from_millis(millis))
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProtocolConfig::default();
        assert_eq!(config.timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.deactivation_grace, Duration::from_secs(10));
        assert_eq!(config.max_concurrent_signals, 256);
        assert!(config.send_timeout_changes);
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            ProtocolConfig::from_json(r#"{ "deactivation_grace_ms": 250, "send_timeout_changes": false }"#)
                .unwrap();
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.deactivation_grace, Duration::from_millis(250));
        assert!(!config.send_timeout_changes);
    }

    #[test]
    fn test_from_json_no_timeout() {
        let config = ProtocolConfig::from_json(r#"{ "timeout_ms": -1 }"#).unwrap();
        assert_eq!(config.timeout, NO_TIMEOUT);
    }

    #[test]
    fn test_from_json_invalid() {
        let result = ProtocolConfig::from_json("{ not json");
        assert!(result.is_err());
    }

    #[test]
    fn test_json_roundtrip_keeps_field_names() {
        let config = ProtocolConfig {
            timeout: Some(Duration::from_millis(1500)),
            ..ProtocolConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"timeout_ms\":1500"));
        assert_eq!(ProtocolConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_timeout_millis_conversion() {
        assert_eq!(timeout_to_millis(None), -1);
        assert_eq!(timeout_to_millis(Some(Duration::from_secs(3))), 3000);
        assert_eq!(timeout_from_millis(-1), None);
        assert_eq!(timeout_from_millis(-42), None);
        assert_eq!(timeout_from_millis(0), Some(Duration::ZERO));
        assert_eq!(timeout_from_millis(750), Some(Duration::from_millis(750)));
    }
}
