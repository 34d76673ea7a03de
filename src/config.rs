//! Runtime configuration.
//!
//! [`EtpConfig`] gathers every tunable used by sessions, the streaming
//! exchange and the liveness monitor. It deserializes from JSON with
//! `#[serde(default)]`, so a file only needs the keys it overrides. Durations
//! are expressed in milliseconds.

use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{MAX_FRAME_LENGTH, MIN_FRAME_LENGTH};

/// Upper bound accepted for `max_message_rate`.
pub const MAX_MESSAGE_RATE_LIMIT: u32 = 10_000;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_message_rate must be within 1..={MAX_MESSAGE_RATE_LIMIT}, got {0}")]
    MessageRate(u32),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("max_frame_length must be within {MIN_FRAME_LENGTH}..={MAX_FRAME_LENGTH}, got {0}")]
    FrameLength(usize),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Tunables for sessions, streaming and liveness.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EtpConfig {
    /// Streaming messages emitted per second by a producer.
    pub max_message_rate: u32,
    /// Age at which a pending request is swept as timed out.
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    /// Inactivity after which a growing object stops growing.
    #[serde(with = "millis")]
    pub growing_object_timeout: Duration,
    /// Period of the liveness monitor and of the request sweep.
    #[serde(with = "millis")]
    pub liveness_sweep_interval: Duration,
    /// Inbound silence after which a session closes.
    #[serde(with = "millis")]
    pub idle_timeout: Duration,
    /// Consecutive protocol failures tolerated before a session closes.
    pub max_protocol_errors: u32,
    /// Largest accepted frame in bytes.
    pub max_frame_length: usize,
    /// Data items per `RealtimeData`/`InfillRealtimeData` message.
    pub max_data_items: u32,
    /// Records per `ChannelMetadata` message part.
    pub max_channels_per_message: usize,
    /// Time allowed for a client to send its transport preamble.
    #[serde(with = "millis")]
    pub preamble_timeout: Duration,
}

impl Default for EtpConfig {
    fn default() -> Self {
        Self {
            max_message_rate: 1000,
            request_timeout: Duration::from_secs(30),
            growing_object_timeout: Duration::from_secs(60),
            liveness_sweep_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            max_protocol_errors: 10,
            max_frame_length: 1024 * 1024,
            max_data_items: 10_000,
            max_channels_per_message: 100,
            preamble_timeout: Duration::from_secs(5),
        }
    }
}

impl EtpConfig {
    /// Parse and validate a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for invalid JSON or unknown keys and
    /// any validation error from [`EtpConfig::validate`].
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`EtpConfig::from_json`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    /// Check every field against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_MESSAGE_RATE_LIMIT).contains(&self.max_message_rate) {
            return Err(ConfigError::MessageRate(self.max_message_rate));
        }
        if !(MIN_FRAME_LENGTH..=MAX_FRAME_LENGTH).contains(&self.max_frame_length) {
            return Err(ConfigError::FrameLength(self.max_frame_length));
        }
        let durations = [
            ("request_timeout", self.request_timeout),
            ("growing_object_timeout", self.growing_object_timeout),
            ("liveness_sweep_interval", self.liveness_sweep_interval),
            ("idle_timeout", self.idle_timeout),
            ("preamble_timeout", self.preamble_timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::Zero(name));
        }
        if self.max_protocol_errors == 0 {
            return Err(ConfigError::Zero("max_protocol_errors"));
        }
        if self.max_data_items == 0 {
            return Err(ConfigError::Zero("max_data_items"));
        }
        if self.max_channels_per_message == 0 {
            return Err(ConfigError::Zero("max_channels_per_message"));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EtpConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_message_rate, 1000);
        assert_eq!(config.growing_object_timeout, Duration::from_secs(60));
    }

    #[test]
    fn partial_json_overrides_defaults() {
        let config =
            EtpConfig::from_json(r#"{ "max_message_rate": 50, "request_timeout": 1500 }"#)
                .expect("valid config");
        assert_eq!(config.max_message_rate, 50);
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.idle_timeout, EtpConfig::default().idle_timeout);
    }

    #[rstest]
    #[case(r#"{ "max_message_rate": 0 }"#)]
    #[case(r#"{ "max_message_rate": 10001 }"#)]
    #[case(r#"{ "idle_timeout": 0 }"#)]
    #[case(r#"{ "max_frame_length": 8 }"#)]
    #[case(r#"{ "max_data_items": 0 }"#)]
    #[case(r#"{ "unknown_key": true }"#)]
    fn invalid_documents_are_rejected(#[case] text: &str) {
        assert!(EtpConfig::from_json(text).is_err());
    }

    #[test]
    fn serialized_durations_are_milliseconds() {
        let json = serde_json::to_value(EtpConfig::default()).expect("serializable");
        assert_eq!(json["liveness_sweep_interval"], 10_000);
    }
}
