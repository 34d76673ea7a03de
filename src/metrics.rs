//! Metric helpers for `wellstream`.
//!
//! This module defines metric names and simple helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. Without the `metrics` feature
//! the helpers compile to no-ops.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking open sessions.
pub const SESSIONS_ACTIVE: &str = "wellstream_sessions_active";
/// Name of the counter tracking messages by direction.
pub const MESSAGES_TOTAL: &str = "wellstream_messages_total";
/// Name of the counter tracking protocol failures reported to peers.
pub const PROTOCOL_ERRORS_TOTAL: &str = "wellstream_protocol_errors_total";
/// Name of the counter tracking growing objects that stopped growing.
pub const GROWING_OBJECTS_EXPIRED_TOTAL: &str = "wellstream_growing_objects_expired_total";

/// Direction of message flow.
#[derive(Clone, Copy, Debug)]
pub enum Direction {
    /// Messages received from the peer.
    Inbound,
    /// Messages written to the peer.
    Outbound,
}

impl Direction {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Increment the open sessions gauge.
pub fn inc_sessions() {
    #[cfg(feature = "metrics")]
    gauge!(SESSIONS_ACTIVE).increment(1.0);
}

/// Decrement the open sessions gauge.
pub fn dec_sessions() {
    #[cfg(feature = "metrics")]
    gauge!(SESSIONS_ACTIVE).decrement(1.0);
}

/// Record a message for the given direction.
pub fn inc_messages(direction: Direction) {
    #[cfg(feature = "metrics")]
    counter!(MESSAGES_TOTAL, "direction" => direction.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = direction;
}

/// Record a protocol failure reported to a peer.
pub fn inc_protocol_errors() {
    #[cfg(feature = "metrics")]
    counter!(PROTOCOL_ERRORS_TOTAL).increment(1);
}

/// Record a growing object whose flag was cleared.
pub fn inc_growing_objects_expired() {
    #[cfg(feature = "metrics")]
    counter!(GROWING_OBJECTS_EXPIRED_TOTAL).increment(1);
}
