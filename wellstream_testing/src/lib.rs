//! Utilities for driving `wellstream` sessions from the other end of an
//! in-memory transport during tests.
//!
//! [`TestPeer`] speaks raw framed ETP over a `tokio::io::duplex` stream, so
//! tests can script exactly what the remote endpoint sends and assert on
//! every message the session under test writes back.
//!
//! ```rust
//! use wellstream::{EtpConfig, SessionBuilder, protocol::{Protocol, Role, SupportedProtocol}};
//! use wellstream_testing::{TestPeer, TestResult};
//!
//! # async fn example() -> TestResult {
//! let (session, mut peer) = TestPeer::accept(SessionBuilder::new(EtpConfig::default()));
//! let open = peer
//!     .open(vec![SupportedProtocol::new(Protocol::Core, Role::Client)])
//!     .await?;
//! assert_eq!(session.session_id(), Some(open.session_id.as_str()));
//! # Ok(())
//! # }
//! ```

pub mod integration_helpers;
pub mod logging;
pub mod macros;
pub mod peer;
pub mod store;

pub use integration_helpers::{TestResult, config, unused_listener};
pub use logging::{LoggerHandle, logger};
pub use peer::{RECV_TIMEOUT, TestPeer};
pub use store::RecordingStore;
