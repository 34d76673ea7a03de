//! Fixtures shared by the integration test suites.

use std::{
    net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener},
    time::Duration,
};

use rstest::fixture;
use wellstream::EtpConfig;

/// Shared result type for integration tests.
pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Create a TCP listener bound to a free local port.
///
/// # Errors
///
/// Returns any IO error encountered while binding to an ephemeral localhost
/// port.
pub fn unused_listener() -> std::io::Result<StdTcpListener> {
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0);
    StdTcpListener::bind(addr)
}

/// Configuration with short timeouts suited to tests.
///
/// Timers are still long enough that nothing fires unless a test waits for
/// it on purpose.
#[fixture]
pub fn config() -> EtpConfig {
    EtpConfig {
        request_timeout: Duration::from_secs(2),
        liveness_sweep_interval: Duration::from_millis(500),
        growing_object_timeout: Duration::from_secs(5),
        preamble_timeout: Duration::from_secs(1),
        ..EtpConfig::default()
    }
}
