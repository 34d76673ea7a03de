#![cfg(feature = "metrics")]
//! Tests for `wellstream` metrics helpers.
//!
//! Counters are observed through `metrics_util::debugging::DebuggingRecorder`
//! installed as the thread-local recorder.

use std::{sync::Arc, time::Duration};

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use rstest::rstest;
use serial_test::serial;
use wellstream::{
    liveness::{GrowingObjectMonitor, LivenessRegistry},
    metrics::Direction,
};
use wellstream_testing::RecordingStore;

fn debugging_recorder_setup() -> (Snapshotter, DebuggingRecorder) {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    (snapshotter, recorder)
}

fn assert_counter_eq(snapshotter: &Snapshotter, name: &str, expected: u64) {
    let metrics = snapshotter.snapshot().into_vec();
    assert!(
        metrics.iter().any(|(key, _, _, value)| {
            key.key().name() == name && matches!(value, DebugValue::Counter(c) if *c == expected)
        }),
        "expected {name} == {expected}, got {metrics:#?}"
    );
}

#[rstest]
#[case(Direction::Inbound, "inbound")]
#[case(Direction::Outbound, "outbound")]
#[serial]
fn message_metric_is_labelled_by_direction(#[case] direction: Direction, #[case] label: &str) {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        wellstream::metrics::inc_messages(direction);
    });

    let metrics = snapshotter.snapshot().into_vec();
    let found = metrics.iter().any(|(k, _, _, v)| {
        k.key().name() == wellstream::metrics::MESSAGES_TOTAL
            && k.key()
                .labels()
                .any(|l| l.key() == "direction" && l.value() == label)
            && matches!(v, DebugValue::Counter(c) if *c > 0)
    });
    assert!(found, "{label} message metric not recorded");
}

#[rstest]
#[case(1)]
#[case(3)]
#[serial]
fn protocol_errors_are_counted(#[case] expected: u64) {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        (0..expected).for_each(|_| wellstream::metrics::inc_protocol_errors());
    });

    assert_counter_eq(
        &snapshotter,
        wellstream::metrics::PROTOCOL_ERRORS_TOTAL,
        expected,
    );
}

#[test]
#[serial]
fn session_gauge_returns_to_zero() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        wellstream::metrics::inc_sessions();
        wellstream::metrics::inc_sessions();
        wellstream::metrics::dec_sessions();
        wellstream::metrics::dec_sessions();
    });

    let metrics = snapshotter.snapshot().into_vec();
    assert!(
        metrics.iter().any(|(k, _, _, v)| {
            k.key().name() == wellstream::metrics::SESSIONS_ACTIVE
                && matches!(v, DebugValue::Gauge(g) if g.into_inner().abs() < f64::EPSILON)
        }),
        "sessions gauge not balanced: {metrics:#?}"
    );
}

#[test]
#[serial]
fn expired_growing_objects_are_counted() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    let registry = LivenessRegistry::new();
    let monitor = GrowingObjectMonitor::new(
        registry.clone(),
        Arc::new(RecordingStore::new()),
        Duration::from_secs(5),
        Duration::from_secs(1),
    );
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .expect("runtime");

    let stopped = metrics::with_local_recorder(&recorder, || {
        runtime.block_on(async {
            let now = tokio::time::Instant::now();
            registry.record_append("eml://log(A)", "eml://wellbore(B)", now);
            registry.record_append("eml://log(B)", "eml://wellbore(B)", now);
            tokio::time::advance(Duration::from_secs(6)).await;
            monitor.sweep().await
        })
    });

    assert_eq!(stopped, 2);
    assert_counter_eq(
        &snapshotter,
        wellstream::metrics::GROWING_OBJECTS_EXPIRED_TOTAL,
        2,
    );
}
