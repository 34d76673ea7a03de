//! Tests for growing-object expiry.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rstest::rstest;
use tokio::time::{Instant, advance, sleep};
use tokio_util::sync::CancellationToken;
use wellstream::{
    EtpConfig,
    liveness::{GrowingObjectMonitor, GrowingObjectStore, LivenessRegistry, PersistError},
};
use wellstream_testing::{RecordingStore, config};

const LOG: &str = "eml://witsml14/well(W1)/wellbore(B1)/log(GR)";
const WELLBORE: &str = "eml://witsml14/well(W1)/wellbore(B1)";
const TIMEOUT: Duration = Duration::from_secs(5);
const SWEEP: Duration = Duration::from_secs(1);

fn monitor(registry: &LivenessRegistry, store: Arc<dyn GrowingObjectStore>) -> GrowingObjectMonitor {
    GrowingObjectMonitor::new(registry.clone(), store, TIMEOUT, SWEEP)
}

#[tokio::test(start_paused = true)]
async fn quiet_objects_stop_growing_once() {
    let registry = LivenessRegistry::new();
    let store = Arc::new(RecordingStore::new());
    registry.record_append(LOG, WELLBORE, Instant::now());
    let handle = monitor(&registry, store.clone()).spawn(CancellationToken::new());

    sleep(TIMEOUT + Duration::from_secs(1) + Duration::from_millis(100)).await;

    assert_eq!(store.calls_for(LOG), vec![false]);
    assert_eq!(store.flag(LOG), Some(false));
    let entry = registry.get(LOG).expect("entry kept after expiry");
    assert!(!entry.is_growing);
    assert_eq!(entry.wellbore_uri, WELLBORE);

    sleep(SWEEP * 5).await;
    assert_eq!(store.calls_for(LOG), vec![false], "expiry persisted twice");
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn objects_with_recent_appends_keep_growing() {
    let registry = LivenessRegistry::new();
    let store = Arc::new(RecordingStore::new());
    let monitor = monitor(&registry, store.clone());

    registry.record_append(LOG, WELLBORE, Instant::now());
    advance(TIMEOUT - Duration::from_secs(1)).await;
    registry.record_append(LOG, WELLBORE, Instant::now());
    advance(TIMEOUT - Duration::from_secs(1)).await;

    assert_eq!(monitor.sweep().await, 0);
    assert!(store.calls().is_empty());
    assert!(registry.get(LOG).is_some_and(|e| e.is_growing));
}

#[rstest]
#[case(1)]
#[case(3)]
#[tokio::test(start_paused = true)]
async fn failed_persists_are_retried_every_sweep(#[case] failures: usize) {
    let registry = LivenessRegistry::new();
    let store = Arc::new(RecordingStore::new());
    let monitor = monitor(&registry, store.clone());
    registry.record_append(LOG, WELLBORE, Instant::now());
    advance(TIMEOUT + SWEEP).await;
    store.fail_next(failures);

    for _ in 0..failures {
        assert_eq!(monitor.sweep().await, 0);
        assert!(registry.get(LOG).is_some_and(|e| e.is_growing));
    }
    assert_eq!(monitor.sweep().await, 1);

    assert_eq!(store.calls_for(LOG), vec![false; failures + 1]);
    assert_eq!(store.flag(LOG), Some(false));
    assert!(registry.get(LOG).is_some_and(|e| !e.is_growing));
}

#[tokio::test(start_paused = true)]
async fn appends_after_expiry_grow_the_object_again() {
    let registry = LivenessRegistry::new();
    let store = Arc::new(RecordingStore::new());
    let monitor = monitor(&registry, store.clone());
    registry.record_append(LOG, WELLBORE, Instant::now());
    advance(TIMEOUT + SWEEP).await;
    assert_eq!(monitor.sweep().await, 1);

    registry.record_append(LOG, WELLBORE, Instant::now());
    assert!(registry.get(LOG).is_some_and(|e| e.is_growing));
    assert_eq!(monitor.sweep().await, 0);

    advance(TIMEOUT + SWEEP).await;
    assert_eq!(monitor.sweep().await, 1);
    assert_eq!(store.calls_for(LOG), vec![false, false]);
}

/// Store that reports a fresh append while it persists an expiry.
struct RacingStore {
    registry: LivenessRegistry,
    inner: RecordingStore,
}

#[async_trait]
impl GrowingObjectStore for RacingStore {
    async fn persist_growing_flag(&self, uri: &str, growing: bool) -> Result<(), PersistError> {
        if !growing {
            advance(Duration::from_millis(10)).await;
            self.registry.record_append(uri, WELLBORE, Instant::now());
        }
        self.inner.persist_growing_flag(uri, growing).await
    }
}

#[tokio::test(start_paused = true)]
async fn appends_racing_an_expiry_restore_the_flag() {
    let registry = LivenessRegistry::new();
    let store = Arc::new(RacingStore {
        registry: registry.clone(),
        inner: RecordingStore::new(),
    });
    let monitor = monitor(&registry, store.clone());
    registry.record_append(LOG, WELLBORE, Instant::now());
    advance(TIMEOUT + SWEEP).await;

    assert_eq!(monitor.sweep().await, 0);

    assert!(registry.get(LOG).is_some_and(|e| e.is_growing));
    assert_eq!(store.inner.calls_for(LOG), vec![false, true]);
    assert_eq!(store.inner.flag(LOG), Some(true));
}

#[tokio::test(start_paused = true)]
async fn late_reports_never_move_the_timestamp_back() {
    let registry = LivenessRegistry::new();
    let early = Instant::now();
    advance(Duration::from_secs(3)).await;
    let late = Instant::now();

    registry.record_append(LOG, WELLBORE, late);
    registry.record_append(LOG, WELLBORE, early);

    assert_eq!(registry.get(LOG).map(|e| e.last_append), Some(late));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn monitor_uses_configured_timeout(config: EtpConfig) {
    let registry = LivenessRegistry::new();
    let store = Arc::new(RecordingStore::new());
    let monitor = GrowingObjectMonitor::from_config(registry.clone(), store.clone(), &config);
    registry.record_append(LOG, WELLBORE, Instant::now());

    advance(config.growing_object_timeout).await;
    assert_eq!(monitor.sweep().await, 0);
    advance(config.liveness_sweep_interval).await;
    assert_eq!(monitor.sweep().await, 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_the_sweeps() {
    let registry = LivenessRegistry::new();
    let store = Arc::new(RecordingStore::new());
    let token = CancellationToken::new();
    let handle = monitor(&registry, store.clone()).spawn(token.clone());

    handle.shutdown().await;
    assert!(token.is_cancelled());

    registry.record_append(LOG, WELLBORE, Instant::now());
    sleep(TIMEOUT * 3).await;
    assert!(store.calls().is_empty());
    assert!(registry.get(LOG).is_some_and(|e| e.is_growing));
}

#[test]
fn registry_forgets_removed_objects() {
    let registry = LivenessRegistry::new();
    registry.record_append(LOG, WELLBORE, Instant::now());

    assert_eq!(registry.growing().len(), 1);
    assert_eq!(registry.remove(LOG).map(|e| e.object_uri), Some(LOG.to_owned()));
    assert!(registry.is_empty());
}
