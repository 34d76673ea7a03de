//! In-memory growing-flag store that records every call.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use wellstream::liveness::{GrowingObjectStore, PersistError};

/// [`GrowingObjectStore`] keeping calls and flags in memory.
///
/// Failed calls are recorded too, so tests can count retries.
#[derive(Debug, Default)]
pub struct RecordingStore {
    calls: Mutex<Vec<(String, bool)>>,
    flags: Mutex<HashMap<String, bool>>,
    failures: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RecordingStore {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Make the next `count` persists fail.
    pub fn fail_next(&self, count: usize) { self.failures.store(count, Ordering::SeqCst); }

    /// Every `(uri, growing)` persist attempt in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, bool)> { lock(&self.calls).clone() }

    /// Attempts that targeted `uri`.
    #[must_use]
    pub fn calls_for(&self, uri: &str) -> Vec<bool> {
        lock(&self.calls)
            .iter()
            .filter(|(u, _)| u == uri)
            .map(|(_, growing)| *growing)
            .collect()
    }

    /// Last successfully persisted flag for `uri`.
    #[must_use]
    pub fn flag(&self, uri: &str) -> Option<bool> { lock(&self.flags).get(uri).copied() }
}

#[async_trait]
impl GrowingObjectStore for RecordingStore {
    async fn persist_growing_flag(&self, uri: &str, growing: bool) -> Result<(), PersistError> {
        lock(&self.calls).push((uri.to_owned(), growing));
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PersistError::new(format!("store unavailable for {uri}")));
        }
        lock(&self.flags).insert(uri.to_owned(), growing);
        Ok(())
    }
}
