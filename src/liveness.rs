//! Growing-object liveness tracking.
//!
//! A growing object (a log or trajectory still receiving data) stays marked
//! as growing while appends keep arriving. [`LivenessRegistry`] holds one
//! entry per object and is shared by every session and by any non-streaming
//! append path. [`GrowingObjectMonitor`] periodically clears the flag on
//! entries that have been quiet for longer than the growing-object timeout
//! and tells the [`GrowingObjectStore`] about the change.
//!
//! The registry is an explicit value: create one at start-up, hand clones to
//! the consumers and the monitor, and drop it at shutdown.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

mod monitor;

pub use monitor::{GrowingObjectMonitor, MonitorHandle};

/// Liveness state of one growing object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LivenessEntry {
    pub object_uri: String,
    pub wellbore_uri: String,
    pub last_append: Instant,
    pub is_growing: bool,
}

/// Process-wide table of growing objects.
///
/// Clones share the same table.
#[derive(Clone, Debug, Default)]
pub struct LivenessRegistry {
    entries: Arc<DashMap<String, LivenessEntry>>,
}

impl LivenessRegistry {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Note a successful append to `object_uri` at `at`.
    ///
    /// The entry is created on first use and marked growing. Timestamps only
    /// move forward, so a late report of an older append cannot shorten the
    /// object's remaining lifetime.
    pub fn record_append(&self, object_uri: &str, wellbore_uri: &str, at: Instant) {
        self.entries
            .entry(object_uri.to_owned())
            .and_modify(|entry| {
                entry.last_append = entry.last_append.max(at);
                entry.is_growing = true;
                if entry.wellbore_uri != wellbore_uri {
                    wellbore_uri.clone_into(&mut entry.wellbore_uri);
                }
            })
            .or_insert_with(|| LivenessEntry {
                object_uri: object_uri.to_owned(),
                wellbore_uri: wellbore_uri.to_owned(),
                last_append: at,
                is_growing: true,
            });
    }

    /// Snapshot of the entry for `object_uri`.
    #[must_use]
    pub fn get(&self, object_uri: &str) -> Option<LivenessEntry> {
        self.entries.get(object_uri).map(|entry| entry.clone())
    }

    /// Forget `object_uri` after it was deleted.
    pub fn remove(&self, object_uri: &str) -> Option<LivenessEntry> {
        self.entries.remove(object_uri).map(|(_, entry)| entry)
    }

    /// Entries currently marked growing.
    #[must_use]
    pub fn growing(&self) -> Vec<LivenessEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.is_growing)
            .map(|entry| entry.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize { self.entries.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Growing entries whose last append is more than `timeout` before `now`,
    /// with the timestamp observed.
    pub(crate) fn expired(&self, now: Instant, timeout: Duration) -> Vec<(String, Instant)> {
        self.entries
            .iter()
            .filter(|entry| {
                entry.is_growing && now.saturating_duration_since(entry.last_append) > timeout
            })
            .map(|entry| (entry.key().clone(), entry.last_append))
            .collect()
    }

    /// Clear the growing flag unless an append arrived after `observed`.
    pub(crate) fn mark_stopped(&self, object_uri: &str, observed: Instant) -> bool {
        match self.entries.get_mut(object_uri) {
            Some(mut entry) if entry.is_growing && entry.last_append == observed => {
                entry.is_growing = false;
                true
            }
            _ => false,
        }
    }
}

/// Failure reported by a [`GrowingObjectStore`].
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("failed to persist growing flag: {message}")]
pub struct PersistError {
    message: String,
}

impl PersistError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str { &self.message }
}

/// Persistence collaborator that records an object's growing flag.
///
/// Implementations must be idempotent: persisting the same value twice
/// leaves the same state as persisting it once.
#[async_trait]
pub trait GrowingObjectStore: Send + Sync + 'static {
    /// Store `is_growing` for `object_uri`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError`] if the flag could not be stored; the monitor
    /// retries on its next sweep.
    async fn persist_growing_flag(
        &self,
        object_uri: &str,
        is_growing: bool,
    ) -> Result<(), PersistError>;
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;

    const LOG: &str = "eml://witsml14/well(w)/wellbore(b)/log(l)";
    const WELLBORE: &str = "eml://witsml14/well(w)/wellbore(b)";

    #[fixture]
    fn registry() -> LivenessRegistry { LivenessRegistry::new() }

    #[rstest]
    fn timestamps_never_move_backwards(registry: LivenessRegistry) {
        let start = Instant::now();
        let later = start + Duration::from_secs(5);
        registry.record_append(LOG, WELLBORE, later);
        registry.record_append(LOG, WELLBORE, start);

        assert_eq!(registry.get(LOG).map(|e| e.last_append), Some(later));
    }

    #[rstest]
    fn expired_skips_recent_and_stopped_entries(registry: LivenessRegistry) {
        let start = Instant::now();
        let now = start + Duration::from_secs(61);
        registry.record_append("old", WELLBORE, start);
        registry.record_append("new", WELLBORE, now);
        registry.record_append("stopped", WELLBORE, start);
        assert!(registry.mark_stopped("stopped", start));

        let expired = registry.expired(now, Duration::from_secs(60));

        assert_eq!(
            expired.into_iter().map(|(uri, _)| uri).collect::<Vec<_>>(),
            vec!["old".to_owned()]
        );
    }

    #[rstest]
    fn mark_stopped_loses_to_newer_append(registry: LivenessRegistry) {
        let start = Instant::now();
        registry.record_append(LOG, WELLBORE, start);
        registry.record_append(LOG, WELLBORE, start + Duration::from_secs(1));

        assert!(!registry.mark_stopped(LOG, start));
        assert!(registry.get(LOG).is_some_and(|e| e.is_growing));
    }

    #[rstest]
    fn append_revives_stopped_entry(registry: LivenessRegistry) {
        let start = Instant::now();
        registry.record_append(LOG, WELLBORE, start);
        assert!(registry.mark_stopped(LOG, start));

        registry.record_append(LOG, WELLBORE, start + Duration::from_secs(1));

        assert_eq!(registry.growing().len(), 1);
    }

    #[rstest]
    fn clones_share_entries(registry: LivenessRegistry) {
        registry.clone().record_append(LOG, WELLBORE, Instant::now());
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(LOG).is_some());
        assert!(registry.is_empty());
    }
}
