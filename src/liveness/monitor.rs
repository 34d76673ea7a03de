//! Periodic expiry of growing objects.

use std::{sync::Arc, time::Duration};

use tokio::{
    select,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{GrowingObjectStore, LivenessRegistry};
use crate::{config::EtpConfig, metrics};

/// Clears the growing flag of objects that stopped receiving appends.
///
/// Each sweep persists `false` for every expired entry and only then clears
/// the in-memory flag, so a failed persist leaves the entry expired and it is
/// retried on the next sweep. Entries are never removed here.
#[derive(Clone)]
pub struct GrowingObjectMonitor {
    registry: LivenessRegistry,
    store: Arc<dyn GrowingObjectStore>,
    timeout: Duration,
    interval: Duration,
}

impl std::fmt::Debug for GrowingObjectMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrowingObjectMonitor")
            .field("entries", &self.registry.len())
            .field("timeout", &self.timeout)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl GrowingObjectMonitor {
    #[must_use]
    pub fn new(
        registry: LivenessRegistry,
        store: Arc<dyn GrowingObjectStore>,
        timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            timeout,
            interval,
        }
    }

    /// Monitor using the growing-object timeout and sweep interval from
    /// `config`.
    #[must_use]
    pub fn from_config(
        registry: LivenessRegistry,
        store: Arc<dyn GrowingObjectStore>,
        config: &EtpConfig,
    ) -> Self {
        Self::new(
            registry,
            store,
            config.growing_object_timeout,
            config.liveness_sweep_interval,
        )
    }

    #[must_use]
    pub fn registry(&self) -> &LivenessRegistry { &self.registry }

    /// Run one expiry pass and return how many objects stopped growing.
    pub async fn sweep(&self) -> usize {
        let expired = self.registry.expired(Instant::now(), self.timeout);
        let mut stopped = 0;
        for (uri, observed) in expired {
            if let Err(error) = self.store.persist_growing_flag(&uri, false).await {
                warn!(%uri, %error, "failed to persist growing flag; retrying next sweep");
                continue;
            }
            if self.registry.mark_stopped(&uri, observed) {
                info!(%uri, "growing object expired");
                metrics::inc_growing_objects_expired();
                stopped += 1;
                continue;
            }
            debug!(%uri, "append arrived during expiry; restoring growing flag");
            if let Err(error) = self.store.persist_growing_flag(&uri, true).await {
                warn!(%uri, %error, "failed to restore growing flag");
            }
        }
        stopped
    }

    /// Sweep every interval until `shutdown` is cancelled.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn spawn(self, shutdown: CancellationToken) -> MonitorHandle {
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let mut ticks = interval(self.interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticks.reset();
            loop {
                select! {
                    biased;

                    () = shutdown.cancelled() => break,
                    _ = ticks.tick() => {
                        let stopped = self.sweep().await;
                        if stopped > 0 {
                            debug!(stopped, "liveness sweep finished");
                        }
                    }
                }
            }
            debug!("growing object monitor stopped");
        });
        MonitorHandle { token, task }
    }
}

/// Handle to a running [`GrowingObjectMonitor`].
#[derive(Debug)]
pub struct MonitorHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Stop the monitor and wait for the current sweep to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(error) = self.task.await {
            warn!(%error, "growing object monitor task failed");
        }
    }
}
