//! Rate-limited delivery of streaming data messages.
//!
//! Data batches are queued in FIFO order and written to the session by a
//! background task that takes one token from a leaky-bucket limiter per
//! message. When the configured rate is exhausted, batches wait in the queue
//! instead of being dropped, so the order in which the producer issued them
//! is the order they reach the wire.
//!
//! Each data message takes its id from the session when it is queued, so the
//! producer can return it to the caller. Data ids therefore ascend on the
//! wire among themselves, but a message the session sends directly while
//! data waits here (an `Acknowledge`, a `ProtocolException`, a control
//! message) overtakes the queue with a higher id. Ids stay unique per
//! session; receivers must not assume they arrive in ascending order.

use std::{fmt, time::Duration};

use leaky_bucket::RateLimiter;
use tokio::{
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    codec::MessageFlags,
    message::MessageBody,
    protocol::Protocol,
    session::WeakSession,
};

struct Queued {
    message_id: i64,
    body: MessageBody,
}

/// Queue feeding one session at a bounded message rate.
pub(crate) struct OutboundQueue {
    tx: mpsc::UnboundedSender<Queued>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl OutboundQueue {
    /// Start a queue emitting at most `rate` messages per second.
    pub(crate) fn spawn(session: WeakSession, rate: u32) -> Self {
        let rate = usize::try_from(rate.max(1)).unwrap_or(usize::MAX);
        let limiter = RateLimiter::builder()
            .initial(rate)
            .refill(rate)
            .interval(Duration::from_secs(1))
            .max(rate)
            .build();
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run(rx, stop_rx, limiter, session));
        Self {
            tx,
            stop: Some(stop_tx),
            task,
        }
    }

    /// Queue `body` for delivery under the reserved `message_id`.
    ///
    /// Returns `false` once the queue has stopped.
    pub(crate) fn push(&self, message_id: i64, body: MessageBody) -> bool {
        self.tx.send(Queued { message_id, body }).is_ok()
    }

    /// Deliver everything still queued, ignoring the rate limit, and stop.
    pub(crate) async fn flush(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(error) = (&mut self.task).await {
            warn!(%error, "outbound queue task failed");
        }
    }

    /// Stop immediately, discarding queued messages.
    pub(crate) fn abort(self) { self.task.abort(); }
}

impl fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundQueue")
            .field("stopping", &self.stop.is_none())
            .finish_non_exhaustive()
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<Queued>,
    mut stop: oneshot::Receiver<()>,
    limiter: RateLimiter,
    session: WeakSession,
) {
    loop {
        let item = select! {
            biased;

            _ = &mut stop => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => return,
            },
        };
        if !limiter.try_acquire(1) {
            debug!(queued = rx.len(), "message rate limit reached; queueing");
            select! {
                biased;

                _ = &mut stop => {
                    deliver(&session, item);
                    break;
                }
                () = limiter.acquire(1) => {}
            }
        }
        if !deliver(&session, item) {
            return;
        }
    }

    rx.close();
    let mut flushed = 0usize;
    while let Ok(item) = rx.try_recv() {
        if !deliver(&session, item) {
            return;
        }
        flushed += 1;
    }
    if flushed > 0 {
        debug!(flushed, "flushed queued streaming messages");
    }
}

fn deliver(session: &WeakSession, item: Queued) -> bool {
    let Some(session) = session.upgrade() else {
        return false;
    };
    match session.send_reserved(
        item.message_id,
        Protocol::ChannelStreaming,
        item.body,
        MessageFlags::NONE,
    ) {
        Ok(()) => true,
        Err(error) => {
            debug!(message_id = item.message_id, %error, "dropping streaming message");
            false
        }
    }
}
