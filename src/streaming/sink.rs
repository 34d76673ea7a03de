//! Destination for channel data received by a consumer.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::DataItem;

/// Whether a batch arrived as real-time or infill data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataKind {
    Realtime,
    Infill,
}

/// Items from one data message, restricted to channels the consumer knows.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelDataBatch {
    pub kind: DataKind,
    pub items: Vec<DataItem>,
}

/// Reasons a sink refuses a batch.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SinkError {
    /// The receiving side has gone away.
    #[error("channel data sink is closed")]
    Closed,
    /// The sink could not store the batch.
    #[error("channel data rejected: {0}")]
    Rejected(String),
}

/// Receives batches accepted by a [`ChannelConsumer`](super::ChannelConsumer).
///
/// A successful delivery counts as an append for liveness purposes.
#[async_trait]
pub trait ChannelDataSink: Send + Sync + 'static {
    /// Store or forward `batch`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the batch could not be accepted.
    async fn deliver(&self, batch: ChannelDataBatch) -> Result<(), SinkError>;
}

#[async_trait]
impl ChannelDataSink for mpsc::UnboundedSender<ChannelDataBatch> {
    async fn deliver(&self, batch: ChannelDataBatch) -> Result<(), SinkError> {
        self.send(batch).map_err(|_| SinkError::Closed)
    }
}

#[async_trait]
impl ChannelDataSink for mpsc::Sender<ChannelDataBatch> {
    async fn deliver(&self, batch: ChannelDataBatch) -> Result<(), SinkError> {
        self.send(batch).await.map_err(|_| SinkError::Closed)
    }
}
