//! Consumer side of channel streaming.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, warn};

use super::{
    ChannelDataBatch,
    ChannelDataSink,
    ChannelDescriptor,
    ChannelMetadataRecord,
    DataItem,
    DataKind,
    lock,
};
use crate::{
    codec::EtpMessage,
    config::EtpConfig,
    error::{EtpError, Result},
    liveness::LivenessRegistry,
    message::{ChannelDescribe, CloseChannel, MessageBody, MessageKind, OpenChannel, Start},
    protocol::{Protocol, Role},
    registry::{Capability, HandlerError, ProtocolHandler},
    session::{Session, WeakSession},
};

#[derive(Debug, Default)]
struct ChannelTable {
    records: HashMap<i64, ChannelMetadataRecord>,
    by_uri: HashMap<String, i64>,
}

impl ChannelTable {
    fn insert(&mut self, record: ChannelMetadataRecord) {
        if let Some(previous) = self.records.insert(record.channel_id, record.clone())
            && previous.uri != record.uri
        {
            self.by_uri.remove(&previous.uri);
        }
        self.by_uri.insert(record.uri.clone(), record.channel_id);
    }

    fn remove(&mut self, channel_id: i64) -> Option<ChannelMetadataRecord> {
        let record = self.records.remove(&channel_id)?;
        if self.by_uri.get(&record.uri) == Some(&channel_id) {
            self.by_uri.remove(&record.uri);
        }
        Some(record)
    }

    fn record_for_uri(&self, uri: &str) -> Option<&ChannelMetadataRecord> {
        self.by_uri.get(uri).and_then(|id| self.records.get(id))
    }
}

/// Receives channel data from a producer.
///
/// The consumer keeps its own channel id to metadata table, filled from
/// `ChannelMetadata` and `OpenChannel` messages. Data items for channels not
/// in the table are dropped; the rest are handed to the
/// [`ChannelDataSink`] and, once delivered, count as appends for the
/// growing-object [`LivenessRegistry`] when one is attached.
pub struct ChannelConsumer {
    table: Mutex<ChannelTable>,
    sink: Arc<dyn ChannelDataSink>,
    liveness: Option<LivenessRegistry>,
    session: Mutex<WeakSession>,
    request_timeout: Duration,
}

impl std::fmt::Debug for ChannelConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConsumer")
            .field("channels", &lock(&self.table).records.len())
            .field("liveness", &self.liveness.is_some())
            .finish_non_exhaustive()
    }
}

impl ChannelConsumer {
    #[must_use]
    pub fn new(config: &EtpConfig, sink: Arc<dyn ChannelDataSink>) -> Self {
        Self {
            table: Mutex::new(ChannelTable::default()),
            sink,
            liveness: None,
            session: Mutex::new(WeakSession::default()),
            request_timeout: config.request_timeout,
        }
    }

    /// Consumer delivering batches to an unbounded channel.
    #[must_use]
    pub fn with_channel(config: &EtpConfig) -> (Self, mpsc::UnboundedReceiver<ChannelDataBatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(config, Arc::new(tx)), rx)
    }

    /// Record appends in `registry`.
    #[must_use]
    pub fn with_liveness(mut self, registry: LivenessRegistry) -> Self {
        self.liveness = Some(registry);
        self
    }

    fn bind(&self, session: &Session) { *lock(&self.session) = session.downgrade(); }

    fn session(&self) -> Result<Session> { lock(&self.session).upgrade().ok_or(EtpError::Unbound) }

    /// Metadata for `channel_id`.
    ///
    /// # Errors
    ///
    /// Returns [`EtpError::UnrecognizedChannel`] for ids not in the local
    /// table. No message is sent.
    pub fn get_channel_metadata_record(&self, channel_id: i64) -> Result<ChannelMetadataRecord> {
        lock(&self.table)
            .records
            .get(&channel_id)
            .cloned()
            .ok_or(EtpError::UnrecognizedChannel(channel_id))
    }

    /// Every known channel, ordered by id.
    #[must_use]
    pub fn records(&self) -> Vec<ChannelMetadataRecord> {
        let mut records: Vec<_> = lock(&self.table).records.values().cloned().collect();
        records.sort_by_key(|record| record.channel_id);
        records
    }

    /// Ask the producer to start streaming.
    ///
    /// # Errors
    ///
    /// Returns [`EtpError::Unbound`] before the session opens, or the send
    /// error.
    pub fn start(&self, max_message_rate: u32, max_data_items: u32) -> Result<i64> {
        self.session()?.send(
            Protocol::ChannelStreaming,
            MessageBody::Start(Start {
                max_message_rate,
                max_data_items,
            }),
            0,
        )
    }

    /// Request metadata for the channels under `uris` and add the answer to
    /// the local table.
    ///
    /// # Errors
    ///
    /// Returns [`EtpError::Timeout`] when the producer does not answer within
    /// the request timeout, and the other [`Session::request`] errors.
    pub async fn describe(&self, uris: Vec<String>) -> Result<Vec<ChannelMetadataRecord>> {
        let session = self.session()?;
        let response = session
            .request(
                Protocol::ChannelStreaming,
                MessageBody::ChannelDescribe(ChannelDescribe { uris }),
                &[MessageKind::ChannelMetadata],
                self.request_timeout,
            )
            .await?;
        let records: Vec<_> = response
            .into_parts()
            .into_iter()
            .filter_map(|part| match part.body {
                MessageBody::ChannelMetadata(metadata) => Some(metadata.channels),
                _ => None,
            })
            .flatten()
            .collect();
        let mut table = lock(&self.table);
        for record in &records {
            table.insert(record.clone());
        }
        Ok(records)
    }

    /// Subscribe to `uri` under `channel_id`.
    ///
    /// The local table gets the metadata already known for the uri, or a
    /// record derived from the uri until the producer's `ChannelMetadata`
    /// arrives. Nothing is awaited: a producer that does not know the uri
    /// stays silent.
    ///
    /// # Errors
    ///
    /// Returns [`EtpError::Unbound`] before the session opens, or the send
    /// error.
    pub fn open_channel(&self, uri: &str, channel_id: i64) -> Result<i64> {
        let session = self.session()?;
        self.ensure_record(uri, channel_id);
        session.send(
            Protocol::ChannelStreaming,
            MessageBody::OpenChannel(OpenChannel {
                channel_id,
                uri: uri.to_owned(),
            }),
            0,
        )
    }

    /// Stop streaming for `channel_ids` and forget them locally.
    ///
    /// # Errors
    ///
    /// Returns [`EtpError::Unbound`] before the session opens, or the send
    /// error.
    pub fn close_channel(&self, channel_ids: Vec<i64>) -> Result<i64> {
        let session = self.session()?;
        {
            let mut table = lock(&self.table);
            for channel_id in &channel_ids {
                table.remove(*channel_id);
            }
        }
        session.send(
            Protocol::ChannelStreaming,
            MessageBody::CloseChannel(CloseChannel { channel_ids }),
            0,
        )
    }

    fn ensure_record(&self, uri: &str, channel_id: i64) {
        let mut table = lock(&self.table);
        let record = match table.record_for_uri(uri) {
            Some(known) => ChannelMetadataRecord {
                channel_id,
                ..known.clone()
            },
            None => ChannelDescriptor::from_uri(uri).into_record(channel_id),
        };
        table.insert(record);
    }

    async fn on_data(&self, kind: DataKind, items: Vec<DataItem>) {
        let (items, uris) = {
            let table = lock(&self.table);
            let mut uris = BTreeSet::new();
            let mut accepted = Vec::with_capacity(items.len());
            for item in items {
                match table.records.get(&item.channel_id) {
                    Some(record) => {
                        uris.insert(record.uri.clone());
                        accepted.push(item);
                    }
                    None => debug!(channel_id = item.channel_id, "dropping item for unknown channel"),
                }
            }
            (accepted, uris)
        };
        if items.is_empty() {
            return;
        }
        match self.sink.deliver(ChannelDataBatch { kind, items }).await {
            Ok(()) => {
                if let Some(liveness) = &self.liveness {
                    let now = Instant::now();
                    for uri in &uris {
                        liveness.record_append(uri, &super::wellbore_uri(uri), now);
                    }
                }
            }
            Err(error) => warn!(%error, "channel data sink refused batch"),
        }
    }
}

#[async_trait]
impl ProtocolHandler for ChannelConsumer {
    fn protocol(&self) -> Protocol { Protocol::ChannelStreaming }

    fn role(&self) -> Role { Role::Consumer }

    fn capabilities(&self) -> &'static [Capability] {
        &[
            Capability::ChannelDataConsumer,
            Capability::GrowingObjectActivity,
        ]
    }

    async fn on_session_opened(&self, session: &Session) { self.bind(session); }

    async fn handle(
        &self,
        session: &Session,
        message: EtpMessage,
    ) -> std::result::Result<(), HandlerError> {
        self.bind(session);
        match message.body {
            MessageBody::ChannelMetadata(metadata) => {
                let mut table = lock(&self.table);
                for record in metadata.channels {
                    table.insert(record);
                }
            }
            MessageBody::Empty => {}
            MessageBody::OpenChannel(open) => self.ensure_record(&open.uri, open.channel_id),
            MessageBody::CloseChannel(close) => {
                let mut table = lock(&self.table);
                for channel_id in close.channel_ids {
                    table.remove(channel_id);
                }
            }
            MessageBody::RealtimeData(data) => self.on_data(DataKind::Realtime, data.items).await,
            MessageBody::InfillRealtimeData(data) => {
                self.on_data(DataKind::Infill, data.items).await;
            }
            _ => {
                return Err(HandlerError::invalid_message_type(format!(
                    "consumer does not accept message type {}",
                    message.header.message_type
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::{DataValue, IndexValue};

    const GR: &str = "eml://witsml14/well(w)/wellbore(b)/log(l)/GR";

    fn consumer() -> (ChannelConsumer, mpsc::UnboundedReceiver<ChannelDataBatch>) {
        let (consumer, rx) = ChannelConsumer::with_channel(&EtpConfig::default());
        (consumer.with_liveness(LivenessRegistry::new()), rx)
    }

    fn item(channel_id: i64, depth: f64) -> DataItem {
        DataItem::new(channel_id, IndexValue::Depth(depth), DataValue::Double(depth))
    }

    #[test]
    fn unknown_channel_is_unrecognized() {
        let (consumer, _rx) = consumer();
        assert!(matches!(
            consumer.get_channel_metadata_record(9),
            Err(EtpError::UnrecognizedChannel(9))
        ));
    }

    #[test]
    fn reopening_uri_moves_record_to_new_id() {
        let (consumer, _rx) = consumer();
        consumer.ensure_record(GR, 1);
        consumer.ensure_record(GR, 2);

        let record = consumer.get_channel_metadata_record(2).expect("record");
        assert_eq!(record.mnemonic, "GR");
        assert_eq!(lock(&consumer.table).record_for_uri(GR).map(|r| r.channel_id), Some(2));
    }

    #[tokio::test]
    async fn data_is_filtered_and_recorded_for_liveness() {
        let (consumer, mut rx) = consumer();
        consumer.ensure_record(GR, 1);

        consumer
            .on_data(DataKind::Realtime, vec![item(1, 10.0), item(2, 10.0), item(1, 11.0)])
            .await;

        let batch = rx.recv().await.expect("batch");
        assert_eq!(batch.kind, DataKind::Realtime);
        assert_eq!(batch.items, vec![item(1, 10.0), item(1, 11.0)]);
        let liveness = consumer.liveness.as_ref().expect("liveness");
        let entry = liveness.get(GR).expect("entry");
        assert!(entry.is_growing);
        assert_eq!(entry.wellbore_uri, "eml://witsml14/well(w)/wellbore(b)");
    }

    #[tokio::test]
    async fn refused_batches_are_not_appends() {
        let (consumer, rx) = consumer();
        drop(rx);
        consumer.ensure_record(GR, 1);

        consumer.on_data(DataKind::Infill, vec![item(1, 1.0)]).await;

        assert!(consumer.liveness.as_ref().is_some_and(LivenessRegistry::is_empty));
    }
}
