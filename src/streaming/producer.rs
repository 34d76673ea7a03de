//! Producer side of channel streaming.

use std::{
    collections::BTreeMap,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{
    ChannelDescriptor,
    ChannelMetadataRecord,
    DataItem,
    DataKind,
    lock,
    outbound::OutboundQueue,
};
use crate::{
    codec::{EtpMessage, MessageFlags},
    config::EtpConfig,
    error::{CloseReason, EtpError, Result},
    message::{
        ChannelMetadata,
        InfillRealtimeData,
        MessageBody,
        MessageKind,
        OpenChannel,
        RealtimeData,
    },
    protocol::{Protocol, Role},
    registry::{Capability, HandlerError, ProtocolHandler},
    session::{Session, WeakSession},
};

#[derive(Debug)]
struct ProducerState {
    next_channel_id: i64,
    /// Channels the producer can serve, keyed by uri, under producer ids.
    advertised: BTreeMap<String, ChannelMetadataRecord>,
    /// Channels currently streaming, keyed by the id data items carry.
    open: BTreeMap<i64, ChannelMetadataRecord>,
    /// Subscriptions to uris not yet advertised.
    pending: BTreeMap<String, i64>,
    max_data_items: usize,
}

impl ProducerState {
    fn advertise(&mut self, descriptor: ChannelDescriptor) -> Option<ChannelMetadataRecord> {
        if self.advertised.contains_key(&descriptor.uri) {
            return None;
        }
        let record = descriptor.into_record(self.next_channel_id);
        self.next_channel_id += 1;
        self.advertised.insert(record.uri.clone(), record.clone());
        Some(record)
    }

    /// Open the advertised `uri` under `channel_id`.
    fn open(&mut self, uri: &str, channel_id: i64) -> Result<ChannelMetadataRecord> {
        let Some(advertised) = self.advertised.get(uri) else {
            return Err(EtpError::UnknownUri(uri.to_owned()));
        };
        if let Some(existing) = self.open.get(&channel_id)
            && existing.uri != uri
        {
            return Err(EtpError::ChannelInUse {
                channel_id,
                uri: existing.uri.clone(),
            });
        }
        let record = ChannelMetadataRecord {
            channel_id,
            ..advertised.clone()
        };
        self.open.retain(|_, r| r.uri != uri);
        self.open.insert(channel_id, record.clone());
        self.pending.remove(uri);
        Ok(record)
    }

    fn describe(&self, uris: &[String]) -> Vec<ChannelMetadataRecord> {
        let mut records: Vec<_> = self
            .advertised
            .values()
            .filter(|record| uris.iter().any(|uri| covers(uri, &record.uri)))
            .cloned()
            .collect();
        records.sort_by_key(|record| record.channel_id);
        records
    }
}

/// Whether `prefix` names `uri` or one of its ancestors.
fn covers(prefix: &str, uri: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    uri.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

fn metadata_parts(records: Vec<ChannelMetadataRecord>, per_message: usize) -> Vec<MessageBody> {
    records
        .chunks(per_message.max(1))
        .map(|chunk| {
            MessageBody::ChannelMetadata(ChannelMetadata {
                channels: chunk.to_vec(),
            })
        })
        .collect()
}

/// Serves channel data to a consumer.
///
/// The application advertises channels with
/// [`initialize_data_load`](Self::initialize_data_load) and pushes data with
/// [`realtime_data`](Self::realtime_data). Streaming starts on its own once
/// the session opens with a peer consumer, or when the consumer sends
/// `Start`. Data for channels the consumer has not opened is dropped, and
/// subscriptions to unknown uris stay silent until the uri is advertised.
///
/// A producer serves one session.
#[derive(Debug)]
pub struct ChannelProducer {
    max_message_rate: u32,
    max_channels_per_message: usize,
    state: Mutex<ProducerState>,
    session: Mutex<WeakSession>,
    started: AtomicBool,
    queue: Mutex<Option<OutboundQueue>>,
}

impl ChannelProducer {
    #[must_use]
    pub fn new(config: &EtpConfig) -> Self {
        Self {
            max_message_rate: config.max_message_rate,
            max_channels_per_message: config.max_channels_per_message,
            state: Mutex::new(ProducerState {
                next_channel_id: 1,
                advertised: BTreeMap::new(),
                open: BTreeMap::new(),
                pending: BTreeMap::new(),
                max_data_items: usize::try_from(config.max_data_items).unwrap_or(usize::MAX),
            }),
            session: Mutex::new(WeakSession::default()),
            started: AtomicBool::new(false),
            queue: Mutex::new(None),
        }
    }

    /// Whether streaming has started.
    #[must_use]
    pub fn is_started(&self) -> bool { self.started.load(Ordering::Acquire) }

    fn bind(&self, session: &Session) { *lock(&self.session) = session.downgrade(); }

    fn session(&self) -> Result<Session> { lock(&self.session).upgrade().ok_or(EtpError::Unbound) }

    /// Register channels the producer can serve.
    ///
    /// Returns the records created for uris not seen before. Uris a consumer
    /// already subscribed to are opened under the consumer's id and
    /// announced; other new channels are announced only once streaming has
    /// started.
    ///
    /// # Errors
    ///
    /// Fails if an announcement cannot be sent on the bound session.
    pub fn initialize_data_load<I, D>(&self, channels: I) -> Result<Vec<ChannelMetadataRecord>>
    where
        I: IntoIterator<Item = D>,
        D: Into<ChannelDescriptor>,
    {
        let started = self.is_started();
        let (added, announce) = {
            let mut state = lock(&self.state);
            let mut added = Vec::new();
            let mut announce = Vec::new();
            for descriptor in channels {
                let Some(record) = state.advertise(descriptor.into()) else {
                    continue;
                };
                if let Some(channel_id) = state.pending.get(&record.uri).copied() {
                    match state.open(&record.uri, channel_id) {
                        Ok(open) => {
                            debug!(uri = %open.uri, channel_id, "opened pending subscription");
                            announce.push(open);
                        }
                        Err(error) => {
                            warn!(uri = %record.uri, %error, "pending subscription not opened");
                        }
                    }
                } else if started {
                    announce.push(record.clone());
                }
                added.push(record);
            }
            (added, announce)
        };
        if !announce.is_empty()
            && let Ok(session) = self.session()
        {
            let parts = metadata_parts(announce, self.max_channels_per_message);
            session.send_multipart(Protocol::ChannelStreaming, parts, 0)?;
        }
        Ok(added)
    }

    /// Begin streaming to the bound session.
    ///
    /// The emission rate is the lower of `requested_rate` and the configured
    /// maximum. Every advertised channel is announced with
    /// `ChannelMetadata`. Returns `false` when streaming was already running.
    ///
    /// # Errors
    ///
    /// Returns [`EtpError::Unbound`] without a live session, or the send
    /// error for the announcement.
    pub fn start(&self, requested_rate: Option<u32>) -> Result<bool> {
        let session = self.session()?;
        let rate = requested_rate
            .filter(|rate| *rate > 0)
            .map_or(self.max_message_rate, |rate| rate.min(self.max_message_rate));
        {
            let mut queue = lock(&self.queue);
            if queue.is_some() {
                return Ok(false);
            }
            *queue = Some(OutboundQueue::spawn(session.downgrade(), rate));
            self.started.store(true, Ordering::Release);
        }
        info!(rate, "channel streaming started");

        let records = {
            let state = lock(&self.state);
            let mut records: Vec<_> = state.advertised.values().cloned().collect();
            records.sort_by_key(|record| record.channel_id);
            records
        };
        if !records.is_empty() {
            let parts = metadata_parts(records, self.max_channels_per_message);
            session.send_multipart(Protocol::ChannelStreaming, parts, 0)?;
        }
        Ok(true)
    }

    /// Open the advertised `uri` under `channel_id` and announce it.
    ///
    /// Returns the id of the `OpenChannel` message. No response is awaited;
    /// data arriving on the channel is the acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`EtpError::UnknownUri`] for uris never advertised,
    /// [`EtpError::ChannelInUse`] if the id is bound to another uri, and
    /// session send errors.
    pub fn open_channel(&self, uri: &str, channel_id: i64) -> Result<i64> {
        let session = self.session()?;
        lock(&self.state).open(uri, channel_id)?;
        session.send(
            Protocol::ChannelStreaming,
            MessageBody::OpenChannel(OpenChannel {
                channel_id,
                uri: uri.to_owned(),
            }),
            0,
        )
    }

    /// Queue real-time data. See [`ChannelProducer::infill_realtime_data`].
    ///
    /// # Errors
    ///
    /// As [`ChannelProducer::infill_realtime_data`].
    pub fn realtime_data(&self, items: Vec<DataItem>) -> Result<Option<i64>> {
        self.queue_data(DataKind::Realtime, items)
    }

    /// Queue infill data for open channels.
    ///
    /// Items for channels that are not open are dropped. The rest are split
    /// into messages of at most the negotiated item count and queued behind
    /// the rate limiter in the given order. Returns the id of the last
    /// queued message, or `None` when nothing was left to send.
    ///
    /// # Errors
    ///
    /// Returns [`EtpError::Unbound`] without a live session,
    /// [`EtpError::SessionClosed`] once the session is closing and
    /// [`EtpError::NotStarted`] before streaming starts.
    pub fn infill_realtime_data(&self, items: Vec<DataItem>) -> Result<Option<i64>> {
        self.queue_data(DataKind::Infill, items)
    }

    fn queue_data(&self, kind: DataKind, items: Vec<DataItem>) -> Result<Option<i64>> {
        let session = self.session()?;
        if session.state().is_closing() {
            return Err(EtpError::SessionClosed(
                session.close_reason().unwrap_or(CloseReason::Disconnected),
            ));
        }
        let queue = lock(&self.queue);
        let Some(queue) = queue.as_ref() else {
            return Err(EtpError::NotStarted);
        };
        let (mut items, max_items) = {
            let state = lock(&self.state);
            let offered = items.len();
            let items: Vec<_> = items
                .into_iter()
                .filter(|item| state.open.contains_key(&item.channel_id))
                .collect();
            if items.len() < offered {
                debug!(dropped = offered - items.len(), "dropping items for closed channels");
            }
            (items, state.max_data_items.max(1))
        };

        let mut last = None;
        while !items.is_empty() {
            let rest = items.split_off(items.len().min(max_items));
            let chunk = std::mem::replace(&mut items, rest);
            let body = match kind {
                DataKind::Realtime => MessageBody::RealtimeData(RealtimeData { items: chunk }),
                DataKind::Infill => {
                    MessageBody::InfillRealtimeData(InfillRealtimeData { items: chunk })
                }
            };
            let message_id = session.reserve_message_id()?;
            if !queue.push(message_id, body) {
                return Err(EtpError::SessionClosed(
                    session.close_reason().unwrap_or(CloseReason::Disconnected),
                ));
            }
            last = Some(message_id);
        }
        Ok(last)
    }

    /// Id the channel for `uri` is open under.
    #[must_use]
    pub fn channel_id(&self, uri: &str) -> Option<i64> {
        lock(&self.state)
            .open
            .values()
            .find(|record| record.uri == uri)
            .map(|record| record.channel_id)
    }

    /// Records of open channels, by id.
    #[must_use]
    pub fn open_channels(&self) -> Vec<ChannelMetadataRecord> {
        lock(&self.state).open.values().cloned().collect()
    }

    /// Records of every advertised channel, by producer id.
    #[must_use]
    pub fn advertised(&self) -> Vec<ChannelMetadataRecord> {
        let mut records: Vec<_> = lock(&self.state).advertised.values().cloned().collect();
        records.sort_by_key(|record| record.channel_id);
        records
    }

    fn on_open_channel(
        &self,
        session: &Session,
        open: OpenChannel,
    ) -> std::result::Result<(), HandlerError> {
        let outcome = {
            let mut state = lock(&self.state);
            if state.advertised.contains_key(&open.uri) {
                Some(state.open(&open.uri, open.channel_id)?)
            } else {
                state.pending.insert(open.uri.clone(), open.channel_id);
                None
            }
        };
        match outcome {
            Some(record) => {
                debug!(uri = %record.uri, channel_id = record.channel_id, "channel opened");
                session.send_with_flags(
                    Protocol::ChannelStreaming,
                    MessageBody::ChannelMetadata(ChannelMetadata {
                        channels: vec![record],
                    }),
                    0,
                    MessageFlags::FINAL_PART,
                )?;
            }
            None => {
                debug!(uri = %open.uri, channel_id = open.channel_id, "parking subscription to unknown uri");
            }
        }
        Ok(())
    }

    fn on_describe(
        &self,
        session: &Session,
        request_id: i64,
        uris: &[String],
    ) -> std::result::Result<(), HandlerError> {
        let records = lock(&self.state).describe(uris);
        if records.is_empty() {
            session.send_no_data(
                Protocol::ChannelStreaming,
                MessageKind::ChannelMetadata,
                request_id,
                MessageFlags::FINAL_PART,
            )?;
        } else {
            let parts = metadata_parts(records, self.max_channels_per_message);
            session.send_multipart(Protocol::ChannelStreaming, parts, request_id)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolHandler for ChannelProducer {
    fn protocol(&self) -> Protocol { Protocol::ChannelStreaming }

    fn role(&self) -> Role { Role::Producer }

    fn capabilities(&self) -> &'static [Capability] { &[Capability::ChannelDataProducer] }

    async fn on_session_opened(&self, session: &Session) {
        self.bind(session);
        if !session.peer_declared(Protocol::ChannelStreaming, Role::Consumer) {
            return;
        }
        if let Err(error) = self.start(None) {
            warn!(%error, "failed to start channel streaming");
        }
    }

    async fn handle(
        &self,
        session: &Session,
        message: EtpMessage,
    ) -> std::result::Result<(), HandlerError> {
        self.bind(session);
        let header = message.header;
        match message.body {
            MessageBody::Start(start) => {
                if start.max_data_items > 0 {
                    let mut state = lock(&self.state);
                    let requested = usize::try_from(start.max_data_items).unwrap_or(usize::MAX);
                    state.max_data_items = state.max_data_items.min(requested);
                }
                self.start(Some(start.max_message_rate))?;
            }
            MessageBody::ChannelDescribe(describe) => {
                self.on_describe(session, header.message_id, &describe.uris)?;
            }
            MessageBody::OpenChannel(open) => self.on_open_channel(session, open)?,
            MessageBody::CloseChannel(close) => {
                let mut state = lock(&self.state);
                for channel_id in &close.channel_ids {
                    if state.open.remove(channel_id).is_none() {
                        debug!(channel_id, "close for channel that is not open");
                    }
                }
                state
                    .pending
                    .retain(|_, channel_id| !close.channel_ids.contains(channel_id));
            }
            _ => {
                return Err(HandlerError::invalid_message_type(format!(
                    "producer does not accept message type {}",
                    header.message_type
                )));
            }
        }
        Ok(())
    }

    async fn on_session_closing(&self, _session: &Session, reason: &CloseReason) {
        let queue = lock(&self.queue).take();
        if let Some(queue) = queue {
            debug!(%reason, "flushing queued channel data");
            queue.flush().await;
        }
    }

    fn on_session_closed(&self, _reason: &CloseReason) {
        if let Some(queue) = lock(&self.queue).take() {
            queue.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn state() -> ProducerState {
        let mut state = ProducerState {
            next_channel_id: 1,
            advertised: BTreeMap::new(),
            open: BTreeMap::new(),
            pending: BTreeMap::new(),
            max_data_items: 10,
        };
        for uri in [
            "eml://witsml14/well(w)/wellbore(b)/log(l1)/GR",
            "eml://witsml14/well(w)/wellbore(b)/log(l1)/ROP",
            "eml://witsml14/well(w)/wellbore(b)/log(l10)/GR",
        ] {
            state.advertise(uri.into());
        }
        state
    }

    #[rstest]
    #[case("eml://witsml14/well(w)/wellbore(b)/log(l1)", 2)]
    #[case("eml://witsml14/well(w)/wellbore(b)/log(l1)/", 2)]
    #[case("eml://witsml14/well(w)/wellbore(b)", 3)]
    #[case("eml://witsml14/well(w)/wellbore(b)/log(l10)/GR", 1)]
    #[case("eml://witsml14/well(x)", 0)]
    fn describe_matches_uri_prefixes(#[case] uri: &str, #[case] expected: usize) {
        assert_eq!(state().describe(&[uri.to_owned()]).len(), expected);
    }

    #[test]
    fn advertising_twice_keeps_first_id() {
        let mut state = state();
        assert!(
            state
                .advertise("eml://witsml14/well(w)/wellbore(b)/log(l1)/GR".into())
                .is_none()
        );
        assert_eq!(state.next_channel_id, 4);
    }

    #[test]
    fn open_rebinds_to_requested_id() {
        let mut state = state();
        let uri = "eml://witsml14/well(w)/wellbore(b)/log(l1)/GR";

        let record = state.open(uri, 40).expect("open");
        assert_eq!(record.channel_id, 40);
        let record = state.open(uri, 41).expect("reopen");
        assert_eq!(record.channel_id, 41);
        assert_eq!(state.open.keys().copied().collect::<Vec<_>>(), vec![41]);
    }

    #[test]
    fn open_rejects_id_held_by_other_uri() {
        let mut state = state();
        state
            .open("eml://witsml14/well(w)/wellbore(b)/log(l1)/GR", 7)
            .expect("open");

        let error = state
            .open("eml://witsml14/well(w)/wellbore(b)/log(l1)/ROP", 7)
            .expect_err("conflict");
        assert!(matches!(error, EtpError::ChannelInUse { channel_id: 7, .. }));
    }

    #[test]
    fn open_unknown_uri_fails() {
        let error = state().open("eml://nowhere", 1).expect_err("unknown");
        assert!(matches!(error, EtpError::UnknownUri(_)));
    }

    #[test]
    fn metadata_is_split_by_message_limit() {
        let records = state().describe(&["eml://witsml14".to_owned()]);
        let parts = metadata_parts(records, 2);
        assert_eq!(parts.len(), 2);
    }
}
