//! Bodies of the channel streaming protocol.

use bincode::{Decode, Encode};

use crate::streaming::{ChannelMetadataRecord, DataItem};

/// Consumer request to begin streaming.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Start {
    pub max_message_rate: u32,
    pub max_data_items: u32,
}

/// Consumer request for metadata of the channels under `uris`.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct ChannelDescribe {
    pub uris: Vec<String>,
}

/// Producer advertisement of channel metadata.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct ChannelMetadata {
    pub channels: Vec<ChannelMetadataRecord>,
}

/// A batch of real-time data items.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct RealtimeData {
    pub items: Vec<DataItem>,
}

/// A batch of infill data items, filling gaps behind the real-time edge.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct InfillRealtimeData {
    pub items: Vec<DataItem>,
}

/// Binds `channel_id` to `uri`.
///
/// From a consumer this subscribes to the uri under a producer-assigned id;
/// from a producer it announces a channel the producer opened itself.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct OpenChannel {
    pub channel_id: i64,
    pub uri: String,
}

/// Stops streaming for the listed channels.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct CloseChannel {
    pub channel_ids: Vec<i64>,
}
