//! Channel streaming.
//!
//! A [`ChannelProducer`] advertises channels and pushes data batches through
//! a rate-limited queue; a [`ChannelConsumer`] subscribes, keeps its own
//! channel table and forwards data to a [`ChannelDataSink`]. Both are
//! [`ProtocolHandler`](crate::registry::ProtocolHandler)s bound to a session.

use std::sync::{Mutex, MutexGuard, PoisonError};

mod channel;
mod consumer;
mod outbound;
mod producer;
mod sink;

pub use channel::{
    ChannelDataType,
    ChannelDescriptor,
    ChannelMetadataRecord,
    DataAttribute,
    DataItem,
    DataValue,
    IndexValue,
    wellbore_uri,
};
pub use consumer::ChannelConsumer;
pub use producer::ChannelProducer;
pub use sink::{ChannelDataBatch, ChannelDataSink, DataKind, SinkError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
