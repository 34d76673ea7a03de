//! Channel metadata records and streamed data items.

use bincode::{Decode, Encode};

/// Descriptive fields for a channel the producer can advertise.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Encode, Decode)]
pub struct ChannelDescriptor {
    pub uri: String,
    pub mnemonic: String,
    pub unit: String,
    pub data_type: ChannelDataType,
}

impl ChannelDescriptor {
    #[must_use]
    pub fn new(
        uri: impl Into<String>,
        mnemonic: impl Into<String>,
        unit: impl Into<String>,
        data_type: ChannelDataType,
    ) -> Self {
        Self {
            uri: uri.into(),
            mnemonic: mnemonic.into(),
            unit: unit.into(),
            data_type,
        }
    }

    /// Derive a descriptor from a bare uri.
    ///
    /// The mnemonic is the last path segment with any `(...)` selector
    /// stripped; the unit is left empty and the data type is `Double`.
    ///
    /// ```
    /// use wellstream::streaming::ChannelDescriptor;
    ///
    /// let d = ChannelDescriptor::from_uri("eml://witsml14/well(w1)/wellbore(b1)/log(l1)/GR");
    /// assert_eq!(d.mnemonic, "GR");
    /// ```
    #[must_use]
    pub fn from_uri(uri: &str) -> Self {
        let segment = uri.rsplit('/').next().unwrap_or(uri);
        let mnemonic = segment.split('(').next().unwrap_or(segment);
        Self::new(uri, mnemonic, "", ChannelDataType::Double)
    }

    /// Bind the descriptor to a channel id, producing the immutable record.
    #[must_use]
    pub fn into_record(self, channel_id: i64) -> ChannelMetadataRecord {
        ChannelMetadataRecord {
            channel_id,
            uri: self.uri,
            mnemonic: self.mnemonic,
            unit: self.unit,
            data_type: self.data_type,
        }
    }
}

impl From<&str> for ChannelDescriptor {
    fn from(uri: &str) -> Self { Self::from_uri(uri) }
}

impl From<String> for ChannelDescriptor {
    fn from(uri: String) -> Self { Self::from_uri(&uri) }
}

/// Value type of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Encode, Decode)]
pub enum ChannelDataType {
    Double,
    Long,
    Text,
    Boolean,
}

/// Metadata for an open channel, fixed for the channel's lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Encode, Decode)]
pub struct ChannelMetadataRecord {
    pub channel_id: i64,
    pub uri: String,
    pub mnemonic: String,
    pub unit: String,
    pub data_type: ChannelDataType,
}

impl ChannelMetadataRecord {
    /// Uri of the wellbore containing this channel's object.
    #[must_use]
    pub fn wellbore_uri(&self) -> String { wellbore_uri(&self.uri) }
}

/// Truncate `uri` after its `wellbore(...)` segment.
///
/// Uris without a wellbore segment are returned unchanged.
///
/// ```
/// use wellstream::streaming::wellbore_uri;
///
/// assert_eq!(
///     wellbore_uri("eml://witsml14/well(w1)/wellbore(b1)/log(l1)"),
///     "eml://witsml14/well(w1)/wellbore(b1)"
/// );
/// ```
#[must_use]
pub fn wellbore_uri(uri: &str) -> String {
    let Some(start) = uri.find("/wellbore(") else {
        return uri.to_owned();
    };
    match uri[start..].find(')') {
        Some(end) => uri[..=start + end].to_owned(),
        None => uri.to_owned(),
    }
}

/// Index of a data item: measured depth or a timestamp in microseconds.
#[derive(Clone, Copy, Debug, PartialEq, Encode, Decode)]
pub enum IndexValue {
    Depth(f64),
    Time(i64),
}

/// A single channel value.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub enum DataValue {
    Null,
    Double(f64),
    Long(i64),
    Text(String),
    Boolean(bool),
}

/// Extra attribute attached to a value, such as a quality flag.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct DataAttribute {
    pub attribute_id: i32,
    pub value: DataValue,
}

/// One indexed value for one channel.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct DataItem {
    pub channel_id: i64,
    pub index: IndexValue,
    pub value: DataValue,
    pub value_attributes: Vec<DataAttribute>,
}

impl DataItem {
    #[must_use]
    pub fn new(channel_id: i64, index: IndexValue, value: DataValue) -> Self {
        Self {
            channel_id,
            index,
            value,
            value_attributes: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("eml://witsml14/well(w)/wellbore(b)/log(l)/GR", "eml://witsml14/well(w)/wellbore(b)")]
    #[case("eml://witsml14/well(w)/wellbore(b)", "eml://witsml14/well(w)/wellbore(b)")]
    #[case("eml://witsml14/well(w)", "eml://witsml14/well(w)")]
    fn wellbore_uri_truncates_after_wellbore(#[case] uri: &str, #[case] expected: &str) {
        assert_eq!(wellbore_uri(uri), expected);
    }

    #[test]
    fn descriptor_from_uri_strips_selector() {
        let d = ChannelDescriptor::from_uri("eml://witsml14/well(w)/wellbore(b)/log(l)");
        assert_eq!(d.mnemonic, "log");
        assert_eq!(d.into_record(3).channel_id, 3);
    }
}
