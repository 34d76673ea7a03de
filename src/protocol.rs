//! Protocol identifiers, roles and negotiated capability descriptors.
//!
//! Every message on the wire is addressed by a numeric protocol id. The
//! protocols this crate understands form the closed [`Protocol`] enumeration;
//! anything else is carried as a raw id so the session can reject it without
//! treating the frame as malformed.

use std::fmt;

use bincode::{Decode, Encode};

/// Protocols known to this endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    /// Session establishment and teardown.
    Core,
    /// Producer/consumer streaming of channel data.
    ChannelStreaming,
    /// Bulk frame-oriented channel data.
    ChannelDataFrame,
    /// Discovery of the object hierarchy.
    Discovery,
    /// CRUD access to stored objects.
    Store,
    /// Change notifications for stored objects.
    StoreNotification,
    /// Ranges of growing objects.
    GrowingObject,
    /// Array payload transfer.
    DataArray,
}

impl Protocol {
    /// All known protocols in ascending id order.
    pub const ALL: [Protocol; 8] = [
        Protocol::Core,
        Protocol::ChannelStreaming,
        Protocol::ChannelDataFrame,
        Protocol::Discovery,
        Protocol::Store,
        Protocol::StoreNotification,
        Protocol::GrowingObject,
        Protocol::DataArray,
    ];

    /// Numeric identifier carried in the message header.
    #[must_use]
    pub const fn id(self) -> u16 {
        match self {
            Protocol::Core => 0,
            Protocol::ChannelStreaming => 1,
            Protocol::ChannelDataFrame => 2,
            Protocol::Discovery => 3,
            Protocol::Store => 4,
            Protocol::StoreNotification => 5,
            Protocol::GrowingObject => 6,
            Protocol::DataArray => 7,
        }
    }

    /// Look up a protocol by its wire identifier.
    #[must_use]
    pub fn from_id(id: u16) -> Option<Self> { Self::ALL.into_iter().find(|p| p.id() == id) }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Core => "core",
            Protocol::ChannelStreaming => "channel-streaming",
            Protocol::ChannelDataFrame => "channel-data-frame",
            Protocol::Discovery => "discovery",
            Protocol::Store => "store",
            Protocol::StoreNotification => "store-notification",
            Protocol::GrowingObject => "growing-object",
            Protocol::DataArray => "data-array",
        };
        write!(f, "{name}({})", self.id())
    }
}

/// Role an endpoint plays within a protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub enum Role {
    Client,
    Server,
    Producer,
    Consumer,
    Customer,
    Store,
}

impl Role {
    /// The role on the other end of a conversation with `self`.
    ///
    /// ```
    /// use wellstream::protocol::Role;
    ///
    /// assert_eq!(Role::Producer.counterpart(), Role::Consumer);
    /// assert_eq!(Role::Store.counterpart(), Role::Customer);
    /// ```
    #[must_use]
    pub const fn counterpart(self) -> Self {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
            Role::Producer => Role::Consumer,
            Role::Consumer => Role::Producer,
            Role::Customer => Role::Store,
            Role::Store => Role::Customer,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Client => "client",
            Role::Server => "server",
            Role::Producer => "producer",
            Role::Consumer => "consumer",
            Role::Customer => "customer",
            Role::Store => "store",
        };
        f.write_str(name)
    }
}

/// Protocol version advertised during session negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Encode, Decode)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub revision: u8,
    pub patch: u8,
}

impl Version {
    /// Version 1.1.0.0, the catalog implemented by this crate.
    pub const V1_1: Version = Version::new(1, 1, 0, 0);

    #[must_use]
    pub const fn new(major: u8, minor: u8, revision: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            revision,
            patch,
        }
    }

    /// Versions are compatible when their major numbers agree.
    #[must_use]
    pub const fn is_compatible_with(&self, other: &Version) -> bool { self.major == other.major }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.revision, self.patch
        )
    }
}

/// A `(protocol, version, role)` triple exchanged in `RequestSession` and
/// `OpenSession`.
///
/// The protocol is kept as its raw id so that a peer may list protocols this
/// endpoint does not know about.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Encode, Decode)]
pub struct SupportedProtocol {
    pub protocol: u16,
    pub version: Version,
    pub role: Role,
}

impl SupportedProtocol {
    #[must_use]
    pub fn new(protocol: Protocol, role: Role) -> Self {
        Self {
            protocol: protocol.id(),
            version: Version::V1_1,
            role,
        }
    }

    /// Replace the advertised version.
    #[must_use]
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// The known protocol this entry refers to, if any.
    #[must_use]
    pub fn kind(&self) -> Option<Protocol> { Protocol::from_id(self.protocol) }
}

/// Error codes carried by `ProtocolException`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    InvalidMessageType = 1,
    UnsupportedProtocol = 2,
    InvalidArgument = 3,
    InvalidState = 4,
    NoRole = 5,
    InvalidChannelId = 6,
    NotSupported = 7,
    UnsupportedVersion = 8,
}

impl ErrorCode {
    #[must_use]
    pub const fn code(self) -> u32 { self as u32 }

    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        [
            ErrorCode::InvalidMessageType,
            ErrorCode::UnsupportedProtocol,
            ErrorCode::InvalidArgument,
            ErrorCode::InvalidState,
            ErrorCode::NoRole,
            ErrorCode::InvalidChannelId,
            ErrorCode::NotSupported,
            ErrorCode::UnsupportedVersion,
        ]
        .into_iter()
        .find(|c| c.code() == code)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn protocol_ids_round_trip() {
        for protocol in Protocol::ALL {
            assert_eq!(Protocol::from_id(protocol.id()), Some(protocol));
        }
        assert_eq!(Protocol::from_id(999), None);
    }

    #[rstest]
    #[case(Role::Client)]
    #[case(Role::Producer)]
    #[case(Role::Customer)]
    fn counterpart_is_an_involution(#[case] role: Role) {
        assert_ne!(role.counterpart(), role);
        assert_eq!(role.counterpart().counterpart(), role);
    }

    #[test]
    fn versions_compare_on_major() {
        assert!(Version::V1_1.is_compatible_with(&Version::new(1, 0, 0, 0)));
        assert!(!Version::V1_1.is_compatible_with(&Version::new(2, 1, 0, 0)));
    }

    #[test]
    fn error_codes_round_trip() {
        assert_eq!(ErrorCode::from_code(2), Some(ErrorCode::UnsupportedProtocol));
        assert_eq!(ErrorCode::from_code(0), None);
    }
}
