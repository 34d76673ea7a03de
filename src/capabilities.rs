//! Capability advertisement consumed during session negotiation.
//!
//! The session does not decide what it offers; a [`CapabilityProvider`]
//! supplies the local protocol/role list and the object content types the
//! endpoint can serve. [`StaticCapabilities`] covers the common case of a
//! fixed list.

use crate::protocol::{Protocol, Role, SupportedProtocol};

/// Source of the local capability list.
pub trait CapabilityProvider: Send + Sync + 'static {
    /// Protocols offered by this endpoint, each with the local role.
    fn supported_protocols(&self) -> Vec<SupportedProtocol>;

    /// Object content types this endpoint works with. Empty means "any".
    fn supported_object_types(&self) -> Vec<String> { Vec::new() }
}

/// Fixed capability list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StaticCapabilities {
    protocols: Vec<SupportedProtocol>,
    object_types: Vec<String>,
}

impl StaticCapabilities {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Offer `protocol` in `role` at the default version.
    #[must_use]
    pub fn with_protocol(self, protocol: Protocol, role: Role) -> Self {
        self.with_supported(SupportedProtocol::new(protocol, role))
    }

    /// Offer an explicit entry, replacing any entry for the same protocol and
    /// role.
    #[must_use]
    pub fn with_supported(mut self, entry: SupportedProtocol) -> Self {
        self.protocols
            .retain(|p| !(p.protocol == entry.protocol && p.role == entry.role));
        self.protocols.push(entry);
        self
    }

    #[must_use]
    pub fn with_object_type(mut self, content_type: impl Into<String>) -> Self {
        let content_type = content_type.into();
        if !self.object_types.contains(&content_type) {
            self.object_types.push(content_type);
        }
        self
    }
}

impl CapabilityProvider for StaticCapabilities {
    fn supported_protocols(&self) -> Vec<SupportedProtocol> { self.protocols.clone() }

    fn supported_object_types(&self) -> Vec<String> { self.object_types.clone() }
}
