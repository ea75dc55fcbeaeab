//! Shared engine context
//!
//! Every component receives one explicitly constructed [`InterceptContext`]
//! at configuration time instead of discovering collaborators through global
//! registries. The context is immutable after construction and cheap to
//! clone across connection handlers and capture threads.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use pnet::util::MacAddr;

use crate::capture::PacketSink;
use crate::firewall::Firewall;

/// Identity of the local interface the engine operates on.
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub name: String,
    pub mac: MacAddr,
    pub ipv4: Ipv4Addr,
    pub ipv6: Option<Ipv6Addr>,
}

impl InterfaceInfo {
    /// The responder address matching the given address family, if any.
    pub fn address_for(&self, ip: &IpAddr) -> Option<IpAddr> {
        match ip {
            IpAddr::V4(_) => Some(IpAddr::V4(self.ipv4)),
            IpAddr::V6(_) => self.ipv6.map(IpAddr::V6),
        }
    }

    /// Whether the given address is one of this interface's own addresses.
    pub fn owns_ip(&self, ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => *v4 == self.ipv4,
            IpAddr::V6(v6) => Some(*v6) == self.ipv6,
        }
    }
}

/// Endpoint directory for operator-readable logging ("who asked").
pub trait EndpointDirectory: Send + Sync {
    fn lookup_by_mac(&self, mac: MacAddr) -> Option<String>;
}

/// Directory stub when no reconnaissance data is available.
#[derive(Debug, Default)]
pub struct EmptyDirectory;

impl EndpointDirectory for EmptyDirectory {
    fn lookup_by_mac(&self, _mac: MacAddr) -> Option<String> {
        None
    }
}

/// Dependency-injected context shared by all engine components.
#[derive(Clone)]
pub struct InterceptContext {
    pub interface: InterfaceInfo,
    pub packet_sink: Arc<dyn PacketSink>,
    pub firewall: Arc<dyn Firewall>,
    pub endpoints: Arc<dyn EndpointDirectory>,
}

impl InterceptContext {
    pub fn new(
        interface: InterfaceInfo,
        packet_sink: Arc<dyn PacketSink>,
        firewall: Arc<dyn Firewall>,
        endpoints: Arc<dyn EndpointDirectory>,
    ) -> Self {
        Self {
            interface,
            packet_sink,
            firewall,
            endpoints,
        }
    }

    /// Human-readable tag for a MAC address, falling back to the address
    /// itself when the directory has no alias.
    pub fn who(&self, mac: MacAddr) -> String {
        self.endpoints
            .lookup_by_mac(mac)
            .unwrap_or_else(|| mac.to_string())
    }
}
