//! Capability table exposed to the guest
//!
//! Each lesson grants a guest only the host functions it needs. A guest that
//! imports anything else fails to link.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A host function the guest may import from `env`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// `udp_bind(ip, port) -> handle`
    UdpBind,
    /// `udp_unbind(handle)`
    UdpUnbind,
    /// `udp_send_to(handle, buf, len, dst_ip, dst_port)`
    UdpSendTo,
    /// `udp_recv_from(handle, buf, len, src_ip_ptr, src_port_ptr) -> read`
    UdpRecvFrom,
    /// `poll_network()`
    PollNetwork,
    /// `report_error(ptr, len)`, never returns
    ReportError,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::UdpBind,
        Capability::UdpUnbind,
        Capability::UdpSendTo,
        Capability::UdpRecvFrom,
        Capability::PollNetwork,
        Capability::ReportError,
    ];

    /// Import name inside the `env` module
    pub fn import_name(self) -> &'static str {
        match self {
            Capability::UdpBind => "udp_bind",
            Capability::UdpUnbind => "udp_unbind",
            Capability::UdpSendTo => "udp_send_to",
            Capability::UdpRecvFrom => "udp_recv_from",
            Capability::PollNetwork => "poll_network",
            Capability::ReportError => "report_error",
        }
    }

    /// Whether this call is backed by the virtual network module
    pub fn needs_network(self) -> bool {
        !matches!(self, Capability::ReportError)
    }
}

/// A set of capabilities granted to a guest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    capabilities: HashSet<Capability>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every socket call plus error reporting
    pub fn full_networking() -> Self {
        Capability::ALL.into_iter().collect()
    }

    /// Only `report_error`
    pub fn error_reporting() -> Self {
        Self::new().with(Capability::ReportError)
    }

    /// Grant a capability
    pub fn grant(&mut self, cap: Capability) -> &mut Self {
        self.capabilities.insert(cap);
        self
    }

    pub fn with(mut self, cap: Capability) -> Self {
        self.grant(cap);
        self
    }

    /// Check if a capability is granted
    pub fn has(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    /// Granted capabilities in a stable order
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|cap| self.has(*cap))
    }

    /// Whether any granted call needs the network module attached
    pub fn needs_network(&self) -> bool {
        self.capabilities.iter().any(|cap| cap.needs_network())
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self {
            capabilities: iter.into_iter().collect(),
        }
    }
}
