//! Layout of a received datagram inside a scratch buffer
//!
//! `[src_ip: 4][src_port: 2][payload: read_size]`, contiguous. The address and
//! port are the little-endian encodings the network module wrote (both modules
//! are wasm32). They are copied to the guest verbatim, never reordered.

use std::fmt;
use std::net::Ipv4Addr;

pub const SRC_IP_OFFSET: u32 = 0;
pub const SRC_IP_LEN: u32 = 4;
pub const SRC_PORT_OFFSET: u32 = SRC_IP_OFFSET + SRC_IP_LEN;
pub const SRC_PORT_LEN: u32 = 2;
pub const PAYLOAD_OFFSET: u32 = SRC_PORT_OFFSET + SRC_PORT_LEN;

/// Header bytes preceding the payload
pub const HEADER_LEN: u32 = PAYLOAD_OFFSET;

/// Structured view over a received datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Decode `[ip][port][payload]` as laid out by the network module.
    /// Returns `None` if `raw` is shorter than the header.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < HEADER_LEN as usize {
            return None;
        }
        let (ip, rest) = raw.split_at(SRC_IP_LEN as usize);
        let (port, payload) = rest.split_at(SRC_PORT_LEN as usize);
        Some(Self {
            src_ip: Ipv4Addr::from(u32::from_le_bytes([ip[0], ip[1], ip[2], ip[3]])),
            src_port: u16::from_le_bytes([port[0], port[1]]),
            payload: payload.to_vec(),
        })
    }

    /// Raw source-address bytes, as they cross into the guest
    pub fn src_ip_bytes(&self) -> [u8; 4] {
        u32::from(self.src_ip).to_le_bytes()
    }

    /// Raw source-port bytes, as they cross into the guest
    pub fn src_port_bytes(&self) -> [u8; 2] {
        self.src_port.to_le_bytes()
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} ({} bytes)",
            self.src_ip,
            self.src_port,
            self.payload.len()
        )
    }
}
