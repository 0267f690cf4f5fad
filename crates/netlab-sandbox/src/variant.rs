//! Lesson variants: which host functions a guest gets, and how its result is read

use crate::capabilities::CapabilitySet;
use crate::memory::Space;
use crate::{Result, SandboxError};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Length of the IPv4 header the header lesson builds
pub const IP_HEADER_LEN: u32 = 20;
/// Length of the IPv4 + UDP datagram the datagram lesson builds
pub const UDP_DATAGRAM_LEN: u32 = 28;

/// What a successful invocation produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Bytes(Vec<u8>),
    Packet { packet: Vec<u8> },
}

impl Payload {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Payload::Bytes(bytes) => bytes,
            Payload::Packet { packet } => packet,
        }
    }
}

/// Turns the entrypoint's returned pointer into a payload.
///
/// Receives a read-only view of the guest's whole memory.
pub trait ResultInterpreter: Send + Sync {
    fn interpret(&self, result: u32, memory: &[u8]) -> Result<Payload>;
}

impl<F> ResultInterpreter for F
where
    F: Fn(u32, &[u8]) -> Result<Payload> + Send + Sync,
{
    fn interpret(&self, result: u32, memory: &[u8]) -> Result<Payload> {
        self(result, memory)
    }
}

/// `[len: u32 LE][bytes; len]` at the returned pointer
#[derive(Debug, Clone, Copy, Default)]
pub struct LengthPrefixed;

impl ResultInterpreter for LengthPrefixed {
    fn interpret(&self, result: u32, memory: &[u8]) -> Result<Payload> {
        let header = slice(memory, result, 4)?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let body = slice(memory, result.saturating_add(4), len)?;
        Ok(Payload::Bytes(body.to_vec()))
    }
}

fn slice(memory: &[u8], ptr: u32, len: u32) -> Result<&[u8]> {
    let start = ptr as usize;
    start
        .checked_add(len as usize)
        .and_then(|end| memory.get(start..end))
        .ok_or(SandboxError::OutOfBounds {
            space: Space::Guest,
            ptr,
            len,
            capacity: memory.len(),
        })
}

/// How the entrypoint's result is turned into a payload
#[derive(Clone)]
pub enum ResultShape {
    /// Exactly this many bytes at the returned pointer, wrapped as `Payload::Packet`
    Fixed(u32),
    /// Handed to an external interpretation step
    Interpreted(Arc<dyn ResultInterpreter>),
}

impl fmt::Debug for ResultShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultShape::Fixed(len) => f.debug_tuple("Fixed").field(len).finish(),
            ResultShape::Interpreted(_) => f.write_str("Interpreted"),
        }
    }
}

/// A lesson's capability surface and result shape
#[derive(Debug, Clone)]
pub struct Variant {
    name: &'static str,
    capabilities: CapabilitySet,
    result: ResultShape,
}

impl Variant {
    pub fn new(name: &'static str, capabilities: CapabilitySet, result: ResultShape) -> Self {
        Self {
            name,
            capabilities,
            result,
        }
    }

    /// Sockets, polling and error reporting; the result goes through `interpreter`
    pub fn full_networking(interpreter: impl ResultInterpreter + 'static) -> Self {
        Self::new(
            "full-networking",
            CapabilitySet::full_networking(),
            ResultShape::Interpreted(Arc::new(interpreter)),
        )
    }

    /// Error reporting only; returns a 20-byte IPv4 header
    pub fn ip_header() -> Self {
        Self::new(
            "ip-header",
            CapabilitySet::error_reporting(),
            ResultShape::Fixed(IP_HEADER_LEN),
        )
    }

    /// Error reporting only; returns a 28-byte IPv4 + UDP datagram
    pub fn udp_datagram() -> Self {
        Self::new(
            "udp-datagram",
            CapabilitySet::error_reporting(),
            ResultShape::Fixed(UDP_DATAGRAM_LEN),
        )
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn result(&self) -> &ResultShape {
        &self.result
    }
}
