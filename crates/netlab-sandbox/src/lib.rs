//! Netlab Sandbox - host bridge for the networking playground
//!
//! Lesson code runs as an untrusted guest WebAssembly module. The simulated
//! network stack runs as a second module. The two never share memory: every
//! byte that crosses between them is copied here, through bounds-checked
//! address spaces and scratch buffers that are always released.

mod bridge;
mod capabilities;
mod guest;
mod host;
mod ledger;
mod memory;
mod network;
mod packet;
mod runtime;
mod variant;

#[cfg(test)]
mod fixtures;

pub use bridge::{collect, relay, AllocatorExports, ForeignHeap, RecvBuffers, ScratchAllocation};
pub use capabilities::{Capability, CapabilitySet};
pub use host::HostState;
pub use ledger::{Handle, ResourceLedger};
pub use memory::{AddressSpace, Space};
pub use network::VirtualNet;
pub use packet::Packet;
pub use runtime::{Orchestrator, Outcome, Phase, SandboxConfig};
pub use variant::{
    LengthPrefixed, Payload, ResultInterpreter, ResultShape, Variant, IP_HEADER_LEN, UDP_DATAGRAM_LEN,
};

use std::str::Utf8Error;

/// Errors from sandbox operations
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Failed to compile WASM module: {0}")]
    CompilationFailed(String),

    #[error("Failed to instantiate {module} module: {reason}")]
    InstantiationFailed { module: Space, reason: String },

    #[error("{module} module does not export `{name}` with the expected signature")]
    MissingExport { module: Space, name: String },

    #[error("Virtual network module is not attached")]
    NetworkUnavailable,

    #[error("Out of bounds access to {space} memory: {len} bytes at {ptr} (capacity {capacity})")]
    OutOfBounds {
        space: Space,
        ptr: u32,
        len: u32,
        capacity: usize,
    },

    /// Raised by the guest through `report_error`; displays the message verbatim.
    #[error("{0}")]
    GuestReported(String),

    #[error("Guest error message is not valid UTF-8: {0}")]
    InvalidErrorMessage(#[source] Utf8Error),

    #[error("Host call `{call}` failed: {detail}")]
    HostCallTrap { call: &'static str, detail: String },

    #[error("Guest trapped: {0}")]
    GuestTrap(String),

    #[error("Guest module does not export entrypoint `{0}`")]
    MissingEntrypoint(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
