//! Host-side record of sockets the guest has opened
//!
//! Guest destructors do not run when the guest traps, so the guest cannot be
//! trusted to close what it opened. The ledger lives on the host side and is
//! drained by the orchestrator when an invocation ends, whatever the outcome.

use std::collections::HashSet;
use std::fmt;

/// Opaque socket identifier issued by the network module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(i32);

impl Handle {
    pub fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Sockets currently open on behalf of one orchestrator
#[derive(Debug, Default)]
pub struct ResourceLedger {
    open: HashSet<Handle>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a handle returned by bind. Returns false if it was already open.
    pub fn record(&mut self, handle: Handle) -> bool {
        self.open.insert(handle)
    }

    /// Forget a handle. Unknown handles are ignored.
    pub fn release(&mut self, handle: Handle) -> bool {
        self.open.remove(&handle)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.open.contains(&handle)
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Take every open handle, leaving the ledger empty
    pub fn drain(&mut self) -> Vec<Handle> {
        self.open.drain().collect()
    }
}
