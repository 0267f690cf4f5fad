//! Bounded access to one module's linear memory
//!
//! This is the only place that touches raw offsets. Everything else goes
//! through `read`/`write`, which refuse any range that does not fit.

use crate::{Result, SandboxError};
use std::fmt;
use wasmtime::{AsContext, AsContextMut, Memory};

/// Which module a memory belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Space {
    Guest,
    Network,
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Space::Guest => f.write_str("guest"),
            Space::Network => f.write_str("network"),
        }
    }
}

/// A module's linear memory, accessed only through bounds-checked copies
#[derive(Debug, Clone, Copy)]
pub struct AddressSpace {
    memory: Memory,
    space: Space,
}

impl AddressSpace {
    pub fn new(memory: Memory, space: Space) -> Self {
        Self { memory, space }
    }

    pub fn guest(memory: Memory) -> Self {
        Self::new(memory, Space::Guest)
    }

    pub fn network(memory: Memory) -> Self {
        Self::new(memory, Space::Network)
    }

    pub fn space(&self) -> Space {
        self.space
    }

    /// Current size of the memory in bytes. Memories can grow between calls,
    /// so this is re-read on every access.
    pub fn capacity(&self, store: impl AsContext) -> usize {
        self.memory.data_size(&store)
    }

    /// Fail unless `ptr..ptr + len` lies inside the memory
    pub fn check(&self, store: impl AsContext, ptr: u32, len: u32) -> Result<()> {
        let capacity = self.capacity(&store);
        let end = (ptr as usize).checked_add(len as usize);
        match end {
            Some(end) if end <= capacity => Ok(()),
            _ => Err(SandboxError::OutOfBounds {
                space: self.space,
                ptr,
                len,
                capacity,
            }),
        }
    }

    /// Copy `len` bytes out of the memory. The result never aliases module memory.
    pub fn read(&self, store: impl AsContext, ptr: u32, len: u32) -> Result<Vec<u8>> {
        self.check(&store, ptr, len)?;
        let mut buf = vec![0u8; len as usize];
        self.memory
            .read(&store, ptr as usize, &mut buf)
            .map_err(|_| self.out_of_bounds(&store, ptr, len))?;
        Ok(buf)
    }

    /// Overwrite memory at `ptr`. Nothing is written if any byte would fall outside.
    pub fn write(&self, mut store: impl AsContextMut, ptr: u32, bytes: &[u8]) -> Result<()> {
        let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
        self.check(&store, ptr, len)?;
        self.memory
            .write(&mut store, ptr as usize, bytes)
            .map_err(|_| self.out_of_bounds(&store, ptr, len))
    }

    fn out_of_bounds(&self, store: impl AsContext, ptr: u32, len: u32) -> SandboxError {
        SandboxError::OutOfBounds {
            space: self.space,
            ptr,
            len,
            capacity: self.capacity(store),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::{Engine, MemoryType, Store};

    const PAGE: usize = 64 * 1024;

    fn space() -> (Store<()>, AddressSpace) {
        let mut store = Store::new(&Engine::default(), ());
        let memory = Memory::new(&mut store, MemoryType::new(1, None)).unwrap();
        (store, AddressSpace::guest(memory))
    }

    #[test]
    fn test_write_then_read_returns_same_bytes() {
        let (mut store, space) = space();
        let bytes = b"\x0a\x00\x00\x01hello";

        space.write(&mut store, 128, bytes).unwrap();
        assert_eq!(space.read(&store, 128, bytes.len() as u32).unwrap(), bytes);

        // Up against the end of the memory is still in bounds
        let tail = [0xAB; 16];
        let ptr = (PAGE - tail.len()) as u32;
        space.write(&mut store, ptr, &tail).unwrap();
        assert_eq!(space.read(&store, ptr, 16).unwrap(), tail);
    }

    #[test]
    fn test_read_is_a_copy() {
        let (mut store, space) = space();
        space.write(&mut store, 0, &[1, 2, 3]).unwrap();

        let copy = space.read(&store, 0, 3).unwrap();
        space.write(&mut store, 0, &[9, 9, 9]).unwrap();

        assert_eq!(copy, vec![1, 2, 3]);
    }

    #[test]
    fn test_out_of_bounds_read_fails() {
        let (store, space) = space();

        let err = space.read(&store, (PAGE - 2) as u32, 4).unwrap_err();
        assert!(matches!(
            err,
            SandboxError::OutOfBounds { space: Space::Guest, len: 4, capacity: PAGE, .. }
        ));

        // ptr + len overflowing u32 must not wrap around
        assert!(space.read(&store, u32::MAX, 2).is_err());
    }

    #[test]
    fn test_out_of_bounds_write_leaves_memory_untouched() {
        let (mut store, space) = space();
        let ptr = (PAGE - 4) as u32;

        assert!(space.write(&mut store, ptr, &[0xFF; 8]).is_err());
        assert_eq!(space.read(&store, ptr, 4).unwrap(), vec![0; 4]);
    }
}
