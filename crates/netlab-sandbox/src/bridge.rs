//! Cross-space copies
//!
//! Bytes move between the guest and the network module by copying them into a
//! scratch buffer taken from the destination's own allocator. Every scratch
//! buffer is released on every exit path: normal return, empty result, or a
//! trap inside the downstream call.

use crate::memory::{AddressSpace, Space};
use crate::packet::{
    Packet, HEADER_LEN, PAYLOAD_OFFSET, SRC_IP_LEN, SRC_IP_OFFSET, SRC_PORT_LEN, SRC_PORT_OFFSET,
};
use crate::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use wasmtime::{AsContextMut, Instance, Trap, TypedFunc};

/// Names of the allocator exports on a module that receives scratch buffers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorExports {
    /// `(size: i32) -> i32`
    pub malloc: String,
    /// `(ptr: i32, size: i32)`
    pub free: String,
}

impl Default for AllocatorExports {
    fn default() -> Self {
        Self {
            malloc: "__wbindgen_malloc".to_string(),
            free: "__wbindgen_free".to_string(),
        }
    }
}

/// A buffer borrowed from a foreign allocator for the span of one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchAllocation {
    pub ptr: u32,
    pub len: u32,
}

/// A module's memory together with the allocator that manages it
#[derive(Clone)]
pub struct ForeignHeap {
    memory: AddressSpace,
    malloc: TypedFunc<i32, i32>,
    free: TypedFunc<(i32, i32), ()>,
}

impl ForeignHeap {
    pub fn from_instance(
        mut store: impl AsContextMut,
        instance: &Instance,
        space: Space,
        memory_export: &str,
        exports: &AllocatorExports,
    ) -> Result<Self> {
        let missing = |name: &str| SandboxError::MissingExport {
            module: space,
            name: name.to_string(),
        };

        let memory = instance
            .get_memory(&mut store, memory_export)
            .ok_or_else(|| missing(memory_export))?;
        let malloc = instance
            .get_typed_func::<i32, i32>(&mut store, &exports.malloc)
            .map_err(|_| missing(&exports.malloc))?;
        let free = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, &exports.free)
            .map_err(|_| missing(&exports.free))?;

        Ok(Self {
            memory: AddressSpace::new(memory, space),
            malloc,
            free,
        })
    }

    pub fn memory(&self) -> &AddressSpace {
        &self.memory
    }

    /// Run `op` with a fresh scratch buffer of `len` bytes, then release it.
    ///
    /// The buffer is released whether `op` succeeds or fails. If `op` failed,
    /// its error wins over any release failure.
    pub fn scoped<C, R>(
        &self,
        cx: &mut C,
        len: u32,
        op: impl FnOnce(&mut C, ScratchAllocation) -> Result<R>,
    ) -> Result<R>
    where
        C: AsContextMut,
    {
        let scratch = self.acquire(&mut *cx, len)?;
        let result = op(cx, scratch);
        let released = self.release(&mut *cx, scratch);

        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                warn!(%release_err, ptr = scratch.ptr, "scratch release failed after error");
                Err(err)
            }
        }
    }

    fn acquire(&self, mut cx: impl AsContextMut, len: u32) -> Result<ScratchAllocation> {
        let ptr = self
            .malloc
            .call(&mut cx, len as i32)
            .map_err(|e| trapped("alloc", e))? as u32;
        let scratch = ScratchAllocation { ptr, len };

        if let Err(err) = self.memory.check(&cx, ptr, len) {
            // The allocator handed back something unusable; give it back anyway.
            if let Err(release_err) = self.release(&mut cx, scratch) {
                warn!(%release_err, ptr, len, "scratch release failed after bad allocation");
            }
            return Err(err);
        }
        Ok(scratch)
    }

    fn release(&self, mut cx: impl AsContextMut, scratch: ScratchAllocation) -> Result<()> {
        self.free
            .call(&mut cx, (scratch.ptr as i32, scratch.len as i32))
            .map_err(|e| trapped("free", e))
    }
}

/// Describe a failure surfaced by a call into another module
pub(crate) fn trapped(call: &'static str, err: wasmtime::Error) -> SandboxError {
    let detail = match err.downcast_ref::<Trap>() {
        Some(trap) => trap.to_string(),
        None => format!("{err:#}"),
    };
    SandboxError::HostCallTrap { call, detail }
}

/// Copy `len` bytes at `src_ptr` into a scratch buffer on `dest`, then run `op`
/// with the scratch pointer and length.
pub fn relay<C, R>(
    cx: &mut C,
    src: &AddressSpace,
    src_ptr: u32,
    len: u32,
    dest: &ForeignHeap,
    op: impl FnOnce(&mut C, u32, u32) -> Result<R>,
) -> Result<R>
where
    C: AsContextMut,
{
    let bytes = src.read(&*cx, src_ptr, len)?;
    dest.scoped(cx, len, |cx, scratch| {
        dest.memory.write(&mut *cx, scratch.ptr, &bytes)?;
        op(cx, scratch.ptr, scratch.len)
    })
}

/// Where a received datagram's fields go (or come from)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvBuffers {
    pub payload: u32,
    pub capacity: u32,
    pub src_ip: u32,
    pub src_port: u32,
}

/// Let `op` fill a scratch buffer on `source` with `[ip][port][payload]`, then
/// copy each field to its own place in `dest`.
///
/// `op` returns the payload size; zero means nothing was available, in which
/// case `dest` is left untouched. All three destination ranges are checked
/// before anything is written.
pub fn collect<C>(
    cx: &mut C,
    source: &ForeignHeap,
    dest: &AddressSpace,
    targets: RecvBuffers,
    call: &'static str,
    op: impl FnOnce(&mut C, RecvBuffers) -> Result<i32>,
) -> Result<u32>
where
    C: AsContextMut,
{
    dest.check(&*cx, targets.payload, targets.capacity)?;
    dest.check(&*cx, targets.src_ip, SRC_IP_LEN)?;
    dest.check(&*cx, targets.src_port, SRC_PORT_LEN)?;

    let total = HEADER_LEN
        .checked_add(targets.capacity)
        .ok_or(SandboxError::OutOfBounds {
            space: dest.space(),
            ptr: targets.payload,
            len: targets.capacity,
            capacity: dest.capacity(&*cx),
        })?;

    source.scoped(cx, total, |cx, scratch| {
        let slots = RecvBuffers {
            payload: scratch.ptr + PAYLOAD_OFFSET,
            capacity: targets.capacity,
            src_ip: scratch.ptr + SRC_IP_OFFSET,
            src_port: scratch.ptr + SRC_PORT_OFFSET,
        };

        let reported = op(cx, slots)?;
        if reported == 0 {
            return Ok(0);
        }
        let read = u32::try_from(reported)
            .ok()
            .filter(|n| *n <= targets.capacity)
            .ok_or_else(|| SandboxError::HostCallTrap {
                call,
                detail: format!(
                    "reported {reported} bytes for a {}-byte buffer",
                    targets.capacity
                ),
            })?;

        let raw = source.memory.read(&*cx, scratch.ptr, HEADER_LEN + read)?;
        let packet = Packet::parse(&raw).ok_or_else(|| SandboxError::HostCallTrap {
            call,
            detail: format!("{} bytes is shorter than a datagram header", raw.len()),
        })?;
        debug!(%packet, "datagram crossing into guest");

        dest.write(&mut *cx, targets.payload, &packet.payload)?;
        dest.write(&mut *cx, targets.src_ip, &packet.src_ip_bytes())?;
        dest.write(&mut *cx, targets.src_port, &packet.src_port_bytes())?;
        Ok(read)
    })
}
