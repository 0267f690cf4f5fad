//! Guest-signalled errors
//!
//! `report_error(ptr, len)` never returns to the guest. The message is decoded
//! and raised as a failure that unwinds the whole invocation.

use crate::memory::AddressSpace;
use crate::SandboxError;
use tracing::warn;
use wasmtime::AsContext;

/// Decode the guest's message at `ptr..ptr + len` into the error that ends the invocation
pub fn report_error(store: impl AsContext, guest: &AddressSpace, ptr: u32, len: u32) -> SandboxError {
    let bytes = match guest.read(&store, ptr, len) {
        Ok(bytes) => bytes,
        Err(err) => return err,
    };
    match String::from_utf8(bytes) {
        Ok(message) => {
            warn!(%message, "guest reported an error");
            SandboxError::GuestReported(message)
        }
        Err(err) => SandboxError::InvalidErrorMessage(err.utf8_error()),
    }
}
