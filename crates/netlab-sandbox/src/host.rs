//! Store state and the host functions linked into the guest

use crate::bridge::RecvBuffers;
use crate::capabilities::{Capability, CapabilitySet};
use crate::ledger::{Handle, ResourceLedger};
use crate::memory::{AddressSpace, Space};
use crate::network::{self, VirtualNet};
use crate::{guest, SandboxError};
use wasmtime::{Caller, Engine, Extern, Linker, StoreLimits};

/// Import module the guest links against
pub const ENV: &str = "env";

/// Data carried by the store shared between the guest and the network module
#[derive(Default)]
pub struct HostState {
    network: Option<VirtualNet>,
    pub(crate) ledger: ResourceLedger,
    memory_export: String,
    pub(crate) limits: StoreLimits,
}

impl HostState {
    pub fn new(memory_export: impl Into<String>, limits: StoreLimits) -> Self {
        Self {
            network: None,
            ledger: ResourceLedger::new(),
            memory_export: memory_export.into(),
            limits,
        }
    }

    pub fn network(&self) -> Option<&VirtualNet> {
        self.network.as_ref()
    }

    pub fn attach_network(&mut self, network: VirtualNet) {
        self.network = Some(network);
    }

    fn memory_export(&self) -> &str {
        if self.memory_export.is_empty() {
            "memory"
        } else {
            &self.memory_export
        }
    }
}

/// Memory of the guest currently calling into the host
fn guest_space(caller: &mut Caller<'_, HostState>) -> Result<AddressSpace, SandboxError> {
    let name = caller.data().memory_export().to_string();
    caller
        .get_export(&name)
        .and_then(Extern::into_memory)
        .map(AddressSpace::guest)
        .ok_or(SandboxError::MissingExport {
            module: Space::Guest,
            name,
        })
}

/// Build a linker exposing exactly the granted capabilities under `env`
pub fn capability_table(
    engine: &Engine,
    capabilities: &CapabilitySet,
) -> anyhow::Result<Linker<HostState>> {
    let mut linker = Linker::new(engine);
    for capability in capabilities.iter() {
        define(&mut linker, capability)?;
    }
    Ok(linker)
}

fn define(linker: &mut Linker<HostState>, capability: Capability) -> anyhow::Result<()> {
    let name = capability.import_name();
    match capability {
        Capability::UdpBind => {
            linker.func_wrap(
                ENV,
                name,
                |mut caller: Caller<'_, HostState>, ip: i32, port: i32| -> anyhow::Result<i32> {
                    let handle = network::bind(&mut caller, ip as u32, port as u16)?;
                    Ok(handle.raw())
                },
            )?;
        }
        Capability::UdpUnbind => {
            linker.func_wrap(
                ENV,
                name,
                |mut caller: Caller<'_, HostState>, handle: i32| -> anyhow::Result<()> {
                    network::unbind(&mut caller, Handle::from_raw(handle))?;
                    Ok(())
                },
            )?;
        }
        Capability::UdpSendTo => {
            linker.func_wrap(
                ENV,
                name,
                |mut caller: Caller<'_, HostState>,
                 handle: i32,
                 buf: i32,
                 len: i32,
                 dst_ip: i32,
                 dst_port: i32|
                 -> anyhow::Result<()> {
                    let guest = guest_space(&mut caller)?;
                    network::send_to(
                        &mut caller,
                        &guest,
                        Handle::from_raw(handle),
                        buf as u32,
                        len as u32,
                        dst_ip as u32,
                        dst_port as u16,
                    )?;
                    Ok(())
                },
            )?;
        }
        Capability::UdpRecvFrom => {
            linker.func_wrap(
                ENV,
                name,
                |mut caller: Caller<'_, HostState>,
                 handle: i32,
                 buf: i32,
                 len: i32,
                 src_ip_ptr: i32,
                 src_port_ptr: i32|
                 -> anyhow::Result<i32> {
                    let guest = guest_space(&mut caller)?;
                    let targets = RecvBuffers {
                        payload: buf as u32,
                        capacity: len as u32,
                        src_ip: src_ip_ptr as u32,
                        src_port: src_port_ptr as u32,
                    };
                    let read = network::recv_from(&mut caller, &guest, Handle::from_raw(handle), targets)?;
                    Ok(read as i32)
                },
            )?;
        }
        Capability::PollNetwork => {
            linker.func_wrap(
                ENV,
                name,
                |mut caller: Caller<'_, HostState>| -> anyhow::Result<()> {
                    network::poll(&mut caller)?;
                    Ok(())
                },
            )?;
        }
        Capability::ReportError => {
            linker.func_wrap(
                ENV,
                name,
                |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> anyhow::Result<()> {
                    let guest = guest_space(&mut caller)?;
                    Err(guest::report_error(&caller, &guest, ptr as u32, len as u32).into())
                },
            )?;
        }
    }
    Ok(())
}
