//! Socket operations against the virtual network module
//!
//! Every handle bind returns goes into the store's `ResourceLedger`; `drain_all`
//! closes whatever the guest left open.

use crate::bridge::{self, trapped, AllocatorExports, ForeignHeap, RecvBuffers};
use crate::host::HostState;
use crate::ledger::Handle;
use crate::memory::{AddressSpace, Space};
use crate::{Result, SandboxError};
use tracing::{debug, warn};
use wasmtime::{AsContext, AsContextMut, Instance, TypedFunc};

/// Exports of an instantiated virtual network module
#[derive(Clone)]
pub struct VirtualNet {
    instance: Instance,
    heap: ForeignHeap,
    bind: TypedFunc<(i32, i32), i32>,
    unbind: TypedFunc<i32, ()>,
    send_to: TypedFunc<(i32, i32, i32, i32, i32), ()>,
    recv_from: TypedFunc<(i32, i32, i32, i32, i32), i32>,
    poll: TypedFunc<(), ()>,
}

impl VirtualNet {
    pub fn from_instance(
        mut store: impl AsContextMut,
        instance: Instance,
        memory_export: &str,
        allocator: &AllocatorExports,
    ) -> Result<Self> {
        let heap =
            ForeignHeap::from_instance(&mut store, &instance, Space::Network, memory_export, allocator)?;
        Ok(Self {
            instance,
            heap,
            bind: typed(&mut store, &instance, "udp_bind")?,
            unbind: typed(&mut store, &instance, "udp_unbind")?,
            send_to: typed(&mut store, &instance, "udp_send_to")?,
            recv_from: typed(&mut store, &instance, "udp_recv_from")?,
            poll: typed(&mut store, &instance, "poll_network")?,
        })
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }
}

fn typed<P, R>(store: impl AsContextMut, instance: &Instance, name: &str) -> Result<TypedFunc<P, R>>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    instance
        .get_typed_func::<P, R>(store, name)
        .map_err(|_| SandboxError::MissingExport {
            module: Space::Network,
            name: name.to_string(),
        })
}

fn network<C: AsContext<Data = HostState>>(cx: &C) -> Result<VirtualNet> {
    cx.as_context()
        .data()
        .network()
        .cloned()
        .ok_or(SandboxError::NetworkUnavailable)
}

/// Open a socket and record it in the ledger
pub fn bind<C>(cx: &mut C, ip: u32, port: u16) -> Result<Handle>
where
    C: AsContextMut<Data = HostState>,
{
    let net = network(&*cx)?;
    let raw = net
        .bind
        .call(&mut *cx, (ip as i32, i32::from(port)))
        .map_err(|e| trapped("udp_bind", e))?;

    let handle = Handle::from_raw(raw);
    if !cx.as_context_mut().data_mut().ledger.record(handle) {
        warn!(%handle, "network module reissued an open handle");
    }
    debug!(%handle, ip, port, "udp_bind");
    Ok(handle)
}

/// Close a socket. The ledger entry goes first so a trap here is never retried.
pub fn unbind<C>(cx: &mut C, handle: Handle) -> Result<()>
where
    C: AsContextMut<Data = HostState>,
{
    let net = network(&*cx)?;
    cx.as_context_mut().data_mut().ledger.release(handle);
    net.unbind
        .call(&mut *cx, handle.raw())
        .map_err(|e| trapped("udp_unbind", e))?;
    debug!(%handle, "udp_unbind");
    Ok(())
}

/// Send `len` bytes of guest memory at `buf` to `dst_ip:dst_port`
pub fn send_to<C>(
    cx: &mut C,
    guest: &AddressSpace,
    handle: Handle,
    buf: u32,
    len: u32,
    dst_ip: u32,
    dst_port: u16,
) -> Result<()>
where
    C: AsContextMut<Data = HostState>,
{
    let net = network(&*cx)?;
    bridge::relay(cx, guest, buf, len, &net.heap, |cx, ptr, len| {
        net.send_to
            .call(
                &mut *cx,
                (handle.raw(), ptr as i32, len as i32, dst_ip as i32, i32::from(dst_port)),
            )
            .map_err(|e| trapped("udp_send_to", e))
    })?;
    debug!(%handle, len, dst_ip, dst_port, "udp_send_to");
    Ok(())
}

/// Receive one datagram into guest memory. Returns 0 if nothing is queued.
pub fn recv_from<C>(
    cx: &mut C,
    guest: &AddressSpace,
    handle: Handle,
    targets: RecvBuffers,
) -> Result<u32>
where
    C: AsContextMut<Data = HostState>,
{
    let net = network(&*cx)?;
    let read = bridge::collect(cx, &net.heap, guest, targets, "udp_recv_from", |cx, slots| {
        net.recv_from
            .call(
                &mut *cx,
                (
                    handle.raw(),
                    slots.payload as i32,
                    slots.capacity as i32,
                    slots.src_ip as i32,
                    slots.src_port as i32,
                ),
            )
            .map_err(|e| trapped("udp_recv_from", e))
    })?;
    debug!(%handle, read, "udp_recv_from");
    Ok(read)
}

/// Advance the network's simulated time and queues
pub fn poll<C>(cx: &mut C) -> Result<()>
where
    C: AsContextMut<Data = HostState>,
{
    let net = network(&*cx)?;
    net.poll
        .call(&mut *cx, ())
        .map_err(|e| trapped("poll_network", e))
}

/// Unbind every socket still in the ledger. Each handle is unbound exactly once;
/// a failing unbind is logged and does not stop the rest.
pub fn drain_all<C>(cx: &mut C) -> Vec<Handle>
where
    C: AsContextMut<Data = HostState>,
{
    let handles = cx.as_context_mut().data_mut().ledger.drain();
    if handles.is_empty() {
        return handles;
    }
    let net = match network(&*cx) {
        Ok(net) => net,
        Err(err) => {
            warn!(%err, open = handles.len(), "cannot release sockets");
            return handles;
        }
    };

    for handle in &handles {
        match net.unbind.call(&mut *cx, handle.raw()) {
            Ok(()) => debug!(%handle, "released socket left open by guest"),
            Err(e) => warn!(%handle, err = %trapped("udp_unbind", e), "socket release failed"),
        }
    }
    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, ADDR_A, ADDR_B, ADDR_C};
    use wasmtime::{Memory, MemoryType, Store};

    fn setup() -> (Store<HostState>, AddressSpace) {
        let mut store = fixtures::store(HostState::default());
        let instance = fixtures::network_instance(&mut store);
        let net =
            VirtualNet::from_instance(&mut store, instance, "memory", &AllocatorExports::default())
                .unwrap();
        store.data_mut().attach_network(net);
        let memory = Memory::new(&mut store, MemoryType::new(1, None)).unwrap();
        (store, AddressSpace::guest(memory))
    }

    fn probe(store: &mut Store<HostState>, export: &str) -> i32 {
        let instance = *store.data().network().unwrap().instance();
        fixtures::probe(store, &instance, export)
    }

    #[test]
    fn test_bind_records_handle() {
        let (mut store, _) = setup();

        let h1 = bind(&mut store, ADDR_A, 8080).unwrap();
        let h2 = bind(&mut store, ADDR_A, 8081).unwrap();

        assert_ne!(h1, h2);
        assert!(store.data().ledger.contains(h1));
        assert_eq!(store.data().ledger.len(), 2);
    }

    #[test]
    fn test_unbind_forgets_handle() {
        let (mut store, _) = setup();
        let h = bind(&mut store, ADDR_A, 8080).unwrap();

        unbind(&mut store, h).unwrap();

        assert!(store.data().ledger.is_empty());
        assert_eq!(probe(&mut store, "unbind_count"), 1);
        assert!(drain_all(&mut store).is_empty());
        assert_eq!(probe(&mut store, "unbind_count"), 1);
    }

    #[test]
    fn test_unbind_unknown_handle_still_calls_network() {
        let (mut store, _) = setup();
        bind(&mut store, ADDR_A, 8080).unwrap();

        unbind(&mut store, Handle::from_raw(1)).unwrap();
        let err = unbind(&mut store, Handle::from_raw(42)).unwrap_err();

        assert!(matches!(err, SandboxError::HostCallTrap { call: "udp_unbind", .. }));
        assert_eq!(probe(&mut store, "unbind_count"), 1);
    }

    #[test]
    fn test_send_to_enqueues_tagged_datagram() {
        let (mut store, guest) = setup();
        guest.write(&mut store, 100, b"hello").unwrap();

        let h = bind(&mut store, ADDR_A, 8080).unwrap();
        send_to(&mut store, &guest, h, 100, 5, ADDR_B, 9090).unwrap();

        assert_eq!(probe(&mut store, "queued_len"), 5);
        assert_eq!(probe(&mut store, "queued_src_ip") as u32, ADDR_A);
        assert_eq!(probe(&mut store, "queued_src_port"), 8080);
        assert_eq!(probe(&mut store, "queued_dst_ip") as u32, ADDR_B);
        assert_eq!(probe(&mut store, "queued_dst_port"), 9090);
        assert_eq!(probe(&mut store, "live_allocs"), 0);
    }

    #[test]
    fn test_send_to_trap_releases_scratch() {
        let (mut store, guest) = setup();

        let err = send_to(&mut store, &guest, Handle::from_raw(7), 0, 4, ADDR_B, 1).unwrap_err();

        assert!(matches!(err, SandboxError::HostCallTrap { call: "udp_send_to", .. }));
        assert_eq!(probe(&mut store, "malloc_count"), 1);
        assert_eq!(probe(&mut store, "live_allocs"), 0);
    }

    #[test]
    fn test_recv_from_round_trip_through_queue() {
        let (mut store, guest) = setup();
        guest.write(&mut store, 100, b"0123456789").unwrap();
        let h = bind(&mut store, ADDR_C, 53).unwrap();
        send_to(&mut store, &guest, h, 100, 10, ADDR_C, 53).unwrap();

        let targets = RecvBuffers {
            payload: 300,
            capacity: 10,
            src_ip: 400,
            src_port: 404,
        };
        let read = recv_from(&mut store, &guest, h, targets).unwrap();

        assert_eq!(read, 10);
        assert_eq!(guest.read(&store, 300, 10).unwrap(), b"0123456789");
        assert_eq!(guest.read(&store, 400, 4).unwrap(), ADDR_C.to_le_bytes());
        assert_eq!(guest.read(&store, 404, 2).unwrap(), 53u16.to_le_bytes());
        assert_eq!(probe(&mut store, "live_allocs"), 0);

        // Queue is now empty
        assert_eq!(recv_from(&mut store, &guest, h, targets).unwrap(), 0);
        assert_eq!(probe(&mut store, "live_allocs"), 0);
    }

    #[test]
    fn test_poll_delegates() {
        let (mut store, _) = setup();
        poll(&mut store).unwrap();
        poll(&mut store).unwrap();
        assert_eq!(probe(&mut store, "poll_count"), 2);
    }

    #[test]
    fn test_drain_all_unbinds_each_once() {
        let (mut store, _) = setup();
        let mut opened = vec![
            bind(&mut store, ADDR_A, 1).unwrap(),
            bind(&mut store, ADDR_A, 2).unwrap(),
            bind(&mut store, ADDR_A, 3).unwrap(),
        ];

        let mut drained = drain_all(&mut store);
        drained.sort();
        opened.sort();

        assert_eq!(drained, opened);
        assert!(store.data().ledger.is_empty());
        assert_eq!(probe(&mut store, "unbind_count"), 3);
    }

    #[test]
    fn test_operations_without_network() {
        let mut store = fixtures::store(HostState::default());
        assert!(matches!(
            bind(&mut store, ADDR_A, 1),
            Err(SandboxError::NetworkUnavailable)
        ));
        assert!(drain_all(&mut store).is_empty());
    }
}
