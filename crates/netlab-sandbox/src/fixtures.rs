//! Test modules, written as WAT
//!
//! The network fixture is a loopback with a single-slot queue. It keeps
//! counters (live scratch allocations, unbinds, polls) so tests can check
//! what the host did to it.

use wasmtime::{Engine, Instance, Module, Store};

pub const NETWORK_WAT: &str = r#"
(module
  (memory (export "memory") 1)

  (global $heap (mut i32) (i32.const 4096))
  (global $live (mut i32) (i32.const 0))
  (global $mallocs (mut i32) (i32.const 0))
  (global $next (mut i32) (i32.const 1))
  (global $unbinds (mut i32) (i32.const 0))
  (global $polls (mut i32) (i32.const 0))
  (global $qlen (mut i32) (i32.const -1))
  (global $qip (mut i32) (i32.const 0))
  (global $qport (mut i32) (i32.const 0))
  (global $qdip (mut i32) (i32.const 0))
  (global $qdport (mut i32) (i32.const 0))

  (func (export "__wbindgen_malloc") (param $size i32) (result i32)
    (local $p i32)
    (local.set $p (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get $size)))
    (global.set $live (i32.add (global.get $live) (i32.const 1)))
    (global.set $mallocs (i32.add (global.get $mallocs) (i32.const 1)))
    (local.get $p))

  (func (export "__wbindgen_free") (param $ptr i32) (param $size i32)
    (global.set $live (i32.sub (global.get $live) (i32.const 1))))

  ;; sockets live at 256 + h*8: [ip][port]
  (func $check (param $h i32)
    (if (i32.or (i32.le_s (local.get $h) (i32.const 0))
                (i32.ge_s (local.get $h) (global.get $next)))
      (then unreachable)))

  (func (export "udp_bind") (param $ip i32) (param $port i32) (result i32)
    (local $h i32)
    (local.set $h (global.get $next))
    (global.set $next (i32.add (local.get $h) (i32.const 1)))
    (i32.store (i32.add (i32.const 256) (i32.mul (local.get $h) (i32.const 8))) (local.get $ip))
    (i32.store (i32.add (i32.const 260) (i32.mul (local.get $h) (i32.const 8))) (local.get $port))
    (local.get $h))

  (func (export "udp_unbind") (param $h i32)
    (call $check (local.get $h))
    (global.set $unbinds (i32.add (global.get $unbinds) (i32.const 1))))

  (func (export "udp_send_to")
    (param $h i32) (param $buf i32) (param $len i32) (param $dip i32) (param $dport i32)
    (call $check (local.get $h))
    (memory.copy (i32.const 1024) (local.get $buf) (local.get $len))
    (global.set $qlen (local.get $len))
    (global.set $qip (i32.load (i32.add (i32.const 256) (i32.mul (local.get $h) (i32.const 8)))))
    (global.set $qport (i32.load (i32.add (i32.const 260) (i32.mul (local.get $h) (i32.const 8)))))
    (global.set $qdip (local.get $dip))
    (global.set $qdport (local.get $dport)))

  (func (export "udp_recv_from")
    (param $h i32) (param $buf i32) (param $cap i32) (param $ipp i32) (param $portp i32)
    (result i32)
    (local $n i32)
    (call $check (local.get $h))
    (if (i32.lt_s (global.get $qlen) (i32.const 0))
      (then (return (i32.const 0))))
    (local.set $n (global.get $qlen))
    (if (i32.gt_s (local.get $n) (local.get $cap))
      (then (local.set $n (local.get $cap))))
    (memory.copy (local.get $buf) (i32.const 1024) (local.get $n))
    (i32.store (local.get $ipp) (global.get $qip))
    (i32.store16 (local.get $portp) (global.get $qport))
    (global.set $qlen (i32.const -1))
    (local.get $n))

  (func (export "poll_network")
    (global.set $polls (i32.add (global.get $polls) (i32.const 1))))

  (func (export "live_allocs") (result i32) (global.get $live))
  (func (export "malloc_count") (result i32) (global.get $mallocs))
  (func (export "bound_count") (result i32) (i32.sub (global.get $next) (i32.const 1)))
  (func (export "unbind_count") (result i32) (global.get $unbinds))
  (func (export "poll_count") (result i32) (global.get $polls))
  (func (export "queued_len") (result i32) (global.get $qlen))
  (func (export "queued_src_ip") (result i32) (global.get $qip))
  (func (export "queued_src_port") (result i32) (global.get $qport))
  (func (export "queued_dst_ip") (result i32) (global.get $qdip))
  (func (export "queued_dst_port") (result i32) (global.get $qdport))
)
"#;

pub fn store<T>(data: T) -> Store<T> {
    Store::new(&Engine::default(), data)
}

pub fn network_instance<T>(store: &mut Store<T>) -> Instance {
    let module = Module::new(store.engine(), NETWORK_WAT).unwrap();
    Instance::new(&mut *store, &module, &[]).unwrap()
}

pub fn probe<T>(store: &mut Store<T>, instance: &Instance, export: &str) -> i32 {
    instance
        .get_typed_func::<(), i32>(&mut *store, export)
        .unwrap()
        .call(&mut *store, ())
        .unwrap()
}

/// 10.0.0.1
pub const ADDR_A: u32 = 0x0A00_0001;
/// 10.0.0.2
pub const ADDR_B: u32 = 0x0A00_0002;
/// 10.0.0.53
pub const ADDR_C: u32 = 0x0A00_0035;
