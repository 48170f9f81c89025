//! Shared test helpers for integration tests.
//!
//! Guests are written in the WebAssembly text format. Every guest built
//! here carries a bump allocator behind the `tether_malloc` /
//! `tether_realloc` / `tether_free` exports (growing memory on demand) and
//! an exported function table for closure entry points. Only
//! [`guest_without_realloc`] leaves `tether_realloc` out.

#![allow(dead_code)]

use tether_bridge::{Bridge, BridgeConfig, GuestInstance, MemorySource, RuntimeError};

/// Scratch return area used by guests for `(ptr, len)` pairs.
pub const RET: u32 = 8;

/// Bump allocator and a no-op `free`. Allocations are 8-aligned; memory
/// grows by whole pages when the bump pointer passes the end.
const MALLOC: &str = r#"
  (table (export "__indirect_function_table") 16 funcref)
  (global $bump (mut i32) (i32.const 1024))
  (func $malloc (export "tether_malloc") (param $size i32) (result i32)
    (local $ptr i32)
    (local $end i32)
    (local $have i32)
    (local.set $ptr
      (i32.and (i32.add (global.get $bump) (i32.const 7)) (i32.const -8)))
    (local.set $end (i32.add (local.get $ptr) (local.get $size)))
    (local.set $have (i32.mul (memory.size) (i32.const 65536)))
    (if (i32.gt_u (local.get $end) (local.get $have))
      (then
        (if (i32.eq
              (memory.grow
                (i32.add
                  (i32.shr_u (i32.sub (local.get $end) (local.get $have)) (i32.const 16))
                  (i32.const 1)))
              (i32.const -1))
          (then unreachable))))
    (global.set $bump (local.get $end))
    (local.get $ptr))
  (func (export "tether_free") (param i32 i32))
"#;

/// `realloc` on top of [`MALLOC`]: a fresh block plus a copy.
const REALLOC: &str = r#"
  (func (export "tether_realloc") (param $ptr i32) (param $old i32) (param $new i32) (result i32)
    (local $fresh i32)
    (local.set $fresh (call $malloc (local.get $new)))
    (memory.copy (local.get $fresh) (local.get $ptr) (local.get $old))
    (local.get $fresh))
"#;

// ── Guest Builders ──

/// A guest that exports its own one-page memory.
pub fn guest(imports: &str, body: &str) -> String {
    format!(
        "(module\n{imports}\n  (memory (export \"memory\") 1)\n{MALLOC}{REALLOC}\n{body}\n)"
    )
}

/// Like [`guest`], but the allocator exports no `tether_realloc`.
pub fn guest_without_realloc(imports: &str, body: &str) -> String {
    format!(
        "(module\n{imports}\n  (memory (export \"memory\") 1)\n{MALLOC}\n{body}\n)"
    )
}

/// A guest that imports its memory, declared as `memory` (for example
/// `(memory 1 100 shared)`).
pub fn guest_importing_memory(memory: &str, imports: &str, body: &str) -> String {
    format!(
        "(module\n{imports}\n  (import \"tether\" \"memory\" {memory})\n{MALLOC}{REALLOC}\n{body}\n)"
    )
}

/// Import line for adapter `name` with the given signature.
pub fn import(name: &str, sig: &str) -> String {
    format!("  (import \"tether\" \"{name}\" (func ${name} {sig}))\n")
}

// ── Bridge Factories ──

/// Compile and validate `wat` with the default configuration.
pub fn bridge(wat: &str) -> Bridge {
    Bridge::new(wat.as_bytes(), BridgeConfig::default()).expect("bridge creation failed")
}

/// Compile `wat` and link one instance over fresh memory.
pub fn instance(wat: &str) -> GuestInstance {
    bridge(wat)
        .instantiate(MemorySource::Fresh)
        .expect("instantiation failed")
}

/// Call a nullary guest export that returns a handle.
pub fn call_handle(instance: &mut GuestInstance, name: &str) -> Result<u32, RuntimeError> {
    instance.call::<(), u32>(name, ())
}
