//! Traits the runtime implements so the bridge core never touches an engine.
//!
//! [`GuestHeap`] gives the codec access to the guest allocator and the
//! current memory region. [`CallContext`] lets closures and promise
//! reactions call back into guest code and reach the host job queue.
//! The wasmtime runtime implements both on its boundary context; tests
//! implement them over a `Vec<u8>` and a recording mock.

use crate::error::{BridgeError, CallError};
use crate::promise::JobQueue;
use crate::types::HostValue;
use crate::views::{Region, ViewCache};

/// The guest's allocator plus its current linear memory.
///
/// `malloc` and `realloc` call into the guest and may grow (and so replace)
/// the memory region. Callers must re-fetch [`memory`](Self::memory) after
/// every allocation rather than holding a slice or view across it.
pub trait GuestHeap {
    /// Allocate `size` bytes in guest memory.
    fn malloc(&mut self, size: u32) -> Result<u32, BridgeError>;

    /// Resize a guest allocation, preserving its first `old_size` bytes.
    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32) -> Result<u32, BridgeError>;

    /// The current memory region and the view cache scoped to it.
    fn memory(&mut self) -> Result<(Region<'_>, &mut ViewCache), BridgeError>;
}

/// What a host-side callable needs while it runs.
pub trait CallContext {
    /// Call the guest function at table index `entry` with the closure
    /// context words and `args`. Arguments are handed to the guest as fresh
    /// handles it owns; a non-zero returned handle is taken as the result.
    fn call_guest(
        &mut self,
        entry: u32,
        a: u32,
        b: u32,
        args: &[HostValue],
    ) -> Result<HostValue, CallError>;

    /// Call the guest destructor at table index `dtor` with the context words.
    fn destroy_guest(&mut self, dtor: u32, a: u32, b: u32) -> Result<(), BridgeError>;

    /// The host job queue for asynchronous completions.
    fn jobs(&mut self) -> &mut JobQueue;
}
