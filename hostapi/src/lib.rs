//! `tether-hostapi`: engine-independent core of the Tether guest/host bridge.
//!
//! Guest code compiled to WebAssembly cannot hold host objects directly. This
//! crate provides the pieces that let it refer to them anyway:
//!
//! - `HandleTable`: small integer handles for host values, with slot reuse
//! - `ViewCache`: typed views over guest memory that go stale on growth
//! - `codec`: UTF-8 strings and byte arrays across the boundary
//! - `GuestClosure` / `Callable`: guest callables as host functions, with
//!   deterministic destructor invocation
//! - `PromiseRef` / `JobQueue`: asynchronous completion without re-entrant
//!   callbacks
//! - `CallContext` / `GuestHeap`: what the engine-specific runtime implements
//!
//! The wasmtime runtime lives in `tether-bridge`.

pub mod error;
pub mod types;
pub mod handles;
pub mod views;
pub mod traits;
pub mod codec;
pub mod closure;
pub mod promise;
pub mod json;

// Re-export commonly used types at the crate root.
pub use error::{BridgeError, CallError};
pub use types::{ArrayRef, BytesRef, ErrorValue, HostValue, ObjectRef};
pub use handles::{Handle, HandleTable};
pub use views::{Region, View, ViewCache};
pub use traits::{CallContext, GuestHeap};
pub use codec::{EncodeStrategy, GuestSlice};
pub use closure::{Callable, ClosureKind, GuestClosure};
pub use promise::{run_until_idle, JobQueue, PromiseRef, PromiseState};
