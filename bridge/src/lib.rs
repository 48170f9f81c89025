//! `tether-bridge`: Wasmtime runtime for the Tether guest/host bridge.
//!
//! This crate loads a WebAssembly guest, links it against the boundary-call
//! adapters, and runs it. It provides:
//!
//! - **Adapters:** handles, strings, bytes, objects, closures, errors and
//!   promises, registered under the `tether` import module
//! - **Validation:** only known adapters and a `memory` may be imported
//! - **Memory negotiation:** exported, imported private, or imported shared
//!   memory, sized from the module's limits and the configuration
//! - **Loader:** bytes, files (compiled straight from disk) or buffered
//!   responses, with an observable phase and a start-once entry point
//!
//! The primary entry points are [`Bridge::instantiate`] and [`Loader`].

pub mod error;
pub mod config;
pub mod memory;
pub mod host_impl;
pub mod validation;
pub mod linker;
pub mod platform;
pub mod loader;
pub mod runtime;

pub use error::RuntimeError;
pub use config::BridgeConfig;
pub use host_impl::{Boundary, HostState};
pub use loader::{Loader, ModuleSource, Phase};
pub use memory::{GuestMemory, MemoryPlan, MemorySource};
pub use runtime::{Bridge, GuestInstance};
