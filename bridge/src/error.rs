//! Bridge runtime error types.

use tether_hostapi::BridgeError;

/// Top-level error type for the bridge runtime crate.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Wasmtime engine, compilation, or instantiation error.
    #[error("wasmtime error: {0}")]
    Wasmtime(#[from] anyhow::Error),

    /// Module validation failed (foreign imports, unknown adapters, bad exports).
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A boundary fault unwound to the host: protocol violation, bad
    /// encoding, or resource exhaustion.
    #[error("bridge fault: {0}")]
    Bridge(#[from] BridgeError),

    /// Memory negotiation failed.
    #[error("memory error: {0}")]
    MemoryError(String),

    /// The loader was driven out of order.
    #[error("loader error: {0}")]
    LoadError(String),

    /// Reading a module source failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A host value was thrown and nothing caught it. Carries its rendering,
    /// since host values cannot leave their instance.
    #[error("uncaught exception: {0}")]
    Thrown(String),

    /// WASM guest trapped.
    #[error("guest trapped: {0}")]
    GuestTrapped(String),
}

impl RuntimeError {
    /// The boundary fault behind this error, if there is one.
    pub fn as_bridge(&self) -> Option<&BridgeError> {
        match self {
            Self::Bridge(e) => Some(e),
            _ => None,
        }
    }
}
