//! Bridge error types.
//!
//! Two layers of failure cross the boundary:
//!
//! - [`BridgeError`] is a *fault*: a violation of the guest/host contract
//!   (bad handle, inert closure, stale memory view, malformed UTF-8) or a
//!   resource exhaustion. Faults are never caught by the bridge; they unwind
//!   to the outermost host call.
//! - [`CallError`] additionally carries a *thrown* host value, the recoverable
//!   outcome of a platform operation, which adapters park in the exception
//!   register instead of trapping.

use std::fmt;

use crate::types::HostValue;

/// A fatal boundary-protocol, encoding, or resource fault.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// The handle is out of range or names a free slot (use-after-free).
    #[error("{op}: invalid handle {handle}")]
    InvalidHandle { op: &'static str, handle: u32 },

    /// A closure was invoked or released after its destructor ran.
    #[error("{op}: closure invoked after it was destroyed")]
    InertClosure { op: &'static str },

    /// A consuming closure was invoked while one of its calls was in flight.
    #[error("closure invoked recursively while its context was borrowed")]
    ReentrantClosure,

    /// The guest start entry point was asked to run a second time.
    #[error("guest instance already started")]
    AlreadyStarted,

    /// A guest byte range did not hold valid UTF-8.
    #[error("invalid UTF-8 in guest range [{ptr}, +{len}): {reason}")]
    Encoding { ptr: u32, len: u32, reason: String },

    /// A guest range fell outside linear memory.
    #[error("{op}: range [{ptr}, +{len}) out of bounds for memory of {size} bytes")]
    OutOfBounds {
        op: &'static str,
        ptr: u32,
        len: u32,
        size: usize,
    },

    /// A typed access used a pointer not aligned to the element size.
    #[error("pointer {ptr} is not aligned to {align} bytes")]
    Misaligned { ptr: u32, align: usize },

    /// A memory view was used after the region it was built over was replaced.
    #[error("memory view used after the guest memory was replaced")]
    StaleView,

    /// Handle table or memory growth ran out of room.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// No linear memory is attached to the instance yet.
    #[error("guest memory is not attached")]
    NoMemory,

    /// A guest export the bridge relies on is missing or mistyped.
    #[error("guest export unavailable: {0}")]
    MissingExport(String),

    /// Malformed boundary-call arguments (bad flags, bad table entry, ...).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The guest trapped for a reason the bridge did not raise itself.
    #[error("guest trapped: {0}")]
    GuestTrap(String),
}

impl BridgeError {
    /// Returns true for faults raised by the guest breaking the handle or
    /// closure discipline, as opposed to memory or resource faults.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidHandle { .. }
                | Self::InertClosure { .. }
                | Self::ReentrantClosure
                | Self::AlreadyStarted
                | Self::Misaligned { .. }
                | Self::StaleView
                | Self::Protocol(_)
        )
    }
}

/// Outcome of invoking anything callable across the boundary.
#[derive(Clone)]
pub enum CallError {
    /// A host value was thrown. Recoverable: adapters store it in the
    /// exception register and the guest decides what to do with it.
    Thrown(HostValue),
    /// A fatal fault; propagates to the outermost host call.
    Fault(BridgeError),
}

impl CallError {
    /// Throw a `TypeError` carrying `message`.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::Thrown(HostValue::error("TypeError", message))
    }

    /// Throw a plain `Error` carrying `message`.
    pub fn thrown(message: impl Into<String>) -> Self {
        Self::Thrown(HostValue::error("Error", message))
    }

    /// Returns the thrown value, if this is not a fault.
    pub fn as_thrown(&self) -> Option<&HostValue> {
        match self {
            Self::Thrown(v) => Some(v),
            Self::Fault(_) => None,
        }
    }
}

impl From<BridgeError> for CallError {
    fn from(err: BridgeError) -> Self {
        Self::Fault(err)
    }
}

impl fmt::Debug for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thrown(v) => write!(f, "Thrown({})", v.debug_string()),
            Self::Fault(e) => write!(f, "Fault({e:?})"),
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thrown(v) => write!(f, "uncaught {}", v.debug_string()),
            Self::Fault(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CallError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_handle_names_operation() {
        let err = BridgeError::InvalidHandle {
            op: "object_drop_ref",
            handle: 40,
        };
        let s = err.to_string();
        assert!(s.contains("object_drop_ref"));
        assert!(s.contains("40"));
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_resource_faults_are_not_protocol_violations() {
        assert!(!BridgeError::ResourceExhausted("handles".into()).is_protocol_violation());
        assert!(!BridgeError::NoMemory.is_protocol_violation());
    }

    #[test]
    fn test_type_error_is_thrown() {
        let err = CallError::type_error("not a function");
        let thrown = err.as_thrown().expect("thrown");
        assert!(thrown.debug_string().starts_with("TypeError: not a function"));
    }

    #[test]
    fn test_fault_from_bridge_error() {
        let err: CallError = BridgeError::StaleView.into();
        assert!(err.as_thrown().is_none());
        assert_eq!(err.to_string(), BridgeError::StaleView.to_string());
    }
}
