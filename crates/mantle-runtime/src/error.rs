//! Runtime errors

use mantle_gc::GcError;
use thiserror::Error;

use crate::phase::RuntimePhase;

/// Errors raised by the shared runtime state
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Memory core failure
    #[error(transparent)]
    Gc(#[from] GcError),

    /// New work refused because the runtime is shutting down
    #[error("runtime is halting")]
    Halting,

    /// Phase change that the state machine does not allow
    #[error("invalid phase transition from {from:?} to {to:?}")]
    InvalidPhaseTransition {
        /// Phase at the time of the request
        from: RuntimePhase,
        /// Requested phase
        to: RuntimePhase,
    },

    /// Lock table reinitialisation failed
    #[error("lock reset failed: {0}")]
    LockReset(String),

    /// Native lock index that was never issued
    #[error("unknown native lock index {0}")]
    UnknownNativeLock(u32),
}

/// Result type for runtime operations
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;
