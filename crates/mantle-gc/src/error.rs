//! Memory core errors

use std::time::Duration;

use thiserror::Error;

use crate::object::{ObjectKind, ObjectRef};

/// Errors raised by the heap, collector and thread nexus
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GcError {
    /// No region can satisfy the request, even after a collection
    #[error("OutOfMemory: cannot allocate {requested} bytes (heap limit {limit} bytes)")]
    OutOfMemory {
        /// Bytes requested
        requested: usize,
        /// Configured heap limit
        limit: usize,
    },

    /// Mutation attempted on a frozen object
    #[error("FrozenViolation: {0} is frozen")]
    FrozenViolation(ObjectRef),

    /// A store targeted a slot that cannot exist
    #[error("BoundsViolation: index {index} outside 0..{len}")]
    BoundsViolation {
        /// Requested index
        index: i64,
        /// Length the index was checked against
        len: usize,
    },

    /// A mutator failed to reach a safe point in time
    #[error("SafePointTimeout: threads {stragglers:?} did not park within {waited:?}")]
    SafePointTimeout {
        /// How long the requester waited
        waited: Duration,
        /// Thread ids that were still running
        stragglers: Vec<u32>,
    },

    /// The handle no longer names a live object
    #[error("InvalidHandle: {0} does not name a live object")]
    InvalidHandle(ObjectRef),

    /// The object has a different kind than the operation requires
    #[error("KindMismatch: {object} is not a {expected:?}")]
    KindMismatch {
        /// Offending object
        object: ObjectRef,
        /// Kind the operation needed
        expected: ObjectKind,
    },

    /// The collector has been shut down
    #[error("collector halted")]
    Halted,
}

impl GcError {
    /// True for errors that a collection might cure
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, GcError::OutOfMemory { .. })
    }
}

/// Result type for memory core operations
pub type GcResult<T> = std::result::Result<T, GcError>;
