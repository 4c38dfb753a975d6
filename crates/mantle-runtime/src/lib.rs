//! # Mantle runtime
//!
//! Shared runtime state for the Mantle VM: the runtime phase, global
//! counters, the auxiliary lock table and the per-thread [`Mutator`] API
//! over the memory core in [`mantle_gc`].
//!
//! There are no globals. The process builds one [`SharedState`] at startup
//! and hands an `Arc` of it to every mutator.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod locks;
pub mod mutator;
pub mod phase;
pub mod shared_state;

pub use config::{NativeLockPolicy, RuntimeConfig};
pub use error::{RuntimeError, RuntimeResult};
pub use locks::{LockTable, SpinLock, SpinLockGuard};
pub use mutator::Mutator;
pub use phase::{AtomicPhase, RuntimePhase};
pub use shared_state::SharedState;
