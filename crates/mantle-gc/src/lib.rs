//! # Mantle memory core
//!
//! Object heap, write barrier, mostly-concurrent collector and thread
//! nexus for the Mantle VM.
//!
//! ## Design
//!
//! - **Handles, not pointers**: objects name each other by [`ObjectRef`];
//!   relocation rewrites one handle-table entry
//! - **Regions**: a nursery, growable old regions and a large object space
//! - **Write barrier**: the only way to store into a slot, so it cannot be
//!   skipped
//! - **Thread nexus**: registry of mutators and the stop-the-world protocol

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod barrier;
pub mod collector;
pub mod error;
pub mod heap;
pub mod nexus;
pub mod object;
pub mod region;
pub mod roots;
pub mod storage;
pub mod view;

pub use barrier::{BarrierRecord, WriteLog};
pub use collector::{
    CollectionReason, Collector, Cycle, CycleReport, GcObserver, GcPhase, GcStats,
};
pub use error::{GcError, GcResult};
pub use heap::{GcConfig, Heap, HeapInner};
pub use nexus::{StopTheWorld, ThreadKind, ThreadNexus, ThreadRecord, ThreadStatus};
pub use object::{ClassRef, MarkColor, ObjectClass, ObjectKind, ObjectRef, Value};
pub use region::Space;
pub use roots::ExecutionContext;
pub use view::grown_capacity;
