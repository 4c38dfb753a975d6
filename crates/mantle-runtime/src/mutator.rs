//! Per-thread mutator API
//!
//! A [`Mutator`] is a registered thread (or fiber) and the only handle the
//! interpreter needs to touch the heap. Every allocation is a safe point.
//! An allocation that runs out of memory triggers exactly one collection
//! and one retry before `OutOfMemory` is returned.
//!
//! Objects are only kept alive by roots: push a reference with
//! [`Mutator::push_root`] before the next allocation if it must survive.

use std::sync::Arc;

use mantle_gc::{
    CollectionReason, CycleReport, GcError, GcResult, Heap, ObjectClass, ObjectRef, ThreadKind,
    ThreadRecord, Value,
};

use crate::error::RuntimeResult;
use crate::shared_state::SharedState;

/// A registered mutator thread
pub struct Mutator {
    shared: Arc<SharedState>,
    record: Arc<ThreadRecord>,
}

impl Mutator {
    /// Register the calling thread
    pub fn new(shared: &Arc<SharedState>) -> RuntimeResult<Self> {
        let record = shared.register_thread(ThreadKind::Thread)?;
        Ok(Self {
            shared: Arc::clone(shared),
            record,
        })
    }

    /// Register a fiber owned by this thread; it starts suspended
    pub fn spawn_fiber(&self) -> RuntimeResult<Mutator> {
        let record = self.shared.register_fiber(self.id())?;
        Ok(Self {
            shared: Arc::clone(&self.shared),
            record,
        })
    }

    /// Thread id
    pub fn id(&self) -> u32 {
        self.record.id()
    }

    /// Nexus record
    pub fn record(&self) -> &Arc<ThreadRecord> {
        &self.record
    }

    /// Runtime this mutator belongs to
    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    fn heap(&self) -> &Heap {
        self.shared.heap()
    }

    // =========================================================================
    // Safe points
    // =========================================================================

    /// Poll for a pending stop and run a requested collection
    pub fn safe_point(&self) -> RuntimeResult<()> {
        self.shared.nexus().safe_point(&self.record);
        if self.shared.check_gc() {
            match self.collect(CollectionReason::Explicit) {
                Ok(_) | Err(GcError::Halted) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Run a full cycle now
    pub fn collect_garbage(&self) -> RuntimeResult<CycleReport> {
        Ok(self.collect(CollectionReason::Explicit)?)
    }

    fn collect(&self, reason: CollectionReason) -> GcResult<CycleReport> {
        self.shared.collector().collect(Some(&self.record), reason)
    }

    /// Make a suspended fiber runnable; blocks while a stop is in force
    pub fn activate(&self) {
        self.shared.nexus().activate(&self.record);
    }

    /// Suspend a fiber; it counts as safe until activated
    pub fn suspend(&self) {
        self.shared.nexus().suspend(&self.record);
    }

    /// Run `f` outside mutator code, holding native lock `lock_index`
    ///
    /// The thread is GC-safe for the whole call, including while it waits
    /// for the lock. `f` must not touch the heap.
    pub fn with_native<T>(&self, lock_index: u32, f: impl FnOnce() -> T) -> RuntimeResult<T> {
        self.shared.nexus().blocking(&self.record, || {
            self.shared.with_native_lock(lock_index, f)
        })
    }

    // =========================================================================
    // Roots
    // =========================================================================

    /// Push a root, returning its slot
    pub fn push_root(&self, value: Value) -> usize {
        self.record.context().push(value)
    }

    /// Pop the newest root
    pub fn pop_root(&self) -> Option<Value> {
        self.record.context().pop()
    }

    /// Root in `slot`
    pub fn root(&self, slot: usize) -> Option<Value> {
        self.record.context().get(slot)
    }

    /// Replace the root in `slot`
    pub fn set_root(&self, slot: usize, value: Value) -> bool {
        self.record.context().set(slot, value)
    }

    /// Drop roots above `len`
    pub fn truncate_roots(&self, len: usize) {
        self.record.context().truncate(len);
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Run an operation that may allocate
    ///
    /// The call is a safe point. On `OutOfMemory` one collection runs and
    /// `op` is retried once; failed operations leave their target unchanged,
    /// so the retry starts from the same state.
    fn allocating<T>(&self, op: impl Fn(&Heap) -> GcResult<T>) -> RuntimeResult<T> {
        self.safe_point()?;
        let result = match op(self.heap()) {
            Err(err) if err.is_out_of_memory() => {
                tracing::debug!(target: "mantle::runtime", id = self.id(), %err, "allocation failed, collecting");
                match self.collect(CollectionReason::AllocationFailure) {
                    Ok(_) => {}
                    Err(GcError::Halted) => return Err(err.into()),
                    Err(collect_err) => return Err(collect_err.into()),
                }
                op(self.heap()).inspect_err(|err| {
                    if err.is_out_of_memory() {
                        tracing::error!(target: "mantle::runtime", id = self.id(), %err, "out of memory after collection");
                    }
                })?
            }
            other => other?,
        };
        let collector = self.shared.collector();
        if !self.shared.gc_pending() && !collector.background_running() && collector.should_collect() {
            self.shared.gc_soon();
        }
        Ok(result)
    }

    /// Allocate an instance of a user class
    pub fn allocate_object(&self, class: &dyn ObjectClass) -> RuntimeResult<ObjectRef> {
        self.allocating(|heap| heap.allocate_object(class))
    }

    /// Allocate a tuple of `capacity` nil slots
    pub fn allocate_fields(&self, capacity: usize) -> RuntimeResult<ObjectRef> {
        self.allocating(|heap| heap.allocate_fields(capacity))
    }

    /// Allocate zeroed byte storage
    pub fn allocate_bytes(&self, len: usize) -> RuntimeResult<ObjectRef> {
        self.allocating(|heap| heap.allocate_bytes(len))
    }

    /// Allocate a boxed float
    pub fn allocate_float(&self, value: f64) -> RuntimeResult<ObjectRef> {
        self.allocating(|heap| heap.allocate_float(value))
    }

    /// Allocate an empty array with room for `capacity` elements
    pub fn allocate_array(&self, capacity: usize) -> RuntimeResult<ObjectRef> {
        self.allocating(|heap| heap.allocate_array(capacity))
    }

    /// Copy of an array
    pub fn array_dup(&self, view: ObjectRef) -> RuntimeResult<ObjectRef> {
        self.allocating(|heap| heap.array_dup(view))
    }

    /// Slice of an array, padded with nil
    pub fn array_new_range(&self, view: ObjectRef, index: i64, count: usize) -> RuntimeResult<ObjectRef> {
        self.allocating(|heap| heap.array_new_range(view, index, count))
    }

    // =========================================================================
    // Fields and views
    // =========================================================================

    /// Read a field; out of range reads yield nil
    pub fn read_field(&self, object: ObjectRef, index: i64) -> RuntimeResult<Value> {
        Ok(self.heap().read_field(object, index)?)
    }

    /// Write a field through the barrier; arrays grow as needed
    pub fn write_field(&self, object: ObjectRef, index: i64, value: Value) -> RuntimeResult<()> {
        self.allocating(|heap| heap.write_field(object, index, value))
    }

    /// Move an array's window, reallocating its storage if needed
    pub fn resize_view(&self, view: ObjectRef, new_start: usize, new_total: usize) -> RuntimeResult<()> {
        self.allocating(|heap| heap.resize_view(view, new_start, new_total))
    }

    /// Append to an array
    pub fn array_append(&self, view: ObjectRef, value: Value) -> RuntimeResult<()> {
        self.allocating(|heap| heap.array_append(view, value))
    }

    /// Prepend to an array
    pub fn array_unshift(&self, view: ObjectRef, value: Value) -> RuntimeResult<()> {
        self.allocating(|heap| heap.array_unshift(view, value))
    }

    /// Append every element of `other`
    pub fn array_concat(&self, view: ObjectRef, other: ObjectRef) -> RuntimeResult<()> {
        self.allocating(|heap| heap.array_concat(view, other))
    }

    /// Remove the last element
    pub fn array_pop(&self, view: ObjectRef) -> RuntimeResult<Value> {
        Ok(self.heap().array_pop(view)?)
    }

    /// Remove the first element
    pub fn array_shift(&self, view: ObjectRef) -> RuntimeResult<Value> {
        Ok(self.heap().array_shift(view)?)
    }

    /// Logical length of an array
    pub fn array_len(&self, view: ObjectRef) -> RuntimeResult<usize> {
        Ok(self.heap().array_len(view)?)
    }

    /// Elements of an array
    pub fn array_to_vec(&self, view: ObjectRef) -> RuntimeResult<Vec<Value>> {
        Ok(self.heap().array_to_vec(view)?)
    }

    /// Make an object immutable
    pub fn freeze(&self, object: ObjectRef) -> RuntimeResult<()> {
        Ok(self.heap().freeze(object)?)
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.shared.unregister_thread(&self.record);
    }
}
