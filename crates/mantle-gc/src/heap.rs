//! GC Heap management
//!
//! [`Heap`] is shared between mutator threads. Its state lives in
//! [`HeapInner`] behind a single `RwLock`: reads take the read side, and
//! stores, allocation and collector steps take the write side. The write
//! barrier runs under the same lock as the store it guards, so a barrier
//! record is visible to the collector no later than the store itself.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rustc_hash::FxHashMap;

use crate::barrier::WriteLog;
use crate::collector::GcPhase;
use crate::error::{GcError, GcResult};
use crate::object::{
    ClassRef, Fields, HEADER_BYTES, HeapObject, MarkColor, ObjectBody, ObjectClass, ObjectKind,
    ObjectRef, Value, ViewHeader, WORD_BYTES, align_to_word,
};
use crate::region::{Location, RegionLimits, RegionSet, Space};

/// GC configuration
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Nursery size (default: 256KB)
    pub nursery_bytes: usize,
    /// Old region size (default: 1MB)
    pub region_bytes: usize,
    /// Hard heap limit (default: 64MB)
    pub max_heap_bytes: usize,
    /// Large object threshold (default: 8KB)
    pub large_object_threshold: usize,
    /// Lower bound for the collection trigger (default: 1MB)
    pub min_gc_threshold: usize,
    /// Next trigger is live bytes after the last cycle times this (default: 2.0)
    pub growth_factor: f64,
    /// Allocations between policy-triggered cycles (default: 100_000)
    pub allocation_count_threshold: usize,
    /// Time between policy-triggered cycles (default: none)
    pub collection_interval: Option<Duration>,
    /// Resume mutators while marking (default: true)
    pub concurrent_marking: bool,
    /// Gray objects processed per mark step (default: 256)
    pub mark_step_budget: usize,
    /// Longest wait for mutators to park (default: 5s)
    pub safe_point_timeout: Duration,
    /// Cycles a nursery object survives before promotion (default: 1)
    pub promotion_age: u8,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            nursery_bytes: 256 * 1024,
            region_bytes: 1024 * 1024,
            max_heap_bytes: 64 * 1024 * 1024,
            large_object_threshold: 8 * 1024,
            min_gc_threshold: 1024 * 1024,
            growth_factor: 2.0,
            allocation_count_threshold: 100_000,
            collection_interval: None,
            concurrent_marking: true,
            mark_step_budget: 256,
            safe_point_timeout: Duration::from_secs(5),
            promotion_age: 1,
        }
    }
}

impl GcConfig {
    fn region_limits(&self) -> RegionLimits {
        RegionLimits {
            nursery_bytes: self.nursery_bytes,
            region_bytes: self.region_bytes,
            large_object_threshold: self.large_object_threshold,
        }
    }
}

/// Bytes charged for an object with `count` reference slots
fn slots_size(count: usize) -> usize {
    count.saturating_mul(WORD_BYTES).saturating_add(HEADER_BYTES)
}

#[derive(Debug, Clone, Copy)]
struct HandleEntry {
    generation: u32,
    location: Option<Location>,
}

/// Handle-to-location indirection table
///
/// Relocating an object rewrites its entry here and nowhere else.
#[derive(Debug, Default)]
pub(crate) struct HandleTable {
    entries: Vec<HandleEntry>,
    free: Vec<u32>,
    live: usize,
}

impl HandleTable {
    fn reserve(&mut self) -> ObjectRef {
        self.live += 1;
        match self.free.pop() {
            Some(index) => ObjectRef::new(index, self.entries[index as usize].generation),
            None => {
                self.entries.push(HandleEntry {
                    generation: 0,
                    location: None,
                });
                ObjectRef::new((self.entries.len() - 1) as u32, 0)
            }
        }
    }

    fn entry(&self, handle: ObjectRef) -> Option<&HandleEntry> {
        self.entries
            .get(handle.index() as usize)
            .filter(|e| e.generation == handle.generation())
    }

    pub(crate) fn resolve(&self, handle: ObjectRef) -> GcResult<Location> {
        self.entry(handle)
            .and_then(|e| e.location)
            .ok_or(GcError::InvalidHandle(handle))
    }

    pub(crate) fn relocate(&mut self, handle: ObjectRef, location: Location) {
        if let Some(entry) = self.entries.get_mut(handle.index() as usize) {
            debug_assert_eq!(entry.generation, handle.generation());
            entry.location = Some(location);
        }
    }

    pub(crate) fn release(&mut self, handle: ObjectRef) {
        if let Some(entry) = self.entries.get_mut(handle.index() as usize) {
            if entry.generation == handle.generation() {
                entry.generation = entry.generation.wrapping_add(1);
                entry.location = None;
                self.free.push(handle.index());
                self.live -= 1;
            }
        }
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }
}

/// Heap state guarded by the heap lock
#[derive(Debug)]
pub struct HeapInner {
    pub(crate) handles: HandleTable,
    pub(crate) regions: RegionSet,
    pub(crate) write_log: WriteLog,
    pub(crate) phase: GcPhase,
    pub(crate) pinned: FxHashMap<ObjectRef, usize>,
    max_heap_bytes: usize,
}

impl HeapInner {
    fn new(config: &GcConfig) -> Self {
        Self {
            handles: HandleTable::default(),
            regions: RegionSet::new(config.region_limits()),
            write_log: WriteLog::new(),
            phase: GcPhase::Idle,
            pinned: FxHashMap::default(),
            max_heap_bytes: config.max_heap_bytes,
        }
    }

    /// Resolve a handle to its object
    pub fn object(&self, handle: ObjectRef) -> GcResult<&HeapObject> {
        let location = self.handles.resolve(handle)?;
        self.regions
            .get(location)
            .ok_or(GcError::InvalidHandle(handle))
    }

    pub(crate) fn object_mut(&mut self, handle: ObjectRef) -> GcResult<&mut HeapObject> {
        let location = self.handles.resolve(handle)?;
        self.regions
            .get_mut(location)
            .ok_or(GcError::InvalidHandle(handle))
    }

    /// Mark color of the referent, `None` for immediates
    pub(crate) fn value_color(&self, value: Value) -> GcResult<Option<MarkColor>> {
        match value {
            Value::Ref(r) => Ok(Some(self.object(r)?.header.mark())),
            _ => Ok(None),
        }
    }

    /// Current collector phase
    pub fn phase(&self) -> GcPhase {
        self.phase
    }

    /// Space an object currently lives in
    pub fn space_of(&self, handle: ObjectRef) -> GcResult<Space> {
        let location = self.handles.resolve(handle)?;
        self.regions
            .space_of(location)
            .ok_or(GcError::InvalidHandle(handle))
    }

    /// Allocate and place a new object
    ///
    /// Fails with `OutOfMemory` when the heap limit would be exceeded; the
    /// caller decides whether to collect and retry.
    pub(crate) fn allocate(&mut self, class: ClassRef, body: ObjectBody) -> GcResult<ObjectRef> {
        self.ensure_room(body.byte_size())?;

        let handle = self.handles.reserve();
        let mut object = HeapObject::new(handle, class, body);
        // Black allocation: objects born during a cycle survive it
        if self.phase.barrier_active() {
            object.header.set_mark(MarkColor::Black);
        }
        let location = self.regions.place(object);
        self.handles.relocate(handle, location);
        Ok(handle)
    }

    /// Fail with `OutOfMemory` unless `size` more bytes fit under the limit
    pub(crate) fn ensure_room(&self, size: usize) -> GcResult<()> {
        match self.regions.used().checked_add(size) {
            Some(total) if total <= self.max_heap_bytes => Ok(()),
            _ => Err(GcError::OutOfMemory {
                requested: size,
                limit: self.max_heap_bytes,
            }),
        }
    }

    pub(crate) fn allocate_tuple(&mut self, capacity: usize) -> GcResult<ObjectRef> {
        self.ensure_room(slots_size(capacity))?;
        self.allocate(ClassRef::TUPLE, ObjectBody::Tuple(Fields::new(capacity)))
    }

    /// Allocate an empty view over a fresh tuple of `capacity` slots
    pub(crate) fn allocate_view(&mut self, capacity: usize) -> GcResult<ObjectRef> {
        let storage = self.allocate_tuple(capacity)?;
        self.allocate(ClassRef::ARRAY, ObjectBody::Array(ViewHeader::new(storage)))
    }

    /// The single slot-store primitive
    ///
    /// Every write of a value into an instance or tuple slot lands here and
    /// passes through the write barrier.
    pub(crate) fn store_field(
        &mut self,
        holder: ObjectRef,
        index: usize,
        value: Value,
    ) -> GcResult<()> {
        let value_color = self.value_color(value)?;
        let phase = self.phase;
        let location = self.handles.resolve(holder)?;
        let object = self
            .regions
            .get_mut(location)
            .ok_or(GcError::InvalidHandle(holder))?;
        if object.header.is_frozen() {
            return Err(GcError::FrozenViolation(holder));
        }
        let holder_color = object.header.mark();
        let fields = match &mut object.body {
            ObjectBody::Instance(fields) | ObjectBody::Tuple(fields) => fields,
            _ => {
                return Err(GcError::KindMismatch {
                    object: holder,
                    expected: ObjectKind::Tuple,
                });
            }
        };
        if index >= fields.len() {
            return Err(GcError::BoundsViolation {
                index: index as i64,
                len: fields.len(),
            });
        }
        let ticket = self
            .write_log
            .record_write(phase, holder, holder_color, value, value_color);
        fields.put(index, ticket);
        Ok(())
    }

    /// Swap the backing tuple of a view, through the barrier
    pub(crate) fn store_view_storage(&mut self, view: ObjectRef, storage: ObjectRef) -> GcResult<()> {
        let value = Value::Ref(storage);
        let value_color = self.value_color(value)?;
        let phase = self.phase;
        let location = self.handles.resolve(view)?;
        let object = self
            .regions
            .get_mut(location)
            .ok_or(GcError::InvalidHandle(view))?;
        if object.header.is_frozen() {
            return Err(GcError::FrozenViolation(view));
        }
        let holder_color = object.header.mark();
        let ObjectBody::Array(header) = &mut object.body else {
            return Err(GcError::KindMismatch {
                object: view,
                expected: ObjectKind::Array,
            });
        };
        let ticket = self
            .write_log
            .record_write(phase, view, holder_color, value, value_color);
        header.replace_storage(ticket);
        Ok(())
    }

    /// Slots of an instance or tuple
    pub(crate) fn fields(&self, handle: ObjectRef) -> GcResult<&Fields> {
        match &self.object(handle)?.body {
            ObjectBody::Instance(fields) | ObjectBody::Tuple(fields) => Ok(fields),
            _ => Err(GcError::KindMismatch {
                object: handle,
                expected: ObjectKind::Tuple,
            }),
        }
    }

    /// Fail with `FrozenViolation` if the object is frozen
    pub(crate) fn check_mutable(&self, handle: ObjectRef) -> GcResult<()> {
        if self.object(handle)?.header.is_frozen() {
            Err(GcError::FrozenViolation(handle))
        } else {
            Ok(())
        }
    }

    fn bytes_mut(&mut self, handle: ObjectRef) -> GcResult<&mut [u8]> {
        let object = self.object_mut(handle)?;
        if object.header.is_frozen() {
            return Err(GcError::FrozenViolation(handle));
        }
        match &mut object.body {
            ObjectBody::ByteArray(bytes) => Ok(bytes),
            _ => Err(GcError::KindMismatch {
                object: handle,
                expected: ObjectKind::ByteArray,
            }),
        }
    }

    fn bytes(&self, handle: ObjectRef) -> GcResult<&[u8]> {
        match &self.object(handle)?.body {
            ObjectBody::ByteArray(bytes) => Ok(bytes),
            _ => Err(GcError::KindMismatch {
                object: handle,
                expected: ObjectKind::ByteArray,
            }),
        }
    }

    pub(crate) fn pin(&mut self, handle: ObjectRef) -> GcResult<()> {
        self.object(handle)?;
        *self.pinned.entry(handle).or_insert(0) += 1;
        Ok(())
    }

    pub(crate) fn unpin(&mut self, handle: ObjectRef) {
        if let Some(count) = self.pinned.get_mut(&handle) {
            *count -= 1;
            if *count == 0 {
                self.pinned.remove(&handle);
            }
        }
    }
}

/// Release every guard on `lock`, shared or exclusive
///
/// # Safety
///
/// None of the holders may touch the lock again; in practice they are
/// threads that did not survive `fork`.
pub(crate) unsafe fn force_release<T>(lock: &RwLock<T>) {
    if lock.is_locked_exclusive() {
        // SAFETY: caller contract
        unsafe { lock.force_unlock_write() };
    }
    while lock.is_locked() {
        // SAFETY: caller contract; one reader released per pass
        unsafe { lock.force_unlock_read() };
    }
}

/// Main GC heap - shared between threads
pub struct Heap {
    config: GcConfig,
    inner: RwLock<HeapInner>,
    /// Mirror of `HeapInner::phase` readable without the lock
    phase: AtomicU8,
    /// Mirror of bytes in use, readable without the lock
    used_bytes: AtomicUsize,
    allocations_since_gc: AtomicUsize,
    live_after_gc: AtomicUsize,
}

impl Heap {
    /// Create new heap with default config
    pub fn new() -> Self {
        Self::with_config(GcConfig::default())
    }

    /// Create new heap with custom config
    pub fn with_config(config: GcConfig) -> Self {
        Self {
            inner: RwLock::new(HeapInner::new(&config)),
            phase: AtomicU8::new(GcPhase::Idle as u8),
            used_bytes: AtomicUsize::new(0),
            allocations_since_gc: AtomicUsize::new(0),
            live_after_gc: AtomicUsize::new(0),
            config,
        }
    }

    /// Get config
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Shared access to the heap state
    pub fn read(&self) -> RwLockReadGuard<'_, HeapInner> {
        self.inner.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, HeapInner> {
        self.inner.write()
    }

    /// Reinitialise in a forked child
    ///
    /// Releases the heap lock, drops pending barrier records and returns to
    /// `Idle`; a cycle interrupted by the fork is abandoned and marks are
    /// rebuilt by the next one.
    ///
    /// # Safety
    ///
    /// Same contract as [`ThreadNexus::after_fork_child`](crate::ThreadNexus::after_fork_child).
    pub unsafe fn after_fork_child(&self) {
        // SAFETY: no holder survives in the child (caller contract)
        unsafe { force_release(&self.inner) };
        let mut inner = self.inner.write();
        inner.write_log.clear();
        self.enter_phase(&mut inner, GcPhase::Idle);
        self.sync_usage(&inner);
        tracing::info!(target: "mantle::gc", objects = inner.handles.live(), "heap reset after fork");
    }

    /// Current collector phase
    pub fn phase(&self) -> GcPhase {
        GcPhase::from(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn enter_phase(&self, inner: &mut HeapInner, phase: GcPhase) {
        inner.phase = phase;
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Bytes occupied by objects
    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed)
    }

    /// Allocations since the last completed cycle
    pub fn allocations_since_gc(&self) -> usize {
        self.allocations_since_gc.load(Ordering::Relaxed)
    }

    /// Live bytes at the end of the last cycle
    pub fn live_after_gc(&self) -> usize {
        self.live_after_gc.load(Ordering::Relaxed)
    }

    /// Byte level at which the policy asks for a cycle
    pub fn gc_threshold(&self) -> usize {
        let grown = (self.live_after_gc() as f64 * self.config.growth_factor) as usize;
        grown.max(self.config.min_gc_threshold)
    }

    pub(crate) fn sync_usage(&self, inner: &HeapInner) {
        self.used_bytes.store(inner.regions.used(), Ordering::Relaxed);
    }

    pub(crate) fn reset_after_cycle(&self, inner: &HeapInner) {
        self.sync_usage(inner);
        self.live_after_gc
            .store(inner.regions.used(), Ordering::Relaxed);
        self.allocations_since_gc.store(0, Ordering::Relaxed);
    }

    /// Run `f` with the heap write-locked and refresh usage counters after
    pub(crate) fn mutate<T>(&self, f: impl FnOnce(&mut HeapInner) -> GcResult<T>) -> GcResult<T> {
        let mut inner = self.inner.write();
        let before = inner.handles.live();
        let result = f(&mut inner);
        let created = inner.handles.live().saturating_sub(before);
        if created > 0 {
            self.allocations_since_gc
                .fetch_add(created, Ordering::Relaxed);
        }
        self.sync_usage(&inner);
        result
    }

    /// Number of live objects
    pub fn object_count(&self) -> usize {
        self.inner.read().handles.live()
    }

    /// True while the handle names a live object
    pub fn is_live(&self, handle: ObjectRef) -> bool {
        self.inner.read().object(handle).is_ok()
    }

    /// Allocate an instance of a dynamic class with all fields `Nil`
    pub fn allocate_object(&self, class: &dyn ObjectClass) -> GcResult<ObjectRef> {
        let count = class.instance_fields();
        self.mutate(|inner| {
            inner.ensure_room(slots_size(count))?;
            inner.allocate(class.class_ref(), ObjectBody::Instance(Fields::new(count)))
        })
    }

    /// Allocate fixed-capacity field storage with all slots `Nil`
    pub fn allocate_fields(&self, capacity: usize) -> GcResult<ObjectRef> {
        self.mutate(|inner| inner.allocate_tuple(capacity))
    }

    /// Allocate zeroed byte storage of at least `len` bytes, rounded up to
    /// whole words
    pub fn allocate_bytes(&self, len: usize) -> GcResult<ObjectRef> {
        self.mutate(|inner| {
            let padded = align_to_word(len.min(usize::MAX - WORD_BYTES));
            inner.ensure_room(padded.saturating_add(HEADER_BYTES))?;
            let bytes = vec![0u8; padded].into_boxed_slice();
            inner.allocate(ClassRef::BYTE_ARRAY, ObjectBody::ByteArray(bytes))
        })
    }

    /// Allocate a boxed float
    pub fn allocate_float(&self, value: f64) -> GcResult<ObjectRef> {
        self.mutate(|inner| inner.allocate(ClassRef::FLOAT, ObjectBody::Float(value)))
    }

    /// Read a field
    ///
    /// Instances and tuples are indexed physically; arrays logically, with
    /// negative indexes counting from the end. Out-of-range reads yield `Nil`.
    pub fn read_field(&self, object: ObjectRef, index: i64) -> GcResult<Value> {
        let inner = self.inner.read();
        match &inner.object(object)?.body {
            ObjectBody::Instance(fields) | ObjectBody::Tuple(fields) => Ok(usize::try_from(index)
                .ok()
                .and_then(|i| fields.get(i))
                .unwrap_or(Value::Nil)),
            ObjectBody::Array(_) => inner.view_get(object, index),
            _ => Err(GcError::KindMismatch {
                object,
                expected: ObjectKind::Tuple,
            }),
        }
    }

    /// Write a field through the write barrier
    ///
    /// Arrays grow when written past their end; negative array indexes
    /// count from the end.
    pub fn write_field(&self, object: ObjectRef, index: i64, value: Value) -> GcResult<()> {
        self.mutate(|inner| {
            let kind = inner.object(object)?.body.kind();
            if kind == ObjectKind::Array {
                return inner.view_aset(object, index, value);
            }
            let len = inner.fields(object)?.len();
            let slot =
                usize::try_from(index).map_err(|_| GcError::BoundsViolation { index, len })?;
            inner.store_field(object, slot, value)
        })
    }

    /// Freeze an object; later mutations fail with `FrozenViolation`
    pub fn freeze(&self, object: ObjectRef) -> GcResult<()> {
        self.mutate(|inner| {
            inner.object_mut(object)?.header.freeze();
            Ok(())
        })
    }

    /// True if the object is frozen
    pub fn is_frozen(&self, object: ObjectRef) -> GcResult<bool> {
        Ok(self.inner.read().object(object)?.header.is_frozen())
    }

    /// Class recorded in the header
    pub fn class_of(&self, object: ObjectRef) -> GcResult<ClassRef> {
        Ok(self.inner.read().object(object)?.header.class())
    }

    /// Built-in kind of the object
    pub fn kind_of(&self, object: ObjectRef) -> GcResult<ObjectKind> {
        Ok(self.inner.read().object(object)?.body.kind())
    }

    /// Bytes charged for the object
    pub fn byte_size(&self, object: ObjectRef) -> GcResult<usize> {
        Ok(self.inner.read().object(object)?.header.size())
    }

    /// Space the object currently lives in
    pub fn space_of(&self, object: ObjectRef) -> GcResult<Space> {
        self.inner.read().space_of(object)
    }

    /// Value of a boxed float
    pub fn float_value(&self, object: ObjectRef) -> GcResult<f64> {
        match self.inner.read().object(object)?.body {
            ObjectBody::Float(v) => Ok(v),
            _ => Err(GcError::KindMismatch {
                object,
                expected: ObjectKind::Float,
            }),
        }
    }

    /// Read one byte; `None` past the end
    pub fn read_byte(&self, object: ObjectRef, index: usize) -> GcResult<Option<u8>> {
        Ok(self.inner.read().bytes(object)?.get(index).copied())
    }

    /// Write one byte
    pub fn write_byte(&self, object: ObjectRef, index: usize, byte: u8) -> GcResult<()> {
        self.mutate(|inner| {
            let bytes = inner.bytes_mut(object)?;
            let len = bytes.len();
            let slot = bytes.get_mut(index).ok_or(GcError::BoundsViolation {
                index: index as i64,
                len,
            })?;
            *slot = byte;
            Ok(())
        })
    }

    /// Copy of the bytes
    pub fn bytes_of(&self, object: ObjectRef) -> GcResult<Vec<u8>> {
        Ok(self.inner.read().bytes(object)?.to_vec())
    }

    /// Keep an object alive independently of any thread's roots
    pub fn pin(&self, object: ObjectRef) -> GcResult<()> {
        self.inner.write().pin(object)
    }

    /// Drop one pin
    pub fn unpin(&self, object: ObjectRef) {
        self.inner.write().unpin(object)
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Point;

    impl ObjectClass for Point {
        fn class_ref(&self) -> ClassRef {
            ClassRef(ClassRef::FIRST_USER)
        }

        fn instance_fields(&self) -> usize {
            2
        }

        fn name(&self) -> &str {
            "Point"
        }
    }

    #[test]
    fn test_heap_creation() {
        let heap = Heap::new();
        assert_eq!(heap.used_bytes(), 0);
        assert_eq!(heap.object_count(), 0);
        assert_eq!(heap.phase(), GcPhase::Idle);
    }

    #[test]
    fn test_allocate_object() {
        let heap = Heap::new();
        let p = heap.allocate_object(&Point).unwrap();
        assert_eq!(heap.class_of(p).unwrap(), ClassRef(ClassRef::FIRST_USER));
        assert_eq!(heap.kind_of(p).unwrap(), ObjectKind::Instance);
        assert_eq!(heap.read_field(p, 0).unwrap(), Value::Nil);
        assert_eq!(heap.read_field(p, 5).unwrap(), Value::Nil);
        assert_eq!(heap.used_bytes(), 32);
    }

    #[test]
    fn test_write_read_field() {
        let heap = Heap::new();
        let t = heap.allocate_fields(3).unwrap();
        let other = heap.allocate_fields(1).unwrap();
        heap.write_field(t, 1, Value::Ref(other)).unwrap();
        heap.write_field(t, 2, Value::Fixnum(9)).unwrap();
        assert_eq!(heap.read_field(t, 1).unwrap(), Value::Ref(other));
        assert_eq!(heap.read_field(t, 2).unwrap(), Value::Fixnum(9));
        assert_eq!(heap.read_field(t, -1).unwrap(), Value::Nil);
    }

    #[test]
    fn test_tuple_write_out_of_bounds() {
        let heap = Heap::new();
        let t = heap.allocate_fields(2).unwrap();
        assert_eq!(
            heap.write_field(t, 2, Value::Nil),
            Err(GcError::BoundsViolation { index: 2, len: 2 })
        );
        assert_eq!(
            heap.write_field(t, -1, Value::Nil),
            Err(GcError::BoundsViolation { index: -1, len: 2 })
        );
    }

    #[test]
    fn test_frozen_violation() {
        let heap = Heap::new();
        let t = heap.allocate_fields(1).unwrap();
        heap.freeze(t).unwrap();
        assert!(heap.is_frozen(t).unwrap());
        assert_eq!(
            heap.write_field(t, 0, Value::Fixnum(1)),
            Err(GcError::FrozenViolation(t))
        );
    }

    #[test]
    fn test_out_of_memory() {
        let heap = Heap::with_config(GcConfig {
            max_heap_bytes: 64,
            ..GcConfig::default()
        });
        heap.allocate_fields(4).unwrap();
        let err = heap.allocate_fields(4).unwrap_err();
        assert!(err.is_out_of_memory());
    }

    #[test]
    fn test_byte_array() {
        let heap = Heap::new();
        let b = heap.allocate_bytes(5).unwrap();
        assert_eq!(heap.bytes_of(b).unwrap(), vec![0u8; 8]);
        heap.write_byte(b, 3, 0xAB).unwrap();
        assert_eq!(heap.read_byte(b, 3).unwrap(), Some(0xAB));
        assert_eq!(heap.read_byte(b, 8).unwrap(), None);
        assert!(heap.write_byte(b, 8, 1).is_err());
    }

    #[test]
    fn test_after_fork_child_releases_heap_lock() {
        let heap = Heap::new();
        let kept = heap.allocate_fields(1).unwrap();
        std::mem::forget(heap.read());
        std::mem::forget(heap.read());
        unsafe { heap.after_fork_child() };
        assert!(heap.allocate_fields(1).is_ok());

        std::mem::forget(heap.write());
        unsafe { heap.after_fork_child() };
        heap.write_field(kept, 0, Value::Fixnum(1)).unwrap();
        assert_eq!(heap.read_field(kept, 0).unwrap(), Value::Fixnum(1));
        assert_eq!(heap.object_count(), 2);
    }

    #[test]
    fn test_after_fork_child_abandons_cycle() {
        let heap = Heap::new();
        let white = heap.allocate_fields(1).unwrap();
        {
            let mut inner = heap.write();
            heap.enter_phase(&mut inner, GcPhase::Marking);
        }
        let black = heap.allocate_fields(1).unwrap();
        heap.write_field(black, 0, Value::Ref(white)).unwrap();
        assert!(!heap.read().write_log.is_empty());

        unsafe { heap.after_fork_child() };
        assert_eq!(heap.phase(), GcPhase::Idle);
        assert!(heap.read().write_log.is_empty());
    }

    #[test]
    fn test_stale_handle_rejected() {
        let heap = Heap::new();
        let t = heap.allocate_fields(1).unwrap();
        {
            let mut inner = heap.write();
            let location = inner.handles.resolve(t).unwrap();
            inner.regions.take(location);
            inner.handles.release(t);
        }
        assert!(!heap.is_live(t));
        assert_eq!(heap.read_field(t, 0), Err(GcError::InvalidHandle(t)));
        let reused = heap.allocate_fields(1).unwrap();
        assert_eq!(reused.index(), t.index());
        assert_ne!(reused.generation(), t.generation());
    }

    #[test]
    fn test_storing_dead_handle_fails() {
        let heap = Heap::new();
        let t = heap.allocate_fields(1).unwrap();
        let dead = ObjectRef::new(99, 0);
        assert_eq!(
            heap.write_field(t, 0, Value::Ref(dead)),
            Err(GcError::InvalidHandle(dead))
        );
    }
}
