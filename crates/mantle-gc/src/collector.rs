//! Mostly-concurrent mark-sweep collector
//!
//! A cycle runs in three stages:
//!
//! 1. Initial pause: all mutators parked, marks reset, roots shaded gray.
//! 2. Marking: with `concurrent_marking` the world resumes and gray objects
//!    are scanned in bounded steps under the heap lock. The write barrier
//!    logs white referents stored into marked holders; each step drains
//!    the log once the gray worklist is empty.
//! 3. Final pause: roots are rescanned, the worklist and the log are
//!    drained to a fixed point, white objects are freed and nursery
//!    survivors are promoted (only their handle entries change).
//!
//! Objects allocated between the two pauses are born black.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::error::{GcError, GcResult};
use crate::heap::{Heap, HeapInner, force_release};
use crate::nexus::{StopTheWorld, ThreadNexus, ThreadRecord};
use crate::object::{MarkColor, ObjectRef};
use crate::region::Space;

/// Collector phase
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// No cycle in progress
    Idle = 0,
    /// Initial pause: shading roots
    RootScanning = 1,
    /// Tracing the object graph
    Marking = 2,
    /// Freeing and relocating
    Sweeping = 3,
}

impl From<u8> for GcPhase {
    fn from(v: u8) -> Self {
        match v {
            0 => GcPhase::Idle,
            1 => GcPhase::RootScanning,
            2 => GcPhase::Marking,
            3 => GcPhase::Sweeping,
            _ => GcPhase::Idle,
        }
    }
}

impl GcPhase {
    /// True while stores must be recorded by the write barrier
    #[inline]
    pub fn barrier_active(self) -> bool {
        matches!(self, GcPhase::RootScanning | GcPhase::Marking)
    }
}

/// Why a cycle ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionReason {
    /// `request_collection` or a direct call
    Explicit,
    /// An allocation could not be satisfied
    AllocationFailure,
    /// Byte, count or interval threshold crossed
    Policy,
}

/// GC statistics
#[derive(Debug, Default, Clone)]
pub struct GcStats {
    /// Number of completed collections
    pub collections: u64,
    /// Total time mutators were stopped (nanoseconds)
    pub total_pause_ns: u64,
    /// Longest single pause (nanoseconds)
    pub max_pause_ns: u64,
    /// Bytes reclaimed in last collection
    pub last_reclaimed_bytes: usize,
    /// Objects reclaimed in last collection
    pub last_reclaimed_objects: usize,
    /// Objects marked in last collection
    pub last_marked: usize,
    /// Objects promoted in last collection
    pub last_promoted: usize,
    /// Bytes reclaimed over all collections
    pub total_reclaimed_bytes: u64,
    /// Write barrier records consumed over all collections
    pub barrier_records: u64,
    /// Stop requests that timed out
    pub safe_point_timeouts: u64,
}

/// Summary of one completed cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// 1-based cycle number
    pub cycle: u64,
    /// Trigger
    pub reason: CollectionReason,
    /// Objects marked live
    pub marked: usize,
    /// Objects freed
    pub reclaimed_objects: usize,
    /// Bytes freed
    pub reclaimed_bytes: usize,
    /// Nursery survivors moved to old regions
    pub promoted: usize,
    /// Empty old regions released
    pub released_regions: usize,
    /// Write barrier records produced during the cycle
    pub barrier_records: u64,
    /// Bytes in use after the sweep
    pub live_bytes: usize,
    /// Time mutators were stopped, both pauses together
    pub pause: Duration,
    /// Wall time of the whole cycle
    pub duration: Duration,
}

/// Reporting hook for diagnostics collectors
pub trait GcObserver: Send + Sync {
    /// Called after every completed cycle
    fn on_cycle_complete(&self, report: &CycleReport);

    /// Called when mutators fail to reach a safe point
    fn on_safe_point_timeout(&self, _error: &GcError) {}
}

#[derive(Debug, Default)]
struct BackgroundState {
    stop: bool,
}

/// Garbage collector
pub struct Collector {
    heap: Arc<Heap>,
    nexus: Arc<ThreadNexus>,
    /// Serializes cycles
    cycle_lock: Mutex<()>,
    completed: AtomicU64,
    requested: AtomicBool,
    halted: AtomicBool,
    last_cycle: Mutex<Instant>,
    stats: Mutex<GcStats>,
    observers: RwLock<Vec<Arc<dyn GcObserver>>>,
    background: Mutex<Option<JoinHandle<()>>>,
    background_state: Mutex<BackgroundState>,
    background_cv: Condvar,
}

impl Collector {
    /// Create a collector for a heap and its mutators
    pub fn new(heap: Arc<Heap>, nexus: Arc<ThreadNexus>) -> Self {
        Self {
            heap,
            nexus,
            cycle_lock: Mutex::new(()),
            completed: AtomicU64::new(0),
            requested: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            last_cycle: Mutex::new(Instant::now()),
            stats: Mutex::new(GcStats::default()),
            observers: RwLock::new(Vec::new()),
            background: Mutex::new(None),
            background_state: Mutex::new(BackgroundState::default()),
            background_cv: Condvar::new(),
        }
    }

    /// Heap being collected
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Nexus coordinating the mutators
    pub fn nexus(&self) -> &Arc<ThreadNexus> {
        &self.nexus
    }

    /// Get statistics
    pub fn stats(&self) -> GcStats {
        self.stats.lock().clone()
    }

    /// Completed cycles
    pub fn completed_cycles(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Install a reporting hook
    pub fn add_observer(&self, observer: Arc<dyn GcObserver>) {
        self.observers.write().push(observer);
    }

    /// Ask for a cycle at the next opportunity
    pub fn request_collection(&self) {
        self.requested.store(true, Ordering::Release);
        self.background_cv.notify_one();
    }

    /// True if a cycle was requested and has not run yet
    pub fn collection_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Trigger policy: explicit request, byte threshold, allocation count
    /// or elapsed interval
    pub fn should_collect(&self) -> bool {
        if self.collection_requested() {
            return true;
        }
        let config = self.heap.config();
        if self.heap.used_bytes() >= self.heap.gc_threshold() {
            return true;
        }
        if self.heap.allocations_since_gc() >= config.allocation_count_threshold {
            return true;
        }
        config
            .collection_interval
            .is_some_and(|interval| self.last_cycle.lock().elapsed() >= interval)
    }

    /// Keep an object alive regardless of thread roots
    pub fn pin(&self, object: ObjectRef) -> GcResult<()> {
        self.heap.pin(object)
    }

    /// Drop one pin
    pub fn unpin(&self, object: ObjectRef) {
        self.heap.unpin(object)
    }

    /// Refuse further cycles and stop the background thread
    pub fn halt(&self) {
        self.halted.store(true, Ordering::Release);
        self.stop_background();
    }

    /// True after `halt`
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Run one full cycle
    ///
    /// `requester` is the calling mutator's record, if the caller is one.
    pub fn collect(
        &self,
        requester: Option<&ThreadRecord>,
        reason: CollectionReason,
    ) -> GcResult<CycleReport> {
        let mut cycle = self.begin_cycle(requester, reason)?;
        let budget = self.heap.config().mark_step_budget.max(1);
        while cycle.mark_step(budget) {
            if let Some(record) = requester {
                self.nexus.safe_point(record);
            }
        }
        cycle.finish()
    }

    /// Start a cycle: initial pause and root shading
    ///
    /// Waits for a running cycle to end first; while waiting, a mutator
    /// requester counts as safe.
    pub fn begin_cycle<'a>(
        &'a self,
        requester: Option<&'a ThreadRecord>,
        reason: CollectionReason,
    ) -> GcResult<Cycle<'a>> {
        if self.is_halted() {
            return Err(GcError::Halted);
        }
        let serial = match requester {
            Some(record) => self.nexus.blocking(record, || self.cycle_lock.lock()),
            None => self.cycle_lock.lock(),
        };

        let started = Instant::now();
        let world = self.stop_world(requester)?;
        let pause_started = Instant::now();
        let mut worklist = Vec::new();
        let barrier_baseline;
        {
            let mut inner = self.heap.write();
            inner
                .regions
                .for_each_object_mut(|object| object.header.set_mark(MarkColor::White));
            inner.write_log.clear();
            barrier_baseline = inner.write_log.recorded_total();
            self.heap.enter_phase(&mut inner, GcPhase::RootScanning);
            self.shade_roots(&mut inner, &mut worklist);
            self.heap.enter_phase(&mut inner, GcPhase::Marking);
        }
        let pause = pause_started.elapsed();

        tracing::debug!(
            target: "mantle::gc",
            ?reason,
            roots = worklist.len(),
            ?pause,
            "cycle started"
        );

        let world = if self.heap.config().concurrent_marking {
            drop(world);
            None
        } else {
            Some(world)
        };

        Ok(Cycle {
            collector: self,
            requester,
            reason,
            _serial: serial,
            world,
            worklist,
            marked: 0,
            barrier_baseline,
            started,
            pause,
            finished: false,
        })
    }

    fn stop_world<'a>(&'a self, requester: Option<&'a ThreadRecord>) -> GcResult<StopTheWorld<'a>> {
        let timeout = self.heap.config().safe_point_timeout;
        self.nexus.stop_the_world(requester, timeout).inspect_err(|err| {
            self.stats.lock().safe_point_timeouts += 1;
            for observer in self.observers.read().iter() {
                observer.on_safe_point_timeout(err);
            }
        })
    }

    /// Shade every thread root and pinned global gray
    fn shade_roots(&self, inner: &mut HeapInner, worklist: &mut Vec<ObjectRef>) {
        let mut roots: Vec<ObjectRef> = inner.pinned.keys().copied().collect();
        for record in self.nexus.threads() {
            record.context().scan(|r| roots.push(r));
        }
        for root in roots {
            shade(inner, root, worklist);
        }
    }

    /// Start a thread that runs policy-triggered cycles
    ///
    /// Returns false if one is already running or the collector is halted.
    pub fn start_background(self: &Arc<Self>, poll: Duration) -> bool {
        let mut slot = self.background.lock();
        if slot.is_some() || self.is_halted() {
            return false;
        }
        self.background_state.lock().stop = false;
        let collector = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("mantle-gc".into())
            .spawn(move || collector.background_loop(poll));
        match spawned {
            Ok(handle) => {
                *slot = Some(handle);
                tracing::info!(target: "mantle::gc", "background collector started");
                true
            }
            Err(err) => {
                tracing::error!(target: "mantle::gc", %err, "cannot spawn background collector");
                false
            }
        }
    }

    /// Stop and join the background thread, if any
    pub fn stop_background(&self) {
        let handle = self.background.lock().take();
        if let Some(handle) = handle {
            self.background_state.lock().stop = true;
            self.background_cv.notify_all();
            if handle.join().is_err() {
                tracing::error!(target: "mantle::gc", "background collector panicked");
            }
            tracing::info!(target: "mantle::gc", "background collector stopped");
        }
    }

    /// True while the background thread runs
    pub fn background_running(&self) -> bool {
        self.background.lock().is_some()
    }

    /// Reinitialise in a forked child
    ///
    /// The background thread does not exist in the child; its handle is
    /// leaked instead of joined. Every collector lock a parent thread held
    /// is released.
    ///
    /// # Safety
    ///
    /// Same contract as [`ThreadNexus::after_fork_child`].
    pub unsafe fn after_fork_child(&self) {
        // SAFETY: no holder survives in the child (caller contract)
        unsafe {
            if self.background.is_locked() {
                self.background.force_unlock();
            }
            if self.background_state.is_locked() {
                self.background_state.force_unlock();
            }
            if self.cycle_lock.is_locked() {
                self.cycle_lock.force_unlock();
            }
            if self.stats.is_locked() {
                self.stats.force_unlock();
            }
            if self.last_cycle.is_locked() {
                self.last_cycle.force_unlock();
            }
            force_release(&self.observers);
        }
        if let Some(handle) = self.background.lock().take() {
            std::mem::forget(handle);
        }
        self.background_state.lock().stop = false;
        tracing::info!(target: "mantle::gc", "collector reset after fork");
    }

    fn background_loop(&self, poll: Duration) {
        loop {
            {
                let mut state = self.background_state.lock();
                if state.stop {
                    return;
                }
                if !self.should_collect() {
                    self.background_cv.wait_for(&mut state, poll);
                }
                if state.stop {
                    return;
                }
            }
            if self.should_collect() {
                let reason = if self.collection_requested() {
                    CollectionReason::Explicit
                } else {
                    CollectionReason::Policy
                };
                match self.collect(None, reason) {
                    Ok(_) => {}
                    Err(GcError::Halted) => return,
                    Err(err) => {
                        tracing::warn!(target: "mantle::gc", %err, "background cycle failed")
                    }
                }
            }
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.stop_background();
    }
}

/// Turn a white object gray and queue it
fn shade(inner: &mut HeapInner, object: ObjectRef, worklist: &mut Vec<ObjectRef>) {
    if let Ok(target) = inner.object_mut(object) {
        if target.header.mark() == MarkColor::White {
            target.header.set_mark(MarkColor::Gray);
            worklist.push(object);
        }
    }
}

/// An in-progress cycle
///
/// Dropping an unfinished cycle abandons it: the phase returns to `Idle`
/// and nothing is freed.
pub struct Cycle<'a> {
    collector: &'a Collector,
    requester: Option<&'a ThreadRecord>,
    reason: CollectionReason,
    _serial: MutexGuard<'a, ()>,
    /// Held for the whole cycle when marking is not concurrent
    world: Option<StopTheWorld<'a>>,
    worklist: Vec<ObjectRef>,
    marked: usize,
    barrier_baseline: u64,
    started: Instant,
    pause: Duration,
    finished: bool,
}

impl Cycle<'_> {
    /// Objects marked so far
    pub fn marked(&self) -> usize {
        self.marked
    }

    /// Gray objects waiting to be scanned
    pub fn pending(&self) -> usize {
        self.worklist.len()
    }

    /// Scan up to `budget` gray objects
    ///
    /// Returns true while work remains.
    pub fn mark_step(&mut self, budget: usize) -> bool {
        let mut inner = self.collector.heap.write();
        let scanned = drain(&mut inner, &mut self.worklist, budget);
        self.marked += scanned;

        #[cfg(feature = "gc_logging")]
        tracing::trace!(
            target: "mantle::gc",
            scanned,
            pending = self.worklist.len(),
            logged = inner.write_log.len(),
            "mark step"
        );

        !self.worklist.is_empty() || !inner.write_log.is_empty()
    }

    /// Final pause: rescan roots, finish marking and sweep
    pub fn finish(mut self) -> GcResult<CycleReport> {
        let collector = self.collector;
        let heap = &collector.heap;
        let world = match self.world.take() {
            Some(world) => world,
            None => collector.stop_world(self.requester)?,
        };
        let pause_started = Instant::now();

        let mut inner = heap.write();
        collector.shade_roots(&mut inner, &mut self.worklist);
        self.marked += drain(&mut inner, &mut self.worklist, usize::MAX);
        debug_assert!(self.worklist.is_empty() && inner.write_log.is_empty());
        let barrier_records = inner.write_log.recorded_total() - self.barrier_baseline;

        heap.enter_phase(&mut inner, GcPhase::Sweeping);
        let swept = sweep(&mut inner, heap.config().promotion_age);
        let released_regions = inner.regions.release_empty_regions();
        heap.enter_phase(&mut inner, GcPhase::Idle);
        heap.reset_after_cycle(&inner);
        let live_bytes = inner.regions.used();
        drop(inner);
        drop(world);
        self.finished = true;

        let pause = self.pause + pause_started.elapsed();
        let cycle = collector.completed.fetch_add(1, Ordering::AcqRel) + 1;
        collector.requested.store(false, Ordering::Release);
        *collector.last_cycle.lock() = Instant::now();

        let report = CycleReport {
            cycle,
            reason: self.reason,
            marked: self.marked,
            reclaimed_objects: swept.objects,
            reclaimed_bytes: swept.bytes,
            promoted: swept.promoted,
            released_regions,
            barrier_records,
            live_bytes,
            pause,
            duration: self.started.elapsed(),
        };

        {
            let mut stats = collector.stats.lock();
            let pause_ns = pause.as_nanos() as u64;
            stats.collections += 1;
            stats.total_pause_ns += pause_ns;
            stats.max_pause_ns = stats.max_pause_ns.max(pause_ns);
            stats.last_reclaimed_bytes = report.reclaimed_bytes;
            stats.last_reclaimed_objects = report.reclaimed_objects;
            stats.last_marked = report.marked;
            stats.last_promoted = report.promoted;
            stats.total_reclaimed_bytes += report.reclaimed_bytes as u64;
            stats.barrier_records += report.barrier_records;
        }

        tracing::info!(
            target: "mantle::gc",
            cycle,
            reason = ?report.reason,
            marked = report.marked,
            reclaimed_bytes = report.reclaimed_bytes,
            promoted = report.promoted,
            live_bytes,
            pause = ?report.pause,
            "cycle complete"
        );

        for observer in collector.observers.read().iter() {
            observer.on_cycle_complete(&report);
        }
        Ok(report)
    }
}

impl Drop for Cycle<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let heap = &self.collector.heap;
        let mut inner = heap.write();
        inner.write_log.clear();
        heap.enter_phase(&mut inner, GcPhase::Idle);
        tracing::warn!(target: "mantle::gc", "cycle abandoned");
    }
}

/// Scan gray objects until the worklist and the write log are empty or
/// `budget` objects were scanned
fn drain(inner: &mut HeapInner, worklist: &mut Vec<ObjectRef>, budget: usize) -> usize {
    let mut scanned = 0;
    while scanned < budget {
        let Some(object) = worklist.pop() else {
            let records = inner.write_log.drain();
            if records.is_empty() {
                break;
            }
            for record in records {
                shade(inner, record.value, worklist);
            }
            continue;
        };
        let children = match inner.object(object) {
            Ok(target) => target.children(),
            Err(_) => continue,
        };
        for child in children {
            shade(inner, child, worklist);
        }
        if let Ok(target) = inner.object_mut(object) {
            target.header.set_mark(MarkColor::Black);
        }
        scanned += 1;
    }
    scanned
}

struct Swept {
    objects: usize,
    bytes: usize,
    promoted: usize,
}

/// Free white objects, then age nursery survivors and promote the old
/// enough ones
fn sweep(inner: &mut HeapInner, promotion_age: u8) -> Swept {
    let mut dead = Vec::new();
    inner.regions.for_each_object(|location, object| {
        if object.header.mark() == MarkColor::White {
            dead.push((location, object.handle));
        }
    });

    let mut swept = Swept {
        objects: 0,
        bytes: 0,
        promoted: 0,
    };
    for (location, handle) in dead {
        if let Some(object) = inner.regions.take(location) {
            swept.objects += 1;
            swept.bytes += object.header.size();
        }
        inner.handles.release(handle);
    }

    for location in inner.regions.nursery_locations() {
        let promote = match inner.regions.get_mut(location) {
            Some(object) => {
                object.header.bump_age();
                object.header.age() >= promotion_age
            }
            None => false,
        };
        if !promote {
            continue;
        }
        if let Some(object) = inner.regions.take(location) {
            let handle = object.handle;
            let moved = inner.regions.place_old(object);
            debug_assert_eq!(inner.regions.space_of(moved), Some(Space::Old));
            inner.handles.relocate(handle, moved);
            swept.promoted += 1;
        }
    }
    swept
}
