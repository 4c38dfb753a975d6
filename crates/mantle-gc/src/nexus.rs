//! Thread nexus: mutator registry and stop-the-world protocol
//!
//! Mutators poll [`ThreadNexus::safe_point`] at allocation, back-edges and
//! native-call boundaries. A stop request flips one atomic flag; the fast
//! path is a single load. Threads in native code or suspended fibers are
//! already safe and re-check the flag on the way back in.
//!
//! Locking: the nexus state mutex is taken before the registry mutex, and
//! thread statuses change only while the state mutex is held, so a waiter
//! on the state condvars never misses a transition.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::error::{GcError, GcResult};
use crate::roots::ExecutionContext;

/// What a registered record executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    /// OS thread running VM code
    Thread,
    /// Lightweight task multiplexed onto a thread
    Fiber,
    /// Runtime helper (finalizer, signal, collector)
    Helper,
}

/// Safe-point status of a record
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Executing mutator code
    Running = 0,
    /// Parked at a safe point
    Parked = 1,
    /// Executing native code; must not touch the heap
    Native = 2,
    /// Inactive fiber
    Suspended = 3,
    /// Unregistered
    Dead = 4,
}

impl From<u8> for ThreadStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => ThreadStatus::Running,
            1 => ThreadStatus::Parked,
            2 => ThreadStatus::Native,
            3 => ThreadStatus::Suspended,
            _ => ThreadStatus::Dead,
        }
    }
}

impl ThreadStatus {
    /// True for states in which the collector may proceed
    pub fn is_safe(self) -> bool {
        !matches!(self, ThreadStatus::Running)
    }
}

/// One registered mutator or helper
#[derive(Debug)]
pub struct ThreadRecord {
    id: u32,
    kind: ThreadKind,
    /// Thread a fiber runs on
    owner: Option<u32>,
    status: AtomicU8,
    context: Arc<ExecutionContext>,
}

impl ThreadRecord {
    /// Thread id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Kind of record
    pub fn kind(&self) -> ThreadKind {
        self.kind
    }

    /// Owning thread id, for fibers
    pub fn owner(&self) -> Option<u32> {
        self.owner
    }

    /// Current status
    pub fn status(&self) -> ThreadStatus {
        ThreadStatus::from(self.status.load(Ordering::Acquire))
    }

    /// Root context
    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.context
    }

    fn set_status(&self, status: ThreadStatus) {
        self.status.store(status as u8, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct NexusState {
    /// A stop is in force
    stopped: bool,
    /// Registered thread holding the stop, if any
    owner: Option<u32>,
    /// Completed stops
    stops: u64,
}

/// Registry of mutators and the stop-the-world coordinator
#[derive(Debug)]
pub struct ThreadNexus {
    registry: Mutex<Vec<Arc<ThreadRecord>>>,
    stop: CachePadded<AtomicBool>,
    state: Mutex<NexusState>,
    /// Signalled whenever a record becomes safe or leaves
    parked_cv: Condvar,
    /// Signalled on resume
    resume_cv: Condvar,
    next_id: AtomicU32,
}

impl Default for ThreadNexus {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadNexus {
    /// Create an empty nexus
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Vec::new()),
            stop: CachePadded::new(AtomicBool::new(false)),
            state: Mutex::new(NexusState::default()),
            parked_cv: Condvar::new(),
            resume_cv: Condvar::new(),
            next_id: AtomicU32::new(1),
        }
    }

    /// Issue a fresh thread id
    pub fn new_thread_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a thread or helper
    ///
    /// Blocks while a stop is in force, so a thread never starts mutating
    /// in the middle of a pause.
    pub fn register(&self, kind: ThreadKind) -> Arc<ThreadRecord> {
        let mut state = self.state.lock();
        while state.stopped {
            self.resume_cv.wait(&mut state);
        }
        let record = Arc::new(ThreadRecord {
            id: self.new_thread_id(),
            kind,
            owner: None,
            status: AtomicU8::new(ThreadStatus::Running as u8),
            context: Arc::new(ExecutionContext::new()),
        });
        self.registry.lock().push(Arc::clone(&record));
        tracing::debug!(target: "mantle::nexus", id = record.id, ?kind, "thread registered");
        record
    }

    /// Register a fiber owned by `owner`; it starts suspended
    pub fn register_fiber(&self, owner: u32) -> Arc<ThreadRecord> {
        let _state = self.state.lock();
        let record = Arc::new(ThreadRecord {
            id: self.new_thread_id(),
            kind: ThreadKind::Fiber,
            owner: Some(owner),
            status: AtomicU8::new(ThreadStatus::Suspended as u8),
            context: Arc::new(ExecutionContext::new()),
        });
        self.registry.lock().push(Arc::clone(&record));
        tracing::debug!(target: "mantle::nexus", id = record.id, owner, "fiber registered");
        record
    }

    /// Remove a record
    pub fn unregister(&self, record: &ThreadRecord) {
        let _state = self.state.lock();
        record.set_status(ThreadStatus::Dead);
        self.registry.lock().retain(|r| r.id != record.id);
        self.parked_cv.notify_all();
        tracing::debug!(target: "mantle::nexus", id = record.id, "thread unregistered");
    }

    /// True while a stop is requested
    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Poll for a pending stop; parks until resume if one is in force
    #[inline]
    pub fn safe_point(&self, record: &ThreadRecord) {
        if self.stop_requested() {
            self.park(record);
        }
    }

    #[cold]
    fn park(&self, record: &ThreadRecord) {
        let mut state = self.state.lock();
        if !state.stopped || state.owner == Some(record.id) {
            return;
        }
        record.set_status(ThreadStatus::Parked);
        self.parked_cv.notify_all();
        tracing::trace!(target: "mantle::nexus", id = record.id, "parked");
        while state.stopped {
            self.resume_cv.wait(&mut state);
        }
        record.set_status(ThreadStatus::Running);
    }

    /// Leave mutator code: the thread becomes safe until it comes back
    pub fn enter_native(&self, record: &ThreadRecord) {
        self.enter_outside(record, ThreadStatus::Native);
    }

    /// Return from native code; blocks while a stop is in force
    pub fn leave_native(&self, record: &ThreadRecord) {
        self.leave_outside(record);
    }

    /// Deactivate a fiber
    pub fn suspend(&self, record: &ThreadRecord) {
        self.enter_outside(record, ThreadStatus::Suspended);
    }

    /// Activate a fiber; blocks while a stop is in force
    pub fn activate(&self, record: &ThreadRecord) {
        self.leave_outside(record);
    }

    fn enter_outside(&self, record: &ThreadRecord, status: ThreadStatus) {
        let _state = self.state.lock();
        record.set_status(status);
        self.parked_cv.notify_all();
    }

    fn leave_outside(&self, record: &ThreadRecord) {
        let mut state = self.state.lock();
        while state.stopped && state.owner != Some(record.id) {
            self.resume_cv.wait(&mut state);
        }
        record.set_status(ThreadStatus::Running);
    }

    /// Run `f` in the native state
    ///
    /// `f` must not touch the heap. The state is left even if `f` panics.
    pub fn blocking<T>(&self, record: &ThreadRecord, f: impl FnOnce() -> T) -> T {
        struct Outside<'a> {
            nexus: &'a ThreadNexus,
            record: &'a ThreadRecord,
        }

        impl Drop for Outside<'_> {
            fn drop(&mut self) {
                self.nexus.leave_native(self.record);
            }
        }

        self.enter_native(record);
        let _outside = Outside {
            nexus: self,
            record,
        };
        f()
    }

    /// Set the stop flag; does not wait
    pub fn request_stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        self.stop.store(true, Ordering::Release);
        tracing::debug!(target: "mantle::nexus", "stop requested");
    }

    /// Wait until every registered record other than `exclude` is safe
    ///
    /// A timeout means some thread is missing a safe-point check; it is
    /// logged and returned, never ignored.
    pub fn wait_for_safe(&self, timeout: Duration, exclude: Option<u32>) -> GcResult<()> {
        let started = Instant::now();
        let mut state = self.state.lock();
        loop {
            let stragglers = self.stragglers(exclude);
            if stragglers.is_empty() {
                tracing::trace!(target: "mantle::nexus", waited = ?started.elapsed(), "world stopped");
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= timeout {
                tracing::error!(
                    target: "mantle::nexus",
                    ?waited,
                    ?stragglers,
                    "threads failed to reach a safe point"
                );
                return Err(GcError::SafePointTimeout { waited, stragglers });
            }
            self.parked_cv.wait_for(&mut state, timeout - waited);
        }
    }

    fn stragglers(&self, exclude: Option<u32>) -> Vec<u32> {
        self.registry
            .lock()
            .iter()
            .filter(|r| Some(r.id) != exclude && !r.status().is_safe())
            .map(|r| r.id)
            .collect()
    }

    /// Clear the stop flag and wake parked threads
    pub fn resume(&self) {
        let mut state = self.state.lock();
        Self::release(&mut state, &self.stop);
        self.resume_cv.notify_all();
        tracing::debug!(target: "mantle::nexus", "world resumed");
    }

    fn release(state: &mut NexusState, stop: &AtomicBool) {
        state.stopped = false;
        state.owner = None;
        state.stops += 1;
        stop.store(false, Ordering::Release);
    }

    /// Stop every mutator except the requester
    ///
    /// If another stop is in force the requester parks until it ends. The
    /// world resumes when the returned guard drops.
    pub fn stop_the_world<'a>(
        &'a self,
        requester: Option<&'a ThreadRecord>,
        timeout: Duration,
    ) -> GcResult<StopTheWorld<'a>> {
        {
            let mut state = self.state.lock();
            if state.stopped {
                let prior = requester.map(|r| r.status());
                if let Some(record) = requester {
                    record.set_status(ThreadStatus::Parked);
                    self.parked_cv.notify_all();
                }
                while state.stopped {
                    self.resume_cv.wait(&mut state);
                }
                if let (Some(record), Some(prior)) = (requester, prior) {
                    record.set_status(prior);
                }
            }
            state.stopped = true;
            state.owner = requester.map(ThreadRecord::id);
            self.stop.store(true, Ordering::Release);
        }
        tracing::debug!(
            target: "mantle::nexus",
            requester = ?requester.map(ThreadRecord::id),
            "stopping the world"
        );

        match self.wait_for_safe(timeout, requester.map(ThreadRecord::id)) {
            Ok(()) => Ok(StopTheWorld { nexus: self }),
            Err(err) => {
                self.resume();
                Err(err)
            }
        }
    }

    /// Completed stops so far
    pub fn stop_count(&self) -> u64 {
        self.state.lock().stops
    }

    /// Snapshot of every registered record
    pub fn threads(&self) -> Vec<Arc<ThreadRecord>> {
        self.registry.lock().clone()
    }

    /// Number of registered records
    pub fn len(&self) -> usize {
        self.registry.lock().len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.registry.lock().is_empty()
    }

    /// Number of registered records of one kind
    pub fn count(&self, kind: ThreadKind) -> usize {
        self.registry.lock().iter().filter(|r| r.kind == kind).count()
    }

    /// Fibers owned by a thread
    pub fn fibers_of(&self, thread_id: u32) -> Vec<Arc<ThreadRecord>> {
        self.registry
            .lock()
            .iter()
            .filter(|r| r.kind == ThreadKind::Fiber && r.owner == Some(thread_id))
            .cloned()
            .collect()
    }

    /// Look up a record by id
    pub fn find(&self, id: u32) -> Option<Arc<ThreadRecord>> {
        self.registry.lock().iter().find(|r| r.id == id).cloned()
    }

    /// Reinitialise in a forked child
    ///
    /// Every record except `survivor` belongs to a thread that does not
    /// exist in the child and is discarded.
    ///
    /// # Safety
    ///
    /// Must be called in the child right after `fork`, before any other
    /// thread is started and before anything else touches the nexus. Locks
    /// held by parent threads are released without being acquired.
    pub unsafe fn after_fork_child(&self, survivor: &ThreadRecord) {
        if self.state.is_locked() {
            // SAFETY: the holder does not exist in the child (caller contract)
            unsafe { self.state.force_unlock() };
        }
        if self.registry.is_locked() {
            // SAFETY: as above
            unsafe { self.registry.force_unlock() };
        }

        let mut state = self.state.lock();
        state.stopped = false;
        state.owner = None;
        self.stop.store(false, Ordering::Release);
        self.registry.lock().retain(|r| r.id == survivor.id);
        // SAFETY: as above
        unsafe { survivor.context().after_fork_child() };
        survivor.set_status(ThreadStatus::Running);
        tracing::info!(target: "mantle::nexus", survivor = survivor.id, "nexus reset after fork");
    }
}

/// The world is stopped while this guard lives
#[derive(Debug)]
#[must_use = "the world resumes as soon as the guard is dropped"]
pub struct StopTheWorld<'a> {
    nexus: &'a ThreadNexus,
}

impl StopTheWorld<'_> {
    /// Nexus that was stopped
    pub fn nexus(&self) -> &ThreadNexus {
        self.nexus
    }
}

impl Drop for StopTheWorld<'_> {
    fn drop(&mut self) {
        self.nexus.resume();
    }
}
