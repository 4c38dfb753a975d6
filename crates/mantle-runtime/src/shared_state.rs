//! Shared runtime state
//!
//! One [`SharedState`] per process, created at startup and passed by
//! reference to everything that needs it. It owns the heap, the collector
//! and the thread nexus, the runtime phase, global counters and the
//! auxiliary lock table.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use mantle_gc::{ClassRef, Collector, Heap, ThreadKind, ThreadNexus, ThreadRecord};
use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::locks::LockTable;
use crate::phase::{AtomicPhase, RuntimePhase};

/// Process-wide runtime context
pub struct SharedState {
    config: RuntimeConfig,
    heap: Arc<Heap>,
    nexus: Arc<ThreadNexus>,
    collector: Arc<Collector>,
    phase: AtomicPhase,
    /// Orders the admission check of a registration against the move to
    /// `Halting`
    admission: Mutex<()>,
    started: Instant,
    global_serial: AtomicU64,
    class_count: AtomicU32,
    method_count: AtomicU64,
    check_global_interrupts: AtomicBool,
    check_gc: AtomicBool,
    locks: LockTable,
}

impl SharedState {
    /// Create the runtime in the `Booting` phase
    pub fn new(config: RuntimeConfig) -> Self {
        let heap = Arc::new(Heap::with_config(config.gc.clone()));
        let nexus = Arc::new(ThreadNexus::new());
        let collector = Arc::new(Collector::new(Arc::clone(&heap), Arc::clone(&nexus)));
        let locks = LockTable::new(
            config.native_lock_policy,
            config.always_locked_libraries.clone(),
        );
        Self {
            config,
            heap,
            nexus,
            collector,
            phase: AtomicPhase::default(),
            admission: Mutex::new(()),
            started: Instant::now(),
            global_serial: AtomicU64::new(1),
            class_count: AtomicU32::new(1),
            method_count: AtomicU64::new(1),
            check_global_interrupts: AtomicBool::new(false),
            check_gc: AtomicBool::new(false),
            locks,
        }
    }

    /// Runtime configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Shared heap
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Thread nexus
    pub fn nexus(&self) -> &Arc<ThreadNexus> {
        &self.nexus
    }

    /// Garbage collector
    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    /// Auxiliary lock table
    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    // =========================================================================
    // Phase
    // =========================================================================

    /// Current phase
    pub fn phase(&self) -> RuntimePhase {
        self.phase.load()
    }

    /// True while booting
    pub fn is_booting(&self) -> bool {
        self.phase() == RuntimePhase::Booting
    }

    /// True while running
    pub fn is_running(&self) -> bool {
        self.phase() == RuntimePhase::Running
    }

    /// True once shutdown has begun
    pub fn is_halting(&self) -> bool {
        self.phase() == RuntimePhase::Halting
    }

    /// Finish booting
    ///
    /// Starts the background collector if configured.
    pub fn set_running(&self) -> RuntimeResult<()> {
        self.phase.transition(RuntimePhase::Running)?;
        tracing::info!(target: "mantle::runtime", "runtime running");
        if self.config.background_collector {
            self.collector.start_background(self.config.background_poll);
        }
        Ok(())
    }

    /// Enter `Halting`: refuse new threads and stop the collector
    ///
    /// Calling it again once halting is a no-op. A registration racing
    /// with shutdown either completes before the phase changes or is
    /// refused.
    pub fn shutdown(&self) -> RuntimeResult<()> {
        let transition = {
            let _admission = self.admission.lock();
            self.phase.transition(RuntimePhase::Halting)
        };
        match transition {
            Ok(from) => {
                tracing::info!(target: "mantle::runtime", ?from, "runtime halting");
            }
            Err(RuntimeError::InvalidPhaseTransition {
                from: RuntimePhase::Halting,
                ..
            }) => return Ok(()),
            Err(err) => return Err(err),
        }
        self.collector.halt();
        Ok(())
    }

    // =========================================================================
    // Counters
    // =========================================================================

    /// Current global serial
    pub fn global_serial(&self) -> u64 {
        self.global_serial.load(Ordering::Acquire)
    }

    /// Bump the global serial, returning the previous value
    pub fn inc_global_serial(&self) -> u64 {
        self.global_serial.fetch_add(1, Ordering::AcqRel)
    }

    /// Count a new class, returning the previous count
    pub fn inc_class_count(&self) -> u32 {
        self.class_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Count a new method, returning the previous count
    pub fn inc_method_count(&self) -> u64 {
        self.method_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Issue a class ref for a user-defined class
    pub fn new_class_ref(&self) -> ClassRef {
        ClassRef(ClassRef::FIRST_USER + self.inc_class_count() - 1)
    }

    /// Time since the runtime was created
    pub fn run_time(&self) -> Duration {
        self.started.elapsed()
    }

    // =========================================================================
    // Interrupts
    // =========================================================================

    /// Ask every mutator to look at global interrupts at its next safe point
    pub fn set_check_global_interrupts(&self) {
        self.check_global_interrupts.store(true, Ordering::Release);
    }

    /// Clear the global interrupt flag
    pub fn clear_check_global_interrupts(&self) {
        self.check_global_interrupts.store(false, Ordering::Release);
    }

    /// True if global interrupts are pending
    pub fn check_global_interrupts(&self) -> bool {
        self.check_global_interrupts.load(Ordering::Acquire)
    }

    /// Request a collection at the next mutator safe point
    pub fn gc_soon(&self) {
        self.check_global_interrupts.store(true, Ordering::Release);
        self.check_gc.store(true, Ordering::Release);
        self.collector.request_collection();
        tracing::debug!(target: "mantle::runtime", "collection requested");
    }

    /// Take a pending `gc_soon` request
    pub fn check_gc(&self) -> bool {
        self.check_gc.swap(false, Ordering::AcqRel)
    }

    /// True if `gc_soon` was called and nobody has taken the request yet
    pub fn gc_pending(&self) -> bool {
        self.check_gc.load(Ordering::Acquire)
    }

    // =========================================================================
    // Threads
    // =========================================================================

    /// Register a mutator or helper thread; refused while halting
    pub fn register_thread(&self, kind: ThreadKind) -> RuntimeResult<Arc<ThreadRecord>> {
        if self.is_halting() {
            return Err(RuntimeError::Halting);
        }
        let record = self.admit(self.nexus.register(kind))?;
        tracing::debug!(target: "mantle::runtime", id = record.id(), ?kind, "thread registered");
        Ok(record)
    }

    /// Register a fiber owned by `owner`; refused while halting
    pub fn register_fiber(&self, owner: u32) -> RuntimeResult<Arc<ThreadRecord>> {
        if self.is_halting() {
            return Err(RuntimeError::Halting);
        }
        self.admit(self.nexus.register_fiber(owner))
    }

    /// Keep a fresh record only if shutdown has not begun
    ///
    /// Registering may wait out a stopped world, so it happens before the
    /// admission lock is taken; a record that lost the race with `shutdown`
    /// is removed again.
    fn admit(&self, record: Arc<ThreadRecord>) -> RuntimeResult<Arc<ThreadRecord>> {
        let _admission = self.admission.lock();
        if self.is_halting() {
            self.nexus.unregister(&record);
            return Err(RuntimeError::Halting);
        }
        Ok(record)
    }

    /// Remove a thread or fiber
    pub fn unregister_thread(&self, record: &ThreadRecord) {
        self.nexus.unregister(record);
    }

    /// Issue a fresh thread id
    pub fn new_thread_id(&self) -> u32 {
        self.nexus.new_thread_id()
    }

    /// Live ordinary threads
    pub fn threads_count(&self) -> usize {
        self.nexus.count(ThreadKind::Thread)
    }

    /// Live fibers
    pub fn fibers_count(&self) -> usize {
        self.nexus.count(ThreadKind::Fiber)
    }

    /// Fibers owned by a thread
    pub fn thread_fibers(&self, thread_id: u32) -> Vec<Arc<ThreadRecord>> {
        self.nexus.fibers_of(thread_id)
    }

    // =========================================================================
    // Native libraries and constants
    // =========================================================================

    /// Lock index for a native library; 0 means unlocked
    pub fn native_lock_index(&self, library: &str) -> u32 {
        self.locks.native_lock_index(library)
    }

    /// Run `f` holding native lock `index`
    pub fn with_native_lock<T>(&self, index: u32, f: impl FnOnce() -> T) -> RuntimeResult<T> {
        self.locks.with_native_lock(index, f)
    }

    /// Intern a constant name
    pub fn intern_constant(&self, name: &str) -> u32 {
        self.locks.intern_constant(name)
    }

    /// Name of an interned constant
    pub fn constant_name(&self, index: u32) -> Option<String> {
        self.locks.constant_name(index)
    }

    // =========================================================================
    // Fork
    // =========================================================================

    /// Reinitialise in a forked child
    ///
    /// Resets every lock without acquiring it, the heap's included, then
    /// drops every thread record except `survivor`.
    ///
    /// # Safety
    ///
    /// Must run exactly once, in the child, right after `fork`, on the
    /// thread that `survivor` describes, before anything else touches the
    /// runtime.
    pub unsafe fn after_fork_child(&self, survivor: &ThreadRecord) -> RuntimeResult<()> {
        // SAFETY: forwarded caller contract
        unsafe {
            self.locks.reset()?;
            if self.admission.is_locked() {
                self.admission.force_unlock();
            }
            self.heap.after_fork_child();
            self.collector.after_fork_child();
            self.nexus.after_fork_child(survivor);
        }
        self.check_gc.store(false, Ordering::Release);
        tracing::info!(target: "mantle::runtime", survivor = survivor.id(), "runtime reset after fork");
        Ok(())
    }
}

impl Drop for SharedState {
    fn drop(&mut self) {
        // the background thread holds its own Arc to the collector
        self.collector.stop_background();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NativeLockPolicy;
    use mantle_gc::{GcPhase, ThreadStatus, Value};

    #[test]
    fn test_counters_start_at_one() {
        let shared = SharedState::new(RuntimeConfig::default());
        assert_eq!(shared.global_serial(), 1);
        assert_eq!(shared.inc_global_serial(), 1);
        assert_eq!(shared.inc_global_serial(), 2);
        assert_eq!(shared.global_serial(), 3);
        assert_eq!(shared.inc_class_count(), 1);
        assert_eq!(shared.inc_method_count(), 1);
        assert_eq!(shared.inc_method_count(), 2);
    }

    #[test]
    fn test_new_class_refs_are_user_classes() {
        let shared = SharedState::new(RuntimeConfig::default());
        let first = shared.new_class_ref();
        let second = shared.new_class_ref();
        assert!(!first.is_builtin());
        assert_eq!(second.0, first.0 + 1);
    }

    #[test]
    fn test_phase_lifecycle() {
        let shared = SharedState::new(RuntimeConfig::default());
        assert!(shared.is_booting());
        shared.set_running().unwrap();
        assert!(shared.is_running());
        assert!(shared.set_running().is_err());
        shared.shutdown().unwrap();
        assert!(shared.is_halting());
        shared.shutdown().unwrap();
        assert!(shared.collector().is_halted());
    }

    #[test]
    fn test_registration_refused_while_halting() {
        let shared = SharedState::new(RuntimeConfig::default());
        let record = shared.register_thread(ThreadKind::Thread).unwrap();
        shared.shutdown().unwrap();
        assert_eq!(
            shared.register_thread(ThreadKind::Thread).unwrap_err(),
            RuntimeError::Halting
        );
        assert_eq!(
            shared.register_fiber(record.id()).unwrap_err(),
            RuntimeError::Halting
        );
    }

    #[test]
    fn test_gc_soon_is_taken_once() {
        let shared = SharedState::new(RuntimeConfig::default());
        assert!(!shared.check_gc());
        shared.gc_soon();
        assert!(shared.check_global_interrupts());
        assert!(shared.collector().collection_requested());
        assert!(shared.check_gc());
        assert!(!shared.check_gc());
        shared.clear_check_global_interrupts();
        assert!(!shared.check_global_interrupts());
    }

    #[test]
    fn test_thread_and_fiber_counts() {
        let shared = SharedState::new(RuntimeConfig::default());
        let thread = shared.register_thread(ThreadKind::Thread).unwrap();
        let _helper = shared.register_thread(ThreadKind::Helper).unwrap();
        let fiber = shared.register_fiber(thread.id()).unwrap();
        assert_eq!(shared.threads_count(), 1);
        assert_eq!(shared.fibers_count(), 1);
        assert_eq!(shared.thread_fibers(thread.id())[0].id(), fiber.id());
        shared.unregister_thread(&fiber);
        assert_eq!(shared.fibers_count(), 0);
    }

    #[test]
    fn test_background_collector_follows_phase() {
        let shared = SharedState::new(RuntimeConfig {
            background_collector: true,
            ..RuntimeConfig::default()
        });
        assert!(!shared.collector().background_running());
        shared.set_running().unwrap();
        assert!(shared.collector().background_running());
        shared.shutdown().unwrap();
        assert!(!shared.collector().background_running());
    }

    #[test]
    fn test_native_lock_policy_from_config() {
        let shared = SharedState::new(RuntimeConfig {
            native_lock_policy: NativeLockPolicy::PerLibrary,
            ..RuntimeConfig::default()
        });
        let index = shared.native_lock_index("zlib");
        assert_eq!(index, 1);
        assert_eq!(shared.with_native_lock(index, || "done").unwrap(), "done");
    }

    #[test]
    fn test_after_fork_child_keeps_only_survivor() {
        let shared = SharedState::new(RuntimeConfig::default());
        let survivor = shared.register_thread(ThreadKind::Thread).unwrap();
        let _other = shared.register_thread(ThreadKind::Thread).unwrap();
        std::mem::forget(shared.locks().codedb());
        std::mem::forget(shared.locks().handle_cache().lock());

        unsafe { shared.after_fork_child(&survivor).unwrap() };

        assert_eq!(shared.threads_count(), 1);
        assert_eq!(survivor.status(), ThreadStatus::Running);
        assert!(shared.locks().handle_cache().try_lock().is_some());
        drop(shared.locks().codedb());
    }

    #[test]
    fn test_after_fork_child_releases_heap_lock() {
        let shared = SharedState::new(RuntimeConfig::default());
        let survivor = shared.register_thread(ThreadKind::Thread).unwrap();
        let kept = shared.heap().allocate_fields(1).unwrap();
        std::mem::forget(shared.heap().read());

        unsafe { shared.after_fork_child(&survivor).unwrap() };

        let fresh = shared.heap().allocate_fields(1).unwrap();
        shared
            .heap()
            .write_field(kept, 0, Value::Ref(fresh))
            .unwrap();
        assert_eq!(shared.heap().phase(), GcPhase::Idle);
        assert_eq!(shared.collector().stats().collections, 0);
    }

    #[test]
    fn test_register_after_shutdown_leaves_nexus_empty() {
        let shared = SharedState::new(RuntimeConfig::default());
        shared.shutdown().unwrap();
        assert_eq!(
            shared.register_thread(ThreadKind::Thread).unwrap_err(),
            RuntimeError::Halting
        );
        assert_eq!(shared.register_fiber(1).unwrap_err(), RuntimeError::Halting);
        assert_eq!(shared.threads_count(), 0);
        assert_eq!(shared.fibers_count(), 0);
    }

    #[test]
    fn test_registration_racing_shutdown() {
        let shared = Arc::new(SharedState::new(RuntimeConfig::default()));
        shared.set_running().unwrap();
        let admitted: Vec<_> = (0..8)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    (0..50)
                        .filter_map(|_| shared.register_thread(ThreadKind::Thread).ok())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        std::thread::yield_now();
        shared.shutdown().unwrap();
        assert!(shared.register_thread(ThreadKind::Thread).is_err());

        let mut records = Vec::new();
        for worker in admitted {
            records.extend(worker.join().unwrap());
        }
        // refused registrations leave nothing behind
        assert_eq!(shared.threads_count(), records.len());
    }
}
