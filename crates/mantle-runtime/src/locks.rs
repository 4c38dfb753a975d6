//! Auxiliary lock table
//!
//! Locks used by code outside the collector that must not race with it:
//! a blocking mutex for the code database, spinlocks for small metadata
//! tables, and one mutex per native library.
//!
//! After `fork` only the forking thread exists in the child, so any lock
//! held by another parent thread would stay held forever. [`LockTable::reset`]
//! releases every lock without acquiring it first.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::Backoff;
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;

use crate::config::NativeLockPolicy;
use crate::error::{RuntimeError, RuntimeResult};

/// Test-and-test-and-set spinlock for short critical sections
pub struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: the value is only reachable through a guard, and at most one
// guard exists at a time.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> SpinLock<T> {
    /// Create an unlocked spinlock
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Spin until the lock is ours
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let backoff = Backoff::new();
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinLockGuard { lock: self };
            }
            while self.locked.load(Ordering::Relaxed) {
                backoff.snooze();
            }
        }
    }

    /// Take the lock if it is free
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard { lock: self })
    }

    /// True while some guard is alive
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Release the lock without holding a guard
    ///
    /// # Safety
    ///
    /// No live guard may be used afterwards. Only valid when the holder no
    /// longer exists, as in a forked child.
    pub unsafe fn force_unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// Access to a [`SpinLock`]'s value; unlocks on drop
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive access
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive access
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// Library name to lock index map and the locks themselves
#[derive(Default)]
pub struct NativeLocks {
    indices: FxHashMap<String, u32>,
    locks: Vec<Arc<Mutex<()>>>,
    shared: Option<u32>,
}

impl NativeLocks {
    /// Number of issued locks
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True if no lock has been issued
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn push_lock(&mut self) -> u32 {
        self.locks.push(Arc::new(Mutex::new(())));
        // 1-based, so 0 can mean "no lock"
        self.locks.len() as u32
    }
}

/// Interned constant names
#[derive(Default)]
pub struct ConstantNames {
    names: Vec<String>,
    indices: FxHashMap<String, u32>,
}

/// Named auxiliary locks and the native library locks
pub struct LockTable {
    policy: NativeLockPolicy,
    always_locked: Vec<String>,
    codedb: Mutex<()>,
    native_data: SpinLock<()>,
    native_locks: SpinLock<NativeLocks>,
    constants: SpinLock<ConstantNames>,
    global_handle: SpinLock<()>,
    handle_cache: SpinLock<()>,
    wait: SpinLock<()>,
    type_info: SpinLock<()>,
    code_resource: SpinLock<()>,
    resetting: AtomicBool,
}

impl LockTable {
    /// Create a table with every lock free
    pub fn new(policy: NativeLockPolicy, always_locked: Vec<String>) -> Self {
        Self {
            policy,
            always_locked,
            codedb: Mutex::new(()),
            native_data: SpinLock::default(),
            native_locks: SpinLock::default(),
            constants: SpinLock::default(),
            global_handle: SpinLock::default(),
            handle_cache: SpinLock::default(),
            wait: SpinLock::default(),
            type_info: SpinLock::default(),
            code_resource: SpinLock::default(),
            resetting: AtomicBool::new(false),
        }
    }

    /// Lock the code database; may block for a long time
    pub fn codedb(&self) -> MutexGuard<'_, ()> {
        self.codedb.lock()
    }

    /// Native data structures
    pub fn native_data(&self) -> &SpinLock<()> {
        &self.native_data
    }

    /// Global handle table
    pub fn global_handle(&self) -> &SpinLock<()> {
        &self.global_handle
    }

    /// Handle cache
    pub fn handle_cache(&self) -> &SpinLock<()> {
        &self.handle_cache
    }

    /// Wait queues
    pub fn wait(&self) -> &SpinLock<()> {
        &self.wait
    }

    /// Type info registry
    pub fn type_info(&self) -> &SpinLock<()> {
        &self.type_info
    }

    /// Code resources
    pub fn code_resource(&self) -> &SpinLock<()> {
        &self.code_resource
    }

    /// Lock index for a native library, issuing one on first use
    ///
    /// Returns 0 when the library runs without a lock. Under
    /// [`NativeLockPolicy::Global`] every library without a private lock
    /// shares one index.
    pub fn native_lock_index(&self, library: &str) -> u32 {
        let mut natives = self.native_locks.lock();
        if let Some(&index) = natives.indices.get(library) {
            return index;
        }
        let private = self.always_locked.iter().any(|l| l == library);
        let index = match self.policy {
            NativeLockPolicy::Unlocked if !private => 0,
            NativeLockPolicy::Global if !private => match natives.shared {
                Some(shared) => shared,
                None => {
                    let shared = natives.push_lock();
                    natives.shared = Some(shared);
                    shared
                }
            },
            _ => natives.push_lock(),
        };
        natives.indices.insert(library.to_string(), index);
        tracing::debug!(target: "mantle::runtime", library, index, "native lock index issued");
        index
    }

    /// Run `f` holding native lock `index`; index 0 runs it unlocked
    pub fn with_native_lock<T>(&self, index: u32, f: impl FnOnce() -> T) -> RuntimeResult<T> {
        if index == 0 {
            return Ok(f());
        }
        let lock = {
            let natives = self.native_locks.lock();
            natives
                .locks
                .get(index as usize - 1)
                .cloned()
                .ok_or(RuntimeError::UnknownNativeLock(index))?
        };
        let _held = lock.lock();
        Ok(f())
    }

    /// Number of native locks issued so far
    pub fn native_lock_count(&self) -> usize {
        self.native_locks.lock().len()
    }

    /// Intern a constant name, returning its index
    pub fn intern_constant(&self, name: &str) -> u32 {
        let mut constants = self.constants.lock();
        if let Some(&index) = constants.indices.get(name) {
            return index;
        }
        let index = constants.names.len() as u32;
        constants.names.push(name.to_string());
        constants.indices.insert(name.to_string(), index);
        index
    }

    /// Name of an interned constant
    pub fn constant_name(&self, index: u32) -> Option<String> {
        self.constants.lock().names.get(index as usize).cloned()
    }

    /// Release every lock without acquiring it
    ///
    /// # Safety
    ///
    /// Must be called from the only thread left in a forked child, before
    /// anything else touches the table. Guards held across the reset are
    /// invalid afterwards.
    pub unsafe fn reset(&self) -> RuntimeResult<()> {
        if self.resetting.swap(true, Ordering::AcqRel) {
            tracing::error!(target: "mantle::runtime", "lock table reset while another reset is running");
            return Err(RuntimeError::LockReset(
                "another reset is already running".into(),
            ));
        }

        // SAFETY: the caller guarantees no holder survives
        unsafe {
            if self.codedb.is_locked() {
                self.codedb.force_unlock();
            }
            self.native_data.force_unlock();
            self.native_locks.force_unlock();
            self.constants.force_unlock();
            self.global_handle.force_unlock();
            self.handle_cache.force_unlock();
            self.wait.force_unlock();
            self.type_info.force_unlock();
            self.code_resource.force_unlock();

            let natives = self.native_locks.lock();
            for lock in &natives.locks {
                if lock.is_locked() {
                    lock.force_unlock();
                }
            }
        }

        self.resetting.store(false, Ordering::Release);
        tracing::info!(target: "mantle::runtime", "lock table reset");
        Ok(())
    }
}
