//! Mutator execution contexts
//!
//! Each registered thread owns an [`ExecutionContext`]: the references held
//! by its frames and registers. The collector reads every context while the
//! world is stopped.

use parking_lot::Mutex;

use crate::object::{ObjectRef, Value};

/// Root slots of one mutator
#[derive(Debug, Default)]
pub struct ExecutionContext {
    slots: Mutex<Vec<Value>>,
}

impl ExecutionContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a root, returning its slot
    pub fn push(&self, value: Value) -> usize {
        let mut slots = self.slots.lock();
        slots.push(value);
        slots.len() - 1
    }

    /// Pop the most recent root
    pub fn pop(&self) -> Option<Value> {
        self.slots.lock().pop()
    }

    /// Read a root slot
    pub fn get(&self, slot: usize) -> Option<Value> {
        self.slots.lock().get(slot).copied()
    }

    /// Overwrite a root slot; returns false if the slot does not exist
    pub fn set(&self, slot: usize, value: Value) -> bool {
        match self.slots.lock().get_mut(slot) {
            Some(existing) => {
                *existing = value;
                true
            }
            None => false,
        }
    }

    /// Number of root slots
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// True when no roots are held
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Drop slots above `len` (frame exit)
    pub fn truncate(&self, len: usize) {
        self.slots.lock().truncate(len);
    }

    /// Drop every root
    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    /// Release a slot lock held by a thread lost to `fork`
    ///
    /// # Safety
    ///
    /// Only valid in a forked child before any other thread starts; the
    /// holder must no longer exist.
    pub unsafe fn after_fork_child(&self) {
        if self.slots.is_locked() {
            // SAFETY: the holder does not exist in the child (caller contract)
            unsafe { self.slots.force_unlock() };
        }
    }

    /// Visit every heap reference held
    pub fn scan(&self, mut visit: impl FnMut(ObjectRef)) {
        for value in self.slots.lock().iter() {
            if let Value::Ref(r) = value {
                visit(*r);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_set_truncate() {
        let ctx = ExecutionContext::new();
        let a = ctx.push(Value::Fixnum(1));
        let b = ctx.push(Value::Nil);
        assert_eq!((a, b), (0, 1));
        assert!(ctx.set(b, Value::Bool(true)));
        assert!(!ctx.set(5, Value::Nil));
        assert_eq!(ctx.get(b), Some(Value::Bool(true)));
        ctx.truncate(1);
        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx.pop(), Some(Value::Fixnum(1)));
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_scan_only_refs() {
        let ctx = ExecutionContext::new();
        let r = ObjectRef::new(3, 1);
        ctx.push(Value::Fixnum(1));
        ctx.push(Value::Ref(r));
        ctx.push(Value::Nil);
        let mut seen = Vec::new();
        ctx.scan(|o| seen.push(o));
        assert_eq!(seen, vec![r]);
    }

    #[test]
    fn test_after_fork_child_releases_slots() {
        let ctx = ExecutionContext::new();
        ctx.push(Value::Fixnum(1));
        std::mem::forget(ctx.slots.lock());
        unsafe { ctx.after_fork_child() };
        assert_eq!(ctx.len(), 1);
        ctx.push(Value::Fixnum(2));
        assert_eq!(ctx.get(1), Some(Value::Fixnum(2)));
    }
}
