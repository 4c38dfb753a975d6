//! Fixed-capacity field storage (tuples)
//!
//! A tuple never changes size. Every bulk operation here writes slot by
//! slot through [`HeapInner::store_field`], so each written slot gets its
//! own barrier check.

use std::ops::Range;

use crate::error::{GcError, GcResult};
use crate::heap::{Heap, HeapInner};
use crate::object::{ObjectRef, Value};

impl HeapInner {
    /// Slot count of a tuple or instance
    pub(crate) fn num_fields(&self, tuple: ObjectRef) -> GcResult<usize> {
        Ok(self.fields(tuple)?.len())
    }

    /// Slot value, `None` past the end
    pub(crate) fn tuple_at(&self, tuple: ObjectRef, index: usize) -> GcResult<Option<Value>> {
        Ok(self.fields(tuple)?.get(index))
    }

    /// Copy `len` slots from `src[src_start..]` to `dest[dest_start..]`
    ///
    /// Source values are read before any store, so `src == dest` with
    /// overlapping ranges copies correctly.
    pub(crate) fn copy_slots(
        &mut self,
        src: ObjectRef,
        src_start: usize,
        len: usize,
        dest: ObjectRef,
        dest_start: usize,
    ) -> GcResult<()> {
        if len == 0 {
            return Ok(());
        }
        let values = {
            let fields = self.fields(src)?;
            let end = checked_end(src_start, len, fields.len())?;
            fields.as_slice()[src_start..end].to_vec()
        };
        checked_end(dest_start, len, self.num_fields(dest)?)?;
        for (offset, value) in values.into_iter().enumerate() {
            self.store_field(dest, dest_start + offset, value)?;
        }
        Ok(())
    }

    /// Move slots `[by, n)` down to `[0, n - by)` and clear the tail
    pub(crate) fn lshift_inplace(&mut self, tuple: ObjectRef, by: usize) -> GcResult<()> {
        let n = self.num_fields(tuple)?;
        if by == 0 {
            return Ok(());
        }
        if by >= n {
            return self.fill_nil(tuple, 0..n);
        }
        self.copy_slots(tuple, by, n - by, tuple, 0)?;
        self.fill_nil(tuple, n - by..n)
    }

    /// Set every slot in `range` to `Nil`
    pub(crate) fn fill_nil(&mut self, tuple: ObjectRef, range: Range<usize>) -> GcResult<()> {
        let n = self.num_fields(tuple)?;
        if range.end > n {
            return Err(GcError::BoundsViolation {
                index: range.end as i64,
                len: n,
            });
        }
        for index in range {
            self.store_field(tuple, index, Value::Nil)?;
        }
        Ok(())
    }
}

fn checked_end(start: usize, len: usize, capacity: usize) -> GcResult<usize> {
    match start.checked_add(len) {
        Some(end) if end <= capacity => Ok(end),
        _ => Err(GcError::BoundsViolation {
            index: start.saturating_add(len) as i64,
            len: capacity,
        }),
    }
}

impl Heap {
    /// Slot count of a tuple or instance
    pub fn num_fields(&self, tuple: ObjectRef) -> GcResult<usize> {
        self.read().num_fields(tuple)
    }

    /// Slot value of a tuple; `None` past the end
    pub fn tuple_at(&self, tuple: ObjectRef, index: usize) -> GcResult<Option<Value>> {
        self.read().tuple_at(tuple, index)
    }

    /// Barriered store into a tuple slot
    pub fn tuple_put(&self, tuple: ObjectRef, index: usize, value: Value) -> GcResult<()> {
        self.mutate(|inner| inner.store_field(tuple, index, value))
    }

    /// Copy `len` slots from `src` starting at `src_start` into `dest` at
    /// `dest_start`
    pub fn copy_from(
        &self,
        src: ObjectRef,
        src_start: usize,
        len: usize,
        dest: ObjectRef,
        dest_start: usize,
    ) -> GcResult<()> {
        self.mutate(|inner| inner.copy_slots(src, src_start, len, dest, dest_start))
    }

    /// Shift a tuple's slots left by `by`, clearing the vacated tail
    pub fn lshift_inplace(&self, tuple: ObjectRef, by: usize) -> GcResult<()> {
        self.mutate(|inner| inner.lshift_inplace(tuple, by))
    }

    /// Clear a range of slots
    pub fn fill_nil(&self, tuple: ObjectRef, range: Range<usize>) -> GcResult<()> {
        self.mutate(|inner| inner.fill_nil(tuple, range))
    }
}
