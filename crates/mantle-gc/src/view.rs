//! Growable views (arrays)
//!
//! A view is a window `(start, total)` over a backing tuple. Slots outside
//! the window are always `Nil`, so growing the window never exposes stale
//! values. Operations that need a larger backing allocate the new tuple
//! before touching the old one; a failed allocation leaves the view as it
//! was.

use crate::error::{GcError, GcResult};
use crate::heap::{Heap, HeapInner};
use crate::object::{ObjectBody, ObjectKind, ObjectRef, Value, ViewHeader};

/// Smallest capacity a view grows to
pub const MIN_CAPACITY: usize = 3;

/// Capacity after growth: at least `max(3, 2 * current)`, doubled until it
/// covers `needed`
pub fn grown_capacity(current: usize, needed: usize) -> usize {
    let mut capacity = current.saturating_mul(2).max(MIN_CAPACITY);
    while capacity < needed {
        capacity = capacity.saturating_mul(2);
    }
    capacity
}

impl HeapInner {
    /// Header of a view
    pub(crate) fn view_header(&self, view: ObjectRef) -> GcResult<ViewHeader> {
        match &self.object(view)?.body {
            ObjectBody::Array(header) => Ok(*header),
            _ => Err(GcError::KindMismatch {
                object: view,
                expected: ObjectKind::Array,
            }),
        }
    }

    /// Header of a view that is about to be mutated
    fn mutable_view(&self, view: ObjectRef) -> GcResult<ViewHeader> {
        let header = self.view_header(view)?;
        self.check_mutable(view)?;
        Ok(header)
    }

    fn set_view_window(&mut self, view: ObjectRef, start: usize, total: usize) -> GcResult<()> {
        match &mut self.object_mut(view)?.body {
            ObjectBody::Array(header) => {
                // An empty view restarts at the front of its storage
                let start = if total == 0 { 0 } else { start };
                header.set_window(start, total);
                Ok(())
            }
            _ => Err(GcError::KindMismatch {
                object: view,
                expected: ObjectKind::Array,
            }),
        }
    }

    fn slot(&self, tuple: ObjectRef, index: usize) -> GcResult<Value> {
        Ok(self.tuple_at(tuple, index)?.unwrap_or(Value::Nil))
    }

    pub(crate) fn view_capacity(&self, view: ObjectRef) -> GcResult<usize> {
        let header = self.view_header(view)?;
        self.num_fields(header.storage())
    }

    /// Logical elements in order
    pub(crate) fn view_values(&self, view: ObjectRef) -> GcResult<Vec<Value>> {
        let header = self.view_header(view)?;
        let fields = self.fields(header.storage())?;
        Ok(fields.as_slice()[header.start()..header.start() + header.total()].to_vec())
    }

    /// Element at a logical index; negative indexes count from the end and
    /// anything off either end is `Nil`
    pub(crate) fn view_get(&self, view: ObjectRef, index: i64) -> GcResult<Value> {
        let header = self.view_header(view)?;
        let total = header.total() as i64;
        let index = if index < 0 { index + total } else { index };
        if index < 0 || index >= total {
            return Ok(Value::Nil);
        }
        self.slot(header.storage(), header.start() + index as usize)
    }

    /// Store at a logical index, growing the view past its end if needed
    pub(crate) fn view_set(&mut self, view: ObjectRef, index: usize, value: Value) -> GcResult<()> {
        let header = self.mutable_view(view)?;
        let capacity = self.num_fields(header.storage())?;
        let mut storage = header.storage();
        let mut start = header.start();
        let (Some(position), Some(needed)) = (start.checked_add(index), index.checked_add(1))
        else {
            return Err(GcError::BoundsViolation {
                index: i64::try_from(index).unwrap_or(i64::MAX),
                len: header.total(),
            });
        };

        if position >= capacity {
            if index < capacity {
                self.lshift_inplace(storage, start)?;
            } else {
                let fresh = self.allocate_tuple(grown_capacity(capacity, needed))?;
                self.copy_slots(storage, start, header.total(), fresh, 0)?;
                self.store_view_storage(view, fresh)?;
                storage = fresh;
            }
            start = 0;
            self.set_view_window(view, 0, header.total())?;
        }

        self.store_field(storage, start + index, value)?;
        if index >= header.total() {
            self.set_view_window(view, start, needed)?;
        }
        Ok(())
    }

    /// Store with negative-index support
    pub(crate) fn view_aset(&mut self, view: ObjectRef, index: i64, value: Value) -> GcResult<()> {
        let header = self.mutable_view(view)?;
        let total = header.total();
        let logical = if index < 0 { index + total as i64 } else { index };
        let logical = usize::try_from(logical)
            .map_err(|_| GcError::BoundsViolation { index, len: total })?;
        self.view_set(view, logical, value)
    }

    pub(crate) fn view_append(&mut self, view: ObjectRef, value: Value) -> GcResult<()> {
        let total = self.mutable_view(view)?.total();
        self.view_set(view, total, value)
    }

    pub(crate) fn view_pop(&mut self, view: ObjectRef) -> GcResult<Value> {
        let header = self.mutable_view(view)?;
        if header.total() == 0 {
            return Ok(Value::Nil);
        }
        let last = header.start() + header.total() - 1;
        let value = self.slot(header.storage(), last)?;
        self.store_field(header.storage(), last, Value::Nil)?;
        self.set_view_window(view, header.start(), header.total() - 1)?;
        Ok(value)
    }

    pub(crate) fn view_shift(&mut self, view: ObjectRef) -> GcResult<Value> {
        let header = self.mutable_view(view)?;
        if header.total() == 0 {
            return Ok(Value::Nil);
        }
        let value = self.slot(header.storage(), header.start())?;
        self.store_field(header.storage(), header.start(), Value::Nil)?;
        self.set_view_window(view, header.start() + 1, header.total() - 1)?;
        Ok(value)
    }

    pub(crate) fn view_unshift(&mut self, view: ObjectRef, value: Value) -> GcResult<()> {
        let header = self.mutable_view(view)?;
        let storage = header.storage();
        let (start, total) = (header.start(), header.total());

        if start > 0 {
            self.store_field(storage, start - 1, value)?;
            return self.set_view_window(view, start - 1, total + 1);
        }

        // No room in front: move the elements right, into a larger tuple if
        // the current one is full, leaving half the spare room as headroom.
        let capacity = self.num_fields(storage)?;
        let (target, target_capacity) = if total < capacity {
            (storage, capacity)
        } else {
            let grown = grown_capacity(capacity, total + 1);
            (self.allocate_tuple(grown)?, grown)
        };
        let front = (target_capacity - total).div_ceil(2);
        self.copy_slots(storage, 0, total, target, front)?;
        if target == storage {
            self.fill_nil(storage, 0..front.min(total))?;
        } else {
            self.store_view_storage(view, target)?;
        }
        self.store_field(target, front - 1, value)?;
        self.set_view_window(view, front - 1, total + 1)
    }

    /// Append every element of `other`; `other` may be `view` itself
    pub(crate) fn view_concat(&mut self, view: ObjectRef, other: ObjectRef) -> GcResult<()> {
        let header = self.mutable_view(view)?;
        let values = self.view_values(other)?;
        if values.is_empty() {
            return Ok(());
        }

        let capacity = self.num_fields(header.storage())?;
        let (start, total) = (header.start(), header.total());
        let new_total = total + values.len();
        let (storage, start) = if start + new_total <= capacity {
            (header.storage(), start)
        } else if new_total <= capacity {
            self.lshift_inplace(header.storage(), start)?;
            self.set_view_window(view, 0, total)?;
            (header.storage(), 0)
        } else {
            let fresh = self.allocate_tuple(grown_capacity(capacity, new_total))?;
            self.copy_slots(header.storage(), start, total, fresh, 0)?;
            self.store_view_storage(view, fresh)?;
            (fresh, 0)
        };

        for (offset, value) in values.into_iter().enumerate() {
            self.store_field(storage, start + total + offset, value)?;
        }
        self.set_view_window(view, start, new_total)
    }

    /// Move the window to `(new_start, new_total)`
    ///
    /// Values at physical positions inside both the old and new window are
    /// kept; every other slot of the new window is `Nil`.
    pub(crate) fn resize_view(
        &mut self,
        view: ObjectRef,
        new_start: usize,
        new_total: usize,
    ) -> GcResult<()> {
        let header = self.mutable_view(view)?;
        let capacity = self.num_fields(header.storage())?;
        let new_end = new_start
            .checked_add(new_total)
            .ok_or(GcError::BoundsViolation {
                index: i64::MAX,
                len: capacity,
            })?;
        let old = header.start()..header.start() + header.total();
        let kept = old.start.max(new_start)..old.end.min(new_end);

        if new_end <= capacity {
            for index in old.clone() {
                if !kept.contains(&index) {
                    self.store_field(header.storage(), index, Value::Nil)?;
                }
            }
        } else {
            let fresh = self.allocate_tuple(grown_capacity(capacity, new_end))?;
            if kept.start < kept.end {
                self.copy_slots(header.storage(), kept.start, kept.len(), fresh, kept.start)?;
            }
            self.store_view_storage(view, fresh)?;
        }
        match &mut self.object_mut(view)?.body {
            ObjectBody::Array(header) => header.set_window(new_start, new_total),
            _ => unreachable!("checked above"),
        }
        Ok(())
    }

    /// New view holding `values`, with room for at least `capacity`
    pub(crate) fn view_from_values(
        &mut self,
        values: &[Value],
        capacity: usize,
    ) -> GcResult<ObjectRef> {
        let view = self.allocate_view(capacity.max(values.len()))?;
        let storage = self.view_header(view)?.storage();
        for (index, value) in values.iter().enumerate() {
            self.store_field(storage, index, *value)?;
        }
        self.set_view_window(view, 0, values.len())?;
        Ok(view)
    }
}

impl Heap {
    /// Allocate an empty array with `capacity` slots of backing storage
    pub fn allocate_array(&self, capacity: usize) -> GcResult<ObjectRef> {
        self.mutate(|inner| inner.allocate_view(capacity))
    }

    /// Empty array with room for `count` elements (at least one)
    pub fn array_new_reserved(&self, count: usize) -> GcResult<ObjectRef> {
        self.allocate_array(count.max(1))
    }

    /// Array holding a copy of every slot of a tuple
    pub fn array_from_tuple(&self, tuple: ObjectRef) -> GcResult<ObjectRef> {
        self.mutate(|inner| {
            let values = inner.fields(tuple)?.as_slice().to_vec();
            inner.view_from_values(&values, values.len())
        })
    }

    /// Shallow copy of an array
    pub fn array_dup(&self, view: ObjectRef) -> GcResult<ObjectRef> {
        self.mutate(|inner| {
            let values = inner.view_values(view)?;
            inner.view_from_values(&values, values.len())
        })
    }

    /// New array of `count` elements copied from `view` starting at
    /// logical `index`; positions past the end are `Nil`
    pub fn array_new_range(&self, view: ObjectRef, index: i64, count: usize) -> GcResult<ObjectRef> {
        self.mutate(|inner| {
            let total = inner.view_header(view)?.total();
            let first = if index < 0 {
                index.saturating_add(i64::try_from(total).unwrap_or(i64::MAX))
            } else {
                index
            };
            // sized and charged before any slot is copied
            let fresh = inner.allocate_view(count)?;
            let storage = inner.view_header(fresh)?.storage();
            let skip = if first < 0 {
                usize::try_from(first.unsigned_abs()).unwrap_or(usize::MAX)
            } else {
                0
            };
            for offset in skip..count {
                let Some(at) = i64::try_from(offset)
                    .ok()
                    .and_then(|o| first.checked_add(o))
                    .filter(|at| usize::try_from(*at).is_ok_and(|at| at < total))
                else {
                    break;
                };
                let value = inner.view_get(view, at)?;
                inner.store_field(storage, offset, value)?;
            }
            inner.set_view_window(fresh, 0, count)?;
            Ok(fresh)
        })
    }

    /// Element at a non-negative logical index; `Nil` past the end
    pub fn array_get(&self, view: ObjectRef, index: usize) -> GcResult<Value> {
        let index = i64::try_from(index).unwrap_or(i64::MAX);
        self.read().view_get(view, index)
    }

    /// Element at a logical index; negative counts from the end
    pub fn array_aref(&self, view: ObjectRef, index: i64) -> GcResult<Value> {
        self.read().view_get(view, index)
    }

    /// Store at a non-negative logical index, growing the array as needed
    pub fn array_set(&self, view: ObjectRef, index: usize, value: Value) -> GcResult<()> {
        self.mutate(|inner| inner.view_set(view, index, value))
    }

    /// Store at a logical index; negative counts from the end
    pub fn array_aset(&self, view: ObjectRef, index: i64, value: Value) -> GcResult<()> {
        self.mutate(|inner| inner.view_aset(view, index, value))
    }

    /// Append one element
    pub fn array_append(&self, view: ObjectRef, value: Value) -> GcResult<()> {
        self.mutate(|inner| inner.view_append(view, value))
    }

    /// Remove and return the last element; `Nil` when empty
    pub fn array_pop(&self, view: ObjectRef) -> GcResult<Value> {
        self.mutate(|inner| inner.view_pop(view))
    }

    /// Remove and return the first element; `Nil` when empty
    pub fn array_shift(&self, view: ObjectRef) -> GcResult<Value> {
        self.mutate(|inner| inner.view_shift(view))
    }

    /// Insert at the front
    pub fn array_unshift(&self, view: ObjectRef, value: Value) -> GcResult<()> {
        self.mutate(|inner| inner.view_unshift(view, value))
    }

    /// Append every element of `other`
    pub fn array_concat(&self, view: ObjectRef, other: ObjectRef) -> GcResult<()> {
        self.mutate(|inner| inner.view_concat(view, other))
    }

    /// True if any element equals `value`
    pub fn array_includes(&self, view: ObjectRef, value: Value) -> GcResult<bool> {
        Ok(self.read().view_values(view)?.contains(&value))
    }

    /// Logical length
    pub fn array_len(&self, view: ObjectRef) -> GcResult<usize> {
        Ok(self.read().view_header(view)?.total())
    }

    /// Capacity of the backing tuple
    pub fn array_capacity(&self, view: ObjectRef) -> GcResult<usize> {
        self.read().view_capacity(view)
    }

    /// Logical elements in order
    pub fn array_to_vec(&self, view: ObjectRef) -> GcResult<Vec<Value>> {
        self.read().view_values(view)
    }

    /// Current `(start, total)` window and backing tuple
    pub fn view_window(&self, view: ObjectRef) -> GcResult<ViewHeader> {
        self.read().view_header(view)
    }

    /// Move the window of a view, reallocating the backing when it is too
    /// small
    pub fn resize_view(&self, view: ObjectRef, new_start: usize, new_total: usize) -> GcResult<()> {
        self.mutate(|inner| inner.resize_view(view, new_start, new_total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixnums(values: &[i64]) -> Vec<Value> {
        values.iter().map(|v| Value::Fixnum(*v)).collect()
    }

    fn assert_window_fits(heap: &Heap, view: ObjectRef) {
        let header = heap.view_window(view).unwrap();
        let capacity = heap.array_capacity(view).unwrap();
        assert!(header.start() + header.total() <= capacity);
    }

    #[test]
    fn test_grown_capacity() {
        assert_eq!(grown_capacity(0, 1), 3);
        assert_eq!(grown_capacity(1, 2), 3);
        assert_eq!(grown_capacity(3, 4), 6);
        assert_eq!(grown_capacity(3, 20), 24);
    }

    #[test]
    fn test_append_past_capacity_reallocates() {
        let heap = Heap::new();
        let view = heap.allocate_array(3).unwrap();
        for v in 1..=3 {
            heap.array_append(view, Value::Fixnum(v)).unwrap();
        }
        let before = heap.view_window(view).unwrap().storage();
        heap.array_append(view, Value::Fixnum(4)).unwrap();
        let after = heap.view_window(view).unwrap().storage();
        assert_ne!(before, after);
        assert!(heap.array_capacity(view).unwrap() >= 6);
        assert_eq!(heap.array_to_vec(view).unwrap(), fixnums(&[1, 2, 3, 4]));
    }

    #[test]
    fn test_shift_empty_is_nil() {
        let heap = Heap::new();
        let view = heap.allocate_array(3).unwrap();
        let before = heap.view_window(view).unwrap();
        assert_eq!(heap.array_shift(view).unwrap(), Value::Nil);
        let after = heap.view_window(view).unwrap();
        assert_eq!((before.start(), before.total()), (after.start(), after.total()));
        assert_eq!(before.storage(), after.storage());
    }

    #[test]
    fn test_shift_pop() {
        let heap = Heap::new();
        let view = heap.allocate_array(4).unwrap();
        for v in 1..=4 {
            heap.array_append(view, Value::Fixnum(v)).unwrap();
        }
        assert_eq!(heap.array_shift(view).unwrap(), Value::Fixnum(1));
        assert_eq!(heap.array_pop(view).unwrap(), Value::Fixnum(4));
        assert_eq!(heap.view_window(view).unwrap().start(), 1);
        assert_eq!(heap.array_to_vec(view).unwrap(), fixnums(&[2, 3]));
    }

    #[test]
    fn test_append_after_shift_reuses_storage() {
        let heap = Heap::new();
        let view = heap.allocate_array(3).unwrap();
        for v in 1..=3 {
            heap.array_append(view, Value::Fixnum(v)).unwrap();
        }
        heap.array_shift(view).unwrap();
        let storage = heap.view_window(view).unwrap().storage();
        heap.array_append(view, Value::Fixnum(4)).unwrap();
        let header = heap.view_window(view).unwrap();
        assert_eq!(header.storage(), storage);
        assert_eq!(header.start(), 0);
        assert_eq!(heap.array_to_vec(view).unwrap(), fixnums(&[2, 3, 4]));
    }

    #[test]
    fn test_unshift_leaves_headroom() {
        let heap = Heap::new();
        let view = heap.allocate_array(3).unwrap();
        for v in 1..=3 {
            heap.array_append(view, Value::Fixnum(v)).unwrap();
        }
        heap.array_unshift(view, Value::Fixnum(0)).unwrap();
        assert!(heap.view_window(view).unwrap().start() > 0);
        let storage = heap.view_window(view).unwrap().storage();
        heap.array_unshift(view, Value::Fixnum(-1)).unwrap();
        assert_eq!(heap.view_window(view).unwrap().storage(), storage);
        assert_eq!(
            heap.array_to_vec(view).unwrap(),
            fixnums(&[-1, 0, 1, 2, 3])
        );
        assert_window_fits(&heap, view);
    }

    #[test]
    fn test_unshift_in_place_clears_vacated_slots() {
        let heap = Heap::new();
        let view = heap.allocate_array(6).unwrap();
        heap.array_append(view, Value::Fixnum(1)).unwrap();
        heap.array_append(view, Value::Fixnum(2)).unwrap();
        heap.array_unshift(view, Value::Fixnum(0)).unwrap();
        let header = heap.view_window(view).unwrap();
        let storage = header.storage();
        for i in 0..header.start() {
            assert_eq!(heap.tuple_at(storage, i).unwrap(), Some(Value::Nil));
        }
        assert_eq!(heap.array_to_vec(view).unwrap(), fixnums(&[0, 1, 2]));
    }

    #[test]
    fn test_aref_negative_and_out_of_range() {
        let heap = Heap::new();
        let view = heap.allocate_array(3).unwrap();
        for v in [10, 20, 30] {
            heap.array_append(view, Value::Fixnum(v)).unwrap();
        }
        assert_eq!(heap.array_aref(view, -1).unwrap(), Value::Fixnum(30));
        assert_eq!(heap.array_aref(view, -3).unwrap(), Value::Fixnum(10));
        assert_eq!(heap.array_aref(view, -4).unwrap(), Value::Nil);
        assert_eq!(heap.array_aref(view, 3).unwrap(), Value::Nil);
        assert_eq!(heap.array_get(view, 1).unwrap(), Value::Fixnum(20));
    }

    #[test]
    fn test_aset_grows_and_pads() {
        let heap = Heap::new();
        let view = heap.allocate_array(3).unwrap();
        heap.array_aset(view, 5, Value::Fixnum(7)).unwrap();
        assert_eq!(heap.array_len(view).unwrap(), 6);
        assert_eq!(
            heap.array_to_vec(view).unwrap(),
            vec![Value::Nil, Value::Nil, Value::Nil, Value::Nil, Value::Nil, Value::Fixnum(7)]
        );
        heap.array_aset(view, -1, Value::Fixnum(8)).unwrap();
        assert_eq!(heap.array_aref(view, 5).unwrap(), Value::Fixnum(8));
        assert_eq!(
            heap.array_aset(view, -7, Value::Nil),
            Err(GcError::BoundsViolation { index: -7, len: 6 })
        );
    }

    #[test]
    fn test_concat_self() {
        let heap = Heap::new();
        let view = heap.allocate_array(2).unwrap();
        heap.array_append(view, Value::Fixnum(1)).unwrap();
        heap.array_append(view, Value::Fixnum(2)).unwrap();
        heap.array_concat(view, view).unwrap();
        assert_eq!(heap.array_to_vec(view).unwrap(), fixnums(&[1, 2, 1, 2]));
        assert_window_fits(&heap, view);
    }

    #[test]
    fn test_includes_and_dup() {
        let heap = Heap::new();
        let view = heap.allocate_array(3).unwrap();
        heap.array_append(view, Value::Bool(true)).unwrap();
        let copy = heap.array_dup(view).unwrap();
        heap.array_append(view, Value::Fixnum(1)).unwrap();
        assert!(heap.array_includes(view, Value::Fixnum(1)).unwrap());
        assert!(!heap.array_includes(copy, Value::Fixnum(1)).unwrap());
        assert_eq!(heap.array_to_vec(copy).unwrap(), vec![Value::Bool(true)]);
    }

    #[test]
    fn test_new_range_pads_with_nil() {
        let heap = Heap::new();
        let view = heap.allocate_array(3).unwrap();
        for v in 1..=3 {
            heap.array_append(view, Value::Fixnum(v)).unwrap();
        }
        let range = heap.array_new_range(view, 1, 4).unwrap();
        assert_eq!(
            heap.array_to_vec(range).unwrap(),
            vec![Value::Fixnum(2), Value::Fixnum(3), Value::Nil, Value::Nil]
        );
    }

    #[test]
    fn test_new_range_before_start() {
        let heap = Heap::new();
        let view = heap.allocate_array(3).unwrap();
        for v in 1..=3 {
            heap.array_append(view, Value::Fixnum(v)).unwrap();
        }
        let range = heap.array_new_range(view, -5, 4).unwrap();
        assert_eq!(
            heap.array_to_vec(range).unwrap(),
            vec![Value::Nil, Value::Nil, Value::Fixnum(1), Value::Fixnum(2)]
        );
    }

    #[test]
    fn test_new_range_huge_count_is_out_of_memory() {
        let heap = Heap::new();
        let view = heap.allocate_array(3).unwrap();
        heap.array_append(view, Value::Fixnum(1)).unwrap();
        let objects = heap.object_count();
        let err = heap.array_new_range(view, 0, usize::MAX).unwrap_err();
        assert!(err.is_out_of_memory());
        let err = heap.array_new_range(view, i64::MIN, usize::MAX / 2).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(heap.object_count(), objects);
    }

    #[test]
    fn test_set_at_max_index_leaves_view_intact() {
        let heap = Heap::new();
        let view = heap.allocate_array(3).unwrap();
        heap.array_append(view, Value::Fixnum(1)).unwrap();
        heap.array_append(view, Value::Fixnum(2)).unwrap();
        heap.array_shift(view).unwrap();
        heap.array_append(view, Value::Fixnum(3)).unwrap();
        let before = heap.view_window(view).unwrap();
        assert_eq!((before.start(), before.total()), (1, 2));

        assert_eq!(
            heap.array_set(view, usize::MAX, Value::Nil),
            Err(GcError::BoundsViolation {
                index: i64::MAX,
                len: 2
            })
        );
        let after = heap.view_window(view).unwrap();
        assert_eq!(
            (after.start(), after.total(), after.storage()),
            (1, 2, before.storage())
        );
        assert_eq!(heap.array_to_vec(view).unwrap(), fixnums(&[2, 3]));
    }

    #[test]
    fn test_from_tuple() {
        let heap = Heap::new();
        let tuple = heap.allocate_fields(2).unwrap();
        heap.tuple_put(tuple, 1, Value::Fixnum(5)).unwrap();
        let view = heap.array_from_tuple(tuple).unwrap();
        assert_eq!(heap.array_to_vec(view).unwrap(), vec![Value::Nil, Value::Fixnum(5)]);
        assert_ne!(heap.view_window(view).unwrap().storage(), tuple);
    }

    #[test]
    fn test_resize_view_in_place() {
        let heap = Heap::new();
        let view = heap.allocate_array(6).unwrap();
        for v in 1..=4 {
            heap.array_append(view, Value::Fixnum(v)).unwrap();
        }
        heap.resize_view(view, 1, 2).unwrap();
        assert_eq!(heap.array_to_vec(view).unwrap(), fixnums(&[2, 3]));
        let storage = heap.view_window(view).unwrap().storage();
        assert_eq!(heap.tuple_at(storage, 0).unwrap(), Some(Value::Nil));
        assert_eq!(heap.tuple_at(storage, 3).unwrap(), Some(Value::Nil));
        heap.resize_view(view, 1, 4).unwrap();
        assert_eq!(
            heap.array_to_vec(view).unwrap(),
            vec![Value::Fixnum(2), Value::Fixnum(3), Value::Nil, Value::Nil]
        );
    }

    #[test]
    fn test_resize_view_reallocates() {
        let heap = Heap::new();
        let view = heap.allocate_array(3).unwrap();
        for v in 1..=3 {
            heap.array_append(view, Value::Fixnum(v)).unwrap();
        }
        heap.resize_view(view, 2, 5).unwrap();
        let header = heap.view_window(view).unwrap();
        assert_eq!((header.start(), header.total()), (2, 5));
        assert!(heap.array_capacity(view).unwrap() >= 7);
        assert_eq!(
            heap.array_to_vec(view).unwrap(),
            vec![Value::Fixnum(3), Value::Nil, Value::Nil, Value::Nil, Value::Nil]
        );
    }

    #[test]
    fn test_frozen_view_rejects_mutation() {
        let heap = Heap::new();
        let view = heap.allocate_array(3).unwrap();
        heap.freeze(view).unwrap();
        assert_eq!(
            heap.array_append(view, Value::Nil),
            Err(GcError::FrozenViolation(view))
        );
        assert_eq!(heap.array_shift(view), Err(GcError::FrozenViolation(view)));
        assert_eq!(
            heap.resize_view(view, 0, 1),
            Err(GcError::FrozenViolation(view))
        );
        assert_eq!(heap.array_aref(view, 0).unwrap(), Value::Nil);
    }

    #[test]
    fn test_failed_growth_leaves_view_intact() {
        let heap = Heap::with_config(crate::heap::GcConfig {
            max_heap_bytes: 140,
            ..Default::default()
        });
        // array header 40 + tuple(3) 40 = 80 bytes; growing needs tuple(6) = 64
        let view = heap.allocate_array(3).unwrap();
        for v in 1..=3 {
            heap.array_append(view, Value::Fixnum(v)).unwrap();
        }
        let err = heap.array_append(view, Value::Fixnum(4)).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(heap.array_to_vec(view).unwrap(), fixnums(&[1, 2, 3]));
    }
}
