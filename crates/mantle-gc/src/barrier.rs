//! Write barrier for concurrent/incremental marking
//!
//! Every store of a value into a reference slot goes through
//! [`WriteLog::record_write`]. The barrier hands back a [`BarrierTicket`], and
//! slots ([`Fields::put`](crate::object::Fields)) and view storage can only be
//! written by consuming one. There is no other way to write a slot, so a store
//! cannot skip the barrier.
//!
//! Policy (insertion barrier): while the collector is scanning roots or
//! marking, storing a white referent into a holder that is already marked
//! appends the pair to the log. The collector drains the log to a fixed
//! point before it declares marking complete.

use crate::collector::GcPhase;
use crate::object::{MarkColor, ObjectRef, Value};

/// Proof that a store went through the barrier
///
/// Carries the value that was approved. Not `Clone`: one ticket, one store.
#[derive(Debug)]
#[must_use = "a barrier ticket must be consumed by the store it approved"]
pub struct BarrierTicket {
    value: Value,
}

impl BarrierTicket {
    /// Value approved for the store
    pub(crate) fn into_value(self) -> Value {
        self.value
    }
}

/// A recorded store of an unmarked referent into a marked holder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierRecord {
    /// Object whose slot was written
    pub holder: ObjectRef,
    /// Referent that was stored
    pub value: ObjectRef,
}

/// Per-cycle log of barrier records
#[derive(Debug, Default)]
pub struct WriteLog {
    entries: Vec<BarrierRecord>,
    /// Records appended since the log was created
    recorded_total: u64,
}

impl WriteLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the barrier for a store of `value` into `holder`
    ///
    /// `holder_color` and `value_color` are the current mark colors; the
    /// value color is `None` for immediates.
    #[inline]
    pub fn record_write(
        &mut self,
        phase: GcPhase,
        holder: ObjectRef,
        holder_color: MarkColor,
        value: Value,
        value_color: Option<MarkColor>,
    ) -> BarrierTicket {
        if phase.barrier_active()
            && holder_color != MarkColor::White
            && value_color == Some(MarkColor::White)
        {
            if let Value::Ref(referent) = value {
                self.entries.push(BarrierRecord {
                    holder,
                    value: referent,
                });
                self.recorded_total += 1;
            }
        }
        BarrierTicket { value }
    }

    /// Take all pending records
    pub fn drain(&mut self) -> Vec<BarrierRecord> {
        std::mem::take(&mut self.entries)
    }

    /// Drop pending records (start of a cycle)
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Check if log is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pending records
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Records appended over the life of the log
    pub fn recorded_total(&self) -> u64 {
        self.recorded_total
    }
}
