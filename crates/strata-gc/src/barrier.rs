//! Write barriers
//!
//! - Post-barrier: card marking. Any store of a heap reference into an
//!   object outside the young space dirties that object's card.
//! - Pre-barrier (SATB, Yuasa-style): while concurrent marking runs, the
//!   overwritten reference is recorded so marking still reaches everything
//!   that was live when it started.
//! - Insertion (Dijkstra-style): while concurrent marking runs, the stored
//!   reference is recorded too, covering objects the mutator moved from a
//!   root into an already-scanned object.
//!
//! Recorded references are drained by remark.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::card_table::CardTable;
use crate::mem_range::MemRange;
use crate::object::ObjectRef;

/// References recorded by the barriers during concurrent marking
pub struct WriteBarrierBuffer {
    entries: Mutex<Vec<ObjectRef>>,
}

impl WriteBarrierBuffer {
    /// Create a new buffer with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new buffer with specific capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Record a reference
    pub fn push(&self, obj: ObjectRef) {
        self.entries.lock().push(obj);
    }

    /// Take all entries from the buffer
    pub fn drain(&self) -> Vec<ObjectRef> {
        std::mem::take(&mut *self.entries.lock())
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Get number of entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for WriteBarrierBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Barrier state shared by all mutators
pub struct BarrierSet {
    young: MemRange,
    card_table: CardTable,
    concurrent_marking: AtomicBool,
    buffer: WriteBarrierBuffer,
}

impl BarrierSet {
    /// Barriers for a heap spanning `heap`, with `young` as the nursery
    pub fn new(heap: MemRange, young: MemRange) -> Self {
        Self {
            young,
            card_table: CardTable::new(heap),
            concurrent_marking: AtomicBool::new(false),
            buffer: WriteBarrierBuffer::new(),
        }
    }

    /// Card table
    pub fn card_table(&self) -> &CardTable {
        &self.card_table
    }

    /// References recorded during concurrent marking
    pub fn buffer(&self) -> &WriteBarrierBuffer {
        &self.buffer
    }

    /// Check if concurrent marking barriers are active
    pub fn is_concurrent_marking(&self) -> bool {
        self.concurrent_marking.load(Ordering::Acquire)
    }

    /// Switch concurrent marking barriers on or off
    pub fn set_concurrent_marking(&self, active: bool) {
        self.concurrent_marking.store(active, Ordering::Release);
    }

    /// Barrier before overwriting a reference slot that holds `old`
    #[inline]
    pub fn pre_barrier(&self, old: Option<ObjectRef>) {
        if let Some(old) = old {
            if self.is_concurrent_marking() {
                self.buffer.push(old);
            }
        }
    }

    /// Barrier after storing `new` into a slot of `obj`
    #[inline]
    pub fn post_barrier(&self, obj: ObjectRef, new: Option<ObjectRef>) {
        let Some(new) = new else {
            return;
        };
        if !self.young.contains_address(obj.addr()) {
            self.card_table.mark_card(obj.addr());
        }
        if self.is_concurrent_marking() {
            self.buffer.push(new);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card_table::CARD_SIZE;

    const BASE: usize = 0x1_0000;

    fn barriers() -> BarrierSet {
        let heap = MemRange::with_size(BASE, 64 * CARD_SIZE);
        let young = MemRange::with_size(BASE, 16 * CARD_SIZE);
        BarrierSet::new(heap, young)
    }

    fn obj(addr: usize) -> ObjectRef {
        ObjectRef::from_address(addr).unwrap()
    }

    #[test]
    fn test_post_barrier_marks_old_cards_only() {
        let b = barriers();
        let young_obj = obj(BASE + 64);
        let old_obj = obj(BASE + 20 * CARD_SIZE);

        b.post_barrier(young_obj, Some(old_obj));
        assert_eq!(b.card_table().dirty_count(), 0);

        b.post_barrier(old_obj, Some(young_obj));
        assert!(b.card_table().is_dirty(old_obj.addr()));

        b.post_barrier(obj(BASE + 30 * CARD_SIZE), None);
        assert_eq!(b.card_table().dirty_count(), 1);
    }

    #[test]
    fn test_marking_barriers_record_only_while_marking() {
        let b = barriers();
        let holder = obj(BASE + 20 * CARD_SIZE);
        let old = obj(BASE + 21 * CARD_SIZE);
        let new = obj(BASE + 64);

        b.pre_barrier(Some(old));
        b.post_barrier(holder, Some(new));
        assert!(b.buffer().is_empty());

        b.set_concurrent_marking(true);
        b.pre_barrier(Some(old));
        b.post_barrier(holder, Some(new));
        b.pre_barrier(None);
        assert_eq!(b.buffer().drain(), vec![old, new]);
        assert!(b.buffer().is_empty());
    }
}
