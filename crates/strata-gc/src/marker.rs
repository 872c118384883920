//! Tracing marker
//!
//! ## Design
//!
//! - **Substrate**: young objects carry their mark in the header mark bit;
//!   tenured and template objects use their region's [`MarkBitmap`].
//! - **Atomic vs plain**: while several threads may mark (parallel or
//!   concurrent marking, black allocation) the marker uses atomic
//!   test-and-set; otherwise a plain load/store pair.
//! - **Mark sense**: with the reversed sense enabled a set bit means
//!   *unmarked*, which lets a stop-the-world cycle skip clearing bitmaps.
//! - **Invariant**: an object is marked before it is pushed, so each
//!   object enters the worklist at most once per cycle.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::bitmap::MarkBitmap;
use crate::class::ClassDescriptor;
use crate::context::GcContext;
use crate::heap::{HeapMemory, ObjectAllocator, SpaceKind};
use crate::layout;
use crate::marking_stack::MarkingStack;
use crate::object::{MarkWord, ObjectRef, ObjectStatus};

/// Object predicate shared with marking workers
pub type ObjectPredicate<'a> = &'a (dyn Fn(ObjectRef) -> bool + Sync);

/// Predicate accepting every object
pub fn any_object(_: ObjectRef) -> bool {
    true
}

/// Mark state of the heap
pub struct Marker {
    tenured: MarkBitmap,
    template: MarkBitmap,
    atomic: AtomicBool,
    reversed: AtomicBool,
}

impl Marker {
    /// Create a marker with bitmaps for the tenured and template spaces
    pub fn new(memory: &HeapMemory) -> Self {
        Self {
            tenured: MarkBitmap::new(memory.tenured_range()),
            template: MarkBitmap::new(memory.template_range()),
            atomic: AtomicBool::new(false),
            reversed: AtomicBool::new(false),
        }
    }

    /// Switch between atomic and plain mark updates
    pub fn set_atomic(&self, atomic: bool) {
        self.atomic.store(atomic, Ordering::Release);
    }

    /// Check if mark updates are atomic
    pub fn is_atomic(&self) -> bool {
        self.atomic.load(Ordering::Acquire)
    }

    /// Check if a set bit currently means unmarked
    pub fn is_reversed(&self) -> bool {
        self.reversed.load(Ordering::Acquire)
    }

    /// Swap the meaning of set and clear mark bits
    pub fn flip_mark_sense(&self) {
        self.reversed.fetch_xor(true, Ordering::AcqRel);
    }

    fn bitmap_for(&self, memory: &HeapMemory, obj: ObjectRef) -> Option<&MarkBitmap> {
        match memory.space_kind(obj.addr()) {
            Some(SpaceKind::Young) => None,
            Some(SpaceKind::Tenured) => Some(&self.tenured),
            Some(SpaceKind::Template) => Some(&self.template),
            None => crate::fatal!("marking {:?} outside the heap", obj),
        }
    }

    /// Mark `obj`; true only if it was unmarked before
    #[inline]
    pub fn mark_if_not_marked(&self, memory: &HeapMemory, obj: ObjectRef) -> bool {
        let reversed = self.is_reversed();
        let atomic = self.is_atomic();
        match self.bitmap_for(memory, obj) {
            Some(bitmap) => match (atomic, reversed) {
                (true, false) => bitmap.atomic_test_and_set(obj.addr()),
                (true, true) => bitmap.atomic_test_and_clear(obj.addr()),
                (false, false) => bitmap.test_and_set(obj.addr()),
                (false, true) => bitmap.test_and_clear(obj.addr()),
            },
            None => {
                let addr = obj.field_addr(0);
                if atomic {
                    let old = if reversed {
                        memory.fetch_and(addr, !MarkWord::MARK_BIT)
                    } else {
                        memory.fetch_or(addr, MarkWord::MARK_BIT)
                    };
                    MarkWord::from_raw(old).mark_bit() == reversed
                } else {
                    let mw = memory.mark_word(obj);
                    if mw.mark_bit() != reversed {
                        return false;
                    }
                    memory.set_mark_word(obj, mw.with_mark_bit(!reversed));
                    true
                }
            }
        }
    }

    /// Mark `obj` unconditionally
    pub fn mark(&self, memory: &HeapMemory, obj: ObjectRef) {
        self.set_bit(memory, obj, !self.is_reversed());
    }

    /// Unmark `obj` unconditionally
    pub fn unmark(&self, memory: &HeapMemory, obj: ObjectRef) {
        self.set_bit(memory, obj, self.is_reversed());
    }

    fn set_bit(&self, memory: &HeapMemory, obj: ObjectRef, bit: bool) {
        match self.bitmap_for(memory, obj) {
            Some(bitmap) if bit => bitmap.set(obj.addr()),
            Some(bitmap) => bitmap.clear(obj.addr()),
            None if bit => {
                memory.fetch_or(obj.field_addr(0), MarkWord::MARK_BIT);
            }
            None => {
                memory.fetch_and(obj.field_addr(0), !MarkWord::MARK_BIT);
            }
        }
    }

    /// Check if `obj` is marked
    #[inline]
    pub fn is_marked(&self, memory: &HeapMemory, obj: ObjectRef) -> bool {
        let bit = match self.bitmap_for(memory, obj) {
            Some(bitmap) => bitmap.test(obj.addr()),
            None => memory.mark_word(obj).mark_bit(),
        };
        bit != self.is_reversed()
    }

    /// Sweep verdict for `obj`
    pub fn mark_checker(&self, memory: &HeapMemory, obj: ObjectRef) -> ObjectStatus {
        if self.is_marked(memory, obj) {
            ObjectStatus::Alive
        } else {
            ObjectStatus::Dead
        }
    }

    /// Clear tenured and template marks. Only valid with the normal sense.
    pub fn clear_bitmaps(&self) {
        debug_assert!(!self.is_reversed());
        self.tenured.clear_all();
        self.template.clear_all();
    }

    /// Clear the header mark bit of every young object
    pub fn unmark_young(&self, heap: &dyn ObjectAllocator) {
        let memory = heap.memory();
        heap.iterate_over_young_objects(&mut |obj| {
            memory.fetch_and(obj.field_addr(0), !MarkWord::MARK_BIT);
        });
    }

    /// Unmark every template object in the current sense
    pub fn unmark_template(&self, heap: &dyn ObjectAllocator) {
        heap.iterate_over_template_objects(&mut |obj| self.unmark(heap.memory(), obj));
    }

    /// Number of marked tenured and template objects (normal sense)
    pub fn marked_count(&self) -> usize {
        self.tenured.count() + self.template.count()
    }

    /// Scan `obj` and push every newly marked child passing `filter`.
    ///
    /// Reference wrappers whose referent satisfies `ref_pred` go to the
    /// reference processor instead of being traced through.
    pub fn visit(
        &self,
        cx: &GcContext,
        stack: &mut MarkingStack,
        obj: ObjectRef,
        class: &ClassDescriptor,
        ref_pred: ObjectPredicate<'_>,
        filter: ObjectPredicate<'_>,
    ) {
        let references = cx.references();
        if references.is_reference(cx, class, obj, ref_pred) {
            references.handle_reference(cx, stack, obj, class, filter);
            return;
        }
        let memory = cx.memory();
        layout::for_each_ref_slot(memory, cx.classes(), obj, class, &mut |slot| {
            if filter(slot.target) && self.mark_if_not_marked(memory, slot.target) {
                stack.push_from_object(obj, slot.target);
            }
        });
    }

    /// Drain `stack` on the calling thread
    pub fn mark_stack(
        &self,
        cx: &GcContext,
        stack: &mut MarkingStack,
        ref_pred: ObjectPredicate<'_>,
        filter: ObjectPredicate<'_>,
    ) -> usize {
        let mut scanned = 0;
        while let Some(entry) = stack.pop() {
            let class = cx.class_of(entry.object);
            self.visit(cx, stack, entry.object, &class, ref_pred, filter);
            scanned += 1;
        }
        scanned
    }

    /// Mark every unmarked child of an already marked object. Used when
    /// rescanning objects found on dirty cards.
    pub fn rescan_object(
        &self,
        cx: &GcContext,
        stack: &mut MarkingStack,
        obj: ObjectRef,
        filter: ObjectPredicate<'_>,
    ) {
        let memory = cx.memory();
        let class = cx.class_of(obj);
        layout::for_each_ref_slot(memory, cx.classes(), obj, &class, &mut |slot| {
            if filter(slot.target) && self.mark_if_not_marked(memory, slot.target) {
                stack.push_from_object(obj, slot.target);
            }
        });
    }
}
