//! Weak, soft, finalizer and phantom references
//!
//! A reference wrapper is a static object whose class carries a
//! [`ReferenceKind`]; its referent lives at [`REFERENT_OFFSET`]. When the
//! marker meets a wrapper whose referent is not yet marked and lies in the
//! range being collected, the wrapper is *discovered* instead of traced:
//! its other fields are marked, the referent is not. After marking,
//! [`ReferenceProcessor::process_references`] decides per wrapper whether
//! to clear the referent or keep it alive.

use parking_lot::Mutex;
use std::sync::atomic::Ordering;

use crate::class::{ClassDescriptor, ReferenceKind};
use crate::context::GcContext;
use crate::heap::HeapMemory;
use crate::layout;
use crate::marker::ObjectPredicate;
use crate::marking_stack::MarkingStack;
use crate::object::{LENGTH_OFFSET, ObjectRef};
use crate::roots::{GcRoot, RootType};

/// Word offset of the referent in reference wrappers
pub const REFERENT_OFFSET: usize = LENGTH_OFFSET;

/// Outcome of one processing pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessedReferences {
    /// Wrappers whose referent was cleared
    pub cleared: usize,
    /// Wrappers whose referent was kept alive
    pub retained: usize,
}

/// Discovered and pending reference wrappers
pub struct ReferenceProcessor {
    discovered: Mutex<Vec<ObjectRef>>,
    pending: Mutex<Vec<ObjectRef>>,
}

impl ReferenceProcessor {
    /// Create an empty processor
    pub fn new() -> Self {
        Self {
            discovered: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Check if `obj` should be treated as a reference in this cycle
    pub fn is_reference(
        &self,
        cx: &GcContext,
        class: &ClassDescriptor,
        obj: ObjectRef,
        ref_pred: ObjectPredicate<'_>,
    ) -> bool {
        if class.reference_kind().is_none() {
            return false;
        }
        let memory = cx.memory();
        match memory.read_ref(obj, REFERENT_OFFSET) {
            Some(referent) => ref_pred(referent) && !cx.marker().is_marked(memory, referent),
            None => false,
        }
    }

    /// Mark the wrapper's fields except the referent and remember it
    pub fn handle_reference(
        &self,
        cx: &GcContext,
        stack: &mut MarkingStack,
        obj: ObjectRef,
        class: &ClassDescriptor,
        filter: ObjectPredicate<'_>,
    ) {
        let memory = cx.memory();
        let marker = cx.marker();
        layout::for_each_ref_slot(memory, cx.classes(), obj, class, &mut |slot| {
            if slot.offset != REFERENT_OFFSET
                && filter(slot.target)
                && marker.mark_if_not_marked(memory, slot.target)
            {
                stack.push_from_object(obj, slot.target);
            }
        });
        self.discovered.lock().push(obj);
    }

    /// Number of wrappers discovered and not yet processed
    pub fn discovered_count(&self) -> usize {
        self.discovered.lock().len()
    }

    /// Decide the fate of every discovered wrapper.
    ///
    /// Soft referents survive unless `clear_soft`; finalizer referents are
    /// kept alive for one more cycle. Kept referents are traced, which may
    /// discover more wrappers, so this loops until nothing new shows up.
    pub fn process_references(
        &self,
        cx: &GcContext,
        stack: &mut MarkingStack,
        clear_soft: bool,
        ref_pred: ObjectPredicate<'_>,
        filter: ObjectPredicate<'_>,
    ) -> ProcessedReferences {
        let memory = cx.memory();
        let marker = cx.marker();
        let mut result = ProcessedReferences::default();
        loop {
            let discovered = std::mem::take(&mut *self.discovered.lock());
            if discovered.is_empty() {
                break;
            }
            for wrapper in discovered {
                let Some(referent) = memory.read_ref(wrapper, REFERENT_OFFSET) else {
                    continue;
                };
                if marker.is_marked(memory, referent) {
                    continue;
                }
                let kind = cx.class_of(wrapper).reference_kind();
                let keep = match kind {
                    Some(ReferenceKind::Soft) => !clear_soft,
                    Some(ReferenceKind::Finalizer) => true,
                    _ => false,
                };
                if keep {
                    result.retained += 1;
                    if marker.mark_if_not_marked(memory, referent) {
                        stack.push_from_object(wrapper, referent);
                    }
                } else {
                    result.cleared += 1;
                    memory.store(wrapper.field_addr(REFERENT_OFFSET), 0, Ordering::Release);
                }
                if kind != Some(ReferenceKind::Soft) || !keep {
                    self.pending.lock().push(wrapper);
                }
            }
            marker.mark_stack(cx, stack, ref_pred, filter);
        }
        result
    }

    /// Take wrappers waiting to be enqueued by the runtime
    pub fn take_pending(&self) -> Vec<ObjectRef> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Report pending wrappers as roots
    pub fn visit_pending(&self, visitor: &mut dyn FnMut(GcRoot)) {
        let pending = self.pending.lock().clone();
        for object in pending {
            visitor(GcRoot {
                root_type: RootType::PendingReference,
                object,
            });
        }
    }

    /// Rewrite pending wrappers that were moved
    pub fn update_refs_to_moved(&self, memory: &HeapMemory) {
        for obj in self.pending.lock().iter_mut() {
            if let Some(new) = memory.forwardee(*obj) {
                *obj = new;
            }
        }
    }

    /// Drop discovered wrappers without processing them
    pub fn reset(&self) {
        self.discovered.lock().clear();
    }
}

impl Default for ReferenceProcessor {
    fn default() -> Self {
        Self::new()
    }
}
