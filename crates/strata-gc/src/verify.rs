//! Heap verification
//!
//! [`verify_heap`] walks everything reachable from the roots and counts
//! references that do not lead to a registered object of a known class.
//! [`IntoGcVerifier`] checks the update-after-move pass: it records every
//! edge from a non-young object into a live young object before the move
//! and, afterwards, that each such slot points at the forwardee.

use rustc_hash::FxHashSet;

use crate::context::GcContext;
use crate::layout;
use crate::object::ObjectRef;
use crate::roots::VisitRootFlags;

/// Count broken references reachable from the roots
pub fn verify_heap(cx: &GcContext) -> usize {
    let heap = cx.heap();
    let memory = cx.memory();
    let mut failures = 0;
    let mut unknown_classes = 0;
    let mut visited = FxHashSet::default();
    let mut worklist = Vec::new();

    let mut check = |from: Option<ObjectRef>, obj: ObjectRef, worklist: &mut Vec<ObjectRef>| {
        if !heap.contains_object(obj.addr()) {
            tracing::error!(target: "strata::gc", ?from, ?obj, "reference to a non-object");
            failures += 1;
            return;
        }
        if memory.forwardee(obj).is_some() {
            tracing::error!(target: "strata::gc", ?from, ?obj, "reference to a forwarded object");
            failures += 1;
            return;
        }
        if visited.insert(obj.addr()) {
            worklist.push(obj);
        }
    };

    cx.visit_roots(
        &mut |root| check(None, root.object, &mut worklist),
        VisitRootFlags::ACCESS_ALL,
    );
    cx.roots().visit_string_table(
        &mut |root| check(None, root.object, &mut worklist),
        VisitRootFlags::ACCESS_ALL,
    );

    while let Some(obj) = worklist.pop() {
        let class_id = memory.class_id(obj);
        let Ok(class) = cx.classes().get(class_id) else {
            tracing::error!(target: "strata::gc", ?obj, ?class_id, "object with unknown class");
            unknown_classes += 1;
            continue;
        };
        let mut children = Vec::new();
        layout::for_each_ref_slot(memory, cx.classes(), obj, &class, &mut |slot| {
            children.push(slot.target)
        });
        for child in children {
            check(Some(obj), child, &mut worklist);
        }
    }
    failures + unknown_classes
}

struct RecordedEdge {
    holder: ObjectRef,
    offset: usize,
    target: ObjectRef,
}

/// Snapshot of old-to-young edges taken before young objects move
pub struct IntoGcVerifier {
    edges: Vec<RecordedEdge>,
}

impl IntoGcVerifier {
    /// Record every slot of a non-young object that points at a marked
    /// young object
    pub fn collect(cx: &GcContext) -> Self {
        let heap = cx.heap();
        let memory = cx.memory();
        let marker = cx.marker();
        let young = memory.young_range();
        let mut edges = Vec::new();

        let mut record = |holder: ObjectRef| {
            let class = cx.class_of(holder);
            layout::for_each_ref_slot(memory, cx.classes(), holder, &class, &mut |slot| {
                if young.contains_address(slot.target.addr())
                    && marker.is_marked(memory, slot.target)
                {
                    edges.push(RecordedEdge {
                        holder,
                        offset: slot.offset,
                        target: slot.target,
                    });
                }
            });
        };
        heap.iterate_over_tenured_objects(&mut record);
        heap.iterate_over_template_objects(&mut record);
        Self { edges }
    }

    /// Number of recorded edges
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Check if nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Count recorded slots that do not point at their target's forwardee.
    /// Must run before the young space is reset.
    pub fn verify(&self, cx: &GcContext) -> usize {
        let memory = cx.memory();
        let mut failures = 0;
        for edge in &self.edges {
            let Some(expected) = memory.forwardee(edge.target) else {
                tracing::error!(
                    target: "strata::gc",
                    young = ?edge.target,
                    "live young object was not moved"
                );
                failures += 1;
                continue;
            };
            let class = cx.class_of(edge.holder);
            let mut current = None;
            layout::for_each_ref_slot(memory, cx.classes(), edge.holder, &class, &mut |slot| {
                if slot.offset == edge.offset {
                    current = Some(slot.target);
                }
            });
            if current != Some(expected) {
                tracing::error!(
                    target: "strata::gc",
                    holder = ?edge.holder,
                    offset = edge.offset,
                    ?current,
                    ?expected,
                    "stale reference after move"
                );
                failures += 1;
            }
        }
        failures
    }
}
