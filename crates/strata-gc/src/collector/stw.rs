//! Stop-the-world mark-sweep

use crate::collector::{Collector, GcPhase, mark_roots, release_free_pools};
use crate::context::GcContext;
use crate::marker::any_object;
use crate::roots::VisitRootFlags;
use crate::settings::GcType;
use crate::task::{CollectionType, GcTask, GcTaskCause};

/// Whole-heap mark-sweep with mutators stopped for the entire cycle.
///
/// The string table is treated as weak: it is swept after marking, never
/// marked through. Template objects are marked but never swept.
pub struct StwGc;

impl StwGc {
    /// Create the collector
    pub fn new() -> Self {
        Self
    }

    fn mark(&self, cx: &GcContext, task: &GcTask) {
        let _phase = cx.phase_scope(GcPhase::Mark);
        let marker = cx.marker();
        marker.set_atomic(cx.settings().parallel_marking);

        let mut stack = cx.new_marking_stack();
        mark_roots(cx, &mut stack, VisitRootFlags::ACCESS_ALL, &any_object);
        let marked = cx.drain_marking_stack(&mut stack, &any_object, &any_object);

        let clear_soft = matches!(task.cause, GcTaskCause::Oom | GcTaskCause::Explicit);
        let refs = cx.references().process_references(
            cx,
            &mut stack,
            clear_soft,
            &any_object,
            &any_object,
        );
        marker.set_atomic(false);

        let mut stats = cx.stats_mut();
        stats.last_marked = marked;
        stats.last_references_cleared = refs.cleared;
    }

    fn sweep(&self, cx: &GcContext) {
        let memory = cx.memory();
        let marker = cx.marker();
        {
            let _phase = cx.phase_scope(GcPhase::SweepStringTable);
            let removed = cx
                .roots()
                .sweep_string_table(&mut |s| marker.mark_checker(memory, s));
            tracing::debug!(target: "strata::gc", removed, "swept string table");
        }

        let _phase = cx.phase_scope(GcPhase::Sweep);
        let freed = cx.heap().collect(&mut |obj| marker.mark_checker(memory, obj));
        release_free_pools(cx);

        let mut stats = cx.stats_mut();
        stats.last_freed_objects = freed.objects;
        stats.last_freed_bytes = freed.bytes;
    }

    fn reset_marks(&self, cx: &GcContext) {
        let marker = cx.marker();
        if cx.settings().reversed_mark_sense {
            // survivors now read as unmarked; template objects were never
            // swept and need their bits normalised explicitly
            marker.flip_mark_sense();
            marker.unmark_template(cx.heap());
        } else {
            marker.clear_bitmaps();
        }
    }
}

impl Default for StwGc {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for StwGc {
    fn gc_type(&self) -> GcType {
        GcType::Stw
    }

    fn run_phases_impl(&self, cx: &GcContext, task: &mut GcTask) {
        task.collection_type = CollectionType::Full;
        self.mark(cx, task);
        self.sweep(cx);
        self.reset_marks(cx);
    }
}
