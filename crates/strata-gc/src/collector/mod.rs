//! Collector strategies
//!
//! Every strategy implements [`Collector`]; the shared cycle driver in
//! [`GcContext::wait_for_gc`] handles de-duplication, the stop-the-world
//! pause, listeners, verification and statistics, then calls
//! [`Collector::run_phases_impl`].

mod epsilon;
mod generational;
mod stw;

pub use epsilon::EpsilonGc;
pub use generational::GenGc;
pub use stw::StwGc;

use crate::context::GcContext;
use crate::fatal;
use crate::marker::ObjectPredicate;
use crate::marking_stack::MarkingStack;
use crate::object::{HEADER_WORDS, ObjectRef, TaggedValue};
use crate::roots::VisitRootFlags;
use crate::settings::{GcSettings, GcType};
use crate::task::GcTask;

/// GC phase
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// No GC in progress
    Idle = 0,
    /// A cycle owns the collector but no phase is active
    Running = 1,
    /// Marking young objects from roots and cards
    MarkYoung = 2,
    /// Marking roots with mutators stopped
    InitialMark = 3,
    /// Whole-heap marking with mutators stopped
    Mark = 4,
    /// Marking with mutators running
    ConcurrentMark = 5,
    /// Finishing marking with mutators stopped
    Remark = 6,
    /// Copying live young objects to tenured
    CollectYoungAndMove = 7,
    /// Dropping dead interned strings
    SweepStringTable = 8,
    /// Releasing dead tenured objects
    Sweep = 9,
}

impl From<u8> for GcPhase {
    fn from(v: u8) -> Self {
        match v {
            0 => GcPhase::Idle,
            1 => GcPhase::Running,
            2 => GcPhase::MarkYoung,
            3 => GcPhase::InitialMark,
            4 => GcPhase::Mark,
            5 => GcPhase::ConcurrentMark,
            6 => GcPhase::Remark,
            7 => GcPhase::CollectYoungAndMove,
            8 => GcPhase::SweepStringTable,
            9 => GcPhase::Sweep,
            _ => fatal!("unknown gc phase {}", v),
        }
    }
}

impl GcPhase {
    /// Check if tenured allocations must be born marked
    pub fn allocates_black(self) -> bool {
        matches!(self, GcPhase::ConcurrentMark | GcPhase::Remark | GcPhase::Sweep)
    }
}

/// Collection strategy
pub trait Collector: Send + Sync {
    /// Strategy type
    fn gc_type(&self) -> GcType;

    /// Run the strategy's phases; mutators are stopped on entry and on exit
    fn run_phases_impl(&self, cx: &GcContext, task: &mut GcTask);

    /// Check if `obj` could be reclaimed by the running cycle
    fn in_gc_sweep_range(&self, _cx: &GcContext, _obj: ObjectRef) -> bool {
        true
    }

    /// Called from [`GcContext::pre_startup`]
    fn pre_startup(&self, _cx: &GcContext) {}

    /// Called from [`GcContext::on_startup_complete`]
    fn on_startup_complete(&self, _cx: &GcContext) {}

    /// Check if heap-usage thresholds should schedule collections
    fn uses_threshold_trigger(&self) -> bool {
        true
    }
}

/// Instantiate the collector selected by `settings`
pub fn create_collector(settings: &GcSettings) -> Box<dyn Collector> {
    match settings.gc_type {
        GcType::Epsilon => Box::new(EpsilonGc),
        GcType::Stw => Box::new(StwGc::new()),
        GcType::Gen => Box::new(GenGc::new()),
    }
}

/// Mark every root passing `filter` and push it
pub(crate) fn mark_roots(
    cx: &GcContext,
    stack: &mut MarkingStack,
    flags: VisitRootFlags,
    filter: ObjectPredicate<'_>,
) {
    let memory = cx.memory();
    let marker = cx.marker();
    cx.visit_roots(
        &mut |root| {
            if filter(root.object) && marker.mark_if_not_marked(memory, root.object) {
                stack.push_from_root(root.root_type, root.object);
            }
        },
        flags,
    );
}

/// Mark interned strings selected by `flags` and push them
pub(crate) fn mark_string_table(cx: &GcContext, stack: &mut MarkingStack, flags: VisitRootFlags) {
    let memory = cx.memory();
    let marker = cx.marker();
    cx.roots().visit_string_table(
        &mut |root| {
            if marker.mark_if_not_marked(memory, root.object) {
                stack.push_from_root(root.root_type, root.object);
            }
        },
        flags,
    );
}

/// Free emptied pools and clear their cards
pub(crate) fn release_free_pools(cx: &GcContext) {
    let card_table = cx.card_table();
    cx.heap().visit_and_remove_free_pools(&mut |range| {
        card_table.clear_card_range(range.start(), range.end());
    });
}

/// Point a dynamic meta-class object's self slot at its current address
pub(crate) fn fix_meta_self_ref(cx: &GcContext, obj: ObjectRef) {
    let class = cx.class_of(obj);
    if class
        .as_dynamic()
        .is_some_and(|d| d.flags.is_meta_class && d.body_slots > 0)
    {
        cx.memory()
            .write_word(obj, HEADER_WORDS, TaggedValue::from_object(obj).raw());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_roundtrip() {
        for v in 0..=9u8 {
            assert_eq!(GcPhase::from(v) as u8, v);
        }
    }

    #[test]
    #[should_panic(expected = "unknown gc phase 99")]
    fn test_unknown_phase_is_fatal() {
        let _ = GcPhase::from(99);
    }

    #[test]
    fn test_black_allocation_phases() {
        assert!(GcPhase::ConcurrentMark.allocates_black());
        assert!(GcPhase::Sweep.allocates_black());
        assert!(!GcPhase::MarkYoung.allocates_black());
        assert!(!GcPhase::Idle.allocates_black());
    }
}
