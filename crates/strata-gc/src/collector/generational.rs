//! Generational collector
//!
//! ## Design
//!
//! - **Young**: roots plus objects on marked cards seed a young-only mark;
//!   survivors are copied into tenured pools and every reference to them
//!   is rewritten through the forwarding address left in the old header.
//! - **Tenured**: runs after a young collection when the tenured footprint
//!   crosses the trigger. Initial mark and remark stop the world; marking
//!   in between and the sweep run alongside mutators when concurrency is
//!   enabled. Mutators allocate black during those phases and the write
//!   barriers record both overwritten and newly stored references.
//! - **Full**: one stop-the-world mark of every space, a tenured sweep and
//!   then the young evacuation if tenured has room for it.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::card_table::CardVisitFlags;
use crate::collector::{
    Collector, GcPhase, fix_meta_self_ref, mark_roots, mark_string_table, release_free_pools,
};
use crate::context::GcContext;
use crate::fatal;
use crate::heap::TemplateSpaceState;
use crate::layout;
use crate::marker::any_object;
use crate::marking_stack::MarkingStack;
use crate::mem_range::MemRange;
use crate::object::{MARK_WORD_OFFSET, MarkWord, ObjectRef, ObjectStatus, WORD_SIZE};
use crate::rendezvous::ConcurrentScope;
use crate::roots::VisitRootFlags;
use crate::settings::GcType;
use crate::task::{CollectionType, GcTask, GcTaskCause};
use crate::verify::IntoGcVerifier;

/// Young/tenured collector with card-table remembered sets
pub struct GenGc {
    running: AtomicU8,
    tenured_enabled: AtomicBool,
}

impl GenGc {
    /// Create the collector; tenured collections start enabled
    pub fn new() -> Self {
        Self {
            running: AtomicU8::new(CollectionType::None as u8),
            tenured_enabled: AtomicBool::new(true),
        }
    }

    /// Check if threshold-triggered tenured collections may run
    pub fn is_tenured_gc_enabled(&self) -> bool {
        self.tenured_enabled.load(Ordering::Acquire)
    }

    fn running_type(&self) -> u8 {
        self.running.load(Ordering::Acquire)
    }

    fn have_enough_space_to_move(cx: &GcContext) -> bool {
        let heap = cx.heap();
        heap.have_enough_pools_in_object_space(heap.pools_for_young_promotion())
    }

    fn should_run_full_gc(cx: &GcContext, task: &GcTask, have_enough_space: bool) -> bool {
        !have_enough_space
            || matches!(
                task.cause,
                GcTaskCause::Oom | GcTaskCause::Explicit | GcTaskCause::StartupComplete
            )
            || cx.heap().template_state() == TemplateSpaceState::Forking
    }

    fn should_run_tenured_gc(&self, task: &GcTask) -> bool {
        matches!(
            task.cause,
            GcTaskCause::HeapUsageThreshold | GcTaskCause::NativeAlloc
        ) && self.is_tenured_gc_enabled()
    }

    fn clear_soft(task: &GcTask) -> bool {
        matches!(task.cause, GcTaskCause::Oom | GcTaskCause::Explicit)
    }

    fn run_young_gc(&self, cx: &GcContext, task: &GcTask) {
        self.running.store(CollectionType::Young as u8, Ordering::Release);
        let young = cx.memory().young_range();
        let in_young = move |obj: ObjectRef| young.contains_address(obj.addr());

        {
            let _phase = cx.phase_scope(GcPhase::MarkYoung);
            let marker = cx.marker();
            marker.set_atomic(cx.settings().parallel_marking);

            let mut stack = cx.new_marking_stack();
            mark_roots(cx, &mut stack, VisitRootFlags::ACCESS_ALL, &in_young);
            let cards = Self::mark_card_roots(cx, &mut stack, young);
            let marked = cx.drain_marking_stack(&mut stack, &in_young, &in_young);
            let refs = cx.references().process_references(
                cx,
                &mut stack,
                Self::clear_soft(task),
                &in_young,
                &in_young,
            );
            marker.set_atomic(false);

            let mut stats = cx.stats_mut();
            stats.last_cards_scanned = cards;
            stats.last_marked += marked;
            stats.last_references_cleared += refs.cleared;
        }

        let _phase = cx.phase_scope(GcPhase::CollectYoungAndMove);
        self.evacuate_young(cx);
    }

    /// Mark young objects referenced from objects on marked cards
    fn mark_card_roots(cx: &GcContext, stack: &mut MarkingStack, young: MemRange) -> usize {
        let memory = cx.memory();
        let classes = cx.classes();
        let marker = cx.marker();
        let heap = cx.heap();
        cx.card_table().visit_marked(
            &mut |range| {
                if range.intersects(&young) {
                    return;
                }
                heap.iterate_over_objects_in_range(range, &mut |obj| {
                    let class = cx.class_of(obj);
                    layout::for_each_ref_slot(memory, classes, obj, &class, &mut |slot| {
                        if young.contains_address(slot.target.addr())
                            && marker.mark_if_not_marked(memory, slot.target)
                        {
                            stack.push_from_object(obj, slot.target);
                        }
                    });
                });
            },
            CardVisitFlags::VISIT_MARKED | CardVisitFlags::VISIT_PROCESSED,
        )
    }

    /// Copy marked young objects to tenured, rewrite references and reset
    /// the young space. Cards are cleared: no young object survives.
    fn evacuate_young(&self, cx: &GcContext) {
        let verifier = cx
            .settings()
            .into_gc_heap_verification
            .then(|| IntoGcVerifier::collect(cx));

        let moved = Self::move_young_objects(cx);
        Self::update_refs_to_moved(cx, &moved);

        if let Some(verifier) = verifier {
            let failures = verifier.verify(cx);
            cx.report_verification("into-gc", failures);
        }

        let young = cx.memory().young_range();
        let removed = cx.roots().sweep_string_table(&mut |s| {
            if young.contains_address(s.addr()) {
                ObjectStatus::Dead
            } else {
                ObjectStatus::Alive
            }
        });
        if removed > 0 {
            tracing::debug!(target: "strata::gc", removed, "dropped dead young strings");
        }

        cx.heap().reset_young_allocator();
        cx.card_table().clear_all();
    }

    fn move_young_objects(cx: &GcContext) -> Vec<ObjectRef> {
        let heap = cx.heap();
        let memory = cx.memory();
        let marker = cx.marker();
        let mut moved = Vec::new();
        let mut bytes = 0;

        heap.iterate_over_young_objects(&mut |obj| {
            if !marker.is_marked(memory, obj) {
                return;
            }
            let Some(size) = heap.object_size(obj) else {
                fatal!("young object {:?} has no recorded size", obj);
            };
            let Some(dst) = heap.alloc_tenured(size) else {
                fatal!("tenured space exhausted promoting {:?} ({} bytes)", obj, size);
            };
            memory.copy_words(obj.addr(), dst.addr(), size / WORD_SIZE);
            memory.set_mark_word(dst, MarkWord::new());
            marker.unmark(memory, dst);

            let old = memory.mark_word(obj);
            if memory
                .compare_exchange(
                    obj.field_addr(MARK_WORD_OFFSET),
                    old.raw(),
                    MarkWord::forwarded_to(dst.addr()).raw(),
                )
                .is_err()
            {
                fatal!("mark word of {:?} changed while promoting it", obj);
            }
            fix_meta_self_ref(cx, dst);

            moved.push(dst);
            bytes += size;
        });

        let mut stats = cx.stats_mut();
        stats.last_promoted_objects += moved.len();
        stats.last_promoted_bytes += bytes;
        tracing::debug!(target: "strata::gc", objects = moved.len(), bytes, "promoted young objects");
        moved
    }

    /// Rewrite references to forwarded young objects in moved objects,
    /// objects on marked cards and every root
    fn update_refs_to_moved(cx: &GcContext, moved: &[ObjectRef]) {
        let memory = cx.memory();
        let classes = cx.classes();
        for &obj in moved {
            let class = cx.class_of(obj);
            layout::update_refs_in_object(memory, classes, obj, &class);
        }

        let young = memory.young_range();
        let heap = cx.heap();
        cx.card_table().visit_marked(
            &mut |range| {
                if range.intersects(&young) {
                    return;
                }
                heap.iterate_over_objects_in_range(range, &mut |obj| {
                    let class = cx.class_of(obj);
                    layout::update_refs_in_object(memory, classes, obj, &class);
                });
            },
            CardVisitFlags::VISIT_MARKED | CardVisitFlags::VISIT_PROCESSED,
        );
        cx.update_refs_common();
    }

    fn run_tenured_gc(&self, cx: &GcContext, task: &GcTask) {
        self.running.store(CollectionType::Tenured as u8, Ordering::Release);
        let concurrent = cx.settings().concurrency_enabled;
        let parallel = cx.settings().parallel_marking;
        let memory = cx.memory();
        let marker = cx.marker();
        let heap = cx.heap();
        let young = memory.young_range();
        let not_young = move |obj: ObjectRef| !young.contains_address(obj.addr());

        marker.clear_bitmaps();
        marker.unmark_young(heap);
        let mut stack = cx.new_marking_stack();
        let mut marked = 0;

        {
            let _phase = cx.phase_scope(GcPhase::InitialMark);
            marker.set_atomic(parallel);
            mark_roots(
                cx,
                &mut stack,
                VisitRootFlags::ACCESS_ALL | VisitRootFlags::START_RECORDING_NEW,
                &any_object,
            );
            cx.roots().visit_string_table(
                &mut |_| {},
                VisitRootFlags::ACCESS_NONE | VisitRootFlags::START_RECORDING_NEW,
            );
            cx.barriers().set_concurrent_marking(concurrent);
        }

        {
            // mutators allocate black from here on; phase callbacks run
            // while they are resumed
            marker.set_atomic(true);
            let _world = ConcurrentScope::new(cx.rendezvous(), concurrent);
            let _phase = cx.phase_scope(GcPhase::ConcurrentMark);
            marked += cx.drain_marking_stack(&mut stack, &not_young, &any_object);
            Self::rescan_cards(
                cx,
                &mut stack,
                young,
                CardVisitFlags::VISIT_MARKED | CardVisitFlags::SET_PROCESSED,
            );
            marked += cx.drain_marking_stack(&mut stack, &not_young, &any_object);
        }

        let refs = {
            let _phase = cx.phase_scope(GcPhase::Remark);
            cx.barriers().set_concurrent_marking(false);
            marker.set_atomic(parallel);
            mark_roots(
                cx,
                &mut stack,
                VisitRootFlags::ACCESS_ONLY_NEW | VisitRootFlags::END_RECORDING_NEW,
                &any_object,
            );
            Self::rescan_cards(cx, &mut stack, young, CardVisitFlags::VISIT_MARKED);
            for obj in cx.barriers().buffer().drain() {
                if marker.mark_if_not_marked(memory, obj) {
                    stack.push_from_barrier(obj);
                }
            }
            mark_string_table(
                cx,
                &mut stack,
                VisitRootFlags::ACCESS_ONLY_NEW | VisitRootFlags::END_RECORDING_NEW,
            );
            marked += cx.drain_marking_stack(&mut stack, &not_young, &any_object);
            let refs = cx.references().process_references(
                cx,
                &mut stack,
                Self::clear_soft(task),
                &not_young,
                &any_object,
            );
            marker.set_atomic(false);
            refs
        };

        marker.unmark_young(heap);

        {
            let _phase = cx.phase_scope(GcPhase::SweepStringTable);
            cx.roots().sweep_string_table(&mut |s| {
                if young.contains_address(s.addr()) {
                    ObjectStatus::Alive
                } else {
                    marker.mark_checker(memory, s)
                }
            });
        }

        let freed = {
            let _phase = cx.phase_scope(GcPhase::Sweep);
            // objects allocated once mutators resume are never candidates
            let mut candidates = Vec::new();
            heap.iterate_over_tenured_objects(&mut |obj| candidates.push(obj));
            let _world = ConcurrentScope::new(cx.rendezvous(), concurrent);
            let dead: Vec<ObjectRef> = candidates
                .into_iter()
                .filter(|&obj| marker.mark_checker(memory, obj) == ObjectStatus::Dead)
                .collect();
            heap.free_objects(&dead)
        };
        // pools may only be handed back while mutators cannot dirty their cards
        release_free_pools(cx);
        marker.clear_bitmaps();

        let mut stats = cx.stats_mut();
        stats.last_marked += marked;
        stats.last_references_cleared += refs.cleared;
        stats.last_freed_objects += freed.objects;
        stats.last_freed_bytes += freed.bytes;
    }

    /// Rescan marked non-young objects found on marked cards
    fn rescan_cards(cx: &GcContext, stack: &mut MarkingStack, young: MemRange, flags: CardVisitFlags) {
        let memory = cx.memory();
        let marker = cx.marker();
        let heap = cx.heap();
        cx.card_table().visit_marked(
            &mut |range| {
                if range.intersects(&young) {
                    return;
                }
                heap.iterate_over_objects_in_range(range, &mut |obj| {
                    if marker.is_marked(memory, obj) {
                        marker.rescan_object(cx, stack, obj, &any_object);
                    }
                });
            },
            flags,
        );
    }

    fn run_full_gc(&self, cx: &GcContext, task: &GcTask) {
        self.running.store(CollectionType::Full as u8, Ordering::Release);
        let memory = cx.memory();
        let marker = cx.marker();
        let heap = cx.heap();

        marker.unmark_young(heap);
        marker.clear_bitmaps();

        {
            let _phase = cx.phase_scope(GcPhase::Mark);
            marker.set_atomic(cx.settings().parallel_marking);
            let mut stack = cx.new_marking_stack();
            mark_roots(cx, &mut stack, VisitRootFlags::ACCESS_ALL, &any_object);
            mark_string_table(cx, &mut stack, VisitRootFlags::ACCESS_ALL);
            let marked = cx.drain_marking_stack(&mut stack, &any_object, &any_object);
            let refs = cx.references().process_references(
                cx,
                &mut stack,
                Self::clear_soft(task),
                &any_object,
                &any_object,
            );
            marker.set_atomic(false);

            let mut stats = cx.stats_mut();
            stats.last_marked += marked;
            stats.last_references_cleared += refs.cleared;
        }

        {
            let _phase = cx.phase_scope(GcPhase::SweepStringTable);
            cx.roots()
                .sweep_string_table(&mut |s| marker.mark_checker(memory, s));
        }

        {
            let _phase = cx.phase_scope(GcPhase::Sweep);
            let freed = heap.collect(&mut |obj| marker.mark_checker(memory, obj));
            release_free_pools(cx);
            let mut stats = cx.stats_mut();
            stats.last_freed_objects += freed.objects;
            stats.last_freed_bytes += freed.bytes;
        }

        if Self::have_enough_space_to_move(cx) {
            let _phase = cx.phase_scope(GcPhase::CollectYoungAndMove);
            self.evacuate_young(cx);
        } else {
            // young survivors stay put; their cards still hold old-to-young edges
            marker.unmark_young(heap);
            tracing::warn!(target: "strata::gc", "not enough tenured space to promote young objects");
        }
        marker.clear_bitmaps();
    }
}

impl Default for GenGc {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for GenGc {
    fn gc_type(&self) -> GcType {
        GcType::Gen
    }

    fn run_phases_impl(&self, cx: &GcContext, task: &mut GcTask) {
        let have_enough_space = Self::have_enough_space_to_move(cx);
        if Self::should_run_full_gc(cx, task, have_enough_space) {
            task.collection_type = CollectionType::Full;
            self.run_full_gc(cx, task);
        } else {
            task.collection_type = CollectionType::Young;
            self.run_young_gc(cx, task);
            if self.should_run_tenured_gc(task) {
                task.collection_type = CollectionType::Tenured;
                self.run_tenured_gc(cx, task);
            }
        }
        self.running.store(CollectionType::None as u8, Ordering::Release);
    }

    fn in_gc_sweep_range(&self, cx: &GcContext, obj: ObjectRef) -> bool {
        let young = cx.memory().young_range().contains_address(obj.addr());
        match self.running_type() {
            t if t == CollectionType::Young as u8 => young,
            t if t == CollectionType::Tenured as u8 => !young,
            _ => true,
        }
    }

    fn pre_startup(&self, _cx: &GcContext) {
        self.tenured_enabled.store(false, Ordering::Release);
        tracing::debug!(target: "strata::gc", "tenured collections deferred until startup completes");
    }

    fn on_startup_complete(&self, _cx: &GcContext) {
        self.tenured_enabled.store(true, Ordering::Release);
    }
}
