//! GC context and cycle driver
//!
//! [`GcContext`] owns everything one runtime's collector needs: settings,
//! heap, classes, roots, barriers, mark state, listeners and the active
//! [`Collector`]. The runtime holds it in an `Arc`; the worker thread holds
//! a clone. Collectors only ever see `&GcContext` for the duration of a
//! cycle.
//!
//! ## Cycle protocol
//!
//! - At most one cycle runs at a time: the phase moves `Idle -> Running`
//!   by CAS, other requesters wait on a condvar.
//! - A requester samples the cycle counter before waiting. If the counter
//!   moved by the time it owns the collector, someone else already
//!   collected and the request returns `false` without running.
//! - The counter is bumped when a cycle finishes, after the collector's
//!   phases and verification.

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::barrier::BarrierSet;
use crate::card_table::CardTable;
use crate::class::{ClassDescriptor, ClassId, ClassLayout, ClassRegistry};
use crate::collector::{Collector, GcPhase, create_collector, fix_meta_self_ref, release_free_pools};
use crate::error::{GcError, GcResult};
use crate::fatal;
use crate::heap::{GenerationalHeap, HeapMemory, ObjectAllocator, SpaceKind, TemplateSpaceState};
use crate::layout;
use crate::listener::GcListener;
use crate::marker::{Marker, ObjectPredicate};
use crate::marking_stack::MarkingStack;
use crate::object::{
    HEADER_WORDS, LENGTH_OFFSET, MARK_WORD_OFFSET, MarkWord, ObjectRef, TaggedValue, WORD_SIZE,
};
use crate::references::ReferenceProcessor;
use crate::rendezvous::{ManagedScope, Rendezvous};
use crate::roots::{GcRoot, RuntimeRoots, VisitRootFlags};
use crate::scheduler::GcQueue;
use crate::settings::{GcSettings, GcType, NativeGcTriggerType};
use crate::stats::GcStats;
use crate::task::{GcTask, GcTaskCause};
use crate::verify::verify_heap;
use crate::workers;

/// Collector state of one runtime
pub struct GcContext {
    settings: GcSettings,
    heap: Box<dyn ObjectAllocator>,
    classes: ClassRegistry,
    roots: RuntimeRoots,
    barriers: BarrierSet,
    marker: Marker,
    references: ReferenceProcessor,
    rendezvous: Rendezvous,
    collector: Box<dyn Collector>,
    queue: GcQueue,
    listeners: RwLock<Vec<Arc<dyn GcListener>>>,
    stats: Mutex<GcStats>,

    phase: AtomicU8,
    idle_lock: Mutex<()>,
    idle_cv: Condvar,
    idle_waiters: AtomicUsize,
    gc_counter: AtomicU64,
    last_cause: AtomicU8,

    target_footprint: AtomicUsize,
    can_add_gc_task: AtomicBool,
    native_bytes: AtomicUsize,
    native_at_last_gc: AtomicUsize,
}

impl GcContext {
    /// Validate `settings` and build the heap and collector they describe
    pub fn new(settings: GcSettings) -> GcResult<Self> {
        settings.validate()?;
        let heap: Box<dyn ObjectAllocator> = Box::new(GenerationalHeap::new(&settings));
        let memory = heap.memory();
        let marker = Marker::new(memory);
        let barriers = BarrierSet::new(memory.range(), memory.young_range());
        let collector = create_collector(&settings);

        tracing::debug!(
            target: "strata::gc",
            gc_type = ?settings.gc_type,
            heap = %memory.range(),
            young = settings.has_young_space(),
            "gc context created"
        );

        Ok(Self {
            target_footprint: AtomicUsize::new(settings.min_target_footprint),
            heap,
            classes: ClassRegistry::new(),
            roots: RuntimeRoots::new(),
            barriers,
            marker,
            references: ReferenceProcessor::new(),
            rendezvous: Rendezvous::new(),
            collector,
            queue: GcQueue::new(),
            listeners: RwLock::new(Vec::new()),
            stats: Mutex::new(GcStats::default()),
            phase: AtomicU8::new(GcPhase::Idle as u8),
            idle_lock: Mutex::new(()),
            idle_cv: Condvar::new(),
            idle_waiters: AtomicUsize::new(0),
            gc_counter: AtomicU64::new(0),
            last_cause: AtomicU8::new(GcTaskCause::Invalid as u8),
            can_add_gc_task: AtomicBool::new(true),
            native_bytes: AtomicUsize::new(0),
            native_at_last_gc: AtomicUsize::new(0),
            settings,
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Settings in effect
    pub fn settings(&self) -> &GcSettings {
        &self.settings
    }

    /// Object allocator
    pub fn heap(&self) -> &dyn ObjectAllocator {
        self.heap.as_ref()
    }

    /// Heap words
    pub fn memory(&self) -> &HeapMemory {
        self.heap.memory()
    }

    /// Class registry
    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    /// Runtime roots
    pub fn roots(&self) -> &RuntimeRoots {
        &self.roots
    }

    /// Write barriers
    pub fn barriers(&self) -> &BarrierSet {
        &self.barriers
    }

    /// Card table
    pub fn card_table(&self) -> &CardTable {
        self.barriers.card_table()
    }

    /// Mark state
    pub fn marker(&self) -> &Marker {
        &self.marker
    }

    /// Reference processor
    pub fn references(&self) -> &ReferenceProcessor {
        &self.references
    }

    /// Mutator rendezvous
    pub fn rendezvous(&self) -> &Rendezvous {
        &self.rendezvous
    }

    /// Active collector type
    pub fn gc_type(&self) -> GcType {
        self.collector.gc_type()
    }

    pub(crate) fn queue(&self) -> &GcQueue {
        &self.queue
    }

    /// Snapshot of the statistics
    pub fn stats(&self) -> GcStats {
        self.stats.lock().clone()
    }

    pub(crate) fn stats_mut(&self) -> MutexGuard<'_, GcStats> {
        self.stats.lock()
    }

    /// Completed cycles
    pub fn gc_counter(&self) -> u64 {
        self.gc_counter.load(Ordering::Acquire)
    }

    /// Threads currently waiting for the collector to become idle
    pub fn idle_waiters(&self) -> usize {
        self.idle_waiters.load(Ordering::Acquire)
    }

    /// Cause of the most recent cycle
    pub fn last_cause(&self) -> GcTaskCause {
        GcTaskCause::from(self.last_cause.load(Ordering::Acquire))
    }

    /// Current phase
    pub fn phase(&self) -> GcPhase {
        GcPhase::from(self.phase.load(Ordering::Acquire))
    }

    /// Check if a cycle owns the collector
    pub fn is_gc_running(&self) -> bool {
        self.phase() != GcPhase::Idle
    }

    /// Tenured footprint that schedules a threshold collection
    pub fn target_footprint(&self) -> usize {
        self.target_footprint.load(Ordering::Acquire)
    }

    /// Check if `obj` could be reclaimed by the running cycle
    pub fn in_gc_sweep_range(&self, obj: ObjectRef) -> bool {
        self.collector.in_gc_sweep_range(self, obj)
    }

    /// Register a listener
    pub fn add_listener(&self, listener: Arc<dyn GcListener>) {
        self.listeners.write().push(listener);
    }

    /// Class of `obj`; an unknown class id is fatal
    pub fn class_of(&self, obj: ObjectRef) -> Arc<ClassDescriptor> {
        let id = self.memory().class_id(obj);
        self.classes
            .get(id)
            .unwrap_or_else(|e| fatal!("{:?} has a broken class word: {}", obj, e))
    }

    // ------------------------------------------------------------------
    // Collector plumbing
    // ------------------------------------------------------------------

    /// Visit runtime roots plus references waiting to be enqueued
    pub fn visit_roots(&self, visitor: &mut dyn FnMut(GcRoot), flags: VisitRootFlags) {
        self.roots.visit_roots(visitor, flags);
        self.references.visit_pending(visitor);
    }

    /// Rewrite roots and pending references that point at moved objects
    pub fn update_refs_common(&self) {
        let memory = self.memory();
        self.roots.update_refs_to_moved(memory);
        self.references.update_refs_to_moved(memory);
    }

    /// Enter `phase` until the returned guard drops
    pub fn phase_scope(&self, phase: GcPhase) -> PhaseScope<'_> {
        self.phase.store(phase as u8, Ordering::Release);
        tracing::debug!(target: "strata::gc", ?phase, "phase started");
        for listener in self.listeners.read().iter() {
            listener.gc_phase_started(phase);
        }
        PhaseScope { cx: self, phase }
    }

    /// Marking stack configured for the current marking mode
    pub fn new_marking_stack(&self) -> MarkingStack {
        if self.settings.parallel_marking {
            MarkingStack::with_task_threshold(self.settings.marking_task_threshold)
        } else {
            MarkingStack::new()
        }
    }

    /// Drain `stack`, on the worker pool when parallel marking is active
    pub fn drain_marking_stack(
        &self,
        stack: &mut MarkingStack,
        ref_pred: ObjectPredicate<'_>,
        filter: ObjectPredicate<'_>,
    ) -> usize {
        if self.settings.parallel_marking && self.marker.is_atomic() {
            workers::drain_parallel(
                self,
                stack,
                self.settings.gc_workers_count,
                self.settings.marking_task_threshold,
                ref_pred,
                filter,
            )
        } else {
            self.marker.mark_stack(self, stack, ref_pred, filter)
        }
    }

    pub(crate) fn report_verification(&self, kind: &str, failures: usize) {
        if failures == 0 {
            return;
        }
        self.stats.lock().verification_failures += failures;
        tracing::error!(target: "strata::gc", kind, failures, "heap verification failed");
        if self.settings.fail_on_heap_verification {
            fatal!("{} heap verification found {} broken references", kind, failures);
        }
    }

    // ------------------------------------------------------------------
    // Cycle driver
    // ------------------------------------------------------------------

    fn wait_for_idle(&self) {
        let mut guard = self.idle_lock.lock();
        while self
            .phase
            .compare_exchange(
                GcPhase::Idle as u8,
                GcPhase::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            self.idle_waiters.fetch_add(1, Ordering::AcqRel);
            self.idle_cv.wait(&mut guard);
            self.idle_waiters.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn set_idle(&self) {
        let _guard = self.idle_lock.lock();
        self.phase.store(GcPhase::Idle as u8, Ordering::Release);
        self.idle_cv.notify_all();
    }

    /// Run one cycle for `task` on the calling thread, which must not hold
    /// the mutator share. Returns `false` when another cycle completed
    /// while this request waited.
    pub fn wait_for_gc(&self, mut task: GcTask) -> bool {
        let old_counter = self.gc_counter.load(Ordering::Acquire);
        self.wait_for_idle();
        if self.gc_counter.load(Ordering::Acquire) != old_counter {
            self.set_idle();
            tracing::trace!(target: "strata::gc", cause = %task.cause, "request satisfied by another cycle");
            return false;
        }

        self.rendezvous.safepoint_begin();
        self.run_phases(&mut task);
        self.rendezvous.safepoint_end();
        self.set_idle();
        true
    }

    /// [`wait_for_gc`](Self::wait_for_gc) for callers that may hold the
    /// mutator share; the share is released for the duration
    pub fn wait_for_gc_in_managed(&self, task: GcTask) -> bool {
        if self.rendezvous.holds_mutator_share() {
            let _native = self.rendezvous.release_managed();
            self.wait_for_gc(task)
        } else {
            self.wait_for_gc(task)
        }
    }

    fn run_phases(&self, task: &mut GcTask) {
        let start = Instant::now();
        self.stats.lock().begin_cycle();
        self.last_cause.store(task.cause as u8, Ordering::Release);

        if self.settings.pre_gc_heap_verification {
            self.report_verification("pre-gc", verify_heap(self));
        }

        let before = self.heap.footprint();
        for listener in self.listeners.read().iter() {
            listener.gc_started(before);
        }

        self.collector.run_phases_impl(self, task);

        if self.settings.post_gc_heap_verification {
            self.report_verification("post-gc", verify_heap(self));
        }

        let counter = self.gc_counter.fetch_add(1, Ordering::AcqRel) + 1;
        self.native_at_last_gc
            .store(self.native_bytes.load(Ordering::Acquire), Ordering::Release);
        self.recompute_target_footprint();

        let after = self.heap.footprint();
        let elapsed = start.elapsed();
        let freed = {
            let mut stats = self.stats.lock();
            stats.end_cycle(task.collection_type, elapsed);
            stats.last_freed_bytes
        };
        for listener in self.listeners.read().iter() {
            listener.gc_finished(task, before, after);
        }

        tracing::info!(
            target: "strata::gc",
            counter,
            cause = %task.cause,
            collection = ?task.collection_type,
            before,
            after,
            freed,
            elapsed_us = elapsed.as_micros() as u64,
            "gc cycle finished"
        );
    }

    fn recompute_target_footprint(&self) {
        let live = self.heap.tenured_used();
        let target = ((live as f64) / self.settings.gc_trigger_ratio) as usize;
        self.target_footprint
            .store(target.max(self.settings.min_target_footprint), Ordering::Release);
    }

    /// Hand `task` to the worker, or run it here in run-in-place mode.
    ///
    /// Threshold-triggered tasks are coalesced: while one is queued or
    /// running, further threshold requests are dropped.
    pub fn add_gc_task(&self, task: GcTask, is_managed: bool, triggered_by_threshold: bool) -> bool {
        if self.settings.run_gc_in_place {
            return if is_managed {
                self.wait_for_gc_in_managed(task)
            } else {
                self.wait_for_gc(task)
            };
        }
        if !self.queue.is_running() {
            return false;
        }
        if triggered_by_threshold
            && self
                .can_add_gc_task
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return false;
        }
        let cause = task.cause;
        if !self.queue.push(task) {
            if triggered_by_threshold {
                self.allow_threshold_tasks();
            }
            return false;
        }
        tracing::trace!(target: "strata::gc", %cause, "gc task queued");
        true
    }

    pub(crate) fn allow_threshold_tasks(&self) {
        self.can_add_gc_task.store(true, Ordering::Release);
    }

    /// Collect synchronously with `cause`
    pub fn collect_garbage(&self, cause: GcTaskCause) -> bool {
        self.wait_for_gc_in_managed(GcTask::new(cause))
    }

    // ------------------------------------------------------------------
    // Startup and native memory
    // ------------------------------------------------------------------

    /// Defer tenured collections until startup completes. With a worker,
    /// a startup-complete collection is scheduled after the configured
    /// delay; in run-in-place mode the embedder calls
    /// [`on_startup_complete`](Self::on_startup_complete) itself.
    pub fn pre_startup(&self) {
        self.collector.pre_startup(self);
        if !self.settings.run_gc_in_place {
            let delay = Duration::from_millis(self.settings.startup_gc_delay_ms);
            self.add_gc_task(GcTask::post_startup(delay), false, false);
        }
    }

    /// Re-enable work deferred by [`pre_startup`](Self::pre_startup)
    pub fn on_startup_complete(&self) {
        self.collector.on_startup_complete(self);
        tracing::debug!(target: "strata::gc", "startup complete");
    }

    /// Record `bytes` of native memory owned by managed objects
    pub fn register_native_allocation(&self, bytes: usize) {
        let total = self.native_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if self.settings.native_gc_trigger != NativeGcTriggerType::SimpleStrategy {
            return;
        }
        let at_last_gc = self.native_at_last_gc.load(Ordering::Acquire);
        if total.saturating_sub(at_last_gc) > self.settings.native_watermark {
            let managed = self.rendezvous.holds_mutator_share();
            self.add_gc_task(GcTask::new(GcTaskCause::NativeAlloc), managed, true);
        }
    }

    /// Forget `bytes` of native memory
    pub fn register_native_free(&self, bytes: usize) {
        let _ = self
            .native_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(bytes))
            });
    }

    /// Registered native bytes
    pub fn native_bytes(&self) -> usize {
        self.native_bytes.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    fn mutator_scope(&self) -> Option<ManagedScope<'_>> {
        (!self.rendezvous.holds_mutator_share()).then(|| self.rendezvous.enter_managed())
    }

    fn check_heap_threshold(&self) {
        if self.collector.uses_threshold_trigger() && self.heap.tenured_used() > self.target_footprint() {
            self.add_gc_task(GcTask::new(GcTaskCause::HeapUsageThreshold), true, true);
        }
    }

    fn alloc_raw(&self, words: usize, tenured: bool) -> GcResult<ObjectRef> {
        let size = words * WORD_SIZE;
        if size > self.settings.pool_size {
            return Err(GcError::ObjectTooLarge { size });
        }
        self.check_heap_threshold();

        let try_alloc = || {
            if tenured {
                self.heap.alloc_tenured(size)
            } else {
                self.heap.alloc(size)
            }
        };
        if let Some(obj) = try_alloc() {
            return Ok(obj);
        }
        for cause in [GcTaskCause::Young, GcTaskCause::Young, GcTaskCause::Oom] {
            self.wait_for_gc_in_managed(GcTask::new(cause));
            if let Some(obj) = try_alloc() {
                return Ok(obj);
            }
        }
        tracing::warn!(target: "strata::gc", size, "allocation failed after oom collection");
        Err(GcError::OutOfMemory { requested: size })
    }

    /// Allocate, let `init` fill in the body, then install the header and
    /// set the object's initial mark state
    fn allocate(
        &self,
        class: &ClassDescriptor,
        words: usize,
        tenured: bool,
        init: impl FnOnce(&HeapMemory, ObjectRef),
    ) -> GcResult<ObjectRef> {
        let _scope = self.mutator_scope();
        let obj = self.alloc_raw(words, tenured)?;
        let memory = self.memory();
        init(memory, obj);
        memory.init_header(obj, class.id());
        self.init_gc_bits(obj);
        Ok(obj)
    }

    fn init_gc_bits(&self, obj: ObjectRef) {
        match self.memory().space_kind(obj.addr()) {
            Some(SpaceKind::Young) | None => {}
            Some(_) => {
                let marking = self.phase().allocates_black() || self.barriers.is_concurrent_marking();
                if self.gc_type() == GcType::Gen && marking {
                    self.marker.mark(self.memory(), obj);
                } else {
                    self.marker.unmark(self.memory(), obj);
                }
            }
        }
    }

    /// Allocate a fixed-size instance of `class`
    pub fn alloc_object(&self, class: ClassId) -> GcResult<ObjectRef> {
        let desc = self.classes.get(class)?;
        if desc.is_variable_size() {
            return Err(GcError::InvalidClass(format!(
                "{} is variable-sized",
                desc.name()
            )));
        }
        self.allocate(&desc, desc.instance_words(), false, |_, _| {})
    }

    /// Allocate a fixed-size instance of `class` directly in tenured space
    pub fn alloc_tenured_object(&self, class: ClassId) -> GcResult<ObjectRef> {
        let desc = self.classes.get(class)?;
        if desc.is_variable_size() {
            return Err(GcError::InvalidClass(format!(
                "{} is variable-sized",
                desc.name()
            )));
        }
        self.allocate(&desc, desc.instance_words(), true, |_, _| {})
    }

    /// Allocate an array of `len` elements
    pub fn alloc_array(&self, class: ClassId, len: usize) -> GcResult<ObjectRef> {
        let desc = self.classes.get(class)?;
        let is_array = match desc.layout() {
            ClassLayout::Static(s) => s.array_component.is_some(),
            ClassLayout::Dynamic(d) => d.flags.is_array,
        };
        if !is_array {
            return Err(GcError::InvalidClass(format!("{} is not an array class", desc.name())));
        }
        self.allocate(&desc, HEADER_WORDS + 1 + len, false, |memory, obj| {
            memory.write_word(obj, LENGTH_OFFSET, len);
        })
    }

    /// Allocate a string object holding `bytes`
    pub fn alloc_string(&self, class: ClassId, bytes: &[u8]) -> GcResult<ObjectRef> {
        let desc = self.classes.get(class)?;
        if !desc.as_dynamic().is_some_and(|d| d.flags.is_string) {
            return Err(GcError::InvalidClass(format!("{} is not a string class", desc.name())));
        }
        let words = HEADER_WORDS + 1 + bytes.len().div_ceil(WORD_SIZE);
        self.allocate(&desc, words, false, |memory, obj| {
            memory.write_word(obj, LENGTH_OFFSET, bytes.len());
            for (i, chunk) in bytes.chunks(WORD_SIZE).enumerate() {
                let mut word = [0u8; WORD_SIZE];
                word[..chunk.len()].copy_from_slice(chunk);
                memory.write_word(obj, LENGTH_OFFSET + 1 + i, usize::from_le_bytes(word));
            }
        })
    }

    /// Read back the bytes of a string object
    pub fn string_bytes(&self, string: ObjectRef) -> Vec<u8> {
        let memory = self.memory();
        let len = memory.read_word(string, LENGTH_OFFSET);
        let mut bytes = Vec::with_capacity(len);
        for i in 0..len.div_ceil(WORD_SIZE) {
            bytes.extend_from_slice(&memory.read_word(string, LENGTH_OFFSET + 1 + i).to_le_bytes());
        }
        bytes.truncate(len);
        bytes
    }

    /// Allocate and intern a string
    pub fn intern_string(&self, class: ClassId, bytes: &[u8]) -> GcResult<ObjectRef> {
        let string = self.alloc_string(class, bytes)?;
        self.roots.intern_string(string);
        Ok(string)
    }

    /// Allocate the class mirror describing `described` and register it as
    /// a root. Mirrors live in tenured space.
    pub fn alloc_class_mirror(&self, mirror_class: ClassId, described: ClassId) -> GcResult<ObjectRef> {
        let desc = self.classes.get(mirror_class)?;
        if !desc.as_static().is_some_and(|s| s.is_class_class) {
            return Err(GcError::InvalidClass(format!("{} is not a class class", desc.name())));
        }
        let static_words = match self.classes.get(described)?.as_static() {
            Some(s) => s.static_words,
            None => {
                return Err(GcError::InvalidClass(format!(
                    "class {:?} has no static layout",
                    described
                )));
            }
        };
        let mirror = self.allocate(&desc, desc.instance_words() + static_words, true, |memory, obj| {
            memory.write_word(obj, LENGTH_OFFSET, described.0 as usize);
        })?;
        self.roots.add_class_mirror(mirror);
        Ok(mirror)
    }

    /// Allocate a dynamic meta-class object; its first body slot points
    /// back at the object
    pub fn alloc_meta_class(&self, class: ClassId) -> GcResult<ObjectRef> {
        let desc = self.classes.get(class)?;
        if !desc
            .as_dynamic()
            .is_some_and(|d| d.flags.is_meta_class && d.body_slots > 0)
        {
            return Err(GcError::InvalidClass(format!("{} is not a meta class", desc.name())));
        }
        self.allocate(&desc, desc.instance_words(), false, |memory, obj| {
            memory.write_word(obj, HEADER_WORDS, TaggedValue::from_object(obj).raw());
        })
    }

    // ------------------------------------------------------------------
    // Barriered field access
    // ------------------------------------------------------------------

    fn check_field(&self, obj: ObjectRef, offset: usize) {
        let Some(size) = self.heap.object_size(obj) else {
            fatal!("field access on {:?}, which is not an object", obj);
        };
        if offset < HEADER_WORDS || offset >= size / WORD_SIZE {
            fatal!("field offset {} out of bounds for {:?} ({} bytes)", offset, obj, size);
        }
    }

    fn store_with_barriers(&self, obj: ObjectRef, offset: usize, raw: usize, target: Option<ObjectRef>) {
        let _scope = self.mutator_scope();
        self.check_field(obj, offset);
        let memory = self.memory();
        if self.barriers.is_concurrent_marking() {
            let old = TaggedValue::from_raw(memory.read_word(obj, offset)).heap_object();
            self.barriers.pre_barrier(old);
        }
        memory.write_word(obj, offset, raw);
        self.barriers.post_barrier(obj, target);
    }

    /// Store a raw reference into word `offset` of `obj`
    pub fn write_ref(&self, obj: ObjectRef, offset: usize, value: Option<ObjectRef>) {
        self.store_with_barriers(obj, offset, crate::object::encode_ref(value), value);
    }

    /// Load a raw reference from word `offset` of `obj`
    pub fn read_ref(&self, obj: ObjectRef, offset: usize) -> Option<ObjectRef> {
        self.check_field(obj, offset);
        self.memory().read_ref(obj, offset)
    }

    /// Store a tagged value into word `offset` of `obj`
    pub fn write_tagged(&self, obj: ObjectRef, offset: usize, value: TaggedValue) {
        self.store_with_barriers(obj, offset, value.raw(), value.heap_object());
    }

    /// Load a tagged value from word `offset` of `obj`
    pub fn read_tagged(&self, obj: ObjectRef, offset: usize) -> TaggedValue {
        self.check_field(obj, offset);
        self.memory().read_tagged(obj, offset)
    }

    /// Store primitive data; no barrier
    pub fn write_word(&self, obj: ObjectRef, offset: usize, value: usize) {
        self.check_field(obj, offset);
        self.memory().write_word(obj, offset, value);
    }

    /// Load primitive data
    pub fn read_word(&self, obj: ObjectRef, offset: usize) -> usize {
        self.check_field(obj, offset);
        self.memory().read_word(obj, offset)
    }

    /// Word offset of static field `index` in a class mirror
    pub fn static_field_offset(&self, mirror: ObjectRef, index: usize) -> usize {
        self.class_of(mirror).instance_words() + index
    }

    /// Store a reference into static field `index` of `mirror`
    pub fn write_static_ref(&self, mirror: ObjectRef, index: usize, value: Option<ObjectRef>) {
        self.write_ref(mirror, self.static_field_offset(mirror, index), value);
    }

    /// Load static field `index` of `mirror`
    pub fn read_static_ref(&self, mirror: ObjectRef, index: usize) -> Option<ObjectRef> {
        self.read_ref(mirror, self.static_field_offset(mirror, index))
    }

    // ------------------------------------------------------------------
    // Template space
    // ------------------------------------------------------------------

    /// Prepare for fork: run a full collection, then move every tenured
    /// object into the template space and freeze it. Does nothing unless
    /// the template space is still in its initial state.
    pub fn wait_for_gc_on_fork(&self, task: GcTask) -> bool {
        if self.rendezvous.holds_mutator_share() {
            let _native = self.rendezvous.release_managed();
            self.fork_collect(task)
        } else {
            self.fork_collect(task)
        }
    }

    fn fork_collect(&self, task: GcTask) -> bool {
        if self.heap.template_state() != TemplateSpaceState::Init {
            return false;
        }
        self.heap.set_template_state(TemplateSpaceState::Forking);
        // a cycle that started before Forking was set may not have been full
        while !self.wait_for_gc(task.clone()) {
            tracing::debug!(target: "strata::gc", "fork collection deduplicated, running it again");
        }

        self.wait_for_idle();
        self.rendezvous.safepoint_begin();
        let moved = self.move_objects_to_template_space();
        self.heap.set_template_state(TemplateSpaceState::Forked);
        self.heap.disable_template_alloc();
        self.rendezvous.safepoint_end();
        self.set_idle();

        tracing::info!(target: "strata::gc", moved, "tenured objects moved to template space");
        true
    }

    /// Move tenured objects into the template space until it fills up and
    /// rewrite every reference to them. Mutators must be stopped.
    fn move_objects_to_template_space(&self) -> usize {
        let heap = self.heap();
        let memory = self.memory();
        let classes = &self.classes;
        let mut sources = Vec::new();
        let mut moved = Vec::new();
        let mut full = false;

        heap.iterate_over_tenured_objects(&mut |obj| {
            if full {
                return;
            }
            let Some(size) = heap.object_size(obj) else {
                fatal!("tenured object {:?} has no recorded size", obj);
            };
            let Some(dst) = heap.alloc_template(size) else {
                full = true;
                return;
            };
            memory.copy_words(obj.addr(), dst.addr(), size / WORD_SIZE);
            memory.set_mark_word(dst, MarkWord::new());
            let old = memory.mark_word(obj);
            if memory
                .compare_exchange(
                    obj.field_addr(MARK_WORD_OFFSET),
                    old.raw(),
                    MarkWord::forwarded_to(dst.addr()).raw(),
                )
                .is_err()
            {
                fatal!("mark word of {:?} changed while moving it", obj);
            }
            fix_meta_self_ref(self, dst);
            sources.push(obj);
            moved.push(dst);
        });
        if full {
            tracing::warn!(target: "strata::gc", "template space full; remaining objects stay tenured");
        }

        let young = memory.young_range();
        for &obj in &moved {
            let class = self.class_of(obj);
            layout::update_refs_in_object(memory, classes, obj, &class);
            let mut holds_young = false;
            layout::for_each_ref_slot(memory, classes, obj, &class, &mut |slot| {
                holds_young |= young.contains_address(slot.target.addr());
            });
            if holds_young {
                self.card_table().mark_card(obj.addr());
            }
        }
        let mut update = |obj: ObjectRef| {
            if memory.forwardee(obj).is_none() {
                let class = self.class_of(obj);
                layout::update_refs_in_object(memory, classes, obj, &class);
            }
        };
        heap.iterate_over_young_objects(&mut update);
        heap.iterate_over_tenured_objects(&mut update);
        self.update_refs_common();

        heap.free_objects(&sources);
        release_free_pools(self);
        if self.marker.is_reversed() {
            self.marker.unmark_template(heap);
        } else {
            self.marker.clear_bitmaps();
        }
        moved.len()
    }
}

/// Restores `Running` and notifies listeners when dropped
pub struct PhaseScope<'a> {
    cx: &'a GcContext,
    phase: GcPhase,
}

impl Drop for PhaseScope<'_> {
    fn drop(&mut self) {
        for listener in self.cx.listeners.read().iter() {
            listener.gc_phase_finished(self.phase);
        }
        tracing::debug!(target: "strata::gc", phase = ?self.phase, "phase finished");
        self.cx.phase.store(GcPhase::Running as u8, Ordering::Release);
    }
}
