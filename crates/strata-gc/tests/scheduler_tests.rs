//! Scheduling tests: request deduplication, the background worker and
//! collection triggers.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use strata_gc::class::StaticClass;
use strata_gc::verify::verify_heap;
use strata_gc::{
    ClassId, CollectionType, GcContext, GcListener, GcSettings, GcTask, GcTaskCause, GcType,
    NativeGcTriggerType, ObjectAllocator, Runtime, TemplateSpaceState,
};

const NEXT: usize = 2;
const VALUE: usize = 3;

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn register_node(cx: &GcContext) -> ClassId {
    cx.classes().register_static(
        "Node",
        2,
        StaticClass {
            instance_ref_offsets: vec![NEXT],
            ..Default::default()
        },
    )
}

/// Records the cause of every finished cycle
#[derive(Default)]
struct CauseRecorder {
    causes: Mutex<Vec<GcTaskCause>>,
}

impl GcListener for CauseRecorder {
    fn gc_finished(&self, task: &GcTask, _before: usize, _after: usize) {
        self.causes.lock().push(task.cause);
    }
}

/// Holds the first cycle in `gc_started` until opened
#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
    entered: AtomicBool,
}

impl Gate {
    fn open(&self) {
        *self.open.lock() = true;
        self.cv.notify_all();
    }
}

impl GcListener for Gate {
    fn gc_started(&self, _heap_size: usize) {
        self.entered.store(true, Ordering::Release);
        let mut open = self.open.lock();
        while !*open {
            self.cv.wait(&mut open);
        }
    }
}

// ============================================================================
// Request deduplication
// ============================================================================

/// Blocks the first cycle until another request is waiting for idle
#[derive(Default)]
struct HoldFirstCycle {
    cx: OnceLock<Weak<GcContext>>,
    held: AtomicBool,
}

impl GcListener for HoldFirstCycle {
    fn gc_started(&self, _heap_size: usize) {
        if self.held.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(cx) = self.cx.get().and_then(Weak::upgrade) else {
            return;
        };
        assert!(wait_until(Duration::from_secs(5), || cx.idle_waiters() >= 1));
    }
}

#[test]
fn test_concurrent_requests_run_one_cycle() {
    let rt = Runtime::create(GcSettings {
        run_gc_in_place: true,
        ..GcSettings::small(GcType::Stw)
    })
    .unwrap();
    let cx = rt.context().clone();
    let hold = Arc::new(HoldFirstCycle::default());
    hold.cx.set(Arc::downgrade(&cx)).unwrap();
    cx.add_listener(hold);

    let results: Vec<bool> = thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| s.spawn(|| cx.collect_garbage(GcTaskCause::Explicit)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|&&ran| ran).count(), 1);
    assert_eq!(cx.gc_counter(), 1);
}

#[test]
fn test_sequential_requests_each_run() {
    let rt = Runtime::create(GcSettings {
        run_gc_in_place: true,
        ..GcSettings::small(GcType::Stw)
    })
    .unwrap();
    assert!(rt.gc());
    assert!(rt.gc());
    assert_eq!(rt.context().gc_counter(), 2);
    assert_eq!(rt.context().stats().full_collections, 2);
}

#[test]
fn test_fork_collection_runs_after_overlapping_cycle() {
    let rt = Runtime::create(GcSettings {
        run_gc_in_place: true,
        concurrency_enabled: false,
        ..GcSettings::small(GcType::Gen)
    })
    .unwrap();
    let cx = rt.context().clone();
    let gate = Arc::new(Gate::default());
    let recorder = Arc::new(CauseRecorder::default());
    cx.add_listener(gate.clone());
    cx.add_listener(recorder.clone());

    thread::scope(|s| {
        let explicit = s.spawn(|| cx.collect_garbage(GcTaskCause::Explicit));
        assert!(wait_until(Duration::from_secs(5), || gate.entered.load(Ordering::Acquire)));

        // the fork request samples the counter while the explicit cycle runs
        let fork = s.spawn(|| cx.wait_for_gc_on_fork(GcTask::new(GcTaskCause::PygoteFork)));
        assert!(wait_until(Duration::from_secs(5), || cx.idle_waiters() >= 1));
        gate.open();

        assert!(explicit.join().unwrap());
        assert!(fork.join().unwrap());
    });

    assert_eq!(cx.gc_counter(), 2);
    assert_eq!(
        *recorder.causes.lock(),
        vec![GcTaskCause::Explicit, GcTaskCause::PygoteFork]
    );
    assert_eq!(cx.heap().template_state(), TemplateSpaceState::Forked);
}

// ============================================================================
// Worker
// ============================================================================

#[test]
fn test_worker_runs_queued_task() {
    let rt = Runtime::create(GcSettings::small(GcType::Stw)).unwrap();
    assert!(rt.has_worker());
    let cx = rt.context();

    assert!(cx.add_gc_task(GcTask::new(GcTaskCause::Explicit), false, false));
    assert!(wait_until(Duration::from_secs(5), || cx.gc_counter() == 1));
    assert_eq!(cx.last_cause(), GcTaskCause::Explicit);
}

#[test]
fn test_delayed_task_runs_after_ready_ones() {
    let rt = Runtime::create(GcSettings::small(GcType::Stw)).unwrap();
    let cx = rt.context();
    let recorder = Arc::new(CauseRecorder::default());
    cx.add_listener(recorder.clone());

    assert!(cx.add_gc_task(
        GcTask::delayed(GcTaskCause::Oom, Duration::from_millis(150)),
        false,
        false
    ));
    assert!(cx.add_gc_task(GcTask::new(GcTaskCause::Young), false, false));
    assert!(cx.add_gc_task(GcTask::new(GcTaskCause::Explicit), false, false));

    assert!(wait_until(Duration::from_secs(5), || cx.gc_counter() == 3));
    assert_eq!(
        *recorder.causes.lock(),
        vec![GcTaskCause::Young, GcTaskCause::Explicit, GcTaskCause::Oom]
    );
}

#[test]
fn test_threshold_tasks_are_coalesced() {
    let rt = Runtime::create(GcSettings::small(GcType::Stw)).unwrap();
    let cx = rt.context();
    let gate = Arc::new(Gate::default());
    cx.add_listener(gate.clone());

    let threshold = || GcTask::new(GcTaskCause::HeapUsageThreshold);
    assert!(cx.add_gc_task(threshold(), false, true));
    assert!(wait_until(Duration::from_secs(5), || gate.entered.load(Ordering::Acquire)));

    // the first threshold task is still running
    assert!(!cx.add_gc_task(threshold(), false, true));
    // other requests are not affected
    assert!(cx.add_gc_task(GcTask::new(GcTaskCause::Explicit), false, false));

    gate.open();
    assert!(wait_until(Duration::from_secs(5), || cx.gc_counter() == 2));
    assert!(wait_until(Duration::from_secs(5), || cx.add_gc_task(threshold(), false, true)));
    assert!(wait_until(Duration::from_secs(5), || cx.gc_counter() == 3));
}

#[test]
fn test_shutdown_rejects_tasks() {
    let mut rt = Runtime::create(GcSettings::small(GcType::Gen)).unwrap();
    rt.shutdown();
    assert!(!rt.has_worker());
    assert!(!rt
        .context()
        .add_gc_task(GcTask::new(GcTaskCause::Explicit), false, false));
    assert_eq!(rt.context().gc_counter(), 0);
}

// ============================================================================
// Triggers
// ============================================================================

#[test]
fn test_native_allocation_triggers_collection() {
    let rt = Runtime::create(GcSettings {
        run_gc_in_place: true,
        concurrency_enabled: false,
        native_gc_trigger: NativeGcTriggerType::SimpleStrategy,
        native_watermark: 1024,
        ..GcSettings::small(GcType::Gen)
    })
    .unwrap();
    let cx = rt.context();

    cx.register_native_allocation(512);
    assert_eq!(cx.gc_counter(), 0);
    cx.register_native_allocation(1024);
    assert_eq!(cx.gc_counter(), 1);
    assert_eq!(cx.last_cause(), GcTaskCause::NativeAlloc);
    assert_eq!(cx.stats().last_collection_type, Some(CollectionType::Tenured));

    // the watermark is measured from the last collection
    cx.register_native_allocation(512);
    assert_eq!(cx.gc_counter(), 1);

    cx.register_native_free(10_000);
    assert_eq!(cx.native_bytes(), 0);
}

#[test]
fn test_native_trigger_can_be_disabled() {
    let rt = Runtime::create(GcSettings {
        run_gc_in_place: true,
        native_gc_trigger: NativeGcTriggerType::NoNativeGcTrigger,
        native_watermark: 1024,
        ..GcSettings::small(GcType::Gen)
    })
    .unwrap();
    let cx = rt.context();
    cx.register_native_allocation(1024 * 1024);
    assert_eq!(cx.gc_counter(), 0);
    assert_eq!(cx.native_bytes(), 1024 * 1024);
}

#[test]
fn test_tenured_collections_wait_for_startup() {
    let rt = Runtime::create(GcSettings {
        concurrency_enabled: false,
        startup_gc_delay_ms: 200,
        ..GcSettings::small(GcType::Gen)
    })
    .unwrap();
    let cx = rt.context();
    let recorder = Arc::new(CauseRecorder::default());
    cx.add_listener(recorder.clone());

    cx.pre_startup();
    assert!(cx.collect_garbage(GcTaskCause::HeapUsageThreshold));
    assert_eq!(cx.stats().last_collection_type, Some(CollectionType::Young));

    assert!(wait_until(Duration::from_secs(5), || cx.gc_counter() == 2));
    assert_eq!(recorder.causes.lock()[1], GcTaskCause::StartupComplete);
    assert_eq!(cx.stats().last_collection_type, Some(CollectionType::Full));

    assert!(cx.collect_garbage(GcTaskCause::HeapUsageThreshold));
    assert_eq!(cx.stats().last_collection_type, Some(CollectionType::Tenured));
}

#[test]
fn test_in_place_startup_is_completed_by_embedder() {
    let rt = Runtime::create(GcSettings {
        run_gc_in_place: true,
        concurrency_enabled: false,
        ..GcSettings::small(GcType::Gen)
    })
    .unwrap();
    let cx = rt.context();

    cx.pre_startup();
    assert!(cx.collect_garbage(GcTaskCause::NativeAlloc));
    assert_eq!(cx.stats().last_collection_type, Some(CollectionType::Young));

    cx.on_startup_complete();
    assert!(cx.collect_garbage(GcTaskCause::NativeAlloc));
    assert_eq!(cx.stats().last_collection_type, Some(CollectionType::Tenured));
}

// ============================================================================
// Mutators racing the worker
// ============================================================================

fn mutate(cx: &GcContext, node: ClassId, rounds: usize) {
    let thread = cx.roots().attach_thread();
    let slot = thread.push_ref(None);
    let managed = cx.rendezvous().enter_managed();

    for i in 0..rounds {
        let obj = cx.alloc_object(node).unwrap();
        cx.write_word(obj, VALUE, i);
        cx.write_ref(obj, NEXT, thread.get_ref(slot));
        thread.set_ref(slot, Some(obj));

        if i % 50 == 49 {
            let mut expected = i;
            let mut current = thread.get_ref(slot);
            while let Some(obj) = current {
                assert_eq!(cx.read_word(obj, VALUE), expected);
                expected = expected.wrapping_sub(1);
                current = cx.read_ref(obj, NEXT);
            }
            assert_eq!(expected, i.wrapping_sub(50));
            thread.set_ref(slot, None);
        }
        if i % 200 == 0 {
            cx.add_gc_task(GcTask::new(GcTaskCause::Young), true, false);
        }
        cx.rendezvous().safepoint_poll();
    }

    drop(managed);
    cx.roots().detach_thread(&thread);
}

#[test]
fn test_mutators_with_concurrent_generational_worker() {
    let rt = Runtime::create(GcSettings {
        concurrency_enabled: true,
        ..GcSettings::small(GcType::Gen)
    })
    .unwrap();
    let cx = rt.context().clone();
    let node = register_node(&cx);

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| mutate(&cx, node, 3000));
        }
        s.spawn(|| {
            for _ in 0..5 {
                cx.collect_garbage(GcTaskCause::HeapUsageThreshold);
                thread::sleep(Duration::from_millis(5));
            }
        });
    });

    assert!(rt.gc());
    assert!(cx.gc_counter() > 0);
    assert_eq!(verify_heap(&cx), 0);
    assert_eq!(cx.heap().young_used(), 0);
}
