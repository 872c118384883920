//! Parallel marking
//!
//! Marking stacks that grow past the task threshold hand their older half
//! to a shared pool; idle workers pick tasks from it. Workers stop once
//! the pool is empty and nobody is still scanning.

use crossbeam_utils::Backoff;
use parking_lot::Mutex;

use crate::context::GcContext;
use crate::marker::ObjectPredicate;
use crate::marking_stack::{MarkEntry, MarkingStack};

struct TaskPool {
    tasks: Vec<Vec<MarkEntry>>,
    busy: usize,
}

/// Drain `stack` using the calling thread plus `workers` extra threads.
/// Returns the number of objects scanned.
///
/// The marker must be in atomic mode.
pub fn drain_parallel(
    cx: &GcContext,
    stack: &mut MarkingStack,
    workers: usize,
    threshold: usize,
    ref_pred: ObjectPredicate<'_>,
    filter: ObjectPredicate<'_>,
) -> usize {
    debug_assert!(cx.marker().is_atomic());
    let pool = Mutex::new(TaskPool {
        tasks: vec![stack.take_all()],
        busy: 0,
    });

    let scanned = crossbeam_utils::thread::scope(|s| {
        let handles: Vec<_> = (0..workers)
            .map(|_| s.spawn(|_| worker_loop(cx, &pool, threshold, ref_pred, filter)))
            .collect();
        let own = worker_loop(cx, &pool, threshold, ref_pred, filter);
        own + handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| crate::fatal!("marking worker panicked")))
            .sum::<usize>()
    })
    .unwrap_or_else(|_| crate::fatal!("marking worker scope panicked"));

    tracing::trace!(target: "strata::gc", workers, scanned, "parallel marking finished");
    scanned
}

fn worker_loop(
    cx: &GcContext,
    pool: &Mutex<TaskPool>,
    threshold: usize,
    ref_pred: ObjectPredicate<'_>,
    filter: ObjectPredicate<'_>,
) -> usize {
    let marker = cx.marker();
    let backoff = Backoff::new();
    let mut scanned = 0;
    loop {
        let task = {
            let mut pool = pool.lock();
            match pool.tasks.pop() {
                Some(task) => {
                    pool.busy += 1;
                    Some(task)
                }
                None if pool.busy == 0 => return scanned,
                None => None,
            }
        };
        let Some(task) = task else {
            backoff.snooze();
            continue;
        };
        backoff.reset();

        let mut local = MarkingStack::with_task_threshold(threshold);
        local.extend(task);
        while let Some(entry) = local.pop() {
            let class = cx.class_of(entry.object);
            marker.visit(cx, &mut local, entry.object, &class, ref_pred, filter);
            scanned += 1;
            if let Some(split) = local.split_task() {
                pool.lock().tasks.push(split);
            }
        }
        pool.lock().busy -= 1;
    }
}
