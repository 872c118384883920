//! Collection observers

use crate::collector::GcPhase;
use crate::task::GcTask;

/// Receives collection lifecycle events.
///
/// Callbacks run on the collecting thread. Mutators are stopped except
/// around [`GcPhase::ConcurrentMark`], whose callbacks may use barriered
/// stores and allocate. No callback may request a collection.
pub trait GcListener: Send + Sync {
    /// A cycle is about to start; `heap_size` is the footprint in bytes
    fn gc_started(&self, _heap_size: usize) {}

    /// A cycle finished
    fn gc_finished(&self, _task: &GcTask, _heap_size_before: usize, _heap_size_after: usize) {}

    /// A phase started
    fn gc_phase_started(&self, _phase: GcPhase) {}

    /// A phase finished
    fn gc_phase_finished(&self, _phase: GcPhase) {}
}
