//! Runtime handle

use std::sync::Arc;

use crate::context::GcContext;
use crate::error::GcResult;
use crate::rendezvous::ManagedScope;
use crate::roots::ManagedThread;
use crate::scheduler::GcWorker;
use crate::settings::GcSettings;
use crate::task::GcTaskCause;

/// Owns a [`GcContext`] and, unless collections run in place, the
/// background worker. Dropping the runtime stops the worker.
pub struct Runtime {
    cx: Arc<GcContext>,
    worker: Option<GcWorker>,
}

impl Runtime {
    /// Build the context described by `settings` and start the worker
    pub fn create(settings: GcSettings) -> GcResult<Self> {
        let cx = Arc::new(GcContext::new(settings)?);
        let worker = if cx.settings().run_gc_in_place {
            None
        } else {
            Some(GcWorker::start(cx.clone())?)
        };
        tracing::info!(
            target: "strata::gc",
            gc_type = ?cx.gc_type(),
            in_place = worker.is_none(),
            "runtime created"
        );
        Ok(Self { cx, worker })
    }

    /// Collector context
    pub fn context(&self) -> &Arc<GcContext> {
        &self.cx
    }

    /// Run an explicit collection now
    pub fn gc(&self) -> bool {
        self.cx.collect_garbage(GcTaskCause::Explicit)
    }

    /// Register the calling thread's stack with the root set
    pub fn attach_thread(&self) -> Arc<ManagedThread> {
        self.cx.roots().attach_thread()
    }

    /// Hold the mutator share until the guard drops
    pub fn enter_managed(&self) -> ManagedScope<'_> {
        self.cx.rendezvous().enter_managed()
    }

    /// Check if a background worker is running
    pub fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    /// Stop the background worker; later tasks are rejected
    pub fn shutdown(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
