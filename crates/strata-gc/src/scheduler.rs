//! Collection scheduling
//!
//! Tasks reach the background worker through an unbounded channel. The
//! worker keeps tasks that are not due yet in a pending list and sleeps on
//! the channel until the earliest target time, so a new message or a due
//! task wakes it. Ready tasks run in arrival order.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::context::GcContext;
use crate::error::{GcError, GcResult};
use crate::task::{GcTask, GcTaskCause};

enum QueueMessage {
    Task(Box<GcTask>),
    Signal,
}

/// Task channel shared by requesters and the worker
pub struct GcQueue {
    sender: Sender<QueueMessage>,
    receiver: Receiver<QueueMessage>,
    running: AtomicBool,
}

impl GcQueue {
    /// Create a stopped queue
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            running: AtomicBool::new(false),
        }
    }

    /// Check if a worker is consuming tasks
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// Queue a task; false once the queue has stopped
    pub fn push(&self, task: GcTask) -> bool {
        self.is_running() && self.sender.send(QueueMessage::Task(Box::new(task))).is_ok()
    }

    /// Wake the worker without a task
    fn signal(&self) {
        let _ = self.sender.send(QueueMessage::Signal);
    }

    /// Next ready task, blocking until one is due. `None` once stopped.
    fn get_task(&self, pending: &mut Vec<GcTask>) -> Option<GcTask> {
        loop {
            if !self.is_running() {
                return None;
            }
            let now = Instant::now();
            if let Some(idx) = pending.iter().position(|t| t.is_ready(now)) {
                return Some(pending.remove(idx));
            }

            let message = match pending.iter().map(|t| t.target_time).min() {
                Some(next) => match self.receiver.recv_timeout(next.saturating_duration_since(now)) {
                    Ok(message) => message,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return None,
                },
                None => self.receiver.recv().ok()?,
            };
            if let QueueMessage::Task(task) = message {
                pending.push(*task);
            }
        }
    }
}

impl Default for GcQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Background collector thread
pub struct GcWorker {
    cx: Arc<GcContext>,
    handle: Option<JoinHandle<()>>,
}

impl GcWorker {
    /// Start consuming the context's task queue on a new thread
    pub fn start(cx: Arc<GcContext>) -> GcResult<Self> {
        cx.queue().set_running(true);
        let worker_cx = cx.clone();
        let handle = std::thread::Builder::new()
            .name("strata-gc".to_string())
            .spawn(move || worker_loop(worker_cx))
            .map_err(|e| {
                cx.queue().set_running(false);
                GcError::WorkerSpawn(e)
            })?;
        tracing::debug!(target: "strata::gc", "gc worker started");
        Ok(Self {
            cx,
            handle: Some(handle),
        })
    }

    /// Stop the worker and wait for it. Tasks not yet run are dropped.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let queue = self.cx.queue();
        queue.set_running(false);
        queue.signal();
        if handle.join().is_err() {
            tracing::error!(target: "strata::gc", "gc worker panicked");
        }
        tracing::debug!(target: "strata::gc", "gc worker stopped");
    }
}

impl Drop for GcWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(cx: Arc<GcContext>) {
    let mut pending = Vec::new();
    while let Some(task) = cx.queue().get_task(&mut pending) {
        if task.cause == GcTaskCause::Invalid {
            continue;
        }
        tracing::trace!(target: "strata::gc", cause = %task.cause, "running queued task");
        task.run(&cx);
        cx.allow_threshold_tasks();
    }
    if !pending.is_empty() {
        tracing::debug!(target: "strata::gc", dropped = pending.len(), "discarding pending gc tasks");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_stopped_queue_rejects_tasks() {
        let queue = GcQueue::new();
        assert!(!queue.push(GcTask::new(GcTaskCause::Explicit)));
        assert!(queue.get_task(&mut Vec::new()).is_none());
    }

    #[test]
    fn test_ready_tasks_come_out_in_order() {
        let queue = GcQueue::new();
        queue.set_running(true);
        assert!(queue.push(GcTask::new(GcTaskCause::Young)));
        assert!(queue.push(GcTask::new(GcTaskCause::Explicit)));

        let mut pending = Vec::new();
        assert_eq!(queue.get_task(&mut pending).unwrap().cause, GcTaskCause::Young);
        assert_eq!(queue.get_task(&mut pending).unwrap().cause, GcTaskCause::Explicit);
    }

    #[test]
    fn test_delayed_task_waits_for_target_time() {
        let queue = GcQueue::new();
        queue.set_running(true);
        let delay = Duration::from_millis(30);
        queue.push(GcTask::delayed(GcTaskCause::StartupComplete, delay));
        queue.push(GcTask::new(GcTaskCause::Young));

        let start = Instant::now();
        let mut pending = Vec::new();
        assert_eq!(queue.get_task(&mut pending).unwrap().cause, GcTaskCause::Young);
        assert_eq!(
            queue.get_task(&mut pending).unwrap().cause,
            GcTaskCause::StartupComplete
        );
        assert!(start.elapsed() >= delay);
    }

    #[test]
    fn test_signal_after_stop_ends_wait() {
        let queue = Arc::new(GcQueue::new());
        queue.set_running(true);
        let waiter = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.get_task(&mut Vec::new()).is_none())
        };
        std::thread::sleep(Duration::from_millis(10));
        queue.set_running(false);
        queue.signal();
        assert!(waiter.join().unwrap());
    }
}
