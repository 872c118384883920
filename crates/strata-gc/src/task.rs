//! Collection requests

use std::fmt;
use std::time::{Duration, Instant};

use crate::context::GcContext;
use crate::fatal;

/// Why a collection was requested
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcTaskCause {
    /// Placeholder; the worker skips it
    Invalid = 0,
    /// The young space is full
    Young = 1,
    /// Tenured footprint crossed the trigger threshold
    HeapUsageThreshold = 2,
    /// Registered native memory crossed the watermark
    NativeAlloc = 3,
    /// An allocation failed
    Oom = 4,
    /// Requested by the embedder
    Explicit = 5,
    /// Application startup finished
    StartupComplete = 6,
    /// Preparing to fork from a template process
    PygoteFork = 7,
}

impl From<u8> for GcTaskCause {
    fn from(v: u8) -> Self {
        match v {
            0 => GcTaskCause::Invalid,
            1 => GcTaskCause::Young,
            2 => GcTaskCause::HeapUsageThreshold,
            3 => GcTaskCause::NativeAlloc,
            4 => GcTaskCause::Oom,
            5 => GcTaskCause::Explicit,
            6 => GcTaskCause::StartupComplete,
            7 => GcTaskCause::PygoteFork,
            _ => fatal!("unknown gc task cause {}", v),
        }
    }
}

impl fmt::Display for GcTaskCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GcTaskCause::Invalid => "invalid",
            GcTaskCause::Young => "young",
            GcTaskCause::HeapUsageThreshold => "threshold",
            GcTaskCause::NativeAlloc => "native",
            GcTaskCause::Oom => "oom",
            GcTaskCause::Explicit => "explicit",
            GcTaskCause::StartupComplete => "startup",
            GcTaskCause::PygoteFork => "fork",
        };
        f.write_str(name)
    }
}

/// What a cycle actually collected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionType {
    /// Nothing (epsilon)
    None,
    /// Young space only
    Young,
    /// Young space, then tenured
    Tenured,
    /// Every space in one pause
    Full,
}

/// Extra work attached to a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcTaskKind {
    /// Plain collection
    Regular,
    /// Re-enables deferred collection work before collecting
    PostStartup,
}

/// Collection request
#[derive(Debug, Clone)]
pub struct GcTask {
    /// Reason
    pub cause: GcTaskCause,
    /// Earliest time the worker may run it
    pub target_time: Instant,
    /// Filled in by the collector
    pub collection_type: CollectionType,
    /// Extra work
    pub kind: GcTaskKind,
}

impl GcTask {
    /// Task due now
    pub fn new(cause: GcTaskCause) -> Self {
        Self::at(cause, Instant::now())
    }

    /// Task due at `target_time`
    pub fn at(cause: GcTaskCause, target_time: Instant) -> Self {
        Self {
            cause,
            target_time,
            collection_type: CollectionType::None,
            kind: GcTaskKind::Regular,
        }
    }

    /// Task due after `delay`
    pub fn delayed(cause: GcTaskCause, delay: Duration) -> Self {
        Self::at(cause, Instant::now() + delay)
    }

    /// Startup-complete task due after `delay`
    pub fn post_startup(delay: Duration) -> Self {
        Self {
            kind: GcTaskKind::PostStartup,
            ..Self::delayed(GcTaskCause::StartupComplete, delay)
        }
    }

    /// Check if the target time has passed
    pub fn is_ready(&self, now: Instant) -> bool {
        self.target_time <= now
    }

    /// Run the task on the calling thread
    pub fn run(self, cx: &GcContext) -> bool {
        if self.kind == GcTaskKind::PostStartup {
            cx.on_startup_complete();
        }
        cx.wait_for_gc(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cause_roundtrips_through_u8() {
        for cause in [
            GcTaskCause::Young,
            GcTaskCause::HeapUsageThreshold,
            GcTaskCause::NativeAlloc,
            GcTaskCause::Oom,
            GcTaskCause::Explicit,
            GcTaskCause::StartupComplete,
            GcTaskCause::PygoteFork,
        ] {
            assert_eq!(GcTaskCause::from(cause as u8), cause);
        }
        assert_eq!(GcTaskCause::from(0), GcTaskCause::Invalid);
    }

    #[test]
    #[should_panic(expected = "unknown gc task cause 200")]
    fn test_unknown_cause_is_fatal() {
        let _ = GcTaskCause::from(200);
    }

    #[test]
    fn test_readiness() {
        let now = Instant::now();
        let task = GcTask::at(GcTaskCause::Explicit, now);
        assert!(task.is_ready(now));
        let later = GcTask::delayed(GcTaskCause::Explicit, Duration::from_secs(60));
        assert!(!later.is_ready(now));
        assert_eq!(later.collection_type, CollectionType::None);
    }

    #[test]
    fn test_post_startup_task() {
        let task = GcTask::post_startup(Duration::from_millis(5));
        assert_eq!(task.cause, GcTaskCause::StartupComplete);
        assert_eq!(task.kind, GcTaskKind::PostStartup);
    }
}
