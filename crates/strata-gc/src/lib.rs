//! # Strata VM Garbage Collector
//!
//! Tracing collectors for a VM that runs statically- and dynamically-typed
//! code on one shared heap.
//!
//! ## Design
//!
//! - **Collectors**: stop-the-world mark-sweep, generational (young
//!   copying plus concurrent tenured mark-sweep) and a no-op baseline,
//!   all driven by one cycle driver in [`GcContext`]
//! - **Marking**: a worklist tracer that only branches on class layout when
//!   enumerating reference fields; optionally parallel
//! - **Remembered set**: a card table dirtied by the post-write barrier
//! - **Scheduling**: a background worker fed through a channel, or
//!   collections run in place on the requesting thread
//! - **Heap**: a word-addressed simulated heap with young, tenured and
//!   template spaces behind the [`ObjectAllocator`] trait

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod barrier;
pub mod bitmap;
pub mod card_table;
pub mod class;
pub mod collector;
pub mod context;
pub mod error;
pub mod heap;
pub mod layout;
pub mod listener;
pub mod marker;
pub mod marking_stack;
pub mod mem_range;
pub mod object;
pub mod references;
pub mod rendezvous;
pub mod roots;
pub mod runtime;
pub mod scheduler;
pub mod settings;
pub mod stats;
pub mod task;
pub mod verify;
pub mod workers;

#[doc(hidden)]
pub use tracing as __tracing;

pub use class::{ClassDescriptor, ClassId, ClassRegistry, DynamicClass, DynamicFlags, StaticClass};
pub use collector::{Collector, GcPhase};
pub use context::GcContext;
pub use error::{GcError, GcResult};
pub use heap::{GenerationalHeap, ObjectAllocator, TemplateSpaceState};
pub use listener::GcListener;
pub use object::{ObjectRef, TaggedValue};
pub use roots::{ManagedThread, RuntimeRoots};
pub use runtime::Runtime;
pub use settings::{GcSettings, GcType, NativeGcTriggerType};
pub use stats::GcStats;
pub use task::{CollectionType, GcTask, GcTaskCause};
