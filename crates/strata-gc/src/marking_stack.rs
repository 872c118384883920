//! Marking worklist

use crate::object::ObjectRef;
use crate::roots::RootType;

/// How an entry was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkSource {
    /// Pushed straight from a root
    Root(RootType),
    /// Discovered in a field of another object
    Object(ObjectRef),
    /// Recorded by a write barrier during concurrent marking
    Barrier,
}

/// Grey object waiting to be scanned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkEntry {
    /// Referrer
    pub source: MarkSource,
    /// Object to scan
    pub object: ObjectRef,
}

/// LIFO worklist of grey objects
#[derive(Debug, Default)]
pub struct MarkingStack {
    entries: Vec<MarkEntry>,
    task_threshold: Option<usize>,
}

impl MarkingStack {
    /// Stack that never splits
    pub fn new() -> Self {
        Self::default()
    }

    /// Stack whose surplus can be split off once it grows past `threshold`
    pub fn with_task_threshold(threshold: usize) -> Self {
        Self {
            entries: Vec::new(),
            task_threshold: Some(threshold.max(1)),
        }
    }

    /// Push a root
    pub fn push_from_root(&mut self, root_type: RootType, object: ObjectRef) {
        self.entries.push(MarkEntry {
            source: MarkSource::Root(root_type),
            object,
        });
    }

    /// Push an object found in a field of `from`
    pub fn push_from_object(&mut self, from: ObjectRef, object: ObjectRef) {
        self.entries.push(MarkEntry {
            source: MarkSource::Object(from),
            object,
        });
    }

    /// Push an object recorded by a write barrier
    pub fn push_from_barrier(&mut self, object: ObjectRef) {
        self.entries.push(MarkEntry {
            source: MarkSource::Barrier,
            object,
        });
    }

    /// Pop the next entry
    pub fn pop(&mut self) -> Option<MarkEntry> {
        self.entries.pop()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Split off the older half when the stack exceeds its task threshold
    pub fn split_task(&mut self) -> Option<Vec<MarkEntry>> {
        let threshold = self.task_threshold?;
        if self.entries.len() <= threshold {
            return None;
        }
        let keep = self.entries.len() / 2;
        let mut task: Vec<MarkEntry> = self.entries.drain(..keep).collect();
        task.shrink_to_fit();
        Some(task)
    }

    /// Take every entry
    pub fn take_all(&mut self) -> Vec<MarkEntry> {
        std::mem::take(&mut self.entries)
    }

    /// Append entries
    pub fn extend(&mut self, entries: impl IntoIterator<Item = MarkEntry>) {
        self.entries.extend(entries);
    }
}
