//! Runtime roots
//!
//! Everything outside the heap that can hold a heap reference: thread
//! stack slots, class mirrors, global handles, inflated monitors and the
//! interned string table. The string table is weak: it is swept, not
//! marked, unless a collector explicitly visits it.

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::heap::HeapMemory;
use crate::object::{ObjectRef, ObjectStatus, TaggedValue};

/// Where a root lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootType {
    /// Thread stack slot
    Frame,
    /// Class mirror registered by the class loader
    ClassMirror,
    /// Global handle
    GlobalHandle,
    /// Inflated monitor
    Monitor,
    /// Interned string
    StringTable,
    /// Cleared reference waiting to be enqueued
    PendingReference,
}

/// Root reported to a visitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcRoot {
    /// Root kind
    pub root_type: RootType,
    /// Referenced object
    pub object: ObjectRef,
}

/// Controls which class roots and string entries a visit reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisitRootFlags(u8);

impl VisitRootFlags {
    /// Report every class mirror and string
    pub const ACCESS_ALL: Self = Self(1);
    /// Report only entries added since recording started
    pub const ACCESS_ONLY_NEW: Self = Self(1 << 1);
    /// Skip class mirrors and strings
    pub const ACCESS_NONE: Self = Self(1 << 2);
    /// Start recording new entries
    pub const START_RECORDING_NEW: Self = Self(1 << 3);
    /// Stop recording and forget recorded entries
    pub const END_RECORDING_NEW: Self = Self(1 << 4);

    /// Check if all bits of `other` are set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for VisitRootFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Entries with optional recording of additions
#[derive(Default)]
struct RecordingList {
    entries: Vec<ObjectRef>,
    recording: bool,
    new: Vec<ObjectRef>,
}

impl RecordingList {
    fn add(&mut self, obj: ObjectRef) {
        self.entries.push(obj);
        if self.recording {
            self.new.push(obj);
        }
    }

    fn select(&mut self, flags: VisitRootFlags) -> Vec<ObjectRef> {
        let selected = if flags.contains(VisitRootFlags::ACCESS_NONE) {
            Vec::new()
        } else if flags.contains(VisitRootFlags::ACCESS_ONLY_NEW) {
            self.new.clone()
        } else {
            self.entries.clone()
        };
        if flags.contains(VisitRootFlags::START_RECORDING_NEW) {
            self.recording = true;
            self.new.clear();
        }
        if flags.contains(VisitRootFlags::END_RECORDING_NEW) {
            self.recording = false;
            self.new.clear();
        }
        selected
    }

    fn update(&mut self, memory: &HeapMemory) {
        for obj in self.entries.iter_mut().chain(self.new.iter_mut()) {
            *obj = forwarded_or_self(memory, *obj);
        }
    }
}

fn forwarded_or_self(memory: &HeapMemory, obj: ObjectRef) -> ObjectRef {
    memory.forwardee(obj).unwrap_or(obj)
}

/// Kind of a thread stack slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Raw reference (0 is null)
    Reference,
    /// Tagged value
    Tagged,
    /// Non-reference payload
    Primitive,
}

#[derive(Debug, Clone, Copy)]
struct StackSlot {
    kind: SlotKind,
    value: usize,
}

/// Stack of a mutator thread as seen by the collector
pub struct ManagedThread {
    id: u32,
    slots: Mutex<Vec<StackSlot>>,
}

impl ManagedThread {
    /// Thread id
    pub fn id(&self) -> u32 {
        self.id
    }

    fn push(&self, kind: SlotKind, value: usize) -> usize {
        let mut slots = self.slots.lock();
        slots.push(StackSlot { kind, value });
        slots.len() - 1
    }

    /// Push a reference slot, returning its index
    pub fn push_ref(&self, obj: Option<ObjectRef>) -> usize {
        self.push(SlotKind::Reference, crate::object::encode_ref(obj))
    }

    /// Push a tagged slot, returning its index
    pub fn push_tagged(&self, value: TaggedValue) -> usize {
        self.push(SlotKind::Tagged, value.raw())
    }

    /// Push a primitive slot, returning its index
    pub fn push_primitive(&self, value: usize) -> usize {
        self.push(SlotKind::Primitive, value)
    }

    fn get(&self, index: usize, kind: SlotKind) -> usize {
        let slots = self.slots.lock();
        let slot = slots[index];
        if slot.kind != kind {
            crate::fatal!("stack slot {} holds {:?}, not {:?}", index, slot.kind, kind);
        }
        slot.value
    }

    /// Read a reference slot
    pub fn get_ref(&self, index: usize) -> Option<ObjectRef> {
        ObjectRef::from_address(self.get(index, SlotKind::Reference))
    }

    /// Read a tagged slot
    pub fn get_tagged(&self, index: usize) -> TaggedValue {
        TaggedValue::from_raw(self.get(index, SlotKind::Tagged))
    }

    /// Overwrite a reference slot
    pub fn set_ref(&self, index: usize, obj: Option<ObjectRef>) {
        self.slots.lock()[index] = StackSlot {
            kind: SlotKind::Reference,
            value: crate::object::encode_ref(obj),
        };
    }

    /// Overwrite a tagged slot
    pub fn set_tagged(&self, index: usize, value: TaggedValue) {
        self.slots.lock()[index] = StackSlot {
            kind: SlotKind::Tagged,
            value: value.raw(),
        };
    }

    /// Number of slots
    pub fn depth(&self) -> usize {
        self.slots.lock().len()
    }

    /// Pop slots down to `depth`
    pub fn truncate(&self, depth: usize) {
        self.slots.lock().truncate(depth);
    }

    fn collect_roots(&self, out: &mut Vec<GcRoot>) {
        for slot in self.slots.lock().iter() {
            let object = match slot.kind {
                SlotKind::Reference => ObjectRef::from_address(slot.value),
                SlotKind::Tagged => TaggedValue::from_raw(slot.value).heap_object(),
                SlotKind::Primitive => None,
            };
            if let Some(object) = object {
                out.push(GcRoot {
                    root_type: RootType::Frame,
                    object,
                });
            }
        }
    }

    fn update(&self, memory: &HeapMemory) {
        for slot in self.slots.lock().iter_mut() {
            match slot.kind {
                SlotKind::Reference => {
                    if let Some(obj) = ObjectRef::from_address(slot.value) {
                        slot.value = forwarded_or_self(memory, obj).addr();
                    }
                }
                SlotKind::Tagged => {
                    let value = TaggedValue::from_raw(slot.value);
                    if let Some(obj) = value.heap_object() {
                        slot.value = value.retarget(forwarded_or_self(memory, obj)).raw();
                    }
                }
                SlotKind::Primitive => {}
            }
        }
    }
}

/// Handle to a global strong reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalHandle(u32);

/// Id of an inflated monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorId(u32);

/// All non-heap root sources of one runtime
pub struct RuntimeRoots {
    threads: RwLock<Vec<Arc<ManagedThread>>>,
    next_thread_id: AtomicU32,
    class_mirrors: Mutex<RecordingList>,
    globals: Mutex<Vec<Option<ObjectRef>>>,
    monitors: Mutex<FxHashMap<u32, ObjectRef>>,
    next_monitor_id: AtomicU32,
    string_table: Mutex<RecordingList>,
}

impl RuntimeRoots {
    /// Create empty root sets
    pub fn new() -> Self {
        Self {
            threads: RwLock::new(Vec::new()),
            next_thread_id: AtomicU32::new(1),
            class_mirrors: Mutex::new(RecordingList::default()),
            globals: Mutex::new(Vec::new()),
            monitors: Mutex::new(FxHashMap::default()),
            next_monitor_id: AtomicU32::new(1),
            string_table: Mutex::new(RecordingList::default()),
        }
    }

    /// Register a thread whose stack is scanned for roots
    pub fn attach_thread(&self) -> Arc<ManagedThread> {
        let thread = Arc::new(ManagedThread {
            id: self.next_thread_id.fetch_add(1, Ordering::Relaxed),
            slots: Mutex::new(Vec::new()),
        });
        self.threads.write().push(thread.clone());
        thread
    }

    /// Stop scanning a thread
    pub fn detach_thread(&self, thread: &ManagedThread) {
        self.threads.write().retain(|t| t.id != thread.id);
    }

    /// Record a class mirror; mirrors are never unloaded
    pub fn add_class_mirror(&self, mirror: ObjectRef) {
        self.class_mirrors.lock().add(mirror);
    }

    /// Create a global strong reference
    pub fn add_global(&self, obj: ObjectRef) -> GlobalHandle {
        let mut globals = self.globals.lock();
        if let Some(idx) = globals.iter().position(Option::is_none) {
            globals[idx] = Some(obj);
            return GlobalHandle(idx as u32);
        }
        globals.push(Some(obj));
        GlobalHandle((globals.len() - 1) as u32)
    }

    /// Read a global
    pub fn global(&self, handle: GlobalHandle) -> Option<ObjectRef> {
        self.globals.lock().get(handle.0 as usize).copied().flatten()
    }

    /// Drop a global
    pub fn remove_global(&self, handle: GlobalHandle) {
        if let Some(slot) = self.globals.lock().get_mut(handle.0 as usize) {
            *slot = None;
        }
    }

    /// Inflate a monitor for `obj`; the object stays alive while it exists
    pub fn inflate_monitor(&self, obj: ObjectRef) -> MonitorId {
        let id = self.next_monitor_id.fetch_add(1, Ordering::Relaxed);
        self.monitors.lock().insert(id, obj);
        MonitorId(id)
    }

    /// Object owning a monitor
    pub fn monitor_object(&self, id: MonitorId) -> Option<ObjectRef> {
        self.monitors.lock().get(&id.0).copied()
    }

    /// Release a monitor
    pub fn deflate_monitor(&self, id: MonitorId) {
        self.monitors.lock().remove(&id.0);
    }

    /// Add a string to the intern table
    pub fn intern_string(&self, string: ObjectRef) {
        self.string_table.lock().add(string);
    }

    /// Interned strings
    pub fn interned_strings(&self) -> Vec<ObjectRef> {
        self.string_table.lock().entries.clone()
    }

    /// Visit strong roots: stacks, class mirrors (per `flags`), globals and
    /// monitors.
    pub fn visit_roots(&self, visitor: &mut dyn FnMut(GcRoot), flags: VisitRootFlags) {
        let mut roots = Vec::new();
        for thread in self.threads.read().iter() {
            thread.collect_roots(&mut roots);
        }
        roots.extend(
            self.class_mirrors
                .lock()
                .select(flags)
                .into_iter()
                .map(|object| GcRoot {
                    root_type: RootType::ClassMirror,
                    object,
                }),
        );
        roots.extend(self.globals.lock().iter().flatten().map(|&object| GcRoot {
            root_type: RootType::GlobalHandle,
            object,
        }));
        roots.extend(self.monitors.lock().values().map(|&object| GcRoot {
            root_type: RootType::Monitor,
            object,
        }));
        roots.into_iter().for_each(visitor);
    }

    /// Visit interned strings selected by `flags`
    pub fn visit_string_table(&self, visitor: &mut dyn FnMut(GcRoot), flags: VisitRootFlags) {
        let strings = self.string_table.lock().select(flags);
        for object in strings {
            visitor(GcRoot {
                root_type: RootType::StringTable,
                object,
            });
        }
    }

    /// Drop interned strings the checker reports dead; returns how many
    pub fn sweep_string_table(&self, checker: &mut dyn FnMut(ObjectRef) -> ObjectStatus) -> usize {
        let mut table = self.string_table.lock();
        let before = table.entries.len();
        table.entries.retain(|&s| checker(s) == ObjectStatus::Alive);
        table.new.retain(|&s| checker(s) == ObjectStatus::Alive);
        before - table.entries.len()
    }

    /// Rewrite every root whose target has been forwarded
    pub fn update_refs_to_moved(&self, memory: &HeapMemory) {
        for thread in self.threads.read().iter() {
            thread.update(memory);
        }
        self.class_mirrors.lock().update(memory);
        for obj in self.globals.lock().iter_mut().flatten() {
            *obj = forwarded_or_self(memory, *obj);
        }
        for obj in self.monitors.lock().values_mut() {
            *obj = forwarded_or_self(memory, *obj);
        }
        self.string_table.lock().update(memory);
    }
}

impl Default for RuntimeRoots {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::MarkWord;

    fn obj(addr: usize) -> ObjectRef {
        ObjectRef::from_address(addr).unwrap()
    }

    fn collect(roots: &RuntimeRoots, flags: VisitRootFlags) -> Vec<GcRoot> {
        let mut out = Vec::new();
        roots.visit_roots(&mut |r| out.push(r), flags);
        out
    }

    #[test]
    fn test_stack_slots_report_references_only() {
        let roots = RuntimeRoots::new();
        let thread = roots.attach_thread();
        thread.push_ref(Some(obj(0x10010)));
        thread.push_ref(None);
        thread.push_primitive(0x10020);
        thread.push_tagged(TaggedValue::from_int(3));
        thread.push_tagged(TaggedValue::from_weak(obj(0x10030)));

        let found: Vec<_> = collect(&roots, VisitRootFlags::ACCESS_ALL)
            .into_iter()
            .map(|r| r.object.addr())
            .collect();
        assert_eq!(found, vec![0x10010, 0x10030]);

        roots.detach_thread(&thread);
        assert!(collect(&roots, VisitRootFlags::ACCESS_ALL).is_empty());
    }

    #[test]
    fn test_globals_reuse_slots() {
        let roots = RuntimeRoots::new();
        let a = roots.add_global(obj(0x10010));
        let b = roots.add_global(obj(0x10020));
        roots.remove_global(a);
        assert_eq!(roots.global(a), None);
        let c = roots.add_global(obj(0x10030));
        assert_eq!(c, a);
        assert_eq!(roots.global(b), Some(obj(0x10020)));
    }

    #[test]
    fn test_class_root_recording() {
        let roots = RuntimeRoots::new();
        roots.add_class_mirror(obj(0x10010));
        let all = collect(&roots, VisitRootFlags::ACCESS_ALL | VisitRootFlags::START_RECORDING_NEW);
        assert_eq!(all.len(), 1);

        roots.add_class_mirror(obj(0x10020));
        let new = collect(&roots, VisitRootFlags::ACCESS_ONLY_NEW | VisitRootFlags::END_RECORDING_NEW);
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].object, obj(0x10020));
        assert_eq!(new[0].root_type, RootType::ClassMirror);

        assert!(collect(&roots, VisitRootFlags::ACCESS_NONE).is_empty());
    }

    #[test]
    fn test_sweep_string_table() {
        let roots = RuntimeRoots::new();
        roots.intern_string(obj(0x10010));
        roots.intern_string(obj(0x10020));
        let removed = roots.sweep_string_table(&mut |s| {
            if s.addr() == 0x10010 {
                ObjectStatus::Alive
            } else {
                ObjectStatus::Dead
            }
        });
        assert_eq!(removed, 1);
        assert_eq!(roots.interned_strings(), vec![obj(0x10010)]);
    }

    #[test]
    fn test_update_refs_to_moved() {
        let memory = HeapMemory::new(4096, 4096, 0);
        let young = memory.young_range().start();
        let tenured = memory.tenured_range().start();
        let src = obj(young);
        let dst = obj(tenured);
        memory.set_mark_word(src, MarkWord::forwarded_to(dst.addr()));

        let roots = RuntimeRoots::new();
        let thread = roots.attach_thread();
        let r = thread.push_ref(Some(src));
        let w = thread.push_tagged(TaggedValue::from_weak(src));
        let g = roots.add_global(src);
        let m = roots.inflate_monitor(src);
        roots.intern_string(src);

        roots.update_refs_to_moved(&memory);

        assert_eq!(thread.get_ref(r), Some(dst));
        let tagged = thread.get_tagged(w);
        assert!(tagged.is_weak());
        assert_eq!(tagged.heap_object(), Some(dst));
        assert_eq!(roots.global(g), Some(dst));
        assert_eq!(roots.monitor_object(m), Some(dst));
        assert_eq!(roots.interned_strings(), vec![dst]);
    }
}
