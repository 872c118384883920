//! Reference field enumeration and the update-after-move pass
//!
//! The marker, the update pass and the heap verifier all walk object
//! fields through [`for_each_ref_slot`]; it is the only place that knows
//! the difference between static and dynamic layouts.
//!
//! ## Layouts
//!
//! - Static instance: declared reference offsets along the super chain.
//! - Static array: length at word 2, raw references after it.
//! - Static class mirror: word 2 holds the described class id, the mirror
//!   class's own fields follow, then the described class's static words.
//! - Dynamic object: tagged body slots, skipping native ones.
//! - Dynamic array: length at word 2, tagged elements after it.
//! - Dynamic string: length in bytes at word 2, raw characters after it.

use std::sync::atomic::Ordering;

use crate::class::{ClassDescriptor, ClassId, ClassLayout, ClassRegistry, ComponentKind};
use crate::fatal;
use crate::heap::HeapMemory;
use crate::object::{HEADER_WORDS, LENGTH_OFFSET, ObjectRef, TaggedValue, WORD_SIZE};

/// How a reference is encoded in its slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotEncoding {
    /// Raw address, 0 is null
    Raw,
    /// Tagged value; weakness survives rewriting
    Tagged,
}

/// Store flavour used when rewriting a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOrder {
    /// Relaxed store; the slot is only read by its owner
    Plain,
    /// Release store; the slot may be read racily
    Ordered,
}

/// Traversal chosen for an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalKind {
    /// Elements are references
    ReferenceArray,
    /// Class-level object: static mirror or hidden class
    MetaClass,
    /// Regular instance
    Instance,
    /// No reference fields at all
    Leaf,
}

/// Non-null reference held in a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefSlot {
    /// Word offset inside the object
    pub offset: usize,
    /// Encoding of the slot
    pub encoding: SlotEncoding,
    /// Store flavour for rewrites
    pub order: StoreOrder,
    /// Raw slot contents
    pub raw: usize,
    /// Referenced object
    pub target: ObjectRef,
}

impl RefSlot {
    /// Check for a weak tagged reference
    pub fn is_weak(&self) -> bool {
        self.encoding == SlotEncoding::Tagged && TaggedValue::from_raw(self.raw).is_weak()
    }
}

/// Pick the traversal for instances of `class`
pub fn traversal_kind(class: &ClassDescriptor) -> TraversalKind {
    match class.layout() {
        ClassLayout::Static(s) => match s.array_component {
            Some(ComponentKind::Reference) => TraversalKind::ReferenceArray,
            Some(ComponentKind::Primitive) => TraversalKind::Leaf,
            None if s.is_class_class => TraversalKind::MetaClass,
            None => TraversalKind::Instance,
        },
        ClassLayout::Dynamic(d) => {
            if d.flags.is_string {
                TraversalKind::Leaf
            } else if d.flags.is_array {
                TraversalKind::ReferenceArray
            } else if d.flags.is_meta_class {
                TraversalKind::MetaClass
            } else {
                TraversalKind::Instance
            }
        }
    }
}

fn described_class(memory: &HeapMemory, mirror: ObjectRef) -> ClassId {
    ClassId(memory.read_word(mirror, LENGTH_OFFSET) as u32)
}

fn static_words_of(classes: &ClassRegistry, described: ClassId) -> usize {
    match classes.get(described) {
        Ok(class) => match class.as_static() {
            Some(s) => s.static_words,
            None => fatal!("class mirror describes dynamic class {:?}", described),
        },
        Err(_) => fatal!("class mirror describes unknown class {:?}", described),
    }
}

/// Total size in words of `obj`, header included
pub fn object_words(
    memory: &HeapMemory,
    classes: &ClassRegistry,
    obj: ObjectRef,
    class: &ClassDescriptor,
) -> usize {
    match class.layout() {
        ClassLayout::Static(s) => {
            if s.array_component.is_some() {
                HEADER_WORDS + 1 + memory.read_word(obj, LENGTH_OFFSET)
            } else if s.is_class_class {
                class.instance_words() + static_words_of(classes, described_class(memory, obj))
            } else {
                class.instance_words()
            }
        }
        ClassLayout::Dynamic(d) => {
            let len = memory.read_word(obj, LENGTH_OFFSET);
            if d.flags.is_string {
                HEADER_WORDS + 1 + len.div_ceil(WORD_SIZE)
            } else if d.flags.is_array {
                HEADER_WORDS + 1 + len
            } else {
                class.instance_words()
            }
        }
    }
}

/// Visit every non-null reference slot of `obj`.
///
/// Unknown classes and declared offsets beyond the object are fatal.
pub fn for_each_ref_slot(
    memory: &HeapMemory,
    classes: &ClassRegistry,
    obj: ObjectRef,
    class: &ClassDescriptor,
    visitor: &mut dyn FnMut(RefSlot),
) {
    let words = object_words(memory, classes, obj, class);
    let mut visit = |offset: usize, encoding: SlotEncoding, order: StoreOrder| {
        if offset < HEADER_WORDS || offset >= words {
            fatal!(
                "field offset {} overruns {:?} ({} words, class {})",
                offset,
                obj,
                words,
                class.name()
            );
        }
        let raw = memory.read_word(obj, offset);
        let target = match encoding {
            SlotEncoding::Raw => ObjectRef::from_address(raw),
            SlotEncoding::Tagged => TaggedValue::from_raw(raw).heap_object(),
        };
        if let Some(target) = target {
            visitor(RefSlot {
                offset,
                encoding,
                order,
                raw,
                target,
            });
        }
    };

    match (class.layout(), traversal_kind(class)) {
        (_, TraversalKind::Leaf) => {}
        (ClassLayout::Static(_), TraversalKind::ReferenceArray) => {
            for offset in HEADER_WORDS + 1..words {
                visit(offset, SlotEncoding::Raw, StoreOrder::Plain);
            }
        }
        (ClassLayout::Static(_), TraversalKind::MetaClass) => {
            if class.instance_words() <= LENGTH_OFFSET {
                fatal!("class mirror class {} has no room for its class id", class.name());
            }
            let mut own = Vec::new();
            classes.for_each_in_chain(class.id(), |c| own.extend_from_slice(&c.instance_ref_offsets));
            for offset in own {
                visit(offset, SlotEncoding::Raw, StoreOrder::Plain);
            }
            let described = described_class(memory, obj);
            let statics = match classes.get(described).ok().and_then(|c| c.as_static().cloned()) {
                Some(s) => s.static_ref_offsets,
                None => fatal!("class mirror {:?} describes invalid class {:?}", obj, described),
            };
            for index in statics {
                visit(class.instance_words() + index, SlotEncoding::Raw, StoreOrder::Ordered);
            }
        }
        (ClassLayout::Static(_), TraversalKind::Instance) => {
            let mut offsets = Vec::new();
            classes.for_each_in_chain(class.id(), |c| offsets.extend_from_slice(&c.instance_ref_offsets));
            for offset in offsets {
                visit(offset, SlotEncoding::Raw, StoreOrder::Plain);
            }
        }
        (ClassLayout::Dynamic(_), TraversalKind::ReferenceArray) => {
            for offset in HEADER_WORDS + 1..words {
                visit(offset, SlotEncoding::Tagged, StoreOrder::Ordered);
            }
        }
        (ClassLayout::Dynamic(d), TraversalKind::MetaClass | TraversalKind::Instance) => {
            for index in 0..d.body_slots {
                if !d.is_native_slot(index) {
                    visit(HEADER_WORDS + index, SlotEncoding::Tagged, StoreOrder::Ordered);
                }
            }
        }
    }
}

/// Rewrite a slot to point at `new`, keeping its encoding
pub fn rewrite_slot(memory: &HeapMemory, obj: ObjectRef, slot: &RefSlot, new: ObjectRef) {
    let value = match slot.encoding {
        SlotEncoding::Raw => new.addr(),
        SlotEncoding::Tagged => TaggedValue::from_raw(slot.raw).retarget(new).raw(),
    };
    let order = match slot.order {
        StoreOrder::Plain => Ordering::Relaxed,
        StoreOrder::Ordered => Ordering::Release,
    };
    memory.store(obj.field_addr(slot.offset), value, order);
}

/// Rewrite every field of `obj` whose target has been forwarded; returns
/// how many slots changed.
pub fn update_refs_in_object(
    memory: &HeapMemory,
    classes: &ClassRegistry,
    obj: ObjectRef,
    class: &ClassDescriptor,
) -> usize {
    let mut updated = 0;
    for_each_ref_slot(memory, classes, obj, class, &mut |slot| {
        if let Some(new) = memory.forwardee(slot.target) {
            rewrite_slot(memory, obj, &slot, new);
            updated += 1;
        }
    });
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{DynamicClass, DynamicFlags, StaticClass};
    use crate::object::MarkWord;

    struct Fixture {
        memory: HeapMemory,
        classes: ClassRegistry,
        next: usize,
    }

    impl Fixture {
        fn new() -> Self {
            let memory = HeapMemory::new(64 * 1024, 64 * 1024, 0);
            let next = memory.young_range().start();
            Self {
                memory,
                classes: ClassRegistry::new(),
                next,
            }
        }

        fn alloc(&mut self, class: ClassId, words: usize) -> ObjectRef {
            let obj = ObjectRef::from_address(self.next).unwrap();
            self.next += words * WORD_SIZE;
            self.memory.init_header(obj, class);
            obj
        }

        fn slots(&self, obj: ObjectRef) -> Vec<(usize, usize)> {
            let class = self.classes.get(self.memory.class_id(obj)).unwrap();
            let mut out = Vec::new();
            for_each_ref_slot(&self.memory, &self.classes, obj, &class, &mut |s| {
                out.push((s.offset, s.target.addr()))
            });
            out
        }
    }

    #[test]
    fn test_static_instance_walks_chain() {
        let mut f = Fixture::new();
        let base = f.classes.register_static(
            "Base",
            1,
            StaticClass {
                instance_ref_offsets: vec![2],
                ..StaticClass::default()
            },
        );
        let derived = f.classes.register_static(
            "Derived",
            3,
            StaticClass {
                super_class: Some(base),
                instance_ref_offsets: vec![4],
                ..StaticClass::default()
            },
        );
        let target = f.alloc(base, 3);
        let obj = f.alloc(derived, 5);
        f.memory.write_word(obj, 2, target.addr());
        f.memory.write_word(obj, 3, 0x1234); // primitive field
        f.memory.write_word(obj, 4, target.addr());

        assert_eq!(f.slots(obj), vec![(4, target.addr()), (2, target.addr())]);
    }

    #[test]
    fn test_static_arrays() {
        let mut f = Fixture::new();
        let plain = f.classes.register_static("Plain", 0, StaticClass::default());
        let refs = f.classes.register_static(
            "Object[]",
            0,
            StaticClass {
                array_component: Some(ComponentKind::Reference),
                ..StaticClass::default()
            },
        );
        let ints = f.classes.register_static(
            "int[]",
            0,
            StaticClass {
                array_component: Some(ComponentKind::Primitive),
                ..StaticClass::default()
            },
        );
        let target = f.alloc(plain, 2);
        let arr = f.alloc(refs, 6);
        f.memory.write_word(arr, LENGTH_OFFSET, 3);
        f.memory.write_word(arr, 3, target.addr());
        f.memory.write_word(arr, 5, target.addr());
        assert_eq!(f.slots(arr), vec![(3, target.addr()), (5, target.addr())]);

        let prim = f.alloc(ints, 5);
        f.memory.write_word(prim, LENGTH_OFFSET, 2);
        f.memory.write_word(prim, 3, target.addr());
        assert!(f.slots(prim).is_empty());
    }

    #[test]
    fn test_class_mirror_statics() {
        let mut f = Fixture::new();
        let class_class = f.classes.register_static(
            "Class",
            2,
            StaticClass {
                is_class_class: true,
                instance_ref_offsets: vec![3],
                ..StaticClass::default()
            },
        );
        let holder = f.classes.register_static(
            "Holder",
            0,
            StaticClass {
                static_words: 3,
                static_ref_offsets: vec![1],
                ..StaticClass::default()
            },
        );
        let target = f.alloc(holder, 2);
        let mirror = f.alloc(class_class, 4 + 3);
        f.memory.write_word(mirror, LENGTH_OFFSET, holder.0 as usize);
        f.memory.write_word(mirror, 3, target.addr());
        f.memory.write_word(mirror, 5, target.addr());

        let mirror_class = f.classes.get(class_class).unwrap();
        assert_eq!(traversal_kind(&mirror_class), TraversalKind::MetaClass);
        assert_eq!(object_words(&f.memory, &f.classes, mirror, &mirror_class), 7);
        assert_eq!(f.slots(mirror), vec![(3, target.addr()), (5, target.addr())]);
    }

    #[test]
    fn test_dynamic_skips_native_slots() {
        let mut f = Fixture::new();
        let js = f.classes.register_dynamic(
            "JsObject",
            DynamicClass {
                body_slots: 3,
                native_field_mask: 0b010,
                ..DynamicClass::default()
            },
        );
        let target = f.alloc(js, 5);
        let obj = f.alloc(js, 5);
        f.memory.write_word(obj, 2, TaggedValue::from_object(target).raw());
        f.memory.write_word(obj, 3, target.addr()); // native, looks like a pointer
        f.memory.write_word(obj, 4, TaggedValue::from_int(7).raw());
        assert_eq!(f.slots(obj), vec![(2, target.addr())]);
    }

    #[test]
    fn test_dynamic_array_and_string() {
        let mut f = Fixture::new();
        let arr_class = f.classes.register_dynamic(
            "JsArray",
            DynamicClass {
                flags: DynamicFlags {
                    is_array: true,
                    ..DynamicFlags::default()
                },
                ..DynamicClass::default()
            },
        );
        let str_class = f.classes.register_dynamic(
            "JsString",
            DynamicClass {
                flags: DynamicFlags {
                    is_string: true,
                    ..DynamicFlags::default()
                },
                ..DynamicClass::default()
            },
        );
        let s = f.alloc(str_class, 5);
        f.memory.write_word(s, LENGTH_OFFSET, 11);
        let s_class = f.classes.get(str_class).unwrap();
        assert_eq!(object_words(&f.memory, &f.classes, s, &s_class), 5);

        let arr = f.alloc(arr_class, 5);
        f.memory.write_word(arr, LENGTH_OFFSET, 2);
        f.memory.write_word(arr, 3, TaggedValue::from_weak(s).raw());
        f.memory.write_word(arr, 4, TaggedValue::NULL.raw());
        assert_eq!(f.slots(arr), vec![(3, s.addr())]);
        assert!(f.slots(s).is_empty());
    }

    #[test]
    fn test_update_keeps_weak_tag() {
        let mut f = Fixture::new();
        let js = f.classes.register_dynamic(
            "JsObject",
            DynamicClass {
                body_slots: 2,
                ..DynamicClass::default()
            },
        );
        let old = f.alloc(js, 4);
        let new = f.alloc(js, 4);
        let holder = f.alloc(js, 4);
        f.memory.write_word(holder, 2, TaggedValue::from_weak(old).raw());
        f.memory.write_word(holder, 3, TaggedValue::from_object(old).raw());
        f.memory.set_mark_word(old, MarkWord::forwarded_to(new.addr()));

        let class = f.classes.get(js).unwrap();
        assert_eq!(update_refs_in_object(&f.memory, &f.classes, holder, &class), 2);

        let weak = f.memory.read_tagged(holder, 2);
        assert!(weak.is_weak());
        assert_eq!(weak.heap_object(), Some(new));
        assert_eq!(f.memory.read_tagged(holder, 3), TaggedValue::from_object(new));
        assert_eq!(update_refs_in_object(&f.memory, &f.classes, holder, &class), 0);
    }

    #[test]
    #[should_panic(expected = "overruns")]
    fn test_field_overrun_is_fatal() {
        let mut f = Fixture::new();
        let broken = f.classes.register_static(
            "Broken",
            1,
            StaticClass {
                instance_ref_offsets: vec![5],
                ..StaticClass::default()
            },
        );
        let obj = f.alloc(broken, 3);
        f.slots(obj);
    }
}
