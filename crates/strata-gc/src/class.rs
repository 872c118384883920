//! Class descriptors
//!
//! A class is either *static* (fixed field offsets, inheritance chain,
//! class-level fields stored in a mirror object) or *dynamic* (a tagged
//! body indexed by slot, some slots holding native data). The layout
//! decides how the marker and the update pass enumerate reference fields.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::{GcError, GcResult};
use crate::object::HEADER_WORDS;

/// Index into the [`ClassRegistry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

/// Weak reference flavours recognised by the reference processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    /// Cleared as soon as the referent is otherwise unreachable
    Weak,
    /// Cleared only when the collection was caused by memory pressure
    Soft,
    /// Keeps the referent alive once more and queues it for finalization
    Finalizer,
    /// Cleared, referent never resurrected
    Phantom,
}

/// Element kind of a static array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    /// Elements are raw references
    Reference,
    /// Elements carry no references
    Primitive,
}

/// Layout of a statically-typed class
#[derive(Debug, Clone, Default)]
pub struct StaticClass {
    /// Parent class; its instance fields precede ours
    pub super_class: Option<ClassId>,
    /// Word offsets of reference fields declared by this class only
    pub instance_ref_offsets: Vec<usize>,
    /// Number of class-level (static) field words stored in the mirror
    pub static_words: usize,
    /// Indices of reference fields among the static words
    pub static_ref_offsets: Vec<usize>,
    /// Element kind when this is an array class
    pub array_component: Option<ComponentKind>,
    /// Instances are class mirrors describing another static class
    pub is_class_class: bool,
    /// Set for reference wrapper classes
    pub reference_kind: Option<ReferenceKind>,
}

/// Flags of a dynamically-typed class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DynamicFlags {
    /// Tagged elements follow a length word
    pub is_array: bool,
    /// Raw character data, no references
    pub is_string: bool,
    /// Instances are hidden classes; body slot 0 points back at the object
    pub is_meta_class: bool,
    /// Instances can be invoked
    pub is_callable: bool,
}

/// Layout of a dynamically-typed class
#[derive(Debug, Clone, Default)]
pub struct DynamicClass {
    /// Number of tagged body slots
    pub body_slots: usize,
    /// Bit `i` set means body slot `i` holds native data
    pub native_field_mask: u64,
    /// Kind flags
    pub flags: DynamicFlags,
}

impl DynamicClass {
    /// Check if body slot `index` is native data
    pub fn is_native_slot(&self, index: usize) -> bool {
        index < u64::BITS as usize && self.native_field_mask & (1 << index) != 0
    }
}

/// Static or dynamic layout
#[derive(Debug, Clone)]
pub enum ClassLayout {
    /// Statically-typed layout
    Static(StaticClass),
    /// Dynamically-typed layout
    Dynamic(DynamicClass),
}

/// Registered class
#[derive(Debug, Clone)]
pub struct ClassDescriptor {
    id: ClassId,
    name: String,
    instance_words: usize,
    layout: ClassLayout,
}

impl ClassDescriptor {
    /// Class id
    pub fn id(&self) -> ClassId {
        self.id
    }

    /// Class name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size in words of a fixed-size instance, header included
    pub fn instance_words(&self) -> usize {
        self.instance_words
    }

    /// Layout variant
    pub fn layout(&self) -> &ClassLayout {
        &self.layout
    }

    /// Static layout, if any
    pub fn as_static(&self) -> Option<&StaticClass> {
        match &self.layout {
            ClassLayout::Static(s) => Some(s),
            ClassLayout::Dynamic(_) => None,
        }
    }

    /// Dynamic layout, if any
    pub fn as_dynamic(&self) -> Option<&DynamicClass> {
        match &self.layout {
            ClassLayout::Dynamic(d) => Some(d),
            ClassLayout::Static(_) => None,
        }
    }

    /// Check if instances are dynamic objects
    pub fn is_dynamic(&self) -> bool {
        matches!(self.layout, ClassLayout::Dynamic(_))
    }

    /// Check if instances carry a length word
    pub fn is_variable_size(&self) -> bool {
        match &self.layout {
            ClassLayout::Static(s) => s.array_component.is_some(),
            ClassLayout::Dynamic(d) => d.flags.is_array || d.flags.is_string,
        }
    }

    /// Reference wrapper kind
    pub fn reference_kind(&self) -> Option<ReferenceKind> {
        self.as_static().and_then(|s| s.reference_kind)
    }
}

/// Class table shared by the runtime and the collector
pub struct ClassRegistry {
    classes: RwLock<Vec<Arc<ClassDescriptor>>>,
}

impl ClassRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            classes: RwLock::new(Vec::new()),
        }
    }

    /// Register a static class whose instances have `field_words` body
    /// words (inherited fields included).
    pub fn register_static(
        &self,
        name: impl Into<String>,
        field_words: usize,
        class: StaticClass,
    ) -> ClassId {
        self.register(name.into(), HEADER_WORDS + field_words, ClassLayout::Static(class))
    }

    /// Register a dynamic class
    pub fn register_dynamic(&self, name: impl Into<String>, class: DynamicClass) -> ClassId {
        let words = HEADER_WORDS + class.body_slots;
        self.register(name.into(), words, ClassLayout::Dynamic(class))
    }

    fn register(&self, name: String, instance_words: usize, layout: ClassLayout) -> ClassId {
        let mut classes = self.classes.write();
        let id = ClassId(classes.len() as u32);
        classes.push(Arc::new(ClassDescriptor {
            id,
            name,
            instance_words,
            layout,
        }));
        id
    }

    /// Look up a class
    pub fn get(&self, id: ClassId) -> GcResult<Arc<ClassDescriptor>> {
        self.classes
            .read()
            .get(id.0 as usize)
            .cloned()
            .ok_or(GcError::UnknownClass(id.0))
    }

    /// Number of registered classes
    pub fn len(&self) -> usize {
        self.classes.read().len()
    }

    /// Check if no class is registered
    pub fn is_empty(&self) -> bool {
        self.classes.read().is_empty()
    }

    /// Walk a static class and its ancestors, most derived first.
    ///
    /// Stops at the first id that is not a registered static class.
    pub fn for_each_in_chain(&self, id: ClassId, mut f: impl FnMut(&StaticClass)) {
        let classes = self.classes.read();
        let mut current = Some(id);
        while let Some(id) = current {
            let Some(ClassLayout::Static(s)) = classes.get(id.0 as usize).map(|c| &c.layout) else {
                break;
            };
            f(s);
            current = s.super_class;
        }
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}
