//! Heap object layout
//!
//! Every object starts with two header words:
//!
//! - word 0: mark word (state bits, header mark bit, forwarding address)
//! - word 1: class word (a [`ClassId`](crate::class::ClassId))
//!
//! The body follows. Reference fields hold raw addresses (0 is null) in
//! static objects and [`TaggedValue`]s in dynamic objects.

use std::fmt;

use crate::mem_range::Address;

/// Size of a heap word in bytes
pub const WORD_SIZE: usize = 8;

/// Header size in words
pub const HEADER_WORDS: usize = 2;

/// Word offset of the mark word
pub const MARK_WORD_OFFSET: usize = 0;

/// Word offset of the class word
pub const CLASS_WORD_OFFSET: usize = 1;

/// Word offset of the length word in arrays and strings, and of the
/// described class in static class mirrors
pub const LENGTH_OFFSET: usize = 2;

/// Reference to a heap object (address of its mark word)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(Address);

impl ObjectRef {
    /// Wrap a raw address; returns `None` for null
    #[inline]
    pub fn from_address(addr: Address) -> Option<Self> {
        (addr != 0).then_some(Self(addr))
    }

    /// Address of the mark word
    #[inline]
    pub const fn addr(self) -> Address {
        self.0
    }

    /// Address of the word at `offset` (in words)
    #[inline]
    pub const fn field_addr(self, offset: usize) -> Address {
        self.0 + offset * WORD_SIZE
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.0)
    }
}

/// Raw encoding of an optional reference field
#[inline]
pub fn encode_ref(obj: Option<ObjectRef>) -> usize {
    obj.map_or(0, ObjectRef::addr)
}

/// Forwarding state stored in the mark word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Regular object
    Normal,
    /// Object has been copied; the mark word holds the new address
    Forwarded,
}

/// Liveness verdict handed to sweepers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStatus {
    /// Keep the object
    Alive,
    /// Reclaim the object
    Dead,
}

/// Mark word (header word 0)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MarkWord(usize);

impl MarkWord {
    const STATE_MASK: usize = 0b11;
    const STATE_FORWARDED: usize = 0b01;
    /// Header mark bit
    pub const MARK_BIT: usize = 0b100;
    const ADDRESS_MASK: usize = !0b111;

    /// Fresh mark word: normal state, unmarked
    pub const fn new() -> Self {
        Self(0)
    }

    /// Reinterpret a raw header word
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Raw header word
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Forwarding state
    pub const fn state(self) -> ObjectState {
        if self.0 & Self::STATE_MASK == Self::STATE_FORWARDED {
            ObjectState::Forwarded
        } else {
            ObjectState::Normal
        }
    }

    /// Header mark bit as stored (mark sense is applied by the marker)
    pub const fn mark_bit(self) -> bool {
        self.0 & Self::MARK_BIT != 0
    }

    /// Copy with the header mark bit set or cleared
    pub const fn with_mark_bit(self, set: bool) -> Self {
        if set {
            Self(self.0 | Self::MARK_BIT)
        } else {
            Self(self.0 & !Self::MARK_BIT)
        }
    }

    /// Mark word pointing at the forwarded copy
    pub const fn forwarded_to(addr: Address) -> Self {
        debug_assert!(addr % WORD_SIZE == 0);
        Self((addr & Self::ADDRESS_MASK) | Self::STATE_FORWARDED)
    }

    /// Forwarding address, only meaningful in the `Forwarded` state
    pub const fn forwarding_address(self) -> Address {
        self.0 & Self::ADDRESS_MASK
    }
}

impl Default for MarkWord {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MarkWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state() {
            ObjectState::Forwarded => write!(f, "MarkWord(-> {:#x})", self.forwarding_address()),
            ObjectState::Normal => write!(f, "MarkWord(marked: {})", self.mark_bit()),
        }
    }
}

/// Tagged value stored in dynamic object slots
///
/// Encoding by low bits:
/// - `0`: undefined / hole
/// - `..1`: small integer (63-bit)
/// - `.010`: weak heap reference
/// - `.100`: special constant (null, true, false)
/// - `.000` nonzero: strong heap reference
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaggedValue(usize);

impl TaggedValue {
    const INT_TAG: usize = 0b1;
    const WEAK_TAG: usize = 0b10;
    const WEAK_MASK: usize = 0b11;
    const TAG_MASK: usize = 0b111;

    /// Undefined / hole
    pub const UNDEFINED: Self = Self(0);
    /// Null
    pub const NULL: Self = Self(0b0_0100);
    /// Boolean true
    pub const TRUE: Self = Self(0b0_1100);
    /// Boolean false
    pub const FALSE: Self = Self(0b1_0100);

    /// Reinterpret a raw slot
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Raw slot contents
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Small integer
    pub const fn from_int(value: i64) -> Self {
        Self(((value << 1) as usize) | Self::INT_TAG)
    }

    /// Strong reference to `obj`
    pub const fn from_object(obj: ObjectRef) -> Self {
        Self(obj.addr())
    }

    /// Weak reference to `obj`
    pub const fn from_weak(obj: ObjectRef) -> Self {
        Self(obj.addr() | Self::WEAK_TAG)
    }

    /// Integer payload, if this is a small integer
    pub const fn as_int(self) -> Option<i64> {
        if self.0 & Self::INT_TAG != 0 {
            Some((self.0 as i64) >> 1)
        } else {
            None
        }
    }

    /// Check for a weak reference
    pub const fn is_weak(self) -> bool {
        self.0 & Self::WEAK_MASK == Self::WEAK_TAG
    }

    /// Check for any heap reference, strong or weak
    pub const fn is_heap_object(self) -> bool {
        self.is_weak() || (self.0 != 0 && self.0 & Self::TAG_MASK == 0)
    }

    /// Referenced object, strong or weak
    pub fn heap_object(self) -> Option<ObjectRef> {
        if self.is_heap_object() {
            ObjectRef::from_address(self.0 & !Self::TAG_MASK)
        } else {
            None
        }
    }

    /// Same kind of reference (strong or weak) pointing at `obj`
    pub const fn retarget(self, obj: ObjectRef) -> Self {
        if self.is_weak() {
            Self::from_weak(obj)
        } else {
            Self::from_object(obj)
        }
    }
}

impl From<ObjectRef> for TaggedValue {
    fn from(obj: ObjectRef) -> Self {
        Self::from_object(obj)
    }
}

impl fmt::Debug for TaggedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(i) = self.as_int() {
            return write!(f, "Int({i})");
        }
        match *self {
            Self::UNDEFINED => f.write_str("Undefined"),
            Self::NULL => f.write_str("Null"),
            Self::TRUE => f.write_str("True"),
            Self::FALSE => f.write_str("False"),
            v if v.is_weak() => write!(f, "Weak({:#x})", v.0 & !Self::TAG_MASK),
            v if v.is_heap_object() => write!(f, "Object({:#x})", v.0),
            v => write!(f, "Raw({:#x})", v.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(addr: Address) -> ObjectRef {
        ObjectRef::from_address(addr).unwrap()
    }

    #[test]
    fn test_null_is_none() {
        assert!(ObjectRef::from_address(0).is_none());
        assert_eq!(encode_ref(None), 0);
        assert_eq!(encode_ref(Some(obj(0x10040))), 0x10040);
    }

    #[test]
    fn test_mark_word_mark_bit() {
        let mw = MarkWord::new();
        assert!(!mw.mark_bit());
        assert_eq!(mw.state(), ObjectState::Normal);

        let marked = mw.with_mark_bit(true);
        assert!(marked.mark_bit());
        assert_eq!(marked.state(), ObjectState::Normal);
        assert!(!marked.with_mark_bit(false).mark_bit());
    }

    #[test]
    fn test_mark_word_forwarding() {
        let mw = MarkWord::forwarded_to(0x20_0040);
        assert_eq!(mw.state(), ObjectState::Forwarded);
        assert_eq!(mw.forwarding_address(), 0x20_0040);
    }

    #[test]
    fn test_tagged_ints() {
        for value in [0i64, 1, -1, 42, -(1 << 40)] {
            let v = TaggedValue::from_int(value);
            assert_eq!(v.as_int(), Some(value));
            assert!(!v.is_heap_object());
        }
    }

    #[test]
    fn test_tagged_specials_are_not_objects() {
        for v in [
            TaggedValue::UNDEFINED,
            TaggedValue::NULL,
            TaggedValue::TRUE,
            TaggedValue::FALSE,
        ] {
            assert!(!v.is_heap_object(), "{v:?}");
            assert_eq!(v.as_int(), None);
        }
    }

    #[test]
    fn test_tagged_references() {
        let strong = TaggedValue::from_object(obj(0x10040));
        let weak = TaggedValue::from_weak(obj(0x10040));

        assert!(strong.is_heap_object() && !strong.is_weak());
        assert!(weak.is_heap_object() && weak.is_weak());
        assert_eq!(strong.heap_object(), Some(obj(0x10040)));
        assert_eq!(weak.heap_object(), Some(obj(0x10040)));

        let moved = weak.retarget(obj(0x30080));
        assert!(moved.is_weak());
        assert_eq!(moved.heap_object(), Some(obj(0x30080)));
        assert!(!strong.retarget(obj(0x30080)).is_weak());
    }
}
