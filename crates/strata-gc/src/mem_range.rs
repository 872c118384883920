//! Half-open address ranges

use std::fmt;

/// Virtual address inside the simulated heap
pub type Address = usize;

/// Address range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemRange {
    start: Address,
    end: Address,
}

impl MemRange {
    /// Create a range; `end` must not precede `start`
    pub const fn new(start: Address, end: Address) -> Self {
        assert!(start <= end);
        Self { start, end }
    }

    /// Range covering `size` bytes from `start`
    pub const fn with_size(start: Address, size: usize) -> Self {
        Self::new(start, start + size)
    }

    /// First address
    pub const fn start(&self) -> Address {
        self.start
    }

    /// One past the last address
    pub const fn end(&self) -> Address {
        self.end
    }

    /// Size in bytes
    pub const fn size(&self) -> usize {
        self.end - self.start
    }

    /// True for zero-sized ranges
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Check if an address falls inside
    #[inline]
    pub const fn contains_address(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Check if `other` lies entirely inside
    pub const fn contains(&self, other: &MemRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// Check if the two ranges share at least one address
    pub const fn intersects(&self, other: &MemRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for MemRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_and_intersects() {
        let a = MemRange::new(0x1000, 0x2000);
        let b = MemRange::new(0x1800, 0x2800);
        let c = MemRange::new(0x2000, 0x3000);

        assert!(a.contains_address(0x1000));
        assert!(!a.contains_address(0x2000));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert!(a.contains(&MemRange::new(0x1200, 0x1400)));
        assert!(!a.contains(&b));
    }

    #[test]
    fn test_empty_range_intersects_nothing() {
        let empty = MemRange::with_size(0x1000, 0);
        assert!(empty.is_empty());
        assert!(!empty.intersects(&MemRange::new(0, 0x10000)));
    }

    #[test]
    fn test_display() {
        assert_eq!(MemRange::new(16, 32).to_string(), "[0x10, 0x20)");
    }
}
