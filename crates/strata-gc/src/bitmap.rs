//! Mark bitmaps
//!
//! One bit per heap word of a region. Bits are addressed by object start
//! address; both atomic and plain test-and-set flavours are provided so the
//! marker can pick the cheaper one when it runs single-threaded.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::mem_range::{Address, MemRange};
use crate::object::WORD_SIZE;

const BITS_PER_WORD: usize = u64::BITS as usize;

/// Liveness bitmap for one region
pub struct MarkBitmap {
    range: MemRange,
    words: Box<[AtomicU64]>,
}

impl MarkBitmap {
    /// Create a cleared bitmap covering `range`
    pub fn new(range: MemRange) -> Self {
        let bits = range.size() / WORD_SIZE;
        Self {
            range,
            words: (0..bits.div_ceil(BITS_PER_WORD))
                .map(|_| AtomicU64::new(0))
                .collect(),
        }
    }

    /// Covered region
    pub fn range(&self) -> MemRange {
        self.range
    }

    #[inline]
    fn locate(&self, addr: Address) -> (usize, u64) {
        debug_assert!(self.range.contains_address(addr), "{addr:#x} not in {}", self.range);
        let bit = (addr - self.range.start()) / WORD_SIZE;
        (bit / BITS_PER_WORD, 1u64 << (bit % BITS_PER_WORD))
    }

    /// Check the bit for `addr`
    #[inline]
    pub fn test(&self, addr: Address) -> bool {
        let (word, mask) = self.locate(addr);
        self.words[word].load(Ordering::Acquire) & mask != 0
    }

    /// Set the bit for `addr`
    #[inline]
    pub fn set(&self, addr: Address) {
        let (word, mask) = self.locate(addr);
        self.words[word].fetch_or(mask, Ordering::AcqRel);
    }

    /// Clear the bit for `addr`
    #[inline]
    pub fn clear(&self, addr: Address) {
        let (word, mask) = self.locate(addr);
        self.words[word].fetch_and(!mask, Ordering::AcqRel);
    }

    /// Set the bit; true if it was clear. Safe against concurrent markers.
    #[inline]
    pub fn atomic_test_and_set(&self, addr: Address) -> bool {
        let (word, mask) = self.locate(addr);
        self.words[word].fetch_or(mask, Ordering::AcqRel) & mask == 0
    }

    /// Clear the bit; true if it was set. Safe against concurrent markers.
    #[inline]
    pub fn atomic_test_and_clear(&self, addr: Address) -> bool {
        let (word, mask) = self.locate(addr);
        self.words[word].fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    /// Set the bit with a plain read-modify-write; true if it was clear.
    /// Only valid while a single thread marks.
    #[inline]
    pub fn test_and_set(&self, addr: Address) -> bool {
        let (word, mask) = self.locate(addr);
        let old = self.words[word].load(Ordering::Relaxed);
        if old & mask != 0 {
            return false;
        }
        self.words[word].store(old | mask, Ordering::Relaxed);
        true
    }

    /// Clear the bit with a plain read-modify-write; true if it was set.
    /// Only valid while a single thread marks.
    #[inline]
    pub fn test_and_clear(&self, addr: Address) -> bool {
        let (word, mask) = self.locate(addr);
        let old = self.words[word].load(Ordering::Relaxed);
        if old & mask == 0 {
            return false;
        }
        self.words[word].store(old & !mask, Ordering::Relaxed);
        true
    }

    /// Clear every bit
    pub fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Clear bits for addresses in `[begin, end)`
    pub fn clear_range(&self, begin: Address, end: Address) {
        let begin = begin.max(self.range.start());
        let end = end.min(self.range.end());
        let mut addr = begin;
        while addr < end {
            let (word, _) = self.locate(addr);
            let first_bit = (addr - self.range.start()) / WORD_SIZE;
            let word_end = self.range.start() + (word + 1) * BITS_PER_WORD * WORD_SIZE;
            if first_bit % BITS_PER_WORD == 0 && word_end <= end {
                self.words[word].store(0, Ordering::Relaxed);
                addr = word_end;
            } else {
                self.clear(addr);
                addr += WORD_SIZE;
            }
        }
    }

    /// Visit the address of every set bit in ascending order
    pub fn iterate_marked(&self, mut visitor: impl FnMut(Address)) {
        for (idx, word) in self.words.iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                visitor(self.range.start() + (idx * BITS_PER_WORD + bit) * WORD_SIZE);
                bits &= bits - 1;
            }
        }
    }

    /// Number of set bits
    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BASE: Address = 0x4_0000;

    fn bitmap() -> MarkBitmap {
        MarkBitmap::new(MemRange::with_size(BASE, 64 * 1024))
    }

    #[test]
    fn test_set_and_clear() {
        let bm = bitmap();
        assert!(!bm.test(BASE + 8));
        bm.set(BASE + 8);
        assert!(bm.test(BASE + 8));
        assert!(!bm.test(BASE));
        bm.clear(BASE + 8);
        assert!(!bm.test(BASE + 8));
    }

    #[test]
    fn test_test_and_set_reports_transition() {
        let bm = bitmap();
        assert!(bm.test_and_set(BASE + 16));
        assert!(!bm.test_and_set(BASE + 16));
        assert!(!bm.atomic_test_and_set(BASE + 16));
        assert!(bm.atomic_test_and_clear(BASE + 16));
        assert!(!bm.test_and_clear(BASE + 16));
    }

    #[test]
    fn test_clear_range_is_exact() {
        let bm = bitmap();
        for i in 0..200 {
            bm.set(BASE + i * WORD_SIZE);
        }
        bm.clear_range(BASE + 10 * WORD_SIZE, BASE + 150 * WORD_SIZE);
        assert_eq!(bm.count(), 10 + 50);
        assert!(bm.test(BASE + 9 * WORD_SIZE));
        assert!(!bm.test(BASE + 10 * WORD_SIZE));
        assert!(!bm.test(BASE + 149 * WORD_SIZE));
        assert!(bm.test(BASE + 150 * WORD_SIZE));
    }

    #[test]
    fn test_concurrent_test_and_set_wins_once() {
        let bm = bitmap();
        let wins = std::sync::atomic::AtomicUsize::new(0);
        crossbeam_utils::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|_| {
                    for i in 0..512 {
                        if bm.atomic_test_and_set(BASE + i * WORD_SIZE) {
                            wins.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(wins.load(Ordering::Relaxed), 512);
        assert_eq!(bm.count(), 512);
    }

    proptest! {
        #[test]
        fn prop_iterate_marked_matches_set(indices in proptest::collection::btree_set(0usize..8192, 0..64)) {
            let bm = bitmap();
            for &i in &indices {
                bm.set(BASE + i * WORD_SIZE);
            }
            let mut seen = Vec::new();
            bm.iterate_marked(|addr| seen.push((addr - BASE) / WORD_SIZE));
            let expected: Vec<usize> = indices.into_iter().collect();
            prop_assert_eq!(seen, expected);
        }
    }
}
