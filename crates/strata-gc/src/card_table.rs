//! Card table
//!
//! Divides the heap into fixed-size cards. The write barrier dirties the
//! card of any non-young object that receives a heap reference; young
//! collections treat objects on marked cards as extra roots, and concurrent
//! marking uses the cards to find objects mutated behind its back.

use std::ops::BitOr;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::fatal;
use crate::mem_range::{Address, MemRange};

/// log2 of the card size
pub const CARD_BITS: u32 = 9;

/// Size of a card in bytes
pub const CARD_SIZE: usize = 1 << CARD_BITS;

/// Card state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    /// No reference store since the last clear
    Clean = 0,
    /// Received a reference store
    Dirty = 1,
    /// Scanned by concurrent marking after being dirty
    Processed = 2,
}

impl From<u8> for CardState {
    fn from(v: u8) -> Self {
        match v {
            0 => CardState::Clean,
            1 => CardState::Dirty,
            2 => CardState::Processed,
            _ => fatal!("corrupt card state {}", v),
        }
    }
}

/// Which cards [`CardTable::visit_marked`] visits and what it does to them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardVisitFlags(u8);

impl CardVisitFlags {
    /// Visit dirty cards
    pub const VISIT_MARKED: Self = Self(1);
    /// Visit processed cards
    pub const VISIT_PROCESSED: Self = Self(1 << 1);
    /// Turn visited dirty cards into processed ones
    pub const SET_PROCESSED: Self = Self(1 << 2);

    /// Check if all bits of `other` are set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CardVisitFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Card table covering one contiguous heap range
pub struct CardTable {
    range: MemRange,
    cards: Box<[AtomicU8]>,
}

impl CardTable {
    /// Create a clean table for `range`
    pub fn new(range: MemRange) -> Self {
        let num_cards = range.size().div_ceil(CARD_SIZE);
        Self {
            range,
            cards: (0..num_cards)
                .map(|_| AtomicU8::new(CardState::Clean as u8))
                .collect(),
        }
    }

    #[inline]
    fn index_of(&self, addr: Address) -> Option<usize> {
        self.range
            .contains_address(addr)
            .then(|| (addr - self.range.start()) >> CARD_BITS)
    }

    /// Address range covered by card `index`
    pub fn card_range(&self, index: usize) -> MemRange {
        let start = self.range.start() + index * CARD_SIZE;
        MemRange::new(start, (start + CARD_SIZE).min(self.range.end()))
    }

    /// Number of cards
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// Check if the table covers nothing
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Mark the card containing an address as dirty
    #[inline]
    pub fn mark_card(&self, addr: Address) {
        if let Some(idx) = self.index_of(addr) {
            self.cards[idx].store(CardState::Dirty as u8, Ordering::Release);
        }
    }

    /// State of the card containing `addr`
    pub fn card_state(&self, addr: Address) -> CardState {
        self.index_of(addr)
            .map_or(CardState::Clean, |idx| self.cards[idx].load(Ordering::Acquire).into())
    }

    /// Check if the card containing `addr` is dirty
    pub fn is_dirty(&self, addr: Address) -> bool {
        self.card_state(addr) == CardState::Dirty
    }

    /// Mark the card containing `addr` processed, if it is dirty
    pub fn mark_processed(&self, addr: Address) {
        if let Some(idx) = self.index_of(addr) {
            let _ = self.cards[idx].compare_exchange(
                CardState::Dirty as u8,
                CardState::Processed as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }

    /// Clear all cards
    pub fn clear_all(&self) {
        for card in self.cards.iter() {
            card.store(CardState::Clean as u8, Ordering::Relaxed);
        }
    }

    /// Clear cards overlapping `[begin, end)`
    pub fn clear_card_range(&self, begin: Address, end: Address) {
        let begin = begin.max(self.range.start());
        let end = end.min(self.range.end());
        if begin >= end {
            return;
        }
        let first = (begin - self.range.start()) >> CARD_BITS;
        let last = (end - 1 - self.range.start()) >> CARD_BITS;
        for card in &self.cards[first..=last] {
            card.store(CardState::Clean as u8, Ordering::Relaxed);
        }
    }

    /// Visit the ranges of cards selected by `flags`; returns how many
    /// cards were visited.
    ///
    /// With [`CardVisitFlags::SET_PROCESSED`] a dirty card flips to
    /// processed before its range is visited, so a store racing with the
    /// visit dirties it again.
    pub fn visit_marked(&self, visitor: &mut dyn FnMut(MemRange), flags: CardVisitFlags) -> usize {
        let mut visited = 0;
        for (idx, card) in self.cards.iter().enumerate() {
            let state = CardState::from(card.load(Ordering::Acquire));
            let selected = match state {
                CardState::Clean => false,
                CardState::Dirty => flags.contains(CardVisitFlags::VISIT_MARKED),
                CardState::Processed => flags.contains(CardVisitFlags::VISIT_PROCESSED),
            };
            if !selected {
                continue;
            }
            if state == CardState::Dirty && flags.contains(CardVisitFlags::SET_PROCESSED) {
                let _ = card.compare_exchange(
                    CardState::Dirty as u8,
                    CardState::Processed as u8,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
            }
            visited += 1;
            visitor(self.card_range(idx));
        }
        visited
    }

    /// Number of dirty cards
    pub fn dirty_count(&self) -> usize {
        self.cards
            .iter()
            .filter(|card| card.load(Ordering::Relaxed) == CardState::Dirty as u8)
            .count()
    }
}
