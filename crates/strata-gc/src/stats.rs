//! Collection statistics

use std::time::Duration;

use crate::task::CollectionType;

/// GC statistics
#[derive(Debug, Default, Clone)]
pub struct GcStats {
    /// Completed cycles
    pub collections: u64,
    /// Cycles that collected only the young space
    pub young_collections: u64,
    /// Cycles that ran a tenured collection after the young one
    pub tenured_collections: u64,
    /// Cycles that collected every space at once
    pub full_collections: u64,
    /// Total time spent in cycles
    pub total_time: Duration,
    /// Longest cycle
    pub max_cycle_time: Duration,
    /// Duration of the last cycle
    pub last_cycle_time: Duration,
    /// Collection type of the last cycle
    pub last_collection_type: Option<CollectionType>,
    /// Objects marked in the last cycle
    pub last_marked: usize,
    /// Tenured objects freed by the last cycle
    pub last_freed_objects: usize,
    /// Bytes freed by the last cycle, promotions included
    pub last_freed_bytes: usize,
    /// Objects promoted by the last cycle
    pub last_promoted_objects: usize,
    /// Bytes promoted by the last cycle
    pub last_promoted_bytes: usize,
    /// Cards visited for young roots in the last cycle
    pub last_cards_scanned: usize,
    /// References cleared by the last cycle
    pub last_references_cleared: usize,
    /// Heap verification failures seen so far
    pub verification_failures: usize,
    /// Bytes freed since start
    pub total_freed_bytes: u64,
}

impl GcStats {
    /// Reset the per-cycle counters
    pub(crate) fn begin_cycle(&mut self) {
        self.last_marked = 0;
        self.last_freed_objects = 0;
        self.last_freed_bytes = 0;
        self.last_promoted_objects = 0;
        self.last_promoted_bytes = 0;
        self.last_cards_scanned = 0;
        self.last_references_cleared = 0;
    }

    /// Fold a finished cycle into the totals
    pub(crate) fn end_cycle(&mut self, kind: CollectionType, elapsed: Duration) {
        self.collections += 1;
        match kind {
            CollectionType::Young => self.young_collections += 1,
            CollectionType::Tenured => {
                self.young_collections += 1;
                self.tenured_collections += 1;
            }
            CollectionType::Full => self.full_collections += 1,
            CollectionType::None => {}
        }
        self.total_time += elapsed;
        self.last_cycle_time = elapsed;
        self.max_cycle_time = self.max_cycle_time.max(elapsed);
        self.last_collection_type = Some(kind);
        self.total_freed_bytes += self.last_freed_bytes as u64;
    }

    /// Mean cycle duration
    pub fn average_cycle_time(&self) -> Duration {
        if self.collections == 0 {
            Duration::ZERO
        } else {
            self.total_time / self.collections as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_accounting() {
        let mut stats = GcStats::default();
        stats.begin_cycle();
        stats.last_freed_bytes = 128;
        stats.end_cycle(CollectionType::Tenured, Duration::from_millis(4));
        stats.begin_cycle();
        stats.end_cycle(CollectionType::Full, Duration::from_millis(2));

        assert_eq!(stats.collections, 2);
        assert_eq!(stats.young_collections, 1);
        assert_eq!(stats.tenured_collections, 1);
        assert_eq!(stats.full_collections, 1);
        assert_eq!(stats.total_freed_bytes, 128);
        assert_eq!(stats.last_freed_bytes, 0);
        assert_eq!(stats.max_cycle_time, Duration::from_millis(4));
        assert_eq!(stats.average_cycle_time(), Duration::from_millis(3));
    }
}
