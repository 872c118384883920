//! No-op collector

use crate::collector::Collector;
use crate::context::GcContext;
use crate::settings::GcType;
use crate::task::{CollectionType, GcTask};

/// Collector that never reclaims memory. Cycles still run through the
/// driver, so listeners and the cycle counter behave as usual.
pub struct EpsilonGc;

impl Collector for EpsilonGc {
    fn gc_type(&self) -> GcType {
        GcType::Epsilon
    }

    fn run_phases_impl(&self, _cx: &GcContext, task: &mut GcTask) {
        task.collection_type = CollectionType::None;
    }

    fn uses_threshold_trigger(&self) -> bool {
        false
    }
}
