//! Collector settings loaded from TOML

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::card_table::CARD_SIZE;
use crate::error::{GcError, GcResult};
use crate::object::WORD_SIZE;

/// Which collector the runtime installs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GcType {
    /// Never reclaims anything
    Epsilon,
    /// Whole-heap mark-sweep with mutators suspended for the full cycle
    Stw,
    /// Young copying collection plus concurrent tenured mark-sweep
    Gen,
}

/// How native (off-heap) allocations feed back into collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeGcTriggerType {
    /// Native allocations never trigger a collection
    NoNativeGcTrigger,
    /// Trigger once registered native bytes exceed the watermark
    SimpleStrategy,
}

/// GC settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GcSettings {
    /// Collector family (default: gen)
    pub gc_type: GcType,

    /// Run collections on the requesting thread instead of the worker
    pub run_gc_in_place: bool,

    /// Run tenured marking and sweeping concurrently with mutators
    pub concurrency_enabled: bool,

    /// Young space size in bytes (default: 1MB)
    pub young_size: usize,

    /// Objects larger than this go straight to tenured (default: 8KB)
    pub young_alloc_max_size: usize,

    /// Tenured space size in bytes (default: 16MB)
    pub tenured_size: usize,

    /// Tenured pool size in bytes (default: 256KB)
    pub pool_size: usize,

    /// Template space size in bytes (default: 4MB)
    pub template_size: usize,

    /// Extra marking threads; 0 marks on the collector thread only
    pub gc_workers_count: usize,

    /// Drain marking stacks on the worker pool
    pub parallel_marking: bool,

    /// Marking stack length above which half is handed to another worker
    pub marking_task_threshold: usize,

    /// Flip the meaning of the mark bit after each stop-the-world cycle
    pub reversed_mark_sense: bool,

    /// Verify the heap before each cycle
    pub pre_gc_heap_verification: bool,

    /// Verify the heap after each cycle
    pub post_gc_heap_verification: bool,

    /// Verify that references into young were rewritten after promotion
    pub into_gc_heap_verification: bool,

    /// Treat verification failures as fatal
    pub fail_on_heap_verification: bool,

    /// Native allocation trigger policy
    pub native_gc_trigger: NativeGcTriggerType,

    /// Native bytes allowed between collections (default: 8MB)
    pub native_watermark: usize,

    /// Lower bound of the tenured footprint that triggers a collection
    pub min_target_footprint: usize,

    /// Live tenured bytes divided by this ratio give the next trigger footprint
    pub gc_trigger_ratio: f64,

    /// Delay before the startup-complete collection (milliseconds)
    pub startup_gc_delay_ms: u64,
}

impl Default for GcSettings {
    fn default() -> Self {
        Self {
            gc_type: GcType::Gen,
            run_gc_in_place: false,
            concurrency_enabled: true,
            young_size: 1024 * 1024,          // 1MB
            young_alloc_max_size: 8 * 1024,   // 8KB
            tenured_size: 16 * 1024 * 1024,   // 16MB
            pool_size: 256 * 1024,            // 256KB
            template_size: 4 * 1024 * 1024,   // 4MB
            gc_workers_count: 0,
            parallel_marking: false,
            marking_task_threshold: 1024,
            reversed_mark_sense: false,
            pre_gc_heap_verification: false,
            post_gc_heap_verification: false,
            into_gc_heap_verification: false,
            fail_on_heap_verification: false,
            native_gc_trigger: NativeGcTriggerType::SimpleStrategy,
            native_watermark: 8 * 1024 * 1024, // 8MB
            min_target_footprint: 4 * 1024 * 1024,
            gc_trigger_ratio: 0.75,
            startup_gc_delay_ms: 2000,
        }
    }
}

impl GcSettings {
    /// Load settings from a TOML file and validate them.
    pub fn load(path: &Path) -> GcResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| GcError::SettingsIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse settings from TOML text and validate them.
    pub fn from_toml_str(content: &str) -> GcResult<Self> {
        let settings: Self = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Settings for a small heap, handy for embedders running many
    /// short-lived runtimes.
    pub fn small(gc_type: GcType) -> Self {
        Self {
            gc_type,
            young_size: 64 * 1024,
            young_alloc_max_size: 4 * 1024,
            tenured_size: 1024 * 1024,
            pool_size: 64 * 1024,
            template_size: 256 * 1024,
            min_target_footprint: 512 * 1024,
            ..Self::default()
        }
    }

    /// Whether this configuration carves out a young space.
    pub fn has_young_space(&self) -> bool {
        self.gc_type == GcType::Gen
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> GcResult<()> {
        let invalid = |msg: String| Err(GcError::InvalidSettings(msg));

        if self.pool_size == 0 || self.pool_size % CARD_SIZE != 0 {
            return invalid(format!(
                "pool_size {} must be a non-zero multiple of the card size {}",
                self.pool_size, CARD_SIZE
            ));
        }
        if self.tenured_size < self.pool_size {
            return invalid(format!(
                "tenured_size {} is smaller than one pool ({})",
                self.tenured_size, self.pool_size
            ));
        }
        if self.has_young_space() {
            if self.young_size == 0 || self.young_size % CARD_SIZE != 0 {
                return invalid(format!(
                    "young_size {} must be a non-zero multiple of the card size {}",
                    self.young_size, CARD_SIZE
                ));
            }
            if self.young_alloc_max_size > self.young_size {
                return invalid(format!(
                    "young_alloc_max_size {} exceeds young_size {}",
                    self.young_alloc_max_size, self.young_size
                ));
            }
            if self.young_alloc_max_size >= self.pool_size {
                return invalid(format!(
                    "young_alloc_max_size {} must be smaller than pool_size {}",
                    self.young_alloc_max_size, self.pool_size
                ));
            }
        }
        if self.template_size % WORD_SIZE != 0 {
            return invalid(format!(
                "template_size {} is not word aligned",
                self.template_size
            ));
        }
        if self.parallel_marking && self.gc_workers_count == 0 {
            return invalid("parallel_marking requires gc_workers_count > 0".to_string());
        }
        if self.marking_task_threshold == 0 {
            return invalid("marking_task_threshold must be positive".to_string());
        }
        if self.gc_trigger_ratio.is_nan() || self.gc_trigger_ratio <= 0.0 || self.gc_trigger_ratio > 1.0 {
            return invalid(format!(
                "gc_trigger_ratio {} must be in (0, 1]",
                self.gc_trigger_ratio
            ));
        }
        if self.reversed_mark_sense && self.gc_type != GcType::Stw {
            return invalid("reversed_mark_sense is only supported by the stw collector".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        GcSettings::default().validate().unwrap();
        GcSettings::small(GcType::Stw).validate().unwrap();
    }

    #[test]
    fn test_from_toml_partial() {
        let settings = GcSettings::from_toml_str(
            r#"
            gc_type = "stw"
            run_gc_in_place = true
            tenured_size = 2097152
            native_gc_trigger = "no_native_gc_trigger"
            "#,
        )
        .unwrap();
        assert_eq!(settings.gc_type, GcType::Stw);
        assert!(settings.run_gc_in_place);
        assert_eq!(settings.tenured_size, 2 * 1024 * 1024);
        assert_eq!(settings.native_gc_trigger, NativeGcTriggerType::NoNativeGcTrigger);
        // untouched fields keep their defaults
        assert_eq!(settings.pool_size, 256 * 1024);
    }

    #[test]
    fn test_rejects_unaligned_pool() {
        let err = GcSettings::from_toml_str("pool_size = 1000").unwrap_err();
        assert!(matches!(err, GcError::InvalidSettings(_)));
    }

    #[test]
    fn test_young_objects_must_fit_a_pool() {
        let settings = GcSettings {
            young_alloc_max_size: 64 * 1024,
            ..GcSettings::small(GcType::Gen)
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_parallel_without_workers() {
        let settings = GcSettings {
            parallel_marking: true,
            ..GcSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_reversed_sense_needs_stw() {
        let mut settings = GcSettings {
            reversed_mark_sense: true,
            ..GcSettings::default()
        };
        assert!(settings.validate().is_err());
        settings.gc_type = GcType::Stw;
        settings.validate().unwrap();
    }

    #[test]
    fn test_load_missing_file() {
        let err = GcSettings::load(Path::new("/nonexistent/strata-gc.toml")).unwrap_err();
        assert!(matches!(err, GcError::SettingsIo { .. }));
    }

    #[test]
    fn test_unknown_gc_type_is_parse_error() {
        let err = GcSettings::from_toml_str(r#"gc_type = "g1""#).unwrap_err();
        assert!(matches!(err, GcError::SettingsParse(_)));
    }
}
