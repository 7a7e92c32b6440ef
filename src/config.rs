//! Runtime configuration for the engine.
//!
//! Configuration can be loaded from a JSON file or constructed
//! programmatically. All tier-related knobs (capacities, granularities,
//! thresholds) live here.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

const GIB: u64 = 1024 * 1024 * 1024;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Tier capacities and granularities.
    pub tiers: TierConfig,

    /// Speculative prefetch settings.
    pub prefetch: PrefetchConfig,

    /// Compression engine geometry.
    pub compression: CompressionConfig,

    /// Address translation settings.
    pub translation: TranslationConfig,
}

/// Tier capacity and granularity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// L1 (hot tier) capacity in bytes.
    pub l1_capacity: u64,

    /// L2 (prefetch buffer) capacity in bytes.
    pub l2_capacity: u64,

    /// L3 (far-memory pool) capacity in bytes.
    pub l3_capacity: u64,

    /// Allocation granularity in bytes. Must be a power of two.
    pub page_size: u64,

    /// Coherence granularity in bytes. Must be a power of two.
    pub cache_line_size: u64,

    /// Access-count boundary for hot classification.
    pub hot_threshold: u32,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 12 * GIB,
            l2_capacity: 3 * GIB,
            l3_capacity: 128 * GIB,
            page_size: 4096,
            cache_line_size: 64,
            hot_threshold: 10,
        }
    }
}

/// Speculative prefetch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchConfig {
    /// Initial and default speculative depth.
    pub depth: usize,

    /// Fixed token window fed to the predictor.
    pub history_length: usize,

    /// Capacity of the outstanding-prefetch FIFO.
    pub outstanding_capacity: usize,

    /// Samples retained for the adaptive-depth controller.
    pub accuracy_window: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            depth: 4,
            history_length: 16,
            outstanding_capacity: 16,
            accuracy_window: 100,
        }
    }
}

/// Compression engine geometry. Feeds the synthesized throughput figure and
/// the per-layer nominal ratio table; the codec itself has no knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Number of parallel codec engines.
    pub engines: usize,

    /// Engine clock in MHz.
    pub clock_mhz: f64,

    /// Datapath width in bits.
    pub data_width_bits: usize,

    /// Model layer count, sizing the nominal-ratio table.
    pub num_layers: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            engines: 1,
            clock_mhz: 800.0,
            data_width_bits: 512,
            num_layers: 80,
        }
    }
}

/// Address translation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationConfig {
    /// Direct-mapped translation cache size in entries.
    pub tlb_size: usize,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self { tlb_size: 1024 }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: EngineConfig = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(EngineConfig::default())
        }
    }

    /// Convenience constructor taking tier capacities in GiB, the granularity
    /// most deployments configure in.
    pub fn with_capacities_gb(l1_gb: u64, l2_gb: u64, l3_gb: u64) -> Self {
        let mut config = EngineConfig::default();
        config.tiers.l1_capacity = l1_gb * GIB;
        config.tiers.l2_capacity = l2_gb * GIB;
        config.tiers.l3_capacity = l3_gb * GIB;
        config
    }

    /// Check structural constraints that the rest of the engine relies on.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !self.tiers.page_size.is_power_of_two() {
            return Err(EngineError::InvalidArgument(format!(
                "page_size {} is not a power of two",
                self.tiers.page_size
            )));
        }
        if !self.tiers.cache_line_size.is_power_of_two() {
            return Err(EngineError::InvalidArgument(format!(
                "cache_line_size {} is not a power of two",
                self.tiers.cache_line_size
            )));
        }
        if self.tiers.cache_line_size > self.tiers.page_size {
            return Err(EngineError::InvalidArgument(
                "cache_line_size exceeds page_size".to_string(),
            ));
        }
        if self.tiers.l1_capacity < self.tiers.page_size {
            return Err(EngineError::InvalidArgument(
                "l1_capacity smaller than one page".to_string(),
            ));
        }
        if self.prefetch.history_length == 0 {
            return Err(EngineError::InvalidArgument(
                "history_length must be non-zero".to_string(),
            ));
        }
        if self.prefetch.outstanding_capacity == 0 {
            return Err(EngineError::InvalidArgument(
                "outstanding_capacity must be non-zero".to_string(),
            ));
        }
        if self.translation.tlb_size == 0 {
            return Err(EngineError::InvalidArgument(
                "tlb_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
