//! Compilation and estimation options. Both are read-only for the lifetime
//! of a compilation; the estimation options additionally carry the what-if
//! overrides used by the standalone performance-estimation entry point.

use serde::{Deserialize, Serialize};

use crate::core::op::BlockConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilationOptions {
    /// Block configs the search may use. Empty means everything the hardware
    /// supports.
    pub enabled_block_configs: Vec<BlockConfig>,
    /// Allow compressed layouts for intermediate DRAM buffers.
    pub enable_intermediate_compression: bool,
    /// Strict precision disables optimizations that can change rounding:
    /// clamp folding and intermediate compression.
    pub strict_precision: bool,
    /// Upper limit on weight stripe double-buffering (1 disables it).
    pub max_weight_stripes: u32,
}

impl Default for CompilationOptions {
    fn default() -> Self {
        Self {
            enabled_block_configs: Vec::new(),
            enable_intermediate_compression: true,
            strict_precision: false,
            max_weight_stripes: 2,
        }
    }
}

impl CompilationOptions {
    pub fn compression_allowed(&self) -> bool {
        self.enable_intermediate_compression && !self.strict_precision
    }
}

/// How per-pass metrics combine into the whole-graph metric. Passes can
/// partially overlap in time when cascaded, so the right rule is
/// cost-model-specific; it stays behind this enum so it can be swapped
/// without touching the estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MetricAggregation {
    /// Passes execute back to back.
    #[default]
    Sum,
    /// Only the most expensive pass matters (fully overlapped pipeline).
    Bottleneck,
}

impl MetricAggregation {
    pub fn aggregate(self, pass_metrics: impl Iterator<Item = f64>) -> f64 {
        match self {
            MetricAggregation::Sum => pass_metrics.sum(),
            MetricAggregation::Bottleneck => pass_metrics.fold(0.0, f64::max),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EstimationOptions {
    /// Override the measured weight compression saving with a synthetic one
    /// in [0, 1], for what-if analysis.
    pub weight_compression_override: Option<f32>,
    /// Override the activation compression ratio applied to traffic through
    /// compressed DRAM buffers, in (0, 1].
    pub activation_compression_override: Option<f32>,
    pub aggregation: MetricAggregation,
}
