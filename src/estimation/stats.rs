//! Per-pass performance statistics and the legacy whole-network report.
//! These are plain additive records; the estimator fills them in and the
//! excluded reporting tool serializes them to JSON.

use std::collections::BTreeSet;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// DRAM and SRAM traffic for one data role within a pass. Parallel bytes can
/// be transferred while the engines compute; non-parallel bytes cannot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub dram_parallel_bytes: u64,
    pub dram_non_parallel_bytes: u64,
    pub sram_bytes: u64,
}

impl AddAssign for MemoryStats {
    fn add_assign(&mut self, rhs: Self) {
        self.dram_parallel_bytes += rhs.dram_parallel_bytes;
        self.dram_non_parallel_bytes += rhs.dram_non_parallel_bytes;
        self.sram_bytes += rhs.sram_bytes;
    }
}

impl Add for MemoryStats {
    type Output = Self;
    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}

/// Stripe movement for one data role within a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StripesStats {
    pub num_central_stripes: u32,
    pub num_boundary_stripes: u32,
    /// Stripes fetched again because the traversal order re-visits them.
    pub num_reloads: u32,
}

impl AddAssign for StripesStats {
    fn add_assign(&mut self, rhs: Self) {
        self.num_central_stripes += rhs.num_central_stripes;
        self.num_boundary_stripes += rhs.num_boundary_stripes;
        self.num_reloads += rhs.num_reloads;
    }
}

impl Add for StripesStats {
    type Output = Self;
    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InputStats {
    pub memory: MemoryStats,
    pub stripes: StripesStats,
}

impl AddAssign for InputStats {
    fn add_assign(&mut self, rhs: Self) {
        self.memory += rhs.memory;
        self.stripes += rhs.stripes;
    }
}

pub type OutputStats = InputStats;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightsStats {
    pub memory: MemoryStats,
    pub stripes: StripesStats,
    /// Fraction of raw weight bytes saved by encoding, in [0, 1].
    pub compression_savings: f32,
}

/// Compute-engine work in one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub operations: u64,
    pub cycle_count: u64,
}

impl AddAssign for EngineStats {
    fn add_assign(&mut self, rhs: Self) {
        self.operations += rhs.operations;
        self.cycle_count += rhs.cycle_count;
    }
}

/// Post-processing work in one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PostStats {
    pub num_patches: u64,
    pub cycle_count: u64,
}

impl AddAssign for PostStats {
    fn add_assign(&mut self, rhs: Self) {
        self.num_patches += rhs.num_patches;
        self.cycle_count += rhs.cycle_count;
    }
}

/// Everything measured about one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PassStats {
    pub input: InputStats,
    pub output: OutputStats,
    pub weights: WeightsStats,
    pub engine: EngineStats,
    pub post: PostStats,
}

impl PassStats {
    pub fn total_dram_parallel_bytes(&self) -> u64 {
        self.input.memory.dram_parallel_bytes
            + self.output.memory.dram_parallel_bytes
            + self.weights.memory.dram_parallel_bytes
    }

    pub fn total_dram_non_parallel_bytes(&self) -> u64 {
        self.input.memory.dram_non_parallel_bytes
            + self.output.memory.dram_non_parallel_bytes
            + self.weights.memory.dram_non_parallel_bytes
    }
}

/// One pass in the legacy per-network report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassPerformanceData {
    pub pass_index: u32,
    /// Source-network operations realized by this pass.
    pub operation_ids: BTreeSet<u32>,
    pub metric: f64,
    pub stats: PassStats,
    /// Reduced-confidence markers ("reason for estimate-only"), not errors.
    pub notes: Vec<String>,
}

/// The aggregated report handed to the excluded JSON-printing utility.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkPerformanceData {
    pub passes: Vec<PassPerformanceData>,
    pub total_metric: f64,
}

impl NetworkPerformanceData {
    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
