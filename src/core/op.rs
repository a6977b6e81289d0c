//! The primitive operations a plan is built from: the compute engine, the
//! programmable post-processing unit, the DMA and the estimate-only
//! placeholder. Every op remembers which source-network operations it
//! realizes so per-operation performance can be reported afterwards.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::buffer::{DramFormat, TraversalOrder};
use crate::core::shape::TensorShape;

/// The compute-engine output block granularity. Cascaded parts must agree on
/// one block config to stay in lock-step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockConfig {
    pub width: u32,
    pub height: u32,
}

impl BlockConfig {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineOperation {
    Convolution,
    DepthwiseConvolution,
    FullyConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineAlgorithm {
    Direct,
    Winograd,
}

/// One compute-engine invocation: weights + bias + input stripes to output
/// stripes, with the geometry the hardware needs baked in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineOp {
    pub op: EngineOperation,
    pub algo: EngineAlgorithm,
    pub block_config: BlockConfig,
    pub input_stripe: TensorShape,
    pub output_stripe: TensorShape,
    pub weights_stripe: TensorShape,
    pub order: TraversalOrder,
    pub stride: (u32, u32),
    pub pad_left: u32,
    pub pad_top: u32,
    pub upscale_factor: u32,
    /// Output clamp, folded in from a following activation where possible.
    pub lower_bound: i16,
    pub upper_bound: i16,
}

/// The named kernels the post-processing unit can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PostKernel {
    Passthrough,
    Addition,
    AdditionRescale,
    Multiplication,
    MaxPool2x2,
    MeanPool3x3,
    LeakyRelu,
    Sigmoid,
    Downsample2x2,
}

/// Fixed-point rescale applied to one post-processing input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rescale {
    pub multiplier: u16,
    pub shift: u16,
}

impl Default for Rescale {
    fn default() -> Self {
        Self { multiplier: 1, shift: 0 }
    }
}

/// One post-processing invocation: one or two inputs through a named kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostOp {
    pub kernel: PostKernel,
    pub block_config: BlockConfig,
    pub input_stripes: Vec<TensorShape>,
    pub output_stripe: TensorShape,
    pub rescale0: Rescale,
    pub rescale1: Rescale,
    /// Whether the kernel code itself must be loaded before this op runs.
    pub load_kernel: bool,
}

/// A DMA transfer between DRAM and SRAM. `format` is the DRAM-side layout the
/// transfer reads or writes; the SRAM side is always brick-interleaved.
/// `offset` addresses a sub-region of the DRAM buffer, used when several
/// transfers fill disjoint regions of one tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DmaOp {
    pub format: DramFormat,
    pub offset: TensorShape,
}

impl DmaOp {
    pub fn new(format: DramFormat) -> Self {
        Self { format, offset: [0; 4] }
    }

    pub fn with_offset(format: DramFormat, offset: TensorShape) -> Self {
        Self { format, offset }
    }
}

/// Stands in for functionality whose cost can only be approximated. Never
/// fatal; the pass it lands in is reported with degraded confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateOnlyOp {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    Engine(EngineOp),
    Post(PostOp),
    Dma(DmaOp),
    EstimateOnly(EstimateOnlyOp),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub kind: OpKind,
    /// Source-network operation ids this op realizes.
    pub operation_ids: BTreeSet<u32>,
}

impl Op {
    pub fn new(kind: OpKind) -> Self {
        Self { kind, operation_ids: BTreeSet::new() }
    }

    pub fn with_operation_ids(kind: OpKind, operation_ids: BTreeSet<u32>) -> Self {
        Self { kind, operation_ids }
    }

    pub fn block_config(&self) -> Option<BlockConfig> {
        match &self.kind {
            OpKind::Engine(op) => Some(op.block_config),
            OpKind::Post(op) => Some(op.block_config),
            _ => None,
        }
    }

    pub fn is_dma(&self) -> bool {
        matches!(self.kind, OpKind::Dma(_))
    }
}
