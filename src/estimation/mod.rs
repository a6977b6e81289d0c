//! Performance estimation: partitions an op graph into passes and prices
//! each one. A pass is a maximal fused chain: a compute-engine op with the
//! post-processing op consuming its staged output, plus the DMAs feeding and
//! draining it; or a standalone post-processing op; or a DMA conversion
//! chain; or an estimate-only placeholder.
//!
//! Given identical inputs the pass grouping and every metric are exactly
//! reproducible: all iteration is in id order and nothing here depends on
//! hash ordering or timing.

pub mod stats;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::buffer::{Buffer, DramBuffer, SramBuffer};
use crate::core::capabilities::HardwareCapabilities;
use crate::core::config::EstimationOptions;
use crate::core::error::{CompileError, Result};
use crate::core::graph::{BufferId, OpGraph, OpId};
use crate::core::op::OpKind;
use crate::core::shape::{self, num_elements};

use stats::{
    EngineStats, InputStats, MemoryStats, NetworkPerformanceData, PassPerformanceData, PassStats,
    PostStats, StripesStats, WeightsStats,
};

/// Observed mean ratio of compressed to raw traffic for activations moving
/// through compressed DRAM layouts, used unless the caller overrides it.
const DEFAULT_ACTIVATION_RATIO: f32 = 0.7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Confidence {
    Full,
    Degraded { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatedPass {
    pub metric: f64,
    pub stats: PassStats,
    /// Ops grouped into this pass, ascending.
    pub ops: Vec<OpId>,
    pub operation_ids: BTreeSet<u32>,
    pub confidence: Confidence,
}

/// Read-only summary of estimating one op graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatedOpGraph {
    /// Whole-graph metric, aggregated per the estimation options.
    pub metric: f64,
    pub passes: Vec<EstimatedPass>,
    /// Which pass each estimated op landed in.
    pub op_to_pass: BTreeMap<OpId, usize>,
    /// Legacy per-pass report for external consumers.
    pub perf: NetworkPerformanceData,
}

pub fn estimate_op_graph(
    graph: &OpGraph,
    caps: &HardwareCapabilities,
    opts: &EstimationOptions,
) -> Result<EstimatedOpGraph> {
    let mut claimed: BTreeSet<OpId> = BTreeSet::new();
    let mut passes: Vec<EstimatedPass> = Vec::new();

    // engine passes first: they own their neighbouring DMAs
    for op in graph.op_ids() {
        if claimed.contains(&op) {
            continue;
        }
        if matches!(graph.op(op).kind, OpKind::Engine(_)) {
            passes.push(estimate_engine_pass(graph, op, caps, opts, &mut claimed)?);
        }
    }
    // standalone post-processing passes
    for op in graph.op_ids() {
        if claimed.contains(&op) {
            continue;
        }
        if matches!(graph.op(op).kind, OpKind::Post(_)) {
            passes.push(estimate_post_pass(graph, op, caps, opts, &mut claimed)?);
        }
    }
    // leftover DMAs form conversion passes
    for op in graph.op_ids() {
        if claimed.contains(&op) {
            continue;
        }
        if matches!(graph.op(op).kind, OpKind::Dma(_)) {
            passes.push(estimate_conversion_pass(graph, op, caps, opts, &mut claimed));
        }
    }
    // estimate-only placeholders, priced conservatively
    for op in graph.op_ids() {
        if claimed.contains(&op) {
            continue;
        }
        if let OpKind::EstimateOnly(e) = &graph.op(op).kind {
            claimed.insert(op);
            let bytes: u64 = graph
                .op_inputs(op)
                .iter()
                .copied()
                .chain(graph.op_output(op))
                .map(|b| u64::from(graph.buffer(b).size_bytes()))
                .sum();
            let mut stats = PassStats::default();
            stats.input.memory.dram_non_parallel_bytes = bytes;
            // charged as two full round trips of its data
            let metric = 2.0 * bytes as f64 / f64::from(caps.dma_bytes_per_cycle);
            passes.push(EstimatedPass {
                metric,
                stats,
                ops: vec![op],
                operation_ids: graph.op(op).operation_ids.clone(),
                confidence: Confidence::Degraded { reason: e.reason.clone() },
            });
        }
    }

    let metric = opts.aggregation.aggregate(passes.iter().map(|p| p.metric));
    let mut op_to_pass = BTreeMap::new();
    for (i, pass) in passes.iter().enumerate() {
        for &op in &pass.ops {
            op_to_pass.insert(op, i);
        }
    }
    let perf = NetworkPerformanceData {
        passes: passes
            .iter()
            .enumerate()
            .map(|(i, p)| PassPerformanceData {
                pass_index: i as u32,
                operation_ids: p.operation_ids.clone(),
                metric: p.metric,
                stats: p.stats,
                notes: match &p.confidence {
                    Confidence::Full => Vec::new(),
                    Confidence::Degraded { reason } => vec![reason.clone()],
                },
            })
            .collect(),
        total_metric: metric,
    };
    debug!(passes = passes.len(), metric, "estimated op graph");
    Ok(EstimatedOpGraph { metric, passes, op_to_pass, perf })
}

/// Bytes actually crossing the DRAM bus for a buffer, after compression.
fn dram_traffic_bytes(dram: &DramBuffer, opts: &EstimationOptions) -> u64 {
    let size = u64::from(dram.size_bytes);
    if dram.format.is_compressed() {
        let ratio = opts.activation_compression_override.unwrap_or(DEFAULT_ACTIVATION_RATIO);
        (size as f64 * f64::from(ratio)).ceil() as u64
    } else {
        size
    }
}

/// The unclaimed DMA producing this SRAM buffer, with its DRAM source.
fn input_dma(
    graph: &OpGraph,
    sram: BufferId,
    claimed: &BTreeSet<OpId>,
) -> Option<(OpId, BufferId)> {
    let dma = graph.single_producer(sram)?;
    if claimed.contains(&dma) || !graph.op(dma).is_dma() {
        return None;
    }
    let src = *graph.op_inputs(dma).first()?;
    matches!(graph.buffer(src), Buffer::Dram(_)).then_some((dma, src))
}

/// The unclaimed DMA draining this SRAM buffer, with its DRAM destination.
fn output_dma(
    graph: &OpGraph,
    sram: BufferId,
    claimed: &BTreeSet<OpId>,
) -> Option<(OpId, BufferId)> {
    let consumers = graph.consumers(sram);
    let &(dma, _) = consumers.iter().find(|(op, _)| !claimed.contains(op) && graph.op(*op).is_dma())?;
    let dst = graph.op_output(dma)?;
    matches!(graph.buffer(dst), Buffer::Dram(_)).then_some((dma, dst))
}

fn stripe_movement(sram: &SramBuffer) -> StripesStats {
    let total = shape::total_stripes(&sram.shape, &sram.stripe_shape);
    let split_dims = (0..4)
        .filter(|&d| shape::stripes_in_dim(&sram.shape, &sram.stripe_shape, d) > 1)
        .count() as u32;
    let boundary = (2 * split_dims).min(total.saturating_sub(1));
    StripesStats {
        num_central_stripes: total - boundary,
        num_boundary_stripes: boundary,
        num_reloads: sram.num_loads.saturating_sub(1) * total,
    }
}

/// Traffic and stripe stats for one activation stream. `dram` is absent when
/// the stream stays in SRAM across a cascade boundary.
fn activation_stats(
    sram: &SramBuffer,
    dram: Option<&DramBuffer>,
    opts: &EstimationOptions,
) -> InputStats {
    let mut memory = MemoryStats { sram_bytes: u64::from(sram.size_bytes), ..Default::default() };
    if let Some(dram) = dram {
        let traffic = dram_traffic_bytes(dram, opts) * u64::from(sram.num_loads.max(1));
        // a rolling buffer streams behind the compute; a full preload cannot
        // be hidden
        if sram.num_stripes > 1 {
            memory.dram_parallel_bytes = traffic;
        } else {
            memory.dram_non_parallel_bytes = traffic;
        }
    }
    InputStats { memory, stripes: stripe_movement(sram) }
}

fn expect_sram<'a>(graph: &'a OpGraph, id: BufferId, what: &str) -> Result<&'a SramBuffer> {
    graph.buffer(id).as_sram().ok_or_else(|| {
        CompileError::Invariant(format!("{what} must be an SRAM buffer"))
    })
}

/// An engine op, the post op fused onto its staged output, and the DMAs
/// around them.
fn estimate_engine_pass(
    graph: &OpGraph,
    engine: OpId,
    caps: &HardwareCapabilities,
    opts: &EstimationOptions,
    claimed: &mut BTreeSet<OpId>,
) -> Result<EstimatedPass> {
    let OpKind::Engine(engine_op) = &graph.op(engine).kind else {
        return Err(CompileError::Invariant("not an engine op".into()));
    };

    // the engine must stage into the post unit, which must be its only
    // consumer
    let staged = graph
        .op_output(engine)
        .ok_or_else(|| CompileError::Invariant("engine op has no output".into()))?;
    if !matches!(graph.buffer(staged), Buffer::PostInput(_)) {
        return Err(CompileError::Invariant(
            "engine output must stage into the post-processing unit".into(),
        ));
    }
    let consumers = graph.consumers(staged);
    if consumers.len() != 1 {
        return Err(CompileError::Invariant(
            "staged engine output must have exactly one consumer".into(),
        ));
    }
    let post = consumers[0].0;
    if !matches!(graph.op(post).kind, OpKind::Post(_)) || claimed.contains(&post) {
        return Err(CompileError::Invariant(
            "staged engine output must feed an unclaimed post op".into(),
        ));
    }
    claimed.insert(engine);
    claimed.insert(post);
    let mut ops = vec![engine, post];

    let inputs = graph.op_inputs(engine);
    if inputs.len() != 2 {
        return Err(CompileError::Invariant("engine op needs input and weights".into()));
    }
    let in_sram = expect_sram(graph, inputs[0], "engine input")?;
    let w_sram = expect_sram(graph, inputs[1], "engine weights")?;

    let mut stats = PassStats::default();

    // input activations
    let in_dram = input_dma(graph, inputs[0], claimed).map(|(dma, dram)| {
        claimed.insert(dma);
        ops.push(dma);
        dram
    });
    let in_dram_buf = in_dram.map(|b| graph.buffer(b).as_dram().unwrap());
    stats.input = activation_stats(in_sram, in_dram_buf, opts);

    // weights
    let (w_dma, w_dram) = input_dma(graph, inputs[1], claimed).ok_or_else(|| {
        CompileError::Invariant("engine weights must be streamed from DRAM".into())
    })?;
    claimed.insert(w_dma);
    ops.push(w_dma);
    let w_dram_buf = graph.buffer(w_dram).as_dram().unwrap();
    let w_traffic = u64::from(w_dram_buf.size_bytes);
    let mut w_memory = MemoryStats { sram_bytes: u64::from(w_sram.size_bytes), ..Default::default() };
    // double-buffered weights stream behind the compute
    if w_sram.num_stripes > 1 {
        w_memory.dram_parallel_bytes = w_traffic;
    } else {
        w_memory.dram_non_parallel_bytes = w_traffic;
    }
    let raw_weight_bytes = num_elements(&w_dram_buf.shape).max(1);
    let measured_savings = 1.0 - (w_traffic as f64 / raw_weight_bytes as f64) as f32;
    stats.weights = WeightsStats {
        memory: w_memory,
        stripes: StripesStats {
            num_central_stripes: shape::total_stripes(&w_sram.shape, &w_sram.stripe_shape),
            num_boundary_stripes: 0,
            num_reloads: 0,
        },
        compression_savings: opts
            .weight_compression_override
            .unwrap_or(measured_savings)
            .clamp(0.0, 1.0),
    };

    // output activations through the post op
    let out_sram_id = graph
        .op_output(post)
        .ok_or_else(|| CompileError::Invariant("post op has no output".into()))?;
    let out_sram = expect_sram(graph, out_sram_id, "post output")?;
    let out_dram = output_dma(graph, out_sram_id, claimed).map(|(dma, dram)| {
        claimed.insert(dma);
        ops.push(dma);
        dram
    });
    let out_dram_buf = out_dram.map(|b| graph.buffer(b).as_dram().unwrap());
    stats.output = activation_stats(out_sram, out_dram_buf, opts);

    // compute work
    let out_shape = out_sram.shape;
    let kernel = engine_op.weights_stripe;
    let per_element = match engine_op.op {
        crate::core::op::EngineOperation::DepthwiseConvolution => {
            u64::from(kernel[0]) * u64::from(kernel[1])
        }
        _ => u64::from(kernel[0]) * u64::from(kernel[1]) * u64::from(w_dram_buf.shape[2]),
    };
    let macs = num_elements(&out_shape) * per_element;
    stats.engine = EngineStats {
        operations: macs,
        cycle_count: macs.div_ceil(caps.total_macs_per_cycle()),
    };
    stats.post = post_work(&out_shape, caps);

    ops.sort();
    let operation_ids = union_operation_ids(graph, &ops);
    let metric = pass_metric(&stats, caps);
    Ok(EstimatedPass { metric, stats, ops, operation_ids, confidence: Confidence::Full })
}

/// A post op with no engine in front of it (standalone kernel).
fn estimate_post_pass(
    graph: &OpGraph,
    post: OpId,
    caps: &HardwareCapabilities,
    opts: &EstimationOptions,
    claimed: &mut BTreeSet<OpId>,
) -> Result<EstimatedPass> {
    claimed.insert(post);
    let mut ops = vec![post];
    let mut stats = PassStats::default();

    for (i, &input) in graph.op_inputs(post).iter().enumerate() {
        let sram = expect_sram(graph, input, "post input")?;
        let dram = input_dma(graph, input, claimed).map(|(dma, dram)| {
            claimed.insert(dma);
            ops.push(dma);
            dram
        });
        let dram_buf = dram.map(|b| graph.buffer(b).as_dram().unwrap());
        let s = activation_stats(sram, dram_buf, opts);
        if i == 0 {
            stats.input = s;
        } else {
            stats.input.memory += s.memory;
            stats.input.stripes += s.stripes;
        }
    }

    let out_id = graph
        .op_output(post)
        .ok_or_else(|| CompileError::Invariant("post op has no output".into()))?;
    let out_sram = expect_sram(graph, out_id, "post output")?;
    let out_dram = output_dma(graph, out_id, claimed).map(|(dma, dram)| {
        claimed.insert(dma);
        ops.push(dma);
        dram
    });
    let out_dram_buf = out_dram.map(|b| graph.buffer(b).as_dram().unwrap());
    stats.output = activation_stats(out_sram, out_dram_buf, opts);
    stats.post = post_work(&out_sram.shape, caps);

    ops.sort();
    let operation_ids = union_operation_ids(graph, &ops);
    let metric = pass_metric(&stats, caps);
    Ok(EstimatedPass { metric, stats, ops, operation_ids, confidence: Confidence::Full })
}

/// A chain of leftover DMAs moving data through SRAM staging: the glue round
/// trips that reformat a tensor between DRAM layouts.
fn estimate_conversion_pass(
    graph: &OpGraph,
    seed: OpId,
    caps: &HardwareCapabilities,
    opts: &EstimationOptions,
    claimed: &mut BTreeSet<OpId>,
) -> EstimatedPass {
    let mut ops = vec![seed];
    claimed.insert(seed);
    let mut frontier = vec![seed];
    while let Some(op) = frontier.pop() {
        let mut linked = Vec::new();
        if let Some(out) = graph.op_output(op) {
            if matches!(graph.buffer(out), Buffer::Sram(_)) {
                linked.extend(graph.consumers(out).iter().map(|&(c, _)| c));
            }
        }
        for &input in graph.op_inputs(op) {
            if matches!(graph.buffer(input), Buffer::Sram(_)) {
                linked.extend(graph.producers(input).iter().copied());
            }
        }
        for next in linked {
            if !claimed.contains(&next) && graph.op(next).is_dma() {
                claimed.insert(next);
                ops.push(next);
                frontier.push(next);
            }
        }
    }
    ops.sort();

    let mut stats = PassStats::default();
    for &op in &ops {
        for &input in graph.op_inputs(op) {
            match graph.buffer(input) {
                Buffer::Dram(d) => {
                    stats.input.memory.dram_non_parallel_bytes += dram_traffic_bytes(d, opts)
                }
                Buffer::Sram(s) => stats.input.memory.sram_bytes += u64::from(s.size_bytes),
                Buffer::PostInput(_) => {}
            }
        }
        if let Some(out) = graph.op_output(op) {
            if let Buffer::Dram(d) = graph.buffer(out) {
                stats.output.memory.dram_non_parallel_bytes += dram_traffic_bytes(d, opts);
            }
        }
    }
    let operation_ids = union_operation_ids(graph, &ops);
    let metric = pass_metric(&stats, caps);
    EstimatedPass { metric, stats, ops, operation_ids, confidence: Confidence::Full }
}

fn post_work(out_shape: &crate::core::shape::TensorShape, caps: &HardwareCapabilities) -> PostStats {
    let patches = u64::from(out_shape[0])
        * u64::from(shape::divide_round_up(out_shape[1], caps.patch_shape[0]))
        * u64::from(shape::divide_round_up(out_shape[2], caps.patch_shape[1]))
        * u64::from(shape::divide_round_up(out_shape[3], shape::BRICK_DEPTH));
    PostStats { num_patches: patches, cycle_count: patches * u64::from(caps.post_cycles_per_patch) }
}

fn union_operation_ids(graph: &OpGraph, ops: &[OpId]) -> BTreeSet<u32> {
    let mut ids = BTreeSet::new();
    for &op in ops {
        ids.extend(graph.op(op).operation_ids.iter().copied());
    }
    ids
}

/// Pass metric in estimated cycles: traffic that cannot overlap compute,
/// plus whichever is longer of the compute pipeline and the overlappable
/// traffic. The engine and post unit run in lock-step, so the pipeline costs
/// the slower of the two.
fn pass_metric(stats: &PassStats, caps: &HardwareCapabilities) -> f64 {
    let rate = f64::from(caps.dma_bytes_per_cycle);
    let parallel = stats.total_dram_parallel_bytes() as f64 / rate;
    let non_parallel = stats.total_dram_non_parallel_bytes() as f64 / rate;
    let compute = stats.engine.cycle_count.max(stats.post.cycle_count) as f64;
    non_parallel + compute.max(parallel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffer::{DramFormat, DramRole, QuantizationInfo, TraversalOrder};
    use crate::core::op::{
        BlockConfig, DmaOp, EngineAlgorithm, EngineOp, EngineOperation, Op, OpKind, PostKernel,
        PostOp, Rescale,
    };
    use crate::core::buffer::PostInputBuffer;

    /// dram -> dma -> sram -> engine(+weights) -> staged -> post -> sram -> dma -> dram
    fn lonely_engine_graph() -> OpGraph {
        let shape = [1, 32, 32, 16];
        let mut g = OpGraph::new();
        let quant = QuantizationInfo::default();

        let in_dram = g.add_buffer(Buffer::Dram(DramBuffer::new(
            shape,
            DramFormat::Planar,
            DramRole::Input,
            quant,
        )));
        let in_sram = g.add_buffer(Buffer::Sram(SramBuffer::new(
            shape,
            [1, 8, 32, 16],
            TraversalOrder::Xyz,
            2,
        )));
        let in_dma = g.add_op(Op::new(OpKind::Dma(DmaOp::new(DramFormat::Planar))));
        g.add_consumer(in_dram, in_dma, 0).unwrap();
        g.set_producer(in_sram, in_dma).unwrap();

        let w_shape = [1, 1, 16, 16];
        let w_dram = g.add_buffer(Buffer::Dram(
            DramBuffer::new(w_shape, DramFormat::EncodedWeights, DramRole::ConstantData, quant)
                .with_size(180),
        ));
        let w_sram =
            g.add_buffer(Buffer::Sram(SramBuffer::with_slot_size(w_shape, w_shape, 1, 180)));
        let w_dma = g.add_op(Op::new(OpKind::Dma(DmaOp::new(DramFormat::EncodedWeights))));
        g.add_consumer(w_dram, w_dma, 0).unwrap();
        g.set_producer(w_sram, w_dma).unwrap();

        let bc = BlockConfig::new(16, 16);
        let engine = g.add_op(Op::new(OpKind::Engine(EngineOp {
            op: EngineOperation::Convolution,
            algo: EngineAlgorithm::Direct,
            block_config: bc,
            input_stripe: [1, 8, 32, 16],
            output_stripe: [1, 8, 32, 16],
            weights_stripe: w_shape,
            order: TraversalOrder::Xyz,
            stride: (1, 1),
            pad_left: 0,
            pad_top: 0,
            upscale_factor: 1,
            lower_bound: 0,
            upper_bound: 255,
        })));
        g.add_consumer(in_sram, engine, 0).unwrap();
        g.add_consumer(w_sram, engine, 1).unwrap();
        let staged = g.add_buffer(Buffer::PostInput(PostInputBuffer::new(shape, [1, 8, 32, 16])));
        g.set_producer(staged, engine).unwrap();

        let post = g.add_op(Op::new(OpKind::Post(PostOp {
            kernel: PostKernel::Passthrough,
            block_config: bc,
            input_stripes: vec![[1, 8, 32, 16]],
            output_stripe: [1, 8, 32, 16],
            rescale0: Rescale::default(),
            rescale1: Rescale::default(),
            load_kernel: true,
        })));
        g.add_consumer(staged, post, 0).unwrap();
        let out_sram = g.add_buffer(Buffer::Sram(SramBuffer::new(
            shape,
            [1, 8, 32, 16],
            TraversalOrder::Xyz,
            2,
        )));
        g.set_producer(out_sram, post).unwrap();

        let out_dram = g.add_buffer(Buffer::Dram(DramBuffer::new(
            shape,
            DramFormat::Planar,
            DramRole::Output,
            quant,
        )));
        let out_dma = g.add_op(Op::new(OpKind::Dma(DmaOp::new(DramFormat::Planar))));
        g.add_consumer(out_sram, out_dma, 0).unwrap();
        g.set_producer(out_dram, out_dma).unwrap();
        g
    }

    #[test]
    fn test_lonely_engine_graph_is_one_pass() {
        let g = lonely_engine_graph();
        let caps = HardwareCapabilities::edge();
        let est = estimate_op_graph(&g, &caps, &EstimationOptions::default()).unwrap();
        assert_eq!(est.passes.len(), 1);
        let pass = &est.passes[0];
        // all five ops grouped together
        assert_eq!(pass.ops.len(), 5);
        assert!(pass.metric > 0.0);
        assert!(pass.stats.engine.operations > 0);
        assert!(pass.stats.post.num_patches > 0);
        // streamed input counts as parallel traffic
        assert!(pass.stats.input.memory.dram_parallel_bytes > 0);
        assert_eq!(est.op_to_pass.len(), 5);
    }

    #[test]
    fn test_estimation_is_deterministic() {
        let g = lonely_engine_graph();
        let caps = HardwareCapabilities::edge();
        let opts = EstimationOptions::default();
        let a = estimate_op_graph(&g, &caps, &opts).unwrap();
        let b = estimate_op_graph(&g, &caps, &opts).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.metric.to_bits(), b.metric.to_bits());
    }

    #[test]
    fn test_weight_compression_override() {
        let g = lonely_engine_graph();
        let caps = HardwareCapabilities::edge();
        let opts = EstimationOptions {
            weight_compression_override: Some(0.5),
            ..Default::default()
        };
        let est = estimate_op_graph(&g, &caps, &opts).unwrap();
        assert_eq!(est.passes[0].stats.weights.compression_savings, 0.5);
    }

    #[test]
    fn test_conversion_chain_is_one_pass() {
        // dram -> dma -> sram -> dma -> dram
        let mut g = OpGraph::new();
        let quant = QuantizationInfo::default();
        let shape = [1, 16, 16, 16];
        let a = g.add_buffer(Buffer::Dram(DramBuffer::new(
            shape,
            DramFormat::CompressedDeep,
            DramRole::Intermediate,
            quant,
        )));
        let staging = g.add_buffer(Buffer::Sram(SramBuffer::new(
            shape,
            [1, 8, 16, 16],
            TraversalOrder::Xyz,
            2,
        )));
        let b = g.add_buffer(Buffer::Dram(DramBuffer::new(
            shape,
            DramFormat::Planar,
            DramRole::Output,
            quant,
        )));
        let d1 = g.add_op(Op::new(OpKind::Dma(DmaOp::new(DramFormat::CompressedDeep))));
        let d2 = g.add_op(Op::new(OpKind::Dma(DmaOp::new(DramFormat::Planar))));
        g.add_consumer(a, d1, 0).unwrap();
        g.set_producer(staging, d1).unwrap();
        g.add_consumer(staging, d2, 0).unwrap();
        g.set_producer(b, d2).unwrap();

        let caps = HardwareCapabilities::edge();
        let est = estimate_op_graph(&g, &caps, &EstimationOptions::default()).unwrap();
        assert_eq!(est.passes.len(), 1);
        assert_eq!(est.passes[0].ops, vec![d1, d2]);
        // compressed read is cheaper than the planar write
        let s = &est.passes[0].stats;
        assert!(s.input.memory.dram_non_parallel_bytes < s.output.memory.dram_non_parallel_bytes + 1);
    }

    #[test]
    fn test_estimate_only_pass_is_degraded() {
        let mut g = OpGraph::new();
        let quant = QuantizationInfo::default();
        let a = g.add_buffer(Buffer::Dram(DramBuffer::new(
            [1, 8, 8, 16],
            DramFormat::Planar,
            DramRole::Intermediate,
            quant,
        )));
        let b = g.add_buffer(Buffer::Dram(DramBuffer::new(
            [1, 8, 8, 16],
            DramFormat::Planar,
            DramRole::Intermediate,
            quant,
        )));
        let op = g.add_op(Op::new(OpKind::EstimateOnly(
            crate::core::op::EstimateOnlyOp { reason: "unsupported op".into() },
        )));
        g.add_consumer(a, op, 0).unwrap();
        g.set_producer(b, op).unwrap();

        let est = estimate_op_graph(
            &g,
            &HardwareCapabilities::edge(),
            &EstimationOptions::default(),
        )
        .unwrap();
        assert_eq!(est.passes.len(), 1);
        assert!(matches!(&est.passes[0].confidence, Confidence::Degraded { reason } if reason == "unsupported op"));
        assert_eq!(est.perf.passes[0].notes, vec!["unsupported op".to_string()]);
    }
}
