//! # cascata: plan search and performance estimation for a fixed-function NPU
//!
//! cascata is the backend core of a compiler that lowers quantized neural
//! network graphs onto an NPU accelerator. For each part of the network it
//! enumerates candidate execution plans (stripe shapes, SRAM vs DRAM buffer
//! placement, DRAM tensor layouts), then searches for the cheapest
//! SRAM-feasible assignment of one plan per part across the whole graph,
//! inserting DMA glue wherever neighbouring plans disagree.
//!
//! ## Core Modules
//!
//! - **[`core`]**: the data model: buffers, ops, the op-graph arena, plans,
//!   hardware capabilities and options.
//! - **[`parts`]**: the part interface ([`parts::Part`]), the graph of parts
//!   and the concrete part implementations.
//! - **[`combiner`]**: the combinatorial search assembling per-part plans
//!   into a whole-graph [`Combination`] under the SRAM budget.
//! - **[`estimation`]**: the cost oracle partitioning op graphs into passes
//!   and producing the performance metric.
//!
//! Front-end network translation, command-stream serialization and all file
//! or wire I/O live outside this crate.

pub mod combiner;
pub mod core;
pub mod estimation;
pub mod parts;

pub use crate::combiner::combination::{Combination, MergedOpGraph};
pub use crate::combiner::Combiner;
pub use crate::core::capabilities::HardwareCapabilities;
pub use crate::core::config::{CompilationOptions, EstimationOptions, MetricAggregation};
pub use crate::core::error::{CompileError, Result};
pub use crate::core::plan::{PartId, PartInputSlot, PartOutputSlot, Plan};
pub use crate::estimation::stats::NetworkPerformanceData;
pub use crate::estimation::{estimate_op_graph, EstimatedOpGraph};
pub use crate::parts::{CascadeType, GraphOfParts, Part};

/// Compiles a graph of parts into the best combination the search can find:
/// one plan per part plus the glue connecting them, ready for command-stream
/// generation.
pub fn compile(
    mut graph: GraphOfParts,
    caps: &HardwareCapabilities,
    options: &CompilationOptions,
    est_opts: &EstimationOptions,
) -> Result<Combination> {
    graph.sort_and_compact()?;
    let mut combiner = Combiner::new(&graph, caps, options, est_opts);
    combiner.run()
}

/// The standalone performance-estimation entry point: compiles the graph,
/// flattens the chosen combination and returns the per-pass report.
pub fn estimate_network(
    graph: GraphOfParts,
    caps: &HardwareCapabilities,
    options: &CompilationOptions,
    est_opts: &EstimationOptions,
) -> Result<NetworkPerformanceData> {
    let combination = compile(graph, caps, options, est_opts)?;
    let merged = combination.build_op_graph()?;
    let estimated = estimate_op_graph(&merged.graph, caps, est_opts)?;
    Ok(estimated.perf)
}
