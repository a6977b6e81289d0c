//! Glue synthesis: the adapter ops and buffers inserted between two chosen
//! plans whose boundary buffers are not directly compatible.
//!
//! A producer's output boundary owns at most one `EndingGlue`; each consumer
//! input boundary owns a `StartingGlue`. Their op-graph fragments attach to
//! buffers that live inside the neighbouring plans, so those attachments are
//! expressed symbolically with `BufferRef` and resolved when a combination
//! is flattened into one op graph.

use serde::{Deserialize, Serialize};

use crate::core::buffer::{
    Buffer, DramBuffer, DramFormat, DramRole, SramBuffer, TraversalOrder,
};
use crate::core::capabilities::HardwareCapabilities;
use crate::core::config::CompilationOptions;
use crate::core::error::{CompileError, Result};
use crate::core::graph::{BufferId, OpGraph, OpId};
use crate::core::op::{DmaOp, Op, OpKind};
use crate::core::plan::{PartInputSlot, PartOutputSlot};
use crate::core::shape::{TensorShape, BRICK_HEIGHT};

/// A symbolic reference to a buffer that lives outside a glue's own graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BufferRef {
    /// The buffer realizing a plan's output slot.
    PlanOutput(PartOutputSlot),
    /// The buffer realizing a plan's input slot.
    PlanInput(PartInputSlot),
    /// A buffer inside the ending glue attached to the given output slot.
    EndingGlueLocal(PartOutputSlot, BufferId),
}

/// How a glue fragment attaches to the buffers around it.
#[derive(Debug, Clone, Default)]
pub struct GlueConnections {
    /// Buffer replacement: the first buffer (in a neighbouring plan) is not
    /// materialized; every edge to it is rewired to the second. This is how
    /// two plans agree to literally share one buffer, eliding any copy.
    pub replacements: Vec<(BufferRef, BufferRef)>,
    /// A local op produces an external buffer.
    pub op_to_buffer: Vec<(OpId, BufferRef)>,
    /// An external buffer feeds a local op at the given input index.
    pub buffer_to_op: Vec<(BufferRef, OpId, u32)>,
}

/// Glue consumed at a part's input boundary.
#[derive(Debug, Clone, Default)]
pub struct StartingGlue {
    pub graph: OpGraph,
    pub external: GlueConnections,
}

/// Glue produced at a part's output boundary.
#[derive(Debug, Clone, Default)]
pub struct EndingGlue {
    pub graph: OpGraph,
    pub external: GlueConnections,
}

/// Result of synthesizing the glue for one output slot and all its
/// consumers. `starting` is parallel to the consumer list passed in.
#[derive(Debug, Default)]
pub struct StartingAndEndingGlues {
    pub ending: Option<EndingGlue>,
    pub starting: Vec<StartingGlue>,
}

/// Whether a stripe writes the DRAM buffer at compression-cell granularity.
/// A dimension passes if the stripe is a cell multiple there; a full-tensor
/// stripe passes only when the tensor dimension itself is a cell multiple,
/// since the compressor cannot start a region mid-cell.
fn stripe_cell_aligned(shape: &TensorShape, stripe: &TensorShape, cell: &[u32; 3]) -> bool {
    (1..4).all(|d| {
        stripe[d] % cell[d - 1] == 0 || (stripe[d] >= shape[d] && shape[d] % cell[d - 1] == 0)
    })
}

/// Picks the layout for a DRAM buffer synthesized between two SRAM buffers.
/// Preference order: compressed (lowest bandwidth) when every stripe touching
/// the buffer is cell-aligned, tiled otherwise. Deterministic in its inputs,
/// which estimation reproducibility depends on.
pub fn select_dram_format(
    shape: &TensorShape,
    stripes: &[TensorShape],
    caps: &HardwareCapabilities,
    options: &CompilationOptions,
) -> DramFormat {
    if options.compression_allowed() {
        if stripes.iter().all(|s| stripe_cell_aligned(shape, s, &caps.cell_shape_deep)) {
            return DramFormat::CompressedDeep;
        }
        if stripes.iter().all(|s| stripe_cell_aligned(shape, s, &caps.cell_shape_wide)) {
            return DramFormat::CompressedWide;
        }
    }
    DramFormat::Tiled
}

fn staging_sram(shape: &TensorShape) -> SramBuffer {
    let stripe = [shape[0], shape[1].min(BRICK_HEIGHT), shape[2], shape[3]];
    let slots = if crate::core::shape::is_full_tensor(shape, &stripe) { 1 } else { 2 };
    SramBuffer::new(*shape, stripe, TraversalOrder::Xyz, slots)
}

/// Synthesizes the glue between one producing buffer and every consumer of
/// its output slot.
///
/// Cases, per consumer:
/// - identical SRAM buffers: pure replacement, the zero-cost cascading case;
/// - SRAM to incompatible SRAM: a round trip through one fresh DRAM buffer,
///   created once in the ending glue and shared by every such consumer
///   (fan-out computes the data once and adapts it per consumer);
/// - exactly one side in DRAM: the missing single DMA hop;
/// - DRAM to DRAM: shared by replacement. The DMA engine reads any DRAM
///   layout directly, so a layout difference only forces a physical
///   conversion (a staged round trip through SRAM) when the consumer is a
///   network-facing output buffer, whose linear layout is a contract with
///   the caller.
pub fn synthesize_glue(
    producer_slot: PartOutputSlot,
    producer: &Buffer,
    consumers: &[(PartInputSlot, &Buffer)],
    caps: &HardwareCapabilities,
    options: &CompilationOptions,
) -> Result<StartingAndEndingGlues> {
    let mut glues = StartingAndEndingGlues::default();
    // lazily created shared DRAM buffer for SRAM-to-SRAM round trips
    let mut roundtrip_dram: Option<BufferId> = None;

    for &(input_slot, consumer) in consumers {
        let mut starting = StartingGlue::default();
        match (producer, consumer) {
            (Buffer::Sram(p), Buffer::Sram(c)) => {
                if p.is_compatible_with(c) {
                    starting.external.replacements.push((
                        BufferRef::PlanInput(input_slot),
                        BufferRef::PlanOutput(producer_slot),
                    ));
                } else {
                    let dram_id = match roundtrip_dram {
                        Some(id) => id,
                        None => {
                            let mut ending = EndingGlue::default();
                            let format = select_dram_format(
                                &p.shape,
                                &[p.stripe_shape, c.stripe_shape],
                                caps,
                                options,
                            );
                            let dram = ending.graph.add_buffer(Buffer::Dram(DramBuffer::new(
                                p.shape,
                                format,
                                DramRole::Intermediate,
                                Default::default(),
                            )));
                            let store = ending
                                .graph
                                .add_op(Op::new(OpKind::Dma(DmaOp::new(format))));
                            ending.graph.set_producer(dram, store)?;
                            ending.external.buffer_to_op.push((
                                BufferRef::PlanOutput(producer_slot),
                                store,
                                0,
                            ));
                            glues.ending = Some(ending);
                            roundtrip_dram = Some(dram);
                            dram
                        }
                    };
                    let format = match glues
                        .ending
                        .as_ref()
                        .and_then(|e| e.graph.buffer(dram_id).as_dram())
                    {
                        Some(d) => d.format,
                        None => {
                            return Err(CompileError::Invariant(
                                "round-trip DRAM buffer missing from ending glue".into(),
                            ))
                        }
                    };
                    let load = starting.graph.add_op(Op::new(OpKind::Dma(DmaOp::new(format))));
                    starting.external.buffer_to_op.push((
                        BufferRef::EndingGlueLocal(producer_slot, dram_id),
                        load,
                        0,
                    ));
                    starting
                        .external
                        .op_to_buffer
                        .push((load, BufferRef::PlanInput(input_slot)));
                }
            }
            (Buffer::Sram(_), Buffer::Dram(c)) => {
                let store = starting.graph.add_op(Op::new(OpKind::Dma(DmaOp::new(c.format))));
                starting
                    .external
                    .buffer_to_op
                    .push((BufferRef::PlanOutput(producer_slot), store, 0));
                starting
                    .external
                    .op_to_buffer
                    .push((store, BufferRef::PlanInput(input_slot)));
            }
            (Buffer::Dram(p), Buffer::Sram(_)) => {
                let load = starting.graph.add_op(Op::new(OpKind::Dma(DmaOp::new(p.format))));
                starting
                    .external
                    .buffer_to_op
                    .push((BufferRef::PlanOutput(producer_slot), load, 0));
                starting
                    .external
                    .op_to_buffer
                    .push((load, BufferRef::PlanInput(input_slot)));
            }
            (Buffer::Dram(p), Buffer::Dram(c)) => {
                if p.format == c.format || c.role != DramRole::Output {
                    starting.external.replacements.push((
                        BufferRef::PlanInput(input_slot),
                        BufferRef::PlanOutput(producer_slot),
                    ));
                } else {
                    // physical conversion into the network-facing layout
                    let staging = starting.graph.add_buffer(Buffer::Sram(staging_sram(&c.shape)));
                    let load = starting.graph.add_op(Op::new(OpKind::Dma(DmaOp::new(p.format))));
                    let store = starting.graph.add_op(Op::new(OpKind::Dma(DmaOp::new(c.format))));
                    starting.graph.set_producer(staging, load)?;
                    starting.graph.add_consumer(staging, store, 0)?;
                    starting
                        .external
                        .buffer_to_op
                        .push((BufferRef::PlanOutput(producer_slot), load, 0));
                    starting
                        .external
                        .op_to_buffer
                        .push((store, BufferRef::PlanInput(input_slot)));
                }
            }
            (Buffer::PostInput(_), _) | (_, Buffer::PostInput(_)) => {
                return Err(CompileError::Invariant(
                    "post-input buffers cannot appear on a part boundary".into(),
                ));
            }
        }
        glues.starting.push(starting);
    }
    Ok(glues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffer::QuantizationInfo;

    fn sram(stripe_h: u32) -> Buffer {
        Buffer::Sram(SramBuffer::new([1, 32, 16, 16], [1, stripe_h, 16, 16], TraversalOrder::Xyz, 2))
    }

    fn dram(format: DramFormat, role: DramRole) -> Buffer {
        Buffer::Dram(DramBuffer::new([1, 32, 16, 16], format, role, QuantizationInfo::default()))
    }

    fn slot_out() -> PartOutputSlot {
        PartOutputSlot::new(0, 0)
    }

    fn slot_in(part: u32) -> PartInputSlot {
        PartInputSlot::new(part, 0)
    }

    fn caps_and_opts() -> (HardwareCapabilities, CompilationOptions) {
        (HardwareCapabilities::edge(), CompilationOptions::default())
    }

    #[test]
    fn test_compatible_sram_is_pure_replacement() {
        let (caps, opts) = caps_and_opts();
        let p = sram(8);
        let c = sram(8);
        let glues =
            synthesize_glue(slot_out(), &p, &[(slot_in(1), &c)], &caps, &opts).unwrap();
        assert!(glues.ending.is_none());
        assert_eq!(glues.starting.len(), 1);
        assert_eq!(glues.starting[0].graph.num_ops(), 0);
        assert_eq!(glues.starting[0].external.replacements.len(), 1);
    }

    #[test]
    fn test_incompatible_sram_round_trips_through_dram() {
        let (caps, opts) = caps_and_opts();
        let p = sram(8);
        let c = sram(16);
        let glues =
            synthesize_glue(slot_out(), &p, &[(slot_in(1), &c)], &caps, &opts).unwrap();
        let ending = glues.ending.unwrap();
        assert_eq!(ending.graph.num_ops(), 1);
        assert_eq!(ending.graph.num_buffers(), 1);
        assert_eq!(glues.starting[0].graph.num_ops(), 1);
        assert!(glues.starting[0].external.replacements.is_empty());
    }

    #[test]
    fn test_fan_out_shares_one_dram_buffer() {
        let (caps, opts) = caps_and_opts();
        let p = sram(8);
        let c1 = sram(16);
        let c2 = sram(32);
        let glues = synthesize_glue(
            slot_out(),
            &p,
            &[(slot_in(1), &c1), (slot_in(2), &c2)],
            &caps,
            &opts,
        )
        .unwrap();
        // one ending glue with one DRAM buffer, two starting glues each with
        // their own load DMA
        assert_eq!(glues.ending.unwrap().graph.num_buffers(), 1);
        assert_eq!(glues.starting.len(), 2);
        for s in &glues.starting {
            assert_eq!(s.graph.num_ops(), 1);
        }
    }

    #[test]
    fn test_dram_to_dram_same_format_shares_buffer() {
        let (caps, opts) = caps_and_opts();
        let p = dram(DramFormat::Planar, DramRole::Intermediate);
        let c = dram(DramFormat::Planar, DramRole::Output);
        let glues =
            synthesize_glue(slot_out(), &p, &[(slot_in(1), &c)], &caps, &opts).unwrap();
        assert!(glues.ending.is_none());
        assert_eq!(glues.starting[0].external.replacements.len(), 1);
    }

    #[test]
    fn test_conversion_into_network_output() {
        let (caps, opts) = caps_and_opts();
        let p = dram(DramFormat::CompressedDeep, DramRole::Intermediate);
        let c = dram(DramFormat::Planar, DramRole::Output);
        let glues =
            synthesize_glue(slot_out(), &p, &[(slot_in(1), &c)], &caps, &opts).unwrap();
        let s = &glues.starting[0];
        assert_eq!(s.graph.num_ops(), 2);
        assert_eq!(s.graph.num_buffers(), 1);
        assert!(s.external.replacements.is_empty());
    }

    #[test]
    fn test_format_preference_chain() {
        let (caps, mut opts) = caps_and_opts();
        let shape = [1, 32, 32, 32];
        // stripes aligned to the deep cell
        assert_eq!(
            select_dram_format(&shape, &[[1, 8, 32, 32]], &caps, &opts),
            DramFormat::CompressedDeep
        );
        // channel depth 16 misses the deep cell but fits the wide one
        assert_eq!(
            select_dram_format(&[1, 32, 32, 16], &[[1, 8, 16, 16]], &caps, &opts),
            DramFormat::CompressedWide
        );
        // unaligned stripe height falls back to tiled
        assert_eq!(
            select_dram_format(&shape, &[[1, 4, 32, 32]], &caps, &opts),
            DramFormat::Tiled
        );
        opts.enable_intermediate_compression = false;
        assert_eq!(
            select_dram_format(&shape, &[[1, 8, 32, 32]], &caps, &opts),
            DramFormat::Tiled
        );
    }
}
