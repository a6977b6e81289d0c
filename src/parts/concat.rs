//! Concatenation in DRAM: every input is staged through SRAM and written
//! into the right region of one shared output buffer with an offset DMA.
//! The output layout is picked from the input offsets: compression needs
//! every region to start on a compression-cell boundary, plain DMA tiling
//! does not care.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::core::buffer::{
    Buffer, DramBuffer, DramFormat, DramRole, QuantizationInfo, SramBuffer, TraversalOrder,
};
use crate::core::capabilities::HardwareCapabilities;
use crate::core::config::CompilationOptions;
use crate::core::graph::OpGraph;
use crate::core::op::{BlockConfig, DmaOp, Op, OpKind};
use crate::core::plan::{PartId, PartInputSlot, PartOutputSlot, Plan};
use crate::core::shape::{self, TensorShape};
use crate::parts::{CascadeType, Part};

#[derive(Debug)]
pub struct ConcatPart {
    id: PartId,
    input_shapes: Vec<TensorShape>,
    /// Concatenation axis: 1 = height, 2 = width, 3 = channels.
    axis: usize,
    quant: QuantizationInfo,
    operation_ids: BTreeSet<u32>,
    caps: Arc<HardwareCapabilities>,
    options: Arc<CompilationOptions>,
}

impl ConcatPart {
    pub fn new(
        id: PartId,
        input_shapes: Vec<TensorShape>,
        axis: usize,
        quant: QuantizationInfo,
        operation_ids: BTreeSet<u32>,
        caps: Arc<HardwareCapabilities>,
        options: Arc<CompilationOptions>,
    ) -> Self {
        debug_assert!((1..=3).contains(&axis));
        debug_assert!(!input_shapes.is_empty());
        Self { id, input_shapes, axis, quant, operation_ids, caps, options }
    }

    pub fn output_shape(&self) -> TensorShape {
        let mut out = self.input_shapes[0];
        out[self.axis] = self.input_shapes.iter().map(|s| s[self.axis]).sum();
        out
    }

    /// Byte-free element offsets of each input region along the axis.
    fn offsets(&self) -> Vec<u32> {
        let mut acc = 0;
        self.input_shapes
            .iter()
            .map(|s| {
                let o = acc;
                acc += s[self.axis];
                o
            })
            .collect()
    }

    /// Compression cells cannot start mid-cell, so a compressed output needs
    /// every region offset cell-aligned. DMA tiling handles arbitrary
    /// element offsets, so `Tiled` is always available as the fallback.
    pub fn select_output_format(&self) -> DramFormat {
        if self.options.compression_allowed() {
            let cell_dim = self.axis - 1;
            let offsets = self.offsets();
            let deep = self.caps.cell_shape_deep[cell_dim];
            if offsets.iter().all(|&o| o % deep == 0) {
                return DramFormat::CompressedDeep;
            }
            let wide = self.caps.cell_shape_wide[cell_dim];
            if offsets.iter().all(|&o| o % wide == 0) {
                return DramFormat::CompressedWide;
            }
        }
        DramFormat::Tiled
    }
}

impl Part for ConcatPart {
    fn id(&self) -> PartId {
        self.id
    }

    fn set_id(&mut self, id: PartId) {
        self.id = id;
    }

    fn operation_ids(&self) -> &BTreeSet<u32> {
        &self.operation_ids
    }

    fn get_plans(
        &self,
        cascade: CascadeType,
        _block_config: BlockConfig,
        _prev_sram: &[SramBuffer],
        _num_weight_stripes: u32,
    ) -> Vec<Plan> {
        if cascade != CascadeType::Lonely {
            return Vec::new();
        }
        let out_format = self.select_output_format();
        let mut graph = OpGraph::new();
        let out_dram = graph.add_buffer(Buffer::Dram(DramBuffer::new(
            self.output_shape(),
            out_format,
            DramRole::Intermediate,
            self.quant,
        )));

        let mut inputs = BTreeMap::new();
        let offsets = self.offsets();
        for (i, in_shape) in self.input_shapes.iter().enumerate() {
            let in_dram = graph.add_buffer(Buffer::Dram(DramBuffer::new(
                *in_shape,
                DramFormat::Planar,
                DramRole::Intermediate,
                self.quant,
            )));
            // stage through a small rolling SRAM buffer, one input at a time
            let stripe = [in_shape[0], in_shape[1].min(shape::BRICK_HEIGHT), in_shape[2], in_shape[3]];
            let slots = if shape::is_full_tensor(in_shape, &stripe) { 1 } else { 2 };
            let staging = graph.add_buffer(Buffer::Sram(SramBuffer::new(
                *in_shape,
                stripe,
                TraversalOrder::Xyz,
                slots,
            )));
            let load = graph.add_op(Op::with_operation_ids(
                OpKind::Dma(DmaOp::new(DramFormat::Planar)),
                self.operation_ids.clone(),
            ));
            let mut offset = [0u32; 4];
            offset[self.axis] = offsets[i];
            let store = graph.add_op(Op::with_operation_ids(
                OpKind::Dma(DmaOp::with_offset(out_format, offset)),
                self.operation_ids.clone(),
            ));
            if graph.add_consumer(in_dram, load, 0).is_err()
                || graph.set_producer(staging, load).is_err()
                || graph.add_consumer(staging, store, 0).is_err()
            {
                return Vec::new();
            }
            // several stores fill disjoint regions of the shared output
            graph.add_producer(out_dram, store);
            inputs.insert(PartInputSlot::new(self.id, i as u32), in_dram);
        }

        let outputs = BTreeMap::from([(PartOutputSlot::new(self.id, 0), out_dram)]);
        let mut plan = Plan::new(graph, inputs, outputs);
        // staging buffers are live one input at a time, never all at once
        plan.pre_allocated = true;
        vec![plan]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concat(axis: usize, shapes: Vec<TensorShape>) -> ConcatPart {
        ConcatPart::new(
            4,
            shapes,
            axis,
            QuantizationInfo::default(),
            BTreeSet::from([2]),
            Arc::new(HardwareCapabilities::edge()),
            Arc::new(CompilationOptions::default()),
        )
    }

    #[test]
    fn test_aligned_channel_concat_compresses() {
        // offsets 0 and 32: aligned to the deep cell (8x8x32)
        let part = concat(3, vec![[1, 16, 16, 32], [1, 16, 16, 32]]);
        assert_eq!(part.select_output_format(), DramFormat::CompressedDeep);
    }

    #[test]
    fn test_wide_cell_alignment_fallback() {
        // offsets 0 and 16: misses the deep cell (32), hits the wide cell (16)
        let part = concat(3, vec![[1, 16, 16, 16], [1, 16, 16, 16]]);
        assert_eq!(part.select_output_format(), DramFormat::CompressedWide);
    }

    #[test]
    fn test_unaligned_concat_falls_back_to_tiled() {
        // second region starts one element off any cell boundary
        let part = concat(3, vec![[1, 16, 16, 33], [1, 16, 16, 31]]);
        assert_eq!(part.select_output_format(), DramFormat::Tiled);
    }

    #[test]
    fn test_strict_precision_disables_compression() {
        let part = ConcatPart::new(
            4,
            vec![[1, 16, 16, 32], [1, 16, 16, 32]],
            3,
            QuantizationInfo::default(),
            BTreeSet::new(),
            Arc::new(HardwareCapabilities::edge()),
            Arc::new(CompilationOptions { strict_precision: true, ..Default::default() }),
        );
        assert_eq!(part.select_output_format(), DramFormat::Tiled);
    }

    #[test]
    fn test_plan_shares_one_output_buffer() {
        let part = concat(3, vec![[1, 16, 16, 32], [1, 16, 16, 32]]);
        let plans = part.get_plans(CascadeType::Lonely, BlockConfig::new(16, 16), &[], 1);
        assert_eq!(plans.len(), 1);
        let plan = &plans[0];
        assert!(plan.pre_allocated);
        let out = plan.output_buffer(PartOutputSlot::new(4, 0)).unwrap();
        assert_eq!(plan.graph.producers(out).len(), 2);
        // output shape is the channel sum
        assert_eq!(plan.graph.buffer(out).shape()[3], 64);
    }
}
