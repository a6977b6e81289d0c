//! The compute part: convolution, depthwise convolution and fully-connected
//! layers running on the compute engine, always paired with a
//! post-processing op on its output. Plan generation enumerates stripe
//! splits per cascade role; each split trades SRAM footprint against DRAM
//! reload traffic.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::trace;

use crate::core::buffer::{
    Buffer, DramBuffer, DramFormat, DramRole, PostInputBuffer, QuantizationInfo, SramBuffer,
    TraversalOrder,
};
use crate::core::capabilities::HardwareCapabilities;
use crate::core::config::CompilationOptions;
use crate::core::graph::OpGraph;
use crate::core::op::{
    BlockConfig, DmaOp, EngineAlgorithm, EngineOp, EngineOperation, Op, OpKind, PostKernel, PostOp,
    Rescale,
};
use crate::core::plan::{PartId, PartInputSlot, PartOutputSlot, Plan};
use crate::core::shape::{self, TensorShape, BRICK_DEPTH, BRICK_HEIGHT};
use crate::core::weights::estimate_encoded_weights;
use crate::parts::{CascadeType, Part};

/// One stripe-shape choice: how the input and output tensors are carved up.
#[derive(Debug, Clone)]
struct StripeConfig {
    input_stripe: TensorShape,
    output_stripe: TensorShape,
    /// Times the input tensor is streamed in (re-fetched per output-depth
    /// stripe when splitting in depth).
    input_loads: u32,
}

/// Which ends of the plan touch DRAM.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Ends {
    dma_in: bool,
    dma_out: bool,
}

#[derive(Debug)]
pub struct EnginePart {
    id: PartId,
    input_shape: TensorShape,
    output_shape: TensorShape,
    input_quant: QuantizationInfo,
    output_quant: QuantizationInfo,
    /// HWIO; depthwise uses [kh, kw, c, 1].
    weights_shape: TensorShape,
    stride: (u32, u32),
    pad_top: u32,
    pad_left: u32,
    operation: EngineOperation,
    algo: EngineAlgorithm,
    lower_bound: i16,
    upper_bound: i16,
    upscale_factor: u32,
    operation_ids: BTreeSet<u32>,
    caps: Arc<HardwareCapabilities>,
    options: Arc<CompilationOptions>,
}

impl EnginePart {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: PartId,
        input_shape: TensorShape,
        output_shape: TensorShape,
        weights_shape: TensorShape,
        stride: (u32, u32),
        pad_top: u32,
        pad_left: u32,
        operation: EngineOperation,
        input_quant: QuantizationInfo,
        output_quant: QuantizationInfo,
        operation_ids: BTreeSet<u32>,
        caps: Arc<HardwareCapabilities>,
        options: Arc<CompilationOptions>,
    ) -> Self {
        Self {
            id,
            input_shape,
            output_shape,
            input_quant,
            output_quant,
            weights_shape,
            stride,
            pad_top,
            pad_left,
            operation,
            algo: EngineAlgorithm::Direct,
            lower_bound: 0,
            upper_bound: 255,
            upscale_factor: 1,
            operation_ids,
            caps,
            options,
        }
    }

    /// A 1x1 identity convolution, used for reinterpret-style parts.
    pub fn identity(
        id: PartId,
        shape: TensorShape,
        quant: QuantizationInfo,
        operation_ids: BTreeSet<u32>,
        caps: Arc<HardwareCapabilities>,
        options: Arc<CompilationOptions>,
    ) -> Self {
        Self::new(
            id,
            shape,
            shape,
            [1, 1, shape[3], shape[3]],
            (1, 1),
            0,
            0,
            EngineOperation::Convolution,
            quant,
            quant,
            operation_ids,
            caps,
            options,
        )
    }

    pub fn bounds(&self) -> (i16, i16) {
        (self.lower_bound, self.upper_bound)
    }

    fn kernel_height(&self) -> u32 {
        self.weights_shape[0]
    }

    /// Stripe splits worth trying, most SRAM-hungry first.
    fn stripe_candidates(&self, block_config: BlockConfig) -> Vec<StripeConfig> {
        let mut out = Vec::new();
        // whole tensor resident: no streaming at all
        out.push(StripeConfig {
            input_stripe: self.input_shape,
            output_stripe: self.output_shape,
            input_loads: 1,
        });
        // split in height, block-aligned so cascaded parts stay in lock-step
        let bh = shape::round_up(block_config.height, BRICK_HEIGHT);
        if self.output_shape[1] > bh {
            let in_h = (bh * self.stride.0).min(self.input_shape[1]);
            out.push(StripeConfig {
                input_stripe: [self.input_shape[0], in_h, self.input_shape[2], self.input_shape[3]],
                output_stripe: [
                    self.output_shape[0],
                    bh,
                    self.output_shape[2],
                    self.output_shape[3],
                ],
                input_loads: 1,
            });
        }
        // split in output depth: the whole input is re-streamed per stripe
        if self.output_shape[3] > BRICK_DEPTH {
            let oc_stripes = shape::divide_round_up(self.output_shape[3], BRICK_DEPTH);
            out.push(StripeConfig {
                input_stripe: self.input_shape,
                output_stripe: [
                    self.output_shape[0],
                    self.output_shape[1],
                    self.output_shape[2],
                    BRICK_DEPTH,
                ],
                input_loads: oc_stripes,
            });
        }
        out
    }

    /// Builds one complete plan for a stripe choice. `prev` carries the
    /// predecessor's SRAM buffer for Middle/End roles, which the plan must
    /// adopt as its input.
    fn build_plan(
        &self,
        cfg: &StripeConfig,
        ends: Ends,
        block_config: BlockConfig,
        num_weight_stripes: u32,
        prev: Option<&SramBuffer>,
    ) -> Option<Plan> {
        let mut graph = OpGraph::new();
        let ids = self.operation_ids.clone();

        // input side
        let input_sram = match prev {
            Some(p) => p.clone(),
            None => {
                let streaming = !shape::is_full_tensor(&self.input_shape, &cfg.input_stripe);
                let slots = if !streaming {
                    1
                } else if self.kernel_height() > 1 {
                    3
                } else {
                    2
                };
                SramBuffer::new(self.input_shape, cfg.input_stripe, TraversalOrder::Xyz, slots)
                    .with_num_loads(cfg.input_loads)
            }
        };
        let in_sram = graph.add_buffer(Buffer::Sram(input_sram));
        let mut in_dram = None;
        if ends.dma_in {
            let dram = graph.add_buffer(Buffer::Dram(DramBuffer::new(
                self.input_shape,
                DramFormat::Planar,
                DramRole::Intermediate,
                self.input_quant,
            )));
            let dma = graph.add_op(Op::with_operation_ids(
                OpKind::Dma(DmaOp::new(DramFormat::Planar)),
                ids.clone(),
            ));
            graph.add_consumer(dram, dma, 0).ok()?;
            graph.set_producer(in_sram, dma).ok()?;
            in_dram = Some(dram);
        }

        // weights: encoded stream in DRAM, streamed into SRAM per depth stripe
        let encoded = estimate_encoded_weights(&self.weights_shape, self.algo);
        let oc_stripes = shape::divide_round_up(self.output_shape[3], cfg.output_stripe[3]);
        let weight_slot = shape::divide_round_up(encoded.size_bytes, oc_stripes);
        let weights_stripe = [
            self.weights_shape[0],
            self.weights_shape[1],
            self.weights_shape[2],
            cfg.output_stripe[3].min(self.weights_shape[3]),
        ];
        let w_dram_buf = DramBuffer::new(
            self.weights_shape,
            DramFormat::EncodedWeights,
            DramRole::ConstantData,
            self.input_quant,
        )
        .with_size(encoded.size_bytes);
        let w_dram = graph.add_buffer(Buffer::Dram(w_dram_buf));
        let w_sram = graph.add_buffer(Buffer::Sram(SramBuffer::with_slot_size(
            self.weights_shape,
            weights_stripe,
            num_weight_stripes.min(oc_stripes),
            weight_slot,
        )));
        let w_dma = graph.add_op(Op::with_operation_ids(
            OpKind::Dma(DmaOp::new(DramFormat::EncodedWeights)),
            ids.clone(),
        ));
        graph.add_consumer(w_dram, w_dma, 0).ok()?;
        graph.set_producer(w_sram, w_dma).ok()?;

        // compute engine feeding the post unit directly
        let engine = graph.add_op(Op::with_operation_ids(
            OpKind::Engine(EngineOp {
                op: self.operation,
                algo: self.algo,
                block_config,
                input_stripe: cfg.input_stripe,
                output_stripe: cfg.output_stripe,
                weights_stripe,
                order: TraversalOrder::Xyz,
                stride: self.stride,
                pad_left: self.pad_left,
                pad_top: self.pad_top,
                upscale_factor: self.upscale_factor,
                lower_bound: self.lower_bound,
                upper_bound: self.upper_bound,
            }),
            ids.clone(),
        ));
        graph.add_consumer(in_sram, engine, 0).ok()?;
        graph.add_consumer(w_sram, engine, 1).ok()?;
        let post_in = graph.add_buffer(Buffer::PostInput(PostInputBuffer::new(
            self.output_shape,
            cfg.output_stripe,
        )));
        graph.set_producer(post_in, engine).ok()?;

        if !self.caps.supports_kernel(PostKernel::Passthrough) {
            return None;
        }
        let post = graph.add_op(Op::with_operation_ids(
            OpKind::Post(PostOp {
                kernel: PostKernel::Passthrough,
                block_config,
                input_stripes: vec![cfg.output_stripe],
                output_stripe: cfg.output_stripe,
                rescale0: Rescale::default(),
                rescale1: Rescale::default(),
                load_kernel: true,
            }),
            ids.clone(),
        ));
        graph.add_consumer(post_in, post, 0).ok()?;

        // output side
        let out_streaming = !shape::is_full_tensor(&self.output_shape, &cfg.output_stripe);
        let out_slots = if !out_streaming {
            1
        } else if ends.dma_out {
            2
        } else {
            // handing stripes to a cascaded consumer, which may need a halo
            3u32.min(shape::total_stripes(&self.output_shape, &cfg.output_stripe))
        };
        let out_sram = graph.add_buffer(Buffer::Sram(SramBuffer::new(
            self.output_shape,
            cfg.output_stripe,
            TraversalOrder::Xyz,
            out_slots,
        )));
        graph.set_producer(out_sram, post).ok()?;

        let mut inputs = BTreeMap::from([(PartInputSlot::new(self.id, 0), in_sram)]);
        let mut outputs = BTreeMap::from([(PartOutputSlot::new(self.id, 0), out_sram)]);

        if let Some(in_dram) = in_dram {
            // the part boundary is the DRAM buffer, not the staging SRAM
            inputs.insert(PartInputSlot::new(self.id, 0), in_dram);
        }
        if ends.dma_out {
            let out_dram = graph.add_buffer(Buffer::Dram(DramBuffer::new(
                self.output_shape,
                DramFormat::Planar,
                DramRole::Intermediate,
                self.output_quant,
            )));
            let dma = graph.add_op(Op::with_operation_ids(
                OpKind::Dma(DmaOp::new(DramFormat::Planar)),
                ids,
            ));
            graph.add_consumer(out_sram, dma, 0).ok()?;
            graph.set_producer(out_dram, dma).ok()?;
            outputs.insert(PartOutputSlot::new(self.id, 0), out_dram);
        }

        Some(Plan::new(graph, inputs, outputs))
    }

    fn self_contained_plans(
        &self,
        ends: Ends,
        block_config: BlockConfig,
        num_weight_stripes: u32,
    ) -> Vec<Plan> {
        let mut plans = Vec::new();
        for cfg in self.stripe_candidates(block_config) {
            if let Some(plan) = self.build_plan(&cfg, ends, block_config, num_weight_stripes, None) {
                plans.push(plan);
            }
        }
        trace!(part = self.id, ?ends, count = plans.len(), "generated engine plans");
        plans
    }

    fn chained_plans(
        &self,
        cascade: CascadeType,
        block_config: BlockConfig,
        prev_sram: &[SramBuffer],
        num_weight_stripes: u32,
    ) -> Vec<Plan> {
        let prev = match prev_sram.first() {
            Some(p) => p,
            None => return Vec::new(),
        };
        // the predecessor's buffer must describe our input tensor, with all
        // channels present (the engine needs the full input depth per stripe)
        if prev.shape != self.input_shape || prev.stripe_shape[3] < self.input_shape[3] {
            return Vec::new();
        }
        let in_stripe = prev.stripe_shape;
        let out_h = if shape::is_full_tensor(&self.input_shape, &in_stripe) {
            self.output_shape[1]
        } else {
            (in_stripe[1] / self.stride.0.max(1)).clamp(1, self.output_shape[1])
        };
        let cfg = StripeConfig {
            input_stripe: in_stripe,
            output_stripe: [
                self.output_shape[0],
                out_h,
                self.output_shape[2],
                self.output_shape[3],
            ],
            input_loads: prev.num_loads,
        };
        let ends = Ends { dma_in: false, dma_out: cascade == CascadeType::End };
        match self.build_plan(&cfg, ends, block_config, num_weight_stripes, Some(prev)) {
            Some(plan) => vec![plan],
            None => Vec::new(),
        }
    }
}

impl Part for EnginePart {
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
        block_config: BlockConfig,
        prev_sram: &[SramBuffer],
        num_weight_stripes: u32,
    ) -> Vec<Plan> {
        match cascade {
            CascadeType::Lonely => self.self_contained_plans(
                Ends { dma_in: true, dma_out: true },
                block_config,
                num_weight_stripes,
            ),
            CascadeType::Beginning => self.self_contained_plans(
                Ends { dma_in: true, dma_out: false },
                block_config,
                num_weight_stripes,
            ),
            CascadeType::Middle | CascadeType::End => {
                self.chained_plans(cascade, block_config, prev_sram, num_weight_stripes)
            }
        }
    }

    fn can_double_buffer_weights(&self) -> bool {
        true
    }

    fn try_merge_clamp(&mut self, lower: i16, upper: i16) -> bool {
        if self.options.strict_precision {
            return false;
        }
        self.lower_bound = self.lower_bound.max(lower);
        self.upper_bound = self.upper_bound.min(upper);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(shape: TensorShape) -> EnginePart {
        EnginePart::identity(
            1,
            shape,
            QuantizationInfo::default(),
            BTreeSet::from([7]),
            Arc::new(HardwareCapabilities::edge()),
            Arc::new(CompilationOptions::default()),
        )
    }

    #[test]
    fn test_lonely_plans_read_and_write_dram() {
        let p = part([1, 64, 64, 32]);
        let plans = p.get_plans(CascadeType::Lonely, BlockConfig::new(16, 16), &[], 1);
        assert!(!plans.is_empty());
        for plan in &plans {
            let in_buf = plan.input_buffer(PartInputSlot::new(1, 0)).unwrap();
            let out_buf = plan.output_buffer(PartOutputSlot::new(1, 0)).unwrap();
            assert!(plan.graph.buffer(in_buf).as_dram().is_some());
            assert!(plan.graph.buffer(out_buf).as_dram().is_some());
        }
    }

    #[test]
    fn test_beginning_plans_leave_output_in_sram() {
        let p = part([1, 64, 64, 32]);
        let plans = p.get_plans(CascadeType::Beginning, BlockConfig::new(16, 16), &[], 1);
        assert!(!plans.is_empty());
        for plan in &plans {
            let out_buf = plan.output_buffer(PartOutputSlot::new(1, 0)).unwrap();
            assert!(plan.graph.buffer(out_buf).as_sram().is_some());
        }
    }

    #[test]
    fn test_middle_adopts_predecessor_buffer() {
        let p = part([1, 64, 64, 32]);
        let prev = SramBuffer::new([1, 64, 64, 32], [1, 16, 64, 32], TraversalOrder::Xyz, 3);
        let plans = p.get_plans(CascadeType::Middle, BlockConfig::new(16, 16), &[prev.clone()], 1);
        assert_eq!(plans.len(), 1);
        let in_buf = plans[0].input_buffer(PartInputSlot::new(1, 0)).unwrap();
        let sram = plans[0].graph.buffer(in_buf).as_sram().unwrap();
        assert!(sram.is_compatible_with(&prev));
    }

    #[test]
    fn test_middle_rejects_mismatched_predecessor() {
        let p = part([1, 64, 64, 32]);
        let wrong = SramBuffer::new([1, 32, 64, 32], [1, 16, 64, 32], TraversalOrder::Xyz, 3);
        assert!(p.get_plans(CascadeType::Middle, BlockConfig::new(16, 16), &[wrong], 1).is_empty());
        assert!(p.get_plans(CascadeType::Middle, BlockConfig::new(16, 16), &[], 1).is_empty());
    }

    #[test]
    fn test_clamp_folding_respects_strict_precision() {
        let mut p = part([1, 8, 8, 16]);
        assert!(p.try_merge_clamp(0, 127));
        assert_eq!(p.bounds(), (0, 127));

        let mut strict = EnginePart::identity(
            2,
            [1, 8, 8, 16],
            QuantizationInfo::default(),
            BTreeSet::new(),
            Arc::new(HardwareCapabilities::edge()),
            Arc::new(CompilationOptions { strict_precision: true, ..Default::default() }),
        );
        assert!(!strict.try_merge_clamp(0, 127));
    }
}
