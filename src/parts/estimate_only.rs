//! A part standing in for functionality the cost model cannot fully model.
//! Its single plan wraps an `EstimateOnlyOp`, which the estimator prices
//! conservatively and reports with degraded confidence.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::buffer::{Buffer, DramBuffer, DramFormat, DramRole, QuantizationInfo, SramBuffer};
use crate::core::graph::OpGraph;
use crate::core::op::{BlockConfig, EstimateOnlyOp, Op, OpKind};
use crate::core::plan::{PartId, PartInputSlot, PartOutputSlot, Plan};
use crate::core::shape::TensorShape;
use crate::parts::{CascadeType, Part};

#[derive(Debug)]
pub struct EstimateOnlyPart {
    id: PartId,
    input_shapes: Vec<TensorShape>,
    output_shape: TensorShape,
    quant: QuantizationInfo,
    reason: String,
    operation_ids: BTreeSet<u32>,
}

impl EstimateOnlyPart {
    pub fn new(
        id: PartId,
        input_shapes: Vec<TensorShape>,
        output_shape: TensorShape,
        quant: QuantizationInfo,
        reason: String,
        operation_ids: BTreeSet<u32>,
    ) -> Self {
        Self { id, input_shapes, output_shape, quant, reason, operation_ids }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl Part for EstimateOnlyPart {
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
        let mut graph = OpGraph::new();
        let op = graph.add_op(Op::with_operation_ids(
            OpKind::EstimateOnly(EstimateOnlyOp { reason: self.reason.clone() }),
            self.operation_ids.clone(),
        ));
        let mut inputs = BTreeMap::new();
        for (i, shape) in self.input_shapes.iter().enumerate() {
            let b = graph.add_buffer(Buffer::Dram(DramBuffer::new(
                *shape,
                DramFormat::Planar,
                DramRole::Intermediate,
                self.quant,
            )));
            graph
                .add_consumer(b, op, i as u32)
                .expect("inputs are registered in order");
            inputs.insert(PartInputSlot::new(self.id, i as u32), b);
        }
        let out = graph.add_buffer(Buffer::Dram(DramBuffer::new(
            self.output_shape,
            DramFormat::Planar,
            DramRole::Intermediate,
            self.quant,
        )));
        graph.add_producer(out, op);
        let outputs = BTreeMap::from([(PartOutputSlot::new(self.id, 0), out)]);
        vec![Plan::new(graph, inputs, outputs)]
    }
}
