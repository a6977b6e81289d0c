//! Boundary parts: the network-facing inputs and outputs. Each produces a
//! single self-contained plan around one linear DRAM buffer, since external
//! callers read and write tensors linearly.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::buffer::{Buffer, DramBuffer, DramFormat, DramRole, QuantizationInfo, SramBuffer};
use crate::core::graph::OpGraph;
use crate::core::op::BlockConfig;
use crate::core::plan::{PartId, PartInputSlot, PartOutputSlot, Plan};
use crate::core::shape::TensorShape;
use crate::parts::{CascadeType, Part};

#[derive(Debug)]
pub struct InputPart {
    id: PartId,
    shape: TensorShape,
    quant: QuantizationInfo,
    operation_id: u32,
    operation_ids: BTreeSet<u32>,
}

impl InputPart {
    pub fn new(id: PartId, shape: TensorShape, quant: QuantizationInfo, operation_id: u32) -> Self {
        Self { id, shape, quant, operation_id, operation_ids: BTreeSet::from([operation_id]) }
    }
}

impl Part for InputPart {
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
        let buffer = DramBuffer::new(self.shape, DramFormat::Planar, DramRole::Input, self.quant)
            .with_operation_id(self.operation_id);
        let id = graph.add_buffer(Buffer::Dram(buffer));
        let outputs = BTreeMap::from([(PartOutputSlot::new(self.id, 0), id)]);
        vec![Plan::new(graph, BTreeMap::new(), outputs)]
    }
}

#[derive(Debug)]
pub struct OutputPart {
    id: PartId,
    shape: TensorShape,
    quant: QuantizationInfo,
    operation_id: u32,
    operation_ids: BTreeSet<u32>,
}

impl OutputPart {
    pub fn new(id: PartId, shape: TensorShape, quant: QuantizationInfo, operation_id: u32) -> Self {
        Self { id, shape, quant, operation_id, operation_ids: BTreeSet::from([operation_id]) }
    }
}

impl Part for OutputPart {
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
        let buffer = DramBuffer::new(self.shape, DramFormat::Planar, DramRole::Output, self.quant)
            .with_operation_id(self.operation_id);
        let id = graph.add_buffer(Buffer::Dram(buffer));
        let inputs = BTreeMap::from([(PartInputSlot::new(self.id, 0), id)]);
        vec![Plan::new(graph, inputs, BTreeMap::new())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_part_lonely_only() {
        let part = InputPart::new(0, [1, 16, 16, 16], QuantizationInfo::default(), 1);
        let bc = BlockConfig::new(16, 16);
        assert_eq!(part.get_plans(CascadeType::Lonely, bc, &[], 1).len(), 1);
        assert!(part.get_plans(CascadeType::Beginning, bc, &[], 1).is_empty());
        assert!(part.get_plans(CascadeType::Middle, bc, &[], 1).is_empty());
    }

    #[test]
    fn test_output_part_buffer_role() {
        let part = OutputPart::new(3, [1, 8, 8, 16], QuantizationInfo::default(), 9);
        let plan = &part.get_plans(CascadeType::Lonely, BlockConfig::new(16, 16), &[], 1)[0];
        let buf = plan.input_buffer(PartInputSlot::new(3, 0)).unwrap();
        let dram = plan.graph.buffer(buf).as_dram().unwrap();
        assert_eq!(dram.role, DramRole::Output);
        assert_eq!(dram.format, DramFormat::Planar);
        assert_eq!(dram.operation_id, Some(9));
    }
}
