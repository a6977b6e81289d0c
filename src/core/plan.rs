//! A plan is one candidate implementation of a single part: a small op graph
//! plus the mapping from the part's abstract input/output slots to the
//! concrete buffers that realize them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::buffer::{Buffer, SramBuffer};
use crate::core::graph::{BufferId, OpGraph};

pub type PartId = u32;

/// One named input of a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartInputSlot {
    pub part: PartId,
    pub index: u32,
}

impl PartInputSlot {
    pub const fn new(part: PartId, index: u32) -> Self {
        Self { part, index }
    }
}

/// One named output of a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartOutputSlot {
    pub part: PartId,
    pub index: u32,
}

impl PartOutputSlot {
    pub const fn new(part: PartId, index: u32) -> Self {
        Self { part, index }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub graph: OpGraph,
    /// Which buffer realizes each of the part's inputs.
    pub inputs: BTreeMap<PartInputSlot, BufferId>,
    /// Which buffer realizes each of the part's outputs.
    pub outputs: BTreeMap<PartOutputSlot, BufferId>,
    /// When set, the combiner must not apply its conservative all-live SRAM
    /// summation to this plan's SRAM buffers: the plan guarantees its internal
    /// buffers are never all simultaneously live and manages its own budget.
    pub pre_allocated: bool,
}

impl Plan {
    pub fn new(
        graph: OpGraph,
        inputs: BTreeMap<PartInputSlot, BufferId>,
        outputs: BTreeMap<PartOutputSlot, BufferId>,
    ) -> Self {
        Self { graph, inputs, outputs, pre_allocated: false }
    }

    pub fn input_buffer(&self, slot: PartInputSlot) -> Option<BufferId> {
        self.inputs.get(&slot).copied()
    }

    pub fn output_buffer(&self, slot: PartOutputSlot) -> Option<BufferId> {
        self.outputs.get(&slot).copied()
    }

    /// All SRAM buffers of this plan, in id order.
    pub fn sram_buffers(&self) -> impl Iterator<Item = (BufferId, &SramBuffer)> {
        self.graph.buffer_ids().filter_map(move |id| match self.graph.buffer(id) {
            Buffer::Sram(b) => Some((id, b)),
            _ => None,
        })
    }

    /// Conservative SRAM footprint: every SRAM buffer counted as live at once.
    pub fn total_sram_bytes(&self) -> u64 {
        self.sram_buffers().map(|(_, b)| u64::from(b.size_bytes)).sum()
    }
}
