//! The op graph: an index arena of ops and buffers with producer/consumer
//! edge lists. Stable integer ids sidestep shared-ownership cycles while
//! keeping edge traversal O(1), and make merging graphs a matter of offset
//! remapping.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::buffer::Buffer;
use crate::core::error::{CompileError, Result};
use crate::core::op::Op;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId(pub u32);

/// Id translation produced when merging one graph into another.
#[derive(Debug, Clone, Default)]
pub struct MergeMap {
    op_map: BTreeMap<OpId, OpId>,
    buffer_map: BTreeMap<BufferId, BufferId>,
}

impl MergeMap {
    pub fn op(&self, id: OpId) -> OpId {
        self.op_map[&id]
    }

    pub fn buffer(&self, id: BufferId) -> BufferId {
        self.buffer_map[&id]
    }

    pub fn buffers(&self) -> impl Iterator<Item = (BufferId, BufferId)> + '_ {
        self.buffer_map.iter().map(|(&a, &b)| (a, b))
    }
}

/// A graph of connected ops and buffers.
///
/// Each op consumes zero or more buffers (numbered inputs) and produces zero
/// or one buffer. Each buffer is produced by at most one op (`set_producer`
/// enforces this) and consumed by any number. The one sanctioned exception is
/// a DRAM buffer filled region-wise by several offset-DMAs (concatenation),
/// which must be wired with the explicit `add_producer`.
///
/// A buffer with no producers is a graph input; one with no consumers is a
/// graph output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpGraph {
    ops: Vec<Op>,
    buffers: Vec<Buffer>,
    /// Per buffer, the ops producing it.
    producers: Vec<Vec<OpId>>,
    /// Per buffer, the ops consuming it and at which input index.
    consumers: Vec<Vec<(OpId, u32)>>,
    /// Per op, the buffer it produces.
    op_output: Vec<Option<BufferId>>,
    /// Per op, the buffers it consumes, ordered by input index.
    op_inputs: Vec<Vec<BufferId>>,
}

impl OpGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_op(&mut self, op: Op) -> OpId {
        let id = OpId(self.ops.len() as u32);
        self.ops.push(op);
        self.op_output.push(None);
        self.op_inputs.push(Vec::new());
        id
    }

    pub fn add_buffer(&mut self, buffer: Buffer) -> BufferId {
        let id = BufferId(self.buffers.len() as u32);
        self.buffers.push(buffer);
        self.producers.push(Vec::new());
        self.consumers.push(Vec::new());
        id
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn op(&self, id: OpId) -> &Op {
        &self.ops[id.0 as usize]
    }

    pub fn op_mut(&mut self, id: OpId) -> &mut Op {
        &mut self.ops[id.0 as usize]
    }

    pub fn buffer(&self, id: BufferId) -> &Buffer {
        &self.buffers[id.0 as usize]
    }

    pub fn buffer_mut(&mut self, id: BufferId) -> &mut Buffer {
        &mut self.buffers[id.0 as usize]
    }

    pub fn op_ids(&self) -> impl Iterator<Item = OpId> {
        (0..self.ops.len() as u32).map(OpId)
    }

    pub fn buffer_ids(&self) -> impl Iterator<Item = BufferId> {
        (0..self.buffers.len() as u32).map(BufferId)
    }

    /// Registers `op` as the producer of `buffer`, enforcing the
    /// single-producer invariant.
    pub fn set_producer(&mut self, buffer: BufferId, op: OpId) -> Result<()> {
        if !self.producers[buffer.0 as usize].is_empty() {
            return Err(CompileError::Invariant(format!(
                "buffer {:?} already has a producer",
                buffer
            )));
        }
        self.add_producer(buffer, op);
        Ok(())
    }

    /// Registers an additional producer. Only for buffers filled region-wise
    /// by several offset-DMAs.
    pub fn add_producer(&mut self, buffer: BufferId, op: OpId) {
        self.producers[buffer.0 as usize].push(op);
        debug_assert!(self.op_output[op.0 as usize].is_none(), "op already produces a buffer");
        self.op_output[op.0 as usize] = Some(buffer);
    }

    /// Registers `op` input number `input_idx` as consuming `buffer`. Inputs
    /// must be registered in index order.
    pub fn add_consumer(&mut self, buffer: BufferId, op: OpId, input_idx: u32) -> Result<()> {
        let inputs = &mut self.op_inputs[op.0 as usize];
        if input_idx as usize != inputs.len() {
            return Err(CompileError::Invariant(format!(
                "op {:?} input {} registered out of order",
                op, input_idx
            )));
        }
        inputs.push(buffer);
        self.consumers[buffer.0 as usize].push((op, input_idx));
        Ok(())
    }

    pub fn producers(&self, buffer: BufferId) -> &[OpId] {
        &self.producers[buffer.0 as usize]
    }

    /// The single producer of a buffer, or `None` for graph inputs.
    pub fn single_producer(&self, buffer: BufferId) -> Option<OpId> {
        let p = &self.producers[buffer.0 as usize];
        debug_assert!(p.len() <= 1, "buffer has multiple producers; use producers()");
        p.first().copied()
    }

    pub fn consumers(&self, buffer: BufferId) -> &[(OpId, u32)] {
        &self.consumers[buffer.0 as usize]
    }

    pub fn op_output(&self, op: OpId) -> Option<BufferId> {
        self.op_output[op.0 as usize]
    }

    pub fn op_inputs(&self, op: OpId) -> &[BufferId] {
        &self.op_inputs[op.0 as usize]
    }

    /// Buffers with no producer, in id order.
    pub fn input_buffers(&self) -> Vec<BufferId> {
        self.buffer_ids().filter(|b| self.producers(*b).is_empty()).collect()
    }

    /// Buffers with no consumer, in id order.
    pub fn output_buffers(&self) -> Vec<BufferId> {
        self.buffer_ids().filter(|b| self.consumers(*b).is_empty()).collect()
    }

    /// Merges `other` into this graph. Buffers listed in `overrides` are not
    /// copied; edges that referenced them are rewired to the given existing
    /// buffer instead. This is how two plans come to literally share one
    /// buffer.
    pub fn merge_with_remap(
        &mut self,
        other: &OpGraph,
        overrides: &BTreeMap<BufferId, BufferId>,
    ) -> Result<MergeMap> {
        let mut map = MergeMap::default();
        for b in other.buffer_ids() {
            let target = match overrides.get(&b) {
                Some(&existing) => existing,
                None => self.add_buffer(other.buffer(b).clone()),
            };
            map.buffer_map.insert(b, target);
        }
        for o in other.op_ids() {
            let new_op = self.add_op(other.op(o).clone());
            map.op_map.insert(o, new_op);
        }
        for o in other.op_ids() {
            let new_op = map.op(o);
            for (idx, b) in other.op_inputs(o).iter().enumerate() {
                self.add_consumer(map.buffer(*b), new_op, idx as u32)?;
            }
            if let Some(out) = other.op_output(o) {
                self.add_producer(map.buffer(out), new_op);
            }
        }
        Ok(map)
    }

    /// Merges `other` without any buffer sharing.
    pub fn merge(&mut self, other: &OpGraph) -> Result<MergeMap> {
        self.merge_with_remap(other, &BTreeMap::new())
    }

    /// Deterministic topological execution order of the ops (Kahn's
    /// algorithm; among ready ops the lowest id goes first).
    pub fn sorted_ops(&self) -> Vec<OpId> {
        use std::collections::BTreeSet;

        let mut deps: Vec<usize> = self
            .op_ids()
            .map(|o| self.op_inputs(o).iter().map(|b| self.producers(*b).len()).sum())
            .collect();
        let mut ready: BTreeSet<OpId> =
            self.op_ids().filter(|o| deps[o.0 as usize] == 0).collect();
        let mut order = Vec::with_capacity(self.num_ops());
        while let Some(&op) = ready.iter().next() {
            ready.remove(&op);
            order.push(op);
            if let Some(out) = self.op_output(op) {
                for &(consumer, _) in self.consumers(out) {
                    let d = &mut deps[consumer.0 as usize];
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(consumer);
                    }
                }
            }
        }
        debug_assert_eq!(order.len(), self.num_ops(), "op graph contains a cycle");
        order
    }
}
