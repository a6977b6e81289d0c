//! The graph of parts: part ownership plus the slot-to-slot connection
//! table. Built by the front end, compacted once, then read-only for the
//! combiner.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::core::error::{CompileError, Result};
use crate::core::plan::{PartId, PartInputSlot, PartOutputSlot};
use crate::parts::{Part, PartConnection};

/// Owns all parts and the connection table. Each input slot has exactly one
/// producing output slot; an output slot may fan out to any number of input
/// slots.
#[derive(Debug, Default)]
pub struct GraphOfParts {
    parts: BTreeMap<PartId, Box<dyn Part>>,
    connections: BTreeMap<PartInputSlot, PartOutputSlot>,
    next_part_id: PartId,
}

impl GraphOfParts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh ids are monotonic within one graph instance.
    pub fn generate_part_id(&mut self) -> PartId {
        let id = self.next_part_id;
        self.next_part_id += 1;
        id
    }

    pub fn add_part(&mut self, part: Box<dyn Part>) -> Result<()> {
        let id = part.id();
        if self.parts.insert(id, part).is_some() {
            return Err(CompileError::InvalidGraph(format!("duplicate part id {id}")));
        }
        self.next_part_id = self.next_part_id.max(id + 1);
        Ok(())
    }

    pub fn num_parts(&self) -> usize {
        self.parts.len()
    }

    pub fn part_ids(&self) -> impl Iterator<Item = PartId> + '_ {
        self.parts.keys().copied()
    }

    pub fn part(&self, id: PartId) -> Result<&dyn Part> {
        self.parts
            .get(&id)
            .map(|p| p.as_ref())
            .ok_or_else(|| CompileError::InvalidGraph(format!("unknown part id {id}")))
    }

    pub fn part_mut(&mut self, id: PartId) -> Result<&mut (dyn Part + 'static)> {
        match self.parts.get_mut(&id) {
            Some(p) => Ok(p.as_mut()),
            None => Err(CompileError::InvalidGraph(format!("unknown part id {id}"))),
        }
    }

    /// Connects `output_slot` to `input_slot`. An input slot can only ever
    /// have one producer; a second connection is an invariant violation.
    pub fn add_connection(&mut self, input_slot: PartInputSlot, output_slot: PartOutputSlot) -> Result<()> {
        if !self.parts.contains_key(&input_slot.part) || !self.parts.contains_key(&output_slot.part) {
            return Err(CompileError::InvalidGraph(format!(
                "connection references unknown part ({} -> {})",
                output_slot.part, input_slot.part
            )));
        }
        if self.connections.contains_key(&input_slot) {
            return Err(CompileError::InvalidGraph(format!(
                "input slot ({}, {}) already connected",
                input_slot.part, input_slot.index
            )));
        }
        self.connections.insert(input_slot, output_slot);
        Ok(())
    }

    pub fn connections(&self) -> &BTreeMap<PartInputSlot, PartOutputSlot> {
        &self.connections
    }

    /// Input slots of part `p`, ascending.
    pub fn part_inputs(&self, p: PartId) -> Vec<PartInputSlot> {
        self.connections.keys().filter(|s| s.part == p).copied().collect()
    }

    /// Output slots of part `p` that feed anything, ascending, deduplicated.
    pub fn part_outputs(&self, p: PartId) -> Vec<PartOutputSlot> {
        let set: BTreeSet<PartOutputSlot> =
            self.connections.values().filter(|s| s.part == p).copied().collect();
        set.into_iter().collect()
    }

    pub fn connected_output_slot(&self, input_slot: PartInputSlot) -> Option<PartOutputSlot> {
        self.connections.get(&input_slot).copied()
    }

    pub fn connected_input_slots(&self, output_slot: PartOutputSlot) -> Vec<PartInputSlot> {
        self.connections
            .iter()
            .filter(|(_, &src)| src == output_slot)
            .map(|(&dst, _)| dst)
            .collect()
    }

    /// Connections into part `p` (its inputs), ascending by destination.
    pub fn source_connections(&self, p: PartId) -> Vec<PartConnection> {
        self.connections
            .iter()
            .filter(|(dst, _)| dst.part == p)
            .map(|(&dest, &source)| PartConnection { dest, source })
            .collect()
    }

    /// Connections out of part `p` (its consumers), ascending by destination.
    pub fn dest_connections(&self, p: PartId) -> Vec<PartConnection> {
        self.connections
            .iter()
            .filter(|(_, src)| src.part == p)
            .map(|(&dest, &source)| PartConnection { dest, source })
            .collect()
    }

    /// Sorts the parts topologically and renumbers ids densely from zero.
    /// The combiner's indexing-based bookkeeping relies on both properties.
    /// Deterministic: among ready parts the lowest old id goes first.
    pub fn sort_and_compact(&mut self) -> Result<()> {
        let ids: Vec<PartId> = self.part_ids().collect();
        let mut indegree: BTreeMap<PartId, usize> = ids.iter().map(|&id| (id, 0)).collect();
        for (dst, src) in &self.connections {
            for part in [dst.part, src.part] {
                if !indegree.contains_key(&part) {
                    return Err(CompileError::InvalidGraph(format!(
                        "connection references unknown part {part}"
                    )));
                }
            }
            *indegree.get_mut(&dst.part).unwrap() += 1;
        }

        let mut ready: BTreeSet<PartId> =
            indegree.iter().filter(|(_, &d)| d == 0).map(|(&id, _)| id).collect();
        let mut order = Vec::with_capacity(ids.len());
        while let Some(&id) = ready.iter().next() {
            ready.remove(&id);
            order.push(id);
            for conn in self.dest_connections(id) {
                let d = indegree.get_mut(&conn.dest.part).unwrap();
                *d -= 1;
                if *d == 0 {
                    ready.insert(conn.dest.part);
                }
            }
        }
        if order.len() != ids.len() {
            return Err(CompileError::InvalidGraph("graph of parts contains a cycle".into()));
        }

        let remap: BTreeMap<PartId, PartId> =
            order.iter().enumerate().map(|(new, &old)| (old, new as PartId)).collect();

        let mut new_parts = BTreeMap::new();
        for (old, mut part) in std::mem::take(&mut self.parts) {
            let new = remap[&old];
            part.set_id(new);
            new_parts.insert(new, part);
        }
        self.parts = new_parts;

        let old_connections = std::mem::take(&mut self.connections);
        for (dst, src) in old_connections {
            self.connections.insert(
                PartInputSlot::new(remap[&dst.part], dst.index),
                PartOutputSlot::new(remap[&src.part], src.index),
            );
        }
        self.next_part_id = self.parts.len() as PartId;
        debug!(parts = self.parts.len(), "sorted and compacted graph of parts");
        Ok(())
    }
}
