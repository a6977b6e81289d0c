//! A combination assigns one chosen plan (plus boundary glue) to each part
//! of a contiguous id range. Partial combinations from different branches
//! merge associatively into whole-graph answers, and a finished combination
//! flattens into a single op graph for estimation and command-stream
//! generation.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Add;
use std::sync::Arc;

use crate::combiner::glue::{BufferRef, EndingGlue, GlueConnections, StartingGlue};
use crate::core::error::{CompileError, Result};
use crate::core::graph::{BufferId, OpGraph};
use crate::core::plan::{PartId, PartInputSlot, PartOutputSlot, Plan};

/// One part's entry in a combination.
#[derive(Debug, Clone)]
pub struct Elem {
    pub part_id: PartId,
    pub plan: Arc<Plan>,
    pub starting_glues: BTreeMap<PartInputSlot, Arc<StartingGlue>>,
    pub ending_glues: BTreeMap<PartOutputSlot, Arc<EndingGlue>>,
}

/// Plans and glue for a contiguous range of part ids, with the estimated
/// metric of this fragment of the graph.
#[derive(Debug, Clone, Default)]
pub struct Combination {
    first: PartId,
    elems: Vec<Elem>,
    metric: f64,
}

impl Combination {
    /// The empty combination, the identity for merging.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A combination holding a single part with its chosen plan.
    pub fn single(part_id: PartId, plan: Arc<Plan>) -> Self {
        Self {
            first: part_id,
            elems: vec![Elem {
                part_id,
                plan,
                starting_glues: BTreeMap::new(),
                ending_glues: BTreeMap::new(),
            }],
            metric: 0.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    /// First part id covered.
    pub fn first_part_id(&self) -> PartId {
        self.first
    }

    /// One past the last part id covered.
    pub fn end_part_id(&self) -> PartId {
        self.first + self.elems.len() as PartId
    }

    pub fn elems(&self) -> &[Elem] {
        &self.elems
    }

    pub fn elem(&self, part_id: PartId) -> Result<&Elem> {
        self.elems
            .get(part_id.checked_sub(self.first).ok_or_else(|| out_of_range(part_id))? as usize)
            .ok_or_else(|| out_of_range(part_id))
    }

    fn elem_mut(&mut self, part_id: PartId) -> Result<&mut Elem> {
        let idx = part_id.checked_sub(self.first).ok_or_else(|| out_of_range(part_id))? as usize;
        self.elems.get_mut(idx).ok_or_else(|| out_of_range(part_id))
    }

    pub fn metric(&self) -> f64 {
        self.metric
    }

    pub fn set_metric(&mut self, metric: f64) {
        self.metric = metric;
    }

    /// Attaches the starting glue for an input slot. A glue can only be set
    /// once; a second write is an invariant violation.
    pub fn set_starting_glue(&mut self, slot: PartInputSlot, glue: Arc<StartingGlue>) -> Result<()> {
        let elem = self.elem_mut(slot.part)?;
        if elem.starting_glues.insert(slot, glue).is_some() {
            return Err(CompileError::Invariant(format!(
                "starting glue already set for slot ({}, {})",
                slot.part, slot.index
            )));
        }
        Ok(())
    }

    /// Attaches the ending glue for an output slot, same single-write rule.
    pub fn set_ending_glue(&mut self, slot: PartOutputSlot, glue: Arc<EndingGlue>) -> Result<()> {
        let elem = self.elem_mut(slot.part)?;
        if elem.ending_glues.insert(slot, glue).is_some() {
            return Err(CompileError::Invariant(format!(
                "ending glue already set for slot ({}, {})",
                slot.part, slot.index
            )));
        }
        Ok(())
    }

    /// Merges two combinations over adjacent id ranges. The metric is the
    /// sum; glue penalties are added separately by whoever created the glue.
    pub fn merge(mut self, rhs: Combination) -> Combination {
        if self.is_empty() {
            return rhs;
        }
        if rhs.is_empty() {
            return self;
        }
        debug_assert_eq!(
            self.end_part_id(),
            rhs.first_part_id(),
            "combinations must cover adjacent part id ranges"
        );
        self.elems.extend(rhs.elems);
        self.metric += rhs.metric;
        self
    }

    /// Flattens the chosen plans and glue into one op graph, resolving
    /// buffer replacements and symbolic glue attachments. Also returns which
    /// SRAM buffers are exempt from conservative lifetime summation (those
    /// of pre-allocated plans).
    pub fn build_op_graph(&self) -> Result<MergedOpGraph> {
        let mut out = OpGraph::new();
        let mut exempt = BTreeSet::new();
        // where every symbolically-addressable buffer landed in `out`
        let mut resolved: BTreeMap<BufferRef, BufferId> = BTreeMap::new();

        for elem in &self.elems {
            // 1. replacements requested by this elem's starting glues:
            //    plan-local buffer -> already-merged buffer
            let mut overrides = BTreeMap::new();
            for glue in elem.starting_glues.values() {
                for (from, to) in &glue.external.replacements {
                    let BufferRef::PlanInput(slot) = *from else {
                        return Err(CompileError::Invariant(
                            "replacement source must be a plan input".into(),
                        ));
                    };
                    let local = elem.plan.input_buffer(slot).ok_or_else(|| {
                        CompileError::Invariant(format!(
                            "plan for part {} has no input slot {}",
                            elem.part_id, slot.index
                        ))
                    })?;
                    let target = resolve(&resolved, *to)?;
                    merge_boundary_metadata(&mut out, target, &elem.plan, local);
                    overrides.insert(local, target);
                }
            }

            // 2. the plan itself
            let plan_map = out.merge_with_remap(&elem.plan.graph, &overrides)?;
            if elem.plan.pre_allocated {
                for (_, global) in plan_map.buffers() {
                    if out.buffer(global).as_sram().is_some() {
                        exempt.insert(global);
                    }
                }
            }
            for (&slot, &local) in &elem.plan.inputs {
                resolved.insert(BufferRef::PlanInput(slot), plan_map.buffer(local));
            }
            for (&slot, &local) in &elem.plan.outputs {
                resolved.insert(BufferRef::PlanOutput(slot), plan_map.buffer(local));
            }

            // 3. starting glue fragments attach behind the plan's inputs
            for glue in elem.starting_glues.values() {
                graft_glue(&mut out, &glue.graph, &glue.external, &mut resolved, None)?;
            }

            // 4. ending glue fragments attach after the plan's outputs; their
            //    local buffers become addressable for later starting glues
            for (&slot, glue) in &elem.ending_glues {
                graft_glue(&mut out, &glue.graph, &glue.external, &mut resolved, Some(slot))?;
            }
        }

        Ok(MergedOpGraph { graph: out, lifetime_exempt: exempt })
    }
}

fn out_of_range(part_id: PartId) -> CompileError {
    CompileError::Invariant(format!("part {part_id} outside combination range"))
}

fn resolve(resolved: &BTreeMap<BufferRef, BufferId>, r: BufferRef) -> Result<BufferId> {
    resolved
        .get(&r)
        .copied()
        .ok_or_else(|| CompileError::Invariant(format!("unresolved glue buffer reference {r:?}")))
}

/// When a consumer's boundary buffer is replaced by the producer's, the
/// surviving buffer takes over the dropped one's network-facing metadata.
fn merge_boundary_metadata(out: &mut OpGraph, target: BufferId, plan: &Plan, dropped: BufferId) {
    use crate::core::buffer::DramRole;
    let dropped_meta = match plan.graph.buffer(dropped).as_dram() {
        Some(d) => (d.role, d.operation_id),
        None => return,
    };
    if let Some(d) = out.buffer_mut(target).as_dram_mut() {
        if dropped_meta.0 == DramRole::Output && d.role == DramRole::Intermediate {
            d.role = DramRole::Output;
        }
        if d.operation_id.is_none() {
            d.operation_id = dropped_meta.1;
        }
    }
}

/// Merges a glue fragment and wires its external attachments. When
/// `ending_slot` is given, the fragment's own buffers are published as
/// `EndingGlueLocal` so later starting glues can reach them.
fn graft_glue(
    out: &mut OpGraph,
    fragment: &OpGraph,
    external: &GlueConnections,
    resolved: &mut BTreeMap<BufferRef, BufferId>,
    ending_slot: Option<PartOutputSlot>,
) -> Result<()> {
    let map = out.merge_with_remap(fragment, &BTreeMap::new())?;
    if let Some(slot) = ending_slot {
        for (local, global) in map.buffers() {
            resolved.insert(BufferRef::EndingGlueLocal(slot, local), global);
        }
    }
    for (r, op, idx) in &external.buffer_to_op {
        let buffer = resolve(resolved, *r)?;
        out.add_consumer(buffer, map.op(*op), *idx)?;
    }
    for (op, r) in &external.op_to_buffer {
        let buffer = resolve(resolved, *r)?;
        out.set_producer(buffer, map.op(*op))?;
    }
    Ok(())
}

/// The flattened op graph of a combination.
#[derive(Debug)]
pub struct MergedOpGraph {
    pub graph: OpGraph,
    /// SRAM buffers excluded from the conservative liveness summation.
    pub lifetime_exempt: BTreeSet<BufferId>,
}

impl Add for Combination {
    type Output = Combination;

    fn add(self, rhs: Combination) -> Combination {
        self.merge(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffer::{
        Buffer, DramBuffer, DramFormat, DramRole, QuantizationInfo,
    };

    fn plan_with_dram(part: PartId, role: DramRole) -> Arc<Plan> {
        let mut graph = OpGraph::new();
        let b = graph.add_buffer(Buffer::Dram(DramBuffer::new(
            [1, 8, 8, 16],
            DramFormat::Planar,
            role,
            QuantizationInfo::default(),
        )));
        let mut inputs = BTreeMap::new();
        let mut outputs = BTreeMap::new();
        if role == DramRole::Output {
            inputs.insert(PartInputSlot::new(part, 0), b);
        } else {
            outputs.insert(PartOutputSlot::new(part, 0), b);
        }
        Arc::new(Plan::new(graph, inputs, outputs))
    }

    fn single(part: PartId) -> Combination {
        let role = if part == 0 { DramRole::Intermediate } else { DramRole::Output };
        Combination::single(part, plan_with_dram(part, role))
    }

    #[test]
    fn test_merge_is_associative_over_adjacent_ranges() {
        let (a, b, c) = (single(0), single(1), single(2));
        let left = (a.clone() + b.clone()) + c.clone();
        let right = a + (b + c);
        assert_eq!(left.first_part_id(), right.first_part_id());
        assert_eq!(left.end_part_id(), right.end_part_id());
        assert_eq!(left.metric(), right.metric());
        let l: Vec<PartId> = left.elems().iter().map(|e| e.part_id).collect();
        let r: Vec<PartId> = right.elems().iter().map(|e| e.part_id).collect();
        assert_eq!(l, r);
    }

    #[test]
    fn test_empty_is_identity() {
        let a = single(3);
        let merged = Combination::empty() + a.clone() + Combination::empty();
        assert_eq!(merged.first_part_id(), 3);
        assert_eq!(merged.end_part_id(), 4);
    }

    #[test]
    fn test_glue_can_only_be_set_once() {
        let mut comb = single(1);
        let slot = PartInputSlot::new(1, 0);
        comb.set_starting_glue(slot, Arc::new(StartingGlue::default())).unwrap();
        assert!(comb.set_starting_glue(slot, Arc::new(StartingGlue::default())).is_err());
    }

    #[test]
    fn test_build_op_graph_applies_replacement() {
        // part 0 produces a DRAM buffer; part 1's output-role buffer is
        // replaced by it, and the surviving buffer takes the Output role
        let mut comb = single(0) + single(1);
        let mut glue = StartingGlue::default();
        glue.external.replacements.push((
            BufferRef::PlanInput(PartInputSlot::new(1, 0)),
            BufferRef::PlanOutput(PartOutputSlot::new(0, 0)),
        ));
        comb.set_starting_glue(PartInputSlot::new(1, 0), Arc::new(glue)).unwrap();

        let merged = comb.build_op_graph().unwrap();
        assert_eq!(merged.graph.num_buffers(), 1);
        let survivor = merged.graph.buffer(crate::core::graph::BufferId(0)).as_dram().unwrap();
        assert_eq!(survivor.role, DramRole::Output);
    }
}
