//! The combiner: walks the topologically sorted parts, asks each for
//! candidate plans per cascade role, grows cascaded sections under the SRAM
//! budget, glues neighbouring choices together and keeps whichever complete
//! combination the cost model likes best.
//!
//! The search is a depth-first recursion over "the best combination covering
//! parts p..n", memoized per starting part and incoming boundary-format
//! signature, with branch-and-bound pruning against the best candidate found
//! so far at each node.

pub mod combination;
pub mod glue;
pub mod sram;

use std::collections::BTreeMap;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::combiner::combination::Combination;
use crate::combiner::glue::{synthesize_glue, StartingGlue};
use crate::combiner::sram::{assign_sram_offsets, peak_sram_usage, SramAllocator};
use crate::core::buffer::{Buffer, DramFormat, SramBuffer};
use crate::core::capabilities::HardwareCapabilities;
use crate::core::config::{CompilationOptions, EstimationOptions};
use crate::core::error::{CompileError, Result};
use crate::core::graph::BufferId;
use crate::core::op::BlockConfig;
use crate::core::plan::{PartId, PartInputSlot, PartOutputSlot, Plan};
use crate::estimation::estimate_op_graph;
use crate::parts::{CascadeType, GraphOfParts, Part};

/// A partially-built cascaded section: the plans chosen so far, the SRAM
/// allocator state, and the SRAM buffer being carried to the next part.
#[derive(Debug, Clone)]
struct SectionContext {
    comb: Combination,
    alloc: SramAllocator,
    block_config: BlockConfig,
    num_weight_stripes: u32,
    /// Descriptor of the carried buffer, handed to the next part's
    /// `get_plans`.
    carry: SramBuffer,
    carry_slot: PartOutputSlot,
    /// Live allocation backing the carry, freed when the next part is done
    /// with it.
    carry_alloc: Option<(u32, u32)>,
}

type MemoKey = (PartId, Vec<DramFormat>);

pub struct Combiner<'a> {
    graph: &'a GraphOfParts,
    caps: &'a HardwareCapabilities,
    options: &'a CompilationOptions,
    est_opts: &'a EstimationOptions,
    memo: BTreeMap<MemoKey, Combination>,
}

impl<'a> Combiner<'a> {
    pub fn new(
        graph: &'a GraphOfParts,
        caps: &'a HardwareCapabilities,
        options: &'a CompilationOptions,
        est_opts: &'a EstimationOptions,
    ) -> Self {
        Self { graph, caps, options, est_opts, memo: BTreeMap::new() }
    }

    /// Runs the search over a sorted-and-compacted graph of parts.
    pub fn run(&mut self) -> Result<Combination> {
        let n = self.num_parts();
        if n == 0 {
            return Err(CompileError::InvalidGraph("empty graph of parts".into()));
        }
        for (i, id) in self.graph.part_ids().enumerate() {
            if id != i as PartId {
                return Err(CompileError::InvalidGraph(
                    "graph of parts must be sorted and compacted first".into(),
                ));
            }
        }
        let best = self.best_from(0, Vec::new())?;
        // final validation: the merged graph must place within SRAM
        let mut merged = best.build_op_graph()?;
        match assign_sram_offsets(
            &mut merged.graph,
            &merged.lifetime_exempt,
            self.caps.sram_size_bytes,
        ) {
            Ok(peak) => {
                debug!(peak, capacity = self.caps.sram_size_bytes, "SRAM placement validated")
            }
            Err(err) => {
                warn!(capacity = self.caps.sram_size_bytes, "combination exceeds SRAM budget");
                return Err(err);
            }
        }
        info!(metric = best.metric(), parts = n, "combiner selected best combination");
        Ok(best)
    }

    /// The best combination with every part forced Lonely: the non-cascaded
    /// fallback, used as a regression reference for the cost model
    /// (cascading must never look worse to it).
    pub fn best_all_lonely(&self) -> Result<Combination> {
        let mut comb = Combination::empty();
        for p in (0..self.num_parts()).rev() {
            let head = self.best_lonely(p)?;
            comb = self.join(head, comb)?;
        }
        Ok(comb)
    }

    fn num_parts(&self) -> PartId {
        self.graph.num_parts() as PartId
    }

    fn block_configs(&self) -> Vec<BlockConfig> {
        if self.options.enabled_block_configs.is_empty() {
            self.caps.block_configs.clone()
        } else {
            self.options
                .enabled_block_configs
                .iter()
                .filter(|bc| self.caps.block_configs.contains(bc))
                .copied()
                .collect()
        }
    }

    fn weight_stripe_choices(&self, part: &dyn Part) -> Vec<u32> {
        if part.can_double_buffer_weights() && self.options.max_weight_stripes >= 2 {
            vec![1, 2]
        } else {
            vec![1]
        }
    }

    /// Dispatches one `get_plans` call per request onto the worker pool and
    /// joins. Ordered collection keeps the result deterministic.
    fn plans_parallel(
        &self,
        part: &dyn Part,
        requests: &[(CascadeType, BlockConfig, Vec<SramBuffer>, u32)],
    ) -> Vec<Vec<Plan>> {
        requests
            .par_iter()
            .map(|(cascade, bc, prev, nws)| part.get_plans(*cascade, *bc, prev, *nws))
            .collect()
    }

    /// Best combination covering `[p, n)`, given the DRAM formats offered at
    /// its incoming boundary.
    fn best_from(&mut self, p: PartId, boundary: Vec<DramFormat>) -> Result<Combination> {
        if p == self.num_parts() {
            return Ok(Combination::empty());
        }
        let key = (p, boundary);
        if let Some(found) = self.memo.get(&key) {
            return Ok(found.clone());
        }

        let mut heads = vec![self.best_lonely(p)?];
        heads.extend(self.sections(p)?);

        let mut best: Option<Combination> = None;
        for head in heads {
            // branch and bound: the head alone already loses
            if let Some(b) = &best {
                if head.metric() >= b.metric() {
                    continue;
                }
            }
            let tail_boundary = self.boundary_signature(&head)?;
            let tail = self.best_from(head.end_part_id(), tail_boundary)?;
            let candidate = self.join(head, tail)?;
            if best.as_ref().is_none_or(|b| candidate.metric() < b.metric()) {
                best = Some(candidate);
            }
        }
        let best = best.ok_or_else(|| {
            CompileError::SearchExhausted(format!("no candidate combination from part {p}"))
        })?;
        debug!(part = p, metric = best.metric(), "memoized best suffix");
        self.memo.insert(key, best.clone());
        Ok(best)
    }

    /// The cheapest feasible self-contained plan for one part. Every part
    /// must have one: the front end only admits networks the non-cascaded
    /// fallback can realize, so coming up empty is fatal.
    fn best_lonely(&self, p: PartId) -> Result<Combination> {
        let part = self.graph.part(p)?;
        let mut requests = Vec::new();
        for bc in self.block_configs() {
            for nws in self.weight_stripe_choices(part) {
                requests.push((CascadeType::Lonely, bc, Vec::new(), nws));
            }
        }
        let mut best: Option<Combination> = None;
        for plans in self.plans_parallel(part, &requests) {
            for plan in plans {
                let exempt = if plan.pre_allocated {
                    plan.sram_buffers().map(|(id, _)| id).collect()
                } else {
                    Default::default()
                };
                if peak_sram_usage(&plan.graph, &exempt) > u64::from(self.caps.sram_size_bytes) {
                    continue;
                }
                let est = estimate_op_graph(&plan.graph, self.caps, self.est_opts)?;
                if best.as_ref().is_none_or(|b| est.metric < b.metric()) {
                    let mut comb = Combination::single(p, Arc::new(plan));
                    comb.set_metric(est.metric);
                    best = Some(comb);
                }
            }
        }
        best.ok_or_else(|| {
            CompileError::SearchExhausted(format!(
                "part {p} has no feasible self-contained plan"
            ))
        })
    }

    /// Whether part `p` can hand its output straight to part `p + 1`: one
    /// consumer, contiguous ids, and the consumer takes no other inputs.
    fn chainable_to_next(&self, p: PartId) -> bool {
        if p + 1 >= self.num_parts() {
            return false;
        }
        let dests = self.graph.dest_connections(p);
        dests.len() == 1
            && dests[0].dest.part == p + 1
            && dests[0].dest.index == 0
            && self.graph.source_connections(p + 1).len() == 1
    }

    /// All complete cascaded sections starting at part `p`.
    fn sections(&mut self, p: PartId) -> Result<Vec<Combination>> {
        if !self.chainable_to_next(p) {
            return Ok(Vec::new());
        }
        let mut results = Vec::new();
        let mut contexts = self.start_section(p)?;
        let mut q = p + 1;
        while !contexts.is_empty() && q < self.num_parts() {
            let mut next = Vec::new();
            for ctx in &contexts {
                results.extend(self.end_section(q, ctx)?);
                if self.chainable_to_next(q) {
                    next.extend(self.continue_section(q, ctx)?);
                }
            }
            contexts = next;
            q += 1;
        }
        debug!(part = p, sections = results.len(), "enumerated cascaded sections");
        Ok(results)
    }

    /// Opens a section: Beginning plans whose SRAM output becomes the carry.
    fn start_section(&self, p: PartId) -> Result<Vec<SectionContext>> {
        let part = self.graph.part(p)?;
        let mut requests = Vec::new();
        for bc in self.block_configs() {
            for nws in self.weight_stripe_choices(part) {
                requests.push((CascadeType::Beginning, bc, Vec::new(), nws));
            }
        }
        let plan_lists = self.plans_parallel(part, &requests);

        let mut contexts = Vec::new();
        for ((_, bc, _, nws), plans) in requests.into_iter().zip(plan_lists) {
            for plan in plans {
                let slot = PartOutputSlot::new(p, 0);
                let Some(out_id) = plan.output_buffer(slot) else { continue };
                let Some(carry) = plan.graph.buffer(out_id).as_sram().cloned() else { continue };

                let mut alloc = SramAllocator::new(self.caps.sram_size_bytes);
                let Some(placed) = allocate_plan(&mut alloc, &plan, None) else { continue };
                // only the carry outlives this part
                let mut carry_alloc = None;
                for (id, offset, size) in placed {
                    if id == out_id {
                        carry_alloc = Some((offset, size));
                    } else {
                        alloc.free(offset, size);
                    }
                }
                contexts.push(SectionContext {
                    comb: Combination::single(p, Arc::new(plan)),
                    alloc,
                    block_config: bc,
                    num_weight_stripes: nws,
                    carry,
                    carry_slot: slot,
                    carry_alloc,
                });
            }
        }
        Ok(contexts)
    }

    /// Extends a section through part `q` with a Middle plan, handing the
    /// carry forward.
    fn continue_section(&self, q: PartId, ctx: &SectionContext) -> Result<Vec<SectionContext>> {
        let part = self.graph.part(q)?;
        let request = [(
            CascadeType::Middle,
            ctx.block_config,
            vec![ctx.carry.clone()],
            ctx.num_weight_stripes,
        )];
        let mut contexts = Vec::new();
        for plans in self.plans_parallel(part, &request) {
            for plan in plans {
                let Some(extended) = self.extend_section(q, ctx, plan, false)? else { continue };
                contexts.push(extended);
            }
        }
        Ok(contexts)
    }

    /// Closes a section at part `q` with an End plan and estimates the
    /// finished fragment.
    fn end_section(&self, q: PartId, ctx: &SectionContext) -> Result<Vec<Combination>> {
        let part = self.graph.part(q)?;
        let request = [(
            CascadeType::End,
            ctx.block_config,
            vec![ctx.carry.clone()],
            ctx.num_weight_stripes,
        )];
        let mut results = Vec::new();
        for plans in self.plans_parallel(part, &request) {
            for plan in plans {
                let Some(closed) = self.extend_section(q, ctx, plan, true)? else { continue };
                let mut comb = closed.comb;
                let merged = comb.build_op_graph()?;
                let est = estimate_op_graph(&merged.graph, self.caps, self.est_opts)?;
                comb.set_metric(est.metric);
                results.push(comb);
            }
        }
        Ok(results)
    }

    /// Shared Middle/End bookkeeping: adopt the carry by replacement, place
    /// the new plan's SRAM buffers, release the old carry.
    fn extend_section(
        &self,
        q: PartId,
        ctx: &SectionContext,
        plan: Plan,
        is_end: bool,
    ) -> Result<Option<SectionContext>> {
        let in_slot = PartInputSlot::new(q, 0);
        let Some(in_id) = plan.input_buffer(in_slot) else { return Ok(None) };
        match plan.graph.buffer(in_id).as_sram() {
            Some(b) if b.is_compatible_with(&ctx.carry) => {}
            _ => return Ok(None),
        }

        let mut alloc = ctx.alloc.clone();
        let Some(placed) = allocate_plan(&mut alloc, &plan, Some(in_id)) else {
            return Ok(None);
        };
        // the old carry dies once this part has consumed it
        if let Some((offset, size)) = ctx.carry_alloc {
            alloc.free(offset, size);
        }

        let out_slot = PartOutputSlot::new(q, 0);
        let mut carry = ctx.carry.clone();
        let mut carry_alloc = None;
        if !is_end {
            let Some(out_id) = plan.output_buffer(out_slot) else { return Ok(None) };
            let Some(next_carry) = plan.graph.buffer(out_id).as_sram().cloned() else {
                return Ok(None);
            };
            for (id, offset, size) in &placed {
                if *id == out_id {
                    carry_alloc = Some((*offset, *size));
                }
            }
            // everything except the new carry dies with this part
            for (id, offset, size) in placed {
                if id != out_id {
                    alloc.free(offset, size);
                }
            }
            carry = next_carry;
        } else {
            for (_, offset, size) in placed {
                alloc.free(offset, size);
            }
        }

        let mut glue = StartingGlue::default();
        glue.external.replacements.push((
            crate::combiner::glue::BufferRef::PlanInput(in_slot),
            crate::combiner::glue::BufferRef::PlanOutput(ctx.carry_slot),
        ));
        let mut comb = ctx.comb.clone() + Combination::single(q, Arc::new(plan));
        comb.set_starting_glue(in_slot, Arc::new(glue))?;

        Ok(Some(SectionContext {
            comb,
            alloc,
            block_config: ctx.block_config,
            num_weight_stripes: ctx.num_weight_stripes,
            carry,
            carry_slot: out_slot,
            carry_alloc,
        }))
    }

    /// DRAM formats a head combination offers to the parts after it, in
    /// connection order: the memo signature for the suffix.
    fn boundary_signature(&self, head: &Combination) -> Result<Vec<DramFormat>> {
        let mut formats = Vec::new();
        for (slot, _) in self.crossing_connections(head, head.end_part_id()) {
            let elem = head.elem(slot.part)?;
            let buffer = elem.plan.output_buffer(slot).ok_or_else(|| {
                CompileError::Invariant(format!("plan for part {} missing output", slot.part))
            })?;
            if let Buffer::Dram(d) = elem.plan.graph.buffer(buffer) {
                formats.push(d.format);
            }
        }
        Ok(formats)
    }

    /// Connections whose producer lies inside `head` (below `boundary`) and
    /// whose consumer lies at or beyond it, grouped by producing slot.
    fn crossing_connections(
        &self,
        head: &Combination,
        boundary: PartId,
    ) -> BTreeMap<PartOutputSlot, Vec<PartInputSlot>> {
        let mut grouped: BTreeMap<PartOutputSlot, Vec<PartInputSlot>> = BTreeMap::new();
        for (&dst, &src) in self.graph.connections() {
            if src.part >= head.first_part_id() && src.part < boundary && dst.part >= boundary {
                grouped.entry(src).or_default().push(dst);
            }
        }
        grouped
    }

    /// Merges a head with the best tail, synthesizes the boundary glue and
    /// re-estimates the whole fragment so glue traffic is priced in.
    fn join(&self, head: Combination, tail: Combination) -> Result<Combination> {
        let boundary = head.end_part_id();
        let crossings = self.crossing_connections(&head, boundary);
        let mut comb = head + tail;
        let end = comb.end_part_id();

        for (source_slot, consumers) in crossings {
            let producer_elem = comb.elem(source_slot.part)?;
            let producer_buffer_id = producer_elem.plan.output_buffer(source_slot).ok_or_else(|| {
                CompileError::Invariant(format!(
                    "plan for part {} missing output slot {}",
                    source_slot.part, source_slot.index
                ))
            })?;
            let producer_buffer = producer_elem.plan.graph.buffer(producer_buffer_id).clone();

            let mut consumer_buffers = Vec::new();
            for &input_slot in consumers.iter().filter(|c| c.part < end) {
                let elem = comb.elem(input_slot.part)?;
                let buffer_id = elem.plan.input_buffer(input_slot).ok_or_else(|| {
                    CompileError::Invariant(format!(
                        "plan for part {} missing input slot {}",
                        input_slot.part, input_slot.index
                    ))
                })?;
                consumer_buffers.push((input_slot, elem.plan.graph.buffer(buffer_id).clone()));
            }

            let refs: Vec<(PartInputSlot, &Buffer)> =
                consumer_buffers.iter().map(|(slot, b)| (*slot, b)).collect();
            let glues =
                synthesize_glue(source_slot, &producer_buffer, &refs, self.caps, self.options)?;
            if let Some(ending) = glues.ending {
                comb.set_ending_glue(source_slot, Arc::new(ending))?;
            }
            for ((input_slot, _), starting) in consumer_buffers.iter().zip(glues.starting) {
                comb.set_starting_glue(*input_slot, Arc::new(starting))?;
            }
        }

        let merged = comb.build_op_graph()?;
        let est = estimate_op_graph(&merged.graph, self.caps, self.est_opts)?;
        comb.set_metric(est.metric);
        Ok(comb)
    }
}

/// Places every SRAM buffer of a plan, skipping the one adopted from the
/// predecessor. Returns the placements, or `None` (with the allocator rolled
/// back) when the plan does not fit. Pre-allocated plans manage their own
/// budget and get no placements.
fn allocate_plan(
    alloc: &mut SramAllocator,
    plan: &Plan,
    skip: Option<BufferId>,
) -> Option<Vec<(BufferId, u32, u32)>> {
    if plan.pre_allocated {
        return Some(Vec::new());
    }
    let mut placed = Vec::new();
    for (id, sram) in plan.sram_buffers() {
        if Some(id) == skip {
            continue;
        }
        match alloc.allocate(sram.size_bytes) {
            Some(offset) => placed.push((id, offset, sram.size_bytes)),
            None => {
                for (_, offset, size) in placed {
                    alloc.free(offset, size);
                }
                return None;
            }
        }
    }
    Some(placed)
}
