//! SRAM bookkeeping for the search: a first-fit free-list allocator used
//! while a section is being grown, the liveness summation used to check a
//! finished combination against the hardware's SRAM capacity, and the final
//! offset-assignment pass over the merged op graph.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::buffer::Buffer;
use crate::core::error::{CompileError, Result};
use crate::core::graph::{BufferId, OpGraph};

/// First-fit allocator over the SRAM byte range. Freed blocks are coalesced
/// with their neighbours so fragmentation stays bounded during backtracking.
#[derive(Debug, Clone)]
pub struct SramAllocator {
    capacity: u32,
    /// Free blocks as (offset, size), sorted by offset, non-adjacent.
    free: Vec<(u32, u32)>,
}

impl SramAllocator {
    pub fn new(capacity: u32) -> Self {
        Self { capacity, free: vec![(0, capacity)] }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn used_bytes(&self) -> u32 {
        self.capacity - self.free.iter().map(|&(_, s)| s).sum::<u32>()
    }

    /// Returns the offset of the placed block, or `None` when nothing fits.
    pub fn allocate(&mut self, size: u32) -> Option<u32> {
        if size == 0 {
            return Some(0);
        }
        let idx = self.free.iter().position(|&(_, s)| s >= size)?;
        let (offset, block_size) = self.free[idx];
        if block_size == size {
            self.free.remove(idx);
        } else {
            self.free[idx] = (offset + size, block_size - size);
        }
        Some(offset)
    }

    pub fn free(&mut self, offset: u32, size: u32) {
        if size == 0 {
            return;
        }
        let idx = self.free.partition_point(|&(o, _)| o < offset);
        self.free.insert(idx, (offset, size));
        // coalesce with the next block, then the previous one
        if idx + 1 < self.free.len() {
            let (o, s) = self.free[idx];
            let (no, ns) = self.free[idx + 1];
            if o + s == no {
                self.free[idx] = (o, s + ns);
                self.free.remove(idx + 1);
            }
        }
        if idx > 0 {
            let (po, ps) = self.free[idx - 1];
            let (o, s) = self.free[idx];
            if po + ps == o {
                self.free[idx - 1] = (po, ps + s);
                self.free.remove(idx);
            }
        }
    }
}

/// Live interval of one SRAM buffer over the execution order: the step its
/// first producer runs (or 0 for graph inputs) through the step its last
/// consumer runs (or the final step for graph outputs), plus its size.
struct Lifetime {
    buffer: BufferId,
    start: usize,
    end: usize,
    size: u32,
}

fn sram_lifetimes(graph: &OpGraph, exempt: &BTreeSet<BufferId>) -> (usize, Vec<Lifetime>) {
    let order = graph.sorted_ops();
    let position: BTreeMap<_, _> = order.iter().enumerate().map(|(i, &op)| (op, i)).collect();
    let steps = order.len().max(1);

    let mut lifetimes = Vec::new();
    for b in graph.buffer_ids() {
        if exempt.contains(&b) {
            continue;
        }
        let size = match graph.buffer(b) {
            Buffer::Sram(s) => s.size_bytes,
            _ => continue,
        };
        let start = graph.producers(b).iter().map(|op| position[op]).min().unwrap_or(0);
        let end =
            graph.consumers(b).iter().map(|(op, _)| position[op]).max().unwrap_or(steps - 1);
        lifetimes.push(Lifetime { buffer: b, start, end, size });
    }
    (steps, lifetimes)
}

/// Peak number of SRAM bytes simultaneously live over the deterministic
/// execution order of `graph`. Buffers in `exempt` belong to pre-allocated
/// plans, which manage their own internal lifetime, and are skipped.
pub fn peak_sram_usage(graph: &OpGraph, exempt: &BTreeSet<BufferId>) -> u64 {
    let (steps, lifetimes) = sram_lifetimes(graph, exempt);
    let mut deltas = vec![0i64; steps + 1];
    for lt in &lifetimes {
        deltas[lt.start] += i64::from(lt.size);
        deltas[lt.end + 1] -= i64::from(lt.size);
    }
    let mut live = 0i64;
    let mut peak = 0i64;
    for d in deltas {
        live += d;
        peak = peak.max(live);
    }
    peak.max(0) as u64
}

/// Assigns a concrete SRAM offset to every non-exempt SRAM buffer of a
/// merged op graph: linear scan over the execution order, releasing expired
/// buffers and placing newborn ones first-fit. Fails when the graph does not
/// fit the capacity, which the search should have ruled out already.
pub fn assign_sram_offsets(
    graph: &mut OpGraph,
    exempt: &BTreeSet<BufferId>,
    capacity: u32,
) -> Result<u64> {
    let (steps, lifetimes) = sram_lifetimes(graph, exempt);
    let mut by_start: BTreeMap<usize, Vec<&Lifetime>> = BTreeMap::new();
    for lt in &lifetimes {
        by_start.entry(lt.start).or_default().push(lt);
    }

    let mut alloc = SramAllocator::new(capacity);
    let mut active: Vec<(usize, u32, u32)> = Vec::new();
    let mut offsets: BTreeMap<BufferId, u32> = BTreeMap::new();
    let mut peak = 0u64;

    for step in 0..steps {
        active.retain(|&(end, offset, size)| {
            if end < step {
                alloc.free(offset, size);
                false
            } else {
                true
            }
        });
        for lt in by_start.get(&step).into_iter().flatten() {
            let offset = alloc.allocate(lt.size).ok_or_else(|| {
                CompileError::Invariant(format!(
                    "SRAM placement failed at {} bytes against capacity {capacity}",
                    lt.size
                ))
            })?;
            active.push((lt.end, offset, lt.size));
            offsets.insert(lt.buffer, offset);
            peak = peak.max(u64::from(alloc.used_bytes()));
        }
    }

    for (buffer, offset) in offsets {
        if let Some(sram) = graph.buffer_mut(buffer).as_sram_mut() {
            sram.offset = Some(offset);
        }
    }
    Ok(peak)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffer::{DramFormat, SramBuffer, TraversalOrder};
    use crate::core::op::{DmaOp, Op, OpKind};

    #[test]
    fn test_first_fit_and_coalescing() {
        let mut a = SramAllocator::new(1024);
        let x = a.allocate(256).unwrap();
        let y = a.allocate(256).unwrap();
        let z = a.allocate(512).unwrap();
        assert_eq!((x, y, z), (0, 256, 512));
        assert!(a.allocate(1).is_none());

        a.free(y, 256);
        a.free(x, 256);
        // the two blocks must have merged
        assert_eq!(a.allocate(512), Some(0));
    }

    #[test]
    fn test_allocate_reuses_freed_hole() {
        let mut a = SramAllocator::new(1000);
        let x = a.allocate(100).unwrap();
        let _y = a.allocate(100).unwrap();
        a.free(x, 100);
        // first fit lands in the hole, not at the watermark
        assert_eq!(a.allocate(50), Some(0));
    }

    fn sram_buffer() -> Buffer {
        Buffer::Sram(SramBuffer::new([1, 8, 8, 16], [1, 8, 8, 16], TraversalOrder::Xyz, 1))
    }

    /// dma1: a -> b, dma2: b -> c; a and b overlap while dma1 runs.
    fn two_hop_graph() -> (OpGraph, BufferId, BufferId) {
        let mut g = OpGraph::new();
        let a = g.add_buffer(sram_buffer());
        let b = g.add_buffer(sram_buffer());
        let d1 = g.add_op(Op::new(OpKind::Dma(DmaOp::new(DramFormat::Planar))));
        g.add_consumer(a, d1, 0).unwrap();
        g.add_producer(b, d1);
        (g, a, b)
    }

    #[test]
    fn test_peak_usage_counts_overlapping_lifetimes() {
        let (g, a, _) = two_hop_graph();
        let size = u64::from(g.buffer(a).size_bytes());
        assert_eq!(peak_sram_usage(&g, &BTreeSet::new()), 2 * size);

        let exempt: BTreeSet<_> = [a].into_iter().collect();
        assert_eq!(peak_sram_usage(&g, &exempt), size);
    }

    #[test]
    fn test_assign_offsets_places_overlapping_buffers_apart() {
        let (mut g, a, b) = two_hop_graph();
        let size = g.buffer(a).size_bytes();
        let peak = assign_sram_offsets(&mut g, &BTreeSet::new(), 4 * size).unwrap();
        assert_eq!(peak, u64::from(2 * size));
        let oa = g.buffer(a).as_sram().unwrap().offset.unwrap();
        let ob = g.buffer(b).as_sram().unwrap().offset.unwrap();
        assert_ne!(oa, ob);

        // too small a capacity must be rejected
        let (mut g2, _, _) = two_hop_graph();
        assert!(assign_sram_offsets(&mut g2, &BTreeSet::new(), size).is_err());
    }
}
