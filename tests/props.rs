//! Property tests for the pieces of the combiner whose invariants are
//! naturally range-shaped: the SRAM allocator, DRAM format selection and
//! combination merging.

use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

use cascata::combiner::combination::Combination;
use cascata::combiner::glue::select_dram_format;
use cascata::combiner::sram::SramAllocator;
use cascata::core::buffer::{Buffer, DramBuffer, DramFormat, DramRole, QuantizationInfo};
use cascata::core::graph::OpGraph;
use cascata::core::plan::{PartId, PartOutputSlot, Plan};
use cascata::{CompilationOptions, HardwareCapabilities};

const CAPACITY: u32 = 64 * 1024;

fn trivial_plan(part: PartId) -> Arc<Plan> {
    let mut graph = OpGraph::new();
    let b = graph.add_buffer(Buffer::Dram(DramBuffer::new(
        [1, 8, 8, 16],
        DramFormat::Planar,
        DramRole::Intermediate,
        QuantizationInfo::default(),
    )));
    let outputs = BTreeMap::from([(PartOutputSlot::new(part, 0), b)]);
    Arc::new(Plan::new(graph, BTreeMap::new(), outputs))
}

proptest! {
    /// No two live allocations may ever overlap, whatever the request
    /// sequence looks like.
    #[test]
    fn prop_allocator_never_overlaps(sizes in prop::collection::vec(1u32..5000, 1..32)) {
        let mut alloc = SramAllocator::new(CAPACITY);
        let mut placed: Vec<(u32, u32)> = Vec::new();
        for size in sizes {
            if let Some(offset) = alloc.allocate(size) {
                prop_assert!(offset + size <= CAPACITY);
                for &(po, ps) in &placed {
                    prop_assert!(
                        offset + size <= po || po + ps <= offset,
                        "allocation [{offset}, {}) overlaps [{po}, {})",
                        offset + size,
                        po + ps
                    );
                }
                placed.push((offset, size));
            }
        }
    }

    /// Freeing everything coalesces back to one block covering the whole
    /// capacity.
    #[test]
    fn prop_allocator_free_restores_capacity(sizes in prop::collection::vec(1u32..5000, 1..32)) {
        let mut alloc = SramAllocator::new(CAPACITY);
        let placed: Vec<(u32, u32)> =
            sizes.iter().filter_map(|&s| alloc.allocate(s).map(|o| (o, s))).collect();
        for &(offset, size) in placed.iter().rev() {
            alloc.free(offset, size);
        }
        prop_assert_eq!(alloc.used_bytes(), 0);
        let mut drained = alloc.clone();
        prop_assert_eq!(drained.allocate(CAPACITY), Some(0));
    }

    /// Format selection is a pure function of shapes and options, and never
    /// returns a compressed layout when compression is off.
    #[test]
    fn prop_format_selection_deterministic(
        h in 1u32..64,
        w in 1u32..64,
        c in 1u32..128,
        sh in 1u32..64,
    ) {
        let caps = HardwareCapabilities::edge();
        let shape = [1, h, w, c];
        let stripe = [1, sh.min(h), w, c];
        let opts = CompilationOptions::default();
        let first = select_dram_format(&shape, &[stripe], &caps, &opts);
        let second = select_dram_format(&shape, &[stripe], &caps, &opts);
        prop_assert_eq!(first, second);

        let no_compression =
            CompilationOptions { enable_intermediate_compression: false, ..Default::default() };
        let fallback = select_dram_format(&shape, &[stripe], &caps, &no_compression);
        prop_assert!(!fallback.is_compressed());
    }

    /// Merging adjacent partial combinations is associative: same coverage,
    /// same part order, same metric. Metrics are integral so the sums are
    /// exact.
    #[test]
    fn prop_combination_merge_associative(
        lens in prop::collection::vec(1u32..4, 3),
        metrics in prop::collection::vec(0u32..1000, 3),
    ) {
        let mut singles = Vec::new();
        let mut next: PartId = 0;
        for (chunk, metric) in lens.iter().zip(&metrics) {
            let mut comb = Combination::empty();
            for _ in 0..*chunk {
                comb = comb + Combination::single(next, trivial_plan(next));
                next += 1;
            }
            comb.set_metric(f64::from(*metric));
            singles.push(comb);
        }
        let [a, b, c] = <[Combination; 3]>::try_from(singles).unwrap();

        let left = (a.clone() + b.clone()) + c.clone();
        let right = a + (b + c);
        prop_assert_eq!(left.first_part_id(), right.first_part_id());
        prop_assert_eq!(left.end_part_id(), right.end_part_id());
        prop_assert_eq!(left.metric(), right.metric());
        let lp: Vec<PartId> = left.elems().iter().map(|e| e.part_id).collect();
        let rp: Vec<PartId> = right.elems().iter().map(|e| e.part_id).collect();
        prop_assert_eq!(lp, rp);
    }
}
