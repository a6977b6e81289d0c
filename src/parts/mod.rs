//! The part interface: one part is one node of the network-level graph,
//! able to enumerate candidate plans under the constraints the combiner is
//! currently exploring.

pub mod concat;
pub mod engine;
pub mod estimate_only;
pub mod graph;
pub mod io;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::buffer::SramBuffer;
use crate::core::op::BlockConfig;
use crate::core::plan::{PartId, PartInputSlot, PartOutputSlot, Plan};

pub use graph::GraphOfParts;

/// The role a plan takes inside a cascaded section. `Lonely` plans are
/// self-contained, reading and writing DRAM at both ends. The other three
/// participate in a chain where SRAM buffers are handed directly between
/// neighbouring parts: `Beginning` and `Middle` must leave their output in
/// SRAM, `Middle` and `End` must adopt the predecessor's SRAM buffer as
/// their input instead of allocating their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CascadeType {
    Lonely,
    Beginning,
    Middle,
    End,
}

/// A directed connection between two parts: an output slot feeding an input
/// slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartConnection {
    pub dest: PartInputSlot,
    pub source: PartOutputSlot,
}

/// A node in the graph of parts. Implementations are created once by the
/// front end and are immutable afterwards, with the single exception of
/// `try_merge_clamp`, which folds a following activation clamp into a
/// compute part in place.
pub trait Part: fmt::Debug + Send + Sync {
    fn id(&self) -> PartId;

    /// Used by `GraphOfParts::sort_and_compact` when renumbering.
    fn set_id(&mut self, id: PartId);

    /// Source-network operations this part realizes.
    fn operation_ids(&self) -> &BTreeSet<u32>;

    /// Enumerates candidate plans for the given cascade role. An empty
    /// result means "no valid plan under these constraints", which is a
    /// normal outcome the combiner handles by trying other roles; it is
    /// never an error. Pure: safe to call from several workers at once.
    fn get_plans(
        &self,
        cascade: CascadeType,
        block_config: BlockConfig,
        prev_sram: &[SramBuffer],
        num_weight_stripes: u32,
    ) -> Vec<Plan>;

    /// Whether weight stripe double-buffering is worth offering for this
    /// part.
    fn can_double_buffer_weights(&self) -> bool {
        false
    }

    /// Folds an activation clamp into this part's compute output stage.
    /// Returns false when this part kind cannot absorb it.
    fn try_merge_clamp(&mut self, lower: i16, upper: i16) -> bool {
        let _ = (lower, upper);
        false
    }
}
