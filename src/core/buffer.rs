//! The buffer model: typed descriptions of the memory regions a plan moves
//! data through. A buffer lives in external DRAM, in on-chip SRAM as a
//! rolling set of stripe slots, or in the small staging store that feeds the
//! post-processing unit directly.

use serde::{Deserialize, Serialize};

use crate::core::shape::{self, TensorShape};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TraversalOrder {
    Xyz,
    Zxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Location {
    Dram,
    Sram,
    PostInputSram,
}

/// Serialized layouts a DRAM tensor can use. `Planar` is the linear
/// network-facing layout, `Tiled` the brick-interleaved layout the DMA
/// prefers, and the two `Compressed*` variants are the lossless tiled
/// compression cells (differing in cell aspect). `EncodedWeights` is the
/// opaque stream produced by the weight encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DramFormat {
    Planar,
    Tiled,
    CompressedDeep,
    CompressedWide,
    EncodedWeights,
}

impl DramFormat {
    pub fn is_compressed(self) -> bool {
        matches!(self, DramFormat::CompressedDeep | DramFormat::CompressedWide)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantizationInfo {
    pub zero_point: i32,
    pub scale: f32,
}

impl Default for QuantizationInfo {
    fn default() -> Self {
        Self { zero_point: 0, scale: 1.0 }
    }
}

/// How much boundary data from neighbouring stripes is packed into each slot
/// of an SRAM buffer. Non-zero when a following kernel needs a halo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BoundaryThickness {
    pub left: u8,
    pub top: u8,
    pub right: u8,
    pub bottom: u8,
}

impl BoundaryThickness {
    pub fn is_zero(&self) -> bool {
        self.left == 0 && self.top == 0 && self.right == 0 && self.bottom == 0
    }
}

/// What a DRAM buffer is to the surrounding network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DramRole {
    Input,
    Output,
    Intermediate,
    ConstantData,
}

/// A rolling buffer in on-chip SRAM holding `num_stripes` stripe slots at a
/// time. `size_bytes` is the whole tile, `slot_size_bytes` one slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SramBuffer {
    pub shape: TensorShape,
    pub stripe_shape: TensorShape,
    pub order: TraversalOrder,
    pub num_stripes: u32,
    pub slot_size_bytes: u32,
    pub size_bytes: u32,
    pub packed_boundary: BoundaryThickness,
    /// How many times the tensor is loaded into this buffer. Greater than one
    /// when the chosen traversal order forces stripes to be re-fetched.
    pub num_loads: u32,
    /// Byte offset in SRAM, assigned by the combiner.
    pub offset: Option<u32>,
}

impl SramBuffer {
    /// A brick-interleaved SRAM buffer; slot size derived from the stripe.
    pub fn new(shape: TensorShape, stripe_shape: TensorShape, order: TraversalOrder, num_stripes: u32) -> Self {
        let slot = shape::tiled_size_bytes(&stripe_shape);
        Self {
            shape,
            stripe_shape,
            order,
            num_stripes,
            slot_size_bytes: slot,
            size_bytes: slot * num_stripes,
            packed_boundary: BoundaryThickness::default(),
            num_loads: 1,
            offset: None,
        }
    }

    /// An SRAM buffer with an explicit slot size, for data that is not
    /// brick-interleaved (encoded weight streams).
    pub fn with_slot_size(shape: TensorShape, stripe_shape: TensorShape, num_stripes: u32, slot_size_bytes: u32) -> Self {
        Self {
            shape,
            stripe_shape,
            order: TraversalOrder::Xyz,
            num_stripes,
            slot_size_bytes,
            size_bytes: slot_size_bytes * num_stripes,
            packed_boundary: BoundaryThickness::default(),
            num_loads: 1,
            offset: None,
        }
    }

    pub fn with_num_loads(mut self, num_loads: u32) -> Self {
        self.num_loads = num_loads;
        self
    }

    pub fn is_full_tensor(&self) -> bool {
        shape::is_full_tensor(&self.shape, &self.stripe_shape)
    }

    /// Two SRAM buffers can be merged into one (the cascading handshake) only
    /// when their geometry agrees exactly.
    pub fn is_compatible_with(&self, other: &SramBuffer) -> bool {
        self.shape == other.shape
            && self.stripe_shape == other.stripe_shape
            && self.order == other.order
            && self.num_stripes == other.num_stripes
            && self.packed_boundary == other.packed_boundary
    }
}

/// A tensor in external DRAM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DramBuffer {
    pub shape: TensorShape,
    pub format: DramFormat,
    pub size_bytes: u32,
    pub quant: QuantizationInfo,
    pub role: DramRole,
    /// Payload for constant buffers (encoded weights, bias tables).
    pub constant_data: Option<Vec<u8>>,
    /// Source network operation this buffer is visible to, for input/output
    /// buffers only.
    pub operation_id: Option<u32>,
}

impl DramBuffer {
    pub fn new(shape: TensorShape, format: DramFormat, role: DramRole, quant: QuantizationInfo) -> Self {
        let size_bytes = match format {
            DramFormat::Planar => shape::num_elements(&shape) as u32,
            // Compression is lossless, so the buffer is sized for the worst
            // case, which is the plain tiled layout.
            DramFormat::Tiled | DramFormat::CompressedDeep | DramFormat::CompressedWide => {
                shape::tiled_size_bytes(&shape)
            }
            DramFormat::EncodedWeights => shape::num_elements(&shape) as u32,
        };
        Self { shape, format, size_bytes, quant, role, constant_data: None, operation_id: None }
    }

    pub fn with_size(mut self, size_bytes: u32) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    pub fn with_operation_id(mut self, id: u32) -> Self {
        self.operation_id = Some(id);
        self
    }
}

/// SRAM staging feeding the post-processing unit directly, bypassing one DMA
/// hop. Produced only by the compute engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostInputBuffer {
    pub shape: TensorShape,
    pub stripe_shape: TensorShape,
    pub num_stripes: u32,
    pub size_bytes: u32,
}

impl PostInputBuffer {
    pub fn new(shape: TensorShape, stripe_shape: TensorShape) -> Self {
        let slot = shape::tiled_size_bytes(&stripe_shape);
        Self { shape, stripe_shape, num_stripes: 1, size_bytes: slot }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Buffer {
    Sram(SramBuffer),
    Dram(DramBuffer),
    PostInput(PostInputBuffer),
}

impl Buffer {
    pub fn location(&self) -> Location {
        match self {
            Buffer::Sram(_) => Location::Sram,
            Buffer::Dram(_) => Location::Dram,
            Buffer::PostInput(_) => Location::PostInputSram,
        }
    }

    pub fn shape(&self) -> &TensorShape {
        match self {
            Buffer::Sram(b) => &b.shape,
            Buffer::Dram(b) => &b.shape,
            Buffer::PostInput(b) => &b.shape,
        }
    }

    pub fn size_bytes(&self) -> u32 {
        match self {
            Buffer::Sram(b) => b.size_bytes,
            Buffer::Dram(b) => b.size_bytes,
            Buffer::PostInput(b) => b.size_bytes,
        }
    }

    pub fn as_sram(&self) -> Option<&SramBuffer> {
        match self {
            Buffer::Sram(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_sram_mut(&mut self) -> Option<&mut SramBuffer> {
        match self {
            Buffer::Sram(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_dram(&self) -> Option<&DramBuffer> {
        match self {
            Buffer::Dram(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_dram_mut(&mut self) -> Option<&mut DramBuffer> {
        match self {
            Buffer::Dram(b) => Some(b),
            _ => None,
        }
    }
}
