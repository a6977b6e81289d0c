//! The hardware capabilities description. Callers hand us an opaque
//! versioned binary blob; everything the combiner and the estimator need is
//! parsed out of it once and treated as read-only for the whole compilation.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::op::{BlockConfig, PostKernel};
use crate::core::shape;

pub const CAPS_MAGIC: [u8; 4] = *b"NPUC";
pub const CAPS_VERSION: u32 = 2;

const POST_KERNEL_BITS: [PostKernel; 9] = [
    PostKernel::Passthrough,
    PostKernel::Addition,
    PostKernel::AdditionRescale,
    PostKernel::Multiplication,
    PostKernel::MaxPool2x2,
    PostKernel::MeanPool3x3,
    PostKernel::LeakyRelu,
    PostKernel::Sigmoid,
    PostKernel::Downsample2x2,
];

#[derive(Debug, Error)]
pub enum CapabilitiesError {
    #[error("bad capabilities magic")]
    BadMagic,
    #[error("unsupported capabilities version {0}")]
    UnsupportedVersion(u32),
    #[error("capabilities blob truncated at {field}")]
    Truncated { field: &'static str },
    #[error("invalid capabilities field {field}: {value}")]
    InvalidField { field: &'static str, value: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareCapabilities {
    pub sram_size_bytes: u32,
    pub num_engines: u32,
    pub num_sram_banks: u32,
    pub macs_per_engine_per_cycle: u32,
    pub dma_bytes_per_cycle: u32,
    /// Brick geometry (height, width, channels) SRAM slots are rounded to.
    /// Fixed for this hardware generation; `core::shape` mirrors it as
    /// constants, and parsing validates the blob agrees.
    pub brick_shape: [u32; 3],
    /// Compression cell geometry for the deep and wide compressed formats.
    pub cell_shape_deep: [u32; 3],
    pub cell_shape_wide: [u32; 3],
    /// Post-processing unit patch geometry (height, width).
    pub patch_shape: [u32; 2],
    pub post_cycles_per_patch: u32,
    /// Block configs the compute engine supports.
    pub block_configs: Vec<BlockConfig>,
    /// Post-processing kernels present in this hardware build.
    pub post_kernels: BTreeSet<PostKernel>,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u32(&mut self, field: &'static str) -> Result<u32, CapabilitiesError> {
        let end = self.pos + 4;
        if end > self.data.len() {
            return Err(CapabilitiesError::Truncated { field });
        }
        let v = u32::from_le_bytes(self.data[self.pos..end].try_into().unwrap());
        self.pos = end;
        Ok(v)
    }
}

impl HardwareCapabilities {
    /// Parses the versioned capabilities blob. The layout is magic, version,
    /// then little-endian fields in a fixed order.
    pub fn parse(data: &[u8]) -> Result<Self, CapabilitiesError> {
        if data.len() < 4 || data[0..4] != CAPS_MAGIC {
            return Err(CapabilitiesError::BadMagic);
        }
        let mut c = Cursor { data, pos: 4 };
        let version = c.u32("version")?;
        if version != CAPS_VERSION {
            return Err(CapabilitiesError::UnsupportedVersion(version));
        }
        let sram_size_bytes = c.u32("sram_size")?;
        let num_engines = c.u32("num_engines")?;
        let num_sram_banks = c.u32("num_sram_banks")?;
        let macs_per_engine_per_cycle = c.u32("macs_per_cycle")?;
        let dma_bytes_per_cycle = c.u32("dma_bytes_per_cycle")?;
        for (field, value) in [
            ("sram_size", sram_size_bytes),
            ("num_engines", num_engines),
            ("num_sram_banks", num_sram_banks),
            ("macs_per_cycle", macs_per_engine_per_cycle),
            ("dma_bytes_per_cycle", dma_bytes_per_cycle),
        ] {
            if value == 0 {
                return Err(CapabilitiesError::InvalidField { field, value });
            }
        }
        let mut triple = |field| -> Result<[u32; 3], CapabilitiesError> {
            Ok([c.u32(field)?, c.u32(field)?, c.u32(field)?])
        };
        let brick_shape = triple("brick_shape")?;
        if brick_shape != [shape::BRICK_HEIGHT, shape::BRICK_WIDTH, shape::BRICK_DEPTH] {
            return Err(CapabilitiesError::InvalidField {
                field: "brick_shape",
                value: brick_shape[2],
            });
        }
        let cell_shape_deep = triple("cell_shape_deep")?;
        let cell_shape_wide = triple("cell_shape_wide")?;
        let patch_shape = [c.u32("patch_shape")?, c.u32("patch_shape")?];
        let post_cycles_per_patch = c.u32("post_cycles_per_patch")?;

        let n = c.u32("num_block_configs")?;
        if n == 0 || n > 64 {
            return Err(CapabilitiesError::InvalidField { field: "num_block_configs", value: n });
        }
        let mut block_configs = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let w = c.u32("block_config")?;
            let h = c.u32("block_config")?;
            block_configs.push(BlockConfig::new(w, h));
        }

        let mask = c.u32("post_kernel_mask")?;
        let post_kernels = POST_KERNEL_BITS
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, k)| *k)
            .collect();

        Ok(Self {
            sram_size_bytes,
            num_engines,
            num_sram_banks,
            macs_per_engine_per_cycle,
            dma_bytes_per_cycle,
            brick_shape,
            cell_shape_deep,
            cell_shape_wide,
            patch_shape,
            post_cycles_per_patch,
            block_configs,
            post_kernels,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(96);
        out.extend_from_slice(&CAPS_MAGIC);
        for v in [
            CAPS_VERSION,
            self.sram_size_bytes,
            self.num_engines,
            self.num_sram_banks,
            self.macs_per_engine_per_cycle,
            self.dma_bytes_per_cycle,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for trio in [&self.brick_shape, &self.cell_shape_deep, &self.cell_shape_wide] {
            for v in trio {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        for v in [self.patch_shape[0], self.patch_shape[1], self.post_cycles_per_patch] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&(self.block_configs.len() as u32).to_le_bytes());
        for bc in &self.block_configs {
            out.extend_from_slice(&bc.width.to_le_bytes());
            out.extend_from_slice(&bc.height.to_le_bytes());
        }
        let mut mask = 0u32;
        for (i, k) in POST_KERNEL_BITS.iter().enumerate() {
            if self.post_kernels.contains(k) {
                mask |= 1 << i;
            }
        }
        out.extend_from_slice(&mask.to_le_bytes());
        out
    }

    pub fn supports_kernel(&self, kernel: PostKernel) -> bool {
        self.post_kernels.contains(&kernel)
    }

    /// Total MACs the array retires per cycle.
    pub fn total_macs_per_cycle(&self) -> u64 {
        u64::from(self.num_engines) * u64::from(self.macs_per_engine_per_cycle)
    }

    /// The small embedded build: two engines, 448 KiB of SRAM.
    pub fn edge() -> Self {
        Self {
            sram_size_bytes: 448 * 1024,
            num_engines: 2,
            num_sram_banks: 8,
            macs_per_engine_per_cycle: 256,
            dma_bytes_per_cycle: 16,
            brick_shape: [8, 8, 16],
            cell_shape_deep: [8, 8, 32],
            cell_shape_wide: [8, 16, 16],
            patch_shape: [4, 4],
            post_cycles_per_patch: 4,
            block_configs: vec![
                BlockConfig::new(16, 16),
                BlockConfig::new(32, 8),
                BlockConfig::new(8, 32),
            ],
            post_kernels: POST_KERNEL_BITS.iter().copied().collect(),
        }
    }

    /// The full-size build: eight engines, 1 MiB of SRAM.
    pub fn mainline() -> Self {
        Self {
            sram_size_bytes: 1024 * 1024,
            num_engines: 8,
            num_sram_banks: 16,
            ..Self::edge()
        }
    }

    pub fn with_sram_size(mut self, sram_size_bytes: u32) -> Self {
        self.sram_size_bytes = sram_size_bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_round_trip() {
        let caps = HardwareCapabilities::mainline();
        let blob = caps.to_bytes();
        let parsed = HardwareCapabilities::parse(&blob).unwrap();
        assert_eq!(parsed, caps);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut blob = HardwareCapabilities::edge().to_bytes();
        blob[0] = b'X';
        assert!(matches!(HardwareCapabilities::parse(&blob), Err(CapabilitiesError::BadMagic)));
    }

    #[test]
    fn test_wrong_version_rejected() {
        let mut blob = HardwareCapabilities::edge().to_bytes();
        blob[4] = 9;
        assert!(matches!(
            HardwareCapabilities::parse(&blob),
            Err(CapabilitiesError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_truncated_rejected() {
        let blob = HardwareCapabilities::edge().to_bytes();
        assert!(HardwareCapabilities::parse(&blob[..blob.len() - 2]).is_err());
    }
}
