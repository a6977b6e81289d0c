//! Interface to the weight encoder, which lives outside this crate. Plan
//! generation only needs encoded sizes, and those must be deterministic, so
//! a fixed per-algorithm ratio model stands in for the real encoder here.

use serde::{Deserialize, Serialize};

use crate::core::op::EngineAlgorithm;
use crate::core::shape::{num_elements, TensorShape};

/// Observed average encoding ratios. The estimator can override the saving
/// via `EstimationOptions::weight_compression_override`.
const DIRECT_RATIO: f32 = 0.65;
const WINOGRAD_RATIO: f32 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EncodedWeights {
    pub size_bytes: u32,
    /// encoded size / raw size.
    pub compression_ratio: f32,
}

/// Deterministic stand-in for the external weight encoder: raw HWIO weights
/// plus per-channel bias words, scaled by the algorithm's encoding ratio.
pub fn estimate_encoded_weights(weights_shape: &TensorShape, algo: EngineAlgorithm) -> EncodedWeights {
    let raw = num_elements(weights_shape) as f32;
    let bias = weights_shape[3] as f32 * 4.0;
    let ratio = match algo {
        EngineAlgorithm::Direct => DIRECT_RATIO,
        EngineAlgorithm::Winograd => WINOGRAD_RATIO,
    };
    let size = ((raw + bias) * ratio).ceil() as u32;
    EncodedWeights { size_bytes: size.max(1), compression_ratio: ratio }
}
