//! Tensor shape arithmetic shared by the buffer model, the parts and the
//! estimator. Shapes are NHWC throughout; all data is 8-bit quantized, so
//! element counts double as byte counts before layout rounding.

/// NHWC dimensions: batch, height, width, channels.
pub type TensorShape = [u32; 4];

/// On-chip data is stored brick-interleaved. These are the brick dimensions
/// every SRAM slot is rounded up to (height, width, channels).
pub const BRICK_HEIGHT: u32 = 8;
pub const BRICK_WIDTH: u32 = 8;
pub const BRICK_DEPTH: u32 = 16;

pub fn round_up(value: u32, multiple: u32) -> u32 {
    debug_assert!(multiple > 0);
    value.div_ceil(multiple) * multiple
}

pub fn divide_round_up(numerator: u32, denominator: u32) -> u32 {
    debug_assert!(denominator > 0);
    numerator.div_ceil(denominator)
}

pub fn num_elements(shape: &TensorShape) -> u64 {
    shape.iter().map(|&d| u64::from(d)).product()
}

/// Size in bytes of a tensor laid out brick-interleaved (each dimension
/// rounded up to the brick geometry).
pub fn tiled_size_bytes(shape: &TensorShape) -> u32 {
    let h = round_up(shape[1].max(1), BRICK_HEIGHT);
    let w = round_up(shape[2].max(1), BRICK_WIDTH);
    let c = round_up(shape[3].max(1), BRICK_DEPTH);
    shape[0].max(1) * h * w * c
}

/// Number of stripes along one dimension.
pub fn stripes_in_dim(tensor: &TensorShape, stripe: &TensorShape, dim: usize) -> u32 {
    divide_round_up(tensor[dim].max(1), stripe[dim].max(1))
}

/// Total number of stripes needed to cover `tensor` with `stripe`.
pub fn total_stripes(tensor: &TensorShape, stripe: &TensorShape) -> u32 {
    (0..4).map(|d| stripes_in_dim(tensor, stripe, d)).product()
}

/// A stripe covering the whole tensor means no streaming is taking place.
pub fn is_full_tensor(tensor: &TensorShape, stripe: &TensorShape) -> bool {
    (0..4).all(|d| stripe[d] >= tensor[d])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounding() {
        assert_eq!(round_up(1, 8), 8);
        assert_eq!(round_up(8, 8), 8);
        assert_eq!(round_up(9, 8), 16);
        assert_eq!(divide_round_up(17, 16), 2);
    }

    #[test]
    fn test_tiled_size_rounds_to_bricks() {
        // 1x16x16x16 fits bricks exactly
        assert_eq!(tiled_size_bytes(&[1, 16, 16, 16]), 16 * 16 * 16);
        // one extra row pulls in a whole brick row
        assert_eq!(tiled_size_bytes(&[1, 17, 16, 16]), 24 * 16 * 16);
    }

    #[test]
    fn test_stripe_counts() {
        let tensor = [1, 32, 16, 64];
        let stripe = [1, 8, 16, 64];
        assert_eq!(total_stripes(&tensor, &stripe), 4);
        assert!(!is_full_tensor(&tensor, &stripe));
        assert!(is_full_tensor(&tensor, &tensor));
    }
}
