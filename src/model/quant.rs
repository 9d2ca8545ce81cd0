//! Block-wise symmetric 4-bit quantization for frozen base weights.
//!
//! Each 64-element block stores one f32 scale plus packed signed nibbles,
//! cutting base weight memory by roughly 8x. Quantization maps
//! q = round(clamp(x / scale, -7, 7)) with scale = max |x| / 7 per block;
//! dequantization is x ≈ q * scale.

use serde::{Deserialize, Serialize};

/// Elements per quantization block.
pub const BLOCK_SIZE: usize = 64;

/// Packed 4-bit representation with per-block scales.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Quantized4Bit {
    /// One scale per block
    pub scales: Vec<f32>,
    /// Two signed nibbles per byte, element order preserved
    pub data: Vec<u8>,
    /// Original element count
    pub len: usize,
}

/// Quantize f32 values with block-wise scaling.
pub fn quantize_4bit(values: &[f32]) -> Quantized4Bit {
    let len = values.len();
    let num_blocks = len.div_ceil(BLOCK_SIZE);
    let mut scales = Vec::with_capacity(num_blocks);
    let mut data = vec![0u8; len.div_ceil(2)];

    for (block_idx, block) in values.chunks(BLOCK_SIZE).enumerate() {
        let max_abs = block.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
        let scale = if max_abs > 0.0 { max_abs / 7.0 } else { 1e-8 };
        scales.push(scale);

        let base = block_idx * BLOCK_SIZE;
        for (i, &val) in block.iter().enumerate() {
            let idx = base + i;
            let q = ((val / scale).clamp(-7.0, 7.0).round() as i8) as u8 & 0x0F;
            // Even elements take the high nibble, odd the low nibble
            if idx % 2 == 0 {
                data[idx / 2] |= q << 4;
            } else {
                data[idx / 2] |= q;
            }
        }
    }

    Quantized4Bit { scales, data, len }
}

/// Reconstruct f32 values from packed nibbles.
pub fn dequantize_4bit(quantized: &Quantized4Bit) -> Vec<f32> {
    let mut result = Vec::with_capacity(quantized.len);

    for idx in 0..quantized.len {
        let byte = quantized.data[idx / 2];
        let nibble = if idx % 2 == 0 { byte >> 4 } else { byte & 0x0F };
        let q = sign_extend_nibble(nibble);
        let scale = quantized.scales[idx / BLOCK_SIZE];
        result.push(f32::from(q) * scale);
    }

    result
}

#[inline]
fn sign_extend_nibble(nibble: u8) -> i8 {
    if nibble & 0x08 != 0 {
        (nibble | 0xF0) as i8
    } else {
        nibble as i8
    }
}
