//! Quantization kinds and the byte-layout contract for weight tensors.
//!
//! Every buffer that stores model weights is sized by these functions. The
//! sizes are a closed contract: a tensor's byte length follows from its element
//! count and kind alone and is never inferred from the data.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Elements per K-quant super-block.
pub const QK_K: usize = 256;

/// Elements per Q8_0 block.
pub const QK8_0: usize = 32;

/// Elements per Q4_0 block.
pub const QK4_0: usize = 32;

/// Packed 6-bit scale/min bytes in a 4-bit (and 5-bit) K block.
pub const K_SCALE_SIZE: usize = 12;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuantError {
    #[error("Unknown quantization kind: {0:?}")]
    UnknownKind(String),

    #[error(
        "Tensor byte length mismatch: {num_elements} x {kind} needs {expected} bytes, got {actual}"
    )]
    LengthMismatch {
        kind: QuantKind,
        num_elements: u64,
        expected: u64,
        actual: u64,
    },

    #[error("No reference codec for {0}")]
    Unsupported(QuantKind),
}

/// Storage kind of a weight tensor.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuantKind {
    #[serde(rename = "f32")]
    F32,
    #[serde(rename = "f16")]
    F16,
    #[serde(rename = "bf16")]
    BF16,
    #[serde(rename = "i8")]
    I8,
    #[serde(rename = "u8")]
    U8,
    #[serde(rename = "q4_0")]
    Q4_0,
    #[serde(rename = "q8_0")]
    Q8_0,
    #[serde(rename = "q4_k")]
    Q4K,
    #[serde(rename = "q5_k")]
    Q5K,
    #[serde(rename = "q6_k")]
    Q6K,
}

impl QuantKind {
    pub const ALL: [QuantKind; 10] = [
        QuantKind::F32,
        QuantKind::F16,
        QuantKind::BF16,
        QuantKind::I8,
        QuantKind::U8,
        QuantKind::Q4_0,
        QuantKind::Q8_0,
        QuantKind::Q4K,
        QuantKind::Q5K,
        QuantKind::Q6K,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QuantKind::F32 => "f32",
            QuantKind::F16 => "f16",
            QuantKind::BF16 => "bf16",
            QuantKind::I8 => "i8",
            QuantKind::U8 => "u8",
            QuantKind::Q4_0 => "q4_0",
            QuantKind::Q8_0 => "q8_0",
            QuantKind::Q4K => "q4_k",
            QuantKind::Q5K => "q5_k",
            QuantKind::Q6K => "q6_k",
        }
    }

    /// Whether elements are stored in packed blocks with shared scales.
    pub fn is_block_quantized(&self) -> bool {
        self.dtype_size().is_none()
    }

    /// Bytes per element for element-wise kinds, `None` for block kinds.
    pub fn dtype_size(&self) -> Option<usize> {
        match self {
            QuantKind::F32 => Some(4),
            QuantKind::F16 | QuantKind::BF16 => Some(2),
            QuantKind::I8 | QuantKind::U8 => Some(1),
            _ => None,
        }
    }

    /// Elements covered by one block (1 for element-wise kinds).
    pub fn block_elements(&self) -> usize {
        match self {
            QuantKind::Q4_0 => QK4_0,
            QuantKind::Q8_0 => QK8_0,
            QuantKind::Q4K | QuantKind::Q5K | QuantKind::Q6K => QK_K,
            _ => 1,
        }
    }

    /// Bytes occupied by one block.
    pub fn block_bytes(&self) -> usize {
        match self {
            // f16 scale + 16 bytes of nibbles
            QuantKind::Q4_0 => 2 + QK4_0 / 2,
            // f16 scale + 32 signed bytes
            QuantKind::Q8_0 => 2 + QK8_0,
            // d, dmin, packed scales, nibbles
            QuantKind::Q4K => 2 + 2 + K_SCALE_SIZE + QK_K / 2,
            // d, dmin, packed scales, high bits, nibbles
            QuantKind::Q5K => 2 + 2 + K_SCALE_SIZE + QK_K / 8 + QK_K / 2,
            // low nibbles, high 2-bit pairs, i8 sub-scales, d
            QuantKind::Q6K => QK_K / 2 + QK_K / 4 + QK_K / 16 + 2,
            other => other.dtype_size().unwrap_or(1),
        }
    }
}

impl fmt::Display for QuantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuantKind {
    type Err = QuantError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "f32" => Ok(QuantKind::F32),
            "f16" => Ok(QuantKind::F16),
            "bf16" => Ok(QuantKind::BF16),
            "i8" => Ok(QuantKind::I8),
            "u8" => Ok(QuantKind::U8),
            "q4_0" => Ok(QuantKind::Q4_0),
            "q8_0" => Ok(QuantKind::Q8_0),
            "q4_k" | "q4k" => Ok(QuantKind::Q4K),
            "q5_k" | "q5k" => Ok(QuantKind::Q5K),
            "q6_k" | "q6k" => Ok(QuantKind::Q6K),
            _ => Err(QuantError::UnknownKind(tag.to_string())),
        }
    }
}

/// Byte size of one block of `kind`.
pub fn block_byte_size(kind: QuantKind) -> usize {
    kind.block_bytes()
}

/// Number of `QK_K` super-blocks needed for `num_elements`.
pub fn block_count(num_elements: u64) -> u64 {
    num_elements.div_ceil(QK_K as u64)
}

/// Number of `kind` blocks needed for `num_elements`.
pub fn blocks_for(num_elements: u64, kind: QuantKind) -> u64 {
    num_elements.div_ceil(kind.block_elements() as u64)
}

/// Exact byte size of a tensor of `num_elements` stored as `kind`, or `None`
/// if it does not fit in a `u64`.
pub fn checked_tensor_byte_size(num_elements: u64, kind: QuantKind) -> Option<u64> {
    match kind.dtype_size() {
        Some(size) => num_elements.checked_mul(size as u64),
        None => blocks_for(num_elements, kind).checked_mul(kind.block_bytes() as u64),
    }
}

/// Exact byte size of a tensor of `num_elements` stored as `kind`.
/// Saturates at `u64::MAX`.
pub fn tensor_byte_size(num_elements: u64, kind: QuantKind) -> u64 {
    checked_tensor_byte_size(num_elements, kind).unwrap_or(u64::MAX)
}

/// Bytes that `QK_K` elements occupy in `kind`.
pub fn super_block_bytes(kind: QuantKind) -> u64 {
    tensor_byte_size(QK_K as u64, kind)
}

/// Round `byte_size` up to the next multiple of `QK_K` elements' worth of `kind` bytes.
pub fn pad_to_block_boundary(byte_size: u64, kind: QuantKind) -> u64 {
    align_up(byte_size, super_block_bytes(kind))
}

/// Round `value` up to a multiple of `align` (`align` of 0 leaves it unchanged).
pub fn align_up(value: u64, align: u64) -> u64 {
    if align == 0 {
        return value;
    }
    value.div_ceil(align).saturating_mul(align)
}

/// Check a delivered byte length against the codec contract.
pub fn validate_tensor_bytes(
    num_elements: u64,
    kind: QuantKind,
    actual: u64,
) -> Result<(), QuantError> {
    match checked_tensor_byte_size(num_elements, kind) {
        Some(expected) if expected == actual => Ok(()),
        expected => Err(QuantError::LengthMismatch {
            kind,
            num_elements,
            expected: expected.unwrap_or(u64::MAX),
            actual,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_sizes() {
        assert_eq!(block_byte_size(QuantKind::Q4K), 144);
        assert_eq!(block_byte_size(QuantKind::Q5K), 176);
        assert_eq!(block_byte_size(QuantKind::Q6K), 210);
        assert_eq!(block_byte_size(QuantKind::Q8_0), 34);
        assert_eq!(block_byte_size(QuantKind::Q4_0), 18);
        assert_eq!(block_byte_size(QuantKind::F32), 4);
    }

    #[test]
    fn test_block_count_rounds_up() {
        assert_eq!(block_count(0), 0);
        assert_eq!(block_count(1), 1);
        assert_eq!(block_count(256), 1);
        assert_eq!(block_count(257), 2);
    }

    #[test]
    fn test_tensor_byte_size() {
        assert_eq!(tensor_byte_size(256_000, QuantKind::Q4K), 144_000);
        assert_eq!(tensor_byte_size(300, QuantKind::Q4K), 288);
        assert_eq!(tensor_byte_size(64, QuantKind::Q8_0), 68);
        assert_eq!(tensor_byte_size(10, QuantKind::F32), 40);
        assert_eq!(tensor_byte_size(10, QuantKind::BF16), 20);
        assert_eq!(tensor_byte_size(10, QuantKind::U8), 10);
    }

    #[test]
    fn test_pad_to_block_boundary() {
        assert_eq!(pad_to_block_boundary(1, QuantKind::Q4K), 144);
        assert_eq!(pad_to_block_boundary(144, QuantKind::Q4K), 144);
        assert_eq!(pad_to_block_boundary(145, QuantKind::Q4K), 288);
        assert_eq!(pad_to_block_boundary(100, QuantKind::F16), 512);
        // 8 Q8_0 blocks per QK_K elements
        assert_eq!(pad_to_block_boundary(1, QuantKind::Q8_0), 272);
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!("Q4_K".parse::<QuantKind>().unwrap(), QuantKind::Q4K);
        assert_eq!("q6k".parse::<QuantKind>().unwrap(), QuantKind::Q6K);
        assert!(matches!(
            "q3_xs".parse::<QuantKind>(),
            Err(QuantError::UnknownKind(_))
        ));
        for kind in QuantKind::ALL {
            assert_eq!(kind.as_str().parse::<QuantKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_validate_rejects_short_tensor() {
        let err = validate_tensor_bytes(256_000, QuantKind::Q4K, 143_999).unwrap_err();
        assert_eq!(
            err,
            QuantError::LengthMismatch {
                kind: QuantKind::Q4K,
                num_elements: 256_000,
                expected: 144_000,
                actual: 143_999,
            }
        );
        assert!(validate_tensor_bytes(256_000, QuantKind::Q4K, 144_000).is_ok());
    }

    #[test]
    fn test_oversized_element_count() {
        let huge = u64::MAX / 2;
        assert_eq!(checked_tensor_byte_size(huge, QuantKind::F32), None);
        assert_eq!(checked_tensor_byte_size(huge, QuantKind::Q4K), None);
        assert_eq!(checked_tensor_byte_size(huge, QuantKind::U8), Some(huge));
        assert_eq!(tensor_byte_size(huge, QuantKind::F16), u64::MAX);

        let err = validate_tensor_bytes(huge, QuantKind::F32, 4).unwrap_err();
        assert!(matches!(
            err,
            QuantError::LengthMismatch { expected: u64::MAX, actual: 4, .. }
        ));
    }
}
