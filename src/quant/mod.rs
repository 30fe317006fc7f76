//! Block quantization formats.
//!
//! - [`codec`]: kinds, block sizes and the tensor byte-size contract
//! - [`blocks`]: `#[repr(C)]` block layouts with reference encode/decode

pub mod blocks;
pub mod codec;

pub use blocks::{dequantize, quantize};
pub use codec::{
    align_up, block_byte_size, block_count, checked_tensor_byte_size, pad_to_block_boundary,
    tensor_byte_size, validate_tensor_bytes, QuantError, QuantKind, K_SCALE_SIZE, QK_K,
};
