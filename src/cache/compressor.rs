//! Conversion and compression for cold KV pages.
//!
//! Rows move between tiers as raw bytes in a page dtype. Demotion decodes
//! hot rows to f32, re-encodes them in the cold dtype (f32 → f16 is lossy and
//! happens once), and optionally splits the page into independently
//! zstd-compressed blocks so that a single token can be read back without
//! inflating the whole page.

use half::f16;
use thiserror::Error;

use crate::config::KvDtype;

#[derive(Error, Debug, Clone)]
pub enum CompressionError {
    #[error("Zstd compression failed: {0}")]
    Zstd(String),

    #[error("Row of {len} B is not a whole number of {dtype} elements")]
    Misaligned { len: usize, dtype: KvDtype },

    #[error("Block {index} out of range ({blocks} blocks)")]
    BlockOutOfRange { index: usize, blocks: usize },
}

/// Encode f32 values in `dtype`.
pub fn encode_values(values: &[f32], dtype: KvDtype) -> Vec<u8> {
    match dtype {
        KvDtype::F32 => bytemuck::cast_slice(values).to_vec(),
        KvDtype::F16 => {
            let halves: Vec<f16> = values.iter().map(|&v| f16::from_f32(v)).collect();
            bytemuck::cast_slice(&halves).to_vec()
        }
    }
}

/// Decode bytes stored in `dtype` to f32.
pub fn decode_values(bytes: &[u8], dtype: KvDtype) -> Result<Vec<f32>, CompressionError> {
    if bytes.len() % dtype.size() != 0 {
        return Err(CompressionError::Misaligned {
            len: bytes.len(),
            dtype,
        });
    }
    let values = match dtype {
        KvDtype::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        KvDtype::F16 => bytes
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
    };
    Ok(values)
}

/// Re-encode rows from one dtype to another.
pub fn convert(bytes: &[u8], from: KvDtype, to: KvDtype) -> Result<Vec<u8>, CompressionError> {
    if from == to {
        return Ok(bytes.to_vec());
    }
    Ok(encode_values(&decode_values(bytes, from)?, to))
}

/// A page stored as independently compressed blocks.
#[derive(Debug, Clone)]
pub struct CompressedPage {
    /// Uncompressed bytes per full block.
    block_bytes: usize,
    /// Uncompressed length of the whole page.
    raw_len: usize,
    blocks: Vec<Vec<u8>>,
}

impl CompressedPage {
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn raw_len(&self) -> usize {
        self.raw_len
    }

    /// Host bytes held by the compressed blocks.
    pub fn compressed_len(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }

    pub fn block_bytes(&self) -> usize {
        self.block_bytes
    }
}

/// zstd block compressor.
#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    level: i32,
}

impl Compressor {
    pub fn new(level: i32) -> Self {
        Self { level }
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    /// Split `raw` into blocks of `block_bytes` and compress each one.
    pub fn compress_page(
        &self,
        raw: &[u8],
        block_bytes: usize,
    ) -> Result<CompressedPage, CompressionError> {
        let block_bytes = block_bytes.max(1);
        let blocks = raw
            .chunks(block_bytes)
            .map(|chunk| self.zstd_compress(chunk))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CompressedPage {
            block_bytes,
            raw_len: raw.len(),
            blocks,
        })
    }

    /// Inflate one block.
    pub fn read_block(&self, page: &CompressedPage, index: usize) -> Result<Vec<u8>, CompressionError> {
        let block = page.blocks.get(index).ok_or(CompressionError::BlockOutOfRange {
            index,
            blocks: page.blocks.len(),
        })?;
        self.zstd_decompress(block)
    }

    /// Replace one block's contents.
    pub fn write_block(
        &self,
        page: &mut CompressedPage,
        index: usize,
        raw: &[u8],
    ) -> Result<(), CompressionError> {
        let blocks = page.blocks.len();
        let compressed = self.zstd_compress(raw)?;
        let slot = page
            .blocks
            .get_mut(index)
            .ok_or(CompressionError::BlockOutOfRange { index, blocks })?;
        *slot = compressed;
        Ok(())
    }

    /// Inflate the whole page.
    pub fn decompress_page(&self, page: &CompressedPage) -> Result<Vec<u8>, CompressionError> {
        let mut raw = Vec::with_capacity(page.raw_len);
        for block in &page.blocks {
            raw.extend_from_slice(&self.zstd_decompress(block)?);
        }
        Ok(raw)
    }

    fn zstd_compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        zstd::encode_all(data, self.level).map_err(|e| CompressionError::Zstd(e.to_string()))
    }

    fn zstd_decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        zstd::decode_all(data).map_err(|e| CompressionError::Zstd(e.to_string()))
    }
}
