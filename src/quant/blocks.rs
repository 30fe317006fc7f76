//! Reference block encoders/decoders.
//!
//! Layouts follow the ggml block formats bit for bit. Encoding pads the last
//! block with zeros; decoding drops the padding again.

use bytemuck::{Pod, Zeroable};
use half::{bf16, f16};

use crate::quant::codec::{
    tensor_byte_size, validate_tensor_bytes, QuantError, QuantKind, K_SCALE_SIZE, QK4_0, QK8_0,
    QK_K,
};

/// 8-bit block: one f16 scale, 32 signed weights.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BlockQ8_0 {
    pub d: f16,
    pub qs: [i8; QK8_0],
}

/// 4-bit block: one f16 scale, 32 nibbles offset by 8.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BlockQ4_0 {
    pub d: f16,
    pub qs: [u8; QK4_0 / 2],
}

/// 4-bit K-quant super-block.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BlockQ4K {
    /// Super-block scale for the sub-block scales.
    pub d: f16,
    /// Super-block scale for the sub-block mins.
    pub dmin: f16,
    /// Eight 6-bit scales and eight 6-bit mins.
    pub scales: [u8; K_SCALE_SIZE],
    pub qs: [u8; QK_K / 2],
}

/// 6-bit K-quant super-block.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BlockQ6K {
    /// Low 4 bits.
    pub ql: [u8; QK_K / 2],
    /// High 2 bits.
    pub qh: [u8; QK_K / 4],
    /// Signed scales for the 16 sub-blocks of 16.
    pub scales: [i8; QK_K / 16],
    pub d: f16,
}

const _: () = assert!(std::mem::size_of::<BlockQ8_0>() == 34);
const _: () = assert!(std::mem::size_of::<BlockQ4_0>() == 18);
const _: () = assert!(std::mem::size_of::<BlockQ4K>() == 144);
const _: () = assert!(std::mem::size_of::<BlockQ6K>() == 210);

/// Decode `num_elements` values of `kind` from `bytes`.
///
/// `bytes` must have exactly the codec length for `num_elements`.
pub fn dequantize(kind: QuantKind, bytes: &[u8], num_elements: usize) -> Result<Vec<f32>, QuantError> {
    validate_tensor_bytes(num_elements as u64, kind, bytes.len() as u64)?;

    let mut out = Vec::with_capacity(num_elements.next_multiple_of(kind.block_elements()));
    match kind {
        QuantKind::F32 => out.extend(
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
        ),
        QuantKind::F16 => out.extend(
            bytes
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32()),
        ),
        QuantKind::BF16 => out.extend(
            bytes
                .chunks_exact(2)
                .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32()),
        ),
        QuantKind::I8 => out.extend(bytes.iter().map(|&b| b as i8 as f32)),
        QuantKind::U8 => out.extend(bytes.iter().map(|&b| b as f32)),
        QuantKind::Q8_0 => {
            for raw in bytes.chunks_exact(kind.block_bytes()) {
                dequantize_q8_0(&bytemuck::pod_read_unaligned(raw), &mut out);
            }
        }
        QuantKind::Q4_0 => {
            for raw in bytes.chunks_exact(kind.block_bytes()) {
                dequantize_q4_0(&bytemuck::pod_read_unaligned(raw), &mut out);
            }
        }
        QuantKind::Q4K => {
            for raw in bytes.chunks_exact(kind.block_bytes()) {
                dequantize_q4k(&bytemuck::pod_read_unaligned(raw), &mut out);
            }
        }
        QuantKind::Q6K => {
            for raw in bytes.chunks_exact(kind.block_bytes()) {
                dequantize_q6k(&bytemuck::pod_read_unaligned(raw), &mut out);
            }
        }
        QuantKind::Q5K => return Err(QuantError::Unsupported(kind)),
    }
    out.truncate(num_elements);
    Ok(out)
}

/// Encode `values` as `kind`.
pub fn quantize(kind: QuantKind, values: &[f32]) -> Result<Vec<u8>, QuantError> {
    let size = tensor_byte_size(values.len() as u64, kind) as usize;
    let mut out = Vec::with_capacity(size);

    match kind {
        QuantKind::F32 => values.iter().for_each(|v| out.extend_from_slice(&v.to_le_bytes())),
        QuantKind::F16 => values
            .iter()
            .for_each(|v| out.extend_from_slice(&f16::from_f32(*v).to_le_bytes())),
        QuantKind::BF16 => values
            .iter()
            .for_each(|v| out.extend_from_slice(&bf16::from_f32(*v).to_le_bytes())),
        QuantKind::I8 => out.extend(values.iter().map(|v| v.round().clamp(-128.0, 127.0) as i8 as u8)),
        QuantKind::U8 => out.extend(values.iter().map(|v| v.round().clamp(0.0, 255.0) as u8)),
        QuantKind::Q8_0 => {
            for chunk in padded_blocks::<QK8_0>(values) {
                out.extend_from_slice(bytemuck::bytes_of(&quantize_q8_0(&chunk)));
            }
        }
        QuantKind::Q4_0 => {
            for chunk in padded_blocks::<QK4_0>(values) {
                out.extend_from_slice(bytemuck::bytes_of(&quantize_q4_0(&chunk)));
            }
        }
        QuantKind::Q4K => {
            for chunk in padded_blocks::<QK_K>(values) {
                out.extend_from_slice(bytemuck::bytes_of(&quantize_q4k(&chunk)));
            }
        }
        QuantKind::Q6K => {
            for chunk in padded_blocks::<QK_K>(values) {
                out.extend_from_slice(bytemuck::bytes_of(&quantize_q6k(&chunk)));
            }
        }
        QuantKind::Q5K => return Err(QuantError::Unsupported(kind)),
    }

    debug_assert_eq!(out.len(), size);
    Ok(out)
}

/// Split `values` into fixed blocks, zero-filling the tail of the last one.
fn padded_blocks<const N: usize>(values: &[f32]) -> impl Iterator<Item = [f32; N]> + '_ {
    values.chunks(N).map(|chunk| {
        let mut block = [0.0f32; N];
        block[..chunk.len()].copy_from_slice(chunk);
        block
    })
}

fn abs_max(values: &[f32]) -> f32 {
    values.iter().fold(0.0f32, |acc, v| acc.max(v.abs()))
}

pub fn quantize_q8_0(x: &[f32; QK8_0]) -> BlockQ8_0 {
    let d = f16::from_f32(abs_max(x) / 127.0);
    let dv = d.to_f32();
    let mut qs = [0i8; QK8_0];
    if dv > 0.0 {
        for (q, v) in qs.iter_mut().zip(x) {
            *q = (v / dv).round().clamp(-127.0, 127.0) as i8;
        }
    }
    BlockQ8_0 { d, qs }
}

pub fn dequantize_q8_0(block: &BlockQ8_0, out: &mut Vec<f32>) {
    let d = block.d.to_f32();
    out.extend(block.qs.iter().map(|&q| q as f32 * d));
}

pub fn quantize_q4_0(x: &[f32; QK4_0]) -> BlockQ4_0 {
    // Signed value with the largest magnitude maps to -8.
    let max = x
        .iter()
        .copied()
        .fold(0.0f32, |acc, v| if v.abs() > acc.abs() { v } else { acc });
    let d = f16::from_f32(max / -8.0);
    let dv = d.to_f32();

    let mut levels = [8u8; QK4_0];
    if dv != 0.0 {
        for (l, v) in levels.iter_mut().zip(x) {
            *l = (v / dv + 8.0).round().clamp(0.0, 15.0) as u8;
        }
    }

    let mut qs = [0u8; QK4_0 / 2];
    for (j, q) in qs.iter_mut().enumerate() {
        *q = levels[j] | (levels[j + QK4_0 / 2] << 4);
    }
    BlockQ4_0 { d, qs }
}

pub fn dequantize_q4_0(block: &BlockQ4_0, out: &mut Vec<f32>) {
    let d = block.d.to_f32();
    out.extend(block.qs.iter().map(|&q| ((q & 0x0F) as i32 - 8) as f32 * d));
    out.extend(block.qs.iter().map(|&q| ((q >> 4) as i32 - 8) as f32 * d));
}

/// Unpack the 6-bit scale and min of sub-block `j`.
fn scale_min_k4(j: usize, q: &[u8; K_SCALE_SIZE]) -> (u8, u8) {
    if j < 4 {
        (q[j] & 63, q[j + 4] & 63)
    } else {
        (
            (q[j + 4] & 0x0F) | ((q[j - 4] >> 6) << 4),
            (q[j + 4] >> 4) | ((q[j] >> 6) << 4),
        )
    }
}

pub fn quantize_q4k(x: &[f32; QK_K]) -> BlockQ4K {
    let mut sub_scales = [0.0f32; 8];
    let mut sub_mins = [0.0f32; 8];
    for (j, sub) in x.chunks_exact(32).enumerate() {
        let lo = sub.iter().copied().fold(f32::INFINITY, f32::min).min(0.0);
        let hi = sub.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        sub_scales[j] = (hi - lo) / 15.0;
        sub_mins[j] = -lo;
    }

    let max_scale = sub_scales.iter().copied().fold(0.0f32, f32::max);
    let max_min = sub_mins.iter().copied().fold(0.0f32, f32::max);
    let inv_scale = if max_scale > 0.0 { 63.0 / max_scale } else { 0.0 };
    let inv_min = if max_min > 0.0 { 63.0 / max_min } else { 0.0 };

    let mut ls = [0u8; 8];
    let mut lm = [0u8; 8];
    for j in 0..8 {
        ls[j] = (inv_scale * sub_scales[j]).round().min(63.0) as u8;
        lm[j] = (inv_min * sub_mins[j]).round().min(63.0) as u8;
    }

    let mut scales = [0u8; K_SCALE_SIZE];
    for j in 0..8 {
        if j < 4 {
            scales[j] = ls[j];
            scales[j + 4] = lm[j];
        } else {
            scales[j + 4] = (ls[j] & 0x0F) | ((lm[j] & 0x0F) << 4);
            scales[j - 4] |= (ls[j] >> 4) << 6;
            scales[j] |= (lm[j] >> 4) << 6;
        }
    }

    let d = f16::from_f32(max_scale / 63.0);
    let dmin = f16::from_f32(max_min / 63.0);

    // Quantize against the stored (rounded) scales so decode matches exactly.
    let mut levels = [0u8; QK_K];
    for j in 0..8 {
        let (sc, m) = scale_min_k4(j, &scales);
        let scale = d.to_f32() * sc as f32;
        let min = dmin.to_f32() * m as f32;
        for i in 0..32 {
            let v = x[j * 32 + i];
            levels[j * 32 + i] = if scale > 0.0 {
                ((v + min) / scale).round().clamp(0.0, 15.0) as u8
            } else {
                0
            };
        }
    }

    let mut qs = [0u8; QK_K / 2];
    for chunk in 0..QK_K / 64 {
        let base = chunk * 64;
        for l in 0..32 {
            qs[chunk * 32 + l] = levels[base + l] | (levels[base + l + 32] << 4);
        }
    }

    BlockQ4K {
        d,
        dmin,
        scales,
        qs,
    }
}

pub fn dequantize_q4k(block: &BlockQ4K, out: &mut Vec<f32>) {
    let d = block.d.to_f32();
    let dmin = block.dmin.to_f32();
    for chunk in 0..QK_K / 64 {
        let (sc1, m1) = scale_min_k4(2 * chunk, &block.scales);
        let (sc2, m2) = scale_min_k4(2 * chunk + 1, &block.scales);
        let (d1, min1) = (d * sc1 as f32, dmin * m1 as f32);
        let (d2, min2) = (d * sc2 as f32, dmin * m2 as f32);
        let qs = &block.qs[chunk * 32..chunk * 32 + 32];
        out.extend(qs.iter().map(|&q| d1 * (q & 0x0F) as f32 - min1));
        out.extend(qs.iter().map(|&q| d2 * (q >> 4) as f32 - min2));
    }
}

pub fn quantize_q6k(x: &[f32; QK_K]) -> BlockQ6K {
    let mut sub_scales = [0.0f32; QK_K / 16];
    for (j, sub) in x.chunks_exact(16).enumerate() {
        sub_scales[j] = abs_max(sub) / 31.0;
    }
    let max_scale = sub_scales.iter().copied().fold(0.0f32, f32::max);
    let d = f16::from_f32(max_scale / 127.0);
    let dv = d.to_f32();

    let mut scales = [0i8; QK_K / 16];
    if dv > 0.0 {
        for (s, sub) in scales.iter_mut().zip(sub_scales) {
            *s = (sub / dv).round().min(127.0) as i8;
        }
    }

    let mut levels = [32u8; QK_K];
    for (e, v) in x.iter().enumerate() {
        let step = dv * scales[e / 16] as f32;
        if step > 0.0 {
            levels[e] = ((v / step).round().clamp(-32.0, 31.0) as i32 + 32) as u8;
        }
    }

    let mut ql = [0u8; QK_K / 2];
    let mut qh = [0u8; QK_K / 4];
    for n in 0..QK_K / 128 {
        let base = n * 128;
        for l in 0..32 {
            let q1 = levels[base + l];
            let q2 = levels[base + l + 32];
            let q3 = levels[base + l + 64];
            let q4 = levels[base + l + 96];
            ql[n * 64 + l] = (q1 & 0x0F) | ((q3 & 0x0F) << 4);
            ql[n * 64 + l + 32] = (q2 & 0x0F) | ((q4 & 0x0F) << 4);
            qh[n * 32 + l] = (q1 >> 4) | ((q2 >> 4) << 2) | ((q3 >> 4) << 4) | ((q4 >> 4) << 6);
        }
    }

    BlockQ6K { ql, qh, scales, d }
}

pub fn dequantize_q6k(block: &BlockQ6K, out: &mut Vec<f32>) {
    let d = block.d.to_f32();
    let mut y = [0.0f32; QK_K];
    for n in 0..QK_K / 128 {
        let base = n * 128;
        let sc = &block.scales[n * 8..n * 8 + 8];
        for l in 0..32 {
            let is = l / 16;
            let ql0 = block.ql[n * 64 + l];
            let ql32 = block.ql[n * 64 + l + 32];
            let qh = block.qh[n * 32 + l];
            let q1 = ((ql0 & 0x0F) | ((qh & 3) << 4)) as i32 - 32;
            let q2 = ((ql32 & 0x0F) | (((qh >> 2) & 3) << 4)) as i32 - 32;
            let q3 = ((ql0 >> 4) | (((qh >> 4) & 3) << 4)) as i32 - 32;
            let q4 = ((ql32 >> 4) | (((qh >> 6) & 3) << 4)) as i32 - 32;
            y[base + l] = d * sc[is] as f32 * q1 as f32;
            y[base + l + 32] = d * sc[is + 2] as f32 * q2 as f32;
            y[base + l + 64] = d * sc[is + 4] as f32 * q3 as f32;
            y[base + l + 96] = d * sc[is + 6] as f32 * q4 as f32;
        }
    }
    out.extend_from_slice(&y);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic values in [-1, 1).
    fn synthetic(n: usize, seed: u64) -> Vec<f32> {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        (0..n)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                ((state >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
            })
            .collect()
    }

    fn max_error(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
    }

    #[test]
    fn test_q8_0_roundtrip() {
        let values = synthetic(100, 1);
        let bytes = quantize(QuantKind::Q8_0, &values).unwrap();
        assert_eq!(bytes.len(), 4 * 34);
        let decoded = dequantize(QuantKind::Q8_0, &bytes, values.len()).unwrap();
        assert_eq!(decoded.len(), 100);
        assert!(max_error(&values, &decoded) < 0.01);
    }

    #[test]
    fn test_q4k_roundtrip() {
        let values = synthetic(512, 2);
        let bytes = quantize(QuantKind::Q4K, &values).unwrap();
        assert_eq!(bytes.len(), 288);
        let decoded = dequantize(QuantKind::Q4K, &bytes, values.len()).unwrap();
        assert!(max_error(&values, &decoded) < 0.15);
    }

    #[test]
    fn test_q6k_roundtrip() {
        let values = synthetic(300, 3);
        let bytes = quantize(QuantKind::Q6K, &values).unwrap();
        assert_eq!(bytes.len(), 420);
        let decoded = dequantize(QuantKind::Q6K, &bytes, values.len()).unwrap();
        assert!(max_error(&values, &decoded) < 0.05);
    }

    #[test]
    fn test_scale_min_packing() {
        let mut x = [0.0f32; QK_K];
        for (j, sub) in x.chunks_exact_mut(32).enumerate() {
            for (i, v) in sub.iter_mut().enumerate() {
                *v = (j as f32 + 1.0) * (i as f32 / 31.0) - j as f32 * 0.25;
            }
        }
        let block = quantize_q4k(&x);
        let mut out = Vec::new();
        dequantize_q4k(&block, &mut out);
        assert!(max_error(&x, &out) < 0.4);
        // Upper sub-blocks carry their high scale bits in the first 8 bytes.
        let (sc7, _) = scale_min_k4(7, &block.scales);
        assert_eq!(sc7, 63);
    }

    #[test]
    fn test_zero_block_decodes_to_zero() {
        let bytes = quantize(QuantKind::Q4K, &[0.0; 256]).unwrap();
        let decoded = dequantize(QuantKind::Q4K, &bytes, 256).unwrap();
        assert!(decoded.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_dequantize_rejects_wrong_length() {
        let err = dequantize(QuantKind::Q6K, &[0u8; 209], 256).unwrap_err();
        assert!(matches!(err, QuantError::LengthMismatch { expected: 210, .. }));
    }

    #[test]
    fn test_q5k_has_no_codec() {
        let err = quantize(QuantKind::Q5K, &[0.0; 256]).unwrap_err();
        assert_eq!(err, QuantError::Unsupported(QuantKind::Q5K));
    }
}
