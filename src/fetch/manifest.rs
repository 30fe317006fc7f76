//! Declared shard layout as produced by the manifest parser.

use serde::{Deserialize, Serialize};

use crate::quant::{checked_tensor_byte_size, tensor_byte_size, QuantKind};

/// One tensor inside a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpan {
    pub name: String,

    /// Byte offset from the start of the shard.
    pub offset: u64,

    pub num_elements: u64,

    pub kind: QuantKind,
}

impl TensorSpan {
    /// Codec byte length of this tensor.
    pub fn byte_len(&self) -> u64 {
        tensor_byte_size(self.num_elements, self.kind)
    }

    /// End offset, or `None` when the declared size overflows.
    pub fn checked_end(&self) -> Option<u64> {
        checked_tensor_byte_size(self.num_elements, self.kind)?.checked_add(self.offset)
    }

    /// Byte range inside the shard. The end saturates on overflow.
    pub fn byte_range(&self) -> std::ops::Range<u64> {
        self.offset..self.offset.saturating_add(self.byte_len())
    }
}

/// Metadata for one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMeta {
    pub index: u32,

    /// Tensors in offset order.
    pub tensors: Vec<TensorSpan>,

    /// Declared total size, if the manifest carries one.
    #[serde(default)]
    pub size_bytes: Option<u64>,

    /// Lowercase hex SHA-256 of the shard bytes.
    #[serde(default)]
    pub hash: Option<String>,
}

impl ShardMeta {
    /// A shard holding a single tensor at offset 0.
    pub fn single(index: u32, name: impl Into<String>, num_elements: u64, kind: QuantKind) -> Self {
        Self {
            index,
            tensors: vec![TensorSpan {
                name: name.into(),
                offset: 0,
                num_elements,
                kind,
            }],
            size_bytes: None,
            hash: None,
        }
    }

    /// Byte length implied by the tensor spans.
    pub fn expected_len(&self) -> u64 {
        self.checked_len().unwrap_or(u64::MAX)
    }

    /// Like [`expected_len`](Self::expected_len), `None` if any span overflows.
    pub fn checked_len(&self) -> Option<u64> {
        self.tensors
            .iter()
            .try_fold(0, |len: u64, t| t.checked_end().map(|end| len.max(end)))
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorSpan> {
        self.tensors.iter().find(|t| t.name == name)
    }

    /// Spans that overlap or leave a gap, as `(previous, next)` names.
    pub fn layout_gaps(&self) -> Option<(String, String)> {
        let mut cursor = 0;
        let mut previous = String::from("<start>");
        for span in &self.tensors {
            if span.offset != cursor {
                return Some((previous, span.name.clone()));
            }
            cursor = span.byte_range().end;
            previous = span.name.clone();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_len_from_spans() {
        let meta = ShardMeta::single(0, "w", 256_000, QuantKind::Q4K);
        assert_eq!(meta.expected_len(), 144_000);
    }

    #[test]
    fn test_layout_gaps() {
        let mut meta = ShardMeta::single(0, "a", 256, QuantKind::Q4K);
        meta.tensors.push(TensorSpan {
            name: "b".into(),
            offset: 144,
            num_elements: 32,
            kind: QuantKind::Q8_0,
        });
        assert!(meta.layout_gaps().is_none());
        assert_eq!(meta.expected_len(), 178);

        meta.tensors[1].offset = 150;
        assert_eq!(meta.layout_gaps(), Some(("a".into(), "b".into())));
    }

    #[test]
    fn test_overflowing_span() {
        let mut meta = ShardMeta::single(0, "w", u64::MAX / 2, QuantKind::F32);
        assert_eq!(meta.checked_len(), None);
        assert_eq!(meta.expected_len(), u64::MAX);
        assert_eq!(meta.tensors[0].byte_range().end, u64::MAX);

        meta.tensors[0] = TensorSpan {
            name: "w".into(),
            offset: u64::MAX - 2,
            num_elements: 4,
            kind: QuantKind::U8,
        };
        assert_eq!(meta.tensors[0].checked_end(), None);
        assert_eq!(meta.checked_len(), None);
    }
}
