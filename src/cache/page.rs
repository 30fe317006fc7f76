//! KV page types and page geometry.
//!
//! A paged sequence stores each layer's K/V rows in hot pages of
//! `page_size` tokens. Once tiering is on, everything older than the hot
//! window is converted, one cold page (`cold_page_size` tokens) at a time,
//! into the cold tier. A sequence only ever moves tokens hot → cold, so a
//! single `cold_upto` watermark describes which tier holds a position.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::config::KvDtype;

/// Sequences with a `max_seq_len` above this use the paged layout.
pub const PAGED_LAYOUT_SEQ_LEN_THRESHOLD: usize = 8192;

pub type SequenceId = u64;

/// Storage tier of a KV page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Device buffer in the hot dtype.
    Hot,
    /// Converted to the cold dtype, on device or compressed on host.
    Cold,
}

impl Tier {
    /// Numeric tier level (lower = faster).
    pub fn level(&self) -> u8 {
        match self {
            Tier::Hot => 0,
            Tier::Cold => 1,
        }
    }

    /// Next slower tier, or `None` if already coldest. There is no promotion.
    pub fn demote(&self) -> Option<Tier> {
        match self {
            Tier::Hot => Some(Tier::Cold),
            Tier::Cold => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Hot => write!(f, "hot"),
            Tier::Cold => write!(f, "cold"),
        }
    }
}

/// Physical layout of a sequence, fixed when the sequence starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvLayout {
    /// One buffer per layer sized for `max_seq_len` tokens.
    Contiguous,
    /// Pages of `page_size` tokens allocated on demand.
    Paged,
}

/// Where a position's K/V rows currently live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageInfo {
    pub sequence_id: SequenceId,
    pub layer: usize,

    /// Tokens covered by the page holding the position.
    pub tokens: Range<usize>,

    pub dtype: KvDtype,
    pub tier: Tier,

    /// Stored as zstd blocks in host memory.
    pub compressed: bool,
}

/// Page arithmetic for one cache configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGeometry {
    pub page_size: usize,
    pub cold_page_size: usize,
    pub hot_window: usize,
}

impl PageGeometry {
    pub fn hot_page_index(&self, position: usize) -> usize {
        position / self.page_size
    }

    pub fn hot_page_range(&self, index: usize) -> Range<usize> {
        let start = index * self.page_size;
        start..start + self.page_size
    }

    pub fn cold_page_index(&self, position: usize) -> usize {
        position / self.cold_page_size
    }

    pub fn cold_page_range(&self, index: usize) -> Range<usize> {
        let start = index * self.cold_page_size;
        start..start + self.cold_page_size
    }

    /// Hot page indices that make up one cold page.
    pub fn hot_pages_in_cold(&self, cold_index: usize) -> Range<usize> {
        let per_cold = self.cold_page_size / self.page_size;
        cold_index * per_cold..(cold_index + 1) * per_cold
    }

    /// Tokens that must stay hot after `len` tokens have been written.
    pub fn hot_window(&self, len: usize) -> Range<usize> {
        len.saturating_sub(self.hot_window)..len
    }

    /// Everything below the returned position may be cold: the start of the
    /// hot window rounded down to a cold page boundary.
    pub fn demote_boundary(&self, len: usize) -> usize {
        let window_start = self.hot_window(len).start;
        window_start - window_start % self.cold_page_size
    }

    /// Cold page indices to convert, given that tokens below `cold_upto`
    /// already are cold.
    pub fn demotable_cold_pages(&self, len: usize, cold_upto: usize) -> Range<usize> {
        let first = cold_upto / self.cold_page_size;
        let end = self.demote_boundary(len) / self.cold_page_size;
        first..end.max(first)
    }
}
