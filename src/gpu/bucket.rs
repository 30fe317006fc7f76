//! Size bucketing for pooled buffers.
//!
//! Small requests round up to a power of two so that buffers of similar size
//! share a bucket. Large requests round up to a linear step instead, which
//! keeps the waste bounded by `large_buffer_step` rather than doubling.

use crate::config::BucketConfig;

/// Bucket size for a request of `requested` bytes.
pub fn bucket_size(requested: u64, config: &BucketConfig) -> u64 {
    let requested = requested.max(1);
    if requested < config.large_buffer_threshold {
        requested
            .checked_next_power_of_two()
            .unwrap_or(requested)
            .max(config.min_bucket_bytes)
    } else {
        let step = config.large_buffer_step.max(1);
        requested.div_ceil(step).saturating_mul(step)
    }
}
