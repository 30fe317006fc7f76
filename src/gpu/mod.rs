//! Device memory management.
//!
//! - [`device`]: device abstraction and the host-memory backend
//! - [`bucket`]: size-class rounding for pooled buffers
//! - [`pool`]: bucketed buffer pool with budget enforcement and reclamation

pub mod bucket;
pub mod device;
pub mod pool;

pub use bucket::bucket_size;
pub use device::{BufferUsage, DeviceError, DeviceMemory, GpuDevice, GpuDeviceInfo, HostDevice};
pub use pool::{
    BufferHandle, BufferId, BufferPool, BufferView, LabelStats, MemoryReclaimer, PoolError,
    PoolStats, PressureEvent, SharedPool,
};
