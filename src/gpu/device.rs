//! Device memory abstraction.
//!
//! The pool never talks to a graphics API directly. It creates buffers
//! through a [`GpuDevice`], which hands back opaque [`DeviceMemory`].
//! [`HostDevice`] backs buffers with host memory and can enforce a fixed
//! capacity, which is how device OOM is exercised in tests and in
//! `gpu-residency simulate`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Out of device memory on {device}: requested {requested} B, {available} B available")]
    OutOfMemory {
        device: String,
        requested: u64,
        available: u64,
    },

    #[error("Buffer of {size} B exceeds the device limit of {max} B")]
    TooLarge { size: u64, max: u64 },

    #[error("Access of {len} B at offset {offset} is outside a {size} B buffer")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("Buffer already returned to the pool")]
    Released,
}

/// Usage class of a buffer. Pooled buffers are only reused within a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferUsage {
    /// Read-only weights and general storage.
    Storage,
    /// Small constant blocks.
    Uniform,
    /// Attention K/V pages.
    KvCache,
    /// Host-visible copy targets.
    Staging,
}

impl fmt::Display for BufferUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferUsage::Storage => write!(f, "storage"),
            BufferUsage::Uniform => write!(f, "uniform"),
            BufferUsage::KvCache => write!(f, "kv_cache"),
            BufferUsage::Staging => write!(f, "staging"),
        }
    }
}

/// Information about a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuDeviceInfo {
    /// Device index.
    pub id: usize,

    /// Adapter name.
    pub name: String,

    /// Total device memory in bytes.
    pub total_memory: u64,

    /// Largest single buffer the adapter can create.
    pub max_buffer_size: u64,
}

/// A block of device memory.
pub trait DeviceMemory: Send + Sync + fmt::Debug {
    fn size(&self) -> u64;

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), DeviceError>;

    fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), DeviceError>;
}

/// Creates device buffers.
pub trait GpuDevice: Send + Sync {
    fn info(&self) -> &GpuDeviceInfo;

    fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
    ) -> Result<Box<dyn DeviceMemory>, DeviceError>;

    /// Bytes currently allocated on the device.
    fn allocated_bytes(&self) -> u64;
}

/// Host-memory backed device with a fixed capacity.
pub struct HostDevice {
    info: GpuDeviceInfo,
    allocated: Arc<AtomicU64>,
}

impl HostDevice {
    /// A device with `total_memory` bytes and no single-buffer limit below that.
    pub fn new(total_memory: u64) -> Self {
        Self::with_info(GpuDeviceInfo {
            id: 0,
            name: "host".to_string(),
            total_memory,
            max_buffer_size: total_memory,
        })
    }

    pub fn with_info(info: GpuDeviceInfo) -> Self {
        info!(
            device = %info.name,
            total_memory = info.total_memory,
            max_buffer_size = info.max_buffer_size,
            "Host device initialized"
        );
        Self {
            info,
            allocated: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl GpuDevice for HostDevice {
    fn info(&self) -> &GpuDeviceInfo {
        &self.info
    }

    fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
    ) -> Result<Box<dyn DeviceMemory>, DeviceError> {
        if size > self.info.max_buffer_size {
            return Err(DeviceError::TooLarge {
                size,
                max: self.info.max_buffer_size,
            });
        }

        let reserved = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current
                    .checked_add(size)
                    .filter(|&next| next <= self.info.total_memory)
            });
        if let Err(current) = reserved {
            return Err(DeviceError::OutOfMemory {
                device: self.info.name.clone(),
                requested: size,
                available: self.info.total_memory.saturating_sub(current),
            });
        }

        Ok(Box::new(HostMemory {
            data: vec![0u8; size as usize],
            usage,
            allocated: Arc::clone(&self.allocated),
        }))
    }

    fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }
}

struct HostMemory {
    data: Vec<u8>,
    usage: BufferUsage,
    allocated: Arc<AtomicU64>,
}

impl HostMemory {
    fn range(&self, offset: u64, len: usize) -> Result<std::ops::Range<usize>, DeviceError> {
        let size = self.data.len() as u64;
        let end = offset.checked_add(len as u64).filter(|&end| end <= size);
        match end {
            Some(end) => Ok(offset as usize..end as usize),
            None => Err(DeviceError::OutOfBounds {
                offset,
                len: len as u64,
                size,
            }),
        }
    }
}

impl fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMemory")
            .field("size", &self.data.len())
            .field("usage", &self.usage)
            .finish()
    }
}

impl DeviceMemory for HostMemory {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let range = self.range(offset, data.len())?;
        self.data[range].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), DeviceError> {
        let range = self.range(offset, out.len())?;
        out.copy_from_slice(&self.data[range]);
        Ok(())
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        self.allocated
            .fetch_sub(self.data.len() as u64, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_enforced() {
        let device = HostDevice::new(4096);
        let a = device.create_buffer(3000, BufferUsage::Storage).unwrap();
        assert_eq!(device.allocated_bytes(), 3000);

        let err = device.create_buffer(2000, BufferUsage::Storage).unwrap_err();
        assert!(matches!(err, DeviceError::OutOfMemory { available: 1096, .. }));

        drop(a);
        assert_eq!(device.allocated_bytes(), 0);
        device.create_buffer(2000, BufferUsage::Storage).unwrap();
    }

    #[test]
    fn test_max_buffer_size() {
        let device = HostDevice::with_info(GpuDeviceInfo {
            id: 0,
            name: "small".into(),
            total_memory: 1 << 20,
            max_buffer_size: 1024,
        });
        assert!(matches!(
            device.create_buffer(2048, BufferUsage::Storage),
            Err(DeviceError::TooLarge { size: 2048, max: 1024 })
        ));
    }

    #[test]
    fn test_read_write_bounds() {
        let device = HostDevice::new(1024);
        let mut mem = device.create_buffer(16, BufferUsage::Staging).unwrap();
        mem.write(4, &[1, 2, 3, 4]).unwrap();

        let mut out = [0u8; 6];
        mem.read(2, &mut out).unwrap();
        assert_eq!(out, [0, 0, 1, 2, 3, 4]);

        assert!(mem.write(14, &[0; 4]).is_err());
        assert!(mem.read(u64::MAX, &mut out).is_err());
    }
}
