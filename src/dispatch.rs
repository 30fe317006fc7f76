//! Kernel dispatch contract.
//!
//! Kernels receive borrowed [`BufferView`]s; whoever hands out the views keeps
//! the owning handles (and any cache pins) alive until the dispatch resolves.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::gpu::{BufferView, DeviceError};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Kernel '{op}' expects {expected} buffers, got {actual}")]
    BufferCount {
        op: String,
        expected: usize,
        actual: usize,
    },

    #[error("Kernel '{0}' is not supported by this dispatcher")]
    UnsupportedOp(String),

    #[error("Device error during dispatch: {0}")]
    Device(#[from] DeviceError),

    #[error("Kernel failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait KernelDispatcher: Send + Sync {
    /// Run `op` over `buffers` and resolve once the work has completed.
    async fn dispatch(&self, op: &str, buffers: &[BufferView<'_>]) -> Result<(), DispatchError>;
}

/// Record of one host-side dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRecord {
    pub op: String,
    pub buffers: usize,
    pub bytes: u64,
    /// Wrapping byte sum over every buffer, as a cheap stand-in for kernel output.
    pub checksum: u64,
}

/// Dispatcher that executes on the host by reading every buffer.
#[derive(Debug, Default)]
pub struct HostDispatcher {
    records: Mutex<Vec<DispatchRecord>>,
}

impl HostDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DispatchRecord> {
        self.records.lock().clone()
    }

    /// Dispatch count per op.
    pub fn op_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for record in self.records.lock().iter() {
            *counts.entry(record.op.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl KernelDispatcher for HostDispatcher {
    async fn dispatch(&self, op: &str, buffers: &[BufferView<'_>]) -> Result<(), DispatchError> {
        if buffers.is_empty() {
            return Err(DispatchError::BufferCount {
                op: op.to_string(),
                expected: 1,
                actual: 0,
            });
        }

        let mut bytes = 0;
        let mut checksum = 0u64;
        for view in buffers {
            let mut data = vec![0u8; view.size() as usize];
            view.read(0, &mut data)?;
            checksum = data
                .iter()
                .fold(checksum, |acc, &b| acc.wrapping_add(b as u64));
            bytes += view.size();
        }

        debug!(op, buffers = buffers.len(), bytes, "Host dispatch");
        self.records.lock().push(DispatchRecord {
            op: op.to_string(),
            buffers: buffers.len(),
            bytes,
            checksum,
        });
        Ok(())
    }
}
