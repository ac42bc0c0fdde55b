//! Accelerator devices, contexts and streams
//!
//! An accelerator exposes one or more contexts; each context owns its own
//! device-visible page table and fault buffers. Streams are the unit that
//! issues launches and fills.

use super::device_table::{DevicePageTable, HostPageTable};
use crate::error::PagingError;
use crate::options::Options;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identity of an accelerator context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(pub u64);

impl ContextId {
    /// Primary context of a device
    #[must_use]
    pub const fn primary(device: u32) -> Self {
        Self(device as u64)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "context {}", self.0)
    }
}

/// A compute stream on a device context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stream {
    /// Device index
    pub device: u32,

    /// Context the stream belongs to
    pub context: ContextId,

    /// Stream id (unique within the context)
    pub id: u32,
}

impl Stream {
    /// Stream `id` on the primary context of `device`
    #[must_use]
    pub const fn new(device: u32, id: u32) -> Self {
        Self {
            device,
            context: ContextId::primary(device),
            id,
        }
    }

    /// Stream `id` on an explicit context of `device`
    #[must_use]
    pub const fn with_context(device: u32, context: ContextId, id: u32) -> Self {
        Self {
            device,
            context,
            id,
        }
    }
}

/// Static description of an accelerator device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device index
    pub index: u32,

    /// Human readable name
    pub name: String,

    /// Whether the device can host a demand-paged table
    pub supports_paging: bool,
}

/// An accelerator that can host demand-paged page tables
pub trait Accelerator: Send + Sync + fmt::Debug {
    /// Device description (capability check happens on `supports_paging`)
    fn info(&self) -> DeviceInfo;

    /// Create the device-visible page table and fault buffers for `context`
    ///
    /// # Errors
    ///
    /// Returns `PagingError::Device` if device memory cannot be allocated
    fn create_page_table(
        &self,
        context: ContextId,
        options: &Options,
    ) -> Result<Arc<dyn DevicePageTable>, PagingError>;
}

/// Accelerator simulated in host memory
///
/// Kernels are modeled by calling `DeviceContext::map_or_request` from host
/// threads; table and fault buffers use atomics exactly like device memory
/// written by concurrent warps.
#[derive(Debug, Clone)]
pub struct HostAccelerator {
    index: u32,
    supports_paging: bool,
}

impl HostAccelerator {
    /// Paging-capable simulated device
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self {
            index,
            supports_paging: true,
        }
    }

    /// Simulated device lacking the paging capability
    #[must_use]
    pub const fn without_paging(index: u32) -> Self {
        Self {
            index,
            supports_paging: false,
        }
    }

    /// `count` paging-capable devices, indices `0..count`
    #[must_use]
    pub fn devices(count: u32) -> Vec<Arc<dyn Accelerator>> {
        (0..count)
            .map(|index| Arc::new(Self::new(index)) as Arc<dyn Accelerator>)
            .collect()
    }
}

impl Accelerator for HostAccelerator {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            index: self.index,
            name: format!("host-simulated device {}", self.index),
            supports_paging: self.supports_paging,
        }
    }

    fn create_page_table(
        &self,
        _context: ContextId,
        options: &Options,
    ) -> Result<Arc<dyn DevicePageTable>, PagingError> {
        Ok(Arc::new(HostPageTable::new(options)))
    }
}
