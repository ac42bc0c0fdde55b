//! GPU device initialization and management
//!
//! Handles wgpu device creation, adapter selection, and the paging
//! capability check.

use super::page_table::{WgpuPageTable, PAGING_BINDINGS};
use crate::error::PagingError;
use crate::options::Options;
use crate::paging::{Accelerator, ContextId, DeviceInfo, DevicePageTable};
use std::sync::Arc;
use thiserror::Error;
use wgpu::util::DeviceExt;

/// GPU device initialization errors
#[derive(Debug, Error)]
pub enum GpuDeviceError {
    /// No compatible GPU adapter found
    #[error("No compatible GPU adapter found")]
    NoAdapter,

    /// Failed to request GPU device
    #[error("Failed to request GPU device: {0}")]
    DeviceRequest(String),

    /// GPU feature not supported
    #[error("GPU feature not supported: {0}")]
    UnsupportedFeature(String),
}

impl From<GpuDeviceError> for PagingError {
    fn from(err: GpuDeviceError) -> Self {
        Self::Device(err.to_string())
    }
}

/// GPU device hosting demand-paged page tables
///
/// # Example
///
/// ```ignore
/// # use trueno_pager::gpu::GpuDevice;
/// let device = GpuDevice::new().await?;
/// assert!(device.supports_paging());
/// ```
#[derive(Debug)]
pub struct GpuDevice {
    index: u32,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    adapter: wgpu::Adapter,
}

impl GpuDevice {
    /// Check if GPU is available without creating a device
    ///
    /// This is useful for tests to skip gracefully when GPU is not available.
    pub async fn is_gpu_available() -> bool {
        Self::new().await.is_ok()
    }

    /// Initialize GPU device with default settings
    ///
    /// # Errors
    ///
    /// Returns `GpuDeviceError` if:
    /// - No compatible GPU adapter found
    /// - Device request fails
    pub async fn new() -> Result<Self, GpuDeviceError> {
        Self::new_with_backend(wgpu::Backends::all()).await
    }

    /// Initialize GPU device with specific backend
    ///
    /// # Errors
    ///
    /// Returns `GpuDeviceError` if device initialization fails
    pub async fn new_with_backend(backends: wgpu::Backends) -> Result<Self, GpuDeviceError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(GpuDeviceError::NoAdapter)?;

        // Ask for the adapter's storage limits; page tables can be large.
        let limits = wgpu::Limits {
            max_storage_buffer_binding_size: adapter.limits().max_storage_buffer_binding_size,
            max_buffer_size: adapter.limits().max_buffer_size,
            ..wgpu::Limits::default()
        };

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("trueno-pager GPU device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits,
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(|e| GpuDeviceError::DeviceRequest(e.to_string()))?;

        Ok(Self {
            index: 0,
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter,
        })
    }

    /// Same device reported under accelerator index `index`
    #[must_use]
    pub const fn with_index(mut self, index: u32) -> Self {
        self.index = index;
        self
    }

    /// Whether kernels on this device can read page tables and write faults
    #[must_use]
    pub fn supports_paging(&self) -> bool {
        let compute = self
            .adapter
            .get_downlevel_capabilities()
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS);
        compute && self.device.limits().max_storage_buffers_per_shader_stage >= PAGING_BINDINGS
    }

    /// Get adapter info (GPU name, backend, etc.)
    #[must_use]
    pub fn adapter_info(&self) -> wgpu::AdapterInfo {
        self.adapter.get_info()
    }

    /// Create GPU buffer with initial data
    ///
    /// # Errors
    ///
    /// Returns error if buffer creation fails (typically won't happen with wgpu)
    pub fn create_buffer_init(
        &self,
        label: &str,
        contents: &[u8],
        usage: wgpu::BufferUsages,
    ) -> Result<wgpu::Buffer, GpuDeviceError> {
        Ok(self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage,
            }))
    }

    /// Create zero-initialized GPU buffer
    ///
    /// # Errors
    ///
    /// Returns error if buffer creation fails
    pub fn create_buffer(
        &self,
        label: &str,
        size: u64,
        usage: wgpu::BufferUsages,
    ) -> Result<wgpu::Buffer, GpuDeviceError> {
        Ok(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        }))
    }

    /// Get device reference
    #[must_use]
    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    /// Get queue reference
    #[must_use]
    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }
}

impl Accelerator for GpuDevice {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            index: self.index,
            name: self.adapter.get_info().name,
            supports_paging: self.supports_paging(),
        }
    }

    fn create_page_table(
        &self,
        _context: ContextId,
        options: &Options,
    ) -> Result<Arc<dyn DevicePageTable>, PagingError> {
        Ok(Arc::new(WgpuPageTable::new(self, options)?))
    }
}
