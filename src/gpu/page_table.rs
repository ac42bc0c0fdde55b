//! GPU-resident page table
//!
//! Storage buffers bound at group 0 (see `shaders/paging.wgsl`):
//!
//! | binding | contents                         | access     |
//! |---------|----------------------------------|------------|
//! | 0       | residency bits, one per page     | read       |
//! | 1       | entry words `(lo, hi)` per backed page | read |
//! | 2       | per-slot request bits            | read_write |
//! | 3       | per-slot `count` + fault list    | read_write |
//!
//! A host mirror (`HostPageTable`) is kept in step so residency queries and
//! host-side lookups never touch the device.

use super::device::GpuDevice;
use crate::error::PagingError;
use crate::options::Options;
use crate::paging::{DevicePageTable, FaultBatch, HostPageTable, PageMapping};
use std::any::Any;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Kernel-side paging library (`map_or_request`, `page_is_resident`, ...)
pub const PAGING_WGSL: &str = include_str!("shaders/paging.wgsl");

const TOUCH_WGSL: &str = include_str!("shaders/touch_pages.wgsl");

/// Storage buffers a paging kernel binds
pub(crate) const PAGING_BINDINGS: u32 = 4;

const TOUCH_WORKGROUP: u32 = 64;

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct TouchParams {
    count: u32,
    report_resident: u32,
    _padding: [u32; 2],
}

#[derive(Debug)]
struct SlotBuffers {
    requested: wgpu::Buffer,
    requests: wgpu::Buffer,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn device_error(what: &str, err: impl std::fmt::Display) -> PagingError {
    PagingError::Device(format!("{what}: {err}"))
}

/// Page table of one context mirrored into wgpu storage buffers
#[derive(Debug)]
pub struct WgpuPageTable {
    host: HostPageTable,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    residency: wgpu::Buffer,
    entries: wgpu::Buffer,
    slots: Vec<SlotBuffers>,
    layout: wgpu::BindGroupLayout,
    touch_layout: wgpu::BindGroupLayout,
    touch_pipeline: wgpu::ComputePipeline,
    memory_bytes: u64,
}

impl WgpuPageTable {
    /// Allocate the table and `max_active_streams` fault buffers on `gpu`
    ///
    /// # Errors
    ///
    /// Returns `PagingError::Device` if a buffer exceeds the device's
    /// storage binding limit
    pub fn new(gpu: &GpuDevice, options: &Options) -> Result<Self, PagingError> {
        let residency_words = u64::from(options.num_pages.div_ceil(32).max(1));
        let residency_bytes = residency_words * 4;
        let entries_bytes = u64::from(options.num_page_table_entries.max(1)) * 8;
        let requests_bytes = (u64::from(options.max_requested_pages) + 1) * 4;

        let limit = u64::from(gpu.device().limits().max_storage_buffer_binding_size);
        let largest = residency_bytes.max(entries_bytes).max(requests_bytes);
        if largest > limit {
            return Err(PagingError::Device(format!(
                "page table buffer of {largest} bytes exceeds storage binding limit {limit}"
            )));
        }

        let table_usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST;
        let fault_usage = table_usage | wgpu::BufferUsages::COPY_SRC;
        let residency = gpu.create_buffer("Page Residency", residency_bytes, table_usage)?;
        let entries = gpu.create_buffer("Page Entries", entries_bytes, table_usage)?;
        let slots = (0..options.max_active_streams)
            .map(|_| -> Result<SlotBuffers, PagingError> {
                Ok(SlotBuffers {
                    requested: gpu.create_buffer("Page Requested", residency_bytes, fault_usage)?,
                    requests: gpu.create_buffer("Page Requests", requests_bytes, fault_usage)?,
                })
            })
            .collect::<Result<Vec<_>, PagingError>>()?;

        let layout = gpu
            .device()
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Page Table Bind Group Layout"),
                entries: &[
                    storage_entry(0, true),
                    storage_entry(1, true),
                    storage_entry(2, false),
                    storage_entry(3, false),
                ],
            });

        let touch_layout = gpu
            .device()
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Touch Pages Bind Group Layout"),
                entries: &[
                    // @binding(0): uniform params
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                    storage_entry(1, true),
                    storage_entry(2, false),
                ],
            });

        let source = format!("{PAGING_WGSL}\n{TOUCH_WGSL}");
        let module = gpu
            .device()
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Touch Pages Shader"),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        let pipeline_layout = gpu
            .device()
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Touch Pages Pipeline Layout"),
                bind_group_layouts: &[&layout, &touch_layout],
                push_constant_ranges: &[],
            });
        let touch_pipeline =
            gpu.device()
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some("Touch Pages Pipeline"),
                    layout: Some(&pipeline_layout),
                    module: &module,
                    entry_point: "touch",
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    cache: None,
                });

        let memory_bytes = residency_bytes
            + entries_bytes
            + u64::from(options.max_active_streams) * (residency_bytes + requests_bytes);

        Ok(Self {
            host: HostPageTable::new(options),
            device: Arc::clone(gpu.device()),
            queue: Arc::clone(gpu.queue()),
            residency,
            entries,
            slots,
            layout,
            touch_layout,
            touch_pipeline,
            memory_bytes,
        })
    }

    /// Host mirror of the table
    #[must_use]
    pub const fn host(&self) -> &HostPageTable {
        &self.host
    }

    /// Layout of group 0 for kernels built on [`PAGING_WGSL`]
    #[must_use]
    pub const fn bind_group_layout(&self) -> &wgpu::BindGroupLayout {
        &self.layout
    }

    fn slot_buffers(&self, slot: usize) -> Result<&SlotBuffers, PagingError> {
        self.slots
            .get(slot)
            .ok_or_else(|| PagingError::Device(format!("no fault buffer for slot {slot}")))
    }

    /// Group 0 bind group for a launch on `slot`
    ///
    /// # Errors
    ///
    /// Returns `PagingError::Device` if `slot` does not exist
    pub fn bind_group(&self, slot: usize) -> Result<wgpu::BindGroup, PagingError> {
        let buffers = self.slot_buffers(slot)?;
        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Page Table Bind Group"),
            layout: &self.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.residency.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: self.entries.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: buffers.requested.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: buffers.requests.as_entire_binding(),
                },
            ],
        }))
    }

    fn clear_slot(&self, buffers: &SlotBuffers) {
        let zeros = vec![0u8; usize::try_from(buffers.requested.size()).unwrap_or(0)];
        self.queue.write_buffer(&buffers.requested, 0, &zeros);
        self.queue
            .write_buffer(&buffers.requests, 0, bytemuck::bytes_of(&0u32));
    }

    fn read_back(&self, buffer: &wgpu::Buffer) -> Result<Vec<u32>, PagingError> {
        let size = buffer.size();
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Fault Staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        // Maintain::Wait runs the map callback before returning.
        self.device.poll(wgpu::Maintain::Wait);
        rx.try_recv()
            .map_err(|e| device_error("Failed to receive map result", e))?
            .map_err(|e| device_error("Buffer mapping failed", e))?;

        let data = slice.get_mapped_range();
        let words: Vec<u32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging.unmap();

        Ok(words)
    }

    /// Run the page-touching kernel: look up `pages` on `slot` like a launch
    ///
    /// Returns the entry of each resident page and `None` for faults.
    ///
    /// # Errors
    ///
    /// Returns `PagingError::Device` if `slot` does not exist or readback fails
    #[allow(clippy::cast_possible_truncation)]
    pub fn touch_pages(
        &self,
        slot: usize,
        pages: &[u32],
        report_resident: bool,
    ) -> Result<Vec<Option<u64>>, PagingError> {
        if pages.is_empty() {
            return Ok(Vec::new());
        }
        let table_group = self.bind_group(slot)?;
        let count = pages.len() as u32;

        let params = wgpu::util::DeviceExt::create_buffer_init(
            self.device.as_ref(),
            &wgpu::util::BufferInitDescriptor {
                label: Some("Touch Params"),
                contents: bytemuck::bytes_of(&TouchParams {
                    count,
                    report_resident: u32::from(report_resident),
                    _padding: [0; 2],
                }),
                usage: wgpu::BufferUsages::UNIFORM,
            },
        );
        let input = wgpu::util::DeviceExt::create_buffer_init(
            self.device.as_ref(),
            &wgpu::util::BufferInitDescriptor {
                label: Some("Touch Pages"),
                contents: bytemuck::cast_slice(pages),
                usage: wgpu::BufferUsages::STORAGE,
            },
        );
        let results = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Touch Results"),
            size: u64::from(count) * 16,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let touch_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Touch Pages Bind Group"),
            layout: &self.touch_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: input.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: results.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Touch Pages Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.touch_pipeline);
            pass.set_bind_group(0, &table_group, &[]);
            pass.set_bind_group(1, &touch_group, &[]);
            pass.dispatch_workgroups(count.div_ceil(TOUCH_WORKGROUP), 1, 1);
        }
        self.queue.submit(Some(encoder.finish()));

        let words = self.read_back(&results)?;
        Ok(words
            .chunks_exact(4)
            .map(|r| (r[0] != 0).then(|| u64::from(r[1]) | (u64::from(r[2]) << 32)))
            .collect())
    }
}

impl DevicePageTable for WgpuPageTable {
    #[allow(clippy::cast_possible_truncation)]
    fn apply(
        &self,
        slot: usize,
        mappings: &[PageMapping],
        unmaps: &[u32],
    ) -> Result<u64, PagingError> {
        let buffers = self.slot_buffers(slot)?;
        self.host.apply(slot, mappings, unmaps)?;

        let mut bytes = 0;
        let words: BTreeSet<u32> = mappings
            .iter()
            .map(|m| m.page)
            .chain(unmaps.iter().copied())
            .map(|page| page / 32)
            .filter(|&word| u64::from(word) * 4 < self.residency.size())
            .collect();
        for word in words {
            let value = self.host.residency_word(word as usize);
            self.queue
                .write_buffer(&self.residency, u64::from(word) * 4, bytemuck::bytes_of(&value));
            bytes += 4;
        }

        let backed = self.host.num_backed();
        let entry_updates = unmaps
            .iter()
            .map(|&page| (page, 0))
            .chain(mappings.iter().map(|m| (m.page, m.entry)));
        for (page, entry) in entry_updates.filter(|&(page, _)| page < backed) {
            let pair = [entry as u32, (entry >> 32) as u32];
            self.queue
                .write_buffer(&self.entries, u64::from(page) * 8, bytemuck::cast_slice(&pair));
            bytes += 8;
        }

        self.clear_slot(buffers);
        self.queue.submit(std::iter::empty());
        Ok(bytes)
    }

    fn take_requests(&self, slot: usize) -> Result<FaultBatch, PagingError> {
        let buffers = self.slot_buffers(slot)?;
        let mut batch = self.host.take_requests(slot)?;

        let words = self.read_back(&buffers.requests)?;
        let capacity = words.len().saturating_sub(1);
        let count = words.first().copied().unwrap_or(0);
        let recorded = (count as usize).min(capacity);
        batch
            .pages
            .extend_from_slice(words.get(1..=recorded).unwrap_or(&[]));
        batch.overflowed += count.saturating_sub(u32::try_from(capacity).unwrap_or(u32::MAX));
        batch.bytes_read_back = buffers.requests.size();

        self.clear_slot(buffers);
        self.queue.submit(std::iter::empty());
        Ok(batch)
    }

    fn map_or_request(&self, slot: usize, page: u32, request_if_resident: bool) -> Option<u64> {
        self.host.map_or_request(slot, page, request_if_resident)
    }

    fn memory_bytes(&self) -> u64 {
        self.memory_bytes
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::Accelerator;
    use serial_test::serial;

    fn options() -> Options {
        Options {
            num_pages: 256,
            num_page_table_entries: 64,
            max_requested_pages: 8,
            max_active_streams: 2,
            ..Options::default()
        }
    }

    #[tokio::test]
    #[serial]
    async fn test_touch_reports_entries_and_faults() {
        if !GpuDevice::is_gpu_available().await {
            eprintln!("⚠️  Skipping test_touch_reports_entries_and_faults: GPU not available");
            return;
        }

        let gpu = GpuDevice::new().await.unwrap();
        let table = WgpuPageTable::new(&gpu, &options()).unwrap();
        let entry = 0x1_0000_0002;
        table
            .apply(0, &[PageMapping { page: 3, entry }, PageMapping { page: 100, entry: 0 }], &[])
            .unwrap();

        let found = table.touch_pages(0, &[3, 5, 5, 100, 7], false).unwrap();
        assert_eq!(found, vec![Some(entry), None, None, Some(0), None]);

        let mut faults = table.take_requests(0).unwrap().pages;
        faults.sort_unstable();
        assert_eq!(faults, vec![5, 7]);
        assert!(table.take_requests(0).unwrap().pages.is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn test_fault_overflow_counted() {
        if !GpuDevice::is_gpu_available().await {
            eprintln!("⚠️  Skipping test_fault_overflow_counted: GPU not available");
            return;
        }

        let gpu = GpuDevice::new().await.unwrap();
        let table = WgpuPageTable::new(&gpu, &options()).unwrap();
        let pages: Vec<u32> = (10..20).collect();
        table.touch_pages(1, &pages, false).unwrap();

        let batch = table.take_requests(1).unwrap();
        assert_eq!(batch.pages.len(), 8);
        assert_eq!(batch.overflowed, 2);
    }

    #[tokio::test]
    #[serial]
    async fn test_unmap_clears_device_view() {
        if !GpuDevice::is_gpu_available().await {
            eprintln!("⚠️  Skipping test_unmap_clears_device_view: GPU not available");
            return;
        }

        let gpu = GpuDevice::new().await.unwrap();
        let table = gpu.create_page_table(crate::paging::ContextId(0), &options()).unwrap();
        let table = table.as_any().downcast_ref::<WgpuPageTable>().unwrap();
        table.apply(0, &[PageMapping { page: 9, entry: 42 }], &[]).unwrap();
        table.apply(0, &[], &[9]).unwrap();

        assert_eq!(table.touch_pages(0, &[9], false).unwrap(), vec![None]);
        assert!(!table.host().is_resident(9));
    }

    #[test]
    fn test_paging_library_declares_bindings() {
        for binding in 0..PAGING_BINDINGS {
            assert!(PAGING_WGSL.contains(&format!("@binding({binding})")));
        }
        assert!(PAGING_WGSL.contains("fn map_or_request"));
    }
}
