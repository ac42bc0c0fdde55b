//! trueno-pager: demand-paged virtual memory for accelerator resources
//!
//! # Overview
//!
//! trueno-pager gives device kernels a flat virtual address space of pages.
//! Kernels look pages up in a device-visible page table and record faults
//! for absent ones; the host reads faults back after each launch, fills the
//! pages on a worker pool through per-resource callbacks, and makes the new
//! mappings visible at the next launch.
//!
//! # Quick Start
//!
//! ```no_run
//! use trueno_pager::{DemandPageLoader, Options, ResourceDesc, Stream};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let loader = DemandPageLoader::with_host_devices(1, Options::default())?;
//!
//! // Two pages whose entry word is computed on first access
//! let start = loader.create_resource(ResourceDesc::new(2, |_stream, page| {
//!     Ok(Some(u64::from(page) * 4096))
//! }))?;
//!
//! let stream = Stream::new(0, 0);
//! let context = loader.push_mappings(stream)?;
//! assert_eq!(context.map_or_request(start), None); // fault
//!
//! let ticket = loader.pull_requests(stream, &context, 0)?;
//! drop(context);
//! ticket.wait();
//!
//! // Visible to kernels after the next push
//! let context = loader.push_mappings(stream)?;
//! assert_eq!(context.map_or_request(start), Some(u64::from(start) * 4096));
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - **Paging**: page ranges, request handlers, residency, push/pull
//! - **Loader**: per-context orchestration, statistics, replay
//! - **Textures**: sampler and tile pages filled by a `TextureSource`
//! - **Storage**: Parquet request traces (feature `storage`)
//! - **GPU**: wgpu storage-buffer page tables (feature `gpu`)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod loader;
pub mod options;
pub mod paging;
pub mod textures;

#[cfg(feature = "storage")]
pub mod storage;

// GPU page tables (optional)
#[cfg(feature = "gpu")]
pub mod gpu;

// Re-export core types
pub use error::{PageKind, PagingError};
pub use loader::{DemandPageLoader, DeviceStatistics, ResourceDesc, Statistics};
pub use options::Options;
pub use paging::{
    Accelerator, ContextId, DeviceContext, DeviceInfo, FillOutcome, HostAccelerator,
    InvalidationPredicate, PageRange, Stream, Ticket, TicketSummary,
};
pub use textures::{DemandTexture, TextureSource};

#[cfg(feature = "storage")]
pub use storage::{RequestTrace, TraceBatch};

#[cfg(feature = "gpu")]
pub use gpu::{GpuDevice, WgpuPageTable, PAGING_WGSL};

// Error type
pub use anyhow::{Error, Result};
