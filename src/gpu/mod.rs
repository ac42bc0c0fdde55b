//! GPU-resident page tables
//!
//! Based on research from:
//! - **Sparse virtual texturing** (Barrett, GDC 2008) - feedback-driven residency
//! - **GPU unified memory** (Zheng et al., HPCA 2016) - on-device fault buffers
//!
//! # Architecture
//!
//! - `device`: wgpu device initialization and the `Accelerator` impl
//! - `page_table`: storage-buffer page table, fault readback, WGSL library
//!
//! # Feature Flag
//!
//! This module is only available with the `gpu` feature flag:
//! ```bash
//! cargo build --features gpu
//! ```

mod device;
mod page_table;

pub use device::{GpuDevice, GpuDeviceError};
pub use page_table::{WgpuPageTable, PAGING_WGSL};
