//! Demand page loader
//!
//! - `demand_page_loader`: host-facing push/pull facade, resources, replay
//! - `memory_manager`: per-context fault-buffer slots and transfer totals
//! - `statistics`: accumulated loader statistics

pub mod demand_page_loader;
pub mod memory_manager;
pub mod statistics;

pub use demand_page_loader::{DemandPageLoader, ResourceDesc};
pub use memory_manager::DeviceMemoryManager;
pub use statistics::{DeviceStatistics, Statistics};
