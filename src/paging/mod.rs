//! Demand-paging engine
//!
//! Based on the demand-paging schemes of:
//! - **Sparse virtual texturing** (Barrett, GDC 2008) - page tables + feedback buffers
//! - **GPU unified memory** (Zheng et al., HPCA 2016) - fault batching and LRU eviction
//!
//! # Architecture
//!
//! - `page_table_manager`: page range allocation and page → handler lookup
//! - `request_handler`: per-range fill logic, guarded by `mutex_array`
//! - `paging_system`: residency authority, push/pull, eviction, invalidation
//! - `device_table`: device-visible page table and fault buffers
//! - `request_processor`: background fill workers, completion via `ticket`
//! - `per_context`: lazily created per-context state

pub mod device;
pub mod device_table;
pub mod mutex_array;
pub mod page_table_manager;
pub mod paging_system;
pub mod per_context;
pub(crate) mod request_processor;
pub mod request_handler;
pub mod ticket;

pub use device::{Accelerator, ContextId, DeviceInfo, HostAccelerator, Stream};
pub use device_table::{DeviceContext, DevicePageTable, FaultBatch, HostPageTable, PageMapping};
pub use mutex_array::MutexArray;
pub use page_table_manager::{PageRange, PageTableManager};
pub use paging_system::{
    InvalidationPredicate, InvalidationRange, PagingSystem, PullOutcome, PushOutcome, ReleasedPage,
};
pub use per_context::PerContextData;
pub use request_handler::{
    fill_page, release_page_if_absent, FillContext, ReleaseCallback, RequestHandler,
    ResourceCallback, ResourceRequestHandler,
};
pub use ticket::{FillOutcome, Ticket, TicketSummary};
