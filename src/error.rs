//! Error types for the demand-paging engine
//!
//! Only capability and resource exhaustion problems surface as errors.
//! Fill failures and duplicate faults are absorbed and show up in ticket
//! bookkeeping instead, and requests for pages outside any allocated range
//! are contract violations (panics on the host side).

use std::fmt;
use thiserror::Error;

use crate::paging::ContextId;

/// Which half of the virtual address space a range lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageKind {
    /// Pages with a page-table entry word visible to kernels
    Backed,

    /// Pages with a residency bit only (kernels observe an entry of 0)
    Unbacked,
}

impl fmt::Display for PageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backed => f.write_str("backed"),
            Self::Unbacked => f.write_str("unbacked"),
        }
    }
}

/// Errors reported by the demand-paging engine
#[derive(Debug, Error)]
pub enum PagingError {
    /// No accelerator device supports demand paging
    #[error("No accelerator supports demand paging ({probed} device(s) probed)")]
    NoCapableDevice {
        /// Number of devices that were examined
        probed: usize,
    },

    /// Stream refers to a device that was excluded (or never registered)
    #[error("Device {0} is not active for demand paging")]
    InactiveDevice(u32),

    /// Options failed validation
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// Page address space exhausted
    #[error("Out of {kind} pages: requested {requested}, available {available}")]
    OutOfPages {
        /// Half of the address space that ran out
        kind: PageKind,

        /// Number of pages requested
        requested: u32,

        /// Number of pages still available
        available: u32,
    },

    /// Every device-context slot of a context is leased
    #[error("No free device context for {0}")]
    NoFreeDeviceContext(ContextId),

    /// A device context was pulled on a stream of another context
    #[error("Device context belongs to {found}, stream is on {expected}")]
    ContextMismatch {
        /// Context of the stream
        expected: ContextId,

        /// Context the device context was pushed on
        found: ContextId,
    },

    /// Stream names a context that was created on another device
    #[error("{context} belongs to device {owner}, stream is on device {device}")]
    ForeignContext {
        /// Context named by the stream
        context: ContextId,

        /// Device that created the context
        owner: u32,

        /// Device of the stream
        device: u32,
    },

    /// Device page table operation failed
    #[error("Device error: {0}")]
    Device(String),

    /// Worker pool could not be started
    #[error("Failed to start request workers: {0}")]
    Io(#[from] std::io::Error),
}
