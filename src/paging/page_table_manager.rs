//! Page range allocation and page → handler lookup
//!
//! The address space `[0, num_pages)` is split into backed pages
//! `[0, num_page_table_entries)` and unbacked pages after them. Each half is
//! handed out by a bump allocator; ranges are never reused while the manager
//! lives. Lookup is a binary search over ranges sorted by start page.

use super::request_handler::RequestHandler;
use crate::error::{PageKind, PagingError};
use parking_lot::RwLock;
use std::sync::Arc;

/// Half-open range of logical pages `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PageRange {
    /// First page
    pub start: u32,

    /// One past the last page
    pub end: u32,
}

impl PageRange {
    /// Range `[start, start + len)`
    #[must_use]
    pub const fn new(start: u32, len: u32) -> Self {
        Self {
            start,
            end: start + len,
        }
    }

    /// Number of pages
    #[must_use]
    pub const fn len(&self) -> u32 {
        self.end - self.start
    }

    /// True for an empty range
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Whether `page` lies in the range
    #[must_use]
    pub const fn contains(&self, page: u32) -> bool {
        self.start <= page && page < self.end
    }

    /// Offset of `page` from the start of the range
    #[must_use]
    pub const fn offset(&self, page: u32) -> u32 {
        page - self.start
    }
}

#[derive(Debug)]
struct Mapping {
    range: PageRange,
    handler: Option<Arc<dyn RequestHandler>>,
}

#[derive(Debug)]
struct Ranges {
    next_backed: u32,
    next_unbacked: u32,
    mappings: Vec<Mapping>,
}

/// Allocator of page ranges and owner registry
#[derive(Debug)]
pub struct PageTableManager {
    num_pages: u32,
    num_backed: u32,
    ranges: RwLock<Ranges>,
}

impl PageTableManager {
    /// Manager over `num_pages` pages, the first `num_backed` of them backed
    #[must_use]
    pub fn new(num_pages: u32, num_backed: u32) -> Self {
        let num_backed = num_backed.min(num_pages);
        Self {
            num_pages,
            num_backed,
            ranges: RwLock::new(Ranges {
                next_backed: 0,
                next_unbacked: num_backed,
                mappings: Vec::new(),
            }),
        }
    }

    /// Reserve `num_pages` pages with no request handler
    ///
    /// Used for pages the host maps directly.
    ///
    /// # Errors
    ///
    /// Returns `PagingError::OutOfPages` if that half of the space is exhausted
    pub fn reserve_pages(&self, kind: PageKind, num_pages: u32) -> Result<PageRange, PagingError> {
        self.reserve(kind, num_pages, |_| None)
            .map(|(range, _)| range)
    }

    /// Reserve `num_pages` pages owned by the handler `make` builds for the range
    ///
    /// # Errors
    ///
    /// Returns `PagingError::OutOfPages` if that half of the space is exhausted
    pub fn reserve_pages_with<H, F>(
        &self,
        kind: PageKind,
        num_pages: u32,
        make: F,
    ) -> Result<Arc<H>, PagingError>
    where
        H: RequestHandler + 'static,
        F: FnOnce(PageRange) -> H,
    {
        let mut built = None;
        self.reserve(kind, num_pages, |range| {
            let handler = Arc::new(make(range));
            built = Some(Arc::clone(&handler));
            Some(handler as Arc<dyn RequestHandler>)
        })?;
        built.ok_or_else(|| PagingError::InvalidOptions("handler was not built".to_string()))
    }

    fn reserve<F>(
        &self,
        kind: PageKind,
        num_pages: u32,
        make: F,
    ) -> Result<(PageRange, Option<Arc<dyn RequestHandler>>), PagingError>
    where
        F: FnOnce(PageRange) -> Option<Arc<dyn RequestHandler>>,
    {
        let mut ranges = self.ranges.write();
        let (next, limit) = match kind {
            PageKind::Backed => (ranges.next_backed, self.num_backed),
            PageKind::Unbacked => (ranges.next_unbacked, self.num_pages),
        };
        let available = limit - next;
        if num_pages > available {
            return Err(PagingError::OutOfPages {
                kind,
                requested: num_pages,
                available,
            });
        }

        let range = PageRange::new(next, num_pages);
        match kind {
            PageKind::Backed => ranges.next_backed = range.end,
            PageKind::Unbacked => ranges.next_unbacked = range.end,
        }

        let handler = make(range);
        if !range.is_empty() {
            let at = ranges
                .mappings
                .partition_point(|m| m.range.start < range.start);
            ranges.mappings.insert(
                at,
                Mapping {
                    range,
                    handler: handler.clone(),
                },
            );
        }
        Ok((range, handler))
    }

    fn find(&self, page: u32) -> Option<(PageRange, Option<Arc<dyn RequestHandler>>)> {
        let ranges = self.ranges.read();
        let at = ranges.mappings.partition_point(|m| m.range.end <= page);
        ranges
            .mappings
            .get(at)
            .filter(|m| m.range.contains(page))
            .map(|m| (m.range, m.handler.clone()))
    }

    /// Handler owning `page`, if the page was allocated with one
    #[must_use]
    pub fn find_request_handler(&self, page: u32) -> Option<Arc<dyn RequestHandler>> {
        self.find(page).and_then(|(_, handler)| handler)
    }

    /// Handler owning `page`
    ///
    /// # Panics
    ///
    /// Panics if `page` was never allocated to a request handler. Asking for
    /// the owner of an unallocated page is a programming error.
    #[must_use]
    pub fn request_handler(&self, page: u32) -> Arc<dyn RequestHandler> {
        match self.find_request_handler(page) {
            Some(handler) => handler,
            None => panic!("page {page} is not owned by any request handler"),
        }
    }

    /// Range containing `page`, if allocated
    #[must_use]
    pub fn allocated_range(&self, page: u32) -> Option<PageRange> {
        self.find(page).map(|(range, _)| range)
    }

    /// Whether `page` belongs to any allocated range
    #[must_use]
    pub fn is_allocated(&self, page: u32) -> bool {
        self.find(page).is_some()
    }

    /// One past the highest allocated page
    #[must_use]
    pub fn end_page(&self) -> u32 {
        let ranges = self.ranges.read();
        if ranges.next_unbacked > self.num_backed {
            ranges.next_unbacked
        } else {
            ranges.next_backed
        }
    }

    /// Backed pages still available
    #[must_use]
    pub fn available_backed_pages(&self) -> u32 {
        self.num_backed - self.ranges.read().next_backed
    }

    /// Unbacked pages still available
    #[must_use]
    pub fn available_unbacked_pages(&self) -> u32 {
        self.num_pages - self.ranges.read().next_unbacked
    }

    /// Number of allocated (non-empty) ranges
    #[must_use]
    pub fn num_ranges(&self) -> usize {
        self.ranges.read().mappings.len()
    }

    /// Total pages in the address space
    #[must_use]
    pub const fn num_pages(&self) -> u32 {
        self.num_pages
    }

    /// Number of backed pages
    #[must_use]
    pub const fn num_backed_pages(&self) -> u32 {
        self.num_backed
    }
}
