//! Request handlers for texture samplers and tiles

use super::source::TextureSource;
use crate::paging::{
    fill_page, release_page_if_absent, FillContext, FillOutcome, MutexArray, PageRange,
    RequestHandler,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::error;

/// Block of backed sampler pages, one per texture
///
/// Sampler pages are never evicted.
#[derive(Debug)]
pub struct SamplerRequestHandler {
    range: PageRange,
    mutexes: MutexArray,
    sources: RwLock<Vec<Option<Arc<dyn TextureSource>>>>,
}

impl SamplerRequestHandler {
    pub(crate) fn new(range: PageRange) -> Self {
        Self {
            range,
            mutexes: MutexArray::new(range.len() as usize),
            sources: RwLock::new(Vec::with_capacity(range.len() as usize)),
        }
    }

    /// Bind the next free sampler page to `source`
    pub(crate) fn assign(&self, source: Arc<dyn TextureSource>) -> Option<u32> {
        let mut sources = self.sources.write();
        let offset = u32::try_from(sources.len()).ok()?;
        if offset >= self.range.len() {
            return None;
        }
        sources.push(Some(source));
        Some(self.range.start + offset)
    }

    /// Unbind the sampler page of an unloaded texture
    pub(crate) fn clear(&self, page: u32) {
        if let Some(slot) = self.sources.write().get_mut(self.range.offset(page) as usize) {
            *slot = None;
        }
    }

    fn source(&self, page: u32) -> Option<Arc<dyn TextureSource>> {
        self.sources
            .read()
            .get(self.range.offset(page) as usize)
            .cloned()
            .flatten()
    }
}

impl RequestHandler for SamplerRequestHandler {
    fn page_range(&self) -> PageRange {
        self.range
    }

    fn fill_request(&self, ctx: &FillContext<'_>, page: u32) -> FillOutcome {
        let Some(source) = self.source(page) else {
            error!(page, "sampler page is not bound to a texture");
            return FillOutcome::Failed;
        };
        fill_page(&self.mutexes, self.range, ctx, page, false, || {
            source.create_sampler(&ctx.stream)
        })
    }
}

/// Unbacked, evictable tile pages of one texture source
#[derive(Debug)]
pub struct TextureRequestHandler {
    range: PageRange,
    mutexes: MutexArray,
    source: Arc<dyn TextureSource>,
}

impl TextureRequestHandler {
    pub(crate) fn new(range: PageRange, source: Arc<dyn TextureSource>) -> Self {
        Self {
            range,
            mutexes: MutexArray::new(range.len() as usize),
            source,
        }
    }
}

impl RequestHandler for TextureRequestHandler {
    fn page_range(&self) -> PageRange {
        self.range
    }

    fn fill_request(&self, ctx: &FillContext<'_>, page: u32) -> FillOutcome {
        let tile = self.range.offset(page);
        fill_page(&self.mutexes, self.range, ctx, page, true, || {
            if tile == 0 && self.source.is_mipmapped() {
                self.source.load_mip_tail(&ctx.stream)
            } else {
                self.source.load_tile(&ctx.stream, tile)
            }
        })
    }

    fn release_page(&self, ctx: &FillContext<'_>, page: u32, entry: u64) {
        release_page_if_absent(&self.mutexes, self.range, ctx, page, || {
            self.source.release_tile(self.range.offset(page), entry);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use crate::paging::{ContextId, HostPageTable, PagingSystem, Stream};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Default)]
    struct Checkerboard {
        tails: AtomicU32,
        tiles: AtomicU32,
    }

    impl TextureSource for Checkerboard {
        fn num_tiles(&self) -> u32 {
            4
        }

        fn create_sampler(&self, _stream: &Stream) -> anyhow::Result<Option<u64>> {
            Ok(Some(0xabc))
        }

        fn load_tile(&self, _stream: &Stream, tile: u32) -> anyhow::Result<Option<u64>> {
            self.tiles.fetch_add(1, Ordering::SeqCst);
            Ok(Some(u64::from(tile)))
        }

        fn load_mip_tail(&self, _stream: &Stream) -> anyhow::Result<Option<u64>> {
            self.tails.fetch_add(1, Ordering::SeqCst);
            Ok(Some(1000))
        }
    }

    fn paging() -> PagingSystem {
        let options = Options {
            num_pages: 64,
            num_page_table_entries: 16,
            ..Options::default()
        };
        PagingSystem::new(
            ContextId(0),
            Arc::new(HostPageTable::new(&options)),
            &options,
        )
    }

    #[test]
    fn test_tile_zero_is_mip_tail() {
        let source = Arc::new(Checkerboard::default());
        let handler = TextureRequestHandler::new(PageRange::new(20, 4), source.clone());
        let paging = paging();
        let ctx = FillContext {
            stream: Stream::new(0, 0),
            paging: &paging,
        };

        assert_eq!(handler.fill_request(&ctx, 20), FillOutcome::Filled);
        assert_eq!(handler.fill_request(&ctx, 22), FillOutcome::Filled);
        assert_eq!(paging.entry(20), Some(1000));
        assert_eq!(paging.entry(22), Some(2));
        assert_eq!(source.tails.load(Ordering::SeqCst), 1);
        assert_eq!(source.tiles.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sampler_slots_fill_and_clear() {
        let handler = SamplerRequestHandler::new(PageRange::new(0, 2));
        let source: Arc<dyn TextureSource> = Arc::new(Checkerboard::default());
        assert_eq!(handler.assign(Arc::clone(&source)), Some(0));
        assert_eq!(handler.assign(Arc::clone(&source)), Some(1));
        assert_eq!(handler.assign(source), None);

        let paging = paging();
        let ctx = FillContext {
            stream: Stream::new(0, 0),
            paging: &paging,
        };
        assert_eq!(handler.fill_request(&ctx, 1), FillOutcome::Filled);
        assert_eq!(paging.entry(1), Some(0xabc));

        handler.clear(0);
        assert_eq!(handler.fill_request(&ctx, 0), FillOutcome::Failed);
    }
}
