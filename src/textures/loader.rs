//! Texture creation and unloading on the demand page loader

use super::handlers::{SamplerRequestHandler, TextureRequestHandler};
use super::source::TextureSource;
use crate::error::{PageKind, PagingError};
use crate::loader::DemandPageLoader;
use crate::paging::{PageRange, RequestHandler};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

const SAMPLER_BLOCK: u32 = 64;

/// A texture whose sampler and tiles are paged in on demand
#[derive(Debug, Clone)]
pub struct DemandTexture {
    id: u32,
    tile_range: PageRange,
    source: Arc<dyn TextureSource>,
}

impl DemandTexture {
    /// Texture id, which is also its sampler page
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Tile pages (shared by all textures created from the same source)
    #[must_use]
    pub const fn tile_range(&self) -> PageRange {
        self.tile_range
    }

    /// Page of tile `tile`
    #[must_use]
    pub const fn tile_page(&self, tile: u32) -> u32 {
        self.tile_range.start + tile
    }

    /// Decoder behind the texture
    #[must_use]
    pub fn source(&self) -> &Arc<dyn TextureSource> {
        &self.source
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    samplers: Vec<Arc<SamplerRequestHandler>>,
    tiles: HashMap<usize, PageRange>,
    textures: BTreeMap<u32, DemandTexture>,
}

/// Textures created on a loader
#[derive(Debug, Default)]
pub(crate) struct TextureRegistry {
    state: Mutex<RegistryState>,
}

fn source_key(source: &Arc<dyn TextureSource>) -> usize {
    Arc::as_ptr(source).cast::<()>() as usize
}

impl DemandPageLoader {
    /// Create a texture paged in from `source`
    ///
    /// Reserves a sampler page and, unless a texture was already created from
    /// the same `source`, an unbacked range of tile pages. Textures sharing a
    /// source are variants of one image and share its tiles.
    ///
    /// # Errors
    ///
    /// Returns `PagingError::OutOfPages` if sampler or tile pages run out
    pub fn create_texture(
        &self,
        source: Arc<dyn TextureSource>,
    ) -> Result<DemandTexture, PagingError> {
        let key = source_key(&source);
        let mut registry = self.textures.state.lock();

        let tile_range = if let Some(&range) = registry.tiles.get(&key) {
            range
        } else {
            let handler = self.page_table.reserve_pages_with(
                PageKind::Unbacked,
                source.num_tiles(),
                |range| TextureRequestHandler::new(range, Arc::clone(&source)),
            )?;
            let range = handler.page_range();
            registry.tiles.insert(key, range);
            range
        };

        let assigned = registry
            .samplers
            .last()
            .and_then(|block| block.assign(Arc::clone(&source)));
        let id = if let Some(id) = assigned {
            id
        } else {
            let block_len = SAMPLER_BLOCK
                .min(self.page_table.available_backed_pages())
                .max(1);
            let block = self.page_table.reserve_pages_with(
                PageKind::Backed,
                block_len,
                SamplerRequestHandler::new,
            )?;
            let id = block
                .assign(Arc::clone(&source))
                .ok_or(PagingError::OutOfPages {
                    kind: PageKind::Backed,
                    requested: 1,
                    available: 0,
                })?;
            registry.samplers.push(block);
            id
        };

        let texture = DemandTexture {
            id,
            tile_range,
            source,
        };
        registry.textures.insert(id, texture.clone());
        self.counters.num_textures.fetch_add(1, Ordering::Relaxed);
        debug!(
            id,
            tiles_start = tile_range.start,
            tiles = tile_range.len(),
            "created texture"
        );
        Ok(texture)
    }

    /// Texture with sampler page `id`
    #[must_use]
    pub fn texture(&self, id: u32) -> Option<DemandTexture> {
        self.textures.state.lock().textures.get(&id).cloned()
    }

    /// Drop the resident tiles of texture `id` at the next push
    ///
    /// Returns false if no such texture exists.
    pub fn unload_texture_tiles(&self, id: u32) -> bool {
        let Some(range) = self.texture(id).map(|t| t.tile_range) else {
            return false;
        };
        self.invalidate_page_range(range.start, range.end, None);
        true
    }

    /// Remove texture `id` and drop its sampler
    ///
    /// Tiles are dropped too unless another variant still uses them.
    /// Returns false if no such texture exists.
    pub fn unload_texture(&self, id: u32) -> bool {
        let (texture, tiles_shared) = {
            let mut registry = self.textures.state.lock();
            let Some(texture) = registry.textures.remove(&id) else {
                return false;
            };
            if let Some(block) = registry
                .samplers
                .iter()
                .find(|block| block.page_range().contains(id))
            {
                block.clear(id);
            }
            let shared = registry
                .textures
                .values()
                .any(|other| other.tile_range == texture.tile_range);
            (texture, shared)
        };

        self.invalidate_page_range(id, id + 1, None);
        if !tiles_shared {
            let range = texture.tile_range;
            self.invalidate_page_range(range.start, range.end, None);
        }
        debug!(id, tiles_shared, "unloaded texture");
        true
    }
}
