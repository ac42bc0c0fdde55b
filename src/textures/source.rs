//! Texture data sources

use crate::paging::Stream;
use std::fmt;

/// Decoder behind a demand-loaded texture
///
/// Tile pages are numbered `0..num_tiles()`. For a mipmapped texture tile 0
/// holds the mip tail (all levels smaller than one tile) and is loaded with
/// [`TextureSource::load_mip_tail`]; every other tile goes through
/// [`TextureSource::load_tile`].
///
/// Loaders return `Ok(Some(entry))` when the data is on the device,
/// `Ok(None)` to defer, and `Err` on failure. They run on worker threads,
/// concurrently for different tiles.
pub trait TextureSource: Send + Sync + fmt::Debug {
    /// Number of tile pages, mip tail included
    fn num_tiles(&self) -> u32;

    /// Whether tile 0 is a mip tail
    fn is_mipmapped(&self) -> bool {
        true
    }

    /// Build the device sampler descriptor
    ///
    /// # Errors
    ///
    /// Returns error if the texture header cannot be read
    fn create_sampler(&self, stream: &Stream) -> anyhow::Result<Option<u64>>;

    /// Load tile `tile` onto the device
    ///
    /// # Errors
    ///
    /// Returns error if the tile cannot be decoded or uploaded
    fn load_tile(&self, stream: &Stream, tile: u32) -> anyhow::Result<Option<u64>>;

    /// Load the mip tail onto the device
    ///
    /// # Errors
    ///
    /// Returns error if the mip tail cannot be decoded or uploaded
    fn load_mip_tail(&self, stream: &Stream) -> anyhow::Result<Option<u64>>;

    /// Free device memory of a tile that was evicted or invalidated
    fn release_tile(&self, _tile: u32, _entry: u64) {}
}
