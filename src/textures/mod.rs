//! Demand-loaded textures
//!
//! Based on sparse virtual texturing (Barrett, GDC 2008): a texture is a
//! sampler page plus a range of tile pages, each filled when a kernel first
//! samples it.
//!
//! - `source`: the decoder trait applications implement
//! - `handlers`: sampler and tile request handlers
//! - `loader`: `create_texture` / `unload_texture` on the loader

pub mod handlers;
pub mod loader;
pub mod source;

pub use handlers::{SamplerRequestHandler, TextureRequestHandler};
pub use loader::DemandTexture;
pub(crate) use loader::TextureRegistry;
pub use source::TextureSource;
