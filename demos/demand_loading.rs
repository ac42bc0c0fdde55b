//! Demonstration of demand loading across several launches
//!
//! A kernel stand-in touches pages of a mesh resource and a procedural
//! texture; faults are filled between launches and become visible at the
//! next push. Run with `RUST_LOG=trueno_pager=debug` to see the paging log.

use std::sync::Arc;
use std::time::Duration;
use trueno_pager::{DemandPageLoader, Options, ResourceDesc, Stream, TextureSource};
use tracing_subscriber::EnvFilter;

/// Gradient texture with three tiles plus a mip tail
#[derive(Debug)]
struct Gradient;

impl TextureSource for Gradient {
    fn num_tiles(&self) -> u32 {
        4
    }

    fn create_sampler(&self, _stream: &Stream) -> anyhow::Result<Option<u64>> {
        Ok(Some(0x5a))
    }

    fn load_tile(&self, _stream: &Stream, tile: u32) -> anyhow::Result<Option<u64>> {
        Ok(Some(0x1000 * u64::from(tile)))
    }

    fn load_mip_tail(&self, _stream: &Stream) -> anyhow::Result<Option<u64>> {
        Ok(Some(0xf000))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("🚀 Demand Loading Demo\n");

    let loader = DemandPageLoader::with_host_devices(
        2,
        Options {
            num_pages: 1 << 12,
            num_page_table_entries: 1 << 10,
            max_resident_pages: Some(24),
            ..Options::default()
        },
    )?;
    println!("✅ Loader ready on {} device(s)", loader.devices().len());

    // Mesh pages: entry word is the page's offset in a fake heap
    let meshes = loader.create_resource(ResourceDesc::new(64, |_stream, page| {
        Ok(Some(u64::from(page) * 4096))
    }))?;
    let texture = loader.create_texture(Arc::new(Gradient))?;
    println!("   Mesh pages: [{meshes}, {})", meshes + 64);
    println!("   Texture sampler page: {}", texture.id());
    println!("   Texture tiles: {:?}", texture.tile_range());

    for frame in 0u32..4 {
        let start = meshes + frame * 16;
        let mut touched: Vec<u32> = (start..start + 16).collect();
        touched.push(texture.id());
        touched.extend((0..4).map(|tile| texture.tile_page(tile)));

        for device in 0..2 {
            let stream = Stream::new(device, 0);
            let context = loader.push_mappings(stream)?;
            let hits = touched
                .iter()
                .filter(|&&page| context.map_or_request(page).is_some())
                .count();
            let ticket = loader.pull_requests(stream, &context, frame)?;
            drop(context);
            if !ticket.wait_timeout(Duration::from_secs(10)) {
                return Err("fill did not complete".into());
            }
            let summary = ticket.summary();
            println!(
                "🏃 frame {frame} device {device}: {hits} hits, {} filled, {} already resident",
                summary.filled, summary.already_resident
            );
        }
    }

    println!("\n📊 Statistics:");
    println!("{}", serde_json::to_string_pretty(&loader.statistics())?);

    Ok(())
}
