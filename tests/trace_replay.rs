//! Request trace recording and deterministic replay
//!
//! Records the fills of a live push/pull session to Parquet, then replays the
//! trace on a fresh loader and checks that it reaches the same residency.

#![cfg(feature = "storage")]

use std::time::Duration;
use tempfile::tempdir;
use trueno_pager::{DemandPageLoader, Options, RequestTrace, ResourceDesc, Stream};

fn options() -> Options {
    Options {
        num_pages: 1024,
        num_page_table_entries: 512,
        max_requested_pages: 64,
        max_threads: 2,
        ..Options::default()
    }
}

fn create_resources(loader: &DemandPageLoader) -> (u32, u32) {
    let meshes = loader
        .create_resource(ResourceDesc::new(32, |_stream, page| Ok(Some(u64::from(page)))))
        .unwrap();
    let atlas = loader
        .create_resource(
            ResourceDesc::new(16, |_stream, page| Ok(Some(u64::from(page) << 12))).evictable(false),
        )
        .unwrap();
    (meshes, atlas)
}

#[tokio::test]
async fn test_recorded_session_replays_to_same_residency() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("session.parquet");
    let stream = Stream::new(0, 2);

    let touched = {
        let loader = DemandPageLoader::with_host_devices(
            1,
            Options {
                trace_file: Some(path.clone()),
                ..options()
            },
        )
        .unwrap();
        let (meshes, atlas) = create_resources(&loader);
        let frames: [Vec<u32>; 2] = [
            (meshes..meshes + 8).collect(),
            vec![atlas, atlas + 3, meshes + 20],
        ];

        for (batch_id, pages) in (0u32..).zip(&frames) {
            let context = loader.push_mappings(stream).unwrap();
            for &page in pages {
                let _ = context.map_or_request(page);
            }
            let ticket = loader.pull_requests(stream, &context, batch_id).unwrap();
            drop(context);
            assert!(ticket.wait_timeout(Duration::from_secs(10)));
            // One row group per frame
            loader.flush_trace().unwrap();
        }
        frames.concat()
    };

    let trace = RequestTrace::read_parquet(&path).await.unwrap();
    assert_eq!(trace.batches().len(), 2);
    assert_eq!(trace.batches()[1].batch_id, 1);
    assert_eq!(trace.batches()[0].stream, stream);
    assert_eq!(trace.num_requests(), touched.len());
    assert_eq!(
        trace.options().map(|o| o.num_page_table_entries),
        Some(512)
    );

    // Replay against identically laid out resources
    let replayed = DemandPageLoader::with_host_devices(1, options()).unwrap();
    create_resources(&replayed);
    for ticket in replayed.replay_trace(&trace).unwrap() {
        assert!(ticket.wait_timeout(Duration::from_secs(10)));
    }
    for page in touched {
        assert!(replayed.is_resident(stream, page), "page {page}");
    }
    assert_eq!(replayed.statistics().pages_filled, trace.num_requests() as u64);
}

#[tokio::test]
async fn test_trace_written_on_drop() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dropped.parquet");
    {
        let loader = DemandPageLoader::with_host_devices(
            1,
            Options {
                trace_file: Some(path.clone()),
                ..options()
            },
        )
        .unwrap();
        let (meshes, _) = create_resources(&loader);
        let ticket = loader
            .replay_requests(Stream::new(0, 0), 9, &[meshes, meshes + 1])
            .unwrap();
        assert!(ticket.wait_timeout(Duration::from_secs(10)));
    }

    let trace = RequestTrace::read_parquet(&path).await.unwrap();
    assert_eq!(trace.batches().len(), 1);
    assert_eq!(trace.batches()[0].batch_id, 9);
}
