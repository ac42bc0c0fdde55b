//! Parquet request traces for deterministic replay
//!
//! Based on `DuckDB` (Raasveldt et al., SIGMOD 2019) columnar storage patterns.
//!
//! # Format
//!
//! One row per requested page:
//! `(sequence, device, context, stream, batch_id, page)`. Rows of one
//! dispatched batch share a `sequence` number. The options the trace was
//! captured with are stored as JSON under the `trueno_pager.options`
//! key-value metadata entry. A recorded trace holds one row group per flush.

use crate::options::Options;
use crate::paging::{ContextId, Stream};
use anyhow::{Context, Result};
use arrow::array::{ArrayRef, UInt32Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const OPTIONS_KEY: &str = "trueno_pager.options";

/// Pages requested by one dispatched batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceBatch {
    /// Stream the batch was issued on
    pub stream: Stream,

    /// Caller-supplied batch id
    pub batch_id: u32,

    /// Requested pages, in dispatch order
    pub pages: Vec<u32>,
}

/// Ordered record of requested page batches
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestTrace {
    options: Option<Options>,
    batches: Vec<TraceBatch>,
}

impl RequestTrace {
    /// Empty trace captured under `options`
    #[must_use]
    pub fn new(options: Option<Options>) -> Self {
        Self {
            options,
            batches: Vec::new(),
        }
    }

    /// Append a batch (empty batches are not recorded)
    pub fn push(&mut self, batch: TraceBatch) {
        if !batch.pages.is_empty() {
            self.batches.push(batch);
        }
    }

    /// Recorded batches in order
    #[must_use]
    pub fn batches(&self) -> &[TraceBatch] {
        &self.batches
    }

    /// Options recorded with the trace
    #[must_use]
    pub const fn options(&self) -> Option<&Options> {
        self.options.as_ref()
    }

    /// Total number of page requests
    #[must_use]
    pub fn num_requests(&self) -> usize {
        self.batches.iter().map(|b| b.pages.len()).sum()
    }

    /// True if nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Write the trace to a Parquet file
    ///
    /// # Errors
    ///
    /// Returns error if file I/O fails or Arrow conversion fails
    #[allow(clippy::unused_async)] // Async API for future I/O operations
    pub async fn write_parquet<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.write_file(path.as_ref())
    }

    /// Read a trace from a Parquet file
    ///
    /// # Errors
    ///
    /// Returns error if the file doesn't exist or has an unexpected schema
    #[allow(clippy::unused_async)] // Async API for future I/O operations
    pub async fn read_parquet<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::read_file(path.as_ref())
    }

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("sequence", DataType::UInt32, false),
            Field::new("device", DataType::UInt32, false),
            Field::new("context", DataType::UInt64, false),
            Field::new("stream", DataType::UInt32, false),
            Field::new("batch_id", DataType::UInt32, false),
            Field::new("page", DataType::UInt32, false),
        ]))
    }

    pub(crate) fn write_file(&self, path: &Path) -> Result<()> {
        let mut writer = create_writer(path, self.options.as_ref())?;
        if !self.batches.is_empty() {
            writer.write(&record_batch(&self.batches, 0)?)?;
        }
        writer.close()?;
        Ok(())
    }

    fn read_file(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;

        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        let options = builder
            .metadata()
            .file_metadata()
            .key_value_metadata()
            .and_then(|kv| kv.iter().find(|entry| entry.key == OPTIONS_KEY))
            .and_then(|entry| entry.value.as_deref())
            .map(Options::from_json)
            .transpose()?;
        let reader = builder.build()?;

        let mut trace = Self::new(options);
        let mut current: Option<(u32, TraceBatch)> = None;

        for batch_result in reader {
            let batch: RecordBatch = batch_result?;
            let sequences = u32_column(&batch, 0, "sequence")?;
            let devices = u32_column(&batch, 1, "device")?;
            let contexts = batch
                .column(2)
                .as_any()
                .downcast_ref::<UInt64Array>()
                .context("Invalid context column type")?;
            let streams = u32_column(&batch, 3, "stream")?;
            let batch_ids = u32_column(&batch, 4, "batch_id")?;
            let pages = u32_column(&batch, 5, "page")?;

            for row in 0..batch.num_rows() {
                let sequence = sequences.value(row);
                let page = pages.value(row);
                let continues = matches!(&current, Some((seq, _)) if *seq == sequence);
                if continues {
                    if let Some((_, open)) = current.as_mut() {
                        open.pages.push(page);
                    }
                    continue;
                }
                if let Some((_, done)) = current.take() {
                    trace.push(done);
                }
                current = Some((
                    sequence,
                    TraceBatch {
                        stream: Stream::with_context(
                            devices.value(row),
                            ContextId(contexts.value(row)),
                            streams.value(row),
                        ),
                        batch_id: batch_ids.value(row),
                        pages: vec![page],
                    },
                ));
            }
        }
        if let Some((_, done)) = current {
            trace.push(done);
        }

        Ok(trace)
    }
}

fn u32_column<'a>(batch: &'a RecordBatch, index: usize, name: &str) -> Result<&'a UInt32Array> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<UInt32Array>()
        .with_context(|| format!("Invalid {name} column type"))
}

/// Rows for `batches`, numbering them from `first_sequence`
fn record_batch(batches: &[TraceBatch], first_sequence: u32) -> Result<RecordBatch> {
    let mut sequences = Vec::new();
    let mut devices = Vec::new();
    let mut contexts = Vec::new();
    let mut streams = Vec::new();
    let mut batch_ids = Vec::new();
    let mut pages = Vec::new();

    for (offset, batch) in batches.iter().enumerate() {
        let sequence = u32::try_from(offset)
            .ok()
            .and_then(|offset| first_sequence.checked_add(offset))
            .context("Trace has too many batches")?;
        for &page in &batch.pages {
            sequences.push(sequence);
            devices.push(batch.stream.device);
            contexts.push(batch.stream.context.0);
            streams.push(batch.stream.id);
            batch_ids.push(batch.batch_id);
            pages.push(page);
        }
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(UInt32Array::from(sequences)),
        Arc::new(UInt32Array::from(devices)),
        Arc::new(UInt64Array::from(contexts)),
        Arc::new(UInt32Array::from(streams)),
        Arc::new(UInt32Array::from(batch_ids)),
        Arc::new(UInt32Array::from(pages)),
    ];
    RecordBatch::try_new(RequestTrace::schema(), columns)
        .context("Failed to create trace RecordBatch")
}

fn create_writer(path: &Path, options: Option<&Options>) -> Result<ArrowWriter<File>> {
    let metadata = match options {
        Some(options) => Some(vec![KeyValue::new(
            OPTIONS_KEY.to_string(),
            options.to_json()?,
        )]),
        None => None,
    };

    let file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;

    let props = WriterProperties::builder()
        .set_compression(parquet::basic::Compression::ZSTD(
            parquet::basic::ZstdLevel::try_new(3)?,
        ))
        .set_key_value_metadata(metadata)
        .build();

    Ok(ArrowWriter::try_new(file, RequestTrace::schema(), Some(props))?)
}

#[derive(Default)]
struct RecorderState {
    pending: Vec<TraceBatch>,
    writer: Option<ArrowWriter<File>>,
    next_sequence: u32,
    batches_written: usize,
    requests_written: usize,
    closed: bool,
}

impl fmt::Debug for RecorderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecorderState")
            .field("pending", &self.pending.len())
            .field("open", &self.writer.is_some())
            .field("next_sequence", &self.next_sequence)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Streams dispatched batches to the configured trace file
///
/// Batches are buffered until `flush`, which appends them to the file as
/// one row group. `close` writes the footer; the file is readable from then
/// on. Memory held between flushes is bounded by what was recorded since the
/// last one.
#[derive(Debug)]
pub struct TraceRecorder {
    path: PathBuf,
    options: Options,
    state: Mutex<RecorderState>,
}

impl TraceRecorder {
    /// Recorder writing to `path`, tagging the trace with `options`
    #[must_use]
    pub fn new(path: PathBuf, options: &Options) -> Self {
        Self {
            path,
            options: options.clone(),
            state: Mutex::new(RecorderState::default()),
        }
    }

    /// Record one dispatched batch (empty batches are not recorded)
    pub fn record(&self, stream: Stream, batch_id: u32, pages: &[u32]) {
        let mut state = self.state.lock();
        if state.closed || pages.is_empty() {
            return;
        }
        state.pending.push(TraceBatch {
            stream,
            batch_id,
            pages: pages.to_vec(),
        });
    }

    /// Batches recorded since the last flush
    #[must_use]
    pub fn num_pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Append the batches recorded since the last flush to the file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created or written
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        self.flush_locked(&mut state)
    }

    /// Flush what is pending and finalize the file
    ///
    /// Later records and flushes are ignored.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        let flushed = self.flush_locked(&mut state);
        state.closed = true;
        flushed?;
        if let Some(writer) = state.writer.take() {
            writer.close()?;
        }
        info!(
            path = %self.path.display(),
            batches = state.batches_written,
            requests = state.requests_written,
            "closed request trace"
        );
        Ok(())
    }

    fn flush_locked(&self, state: &mut RecorderState) -> Result<()> {
        if state.writer.is_none() {
            state.writer = Some(create_writer(&self.path, Some(&self.options))?);
        }
        if state.pending.is_empty() {
            return Ok(());
        }

        let rows = record_batch(&state.pending, state.next_sequence)?;
        if let Some(writer) = state.writer.as_mut() {
            writer.write(&rows)?;
            writer.flush()?;
        }

        let batches = state.pending.len();
        let requests: usize = state.pending.iter().map(|b| b.pages.len()).sum();
        state.next_sequence = u32::try_from(batches)
            .ok()
            .and_then(|n| state.next_sequence.checked_add(n))
            .context("Trace has too many batches")?;
        state.batches_written += batches;
        state.requests_written += requests;
        state.pending.clear();
        debug!(
            path = %self.path.display(),
            batches,
            requests,
            "appended request trace row group"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_trace() -> RequestTrace {
        let mut trace = RequestTrace::new(Some(Options {
            num_pages: 1025,
            ..Options::default()
        }));
        trace.push(TraceBatch {
            stream: Stream::new(0, 1),
            batch_id: 0,
            pages: vec![100, 101],
        });
        trace.push(TraceBatch {
            stream: Stream::new(0, 1),
            batch_id: 0,
            pages: vec![],
        });
        trace.push(TraceBatch {
            stream: Stream::with_context(1, ContextId(9), 3),
            batch_id: 4,
            pages: vec![7],
        });
        trace
    }

    #[test]
    fn test_empty_batches_not_recorded() {
        let trace = sample_trace();
        assert_eq!(trace.batches().len(), 2);
        assert_eq!(trace.num_requests(), 3);
    }

    #[tokio::test]
    async fn test_trace_persists_batches_and_options() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("requests.parquet");
        let trace = sample_trace();

        trace.write_parquet(&path).await.unwrap();
        let loaded = RequestTrace::read_parquet(&path).await.unwrap();

        assert_eq!(loaded, trace);
        assert_eq!(loaded.options().map(|o| o.num_pages), Some(1025));
    }

    #[tokio::test]
    async fn test_adjacent_batches_with_same_stream_stay_separate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("split.parquet");
        let mut trace = RequestTrace::new(None);
        for pages in [vec![1, 2], vec![3]] {
            trace.push(TraceBatch {
                stream: Stream::new(0, 0),
                batch_id: 1,
                pages,
            });
        }

        trace.write_parquet(&path).await.unwrap();
        let loaded = RequestTrace::read_parquet(&path).await.unwrap();
        assert_eq!(loaded.batches().len(), 2);
        assert!(loaded.options().is_none());
    }

    #[test]
    fn test_recorder_writes_file_on_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recorded.parquet");
        let recorder = TraceRecorder::new(path.clone(), &Options::default());
        recorder.record(Stream::new(0, 0), 5, &[10, 11, 12]);
        recorder.close().unwrap();

        let loaded = RequestTrace::read_file(&path).unwrap();
        assert_eq!(loaded.batches()[0].pages, vec![10, 11, 12]);
        assert_eq!(loaded.batches()[0].batch_id, 5);
    }

    #[test]
    fn test_flush_drains_pending_batches() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("streamed.parquet");
        let recorder = TraceRecorder::new(path.clone(), &Options::default());

        recorder.record(Stream::new(0, 0), 1, &[1, 2]);
        recorder.record(Stream::new(0, 0), 1, &[]);
        assert_eq!(recorder.num_pending(), 1);
        recorder.flush().unwrap();
        assert_eq!(recorder.num_pending(), 0);

        // Same stream and batch id across the flush boundary stay separate
        recorder.record(Stream::new(0, 0), 1, &[3]);
        recorder.record(Stream::new(1, 2), 2, &[4, 5]);
        recorder.flush().unwrap();
        assert_eq!(recorder.num_pending(), 0);
        recorder.flush().unwrap();
        recorder.close().unwrap();

        // Ignored once closed
        recorder.record(Stream::new(0, 0), 3, &[6]);
        recorder.flush().unwrap();
        assert_eq!(recorder.num_pending(), 0);

        let loaded = RequestTrace::read_file(&path).unwrap();
        let pages: Vec<Vec<u32>> = loaded.batches().iter().map(|b| b.pages.clone()).collect();
        assert_eq!(pages, vec![vec![1, 2], vec![3], vec![4, 5]]);
        assert_eq!(loaded.batches()[2].stream, Stream::new(1, 2));
        assert_eq!(loaded.num_requests(), 5);
        assert!(loaded.options().is_some());

        let file = File::open(&path).unwrap();
        let builder = ParquetRecordBatchReaderBuilder::try_new(file).unwrap();
        assert_eq!(builder.metadata().num_row_groups(), 2);
    }

    #[test]
    fn test_close_without_records_writes_empty_trace() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.parquet");
        let recorder = TraceRecorder::new(
            path.clone(),
            &Options {
                num_pages: 2048,
                ..Options::default()
            },
        );
        recorder.close().unwrap();

        let loaded = RequestTrace::read_file(&path).unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.options().map(|o| o.num_pages), Some(2048));
    }

    #[test]
    fn test_read_missing_file_fails() {
        let result = tokio_test::block_on(RequestTrace::read_parquet("/nonexistent/trace.parquet"));
        assert!(result.is_err());
    }
}
