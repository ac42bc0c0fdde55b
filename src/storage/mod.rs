//! Request trace storage
//!
//! Provides Parquet persistence for traces of requested pages.

pub mod trace;

pub use trace::{RequestTrace, TraceBatch, TraceRecorder};
