//! Loader configuration
//!
//! Options are plain data (serde-serializable so trace files can record the
//! configuration they were captured with). `validate()` rejects nonsensical
//! values, `configure()` normalizes the rest against the active device count.

use crate::error::PagingError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Demand loading options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Total number of logical pages in the virtual address space
    pub num_pages: u32,

    /// Number of backed pages (pages with an entry word); they come first
    pub num_page_table_entries: u32,

    /// Capacity of each device fault buffer, in pages
    pub max_requested_pages: u32,

    /// Maximum number of staged mappings uploaded per push
    pub max_filled_pages: u32,

    /// Budget of resident evictable pages per context (`None` = unlimited)
    pub max_resident_pages: Option<u32>,

    /// Upper bound on pages evicted by a single push
    pub max_evicted_per_push: u32,

    /// Device-context slots (concurrent launches) per accelerator context
    pub max_active_streams: u32,

    /// Fill worker threads (0 = available parallelism)
    pub max_threads: usize,

    /// Bound on concurrent fills per request handler (`None` = unbounded)
    pub max_concurrent_fills_per_handler: Option<usize>,

    /// Run LRU eviction and have kernels report touched resident pages
    pub eviction_active: bool,

    /// Record every dispatched request batch to this Parquet file
    pub trace_file: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            num_pages: 1 << 22,
            num_page_table_entries: 1 << 16,
            max_requested_pages: 8192,
            max_filled_pages: 16384,
            max_resident_pages: None,
            max_evicted_per_push: 1024,
            max_active_streams: 4,
            max_threads: 0,
            max_concurrent_fills_per_handler: None,
            eviction_active: true,
            trace_file: None,
        }
    }
}

impl Options {
    /// Check that the options describe a usable configuration
    ///
    /// # Errors
    ///
    /// Returns `PagingError::InvalidOptions` naming the first offending field
    pub fn validate(&self) -> Result<(), PagingError> {
        if self.num_pages == 0 {
            return Err(PagingError::InvalidOptions(
                "num_pages must be > 0".to_string(),
            ));
        }
        if self.num_page_table_entries > self.num_pages {
            return Err(PagingError::InvalidOptions(format!(
                "num_page_table_entries ({}) exceeds num_pages ({})",
                self.num_page_table_entries, self.num_pages
            )));
        }
        if self.max_requested_pages == 0 {
            return Err(PagingError::InvalidOptions(
                "max_requested_pages must be > 0".to_string(),
            ));
        }
        if self.max_active_streams == 0 {
            return Err(PagingError::InvalidOptions(
                "max_active_streams must be > 0".to_string(),
            ));
        }
        if self.max_concurrent_fills_per_handler == Some(0) {
            return Err(PagingError::InvalidOptions(
                "max_concurrent_fills_per_handler must be > 0 when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Normalize options for `device_count` active devices
    ///
    /// - a push must be able to absorb a full fault buffer, so
    ///   `max_filled_pages >= max_requested_pages`
    /// - at least one device-context slot per device
    /// - `max_threads == 0` resolves to the available parallelism
    #[must_use]
    pub fn configure(mut self, device_count: usize) -> Self {
        self.max_filled_pages = self.max_filled_pages.max(self.max_requested_pages);
        let devices = u32::try_from(device_count).unwrap_or(u32::MAX);
        self.max_active_streams = self.max_active_streams.max(devices);
        if self.max_threads == 0 {
            self.max_threads = std::thread::available_parallelism().map_or(4, usize::from);
        }
        self
    }

    /// Number of unbacked pages
    #[must_use]
    pub const fn num_unbacked_pages(&self) -> u32 {
        self.num_pages - self.num_page_table_entries
    }

    /// Parse options from JSON (missing fields take their defaults)
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse options JSON")
    }

    /// Serialize options to JSON
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize options")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        let options = Options::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.num_unbacked_pages(), (1 << 22) - (1 << 16));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let options = Options {
            num_page_table_entries: 10,
            num_pages: 5,
            ..Options::default()
        };
        assert!(matches!(
            options.validate(),
            Err(PagingError::InvalidOptions(_))
        ));

        let options = Options {
            max_concurrent_fills_per_handler: Some(0),
            ..Options::default()
        };
        assert!(options.validate().is_err());

        let options = Options {
            max_active_streams: 0,
            ..Options::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_configure_normalizes() {
        let options = Options {
            max_requested_pages: 63,
            max_filled_pages: 10,
            max_active_streams: 1,
            max_threads: 0,
            ..Options::default()
        }
        .configure(3);

        assert_eq!(options.max_filled_pages, 63);
        assert_eq!(options.max_active_streams, 3);
        assert!(options.max_threads > 0);
    }

    #[test]
    fn test_json_partial_fields_use_defaults() {
        let options = Options::from_json(r#"{"num_pages": 1025, "eviction_active": false}"#)
            .unwrap();
        assert_eq!(options.num_pages, 1025);
        assert!(!options.eviction_active);
        assert_eq!(options.max_requested_pages, 8192);

        let json = options.to_json().unwrap();
        assert_eq!(Options::from_json(&json).unwrap(), options);
    }
}
