//! Manifest-backed on-disk cache and the live dataset manager.

pub mod build;
pub mod dataset;
pub mod manifest;
pub mod time_series_cache;

pub use build::{BuildOptions, DataFileFormat, build_generation};
pub use manifest::{Coverage, FileEntry, Manifest};
pub use time_series_cache::{CacheGeneration, TimeSeriesCache};
