//! fewspy: client and local cache for the Delft-FEWS PI-REST time series
//! web service.
//!
//! Time series arrive as PI JSON, PI XML, NetCDF or columnar parquet files
//! and are decoded into one model (`model::TimeSeriesSet`). Flattened tables
//! are cached per parameter in manifest-described generations that a live
//! `cache::TimeSeriesCache` serves and swaps under concurrent readers.

pub mod cache;
pub mod config;
pub mod conversions;
pub mod error;
pub mod ingest;
pub mod io;
pub mod logging;
pub mod model;

pub use error::{Error, Result};
pub use io::{DocumentFormat, Payload, decode};
pub use model::{Event, Events, FlatTable, Header, TimeSeries, TimeSeriesSet};
