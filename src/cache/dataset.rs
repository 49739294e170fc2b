//! Opening cached data files as station datasets.

use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::io::columnar;
use crate::io::station::StationFile;

/// Open one cache data file, dispatching on its extension.
///
/// `.parquet` files use the per-parameter parquet layout; `.nc` files need
/// the `netcdf` feature.
pub fn open_dataset(path: &Path) -> Result<Arc<StationFile>> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    let station_file = match extension {
        "parquet" => columnar::read_station_file(path)?,
        "nc" => open_netcdf(path)?,
        other => {
            return Err(Error::format(format!(
                "unsupported cache file extension '{}' for {}",
                other,
                path.display()
            )));
        }
    };
    Ok(Arc::new(station_file))
}

#[cfg(feature = "netcdf")]
fn open_netcdf(path: &Path) -> Result<StationFile> {
    crate::io::netcdf::read_station_file(path)
}

#[cfg(not(feature = "netcdf"))]
fn open_netcdf(path: &Path) -> Result<StationFile> {
    Err(Error::NetCdf(format!(
        "cannot open {} without the `netcdf` feature",
        path.display()
    )))
}

/// Key of a dataset in the live cache: `"<generation dir>/<file name>"`.
pub fn dataset_key(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    match path.parent().and_then(|p| p.file_name()) {
        Some(parent) => format!("{}/{}", parent.to_string_lossy(), file_name),
        None => file_name.into_owned(),
    }
}
