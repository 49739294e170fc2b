//! NetCDF station files through libnetcdf.
//!
//! Only moves arrays between disk and `StationFile`; model conversion is in
//! `io::station`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use netcdf::AttributeValue;
use netcdf::types::{NcTypeDescriptor, NcVariableType};

use crate::error::{Error, Result};
use crate::io::parameter_file_name;
use crate::io::station::{
    FixedWidthText, StationFile, StationVariable, TIME_UNITS, decode_time, encode_time,
};
use crate::io::zipped::extract_netcdf;
use crate::model::{FlatTable, TimeSeriesSet};

/// Default file name template for `write_netcdf`.
pub const FILE_TEMPLATE: &str = "{parameter_id}.nc";

const TIME_CHUNK: usize = 1024;

/// One byte of an `NC_CHAR` text variable.
#[repr(transparent)]
#[derive(Debug, Clone, Copy)]
struct NcChar(u8);

unsafe impl NcTypeDescriptor for NcChar {
    fn type_descriptor() -> NcVariableType {
        NcVariableType::Char
    }
}

fn nc_err(e: netcdf::Error) -> Error {
    Error::NetCdf(e.to_string())
}

fn dimension_names(variable: &netcdf::Variable<'_>) -> Vec<String> {
    variable.dimensions().iter().map(|d| d.name()).collect()
}

fn text_attribute(variable: &netcdf::Variable<'_>, name: &str) -> Result<Option<String>> {
    match variable.attribute(name) {
        None => Ok(None),
        Some(attr) => match attr.value().map_err(nc_err)? {
            AttributeValue::Str(s) => Ok(Some(s)),
            other => Err(Error::format(format!(
                "attribute '{}' of '{}' is not text: {:?}",
                name,
                variable.name(),
                other
            ))),
        },
    }
}

fn numeric_attribute(variable: &netcdf::Variable<'_>, name: &str) -> Result<Option<f64>> {
    match variable.attribute(name) {
        None => Ok(None),
        Some(attr) => match attr.value().map_err(nc_err)? {
            AttributeValue::Double(v) => Ok(Some(v)),
            AttributeValue::Float(v) => Ok(Some(v as f64)),
            AttributeValue::Int(v) => Ok(Some(v as f64)),
            AttributeValue::Short(v) => Ok(Some(v as f64)),
            AttributeValue::Longlong(v) => Ok(Some(v as f64)),
            other => Err(Error::format(format!(
                "attribute '{}' of '{}' is not numeric: {:?}",
                name,
                variable.name(),
                other
            ))),
        },
    }
}

fn read_text(file: &netcdf::File, name: &str) -> Result<Option<FixedWidthText>> {
    let Some(variable) = file.variable(name) else {
        return Ok(None);
    };
    if !matches!(
        variable.vartype(),
        NcVariableType::Char | NcVariableType::Int(netcdf::types::IntType::U8)
    ) {
        return Err(Error::format(format!(
            "'{}' is not a character variable: {:?}",
            name,
            variable.vartype()
        )));
    }
    let width = variable
        .dimensions()
        .last()
        .map(|d| d.len())
        .ok_or_else(|| Error::format(format!("'{}' has no dimensions", name)))?;
    let bytes = variable.get_raw_values(..).map_err(nc_err)?;
    FixedWidthText::from_raw(bytes, width).map(Some)
}

fn read_coordinate(file: &netcdf::File, name: &str) -> Result<Option<Vec<f64>>> {
    match file.variable(name) {
        None => Ok(None),
        Some(variable) => variable.get_values::<f64, _>(..).map(Some).map_err(nc_err),
    }
}

/// Read a CF `timeSeries` station file.
pub fn read_station_file(path: &Path) -> Result<StationFile> {
    let file = netcdf::open(path).map_err(nc_err)?;

    let time_variable = file
        .variable("time")
        .ok_or_else(|| Error::format(format!("{} has no time variable", path.display())))?;
    let units = text_attribute(&time_variable, "units")?
        .ok_or_else(|| Error::format("time variable has no units"))?;
    let time = decode_time(
        &time_variable.get_values::<f64, _>(..).map_err(nc_err)?,
        &units,
    )?;

    let station_id = read_text(&file, "station_id")?
        .ok_or_else(|| Error::format(format!("{} has no station_id", path.display())))?;

    let z = match file.variable("z") {
        None => None,
        Some(variable) => {
            let fill = numeric_attribute(&variable, "_FillValue")?;
            let values = variable.get_values::<f64, _>(..).map_err(nc_err)?;
            Some(
                values
                    .into_iter()
                    .map(|v| (!v.is_nan() && Some(v) != fill).then_some(v))
                    .collect(),
            )
        }
    };

    let mut variables = Vec::new();
    for variable in file.variables() {
        if dimension_names(&variable) != ["time", "stations"] {
            continue;
        }
        variables.push(StationVariable {
            name: variable.name(),
            units: text_attribute(&variable, "units")?,
            fill_value: numeric_attribute(&variable, "_FillValue")?,
            data: variable.get_values::<f64, _>(..).map_err(nc_err)?,
        });
    }

    let station_file = StationFile {
        time,
        station_id,
        station_names: read_text(&file, "station_names")?,
        x: read_coordinate(&file, "x")?,
        y: read_coordinate(&file, "y")?,
        lat: read_coordinate(&file, "lat")?,
        lon: read_coordinate(&file, "lon")?,
        z,
        variables,
    };
    station_file.validate()?;
    Ok(station_file)
}

/// Read a NetCDF file into a time-series set (`time_zone = 0`, no version).
pub fn read_netcdf(path: &Path) -> Result<TimeSeriesSet> {
    Ok(read_station_file(path)?.to_time_series_set(None, None))
}

/// Read zipped NetCDF content. The extracted temporary file is removed
/// whether or not reading succeeds.
pub fn read_netcdf_from_content(content: &[u8]) -> Result<TimeSeriesSet> {
    let tmp = extract_netcdf(content)?;
    read_netcdf(tmp.path())
}

/// Global attributes added when the caller passes none.
pub fn default_global_attributes() -> BTreeMap<String, String> {
    BTreeMap::from([("source".to_string(), "fewspy".to_string())])
}

/// Write one station file.
pub fn write_station_file(
    station_file: &StationFile,
    path: &Path,
    global_attributes: &BTreeMap<String, String>,
) -> Result<()> {
    station_file.validate()?;
    let mut file = netcdf::create(path).map_err(nc_err)?;

    let n_time = station_file.time.len();
    let n_stations = station_file.n_stations();
    file.add_dimension("time", n_time).map_err(nc_err)?;
    file.add_dimension("stations", n_stations).map_err(nc_err)?;
    file.add_dimension("char_leng_id", station_file.station_id.width())
        .map_err(nc_err)?;

    {
        let mut time = file.add_variable::<f64>("time", &["time"]).map_err(nc_err)?;
        time.put_attribute("units", TIME_UNITS).map_err(nc_err)?;
        time.put_attribute("standard_name", "time").map_err(nc_err)?;
        if n_time > 0 {
            time.put_values(&encode_time(&station_file.time), ..)
                .map_err(nc_err)?;
        }
    }
    {
        let mut ids = file
            .add_variable::<NcChar>("station_id", &["stations", "char_leng_id"])
            .map_err(nc_err)?;
        ids.put_attribute("cf_role", "timeseries_id").map_err(nc_err)?;
        if n_stations > 0 {
            let chars: Vec<NcChar> = station_file
                .station_id
                .as_bytes()
                .iter()
                .copied()
                .map(NcChar)
                .collect();
            ids.put_values(&chars, ..).map_err(nc_err)?;
        }
    }

    for variable in &station_file.variables {
        let mut var = file
            .add_variable::<f64>(&variable.name, &["time", "stations"])
            .map_err(nc_err)?;
        if n_time > 0 && n_stations > 0 {
            var.set_chunking(&[n_time.min(TIME_CHUNK), n_stations])
                .map_err(nc_err)?;
        }
        var.set_compression(4, true).map_err(nc_err)?;
        var.set_fill_value(variable.fill_value.unwrap_or(f64::NAN))
            .map_err(nc_err)?;
        if let Some(units) = &variable.units {
            var.put_attribute("units", units.as_str()).map_err(nc_err)?;
        }
        if !variable.data.is_empty() {
            var.put_values(&variable.data, ..).map_err(nc_err)?;
        }
    }

    file.add_attribute("Conventions", "CF-1.6").map_err(nc_err)?;
    file.add_attribute("featureType", "timeSeries").map_err(nc_err)?;
    file.add_attribute(
        "history",
        format!("Created {}", Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ")),
    )
    .map_err(nc_err)?;
    if let [variable] = station_file.variables.as_slice() {
        file.add_attribute("parameter_id", variable.name.as_str())
            .map_err(nc_err)?;
    }
    for (key, value) in global_attributes {
        file.add_attribute(key, value.as_str()).map_err(nc_err)?;
    }
    Ok(())
}

/// Write one NetCDF file per parameter of `table` into `out_dir`.
///
/// `file_template` must contain `{parameter_id}`. Returns the written paths
/// in parameter order.
pub fn write_netcdf(
    table: &FlatTable,
    out_dir: &Path,
    global_attributes: &BTreeMap<String, String>,
    file_template: &str,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(out_dir).map_err(|e| Error::io(out_dir, e))?;
    let mut written = Vec::new();
    for parameter_id in table.parameter_ids() {
        let station_file = StationFile::from_flat_table(table, &parameter_id)?;
        let path = out_dir.join(parameter_file_name(file_template, &parameter_id));
        write_station_file(&station_file, &path, global_attributes)?;
        written.push(path);
    }
    Ok(written)
}
