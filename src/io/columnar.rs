//! Parquet data + header file pair.
//!
//! The data file `D/{S}{E}` has a `datetime` column plus one nullable
//! `Float64` column per `(location_id, parameter_id)`, named by the JSON
//! array `["<location_id>","<parameter_id>"]`. The header companion
//! `D/{S}_header{E}` has one row per series with the time step flattened into
//! `time_step.unit` / `time_step.multiplier`. Set-level `version` and
//! `time_zone` travel as key/value metadata of the header file.
//!
//! Per-parameter files used by the cache have the data-file layout only.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, Float64Array, ListArray, ListBuilder, StringArray, StringBuilder,
    TimestampMillisecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, NaiveDateTime};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;

use crate::error::{Error, Result};
use crate::io::parameter_file_name;
use crate::io::station::StationFile;
use crate::model::{
    ColumnKey, Event, Events, FlatTable, Header, TimeSeries, TimeSeriesSet, TimeStep,
    TimeStepUnit, to_flat_table,
};

/// Default file name template for `write_parameter_files`.
pub const FILE_TEMPLATE: &str = "{parameter_id}.parquet";

const DATETIME_COLUMN: &str = "datetime";
const VERSION_KEY: &str = "fewspy.version";
const TIME_ZONE_KEY: &str = "fewspy.time_zone";

/// `data/series.parquet` -> `data/series_header.parquet`
pub fn header_file(data_file: &Path) -> PathBuf {
    let stem = data_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match data_file.extension() {
        Some(ext) => format!("{}_header.{}", stem, ext.to_string_lossy()),
        None => format!("{}_header", stem),
    };
    data_file.with_file_name(name)
}

fn column_name(key: &ColumnKey) -> Result<String> {
    Ok(serde_json::to_string(&[&key.location_id, &key.parameter_id])?)
}

fn column_key(name: &str) -> Result<ColumnKey> {
    let [location_id, parameter_id]: [String; 2] = serde_json::from_str(name)
        .map_err(|e| Error::format(format!("column '{}' is not a series key: {}", name, e)))?;
    Ok(ColumnKey {
        location_id,
        parameter_id,
    })
}

fn to_millis(datetime: &NaiveDateTime) -> i64 {
    datetime.and_utc().timestamp_millis()
}

fn from_millis(millis: i64) -> Result<NaiveDateTime> {
    DateTime::from_timestamp_millis(millis)
        .map(|d| d.naive_utc())
        .ok_or_else(|| Error::parse(format!("timestamp {} ms out of range", millis)))
}

fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Millisecond, None)
}

// ---------------------------------------------------------------------------
// Parquet plumbing
// ---------------------------------------------------------------------------

fn writer_properties(metadata: Vec<KeyValue>) -> WriterProperties {
    let created_by = KeyValue {
        key: "created_by".to_string(),
        value: Some(format!("fewspy {}", env!("CARGO_PKG_VERSION"))),
    };
    let mut key_values = vec![created_by];
    key_values.extend(metadata);
    WriterProperties::builder()
        .set_key_value_metadata(Some(key_values))
        .build()
}

fn write_batch(path: &Path, batch: &RecordBatch, metadata: Vec<KeyValue>) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(writer_properties(metadata)))
        .map_err(|e| Error::Parquet(format!("parquet writer init failed: {e}")))?;
    writer
        .write(batch)
        .map_err(|e| Error::Parquet(format!("parquet write failed: {e}")))?;
    writer
        .close()
        .map_err(|e| Error::Parquet(format!("parquet close failed: {e}")))?;
    Ok(())
}

/// Every batch of a parquet file plus its key/value metadata.
fn read_batches(path: &Path) -> Result<(Vec<RecordBatch>, Vec<KeyValue>)> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| Error::Parquet(format!("parquet reader init failed: {e}")))?;
    let metadata = builder
        .metadata()
        .file_metadata()
        .key_value_metadata()
        .cloned()
        .unwrap_or_default();
    let reader = builder
        .build()
        .map_err(|e| Error::Parquet(format!("parquet reader build failed: {e}")))?;

    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.map_err(|e| Error::Parquet(format!("parquet read batch failed: {e}")))?);
    }
    Ok((batches, metadata))
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|e| Error::format(format!("missing column '{name}': {e}")))?;
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| Error::format(format!("column '{name}' has unexpected type")))
}

fn optional_column<'a, T: Array + 'static>(
    batch: &'a RecordBatch,
    name: &str,
) -> Result<Option<&'a T>> {
    if batch.schema().index_of(name).is_err() {
        return Ok(None);
    }
    column(batch, name).map(Some)
}

fn string_at(col: Option<&StringArray>, row: usize) -> Option<String> {
    col.filter(|c| !c.is_null(row))
        .map(|c| c.value(row).to_string())
}

fn f64_at(col: Option<&Float64Array>, row: usize) -> Option<f64> {
    col.filter(|c| !c.is_null(row)).map(|c| c.value(row))
}

fn timestamp_at(
    col: Option<&TimestampMillisecondArray>,
    row: usize,
) -> Result<Option<NaiveDateTime>> {
    col.filter(|c| !c.is_null(row))
        .map(|c| from_millis(c.value(row)))
        .transpose()
}

// ---------------------------------------------------------------------------
// Data file
// ---------------------------------------------------------------------------

/// Write a flat table in the data-file layout.
pub fn write_table(table: &FlatTable, path: &Path) -> Result<()> {
    let mut fields = vec![Field::new(DATETIME_COLUMN, timestamp_type(), false)];
    let mut arrays: Vec<ArrayRef> = vec![Arc::new(TimestampMillisecondArray::from(
        table.index.iter().map(to_millis).collect::<Vec<_>>(),
    ))];
    for (key, values) in table.columns.iter().zip(&table.values) {
        fields.push(Field::new(column_name(key)?, DataType::Float64, true));
        arrays.push(Arc::new(Float64Array::from(values.clone())));
    }

    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
        .map_err(|e| Error::Parquet(format!("record batch build failed: {e}")))?;
    write_batch(path, &batch, Vec::new())
}

/// Read a data-file layout parquet file into a flat table.
pub fn read_table(path: &Path) -> Result<FlatTable> {
    let (batches, _) = read_batches(path)?;
    let mut table = FlatTable::default();

    for (i, batch) in batches.iter().enumerate() {
        let schema = batch.schema();
        let keys = schema
            .fields()
            .iter()
            .filter(|f| f.name() != DATETIME_COLUMN)
            .map(|f| column_key(f.name()))
            .collect::<Result<Vec<_>>>()?;
        if i == 0 {
            table.values = vec![Vec::new(); keys.len()];
            table.columns = keys;
        } else if keys != table.columns {
            return Err(Error::format(format!(
                "{}: batches disagree on columns",
                path.display()
            )));
        }

        let datetime = column::<TimestampMillisecondArray>(batch, DATETIME_COLUMN)?;
        for row in 0..batch.num_rows() {
            table.index.push(from_millis(datetime.value(row))?);
        }
        for (key, values) in table.columns.iter().zip(table.values.iter_mut()) {
            let col = column::<Float64Array>(batch, &column_name(key)?)?;
            values.extend(col.iter());
        }
    }
    Ok(table)
}

/// Write one data-layout parquet file per parameter of `table`.
///
/// Parameter ids are escaped with `io::file_name_part` in file names and
/// kept verbatim inside the files.
pub fn write_parameter_files(
    table: &FlatTable,
    out_dir: &Path,
    file_template: &str,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(out_dir).map_err(|e| Error::io(out_dir, e))?;
    let mut written = Vec::new();
    for parameter_id in table.parameter_ids() {
        let path = out_dir.join(parameter_file_name(file_template, &parameter_id));
        write_table(&table.select_parameter(&parameter_id), &path)?;
        written.push(path);
    }
    Ok(written)
}

/// Open a per-parameter parquet file as a station file.
pub fn read_station_file(path: &Path) -> Result<StationFile> {
    let table = read_table(path)?;
    let parameters = table.parameter_ids();
    match parameters.len() {
        1 => {
            let parameter_id = parameters.into_iter().next().unwrap_or_default();
            StationFile::from_flat_table(&table, &parameter_id)
        }
        n => Err(Error::format(format!(
            "{} holds {} parameters, expected exactly one",
            path.display(),
            n
        ))),
    }
}

// ---------------------------------------------------------------------------
// Header file
// ---------------------------------------------------------------------------

fn write_headers(set: &TimeSeriesSet, path: &Path) -> Result<()> {
    let headers: Vec<&Header> = set.time_series.iter().map(|ts| &ts.header).collect();

    let text = |f: fn(&Header) -> Option<&str>| -> ArrayRef {
        Arc::new(StringArray::from(headers.iter().map(|h| f(h)).collect::<Vec<_>>()))
    };
    let float = |f: fn(&Header) -> Option<f64>| -> ArrayRef {
        Arc::new(Float64Array::from(headers.iter().map(|h| f(h)).collect::<Vec<_>>()))
    };
    let stamp = |f: fn(&Header) -> Option<NaiveDateTime>| -> ArrayRef {
        Arc::new(TimestampMillisecondArray::from(
            headers
                .iter()
                .map(|h| f(h).as_ref().map(to_millis))
                .collect::<Vec<_>>(),
        ))
    };

    let mut qualifiers = ListBuilder::new(StringBuilder::new());
    for header in &headers {
        match &header.qualifier_id {
            Some(ids) => {
                for id in ids {
                    qualifiers.values().append_value(id);
                }
                qualifiers.append(true);
            }
            None => qualifiers.append(false),
        }
    }

    let list_type = DataType::List(Arc::new(Field::new("item", DataType::Utf8, true)));
    let columns: Vec<(&str, DataType, ArrayRef)> = vec![
        ("type", DataType::Utf8, text(|h| h.series_type.map(|t| t.as_str()))),
        ("module_instance_id", DataType::Utf8, text(|h| h.module_instance_id.as_deref())),
        ("location_id", DataType::Utf8, text(|h| Some(h.location_id.as_str()))),
        ("parameter_id", DataType::Utf8, text(|h| Some(h.parameter_id.as_str()))),
        ("qualifier_id", list_type, Arc::new(qualifiers.finish()) as ArrayRef),
        ("time_step.unit", DataType::Utf8, text(|h| Some(h.time_step.unit.as_str()))),
        ("time_step.multiplier", DataType::Float64, float(|h| h.time_step.multiplier)),
        ("start_date", timestamp_type(), stamp(|h| h.start_date)),
        ("end_date", timestamp_type(), stamp(|h| h.end_date)),
        ("miss_val", DataType::Float64, float(|h| h.miss_val)),
        ("station_name", DataType::Utf8, text(|h| h.station_name.as_deref())),
        ("lat", DataType::Float64, float(|h| h.lat)),
        ("lon", DataType::Float64, float(|h| h.lon)),
        ("x", DataType::Float64, float(|h| h.x)),
        ("y", DataType::Float64, float(|h| h.y)),
        ("z", DataType::Float64, float(|h| h.z)),
        ("units", DataType::Utf8, text(|h| h.units.as_deref())),
    ];

    let (fields, arrays): (Vec<Field>, Vec<ArrayRef>) = columns
        .into_iter()
        .map(|(name, data_type, array)| (Field::new(name, data_type, true), array))
        .unzip();
    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
        .map_err(|e| Error::Parquet(format!("record batch build failed: {e}")))?;

    let mut metadata = Vec::new();
    if let Some(version) = &set.version {
        metadata.push(KeyValue {
            key: VERSION_KEY.to_string(),
            value: Some(version.clone()),
        });
    }
    if let Some(tz) = set.time_zone {
        metadata.push(KeyValue {
            key: TIME_ZONE_KEY.to_string(),
            value: Some(tz.to_string()),
        });
    }
    write_batch(path, &batch, metadata)
}

fn read_headers(path: &Path) -> Result<(Vec<Header>, Option<String>, Option<f64>)> {
    let (batches, metadata) = read_batches(path)?;
    let meta = |key: &str| {
        metadata
            .iter()
            .find(|kv| kv.key == key)
            .and_then(|kv| kv.value.clone())
    };
    let version = meta(VERSION_KEY);
    let time_zone = meta(TIME_ZONE_KEY)
        .map(|tz| crate::conversions::parse_f64("time_zone", &tz))
        .transpose()?;

    let mut headers = Vec::new();
    for batch in &batches {
        let location_id = column::<StringArray>(batch, "location_id")?;
        let parameter_id = column::<StringArray>(batch, "parameter_id")?;
        let series_type = optional_column::<StringArray>(batch, "type")?;
        let module_instance_id = optional_column::<StringArray>(batch, "module_instance_id")?;
        let qualifier_col = optional_column::<ListArray>(batch, "qualifier_id")?;
        let unit = optional_column::<StringArray>(batch, "time_step.unit")?;
        let multiplier = optional_column::<Float64Array>(batch, "time_step.multiplier")?;
        let start_date = optional_column::<TimestampMillisecondArray>(batch, "start_date")?;
        let end_date = optional_column::<TimestampMillisecondArray>(batch, "end_date")?;
        let miss_val = optional_column::<Float64Array>(batch, "miss_val")?;
        let station_name = optional_column::<StringArray>(batch, "station_name")?;
        let lat = optional_column::<Float64Array>(batch, "lat")?;
        let lon = optional_column::<Float64Array>(batch, "lon")?;
        let x = optional_column::<Float64Array>(batch, "x")?;
        let y = optional_column::<Float64Array>(batch, "y")?;
        let z = optional_column::<Float64Array>(batch, "z")?;
        let units = optional_column::<StringArray>(batch, "units")?;

        for row in 0..batch.num_rows() {
            let time_step = match string_at(unit, row) {
                None => TimeStep::nonequidistant(),
                Some(unit) => match unit.parse::<TimeStepUnit>()? {
                    TimeStepUnit::Nonequidistant => TimeStep::nonequidistant(),
                    unit => TimeStep::regular(unit, f64_at(multiplier, row).unwrap_or(1.0))?,
                },
            };
            let qualifier_id = match qualifier_col.filter(|q| !q.is_null(row)) {
                None => None,
                Some(list) => {
                    let values = list.value(row);
                    let ids = values
                        .as_any()
                        .downcast_ref::<StringArray>()
                        .ok_or_else(|| Error::format("qualifier_id items are not strings"))?;
                    Some(ids.iter().flatten().map(String::from).collect::<Vec<_>>())
                }
            };

            let header = Header {
                series_type: string_at(series_type, row)
                    .map(|t| t.parse())
                    .transpose()?,
                module_instance_id: string_at(module_instance_id, row),
                location_id: location_id.value(row).to_string(),
                parameter_id: parameter_id.value(row).to_string(),
                qualifier_id,
                time_step,
                start_date: timestamp_at(start_date, row)?,
                end_date: timestamp_at(end_date, row)?,
                miss_val: f64_at(miss_val, row),
                station_name: string_at(station_name, row),
                lat: f64_at(lat, row),
                lon: f64_at(lon, row),
                x: f64_at(x, row),
                y: f64_at(y, row),
                z: f64_at(z, row),
                units: string_at(units, row),
            };
            header.validate()?;
            headers.push(header);
        }
    }
    Ok((headers, version, time_zone))
}

// ---------------------------------------------------------------------------
// Set encode / decode
// ---------------------------------------------------------------------------

/// Write the reliable events of `set` to `data_file` and its headers to the
/// companion header file.
pub fn write_columnar(set: &TimeSeriesSet, data_file: &Path, flag_threshold: i32) -> Result<()> {
    if let Some(parent) = data_file.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    write_table(&to_flat_table(set, flag_threshold), data_file)?;
    write_headers(set, &header_file(data_file))
}

/// Read a data file and its header companion back into a set.
///
/// A header whose series has no column in the data file gets no events.
pub fn read_columnar(data_file: &Path) -> Result<TimeSeriesSet> {
    let (headers, version, time_zone) = read_headers(&header_file(data_file))?;
    let table = read_table(data_file)?;

    let time_series = headers
        .into_iter()
        .map(|header| {
            let key = ColumnKey::new(&header.location_id, &header.parameter_id);
            let events: Events = match table.column(&key) {
                None => Events::new(),
                Some(values) => table
                    .index
                    .iter()
                    .zip(values)
                    .filter_map(|(datetime, value)| {
                        value.map(|value| Event {
                            datetime: *datetime,
                            value,
                            flag: None,
                        })
                    })
                    .collect(),
            };
            TimeSeries::new(header, events)
        })
        .collect();

    Ok(TimeSeriesSet {
        version,
        time_zone,
        time_series,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DEFAULT_FLAG_THRESHOLD, SeriesType};
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn t(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2022, 5, 1)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn sample_set() -> TimeSeriesSet {
        let mut a = Header::new("A", "Q");
        a.series_type = Some(SeriesType::Instantaneous);
        a.qualifier_id = Some(vec!["raw".into(), "hourly".into()]);
        a.time_step = TimeStep::regular(TimeStepUnit::Hour, 1.0).unwrap();
        a.start_date = Some(t(0));
        a.end_date = Some(t(2));
        a.miss_val = Some(-999.0);
        a.lat = Some(52.1);
        a.units = Some("m3/s".into());

        let b = Header::new("B", "H");

        TimeSeriesSet {
            version: Some("1.32".into()),
            time_zone: Some(1.0),
            time_series: vec![
                TimeSeries::new(
                    a,
                    Events(vec![
                        Event { datetime: t(0), value: 1.0, flag: Some(0) },
                        Event { datetime: t(1), value: 9.0, flag: Some(9) },
                        Event { datetime: t(2), value: 3.0, flag: Some(0) },
                    ]),
                ),
                TimeSeries::new(b, Events::new()),
            ],
        }
    }

    #[test]
    fn test_header_file_path() {
        assert_eq!(
            header_file(Path::new("data/series.parquet")),
            PathBuf::from("data/series_header.parquet")
        );
        assert_eq!(header_file(Path::new("series")), PathBuf::from("series_header"));
    }

    #[test]
    fn test_columnar_round_trip_keeps_reliable_values() {
        let dir = TempDir::new().unwrap();
        let data_file = dir.path().join("data").join("series.parquet");
        let set = sample_set();
        write_columnar(&set, &data_file, DEFAULT_FLAG_THRESHOLD).unwrap();
        assert!(dir.path().join("data").join("series_header.parquet").exists());

        let back = read_columnar(&data_file).unwrap();
        assert_eq!(back.version.as_deref(), Some("1.32"));
        assert_eq!(back.time_zone, Some(1.0));
        assert_eq!(back.len(), 2);
        assert_eq!(back.time_series[0].header, set.time_series[0].header);
        assert_eq!(
            back.time_series[0].events.iter().map(|e| e.value).collect::<Vec<_>>(),
            vec![1.0, 3.0]
        );
        assert_eq!(back.time_series[1].header.time_step, TimeStep::nonequidistant());
        assert!(back.time_series[1].events.is_empty());
    }

    #[test]
    fn test_parameter_files() {
        let dir = TempDir::new().unwrap();
        let table = FlatTable::new(
            vec![t(0), t(1)],
            vec![ColumnKey::new("A", "Q"), ColumnKey::new("A", "H")],
            vec![vec![Some(1.0), None], vec![None, Some(2.0)]],
        )
        .unwrap();

        let written = write_parameter_files(&table, dir.path(), FILE_TEMPLATE).unwrap();
        assert_eq!(written.len(), 2);

        let q = read_table(&dir.path().join("Q.parquet")).unwrap();
        assert_eq!(q.index, vec![t(0)]);
        assert_eq!(q.columns, vec![ColumnKey::new("A", "Q")]);

        let station = read_station_file(&dir.path().join("H.parquet")).unwrap();
        assert_eq!(station.location_ids(), vec!["A"]);
        assert_eq!(station.time, vec![t(1)]);
        assert_eq!(station.variables[0].data, vec![2.0]);
    }

    #[test]
    fn test_parameter_file_with_separator_in_id() {
        let dir = TempDir::new().unwrap();
        let table = FlatTable::new(
            vec![t(0)],
            vec![ColumnKey::new("A", "Q [m3/s]")],
            vec![vec![Some(4.0)]],
        )
        .unwrap();

        let written = write_parameter_files(&table, dir.path(), FILE_TEMPLATE).unwrap();
        assert_eq!(written, vec![dir.path().join("Q [m3%2Fs].parquet")]);
        let station = read_station_file(&written[0]).unwrap();
        assert_eq!(station.parameter_ids(), vec!["Q [m3/s]"]);
    }

    #[test]
    fn test_missing_header_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let data_file = dir.path().join("series.parquet");
        write_table(&FlatTable::default(), &data_file).unwrap();
        assert!(matches!(read_columnar(&data_file), Err(Error::Io { .. })));
    }
}
