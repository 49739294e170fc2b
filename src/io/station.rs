//! In-memory form of a CF `timeSeries` station file.
//!
//! This is the layout the cache keeps open per data file: one shared time
//! axis, fixed-width station id text, optional coordinates, and one
//! `(time, stations)` variable per parameter. Conversion to and from the
//! time-series model lives here so it does not depend on the NetCDF library.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};

use crate::error::{Error, Result};
use crate::model::{
    ColumnKey, Events, FlatTable, Header, SeriesType, TimeSeries, TimeSeriesSet, TimeStep,
    TimeStepUnit,
};

/// Units written for the time variable of every file fewspy produces.
pub const TIME_UNITS: &str = "seconds since 1970-01-01 00:00:00 UTC";

// ---------------------------------------------------------------------------
// Fixed-width text
// ---------------------------------------------------------------------------

/// A `(count, width)` character matrix, NUL padded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedWidthText {
    width: usize,
    bytes: Vec<u8>,
}

impl FixedWidthText {
    /// Pack `values`, sized to the longest one.
    pub fn from_strings<S: AsRef<str>>(values: &[S]) -> Self {
        let width = values
            .iter()
            .map(|v| v.as_ref().len())
            .max()
            .unwrap_or(0)
            .max(1);
        let mut bytes = vec![0u8; width * values.len()];
        for (row, value) in bytes.chunks_exact_mut(width).zip(values) {
            let value = value.as_ref().as_bytes();
            row[..value.len()].copy_from_slice(value);
        }
        Self { width, bytes }
    }

    pub fn from_raw(bytes: Vec<u8>, width: usize) -> Result<Self> {
        if width == 0 || bytes.len() % width != 0 {
            return Err(Error::format(format!(
                "{} bytes cannot be split into rows of {}",
                bytes.len(),
                width
            )));
        }
        Ok(Self { width, bytes })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn len(&self) -> usize {
        self.bytes.len() / self.width
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Decode every row, trimming NUL padding and surrounding whitespace.
    pub fn decode(&self) -> Vec<String> {
        self.bytes
            .chunks_exact(self.width)
            .map(|row| {
                let end = row.iter().position(|&b| b == 0).unwrap_or(row.len());
                String::from_utf8_lossy(&row[..end]).trim().to_string()
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// CF time axis
// ---------------------------------------------------------------------------

/// Parse `<unit> since <reference>` into a step length in milliseconds and a
/// naive UTC reference time.
pub fn parse_time_units(units: &str) -> Result<(i64, NaiveDateTime)> {
    let (unit, reference) = units
        .split_once(" since ")
        .ok_or_else(|| Error::format(format!("time units '{}' lack 'since'", units)))?;

    let step_ms = match unit.trim().to_ascii_lowercase().as_str() {
        "milliseconds" | "millisecond" | "ms" => 1,
        "seconds" | "second" | "secs" | "sec" | "s" => 1_000,
        "minutes" | "minute" | "mins" | "min" => 60_000,
        "hours" | "hour" | "hrs" | "hr" | "h" => 3_600_000,
        "days" | "day" | "d" => 86_400_000,
        other => return Err(Error::format(format!("unsupported time unit '{}'", other))),
    };

    let mut parts = reference.split_whitespace();
    let date_text = parts
        .next()
        .ok_or_else(|| Error::format(format!("time units '{}' lack a reference", units)))?;
    let (date_text, mut time_text) = match date_text.split_once('T') {
        Some((d, t)) => (d, Some(t.trim_end_matches('Z'))),
        None => (date_text, None),
    };
    let date = NaiveDate::parse_from_str(date_text, "%Y-%m-%d")
        .map_err(|e| Error::parse(format!("reference date '{}': {}", date_text, e)))?;

    let mut offset = Duration::zero();
    for token in parts {
        if token.contains(':') && time_text.is_none() && !token.starts_with(['+', '-']) {
            time_text = Some(token);
        } else if let Some(parsed) = parse_utc_offset(token) {
            offset = parsed;
        }
    }
    let time = match time_text {
        Some(t) if !t.is_empty() => NaiveTime::parse_from_str(t, "%H:%M:%S%.f")
            .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M"))
            .map_err(|e| Error::parse(format!("reference time '{}': {}", t, e)))?,
        _ => NaiveTime::MIN,
    };

    Ok((step_ms, NaiveDateTime::new(date, time) - offset))
}

fn parse_utc_offset(token: &str) -> Option<Duration> {
    let (sign, digits) = match token.as_bytes().first()? {
        b'+' => (1, &token[1..]),
        b'-' => (-1, &token[1..]),
        _ => return None,
    };
    let digits: String = digits.chars().filter(|c| *c != ':').collect();
    let (hours, minutes) = match digits.len() {
        1 | 2 => (digits.parse::<i64>().ok()?, 0),
        4 => (digits[..2].parse::<i64>().ok()?, digits[2..].parse::<i64>().ok()?),
        _ => return None,
    };
    Some(Duration::minutes(sign * (hours * 60 + minutes)))
}

/// Decode raw time values with their CF units.
pub fn decode_time(values: &[f64], units: &str) -> Result<Vec<NaiveDateTime>> {
    let (step_ms, reference) = parse_time_units(units)?;
    values
        .iter()
        .map(|v| {
            if !v.is_finite() {
                return Err(Error::parse(format!("non-finite time value {}", v)));
            }
            Ok(reference + Duration::milliseconds((v * step_ms as f64).round() as i64))
        })
        .collect()
}

/// Encode timestamps as seconds since the epoch (see `TIME_UNITS`).
pub fn encode_time(times: &[NaiveDateTime]) -> Vec<f64> {
    times
        .iter()
        .map(|t| t.and_utc().timestamp_millis() as f64 / 1000.0)
        .collect()
}

/// Regular spacing becomes `{second, delta}`, anything else nonequidistant.
/// Spacing is compared exactly; fewer than two points is nonequidistant.
pub fn detect_time_step(times: &[NaiveDateTime]) -> TimeStep {
    if times.len() < 2 {
        return TimeStep::nonequidistant();
    }
    let first = times[1] - times[0];
    let regular = times.windows(2).all(|w| w[1] - w[0] == first);
    if regular && first > Duration::zero() {
        TimeStep {
            unit: TimeStepUnit::Second,
            multiplier: Some(first.num_milliseconds() as f64 / 1000.0),
        }
    } else {
        TimeStep::nonequidistant()
    }
}

// ---------------------------------------------------------------------------
// Station file
// ---------------------------------------------------------------------------

/// One `(time, stations)` data variable.
#[derive(Debug, Clone, PartialEq)]
pub struct StationVariable {
    pub name: String,
    pub units: Option<String>,
    pub fill_value: Option<f64>,
    /// Row-major: `data[t * n_stations + s]`.
    pub data: Vec<f64>,
}

impl StationVariable {
    /// Whether `value` is a fill value or NaN.
    pub fn is_missing(&self, value: f64) -> bool {
        value.is_nan() || self.fill_value.is_some_and(|f| f == value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StationFile {
    pub time: Vec<NaiveDateTime>,
    pub station_id: FixedWidthText,
    pub station_names: Option<FixedWidthText>,
    pub x: Option<Vec<f64>>,
    pub y: Option<Vec<f64>>,
    pub lat: Option<Vec<f64>>,
    pub lon: Option<Vec<f64>>,
    /// Station altitude; `None` entries were fill values in the file.
    pub z: Option<Vec<Option<f64>>>,
    pub variables: Vec<StationVariable>,
}

impl StationFile {
    pub fn n_stations(&self) -> usize {
        self.station_id.len()
    }

    /// Station ids, decoded from the fixed-width text on every call.
    pub fn location_ids(&self) -> Vec<String> {
        self.station_id.decode()
    }

    pub fn parameter_ids(&self) -> Vec<&str> {
        self.variables.iter().map(|v| v.name.as_str()).collect()
    }

    pub fn variable(&self, name: &str) -> Result<&StationVariable> {
        self.variables
            .iter()
            .find(|v| v.name == name)
            .ok_or_else(|| Error::NotFound(format!("variable '{}'", name)))
    }

    /// Shapes of every variable agree with the time axis and station count.
    pub fn validate(&self) -> Result<()> {
        let n = self.n_stations();
        for coords in [&self.x, &self.y, &self.lat, &self.lon].into_iter().flatten() {
            if coords.len() != n {
                return Err(Error::format(format!(
                    "coordinate has {} entries for {} stations",
                    coords.len(),
                    n
                )));
            }
        }
        for variable in &self.variables {
            if variable.data.len() != self.time.len() * n {
                return Err(Error::format(format!(
                    "variable '{}' has {} values, expected {} x {}",
                    variable.name,
                    variable.data.len(),
                    self.time.len(),
                    n
                )));
            }
        }
        Ok(())
    }

    /// One series per `(variable, station)`. Fill values and NaN are dropped
    /// from the events; the fill value is kept as `miss_val`.
    pub fn to_time_series_set(
        &self,
        series_type: Option<SeriesType>,
        module_instance_id: Option<&str>,
    ) -> TimeSeriesSet {
        let location_ids = self.location_ids();
        let station_names = self.station_names.as_ref().map(FixedWidthText::decode);
        let n = location_ids.len();
        let time_step = detect_time_step(&self.time);
        let coord = |values: &Option<Vec<f64>>, i: usize| values.as_ref().map(|v| v[i]);

        let mut set = TimeSeriesSet {
            version: None,
            time_zone: Some(0.0),
            time_series: Vec::with_capacity(self.variables.len() * n),
        };

        for variable in &self.variables {
            for (i, location_id) in location_ids.iter().enumerate() {
                let header = Header {
                    series_type,
                    module_instance_id: module_instance_id.map(String::from),
                    location_id: location_id.clone(),
                    parameter_id: variable.name.clone(),
                    qualifier_id: None,
                    time_step,
                    start_date: self.time.first().copied(),
                    end_date: self.time.last().copied(),
                    miss_val: variable.fill_value,
                    station_name: station_names.as_ref().and_then(|names| {
                        names.get(i).filter(|name| !name.is_empty()).cloned()
                    }),
                    x: coord(&self.x, i),
                    y: coord(&self.y, i),
                    lat: coord(&self.lat, i),
                    lon: coord(&self.lon, i),
                    z: self.z.as_ref().and_then(|z| z[i]),
                    units: variable.units.clone(),
                };
                let events: Events = self
                    .time
                    .iter()
                    .enumerate()
                    .map(|(t, datetime)| (datetime, variable.data[t * n + i]))
                    .filter(|(_, value)| !variable.is_missing(*value))
                    .map(|(datetime, value)| crate::model::Event {
                        datetime: *datetime,
                        value,
                        flag: None,
                    })
                    .collect();
                set.time_series.push(TimeSeries::new(header, events));
            }
        }
        set
    }

    /// Build a single-parameter station file from the columns of a flat
    /// table that belong to `parameter_id`. Rows null in every station are
    /// dropped; remaining nulls become NaN.
    pub fn from_flat_table(table: &FlatTable, parameter_id: &str) -> Result<Self> {
        let selected = table.select_parameter(parameter_id);
        if selected.columns.is_empty() {
            return Err(Error::NotFound(format!("parameter '{}' in table", parameter_id)));
        }
        let location_ids: Vec<&str> = selected
            .columns
            .iter()
            .map(|c| c.location_id.as_str())
            .collect();
        let n = location_ids.len();

        let mut data = vec![f64::NAN; selected.index.len() * n];
        for (s, column) in selected.values.iter().enumerate() {
            for (t, value) in column.iter().enumerate() {
                if let Some(v) = value {
                    data[t * n + s] = *v;
                }
            }
        }

        Ok(Self {
            time: selected.index.clone(),
            station_id: FixedWidthText::from_strings(&location_ids),
            station_names: None,
            x: None,
            y: None,
            lat: None,
            lon: None,
            z: None,
            variables: vec![StationVariable {
                name: parameter_id.to_string(),
                units: None,
                fill_value: Some(f64::NAN),
                data,
            }],
        })
    }

    /// Slice one variable into a sorted flat table.
    ///
    /// The time range is inclusive at both ends. Every requested location
    /// must exist in the file.
    pub fn select(
        &self,
        parameter_id: &str,
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
        location_ids: Option<&[String]>,
    ) -> Result<FlatTable> {
        let variable = self.variable(parameter_id)?;
        let all_ids = self.location_ids();
        let n = all_ids.len();

        let stations: Vec<usize> = match location_ids {
            None => (0..n).collect(),
            Some(wanted) => wanted
                .iter()
                .map(|id| {
                    all_ids
                        .iter()
                        .position(|candidate| candidate == id)
                        .ok_or_else(|| Error::NotFound(format!("location '{}'", id)))
                })
                .collect::<Result<Vec<_>>>()?,
        };

        let rows: Vec<usize> = (0..self.time.len())
            .filter(|&t| start.is_none_or(|s| self.time[t] >= s))
            .filter(|&t| end.is_none_or(|e| self.time[t] <= e))
            .collect();

        let table = FlatTable {
            index: rows.iter().map(|&t| self.time[t]).collect(),
            columns: stations
                .iter()
                .map(|&s| ColumnKey::new(&all_ids[s], parameter_id))
                .collect(),
            values: stations
                .iter()
                .map(|&s| {
                    rows.iter()
                        .map(|&t| {
                            let value = variable.data[t * n + s];
                            (!variable.is_missing(value)).then_some(value)
                        })
                        .collect()
                })
                .collect(),
        };
        Ok(table.sort())
    }
}
