//! Core time-series types shared by every codec and the cache.
//!
//! A `TimeSeriesSet` is what every decoder produces and every encoder
//! consumes. The wide `FlatTable` is the shape the cache writes to disk and
//! answers queries with.
//!
//! Header and event constructors work on the "wire" representation, a
//! `serde_json` map with camelCase keys. The JSON codec hands it over
//! directly; the XML codec builds the same map from elements and attributes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde_json::{Map, Value, json};

use crate::conversions::{
    camel_to_snake_case, datetime_to_pi_parts, hours_to_duration, non_empty, snake_to_camel_case,
    value_to_datetime, value_to_f64, value_to_flag,
};
use crate::error::{Error, Result};

/// Flags at or above this value mark an event as unreliable.
pub const DEFAULT_FLAG_THRESHOLD: i32 = 6;

/// Every header field, in snake_case, in PI document order.
pub const HEADER_FIELDS: [&str; 16] = [
    "type",
    "module_instance_id",
    "location_id",
    "parameter_id",
    "qualifier_id",
    "time_step",
    "start_date",
    "end_date",
    "miss_val",
    "station_name",
    "lat",
    "lon",
    "x",
    "y",
    "z",
    "units",
];

// ---------------------------------------------------------------------------
// Header enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesType {
    Accumulative,
    Instantaneous,
}

impl SeriesType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeriesType::Accumulative => "accumulative",
            SeriesType::Instantaneous => "instantaneous",
        }
    }
}

impl FromStr for SeriesType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accumulative" => Ok(SeriesType::Accumulative),
            "instantaneous" => Ok(SeriesType::Instantaneous),
            other => Err(Error::format(format!("unknown series type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeStepUnit {
    Second,
    Minute,
    Hour,
    Day,
    Month,
    Year,
    Nonequidistant,
}

impl TimeStepUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeStepUnit::Second => "second",
            TimeStepUnit::Minute => "minute",
            TimeStepUnit::Hour => "hour",
            TimeStepUnit::Day => "day",
            TimeStepUnit::Month => "month",
            TimeStepUnit::Year => "year",
            TimeStepUnit::Nonequidistant => "nonequidistant",
        }
    }
}

impl fmt::Display for TimeStepUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeStepUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "second" => Ok(TimeStepUnit::Second),
            "minute" => Ok(TimeStepUnit::Minute),
            "hour" => Ok(TimeStepUnit::Hour),
            "day" => Ok(TimeStepUnit::Day),
            "month" => Ok(TimeStepUnit::Month),
            "year" => Ok(TimeStepUnit::Year),
            "nonequidistant" => Ok(TimeStepUnit::Nonequidistant),
            other => Err(Error::format(format!("unknown time step unit '{}'", other))),
        }
    }
}

/// Regular step (`unit` x `multiplier`) or nonequidistant (no multiplier).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeStep {
    pub unit: TimeStepUnit,
    pub multiplier: Option<f64>,
}

impl TimeStep {
    pub fn nonequidistant() -> Self {
        Self {
            unit: TimeStepUnit::Nonequidistant,
            multiplier: None,
        }
    }

    pub fn regular(unit: TimeStepUnit, multiplier: f64) -> Result<Self> {
        if unit == TimeStepUnit::Nonequidistant {
            return Err(Error::format("nonequidistant time step cannot carry a multiplier"));
        }
        Ok(Self {
            unit,
            multiplier: Some(multiplier),
        })
    }

    pub fn is_equidistant(&self) -> bool {
        self.unit != TimeStepUnit::Nonequidistant
    }

    /// Parse `{"unit": "second", "multiplier": "900"}`.
    pub fn from_wire(value: &Value) -> Result<Self> {
        let unit: TimeStepUnit = value
            .get("unit")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::format(format!("timeStep without unit: {}", value)))?
            .parse()?;
        if unit == TimeStepUnit::Nonequidistant {
            return Ok(Self::nonequidistant());
        }
        let multiplier = match value.get("multiplier") {
            Some(m) => value_to_f64("timeStep.multiplier", m)?,
            None => 1.0,
        };
        Self::regular(unit, multiplier)
    }

    pub fn to_wire(&self) -> Value {
        match self.multiplier {
            Some(m) => json!({"unit": self.unit.as_str(), "multiplier": format_number(m)}),
            None => json!({"unit": self.unit.as_str()}),
        }
    }
}

impl Default for TimeStep {
    fn default() -> Self {
        Self::nonequidistant()
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Metadata of one scalar time series.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    pub series_type: Option<SeriesType>,
    pub module_instance_id: Option<String>,
    pub location_id: String,
    pub parameter_id: String,
    pub qualifier_id: Option<Vec<String>>,
    pub time_step: TimeStep,
    pub start_date: Option<NaiveDateTime>,
    pub end_date: Option<NaiveDateTime>,
    /// Wire sentinel for missing values. Never present among decoded events.
    pub miss_val: Option<f64>,
    pub station_name: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub units: Option<String>,
}

impl Header {
    pub fn new(location_id: impl Into<String>, parameter_id: impl Into<String>) -> Self {
        Self {
            location_id: location_id.into(),
            parameter_id: parameter_id.into(),
            ..Default::default()
        }
    }

    /// Build a header from a PI wire map. Unknown keys are ignored.
    pub fn from_wire(wire: &Map<String, Value>) -> Result<Self> {
        let mut header = Header::default();

        for (key, value) in wire {
            match camel_to_snake_case(key).as_str() {
                "type" => {
                    header.series_type = wire_text(key, value)?.map(|s| s.parse()).transpose()?
                }
                "module_instance_id" => header.module_instance_id = wire_text(key, value)?,
                "location_id" => header.location_id = wire_text(key, value)?.unwrap_or_default(),
                "parameter_id" => {
                    header.parameter_id = wire_text(key, value)?.unwrap_or_default()
                }
                "qualifier_id" => {
                    let mut ids = header.qualifier_id.take().unwrap_or_default();
                    match value {
                        Value::Array(items) => {
                            for item in items {
                                ids.extend(wire_text(key, item)?);
                            }
                        }
                        other => ids.extend(wire_text(key, other)?),
                    }
                    header.qualifier_id = (!ids.is_empty()).then_some(ids);
                }
                "time_step" => header.time_step = TimeStep::from_wire(value)?,
                "start_date" => header.start_date = Some(value_to_datetime(value)?),
                "end_date" => header.end_date = Some(value_to_datetime(value)?),
                "miss_val" => header.miss_val = wire_float(key, value)?,
                "station_name" => header.station_name = wire_text(key, value)?,
                "lat" => header.lat = wire_float(key, value)?,
                "lon" => header.lon = wire_float(key, value)?,
                "x" => header.x = wire_float(key, value)?,
                "y" => header.y = wire_float(key, value)?,
                "z" => header.z = wire_float(key, value)?,
                "units" => header.units = wire_text(key, value)?,
                _ => {}
            }
        }

        header.validate()?;
        Ok(header)
    }

    /// Required fields are present and the date range is ordered.
    pub fn validate(&self) -> Result<()> {
        if self.location_id.is_empty() {
            return Err(Error::format("header is missing locationId"));
        }
        if self.parameter_id.is_empty() {
            return Err(Error::format(format!(
                "header for location '{}' is missing parameterId",
                self.location_id
            )));
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(Error::format(format!(
                    "header for {}/{} has startDate {} after endDate {}",
                    self.location_id, self.parameter_id, start, end
                )));
            }
        }
        Ok(())
    }

    /// Inverse of `from_wire`: camelCase keys, floats written as strings.
    pub fn to_wire(&self) -> Map<String, Value> {
        let mut wire = Map::new();
        let mut put = |field: &str, value: Value| {
            wire.insert(snake_to_camel_case(field), value);
        };

        if let Some(t) = self.series_type {
            put("type", Value::from(t.as_str()));
        }
        if let Some(m) = &self.module_instance_id {
            put("module_instance_id", Value::from(m.as_str()));
        }
        put("location_id", Value::from(self.location_id.as_str()));
        put("parameter_id", Value::from(self.parameter_id.as_str()));
        if let Some(q) = &self.qualifier_id {
            put("qualifier_id", Value::from(q.clone()));
        }
        put("time_step", self.time_step.to_wire());
        if let Some(d) = &self.start_date {
            put("start_date", datetime_to_wire(d));
        }
        if let Some(d) = &self.end_date {
            put("end_date", datetime_to_wire(d));
        }
        if let Some(v) = self.miss_val {
            put("miss_val", Value::from(format_number(v)));
        }
        if let Some(s) = &self.station_name {
            put("station_name", Value::from(s.as_str()));
        }
        for (field, value) in [
            ("lat", self.lat),
            ("lon", self.lon),
            ("x", self.x),
            ("y", self.y),
            ("z", self.z),
        ] {
            if let Some(v) = value {
                put(field, Value::from(format_number(v)));
            }
        }
        if let Some(u) = &self.units {
            put("units", Value::from(u.as_str()));
        }
        wire
    }

    /// Whether `value` equals the missing-value sentinel. A NaN sentinel
    /// matches NaN values.
    pub fn is_missing(&self, value: f64) -> bool {
        match self.miss_val {
            Some(m) if m.is_nan() => value.is_nan(),
            Some(m) => value == m,
            None => false,
        }
    }
}

fn wire_text(key: &str, value: &Value) -> Result<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(non_empty(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        other => Err(Error::format(format!("{} should be text, got {}", key, other))),
    }
}

fn wire_float(key: &str, value: &Value) -> Result<Option<f64>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        other => value_to_f64(key, other).map(Some),
    }
}

fn datetime_to_wire(datetime: &NaiveDateTime) -> Value {
    let (date, time) = datetime_to_pi_parts(datetime);
    json!({"date": date, "time": time})
}

/// `900.0` -> `"900"`, `52.1` -> `"52.1"`, NaN -> `"NaN"`.
pub(crate) fn format_number(value: f64) -> String {
    format!("{}", value)
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    pub datetime: NaiveDateTime,
    pub value: f64,
    pub flag: Option<i32>,
}

impl Event {
    /// Parse one PI event (`date`, `time`, `value`, optional `flag`). The
    /// timestamp is shifted back by `time_zone` hours.
    pub fn from_wire(wire: &Map<String, Value>, time_zone: Option<f64>) -> Result<Self> {
        let date = wire
            .get("date")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::format("event without date"))?;
        let time = wire.get("time").and_then(Value::as_str);
        let mut datetime = crate::conversions::combine_date_time(date, time)?;
        if let Some(tz) = time_zone {
            datetime -= hours_to_duration(tz);
        }

        let value = match wire.get("value") {
            Some(v) => value_to_f64("value", v)?,
            None => return Err(Error::format(format!("event at {} without value", datetime))),
        };
        let flag = match wire.get("flag") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(f) => Some(value_to_flag(f)?),
        };

        Ok(Self {
            datetime,
            value,
            flag,
        })
    }

    /// PI wire event, shifted forward by `time_zone` hours.
    pub fn to_wire(&self, time_zone: Option<f64>) -> Map<String, Value> {
        let mut datetime = self.datetime;
        if let Some(tz) = time_zone {
            datetime += hours_to_duration(tz);
        }
        let (date, time) = datetime_to_pi_parts(&datetime);
        let mut wire = Map::new();
        wire.insert("date".into(), Value::from(date));
        wire.insert("time".into(), Value::from(time));
        wire.insert("value".into(), Value::from(format_number(self.value)));
        if let Some(flag) = self.flag {
            wire.insert("flag".into(), Value::from(flag.to_string()));
        }
        wire
    }
}

/// Ordered event rows of one series.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Events(pub Vec<Event>);

impl Events {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.0.iter()
    }

    pub fn push(&mut self, event: Event) {
        self.0.push(event);
    }

    /// The table has a flag column when any row carries a flag.
    pub fn has_flags(&self) -> bool {
        self.0.iter().any(|e| e.flag.is_some())
    }

    /// Drop rows whose value is the header's missing-value sentinel.
    pub fn without_missing(self, header: &Header) -> Self {
        Self(
            self.0
                .into_iter()
                .filter(|e| !header.is_missing(e.value))
                .collect(),
        )
    }
}

impl FromIterator<Event> for Events {
    fn from_iter<I: IntoIterator<Item = Event>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Keep rows with `flag < threshold`. Without a flag column the input is
/// returned unchanged; unflagged rows in a flagged table are dropped.
pub fn reliable_events(events: &Events, threshold: i32) -> Events {
    if !events.has_flags() {
        return events.clone();
    }
    events
        .iter()
        .filter(|e| e.flag.is_some_and(|f| f < threshold))
        .copied()
        .collect()
}

// ---------------------------------------------------------------------------
// Series and sets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeSeries {
    pub header: Header,
    pub events: Events,
}

impl TimeSeries {
    pub fn new(header: Header, events: Events) -> Self {
        Self { header, events }
    }
}

/// Decoded document: ordered series plus document-level metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeSeriesSet {
    pub version: Option<String>,
    /// Offset of the document's timestamps from UTC, in hours.
    pub time_zone: Option<f64>,
    pub time_series: Vec<TimeSeries>,
}

impl TimeSeriesSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.time_series.len()
    }

    /// True when every series has zero events (vacuously true with none).
    pub fn is_empty(&self) -> bool {
        self.time_series.iter().all(|ts| ts.events.is_empty())
    }

    /// Append every series of `other`. Document metadata of `self` wins when set.
    pub fn add(&mut self, other: TimeSeriesSet) {
        if self.version.is_none() {
            self.version = other.version;
        }
        if self.time_zone.is_none() {
            self.time_zone = other.time_zone;
        }
        self.time_series.extend(other.time_series);
    }

    pub fn location_ids(&self) -> BTreeSet<String> {
        self.time_series
            .iter()
            .map(|ts| ts.header.location_id.clone())
            .collect()
    }

    pub fn parameter_ids(&self) -> BTreeSet<String> {
        self.time_series
            .iter()
            .map(|ts| ts.header.parameter_id.clone())
            .collect()
    }

    pub fn qualifier_ids(&self) -> BTreeSet<String> {
        self.time_series
            .iter()
            .filter_map(|ts| ts.header.qualifier_id.as_ref())
            .flatten()
            .cloned()
            .collect()
    }

    /// Earliest and latest event timestamp over every series.
    pub fn time_range(&self) -> Option<(NaiveDateTime, NaiveDateTime)> {
        let mut all = self
            .time_series
            .iter()
            .flat_map(|ts| ts.events.iter().map(|e| e.datetime));
        let first = all.next()?;
        Some(all.fold((first, first), |(lo, hi), t| (lo.min(t), hi.max(t))))
    }
}

// ---------------------------------------------------------------------------
// Flat table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColumnKey {
    pub location_id: String,
    pub parameter_id: String,
}

impl ColumnKey {
    pub fn new(location_id: impl Into<String>, parameter_id: impl Into<String>) -> Self {
        Self {
            location_id: location_id.into(),
            parameter_id: parameter_id.into(),
        }
    }
}

impl fmt::Display for ColumnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.location_id, self.parameter_id)
    }
}

/// Wide table: datetime rows, `(location_id, parameter_id)` columns.
///
/// `values[c][r]` is the cell of column `c` at row `r`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatTable {
    pub index: Vec<NaiveDateTime>,
    pub columns: Vec<ColumnKey>,
    pub values: Vec<Vec<Option<f64>>>,
}

impl FlatTable {
    pub fn new(
        index: Vec<NaiveDateTime>,
        columns: Vec<ColumnKey>,
        values: Vec<Vec<Option<f64>>>,
    ) -> Result<Self> {
        if values.len() != columns.len() {
            return Err(Error::format(format!(
                "table has {} columns but {} value vectors",
                columns.len(),
                values.len()
            )));
        }
        if let Some((key, column)) = columns
            .iter()
            .zip(&values)
            .find(|(_, column)| column.len() != index.len())
        {
            return Err(Error::format(format!(
                "column {} has {} rows, index has {}",
                key,
                column.len(),
                index.len()
            )));
        }
        Ok(Self {
            index,
            columns,
            values,
        })
    }

    pub fn n_rows(&self) -> usize {
        self.index.len()
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty() || self.columns.is_empty()
    }

    pub fn column(&self, key: &ColumnKey) -> Option<&[Option<f64>]> {
        self.columns
            .iter()
            .position(|c| c == key)
            .map(|i| self.values[i].as_slice())
    }

    pub fn location_ids(&self) -> BTreeSet<String> {
        self.columns.iter().map(|c| c.location_id.clone()).collect()
    }

    pub fn parameter_ids(&self) -> BTreeSet<String> {
        self.columns.iter().map(|c| c.parameter_id.clone()).collect()
    }

    /// Columns of one parameter, with rows that are null in all of them dropped.
    pub fn select_parameter(&self, parameter_id: &str) -> FlatTable {
        let picked: Vec<usize> = (0..self.columns.len())
            .filter(|&i| self.columns[i].parameter_id == parameter_id)
            .collect();
        let table = FlatTable {
            index: self.index.clone(),
            columns: picked.iter().map(|&i| self.columns[i].clone()).collect(),
            values: picked.iter().map(|&i| self.values[i].clone()).collect(),
        };
        table.drop_empty_rows()
    }

    /// Remove rows where every column is null.
    pub fn drop_empty_rows(self) -> FlatTable {
        let keep: Vec<usize> = (0..self.index.len())
            .filter(|&r| self.values.iter().any(|column| column[r].is_some()))
            .collect();
        self.take_rows(&keep)
    }

    /// Sort rows by datetime and columns by `(location_id, parameter_id)`.
    pub fn sort(self) -> FlatTable {
        let mut rows: Vec<usize> = (0..self.index.len()).collect();
        rows.sort_by_key(|&r| self.index[r]);
        let mut cols: Vec<usize> = (0..self.columns.len()).collect();
        cols.sort_by(|&a, &b| self.columns[a].cmp(&self.columns[b]));

        let table = FlatTable {
            index: self.index.clone(),
            columns: cols.iter().map(|&c| self.columns[c].clone()).collect(),
            values: cols.iter().map(|&c| self.values[c].clone()).collect(),
        };
        table.take_rows(&rows)
    }

    fn take_rows(self, rows: &[usize]) -> FlatTable {
        FlatTable {
            index: rows.iter().map(|&r| self.index[r]).collect(),
            values: self
                .values
                .iter()
                .map(|column| rows.iter().map(|&r| column[r]).collect())
                .collect(),
            columns: self.columns,
        }
    }
}

/// Wide table of the reliable events of every series.
///
/// Series sharing a `(location_id, parameter_id)` key fill the same column;
/// on overlapping timestamps the later series wins.
pub fn to_flat_table(set: &TimeSeriesSet, threshold: i32) -> FlatTable {
    let reliable: Vec<(ColumnKey, Events)> = set
        .time_series
        .iter()
        .map(|ts| {
            (
                ColumnKey::new(&ts.header.location_id, &ts.header.parameter_id),
                reliable_events(&ts.events, threshold),
            )
        })
        .collect();

    let rows: BTreeMap<NaiveDateTime, usize> = reliable
        .iter()
        .flat_map(|(_, events)| events.iter().map(|e| e.datetime))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .enumerate()
        .map(|(i, t)| (t, i))
        .collect();

    let mut columns: Vec<ColumnKey> = Vec::new();
    let mut positions: HashMap<ColumnKey, usize> = HashMap::new();
    let mut values: Vec<Vec<Option<f64>>> = Vec::new();

    for (key, events) in reliable {
        let col = *positions.entry(key.clone()).or_insert_with(|| {
            columns.push(key);
            values.push(vec![None; rows.len()]);
            values.len() - 1
        });
        for event in &events {
            values[col][rows[&event.datetime]] = Some(event.value);
        }
    }

    FlatTable {
        index: rows.into_keys().collect(),
        columns,
        values,
    }
}
