//! PI JSON codec.
//!
//! Document shape:
//!
//! ```json
//! {"version": "1.32", "timeZone": "1.0",
//!  "timeSeries": [{"header": {...}, "events": [{"date", "time", "value", "flag"}]}]}
//! ```

use serde_json::{Map, Value};

use crate::conversions::value_to_f64;
use crate::error::{Error, Result};
use crate::model::{Event, Events, Header, TimeSeries, TimeSeriesSet, format_number};

/// Decode a PI JSON document.
pub fn decode(bytes: &[u8]) -> Result<TimeSeriesSet> {
    let document: Value = serde_json::from_slice(bytes)?;
    from_value(&document)
}

/// Decode an already parsed PI JSON document.
pub fn from_value(document: &Value) -> Result<TimeSeriesSet> {
    let root = document
        .as_object()
        .ok_or_else(|| Error::format("PI JSON document must be an object"))?;

    let version = match root.get("version") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    };
    let time_zone = match root.get("timeZone") {
        None | Some(Value::Null) => None,
        Some(tz) => Some(value_to_f64("timeZone", tz)?),
    };

    let time_series = match root.get("timeSeries") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| series_from_value(item, time_zone))
            .collect::<Result<Vec<_>>>()?,
        Some(other) => {
            return Err(Error::format(format!(
                "timeSeries must be an array, got {}",
                other
            )));
        }
    };

    Ok(TimeSeriesSet {
        version,
        time_zone,
        time_series,
    })
}

fn series_from_value(item: &Value, time_zone: Option<f64>) -> Result<TimeSeries> {
    let header = item
        .get("header")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::format("time series without header object"))?;
    let header = Header::from_wire(header)?;

    let events = match item.get("events") {
        None | Some(Value::Null) => Events::new(),
        Some(Value::Array(rows)) => rows
            .iter()
            .map(|row| {
                let row = row.as_object().ok_or_else(|| {
                    Error::format(format!(
                        "event of {}/{} is not an object",
                        header.location_id, header.parameter_id
                    ))
                })?;
                Event::from_wire(row, time_zone)
            })
            .collect::<Result<Events>>()?
            .without_missing(&header),
        Some(other) => {
            return Err(Error::format(format!("events must be an array, got {}", other)));
        }
    };

    Ok(TimeSeries::new(header, events))
}

/// Inverse of `from_value`. Event times are shifted forward by the set's
/// time zone so decoding the result yields the same timestamps.
pub fn to_value(set: &TimeSeriesSet) -> Value {
    let mut root = Map::new();
    if let Some(version) = &set.version {
        root.insert("version".into(), Value::from(version.as_str()));
    }
    if let Some(tz) = set.time_zone {
        root.insert("timeZone".into(), Value::from(format_number(tz)));
    }
    let series: Vec<Value> = set
        .time_series
        .iter()
        .map(|ts| {
            let mut item = Map::new();
            item.insert("header".into(), Value::Object(ts.header.to_wire()));
            if !ts.events.is_empty() {
                let events = ts
                    .events
                    .iter()
                    .map(|e| Value::Object(e.to_wire(set.time_zone)))
                    .collect();
                item.insert("events".into(), Value::Array(events));
            }
            Value::Object(item)
        })
        .collect();
    root.insert("timeSeries".into(), Value::Array(series));
    Value::Object(root)
}

/// Encode as pretty-printed PI JSON bytes.
pub fn encode(set: &TimeSeriesSet) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(&to_value(set))?)
}
