//! Field renaming and value coercion shared by every codec.
//!
//! PI documents name header fields in camelCase (`moduleInstanceId`); the
//! in-memory model uses snake_case (`module_instance_id`). Dates arrive as
//! separate `date` and `time` strings and are combined into one naive
//! timestamp here.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;

use crate::error::{Error, Result};

/// Date format used by PI `date` fields, e.g. `2022-05-01`.
pub const PI_DATE_FORMAT: &str = "%Y-%m-%d";

/// Time format used by PI `time` fields, e.g. `00:15:00`.
pub const PI_TIME_FORMAT: &str = "%H:%M:%S";

/// Datetime format accepted by the PI-REST request parameters.
pub const FEWS_REQUEST_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

// ---------------------------------------------------------------------------
// Field renaming
// ---------------------------------------------------------------------------

/// `myInputVariable` -> `my_input_variable`
pub fn camel_to_snake_case(camel_case: &str) -> String {
    let mut out = String::with_capacity(camel_case.len() + 4);
    for c in camel_case.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out.trim_start_matches('_').to_string()
}

/// `my_input_variable` -> `myInputVariable`
pub fn snake_to_camel_case(snake_case: &str) -> String {
    let mut words = snake_case.split('_');
    let mut out = words.next().unwrap_or_default().to_string();
    for word in words {
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            out.push(first.to_ascii_uppercase());
            out.extend(chars);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Date coercion
// ---------------------------------------------------------------------------

/// Combine PI `date` and optional `time` strings into one timestamp.
/// A missing time means midnight.
pub fn combine_date_time(date: &str, time: Option<&str>) -> Result<NaiveDateTime> {
    let date = NaiveDate::parse_from_str(date.trim(), PI_DATE_FORMAT)
        .map_err(|e| Error::parse(format!("invalid date '{}': {}", date, e)))?;
    let time = match time.map(str::trim) {
        None | Some("") => NaiveTime::MIN,
        Some(t) => NaiveTime::parse_from_str(t, "%H:%M:%S%.f")
            .map_err(|e| Error::parse(format!("invalid time '{}': {}", t, e)))?,
    };
    Ok(NaiveDateTime::new(date, time))
}

/// Parse a PI datetime object such as `{"date": "2022-05-01", "time": "00:00:00"}`.
pub fn value_to_datetime(value: &Value) -> Result<NaiveDateTime> {
    let date = value
        .get("date")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::format(format!("datetime object without 'date': {}", value)))?;
    let time = value.get("time").and_then(Value::as_str);
    combine_date_time(date, time)
}

/// Split a timestamp back into PI `date` / `time` strings.
pub fn datetime_to_pi_parts(datetime: &NaiveDateTime) -> (String, String) {
    (
        datetime.format(PI_DATE_FORMAT).to_string(),
        datetime.format(PI_TIME_FORMAT).to_string(),
    )
}

/// Format a timestamp for a PI-REST request, e.g. `2022-05-01T00:00:00Z`.
pub fn datetime_to_fews_str(datetime: &NaiveDateTime) -> String {
    datetime.format(FEWS_REQUEST_FORMAT).to_string()
}

/// Offset of `hours` as a duration, rounded to whole milliseconds.
pub fn hours_to_duration(hours: f64) -> Duration {
    Duration::milliseconds((hours * 3_600_000.0).round() as i64)
}

// ---------------------------------------------------------------------------
// Value coercion
// ---------------------------------------------------------------------------

/// Coerce a JSON string or number into `f64`.
pub fn value_to_f64(field: &str, value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| Error::parse(format!("{} is not a finite number: {}", field, n))),
        Value::String(s) => parse_f64(field, s),
        other => Err(Error::parse(format!("{} is not numeric: {}", field, other))),
    }
}

/// Parse a float, accepting `NaN` the way PI documents write it.
pub fn parse_f64(field: &str, text: &str) -> Result<f64> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("nan") {
        return Ok(f64::NAN);
    }
    text.parse::<f64>()
        .map_err(|e| Error::parse(format!("{} '{}' is not a number: {}", field, text, e)))
}

/// Coerce a JSON string or number into an integer flag.
pub fn value_to_flag(value: &Value) -> Result<i32> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(|f| f as i32)
            .or_else(|| n.as_f64().map(|f| f as i32))
            .ok_or_else(|| Error::parse(format!("flag is not an integer: {}", n))),
        Value::String(s) => s
            .trim()
            .parse::<i32>()
            .map_err(|e| Error::parse(format!("flag '{}' is not an integer: {}", s, e))),
        other => Err(Error::parse(format!("flag is not numeric: {}", other))),
    }
}

/// Strings that are empty (after trimming) become `None`.
pub fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_camel_to_snake() {
        assert_eq!(camel_to_snake_case("moduleInstanceId"), "module_instance_id");
        assert_eq!(camel_to_snake_case("missVal"), "miss_val");
        assert_eq!(camel_to_snake_case("lat"), "lat");
    }

    #[test]
    fn test_snake_to_camel() {
        assert_eq!(snake_to_camel_case("module_instance_id"), "moduleInstanceId");
        assert_eq!(snake_to_camel_case("start_date"), "startDate");
        assert_eq!(snake_to_camel_case("z"), "z");
    }

    #[test]
    fn test_combine_date_time_defaults_to_midnight() {
        let dt = combine_date_time("2022-05-01", None).unwrap();
        assert_eq!(dt.to_string(), "2022-05-01 00:00:00");
        let dt = combine_date_time("2022-05-01", Some("13:15:00")).unwrap();
        assert_eq!(dt.to_string(), "2022-05-01 13:15:00");
    }

    #[test]
    fn test_malformed_date_is_parse_error() {
        let err = combine_date_time("01-05-2022", Some("00:00:00")).unwrap_err();
        assert!(matches!(err, Error::Parse(_)), "got {:?}", err);
        let err = combine_date_time("2022-05-01", Some("25:99")).unwrap_err();
        assert!(matches!(err, Error::Parse(_)), "got {:?}", err);
    }

    #[test]
    fn test_value_to_datetime_requires_date() {
        let err = value_to_datetime(&json!({"time": "00:00:00"})).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_numeric_coercion_accepts_strings_and_numbers() {
        assert_eq!(value_to_f64("lat", &json!("52.1")).unwrap(), 52.1);
        assert_eq!(value_to_f64("lat", &json!(52.1)).unwrap(), 52.1);
        assert!(value_to_f64("miss_val", &json!("NaN")).unwrap().is_nan());
        assert!(matches!(
            value_to_f64("lat", &json!("north")),
            Err(Error::Parse(_))
        ));
        assert_eq!(value_to_flag(&json!("2")).unwrap(), 2);
        assert_eq!(value_to_flag(&json!(0)).unwrap(), 0);
    }

    #[test]
    fn test_hours_to_duration() {
        assert_eq!(hours_to_duration(1.0), Duration::hours(1));
        assert_eq!(hours_to_duration(-5.5), Duration::minutes(-330));
    }

    #[test]
    fn test_fews_request_format() {
        let dt = combine_date_time("2022-05-01", Some("06:00:00")).unwrap();
        assert_eq!(datetime_to_fews_str(&dt), "2022-05-01T06:00:00Z");
    }
}
