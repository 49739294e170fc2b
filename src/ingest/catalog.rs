//! PI-REST catalog documents: locations, parameters, filters, qualifiers and
//! the service time zone.
//!
//! Records are returned as the service sends them, with keys in snake_case.
//! Coordinates stay plain numbers; geometry and CRS handling belong to the
//! caller.

use std::collections::HashSet;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event as XmlEvent};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::conversions::camel_to_snake_case;
use crate::error::{Error, Result};

/// One catalog record with snake_case keys.
pub type Record = Map<String, Value>;

fn document(bytes: &[u8], what: &str) -> Result<Map<String, Value>> {
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Object(map) => Ok(map),
        _ => Err(Error::format(format!("{} document is not a JSON object", what))),
    }
}

fn snake_case_keys(record: Map<String, Value>) -> Record {
    record
        .into_iter()
        .map(|(key, value)| (camel_to_snake_case(&key), value))
        .collect()
}

// ---------------------------------------------------------------------------
// Locations
// ---------------------------------------------------------------------------

/// Locations known to a filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Locations {
    /// Datum of the `x` / `y` coordinates as named by the service.
    pub geo_datum: Option<String>,
    pub locations: Vec<Record>,
}

impl Locations {
    pub fn location_ids(&self) -> Vec<&str> {
        self.locations
            .iter()
            .filter_map(|r| r.get("location_id").and_then(Value::as_str))
            .collect()
    }

    /// Keep the first record of every location id.
    pub fn dedup(&mut self) {
        let mut seen = HashSet::new();
        self.locations.retain(|record| {
            match record.get("location_id").and_then(Value::as_str) {
                Some(id) => seen.insert(id.to_string()),
                None => true,
            }
        });
    }
}

/// Values of the location attributes named in `ids`, in that order.
/// `Null` where a location does not carry an attribute.
fn attribute_values(attributes: Option<&Value>, ids: &[String]) -> Vec<Value> {
    let listed: Vec<&Map<String, Value>> = attributes
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default();
    ids.iter()
        .map(|id| {
            listed
                .iter()
                .find(|a| a.get("id").and_then(Value::as_str) == Some(id.as_str()))
                .and_then(|a| a.get("value").cloned())
                .unwrap_or(Value::Null)
        })
        .collect()
}

/// Decode a `locations` document.
///
/// The raw `attributes` list of every location is replaced by one field per
/// id in `attributes`.
pub fn decode_locations(bytes: &[u8], attributes: &[String]) -> Result<Locations> {
    let mut doc = document(bytes, "locations")?;
    let items = match doc.remove("locations") {
        Some(Value::Array(items)) => items,
        _ => return Err(Error::format("locations document has no 'locations' list")),
    };

    let mut locations = Vec::with_capacity(items.len());
    for item in items {
        let Value::Object(raw) = item else {
            return Err(Error::format("location entry is not an object"));
        };
        let mut record = snake_case_keys(raw);
        let listed = record.remove("attributes");
        for (id, value) in attributes.iter().zip(attribute_values(listed.as_ref(), attributes)) {
            record.insert(id.clone(), value);
        }
        locations.push(record);
    }

    Ok(Locations {
        geo_datum: doc
            .get("geoDatum")
            .and_then(Value::as_str)
            .map(String::from),
        locations,
    })
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// A time series parameter as listed by `parameters`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parameter_type: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub display_unit: Option<String>,
    #[serde(default, deserialize_with = "text_flag")]
    pub uses_datum: bool,
    #[serde(default)]
    pub parameter_group: Option<String>,
}

/// `"true"` / `"false"` text, as the service writes booleans.
fn text_flag<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    })
}

/// Decode a `parameters` document. A document without parameters is empty.
pub fn decode_parameters(bytes: &[u8]) -> Result<Vec<Parameter>> {
    let mut doc = document(bytes, "parameters")?;
    match doc.remove("timeSeriesParameters") {
        Some(items) => Ok(serde_json::from_value(items)?),
        None => Ok(Vec::new()),
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Decode a `filters` document. Filters nest, so they stay raw JSON.
pub fn decode_filters(bytes: &[u8]) -> Result<Vec<Value>> {
    let mut doc = document(bytes, "filters")?;
    match doc.remove("filters") {
        Some(Value::Array(filters)) => Ok(filters),
        Some(_) => Err(Error::format("'filters' is not a list")),
        None => Ok(Vec::new()),
    }
}

// ---------------------------------------------------------------------------
// Qualifiers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Qualifier {
    pub id: String,
    pub name: Option<String>,
    pub group_id: Option<String>,
}

fn xml_err(e: impl std::fmt::Display) -> Error {
    Error::Format(format!("invalid qualifiers XML: {}", e))
}

fn qualifier_id(element: &BytesStart<'_>) -> Result<String> {
    for attr in element.attributes() {
        let attr = attr.map_err(xml_err)?;
        if attr.key.local_name().as_ref() == b"id" {
            return Ok(attr.unescape_value().map_err(xml_err)?.into_owned());
        }
    }
    Err(Error::format("qualifier without an id attribute"))
}

/// Decode a PI XML `qualifiers` document.
pub fn decode_qualifiers(bytes: &[u8]) -> Result<Vec<Qualifier>> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut qualifiers = Vec::new();
    let mut current: Option<Qualifier> = None;
    let mut field: Option<Vec<u8>> = None;
    let mut text = String::new();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            XmlEvent::Start(e) => match e.local_name().as_ref() {
                b"qualifier" => {
                    current = Some(Qualifier {
                        id: qualifier_id(&e)?,
                        name: None,
                        group_id: None,
                    })
                }
                name @ (b"name" | b"groupId") if current.is_some() => {
                    field = Some(name.to_vec());
                    text.clear();
                }
                _ => {}
            },
            XmlEvent::Empty(e) if e.local_name().as_ref() == b"qualifier" => {
                qualifiers.push(Qualifier {
                    id: qualifier_id(&e)?,
                    name: None,
                    group_id: None,
                });
            }
            XmlEvent::Text(e) if field.is_some() => {
                text.push_str(&e.unescape().map_err(xml_err)?);
            }
            XmlEvent::End(e) => match e.local_name().as_ref() {
                b"qualifier" => qualifiers.extend(current.take()),
                name if field.as_deref() == Some(name) => {
                    if let Some(q) = current.as_mut() {
                        let value = Some(text.trim().to_string());
                        if name == b"name" {
                            q.name = value;
                        } else {
                            q.group_id = value;
                        }
                    }
                    field = None;
                }
                _ => {}
            },
            XmlEvent::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(qualifiers)
}

// ---------------------------------------------------------------------------
// Time zone
// ---------------------------------------------------------------------------

/// Decode a `timezoneid` response: a JSON string or number, an object with a
/// `timeZoneId` field, or plain text.
pub fn decode_timezone_id(bytes: &[u8]) -> Result<String> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::format(format!("timezone response is not UTF-8: {}", e)))?
        .trim();
    let id = match serde_json::from_str::<Value>(text) {
        Ok(Value::String(id)) => id,
        Ok(Value::Number(n)) => n.to_string(),
        Ok(Value::Object(map)) => map
            .get("timeZoneId")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| Error::format("timezone document has no 'timeZoneId'"))?,
        Ok(other) => {
            return Err(Error::format(format!(
                "unexpected timezone document: {}",
                other
            )));
        }
        Err(_) => text.to_string(),
    };
    if id.is_empty() {
        return Err(Error::format("empty timezone response"));
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCATIONS: &str = r#"{
        "geoDatum": "Rijks Driehoekstelsel",
        "locations": [
            {
                "locationId": "KGM154",
                "shortName": "Gemaal Noord",
                "x": "120000.0",
                "y": "480000.0",
                "attributes": [
                    {"id": "MPN_IDENT", "value": "154"},
                    {"id": "OTHER", "value": "x"}
                ]
            },
            {"locationId": "KGM155", "shortName": "Gemaal Zuid", "x": "1", "y": "2"},
            {"locationId": "KGM154", "shortName": "duplicate"}
        ]
    }"#;

    #[test]
    fn test_decode_locations_with_attributes() {
        let attributes = vec!["MPN_IDENT".to_string(), "MPN_BRON".to_string()];
        let mut locations = decode_locations(LOCATIONS.as_bytes(), &attributes).unwrap();
        assert_eq!(locations.geo_datum.as_deref(), Some("Rijks Driehoekstelsel"));
        assert_eq!(locations.location_ids(), vec!["KGM154", "KGM155", "KGM154"]);

        let first = &locations.locations[0];
        assert_eq!(first["short_name"], "Gemaal Noord");
        assert_eq!(first["MPN_IDENT"], "154");
        assert_eq!(first["MPN_BRON"], Value::Null);
        assert!(!first.contains_key("attributes"));
        assert_eq!(locations.locations[1]["MPN_IDENT"], Value::Null);

        locations.dedup();
        assert_eq!(locations.location_ids(), vec!["KGM154", "KGM155"]);
        assert_eq!(locations.locations[0]["short_name"], "Gemaal Noord");
    }

    #[test]
    fn test_locations_without_list_is_format_error() {
        assert!(matches!(
            decode_locations(br#"{"geoDatum": "WGS 1984"}"#, &[]),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_decode_parameters() {
        let doc = br#"{"timeSeriesParameters": [
            {"id": "Q.obs", "name": "Discharge", "parameterType": "instantaneous",
             "unit": "m3/s", "displayUnit": "m3/s", "usesDatum": "false", "parameterGroup": "Q"},
            {"id": "H.obs", "usesDatum": "true"}
        ]}"#;
        let parameters = decode_parameters(doc).unwrap();
        assert_eq!(parameters.len(), 2);
        assert_eq!(parameters[0].unit.as_deref(), Some("m3/s"));
        assert_eq!(parameters[0].parameter_group.as_deref(), Some("Q"));
        assert!(!parameters[0].uses_datum);
        assert!(parameters[1].uses_datum);
        assert_eq!(parameters[1].name, None);

        assert!(decode_parameters(b"{}").unwrap().is_empty());
    }

    #[test]
    fn test_decode_filters_keeps_nesting() {
        let doc = br#"{"filters": [{"id": "Hydro", "child": [{"id": "Hydro/Obs"}]}]}"#;
        let filters = decode_filters(doc).unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0]["child"][0]["id"], "Hydro/Obs");
        assert!(decode_filters(br#"{"version": "1.32"}"#).unwrap().is_empty());
    }

    #[test]
    fn test_decode_qualifiers() {
        let doc = br#"<?xml version="1.0" encoding="UTF-8"?>
<qualifiers xmlns="http://www.wldelft.nl/fews/PI">
    <qualifier id="raw">
        <name>Raw data</name>
        <groupId>quality</groupId>
    </qualifier>
    <qualifier id="hourly"><name>Hourly</name></qualifier>
    <qualifier id="bare"/>
</qualifiers>"#;
        let qualifiers = decode_qualifiers(doc).unwrap();
        assert_eq!(
            qualifiers,
            vec![
                Qualifier {
                    id: "raw".into(),
                    name: Some("Raw data".into()),
                    group_id: Some("quality".into()),
                },
                Qualifier {
                    id: "hourly".into(),
                    name: Some("Hourly".into()),
                    group_id: None,
                },
                Qualifier {
                    id: "bare".into(),
                    name: None,
                    group_id: None,
                },
            ]
        );

        assert!(matches!(
            decode_qualifiers(b"<qualifiers><qualifier><name>x</name></qualifier></qualifiers>"),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_decode_timezone_id() {
        assert_eq!(decode_timezone_id(b"GMT+1\n").unwrap(), "GMT+1");
        assert_eq!(decode_timezone_id(br#""Etc/GMT-1""#).unwrap(), "Etc/GMT-1");
        assert_eq!(
            decode_timezone_id(br#"{"timeZoneId": "Europe/Amsterdam"}"#).unwrap(),
            "Europe/Amsterdam"
        );
        assert!(matches!(decode_timezone_id(b"  "), Err(Error::Format(_))));
        assert!(matches!(decode_timezone_id(b"{}"), Err(Error::Format(_))));
    }
}
