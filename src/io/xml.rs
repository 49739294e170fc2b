//! PI XML codec.
//!
//! Reads `<TimeSeries version="..">` documents with an optional `<timeZone>`
//! and any number of `<series>` elements. A series holds one `<header>` whose
//! children are either text elements or attribute-only elements
//! (`<timeStep unit="second" multiplier="900"/>`), followed by attribute-only
//! `<event>` siblings.
//!
//! Unlike the JSON codec, no missing-value filtering is done here. Missing
//! `startDate` / `endDate` are taken from the first and last event.

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event as XmlEvent};
use serde_json::{Map, Value, json};

use crate::conversions::{parse_f64, snake_to_camel_case};
use crate::error::{Error, Result};
use crate::model::{Event, Events, HEADER_FIELDS, Header, TimeSeries, TimeSeriesSet, format_number};

/// Namespace of PI documents.
pub const PI_NAMESPACE: &str = "http://www.wldelft.nl/fews/PI";

fn xml_err(e: impl std::fmt::Display) -> Error {
    Error::Format(format!("invalid PI XML: {}", e))
}

#[derive(Default)]
struct SeriesBuilder {
    header: Map<String, Value>,
    events: Vec<Map<String, Value>>,
}

impl SeriesBuilder {
    fn insert_header_field(&mut self, name: String, value: Value) {
        if name == "qualifierId" {
            // <qualifierId>raw</qualifierId> or <qualifierId id="raw"/>
            let id = match value {
                Value::String(id) => Some(id),
                Value::Object(mut attrs) => match attrs.remove("id") {
                    Some(Value::String(id)) => Some(id),
                    _ => None,
                },
                _ => None,
            };
            if let Some(id) = id {
                let entry = self
                    .header
                    .entry(name)
                    .or_insert_with(|| Value::Array(Vec::new()));
                if let Value::Array(ids) = entry {
                    ids.push(Value::String(id));
                }
            }
        } else {
            self.header.insert(name, value);
        }
    }

    fn finish(mut self, time_zone: Option<f64>) -> Result<TimeSeries> {
        for (field, event) in [("startDate", self.events.first()), ("endDate", self.events.last())] {
            if !self.header.contains_key(field) {
                if let Some(event) = event {
                    self.header.insert(
                        field.to_string(),
                        json!({"date": event.get("date"), "time": event.get("time")}),
                    );
                }
            }
        }

        let header = Header::from_wire(&self.header)?;
        let events = self
            .events
            .iter()
            .map(|e| Event::from_wire(e, time_zone))
            .collect::<Result<Events>>()?;
        Ok(TimeSeries::new(header, events))
    }
}

fn local_name(name: &[u8]) -> String {
    String::from_utf8_lossy(name).into_owned()
}

fn attributes(element: &BytesStart<'_>) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for attr in element.attributes() {
        let attr = attr.map_err(xml_err)?;
        if attr.key.as_ref().starts_with(b"xmlns") {
            continue;
        }
        let key = local_name(attr.key.local_name().as_ref());
        let value = attr.unescape_value().map_err(xml_err)?.into_owned();
        map.insert(key, Value::String(value));
    }
    Ok(map)
}

/// Decode a PI XML document.
pub fn decode(bytes: &[u8]) -> Result<TimeSeriesSet> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut set = TimeSeriesSet::new();
    // raw series are finished once the time zone is known
    let mut finished: Vec<SeriesBuilder> = Vec::new();

    let mut series: Option<SeriesBuilder> = None;
    let mut in_header = false;
    let mut text_field: Option<String> = None;
    let mut text = String::new();
    let mut in_time_zone = false;
    let mut seen_root = false;

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(xml_err)? {
            XmlEvent::Start(e) => {
                let name = local_name(e.local_name().as_ref());
                if !seen_root {
                    seen_root = true;
                    set.version = attributes(&e)?
                        .get("version")
                        .and_then(Value::as_str)
                        .map(String::from);
                } else if name == "timeZone" && series.is_none() {
                    in_time_zone = true;
                    text.clear();
                } else if name == "series" {
                    series = Some(SeriesBuilder::default());
                } else if name == "header" && series.is_some() {
                    in_header = true;
                } else if in_header {
                    let attrs = attributes(&e)?;
                    if attrs.is_empty() {
                        text_field = Some(name);
                        text.clear();
                    } else if let Some(s) = series.as_mut() {
                        s.insert_header_field(name, Value::Object(attrs));
                    }
                } else if name == "event" {
                    if let Some(s) = series.as_mut() {
                        s.events.push(attributes(&e)?);
                    }
                }
            }
            XmlEvent::Empty(e) => {
                let name = local_name(e.local_name().as_ref());
                let attrs = attributes(&e)?;
                if let Some(s) = series.as_mut() {
                    if in_header {
                        let value = if attrs.is_empty() {
                            Value::String(String::new())
                        } else {
                            Value::Object(attrs)
                        };
                        s.insert_header_field(name, value);
                    } else if name == "event" {
                        s.events.push(attrs);
                    }
                } else if !seen_root {
                    seen_root = true;
                    set.version = attrs.get("version").and_then(Value::as_str).map(String::from);
                }
            }
            XmlEvent::Text(e) => {
                if in_time_zone || text_field.is_some() {
                    text.push_str(&e.unescape().map_err(xml_err)?);
                }
            }
            XmlEvent::CData(e) => {
                if in_time_zone || text_field.is_some() {
                    text.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            XmlEvent::End(e) => {
                let name = local_name(e.local_name().as_ref());
                if in_time_zone && name == "timeZone" {
                    in_time_zone = false;
                    set.time_zone = Some(parse_f64("timeZone", &text)?);
                } else if let Some(field) = text_field.take_if(|f| *f == name) {
                    if let Some(s) = series.as_mut() {
                        s.insert_header_field(field, Value::String(text.trim().to_string()));
                    }
                } else if name == "header" {
                    in_header = false;
                } else if name == "series" {
                    if let Some(s) = series.take() {
                        finished.push(s);
                    }
                }
            }
            XmlEvent::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !seen_root {
        return Err(Error::format("PI XML document has no root element"));
    }

    set.time_series = finished
        .into_iter()
        .map(|s| s.finish(set.time_zone))
        .collect::<Result<Vec<_>>>()?;
    Ok(set)
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn write(writer: &mut Writer<Vec<u8>>, event: XmlEvent<'_>) -> Result<()> {
    writer.write_event(event).map_err(xml_err)
}

fn write_text_element(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<()> {
    write(writer, XmlEvent::Start(BytesStart::new(name)))?;
    write(writer, XmlEvent::Text(BytesText::new(text)))?;
    write(writer, XmlEvent::End(BytesEnd::new(name)))
}

fn write_header(writer: &mut Writer<Vec<u8>>, header: &Header) -> Result<()> {
    let wire = header.to_wire();
    write(writer, XmlEvent::Start(BytesStart::new("header")))?;
    for field in HEADER_FIELDS {
        let name = snake_to_camel_case(field);
        match wire.get(&name) {
            Some(Value::String(text)) => write_text_element(writer, &name, text)?,
            Some(Value::Array(items)) => {
                for item in items.iter().filter_map(Value::as_str) {
                    write_text_element(writer, &name, item)?;
                }
            }
            Some(Value::Object(attrs)) => {
                let mut element = BytesStart::new(name.as_str());
                for (key, value) in attrs {
                    if let Some(value) = value.as_str() {
                        element.push_attribute((key.as_str(), value));
                    }
                }
                write(writer, XmlEvent::Empty(element))?;
            }
            _ => {}
        }
    }
    write(writer, XmlEvent::End(BytesEnd::new("header")))
}

/// Encode a set as a PI XML document. Event times are shifted forward by the
/// set's time zone.
pub fn encode(set: &TimeSeriesSet) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 4);
    write(
        &mut writer,
        XmlEvent::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)),
    )?;

    let mut root = BytesStart::new("TimeSeries");
    root.push_attribute(("xmlns", PI_NAMESPACE));
    if let Some(version) = &set.version {
        root.push_attribute(("version", version.as_str()));
    }
    write(&mut writer, XmlEvent::Start(root))?;

    if let Some(tz) = set.time_zone {
        write_text_element(&mut writer, "timeZone", &format_number(tz))?;
    }

    for ts in &set.time_series {
        write(&mut writer, XmlEvent::Start(BytesStart::new("series")))?;
        write_header(&mut writer, &ts.header)?;
        for event in &ts.events {
            let wire = event.to_wire(set.time_zone);
            let mut element = BytesStart::new("event");
            for key in ["date", "time", "value", "flag"] {
                if let Some(value) = wire.get(key).and_then(Value::as_str) {
                    element.push_attribute((key, value));
                }
            }
            write(&mut writer, XmlEvent::Empty(element))?;
        }
        write(&mut writer, XmlEvent::End(BytesEnd::new("series")))?;
    }

    write(&mut writer, XmlEvent::End(BytesEnd::new("TimeSeries")))?;
    Ok(writer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TimeStep, TimeStepUnit};
    use chrono::{NaiveDate, NaiveDateTime};

    fn t(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2022, 5, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    const DOCUMENT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<TimeSeries xmlns="http://www.wldelft.nl/fews/PI" version="1.22">
    <timeZone>1.0</timeZone>
    <series>
        <header>
            <type>instantaneous</type>
            <moduleInstanceId>ImportHydronet</moduleInstanceId>
            <locationId>KGM154</locationId>
            <parameterId>WATHTE</parameterId>
            <qualifierId>raw</qualifierId>
            <qualifierId>hourly</qualifierId>
            <timeStep unit="second" multiplier="900"/>
            <startDate date="2022-05-01" time="01:00:00"/>
            <endDate date="2022-05-01" time="01:30:00"/>
            <missVal>-999.0</missVal>
            <stationName>Kolkgemaal &amp; sluis</stationName>
            <units>m</units>
        </header>
        <event date="2022-05-01" time="01:00:00" value="1.25" flag="0"/>
        <event date="2022-05-01" time="01:15:00" value="-999.0" flag="8"/>
        <event date="2022-05-01" time="01:30:00" value="1.5" flag="0"/>
    </series>
    <series>
        <header>
            <locationId>KGM155</locationId>
            <parameterId>WATHTE</parameterId>
            <timeStep unit="nonequidistant"/>
        </header>
        <event date="2022-05-02" time="06:00:00" value="0.5"/>
        <event date="2022-05-02" time="07:00:00" value="0.75"/>
    </series>
</TimeSeries>"#;

    #[test]
    fn test_decode_pi_xml() {
        let set = decode(DOCUMENT.as_bytes()).unwrap();
        assert_eq!(set.version.as_deref(), Some("1.22"));
        assert_eq!(set.time_zone, Some(1.0));
        assert_eq!(set.len(), 2);

        let first = &set.time_series[0];
        assert_eq!(first.header.location_id, "KGM154");
        assert_eq!(
            first.header.qualifier_id,
            Some(vec!["raw".to_string(), "hourly".to_string()])
        );
        assert_eq!(
            first.header.time_step,
            TimeStep::regular(TimeStepUnit::Second, 900.0).unwrap()
        );
        assert_eq!(first.header.station_name.as_deref(), Some("Kolkgemaal & sluis"));
        // no missing-value filtering for XML
        assert_eq!(first.events.len(), 3);
        assert_eq!(first.events.0[0].datetime, t(1, 0, 0));
    }

    #[test]
    fn test_missing_dates_are_taken_from_events() {
        let set = decode(DOCUMENT.as_bytes()).unwrap();
        let second = &set.time_series[1].header;
        assert_eq!(second.time_step, TimeStep::nonequidistant());
        assert_eq!(second.start_date, Some(t(2, 6, 0)));
        assert_eq!(second.end_date, Some(t(2, 7, 0)));
    }

    #[test]
    fn test_qualifier_ids_in_attribute_form() {
        let doc = r#"<TimeSeries version="1.22"><series><header>
            <locationId>A</locationId>
            <parameterId>Q</parameterId>
            <qualifierId id="raw"/>
            <qualifierId>hourly</qualifierId>
            <qualifierId id="validated"></qualifierId>
        </header></series></TimeSeries>"#;
        let set = decode(doc.as_bytes()).unwrap();
        assert_eq!(
            set.time_series[0].header.qualifier_id,
            Some(vec![
                "raw".to_string(),
                "hourly".to_string(),
                "validated".to_string()
            ])
        );
    }

    #[test]
    fn test_header_without_location_is_format_error() {
        let doc = r#"<TimeSeries><series><header><parameterId>Q</parameterId></header></series></TimeSeries>"#;
        assert!(matches!(decode(doc.as_bytes()), Err(Error::Format(_))));
    }

    #[test]
    fn test_malformed_xml_is_format_error() {
        let doc = r#"<TimeSeries><series><header></series></TimeSeries>"#;
        assert!(matches!(decode(doc.as_bytes()), Err(Error::Format(_))));
    }

    #[test]
    fn test_encode_then_decode() {
        let set = decode(DOCUMENT.as_bytes()).unwrap();
        let bytes = encode(&set).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains(PI_NAMESPACE));
        assert!(text.contains(r#"<timeStep"#));

        let back = decode(&bytes).unwrap();
        assert_eq!(back.version, set.version);
        assert_eq!(back.time_zone, set.time_zone);
        assert_eq!(back.len(), 2);
        assert_eq!(back.time_series[0].header, set.time_series[0].header);
        assert_eq!(back.time_series[0].events, set.time_series[0].events);
        assert_eq!(back.time_series[1].header, set.time_series[1].header);
    }
}
