//! Codec integration tests
//!
//! Decode PI documents through the public dispatcher and carry them through
//! the other formats, checking that headers and reliable values survive.

use chrono::{NaiveDate, NaiveDateTime};
use tempfile::TempDir;

use fewspy::io::{columnar, json, xml};
use fewspy::model::{DEFAULT_FLAG_THRESHOLD, reliable_events, to_flat_table};
use fewspy::{DocumentFormat, Error, Payload, decode};

const PI_JSON: &str = r#"{
    "version": "1.32",
    "timeZone": "1.0",
    "timeSeries": [
        {
            "header": {
                "type": "instantaneous",
                "moduleInstanceId": "ImportTelemetry",
                "locationId": "KGM154",
                "parameterId": "WATHTE",
                "qualifierId": ["validated"],
                "timeStep": {"unit": "second", "multiplier": "3600"},
                "startDate": {"date": "2022-05-01", "time": "01:00:00"},
                "endDate": {"date": "2022-05-01", "time": "04:00:00"},
                "missVal": "-999.0",
                "stationName": "Gemaal Noord",
                "lat": "52.1",
                "lon": "5.2",
                "units": "m"
            },
            "events": [
                {"date": "2022-05-01", "time": "01:00:00", "value": "1.25", "flag": "0"},
                {"date": "2022-05-01", "time": "02:00:00", "value": "-999.0", "flag": "0"},
                {"date": "2022-05-01", "time": "03:00:00", "value": "1.75", "flag": "8"},
                {"date": "2022-05-01", "time": "04:00:00", "value": "2.0", "flag": "2"}
            ]
        },
        {
            "header": {
                "type": "accumulative",
                "locationId": "KGM155",
                "parameterId": "Q",
                "timeStep": {"unit": "nonequidistant"},
                "missVal": "NaN"
            },
            "events": [
                {"date": "2022-05-01", "time": "02:00:00", "value": "0.5"},
                {"date": "2022-05-01", "time": "03:00:00", "value": "NaN"}
            ]
        }
    ]
}"#;

fn t(hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2022, 5, 1)
        .unwrap()
        .and_hms_opt(hour, 0, 0)
        .unwrap()
}

#[test]
fn test_json_decode_drops_missing_and_shifts_time_zone() {
    let set = decode(Payload::Bytes(PI_JSON.as_bytes()), DocumentFormat::PiJson).unwrap();
    assert_eq!(set.len(), 2);
    assert_eq!(set.time_zone, Some(1.0));

    let first = &set.time_series[0];
    assert_eq!(first.events.len(), 3);
    assert_eq!(first.events.0[0].datetime, t(0));
    assert_eq!(first.header.lat, Some(52.1));

    // NaN is the missing value of the second series
    assert_eq!(set.time_series[1].events.len(), 1);

    let reliable = reliable_events(&first.events, DEFAULT_FLAG_THRESHOLD);
    assert_eq!(
        reliable.iter().map(|e| e.value).collect::<Vec<_>>(),
        vec![1.25, 2.0]
    );
}

#[test]
fn test_decode_from_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("series.json");
    std::fs::write(&path, PI_JSON).unwrap();
    let from_path = decode(Payload::Path(&path), DocumentFormat::PiJson).unwrap();
    let from_bytes = decode(Payload::Bytes(PI_JSON.as_bytes()), DocumentFormat::PiJson).unwrap();
    assert_eq!(from_path.len(), from_bytes.len());
    assert_eq!(from_path.time_series[0], from_bytes.time_series[0]);

    assert!(matches!(
        decode(Payload::Path(&dir.path().join("absent.json")), DocumentFormat::PiJson),
        Err(Error::Io { .. })
    ));
}

#[test]
fn test_json_to_xml_preserves_headers_and_values() {
    let set = decode(Payload::Bytes(PI_JSON.as_bytes()), DocumentFormat::PiJson).unwrap();
    let xml_bytes = xml::encode(&set).unwrap();
    let back = decode(Payload::Bytes(&xml_bytes), DocumentFormat::PiXml).unwrap();

    assert_eq!(back.version, set.version);
    assert_eq!(back.time_zone, set.time_zone);
    assert_eq!(back.len(), set.len());
    for (a, b) in set.time_series.iter().zip(&back.time_series) {
        assert_eq!(a.header.location_id, b.header.location_id);
        assert_eq!(a.header.parameter_id, b.header.parameter_id);
        assert_eq!(a.header.time_step, b.header.time_step);
        assert_eq!(a.header.qualifier_id, b.header.qualifier_id);
        assert_eq!(a.events, b.events);
    }
}

#[test]
fn test_json_encode_round_trip() {
    let set = decode(Payload::Bytes(PI_JSON.as_bytes()), DocumentFormat::PiJson).unwrap();
    let json_bytes = json::encode(&set).unwrap();
    let back = decode(Payload::Bytes(&json_bytes), DocumentFormat::PiJson).unwrap();
    assert_eq!(back.version, set.version);
    assert_eq!(back.time_series[0], set.time_series[0]);
    // NaN sentinels never compare equal, check them separately
    assert!(back.time_series[1].header.miss_val.is_some_and(f64::is_nan));
    assert_eq!(back.time_series[1].events, set.time_series[1].events);
}

#[test]
fn test_columnar_pair_round_trip() {
    let dir = TempDir::new().unwrap();
    let data_file = dir.path().join("data").join("series.parquet");
    let set = decode(Payload::Bytes(PI_JSON.as_bytes()), DocumentFormat::PiJson).unwrap();

    columnar::write_columnar(&set, &data_file, DEFAULT_FLAG_THRESHOLD).unwrap();
    assert!(dir.path().join("data").join("series_header.parquet").exists());

    let back = decode(Payload::Path(&data_file), DocumentFormat::Columnar).unwrap();
    assert_eq!(back.version, set.version);
    assert_eq!(back.time_zone, set.time_zone);
    assert_eq!(back.time_series[0].header, set.time_series[0].header);
    assert_eq!(back.time_series[1].header.location_id, "KGM155");
    for (a, b) in set.time_series.iter().zip(&back.time_series) {
        let reliable: Vec<(NaiveDateTime, f64)> = reliable_events(&a.events, DEFAULT_FLAG_THRESHOLD)
            .iter()
            .map(|e| (e.datetime, e.value))
            .collect();
        let restored: Vec<(NaiveDateTime, f64)> =
            b.events.iter().map(|e| (e.datetime, e.value)).collect();
        assert_eq!(reliable, restored);
    }

    assert!(matches!(
        decode(Payload::Bytes(b"parquet"), DocumentFormat::Columnar),
        Err(Error::Format(_))
    ));
}

#[test]
fn test_flat_table_uses_reliable_events_only() {
    let set = decode(Payload::Bytes(PI_JSON.as_bytes()), DocumentFormat::PiJson).unwrap();
    let table = to_flat_table(&set, DEFAULT_FLAG_THRESHOLD).sort();
    assert_eq!(table.n_columns(), 2);
    assert_eq!(table.index, vec![t(0), t(1), t(3)]);

    let wathte = table.select_parameter("WATHTE");
    assert_eq!(wathte.index, vec![t(0), t(3)]);
    assert_eq!(wathte.values[0], vec![Some(1.25), Some(2.0)]);
}

#[cfg(not(feature = "netcdf"))]
#[test]
fn test_netcdf_requires_feature() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("H.nc");
    assert!(matches!(
        decode(Payload::Path(&path), DocumentFormat::NetCdf),
        Err(Error::NetCdf(_))
    ));
    // bytes that are no archive at all are rejected before the feature matters
    assert!(matches!(
        decode(Payload::Bytes(b"PK"), DocumentFormat::NetCdf),
        Err(Error::Format(_))
    ));
}

// Run with `cargo test --features netcdf`.
#[cfg(feature = "netcdf")]
#[test]
fn test_netcdf_files_decode_from_path_and_zipped_content() {
    use std::io::{Cursor, Write};

    use fewspy::io::netcdf::{default_global_attributes, write_netcdf};

    let set = decode(Payload::Bytes(PI_JSON.as_bytes()), DocumentFormat::PiJson).unwrap();
    let table = to_flat_table(&set, DEFAULT_FLAG_THRESHOLD).sort();
    let dir = TempDir::new().unwrap();
    let written = write_netcdf(
        &table,
        dir.path(),
        &default_global_attributes(),
        "Hydro_{parameter_id}.nc",
    )
    .unwrap();
    assert_eq!(written.len(), 2);

    let wathte = written
        .iter()
        .find(|p| p.ends_with("Hydro_WATHTE.nc"))
        .unwrap();
    let from_path = decode(Payload::Path(wathte), DocumentFormat::NetCdf).unwrap();
    assert_eq!(
        from_path.location_ids().into_iter().collect::<Vec<_>>(),
        vec!["KGM154"]
    );

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("export/Hydro_WATHTE.nc", zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(&std::fs::read(wathte).unwrap()).unwrap();
    let content = writer.finish().unwrap().into_inner();

    let zipped = decode(Payload::Bytes(&content), DocumentFormat::NetCdf).unwrap();
    assert_eq!(zipped.location_ids(), from_path.location_ids());
    assert_eq!(zipped.parameter_ids(), from_path.parameter_ids());
}
