//! Writing a new cache generation and publishing its manifest.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cache::manifest::{DEFAULT_MAX_CACHE_COUNT, Manifest};
use crate::error::{Error, Result};
use crate::io::{PARAMETER_PLACEHOLDER, columnar, file_name_part, parameter_file_name};
use crate::logging::{Component, Observer};
use crate::model::{DEFAULT_FLAG_THRESHOLD, FlatTable, TimeSeriesSet, to_flat_table};

/// Default manifest file name under the cache root.
pub const DEFAULT_MANIFEST_NAME: &str = "manifest.json";

/// On-disk format of cache data files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFileFormat {
    #[default]
    Parquet,
    NetCdf,
}

impl DataFileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            DataFileFormat::Parquet => "parquet",
            DataFileFormat::NetCdf => "nc",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub manifest_name: String,
    pub max_cache_count: usize,
    pub file_format: DataFileFormat,
    pub flag_threshold: i32,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            manifest_name: DEFAULT_MANIFEST_NAME.to_string(),
            max_cache_count: DEFAULT_MAX_CACHE_COUNT,
            file_format: DataFileFormat::default(),
            flag_threshold: DEFAULT_FLAG_THRESHOLD,
        }
    }
}

/// `{filter}_{parameter_id}.{ext}` with the filter id escaped.
fn file_template(filter_id: &str, format: DataFileFormat) -> String {
    format!(
        "{}_{}.{}",
        file_name_part(filter_id),
        PARAMETER_PLACEHOLDER,
        format.extension()
    )
}

/// Fail before anything is written when two inputs would land in the same
/// file.
fn check_file_names(tables: &[(&str, FlatTable)], format: DataFileFormat) -> Result<()> {
    let mut owners: HashMap<String, (&str, String)> = HashMap::new();
    for (filter_id, table) in tables {
        let template = file_template(filter_id, format);
        for parameter_id in table.parameter_ids() {
            let name = parameter_file_name(&template, &parameter_id);
            if let Some((other_filter, other_parameter)) = owners.get(&name) {
                return Err(Error::Conflict(format!(
                    "filter '{}' parameter '{}' and filter '{}' parameter '{}' both map to {}",
                    other_filter, other_parameter, filter_id, parameter_id, name
                )));
            }
            owners.insert(name, (*filter_id, parameter_id));
        }
    }
    Ok(())
}

fn write_data_files(
    table: &FlatTable,
    out_dir: &Path,
    template: &str,
    format: DataFileFormat,
) -> Result<Vec<PathBuf>> {
    match format {
        DataFileFormat::Parquet => columnar::write_parameter_files(table, out_dir, template),
        DataFileFormat::NetCdf => write_netcdf_files(table, out_dir, template),
    }
}

#[cfg(feature = "netcdf")]
fn write_netcdf_files(table: &FlatTable, out_dir: &Path, template: &str) -> Result<Vec<PathBuf>> {
    use crate::io::netcdf;
    netcdf::write_netcdf(
        table,
        out_dir,
        &netcdf::default_global_attributes(),
        template,
    )
}

#[cfg(not(feature = "netcdf"))]
fn write_netcdf_files(_: &FlatTable, out_dir: &Path, _: &str) -> Result<Vec<PathBuf>> {
    Err(Error::NetCdf(format!(
        "cannot write NetCDF files to {} without the `netcdf` feature",
        out_dir.display()
    )))
}

/// Load the manifest currently published under `manifest_path`, if any.
fn previous_manifest(manifest_path: &Path, observer: &dyn Observer) -> Option<Manifest> {
    if !manifest_path.exists() {
        return None;
    }
    match Manifest::from_file(manifest_path) {
        Ok(manifest) => Some(manifest),
        Err(err) => {
            observer.warn(
                Component::Manifest,
                Some(&manifest_path.display().to_string()),
                &format!("ignoring unreadable previous manifest: {}", err),
            );
            None
        }
    }
}

/// Write the reliable events of every `(filter_id, set)` input into
/// `root/<generation>/` as one file per filter and parameter, then publish
/// the generation's manifest at `root/<manifest_name>`.
///
/// Retention history and coverage carry over from the previous manifest.
/// Old generations beyond `max_cache_count` are removed after the manifest
/// is in place.
pub fn build_generation(
    root: &Path,
    generation: &str,
    inputs: &[(String, TimeSeriesSet)],
    options: &BuildOptions,
    observer: &dyn Observer,
) -> Result<Manifest> {
    let tables: Vec<(&str, FlatTable)> = inputs
        .iter()
        .map(|(filter_id, set)| {
            (filter_id.as_str(), to_flat_table(set, options.flag_threshold))
        })
        .collect();
    check_file_names(&tables, options.file_format)?;

    fs::create_dir_all(root).map_err(|e| Error::io(root, e))?;
    let gen_dir = root.join(generation);
    fs::create_dir(&gen_dir).map_err(|e| Error::io(&gen_dir, e))?;

    let manifest_path = root.join(&options.manifest_name);
    let mut manifest = Manifest::new(generation);
    manifest.max_cache_count = options.max_cache_count;
    if let Some(previous) = previous_manifest(&manifest_path, observer) {
        manifest.cache_dirs = previous.cache_dirs;
        manifest.current_coverage = previous.current_coverage;
    }
    manifest.filepath = Some(manifest_path.clone());

    for (filter_id, table) in &tables {
        let template = file_template(filter_id, options.file_format);
        let written = write_data_files(table, &gen_dir, &template, options.file_format)?;
        for (path, parameter_id) in written.iter().zip(table.parameter_ids()) {
            let Some(file_name) = path.file_name() else {
                continue;
            };
            manifest.register_file(
                &Path::new(generation).join(file_name),
                Some(*filter_id),
                Some(&parameter_id),
            )?;
        }
        // the span of what was written, in the UTC time of the data files
        manifest
            .current_coverage
            .update_from_timestamps(table.index.iter().copied())?;
        observer.debug(
            Component::Cache,
            Some(*filter_id),
            &format!("wrote {} data files to {}", written.len(), gen_dir.display()),
        );
    }

    let report = manifest.atomic_write(&manifest_path, true)?;
    observer.info(
        Component::Manifest,
        Some(generation),
        &format!(
            "published {} files, retaining {} generations",
            manifest.files.len(),
            manifest.cache_dirs.len()
        ),
    );
    for removed in &report.removed {
        observer.info(
            Component::Manifest,
            Some(generation),
            &format!("removed old cache directory {}", removed.display()),
        );
    }
    for (path, reason) in &report.failed {
        observer.warn(
            Component::Manifest,
            Some(generation),
            &format!("failed to remove {}: {}", path.display(), reason),
        );
    }
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::NullObserver;
    use crate::model::{Event, Events, Header, TimeSeries};
    use chrono::{NaiveDate, NaiveDateTime};
    use tempfile::TempDir;

    fn t(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, day)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn set(days: &[u32]) -> TimeSeriesSet {
        let events: Events = days
            .iter()
            .map(|&d| Event {
                datetime: t(d),
                value: d as f64,
                flag: Some(0),
            })
            .collect();
        let mut set = TimeSeriesSet::new();
        set.time_series
            .push(TimeSeries::new(Header::new("A", "Q.obs"), events));
        set
    }

    #[test]
    fn test_build_registers_files_and_coverage() {
        let dir = TempDir::new().unwrap();
        let manifest = build_generation(
            dir.path(),
            "20250101T000000",
            &[("Hydro/Obs".to_string(), set(&[1, 2, 3]))],
            &BuildOptions::default(),
            &NullObserver,
        )
        .unwrap();

        assert_eq!(manifest.files.len(), 1);
        let entry = manifest.get_entry("Hydro/Obs", "Q.obs").unwrap();
        assert_eq!(
            entry.path,
            PathBuf::from("20250101T000000/Hydro%2FObs_Q.obs.parquet")
        );
        assert_eq!(manifest.current_coverage.start_date, Some(t(1)));
        assert_eq!(manifest.current_coverage.end_date, Some(t(3)));

        let loaded = Manifest::from_file(&dir.path().join(DEFAULT_MANIFEST_NAME)).unwrap();
        assert!(loaded.validate_files().is_ok());
    }

    #[test]
    fn test_build_carries_history_and_prunes() {
        let dir = TempDir::new().unwrap();
        let options = BuildOptions {
            max_cache_count: 2,
            ..BuildOptions::default()
        };
        for (i, generation) in ["20250101T000000", "20250102T000000", "20250103T000000"]
            .iter()
            .enumerate()
        {
            let day = i as u32 + 1;
            build_generation(
                dir.path(),
                generation,
                &[("F".to_string(), set(&[day, day + 1]))],
                &options,
                &NullObserver,
            )
            .unwrap();
        }

        let manifest = Manifest::from_file(&dir.path().join(DEFAULT_MANIFEST_NAME)).unwrap();
        assert_eq!(
            manifest.cache_dirs,
            vec![
                PathBuf::from("20250103T000000"),
                PathBuf::from("20250102T000000"),
            ]
        );
        assert!(!dir.path().join("20250101T000000").exists());
        assert_eq!(manifest.current_coverage.start_date, Some(t(1)));
        assert_eq!(manifest.current_coverage.end_date, Some(t(4)));
    }

    #[test]
    fn test_existing_generation_is_not_overwritten() {
        let dir = TempDir::new().unwrap();
        let inputs = [("F".to_string(), set(&[1, 2]))];
        build_generation(dir.path(), "20250101T000000", &inputs, &BuildOptions::default(), &NullObserver)
            .unwrap();
        assert!(matches!(
            build_generation(dir.path(), "20250101T000000", &inputs, &BuildOptions::default(), &NullObserver),
            Err(Error::Io { .. })
        ));
    }

    #[test]
    fn test_coverage_is_span_of_written_utc_data() {
        let document = r#"{
            "version": "1.32",
            "timeZone": "1.0",
            "timeSeries": [{
                "header": {
                    "type": "instantaneous",
                    "locationId": "A",
                    "parameterId": "Q",
                    "timeStep": {"unit": "second", "multiplier": "7200"},
                    "startDate": {"date": "2022-04-30", "time": "00:00:00"},
                    "endDate": {"date": "2022-05-02", "time": "00:00:00"},
                    "missVal": "-999.0"
                },
                "events": [
                    {"date": "2022-05-01", "time": "01:00:00", "value": "1.0", "flag": "0"},
                    {"date": "2022-05-01", "time": "03:00:00", "value": "2.0", "flag": "0"}
                ]
            }]
        }"#;
        let set = crate::io::json::decode(document.as_bytes()).unwrap();
        let dir = TempDir::new().unwrap();
        let manifest = build_generation(
            dir.path(),
            "20250101T000000",
            &[("F".to_string(), set)],
            &BuildOptions::default(),
            &NullObserver,
        )
        .unwrap();

        let hour = |h| {
            NaiveDate::from_ymd_opt(2022, 5, 1)
                .unwrap()
                .and_hms_opt(h, 0, 0)
                .unwrap()
        };
        assert_eq!(manifest.current_coverage.start_date, Some(hour(0)));
        assert_eq!(manifest.current_coverage.end_date, Some(hour(2)));

        let data = columnar::read_table(&manifest.resolve(&manifest.files[0].path)).unwrap();
        assert_eq!(data.index, vec![hour(0), hour(2)]);
    }

    #[test]
    fn test_parameter_id_with_path_separator() {
        let mut input = TimeSeriesSet::new();
        input.time_series.push(TimeSeries::new(
            Header::new("A", "Q [m3/s]"),
            Events(vec![Event {
                datetime: t(1),
                value: 1.0,
                flag: None,
            }]),
        ));
        let dir = TempDir::new().unwrap();
        let manifest = build_generation(
            dir.path(),
            "20250101T000000",
            &[("F".to_string(), input)],
            &BuildOptions::default(),
            &NullObserver,
        )
        .unwrap();

        let entry = manifest.get_entry("F", "Q [m3/s]").unwrap();
        assert_eq!(
            entry.path,
            PathBuf::from("20250101T000000/F_Q [m3%2Fs].parquet")
        );
        assert!(manifest.validate_files().is_ok());
    }

    #[test]
    fn test_colliding_file_names_are_rejected_before_writing() {
        let dir = TempDir::new().unwrap();
        let inputs = [
            ("Hydro_Obs".to_string(), set(&[1])),
            ("Hydro".to_string(), {
                let mut other = set(&[2]);
                other.time_series[0].header.parameter_id = "Obs_Q.obs".to_string();
                other
            }),
        ];
        assert!(matches!(
            build_generation(dir.path(), "20250101T000000", &inputs, &BuildOptions::default(), &NullObserver),
            Err(Error::Conflict(_))
        ));
        assert!(!dir.path().join("20250101T000000").exists());

        // distinct ids that only differ in a separator stay apart
        let inputs = [
            ("Hydro_Obs".to_string(), set(&[1])),
            ("Hydro/Obs".to_string(), set(&[2])),
        ];
        let manifest = build_generation(
            dir.path(),
            "20250101T000000",
            &inputs,
            &BuildOptions::default(),
            &NullObserver,
        )
        .unwrap();
        assert_eq!(manifest.files.len(), 2);
        assert_ne!(
            manifest.get_entry("Hydro_Obs", "Q.obs").unwrap().sha256,
            manifest.get_entry("Hydro/Obs", "Q.obs").unwrap().sha256
        );
    }
}
