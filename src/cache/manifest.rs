//! Cache manifest: the registry of data files that make up one cache
//! generation.
//!
//! Lifecycle: a manifest is built or loaded, checked with `validate_files`,
//! and published with `atomic_write`. A published manifest file is only ever
//! replaced by a rename, so readers see either the old or the new document.
//!
//! File paths and generation directories are stored relative to the
//! directory holding the manifest, which keeps a cache root relocatable.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result, ValidationError, Violation};
use crate::model::TimeSeriesSet;

/// `strftime` format of generation identifiers.
pub const CACHE_ID_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Generations kept by default.
pub const DEFAULT_MAX_CACHE_COUNT: usize = 3;

// ---------------------------------------------------------------------------
// File entries
// ---------------------------------------------------------------------------

/// One data file of a generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: PathBuf,
    pub nbytes: u64,
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_id: Option<String>,
}

impl FileEntry {
    /// Size and hash of the file as it is on disk now.
    pub fn from_file(path: &Path) -> Result<Self> {
        let nbytes = fs::metadata(path).map_err(|e| Error::io(path, e))?.len();
        Ok(Self {
            path: path.to_path_buf(),
            nbytes,
            sha256: sha256_file(path)?,
            filter_id: None,
            parameter_id: None,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

/// Hex-encoded SHA-256 of a file's content.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(|e| Error::io(path, e))?;
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// Coverage
// ---------------------------------------------------------------------------

/// Time span covered by the cached data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCoverage")]
pub struct Coverage {
    pub start_date: Option<NaiveDateTime>,
    pub end_date: Option<NaiveDateTime>,
}

#[derive(Deserialize)]
struct RawCoverage {
    #[serde(default)]
    start_date: Option<NaiveDateTime>,
    #[serde(default)]
    end_date: Option<NaiveDateTime>,
}

impl TryFrom<RawCoverage> for Coverage {
    type Error = Error;

    fn try_from(raw: RawCoverage) -> Result<Self> {
        if let (Some(start), Some(end)) = (raw.start_date, raw.end_date) {
            if end <= start {
                return Err(Error::Coverage(format!(
                    "end_date {} must be after start_date {}",
                    end, start
                )));
            }
        }
        Ok(Self {
            start_date: raw.start_date,
            end_date: raw.end_date,
        })
    }
}

impl Coverage {
    /// Widen to include `[start, end]`. Never shrinks.
    pub fn update_coverage(&mut self, start: NaiveDateTime, end: NaiveDateTime) -> Result<()> {
        if end <= start {
            return Err(Error::Coverage(format!(
                "end_date {} must be after start_date {}",
                end, start
            )));
        }
        self.start_date = Some(self.start_date.map_or(start, |s| s.min(start)));
        self.end_date = Some(self.end_date.map_or(end, |e| e.max(end)));
        Ok(())
    }

    /// Widen with the span of `timestamps`. A single instant only widens an
    /// existing coverage.
    pub fn update_from_timestamps(
        &mut self,
        timestamps: impl IntoIterator<Item = NaiveDateTime>,
    ) -> Result<()> {
        let mut span: Option<(NaiveDateTime, NaiveDateTime)> = None;
        for datetime in timestamps {
            span = Some(match span {
                None => (datetime, datetime),
                Some((lo, hi)) => (lo.min(datetime), hi.max(datetime)),
            });
        }

        match span {
            Some((start, end)) if end > start => self.update_coverage(start, end),
            Some((instant, _)) => {
                if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
                    self.start_date = Some(start.min(instant));
                    self.end_date = Some(end.max(instant));
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Widen with the event timestamps of a time-series set.
    ///
    /// Header start and end dates are not used: they describe the requested
    /// period in document time, not the data that was decoded.
    pub fn update_from_time_series_set(&mut self, set: &TimeSeriesSet) -> Result<()> {
        self.update_from_timestamps(
            set.time_series
                .iter()
                .flat_map(|ts| ts.events.iter().map(|e| e.datetime)),
        )
    }
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

fn default_max_cache_count() -> usize {
    DEFAULT_MAX_CACHE_COUNT
}

fn default_fewspy_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Directories removed (or not) by `clean_cache_dirs`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Where the manifest was read from or last written to.
    #[serde(skip)]
    pub filepath: Option<PathBuf>,
    pub current_cache: String,
    #[serde(default)]
    pub expected_file_count: usize,
    #[serde(default = "default_max_cache_count")]
    pub max_cache_count: usize,
    /// Retained generation directories, newest first, relative to the
    /// manifest directory.
    #[serde(default)]
    pub cache_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub current_coverage: Coverage,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    #[serde(default = "default_fewspy_version")]
    pub fewspy_version: String,
}

impl Manifest {
    pub fn new(current_cache: impl Into<String>) -> Self {
        Self {
            filepath: None,
            current_cache: current_cache.into(),
            expected_file_count: 0,
            max_cache_count: DEFAULT_MAX_CACHE_COUNT,
            cache_dirs: Vec::new(),
            current_coverage: Coverage::default(),
            files: Vec::new(),
            fewspy_version: default_fewspy_version(),
        }
    }

    /// Generation identifier for a timestamp, e.g. `20250101T000000`.
    pub fn current_cache_from_datetime(datetime: &NaiveDateTime) -> String {
        datetime.format(CACHE_ID_FORMAT).to_string()
    }

    pub fn current_cache_datetime(&self) -> Result<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.current_cache, CACHE_ID_FORMAT).map_err(|e| {
            Error::parse(format!(
                "generation id '{}' is not {}: {}",
                self.current_cache, CACHE_ID_FORMAT, e
            ))
        })
    }

    /// Directory holding the manifest file.
    pub fn root_dir(&self) -> Option<&Path> {
        self.filepath.as_deref().and_then(Path::parent)
    }

    pub fn current_cache_dir(&self) -> Option<PathBuf> {
        self.root_dir().map(|root| root.join(&self.current_cache))
    }

    /// Absolute location of a registered path.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        match self.root_dir() {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let mut manifest: Manifest = serde_json::from_str(&text)?;
        manifest.filepath = Some(path.to_path_buf());
        Ok(manifest)
    }

    /// Check file count, existence, size and hash of every entry.
    ///
    /// Every violation is collected before failing. No side effects.
    pub fn validate_files(&self) -> Result<()> {
        let mut violations = Vec::new();

        if self.files.len() != self.expected_file_count {
            violations.push(Violation::FileCount {
                expected: self.expected_file_count,
                actual: self.files.len(),
            });
        }

        for entry in &self.files {
            let path = self.resolve(&entry.path);
            let Ok(metadata) = fs::metadata(&path) else {
                violations.push(Violation::Missing { path });
                continue;
            };
            if metadata.len() != entry.nbytes {
                violations.push(Violation::SizeMismatch {
                    path,
                    expected: entry.nbytes,
                    actual: metadata.len(),
                });
                continue;
            }
            let actual = match sha256_file(&path) {
                Ok(actual) => actual,
                Err(err) => {
                    let reason = match err {
                        Error::Io { source, .. } => source.to_string(),
                        other => other.to_string(),
                    };
                    violations.push(Violation::Unreadable { path, reason });
                    continue;
                }
            };
            if actual != entry.sha256 {
                violations.push(Violation::HashMismatch {
                    path,
                    expected: entry.sha256.clone(),
                    actual,
                });
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { violations }.into())
        }
    }

    /// Add the current generation directory if absent and keep the newest
    /// `max_cache_count` directories.
    pub fn update_cache_dirs(&mut self) {
        let current = PathBuf::from(&self.current_cache);
        let present = self
            .cache_dirs
            .iter()
            .any(|d| d.file_name() == current.file_name());
        if !present {
            self.cache_dirs.push(current);
        }
        self.cache_dirs
            .sort_by(|a, b| b.file_name().cmp(&a.file_name()));
        self.cache_dirs.truncate(self.max_cache_count);
    }

    /// Remove every directory under the manifest root that is neither the
    /// current generation nor retained in `cache_dirs`. Removal failures are
    /// reported, not raised.
    pub fn clean_cache_dirs(&self) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        let Some(root) = self.root_dir().map(dir_or_cwd) else {
            return Ok(report);
        };

        let keep: Vec<&std::ffi::OsStr> = self
            .cache_dirs
            .iter()
            .filter_map(|d| d.file_name())
            .chain(std::iter::once(self.current_cache.as_ref()))
            .collect();

        for entry in fs::read_dir(root).map_err(|e| Error::io(root, e))? {
            let entry = entry.map_err(|e| Error::io(root, e))?;
            let path = entry.path();
            if !path.is_dir() || keep.contains(&entry.file_name().as_os_str()) {
                continue;
            }
            match fs::remove_dir_all(&path) {
                Ok(()) => report.removed.push(path),
                Err(e) => report.failed.push((path, e.to_string())),
            }
        }
        Ok(report)
    }

    /// Validate, refresh `cache_dirs`, then atomically replace `path` with
    /// this manifest. Optionally clean old generations afterwards.
    ///
    /// A failure before the rename leaves `path` untouched and removes the
    /// temporary file.
    pub fn atomic_write(&mut self, path: &Path, clean_old_caches: bool) -> Result<CleanupReport> {
        self.atomic_write_with(path, clean_old_caches, |_| Ok(()))
    }

    fn atomic_write_with(
        &mut self,
        path: &Path,
        clean_old_caches: bool,
        before_rename: impl FnOnce(&Path) -> Result<()>,
    ) -> Result<CleanupReport> {
        self.filepath = Some(path.to_path_buf());
        self.validate_files()?;
        self.update_cache_dirs();

        let tmp_path = temp_path(path);
        let mut guard = TempFileGuard::new(tmp_path.clone());
        {
            let json = serde_json::to_string_pretty(self)?;
            let mut file = File::create(&tmp_path).map_err(|e| Error::io(&tmp_path, e))?;
            file.write_all(json.as_bytes())
                .map_err(|e| Error::io(&tmp_path, e))?;
            file.sync_all().map_err(|e| Error::io(&tmp_path, e))?;
        }
        before_rename(&tmp_path)?;
        fs::rename(&tmp_path, path).map_err(|e| Error::io(path, e))?;
        guard.disarm();
        if let Some(parent) = path.parent() {
            sync_dir(dir_or_cwd(parent))?;
        }

        if clean_old_caches {
            self.clean_cache_dirs()
        } else {
            Ok(CleanupReport::default())
        }
    }

    /// Register (or re-register) a file, refreshing its size and hash.
    /// `expected_file_count` follows the registry.
    ///
    /// A path already registered for another filter or parameter is a
    /// `Conflict`.
    pub fn register_file(
        &mut self,
        path: &Path,
        filter_id: Option<&str>,
        parameter_id: Option<&str>,
    ) -> Result<&FileEntry> {
        if let Some(existing) = self.files.iter().find(|f| f.path == path) {
            if existing.filter_id.as_deref() != filter_id
                || existing.parameter_id.as_deref() != parameter_id
            {
                return Err(Error::Conflict(format!(
                    "{} is already registered for filter {:?} and parameter {:?}",
                    path.display(),
                    existing.filter_id,
                    existing.parameter_id
                )));
            }
        }
        let mut entry = FileEntry::from_file(&self.resolve(path))?;
        entry.path = path.to_path_buf();
        entry.filter_id = filter_id.map(String::from);
        entry.parameter_id = parameter_id.map(String::from);

        let idx = match self.files.iter().position(|f| f.path == entry.path) {
            Some(idx) => {
                self.files[idx] = entry;
                idx
            }
            None => {
                self.files.push(entry);
                self.files.len() - 1
            }
        };
        self.expected_file_count = self.files.len();
        Ok(&self.files[idx])
    }

    /// Registry entry of a `(filter_id, parameter_id)` pair.
    pub fn get_entry(&self, filter_id: &str, parameter_id: &str) -> Result<&FileEntry> {
        self.files
            .iter()
            .find(|f| {
                f.filter_id.as_deref() == Some(filter_id)
                    && f.parameter_id.as_deref() == Some(parameter_id)
            })
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no cached file for filter '{}' and parameter '{}'",
                    filter_id, parameter_id
                ))
            })
    }

    /// Whether the manifest was produced by a compatible fewspy release:
    /// same major version (same minor while major is 0).
    pub fn is_compatible(&self) -> bool {
        let ours = version_parts(env!("CARGO_PKG_VERSION"));
        let theirs = version_parts(&self.fewspy_version);
        match (ours, theirs) {
            (Some((0, minor)), Some((0, their_minor))) => minor == their_minor,
            (Some((major, _)), Some((their_major, _))) => major == their_major,
            _ => false,
        }
    }
}

fn version_parts(version: &str) -> Option<(u64, u64)> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().map_or(Some(0), |m| m.parse().ok())?;
    Some((major, minor))
}

fn dir_or_cwd(dir: &Path) -> &Path {
    if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    }
}

/// Flush a directory entry change (a rename) to disk.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| Error::io(dir, e))
}

#[cfg(not(unix))]
fn sync_dir(_: &Path) -> Result<()> {
    Ok(())
}

/// Hidden sibling used for atomic replacement: `dir/.{stem}.tmp.json`.
pub fn temp_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp.json", stem))
}

/// Removes a temporary file on drop unless disarmed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// Keep the file; call after a successful rename.
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}
