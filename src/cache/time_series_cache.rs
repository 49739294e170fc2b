//! Live cache: open datasets of the current generation, swapped atomically
//! when a new manifest is published.
//!
//! Readers take an `Arc` snapshot of the current generation and query it
//! without locks. A refresh loads the next generation off to the side and
//! publishes it with a single `ArcSwap::store`; the previous generation is
//! released when its last reader drops the snapshot.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use arc_swap::ArcSwap;
use chrono::NaiveDateTime;
use parking_lot::Mutex;

use crate::cache::dataset::{dataset_key, open_dataset};
use crate::cache::manifest::Manifest;
use crate::error::{Error, Result};
use crate::io::station::StationFile;
use crate::logging::{Component, Observer};
use crate::model::FlatTable;

/// One published cache generation and its open datasets.
///
/// Every listed file is opened when the generation is built and the set of
/// datasets never changes afterwards.
#[derive(Debug)]
pub struct CacheGeneration {
    manifest: Arc<Manifest>,
    manifest_mtime: Option<SystemTime>,
    datasets: HashMap<String, Arc<StationFile>>,
    common_time_axis: OnceLock<Arc<[NaiveDateTime]>>,
}

impl CacheGeneration {
    /// Open every file the manifest lists.
    fn open(manifest: Manifest, manifest_mtime: Option<SystemTime>) -> Result<Self> {
        let mut datasets = HashMap::with_capacity(manifest.files.len());
        for entry in &manifest.files {
            let path = manifest.resolve(&entry.path);
            datasets.insert(dataset_key(&path), open_dataset(&path)?);
        }
        Ok(Self {
            manifest: Arc::new(manifest),
            manifest_mtime,
            datasets,
            common_time_axis: OnceLock::new(),
        })
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    pub fn manifest_mtime(&self) -> Option<SystemTime> {
        self.manifest_mtime
    }

    /// Keys of the open datasets, sorted.
    pub fn dataset_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.datasets.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn n_datasets(&self) -> usize {
        self.datasets.len()
    }

    fn dataset(&self, path: &Path) -> Result<&StationFile> {
        let key = dataset_key(path);
        self.datasets
            .get(&key)
            .map(Arc::as_ref)
            .ok_or_else(|| Error::NotFound(format!("dataset {} is not open", key)))
    }

    fn get_time_series(
        &self,
        filter_id: &str,
        parameter_id: &str,
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
        location_ids: Option<&[String]>,
    ) -> Result<FlatTable> {
        let entry = self.manifest.get_entry(filter_id, parameter_id)?;
        let dataset = self.dataset(&self.manifest.resolve(&entry.path))?;
        dataset.select(parameter_id, start, end, location_ids)
    }

    fn common_time_axis(&self) -> Result<Arc<[NaiveDateTime]>> {
        if let Some(axis) = self.common_time_axis.get() {
            return Ok(Arc::clone(axis));
        }
        if self.datasets.is_empty() {
            return Err(Error::EmptyCache);
        }
        let union: BTreeSet<NaiveDateTime> = self
            .datasets
            .values()
            .flat_map(|d| d.time.iter().copied())
            .collect();
        Ok(Arc::clone(
            self.common_time_axis
                .get_or_init(|| union.into_iter().collect()),
        ))
    }
}

fn manifest_mtime(path: &Path) -> Result<SystemTime> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| Error::io(path, e))
}

/// Load, validate and open the generation described by the manifest at `path`.
fn load_generation(path: &Path, mtime: SystemTime) -> Result<CacheGeneration> {
    let manifest = Manifest::from_file(path)?;
    manifest.validate_files()?;
    CacheGeneration::open(manifest, Some(mtime))
}

/// Manifest-backed cache of open datasets with live generation swapping.
pub struct TimeSeriesCache {
    state: ArcSwap<CacheGeneration>,
    refresh_lock: Mutex<()>,
    observer: Arc<dyn Observer>,
}

impl std::fmt::Debug for TimeSeriesCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeSeriesCache")
            .field("generation", &self.state.load().manifest.current_cache)
            .finish_non_exhaustive()
    }
}

impl TimeSeriesCache {
    /// Open every file listed by an in-memory manifest.
    pub fn new(manifest: Manifest, observer: Arc<dyn Observer>) -> Result<Self> {
        let mtime = match &manifest.filepath {
            Some(path) => manifest_mtime(path).ok(),
            None => None,
        };
        let generation = CacheGeneration::open(manifest, mtime)?;
        observer.info(
            Component::Cache,
            Some(&generation.manifest.current_cache),
            &format!("opened {} datasets", generation.n_datasets()),
        );
        Ok(Self {
            state: ArcSwap::from_pointee(generation),
            refresh_lock: Mutex::new(()),
            observer,
        })
    }

    /// Load and validate the manifest at `path`, then open its files.
    pub fn from_manifest_file(path: &Path, observer: Arc<dyn Observer>) -> Result<Self> {
        let mtime = manifest_mtime(path)?;
        let generation = load_generation(path, mtime)?;
        observer.info(
            Component::Cache,
            Some(&generation.manifest.current_cache),
            &format!(
                "loaded {} with {} datasets",
                path.display(),
                generation.n_datasets()
            ),
        );
        Ok(Self {
            state: ArcSwap::from_pointee(generation),
            refresh_lock: Mutex::new(()),
            observer,
        })
    }

    /// Consistent view of the current generation.
    pub fn snapshot(&self) -> Arc<CacheGeneration> {
        self.state.load_full()
    }

    pub fn manifest(&self) -> Arc<Manifest> {
        Arc::clone(&self.state.load().manifest)
    }

    /// Swap to the manifest at `path` if it changed since the current
    /// generation was loaded.
    ///
    /// Returns `Ok(true)` when a new generation was published. A manifest
    /// that fails to load, validate or open is logged and leaves the current
    /// generation in place (`Ok(false)`). Only a failure to stat `path`
    /// propagates.
    pub fn refresh_if_changed(&self, path: &Path) -> Result<bool> {
        let _guard = self.refresh_lock.lock();

        let mtime = manifest_mtime(path)?;
        let current = self.state.load_full();
        let same_file = current.manifest.filepath.as_deref() == Some(path);
        if same_file && current.manifest_mtime == Some(mtime) {
            return Ok(false);
        }

        let subject = path.display().to_string();
        let next = match load_generation(path, mtime) {
            Ok(next) => next,
            Err(err) => {
                self.observer.warn(
                    Component::Cache,
                    Some(&subject),
                    &format!(
                        "refresh failed, keeping generation {}: {}",
                        current.manifest.current_cache, err
                    ),
                );
                return Ok(false);
            }
        };

        let message = format!(
            "swapping generation {} -> {} ({} datasets)",
            current.manifest.current_cache,
            next.manifest.current_cache,
            next.n_datasets()
        );
        self.state.store(Arc::new(next));
        self.observer.info(Component::Cache, Some(&subject), &message);

        let previous = current.manifest.current_cache.clone();
        drop(current);
        self.observer.debug(
            Component::Cache,
            Some(&previous),
            "released previous generation handle",
        );
        Ok(true)
    }

    /// Slice `(filter_id, parameter_id)` from the current generation.
    ///
    /// The time range is inclusive. Unknown locations are `NotFound`.
    pub fn get_time_series(
        &self,
        filter_id: &str,
        parameter_id: &str,
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
        location_ids: Option<&[String]>,
    ) -> Result<FlatTable> {
        self.state
            .load()
            .get_time_series(filter_id, parameter_id, start, end, location_ids)
    }

    /// Sorted union of the time axes of every open dataset.
    pub fn common_time_axis(&self) -> Result<Arc<[NaiveDateTime]>> {
        self.state.load().common_time_axis()
    }

    /// Absolute paths of the current generation's files.
    pub fn file_paths(&self) -> Vec<PathBuf> {
        let generation = self.state.load();
        generation
            .manifest
            .files
            .iter()
            .map(|f| generation.manifest.resolve(&f.path))
            .collect()
    }
}
