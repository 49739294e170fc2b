//! Configuration loading.
//!
//! Settings come from a TOML file (see `fewspy.toml` at the repository root)
//! with every section optional. `apply_env_overrides` then layers `.env` and
//! process environment variables on top:
//!
//! | variable                 | overrides                  |
//! |--------------------------|----------------------------|
//! | `FEWSPY_URL`             | `service.url`              |
//! | `FEWSPY_CACHE_ROOT`      | `cache.root`               |
//! | `FEWSPY_MAX_CACHE_COUNT` | `cache.max_cache_count`    |

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::cache::build::{BuildOptions, DEFAULT_MANIFEST_NAME, DataFileFormat};
use crate::cache::manifest::DEFAULT_MAX_CACHE_COUNT;
use crate::error::{Error, Result};
use crate::ingest::pi_rest::PiRestClient;
use crate::model::DEFAULT_FLAG_THRESHOLD;

pub const ENV_URL: &str = "FEWSPY_URL";
pub const ENV_CACHE_ROOT: &str = "FEWSPY_CACHE_ROOT";
pub const ENV_MAX_CACHE_COUNT: &str = "FEWSPY_MAX_CACHE_COUNT";

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FewspyConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub reliability: ReliabilityConfig,
}

/// Remote PI-REST service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub url: Option<String>,
    pub timeout_secs: u64,
    /// Verify TLS certificates. Defaults to `true` for `https` urls.
    pub ssl_verify: Option<bool>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            ssl_verify: None,
        }
    }
}

impl ServiceConfig {
    pub fn effective_ssl_verify(&self) -> bool {
        self.ssl_verify.unwrap_or_else(|| {
            self.url
                .as_deref()
                .is_some_and(|url| url.starts_with("https"))
        })
    }

    /// HTTP client for the configured service.
    pub fn client(&self) -> Result<PiRestClient> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| Error::Config(format!("service.url is not set (or {})", ENV_URL)))?;
        PiRestClient::new(
            url,
            Duration::from_secs(self.timeout_secs),
            self.effective_ssl_verify(),
        )
    }
}

/// Local manifest-backed cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub root: PathBuf,
    pub manifest_name: String,
    pub max_cache_count: usize,
    pub file_format: DataFileFormat,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("fewspy_cache"),
            manifest_name: DEFAULT_MANIFEST_NAME.to_string(),
            max_cache_count: DEFAULT_MAX_CACHE_COUNT,
            file_format: DataFileFormat::default(),
        }
    }
}

impl CacheConfig {
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(&self.manifest_name)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReliabilityConfig {
    /// Events with a flag at or above this value are unreliable.
    pub flag_threshold: i32,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            flag_threshold: DEFAULT_FLAG_THRESHOLD,
        }
    }
}

impl FewspyConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.max_cache_count == 0 {
            return Err(Error::Config(
                "cache.max_cache_count must be at least 1".to_string(),
            ));
        }
        if self.cache.manifest_name.is_empty() || self.cache.manifest_name.contains('/') {
            return Err(Error::Config(format!(
                "cache.manifest_name '{}' must be a plain file name",
                self.cache.manifest_name
            )));
        }
        if let Some(url) = &self.service.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::Config(format!(
                    "service.url '{}' must start with http:// or https://",
                    url
                )));
            }
        }
        Ok(())
    }

    /// Options for `cache::build::build_generation`.
    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            manifest_name: self.cache.manifest_name.clone(),
            max_cache_count: self.cache.max_cache_count,
            file_format: self.cache.file_format,
            flag_threshold: self.reliability.flag_threshold,
        }
    }

    /// Apply `FEWSPY_*` overrides from `.env` and the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        dotenv::dotenv().ok();
        self.apply_overrides(|key| env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup(ENV_URL) {
            self.service.url = Some(url);
        }
        if let Some(root) = lookup(ENV_CACHE_ROOT) {
            self.cache.root = PathBuf::from(root);
        }
        if let Some(count) = lookup(ENV_MAX_CACHE_COUNT) {
            self.cache.max_cache_count = count.trim().parse().map_err(|e| {
                Error::Config(format!("{}='{}': {}", ENV_MAX_CACHE_COUNT, count, e))
            })?;
        }
        self.validate()
    }
}

/// Read a TOML configuration file and apply environment overrides.
pub fn load_config(path: &Path) -> Result<FewspyConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let mut config = FewspyConfig::from_toml_str(&text)?;
    config.apply_env_overrides()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = FewspyConfig::from_toml_str("").unwrap();
        assert_eq!(config.service.timeout_secs, 60);
        assert_eq!(config.cache.max_cache_count, 3);
        assert_eq!(config.cache.manifest_name, "manifest.json");
        assert_eq!(config.cache.file_format, DataFileFormat::Parquet);
        assert_eq!(config.reliability.flag_threshold, 6);
        assert!(!config.service.effective_ssl_verify());
    }

    #[test]
    fn test_full_config() {
        let config = FewspyConfig::from_toml_str(
            r#"
            [service]
            url = "https://fews.example.org/FewsWebServices/rest/fewspiservice/v1"
            timeout_secs = 10

            [cache]
            root = "/var/cache/fewspy"
            max_cache_count = 5
            file_format = "netcdf"

            [reliability]
            flag_threshold = 3
            "#,
        )
        .unwrap();
        assert!(config.service.effective_ssl_verify());
        assert_eq!(
            config.cache.manifest_path(),
            PathBuf::from("/var/cache/fewspy/manifest.json")
        );
        let options = config.build_options();
        assert_eq!(options.max_cache_count, 5);
        assert_eq!(options.file_format, DataFileFormat::NetCdf);
        assert_eq!(options.flag_threshold, 3);
    }

    #[test]
    fn test_invalid_configs() {
        assert!(matches!(
            FewspyConfig::from_toml_str("[cache]\nmax_cache_count = 0"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            FewspyConfig::from_toml_str("[service]\nurl = \"ftp://host\""),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            FewspyConfig::from_toml_str("[cache]\nunknown = 1"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let vars = HashMap::from([
            (ENV_URL, "http://localhost:8080/rest"),
            (ENV_MAX_CACHE_COUNT, "7"),
        ]);
        let mut config = FewspyConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.service.url.as_deref(), Some("http://localhost:8080/rest"));
        assert_eq!(config.cache.max_cache_count, 7);
        assert_eq!(config.cache.root, PathBuf::from("fewspy_cache"));
        assert!(config.service.client().is_ok());

        let bad = HashMap::from([(ENV_MAX_CACHE_COUNT, "many")]);
        assert!(matches!(
            config.apply_overrides(|key| bad.get(key).map(|v| v.to_string())),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_client_requires_url() {
        assert!(matches!(
            ServiceConfig::default().client(),
            Err(Error::Config(_))
        ));
    }
}
