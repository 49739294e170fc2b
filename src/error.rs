//! Error types shared by every fewspy module.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result type alias for fewspy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can arise while decoding, caching, or fetching time series.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or unsupported payload shape (missing header fields,
    /// unexpected document layout, unsupported format for a payload kind).
    #[error("format error: {0}")]
    Format(String),

    /// A value could not be coerced (unparsable date, number, or flag).
    #[error("parse error: {0}")]
    Parse(String),

    /// Manifest or file integrity mismatch. Always carries every violation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Query against a cache with zero open datasets.
    #[error("cache holds no open datasets")]
    EmptyCache,

    /// A registry entry, variable, or location that was asked for does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Two registry entries would share one file.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Coverage update rejected.
    #[error("invalid coverage: {0}")]
    Coverage(String),

    /// Filesystem failure.
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("parquet error: {0}")]
    Parquet(String),

    #[error("netcdf error: {0}")]
    NetCdf(String),

    #[error("config error: {0}")]
    Config(String),

    /// Remote service failure: a transport error (`status` is `None`) or a
    /// non-2xx response.
    #[error(
        "HTTP error{}: {message}",
        .status.map(|s| format!(" {}", s)).unwrap_or_default()
    )]
    Http { status: Option<u16>, message: String },
}

impl Error {
    pub(crate) fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn format(message: impl Into<String>) -> Self {
        Error::Format(message.into())
    }

    pub(crate) fn parse(message: impl Into<String>) -> Self {
        Error::Parse(message.into())
    }

    pub(crate) fn http(message: impl Into<String>) -> Self {
        Error::Http {
            status: None,
            message: message.into(),
        }
    }

    pub(crate) fn http_status(status: u16, message: impl Into<String>) -> Self {
        Error::Http {
            status: Some(status),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Manifest validation
// ---------------------------------------------------------------------------

/// One integrity problem found while validating a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    FileCount { expected: usize, actual: usize },
    Missing { path: PathBuf },
    Unreadable { path: PathBuf, reason: String },
    SizeMismatch { path: PathBuf, expected: u64, actual: u64 },
    HashMismatch { path: PathBuf, expected: String, actual: String },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::FileCount { expected, actual } => {
                write!(f, "expected {} files, but got {}", expected, actual)
            }
            Violation::Missing { path } => write!(f, "file does not exist: {}", path.display()),
            Violation::Unreadable { path, reason } => {
                write!(f, "cannot read {}: {}", path.display(), reason)
            }
            Violation::SizeMismatch {
                path,
                expected,
                actual,
            } => write!(
                f,
                "size mismatch for {}: expected {}, got {}",
                path.display(),
                expected,
                actual
            ),
            Violation::HashMismatch {
                path,
                expected,
                actual,
            } => write!(
                f,
                "hash mismatch for {}: expected {}, got {}",
                path.display(),
                expected,
                actual
            ),
        }
    }
}

/// Every violation found by a single `Manifest::validate_files` pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

impl ValidationError {
    /// Violations that report a missing file.
    pub fn missing_files(&self) -> impl Iterator<Item = &Violation> {
        self.violations
            .iter()
            .filter(|v| matches!(v, Violation::Missing { .. }))
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file validation errors:")?;
        for violation in &self.violations {
            write!(f, "\n  {}", violation)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}
