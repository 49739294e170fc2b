//! Structured logging for the fewspy client and cache.
//!
//! Provides context-rich log records tagged with the emitting component and an
//! optional subject (a location id, manifest path, or generation id). There is
//! no process-wide logger: every component that logs receives an `Observer`
//! explicitly, so tests and embedding services decide where records go.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Log Levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Codec,
    Manifest,
    Cache,
    Remote,
    Config,
}

impl Component {
    /// `log` target used for records from this component.
    pub fn target(&self) -> &'static str {
        match self {
            Component::Codec => "fewspy::codec",
            Component::Manifest => "fewspy::manifest",
            Component::Cache => "fewspy::cache",
            Component::Remote => "fewspy::remote",
            Component::Config => "fewspy::config",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Codec => write!(f, "CODEC"),
            Component::Manifest => write!(f, "MANIFEST"),
            Component::Cache => write!(f, "CACHE"),
            Component::Remote => write!(f, "REMOTE"),
            Component::Config => write!(f, "CONFIG"),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureType {
    /// Expected failure - the filter or location simply has no data
    Expected,
    /// Unexpected failure - indicates service degradation or configuration issue
    Unexpected,
    /// Unknown - cannot determine if this is expected or not
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Expected => write!(f, "EXPECTED"),
            FailureType::Unexpected => write!(f, "UNEXPECTED"),
            FailureType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Receiver for log records. Passed explicitly to every component that logs.
pub trait Observer: Send + Sync {
    fn log(&self, level: LogLevel, component: Component, subject: Option<&str>, message: &str);

    fn debug(&self, component: Component, subject: Option<&str>, message: &str) {
        self.log(LogLevel::Debug, component, subject, message);
    }

    fn info(&self, component: Component, subject: Option<&str>, message: &str) {
        self.log(LogLevel::Info, component, subject, message);
    }

    fn warn(&self, component: Component, subject: Option<&str>, message: &str) {
        self.log(LogLevel::Warning, component, subject, message);
    }

    fn error(&self, component: Component, subject: Option<&str>, message: &str) {
        self.log(LogLevel::Error, component, subject, message);
    }
}

/// Forwards records to the `log` facade, dropping anything below `min_level`.
#[derive(Debug, Clone)]
pub struct LogObserver {
    min_level: LogLevel,
}

impl LogObserver {
    pub fn new(min_level: LogLevel) -> Self {
        Self { min_level }
    }
}

impl Default for LogObserver {
    fn default() -> Self {
        Self::new(LogLevel::Debug)
    }
}

impl Observer for LogObserver {
    fn log(&self, level: LogLevel, component: Component, subject: Option<&str>, message: &str) {
        if level < self.min_level {
            return;
        }
        let subject_part = subject.map(|s| format!(" [{}]", s)).unwrap_or_default();
        log::log!(
            target: component.target(),
            log::Level::from(level),
            "{}{}: {}",
            component,
            subject_part,
            message
        );
    }
}

/// Discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl Observer for NullObserver {
    fn log(&self, _: LogLevel, _: Component, _: Option<&str>, _: &str) {}
}

/// A captured log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub level: LogLevel,
    pub component: Component,
    pub subject: Option<String>,
    pub message: String,
}

/// Keeps every record in memory. Useful for asserting on logged behaviour.
#[derive(Debug, Default)]
pub struct MemoryObserver {
    records: Mutex<Vec<Record>>,
}

impl MemoryObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    pub fn count_at(&self, level: LogLevel) -> usize {
        self.records.lock().iter().filter(|r| r.level == level).count()
    }
}

impl Observer for MemoryObserver {
    fn log(&self, level: LogLevel, component: Component, subject: Option<&str>, message: &str) {
        self.records.lock().push(Record {
            level,
            component,
            subject: subject.map(String::from),
            message: message.to_string(),
        });
    }
}

/// Default observer used when a caller does not supply one.
pub fn default_observer() -> Arc<dyn Observer> {
    Arc::new(LogObserver::default())
}

// ---------------------------------------------------------------------------
// Failure Classification Helpers
// ---------------------------------------------------------------------------

/// Classify a remote fetch failure
pub fn classify_fetch_failure(err: &Error) -> FailureType {
    match err {
        // unknown filter/location combination on the service side
        Error::Http {
            status: Some(404), ..
        } => FailureType::Expected,
        Error::Http { .. } => FailureType::Unexpected,
        // the service answered but not in the dialect we expect
        Error::Format(_) | Error::Parse(_) | Error::Json(_) => FailureType::Unexpected,
        _ => FailureType::Unknown,
    }
}

/// Log a remote fetch failure with automatic classification.
///
/// Every failure is at least a warning; unexpected ones are errors.
pub fn log_fetch_failure(observer: &dyn Observer, subject: &str, operation: &str, err: &Error) {
    let failure_type = classify_fetch_failure(err);
    let message = format!("{} failed [{}]: {}", operation, failure_type, err);

    match failure_type {
        FailureType::Unexpected => observer.error(Component::Remote, Some(subject), &message),
        FailureType::Expected | FailureType::Unknown => {
            observer.warn(Component::Remote, Some(subject), &message)
        }
    }
}

// ---------------------------------------------------------------------------
// Bulk Fetch Summary Logging
// ---------------------------------------------------------------------------

/// Log a summary of a bulk fetch
pub fn log_fetch_summary(observer: &dyn Observer, total: usize, successful: usize, failed: usize) {
    let message = format!(
        "Bulk fetch complete: {}/{} successful, {} failed",
        successful, total, failed
    );

    if failed == 0 {
        observer.info(Component::Remote, None, &message);
    } else if successful == 0 {
        observer.error(Component::Remote, None, &message);
    } else {
        observer.warn(Component::Remote, None, &message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
    }

    #[test]
    fn test_failure_classification() {
        assert_eq!(
            classify_fetch_failure(&Error::http_status(404, "Not Found")),
            FailureType::Expected
        );
        assert_eq!(
            classify_fetch_failure(&Error::http_status(500, "Internal Server Error")),
            FailureType::Unexpected
        );
        assert_eq!(
            classify_fetch_failure(&Error::http("operation timed out")),
            FailureType::Unexpected
        );
        assert_eq!(
            classify_fetch_failure(&Error::Format("missing timeSeries".into())),
            FailureType::Unexpected
        );
        // a message mentioning 404 is not a 404 status
        assert_eq!(
            classify_fetch_failure(&Error::NotFound("HTTP error: 404".into())),
            FailureType::Unknown
        );
    }

    #[test]
    fn test_fetch_failure_is_logged_at_classified_level() {
        let observer = MemoryObserver::new();
        let err = Error::http_status(500, "Internal Server Error");
        log_fetch_failure(observer.as_ref(), "Hydronet", "timeseries request", &err);

        let records = observer.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, LogLevel::Error);
        assert_eq!(records[0].component, Component::Remote);
        assert_eq!(records[0].subject.as_deref(), Some("Hydronet"));
        assert!(records[0].message.contains("[UNEXPECTED]"));
    }

    #[test]
    fn test_not_found_is_logged_as_warning() {
        let observer = MemoryObserver::new();
        let err = Error::http_status(404, "unknown filter");
        log_fetch_failure(observer.as_ref(), "Hydronet", "timeseries request", &err);
        assert_eq!(observer.count_at(LogLevel::Warning), 1);
        assert!(observer.records()[0].message.contains("[EXPECTED]"));
    }

    #[test]
    fn test_fetch_summary_levels() {
        let observer = MemoryObserver::new();
        log_fetch_summary(observer.as_ref(), 4, 4, 0);
        log_fetch_summary(observer.as_ref(), 4, 2, 2);
        log_fetch_summary(observer.as_ref(), 4, 0, 4);
        assert_eq!(observer.count_at(LogLevel::Info), 1);
        assert_eq!(observer.count_at(LogLevel::Warning), 1);
        assert_eq!(observer.count_at(LogLevel::Error), 1);
    }

    #[test]
    fn test_null_observer_accepts_everything() {
        let observer = NullObserver;
        observer.error(Component::Cache, Some("x"), "dropped");
    }
}
