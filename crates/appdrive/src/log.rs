//! Session log capture and filtering.
//!
//! Every session owns one `LogStore`. It accumulates entries from the
//! application server's stdout/stderr, the page console, network failures,
//! and the driver itself, in arrival order. Reads are non-destructive.
//!
//! # Design Rationale
//!
//! We use `Arc<Mutex<Vec<LogEntry>>>` instead of channels because:
//! 1. Tests need to query accumulated logs multiple times
//! 2. Entry ordering must be preserved across sources
//! 3. Several background tasks append concurrently

use chromiumoxide::cdp::js_protocol::runtime::{EventConsoleApiCalled, EventExceptionThrown};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Where a log entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    /// Application server stdout/stderr
    Server,
    /// Page console and uncaught exceptions
    Browser,
    /// Failed or erroring network requests
    Network,
    /// Messages from the driver itself
    Driver,
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogSource::Server => "server",
            LogSource::Browser => "browser",
            LogSource::Network => "network",
            LogSource::Driver => "driver",
        };
        f.pad(name)
    }
}

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// `console.debug()` and verbose output
    Debug,
    /// `console.log()`, `console.info()`, server stdout
    Info,
    /// `console.warn()`, server stderr
    Warning,
    /// `console.error()`, uncaught exceptions, failed requests
    Error,
}

impl LogLevel {
    /// Returns true if this is an error-level entry.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, LogLevel::Error)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        f.pad(name)
    }
}

impl From<&EventConsoleApiCalled> for LogLevel {
    fn from(event: &EventConsoleApiCalled) -> Self {
        use chromiumoxide::cdp::js_protocol::runtime::ConsoleApiCalledType;

        match event.r#type {
            ConsoleApiCalledType::Warning => LogLevel::Warning,
            ConsoleApiCalledType::Error | ConsoleApiCalledType::Assert => LogLevel::Error,
            ConsoleApiCalledType::Debug => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }
}

/// A timestamped log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the entry was captured (host clock, not page clock).
    pub timestamp: DateTime<Utc>,
    /// Which component produced it
    pub source: LogSource,
    /// Severity
    pub level: LogLevel,
    /// Message text
    pub message: String,
}

impl LogEntry {
    /// Creates an entry stamped with the current time.
    #[must_use]
    pub fn new(source: LogSource, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            source,
            level,
            message: message.into(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:<7} {:<7} {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.source,
            self.level,
            self.message
        )
    }
}

/// Thread-safe, append-only log accumulator.
///
/// Cheaply cloneable; every clone appends to the same buffer.
#[derive(Debug, Clone, Default)]
pub struct LogStore {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl LogStore {
    /// Creates a new, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry and mirrors it to tracing at debug level.
    pub fn push(&self, entry: LogEntry) {
        tracing::debug!(source = %entry.source, level = %entry.level, "{}", entry.message);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    /// Returns all entries in arrival order.
    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns entries from the given sources, in arrival order.
    #[must_use]
    pub fn from_sources(&self, sources: &[LogSource]) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| sources.contains(&e.source))
            .cloned()
            .collect()
    }

    /// Renders the last `n` entries of a source, one per line.
    ///
    /// Used to attach diagnostics to launch and process-death errors.
    #[must_use]
    pub fn tail(&self, source: LogSource, n: usize) -> String {
        let entries = self.from_sources(&[source]);
        let skip = entries.len().saturating_sub(n);
        let lines: Vec<String> = entries.iter().skip(skip).map(ToString::to_string).collect();
        if lines.is_empty() {
            "<no output captured>".to_string()
        } else {
            lines.join("\n")
        }
    }

    /// Returns the count of error entries.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.level.is_error())
            .count()
    }

    /// Returns the total number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if nothing has been captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Converts a CDP console call into a browser log entry.
///
/// Arguments are joined with spaces; non-string arguments use their JSON
/// value or the protocol's description.
pub(crate) fn parse_console_event(event: &EventConsoleApiCalled) -> LogEntry {
    let text = event
        .args
        .iter()
        .map(|arg| match (&arg.value, &arg.description) {
            (Some(serde_json::Value::String(s)), _) => s.clone(),
            (Some(v), _) => v.to_string(),
            (None, Some(description)) => description.clone(),
            (None, None) => "<object>".to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ");

    LogEntry::new(LogSource::Browser, LogLevel::from(event), text)
}

/// Converts an uncaught page exception into an error entry.
pub(crate) fn parse_exception_event(event: &EventExceptionThrown) -> LogEntry {
    let details = &event.exception_details;
    let message = details
        .exception
        .as_ref()
        .and_then(|e| e.description.clone())
        .unwrap_or_else(|| details.text.clone());
    LogEntry::new(LogSource::Browser, LogLevel::Error, message)
}
