//! Error types for driver operations.
//!
//! The hierarchy separates three families of failure:
//!
//! - **Infrastructure errors** (launch, page load, protocol, idle timeouts)
//!   abort the current command. The session stays usable afterwards.
//! - **Terminal errors** (`ProcessDied`, `SessionClosed`) poison the session:
//!   every later command fails fast with the same kind of error.
//! - **Assertion errors** (`SnapshotMismatch`) are expected test outcomes,
//!   reported to the harness like any other failed check.

use crate::diff::SnapshotDiff;
use crate::sync::IdleSignals;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The out-of-process component a session depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    /// The application server subprocess.
    Server,
    /// The headless browser process.
    Browser,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Server => f.write_str("application server"),
            Component::Browser => f.write_str("browser"),
        }
    }
}

/// The main error type for all driver operations.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The application did not become reachable within `load_timeout`.
    ///
    /// Carries the startup logs so the failure can be diagnosed without
    /// reproducing it interactively.
    #[error("application at {url} was not reachable after {timeout:?}\n\nStartup logs:\n{logs}")]
    LaunchTimeout {
        /// URL that was polled
        url: String,
        /// How long we waited
        timeout: Duration,
        /// Captured server output up to the timeout
        logs: String,
    },

    /// The application process could not be started, or exited while starting.
    #[error("failed to launch application: {reason}")]
    LaunchFailed {
        /// Human-readable reason for the launch failure
        reason: String,
        /// Optional underlying error that caused the failure
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The requested port is held by a live session or bound by another process.
    #[error("port {0} is already in use\n\nHint: leave `port` unset to allocate an ephemeral port")]
    PortInUse(u16),

    /// The browser failed to load the application page in time.
    #[error("page '{url}' did not finish loading within {timeout:?}")]
    PageLoadTimeout {
        /// The URL that failed to load
        url: String,
        /// How long we waited
        timeout: Duration,
    },

    /// A polled condition did not hold within its timeout.
    #[error("timed out after {timeout:?} waiting for {condition}")]
    WaitTimeout {
        /// Description of the condition
        condition: String,
        /// How long we waited
        timeout: Duration,
    },

    /// Transport or protocol failure talking to the browser.
    #[error("browser error: {0}")]
    Browser(String),

    /// A single protocol round-trip exceeded its deadline.
    #[error("browser did not answer '{operation}' within {timeout:?}")]
    ProtocolTimeout {
        /// Operation that was in flight
        operation: String,
        /// Round-trip deadline
        timeout: Duration,
    },

    /// The application did not settle within the wait timeout.
    #[error(
        "application still busy after {timeout:?} (last signals: {}){}",
        describe_signals(.last),
        describe_probe_error(.last_error)
    )]
    StillBusy {
        /// How long we waited
        timeout: Duration,
        /// Last successfully sampled signal values
        last: Option<IdleSignals>,
        /// Last transient probe error, if any sample failed
        last_error: Option<String>,
    },

    /// Script evaluated in the page raised an exception.
    #[error("script error: {0}")]
    ScriptError(String),

    /// The named input, output, or element does not exist in the page.
    #[error("unknown field '{0}'")]
    UnknownField(String),

    /// A snapshot name was reused within one run.
    #[error("snapshot '{0}' was already captured in this run\n\nHint: pick a different name or omit it to get an indexed name")]
    DuplicateSnapshot(String),

    /// A snapshot differs from its checked-in baseline.
    #[error("snapshot '{name}' does not match its baseline:\n{diff}")]
    SnapshotMismatch {
        /// Snapshot name
        name: String,
        /// Itemized differences
        diff: SnapshotDiff,
    },

    /// Configuration or preflight failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A session process died. Terminal for the session.
    #[error("{component} process is gone: {detail}")]
    ProcessDied {
        /// Which process died
        component: Component,
        /// Exit status and recent logs
        detail: String,
    },

    /// A command was issued after `stop()`. Terminal for the session.
    #[error("session closed")]
    SessionClosed,

    /// Wraps errors from the chromiumoxide library.
    #[error("chromiumoxide error: {0}")]
    ChromiumOxide(#[from] chromiumoxide::error::CdpError),

    /// HTTP errors while polling the application.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Image decoding or encoding failure.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// Returns true if this error leaves the session unusable.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DriverError::ProcessDied { .. } | DriverError::SessionClosed
        )
    }

    /// Returns true if this is an assertion-level failure rather than an
    /// infrastructure one.
    #[must_use]
    pub fn is_assertion(&self) -> bool {
        matches!(self, DriverError::SnapshotMismatch { .. })
    }
}

fn describe_signals(signals: &Option<IdleSignals>) -> String {
    signals
        .as_ref()
        .map_or_else(|| "never sampled".to_string(), ToString::to_string)
}

fn describe_probe_error(error: &Option<String>) -> String {
    error
        .as_ref()
        .map(|e| format!("; last probe error: {e}"))
        .unwrap_or_default()
}

/// Configuration and preflight errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The required setup file is missing from the test directory.
    #[error("required setup file not found: {}\n\nHint: run `{remediation}` to create it", .path.display())]
    MissingSetupFile {
        /// Expected location of the setup file
        path: PathBuf,
        /// Command that creates it
        remediation: String,
    },

    /// The setup file exists but does not load the support environment.
    #[error("setup file {} does not call `{call}`\n\nHint: run `{remediation}` to regenerate it", .path.display())]
    MissingSetupCall {
        /// Location of the setup file
        path: PathBuf,
        /// Call that must appear in the file
        call: String,
        /// Command that regenerates it
        remediation: String,
    },

    /// The application directory does not exist.
    #[error("application directory not found: {}", .0.display())]
    AppDirNotFound(PathBuf),

    /// Invalid value for a configuration option.
    #[error("invalid value for '{field}': {value}\n\nHint: {hint}")]
    InvalidValue {
        /// Name of the field with invalid value
        field: String,
        /// The invalid value
        value: String,
        /// Helpful hint for correct values
        hint: String,
    },

    /// I/O error while reading configuration or setup files.
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        /// File being read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

/// A specialized Result type for driver operations.
pub type Result<T, E = DriverError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn still_busy_reports_every_signal() {
        let err = DriverError::StillBusy {
            timeout: Duration::from_secs(4),
            last: Some(IdleSignals {
                pending_requests: 2,
                quiet_for: Duration::from_millis(120),
                app_busy: true,
            }),
            last_error: None,
        };
        insta::assert_snapshot!(
            err.to_string(),
            @"application still busy after 4s (last signals: pending_requests=2, dom_quiet_for=120ms, app_busy=true)"
        );
    }

    #[test]
    fn still_busy_without_samples_mentions_probe_error() {
        let err = DriverError::StillBusy {
            timeout: Duration::from_millis(500),
            last: None,
            last_error: Some("bridge not installed".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("never sampled"));
        assert!(msg.contains("bridge not installed"));
    }

    #[test]
    fn terminal_classification() {
        assert!(DriverError::SessionClosed.is_terminal());
        assert!(DriverError::ProcessDied {
            component: Component::Browser,
            detail: "killed".into(),
        }
        .is_terminal());
        assert!(!DriverError::UnknownField("x".into()).is_terminal());
        assert!(!DriverError::ScriptError("boom".into()).is_terminal());
    }

    #[test]
    fn process_died_names_component() {
        let err = DriverError::ProcessDied {
            component: Component::Server,
            detail: "exit status: 1".into(),
        };
        assert_eq!(
            err.to_string(),
            "application server process is gone: exit status: 1"
        );
    }

    #[test]
    fn missing_setup_file_names_remediation() {
        let err = ConfigError::MissingSetupFile {
            path: PathBuf::from("tests/testthat/setup-shinytest2.R"),
            remediation: "shinytest2::use_shinytest2('.', setup = TRUE)".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("setup-shinytest2.R"));
        assert!(msg.contains("use_shinytest2"));
        assert!(msg.contains("Hint:"));
    }

    #[test]
    fn config_error_converts() {
        let err: DriverError = ConfigError::AppDirNotFound(PathBuf::from("app")).into();
        assert!(matches!(err, DriverError::Config(_)));
        assert!(!err.is_terminal());
    }
}
