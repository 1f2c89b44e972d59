//! # appdrive
//!
//! End-to-end test driver for reactive web applications, built on
//! chromiumoxide.
//!
//! A session launches the application as a child process, attaches a
//! headless Chrome page to it, and exposes a small set of commands (set
//! inputs, click, read values, run script, snapshot) that each wait for the
//! application to become idle before returning.
//!
//! ## Architecture
//!
//! - **AppProcess**: Application process lifecycle and port ownership
//! - **BrowserSession**: Chrome lifecycle, console and network capture
//! - **sync**: The idle check (no pending requests, quiet DOM, app not busy)
//! - **AppDriver**: The command/query surface tests use
//! - **SnapshotStore**: Named baselines with structural and image diffs
//! - **player**: Replay of recorded interaction scripts
//! - **harness**: Preflight and delegation to an external test runner
//!
//! ## Example Usage
//!
//! ```ignore
//! use appdrive::{AppDriver, AppDriverConfig, LogSource};
//!
//! #[tokio::test]
//! #[ignore]
//! async fn slider_updates_echo() -> appdrive::Result<()> {
//!     let mut app = AppDriver::start(AppDriverConfig::new("apps/slider").with_name("slider")).await?;
//!
//!     app.set_inputs([("n", 7)]).await?;
//!     assert_eq!(app.get_value("echo").await?, "7");
//!     app.expect_values(Some("after-slide")).await?.into_result()?;
//!
//!     let errors = app.get_logs(Some(&[LogSource::Browser])).await?;
//!     assert!(errors.iter().all(|e| !e.level.is_error()));
//!
//!     app.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Timeouts
//!
//! Startup is bounded by `load_timeout` and every other command by
//! `timeout`. Both default higher on CI. A command that times out fails
//! alone; the session stays usable. If the application or the browser
//! dies, every later command fails fast with `ProcessDied`.
//!
//! ## Testing Strategy
//!
//! 1. **Unit tests**: Logic tested without a browser (idle loop against a
//!    scripted signal source, snapshot store on temp directories)
//! 2. **Integration tests**: Real browser and app tests (require Chrome and
//!    Python), `#[ignore]`d by default
//!
//! Run with `cargo test` (unit) or `cargo test -- --ignored` (integration).

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod bridge;
pub mod browser;
pub mod config;
pub mod diff;
pub mod driver;
pub mod error;
pub mod harness;
pub mod log;
pub mod logging;
pub mod player;
pub mod process;
pub mod snapshot;
pub mod sync;
pub mod value;
pub mod visual;

// Re-export main types for convenience
pub use config::{CONFIG_FILE, AppDriverConfig, IdleOptions, ResolvedConfig, Transform};
pub use diff::{DiffItem, DiffKind, SnapshotDiff};
pub use driver::{AppDriver, AssertionResult, TeardownReport};
pub use error::{Component, ConfigError, DriverError, Result};
pub use harness::{CommandHarness, HarnessReport, TestAppOptions, TestHarness, test_app};
pub use log::{LogEntry, LogLevel, LogSource, LogStore};
pub use player::{
    PlayOptions, PlaybackReport, Script, Step, StepResult, StepStatus, StepTarget, play,
};
pub use snapshot::{SnapshotOutcome, SnapshotRecord, SnapshotStore};
pub use sync::{DEFAULT_DEBOUNCE, DEFAULT_POLL_INTERVAL, IdleReport, IdleSignals};
pub use value::{JsValue, ValueKind};
pub use visual::{ImageComparison, ImageTolerance};
