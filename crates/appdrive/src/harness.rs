//! Running an application's test suite.
//!
//! [`test_app`] checks that the application's test directory is set up to
//! load the support environment, then hands the suite to a [`TestHarness`].
//! The bundled [`CommandHarness`] shells out to a test runner.

use crate::error::{ConfigError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Test directory, relative to the application directory.
pub const TEST_DIR: &str = "tests/testthat";

/// Setup file every suite must carry.
pub const SETUP_FILE: &str = "setup-shinytest2.R";

/// Call the setup file must contain.
pub const SETUP_CALL: &str = "load_app_env(";

/// Options for [`test_app`].
#[derive(Debug, Clone)]
pub struct TestAppOptions {
    /// Only run test files whose names match this pattern
    pub filter: Option<String>,
    /// Verify the setup file before running
    pub check_setup: bool,
}

impl Default for TestAppOptions {
    fn default() -> Self {
        Self {
            filter: None,
            check_setup: true,
        }
    }
}

/// Outcome of a suite run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    /// Whether the runner reported success
    pub success: bool,
    /// Combined runner output
    pub output: String,
}

/// Runs a test suite for an application.
#[async_trait]
pub trait TestHarness: Send + Sync {
    /// Runs the tests in `test_dir`, optionally filtered by file name.
    async fn run(&self, test_dir: &Path, filter: Option<&str>) -> Result<HarnessReport>;
}

fn remediation(app_dir: &Path) -> String {
    format!(
        "shinytest2::use_shinytest2('{}', setup = TRUE)",
        app_dir.display()
    )
}

/// Checks that `<app_dir>/tests/testthat/setup-shinytest2.R` exists and
/// loads the support environment.
///
/// # Errors
///
/// `MissingSetupFile` or `MissingSetupCall`, both naming the command that
/// fixes the problem.
pub fn check_setup_file(app_dir: &Path) -> std::result::Result<PathBuf, ConfigError> {
    let path = app_dir.join(TEST_DIR).join(SETUP_FILE);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::MissingSetupFile {
                path,
                remediation: remediation(app_dir),
            });
        }
        Err(source) => return Err(ConfigError::Io { path, source }),
    };

    if !content.contains(SETUP_CALL) {
        return Err(ConfigError::MissingSetupCall {
            path,
            call: SETUP_CALL.trim_end_matches('(').to_string(),
            remediation: remediation(app_dir),
        });
    }
    Ok(path)
}

/// Runs the test suite of the application in `app_dir`.
///
/// # Errors
///
/// - `Config` if the directory or setup file is missing
/// - any error from the harness itself
pub async fn test_app(
    app_dir: impl AsRef<Path>,
    options: TestAppOptions,
    harness: &dyn TestHarness,
) -> Result<HarnessReport> {
    let app_dir = app_dir.as_ref();
    if !app_dir.is_dir() {
        return Err(ConfigError::AppDirNotFound(app_dir.to_path_buf()).into());
    }
    if options.check_setup {
        let setup = check_setup_file(app_dir)?;
        tracing::debug!(path = %setup.display(), "setup file ok");
    }

    let test_dir = app_dir.join(TEST_DIR);
    tracing::info!(dir = %test_dir.display(), filter = ?options.filter, "running app tests");
    let report = harness.run(&test_dir, options.filter.as_deref()).await?;
    if !report.success {
        tracing::warn!(dir = %test_dir.display(), "app tests failed");
    }
    Ok(report)
}

/// Runs the suite through an external command.
///
/// `{test_dir}` and `{filter}` in the arguments are replaced before launch.
/// `{filter}` becomes a quoted R string, or `NULL` without a filter.
#[derive(Debug, Clone)]
pub struct CommandHarness {
    program: String,
    args: Vec<String>,
}

impl Default for CommandHarness {
    fn default() -> Self {
        Self::new(
            "Rscript",
            vec![
                "-e".to_string(),
                "testthat::test_dir('{test_dir}', filter = {filter}, stop_on_failure = TRUE)".to_string(),
            ],
        )
    }
}

impl CommandHarness {
    /// Creates a harness running `program` with `args`.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn render_args(&self, test_dir: &Path, filter: Option<&str>) -> Vec<String> {
        let filter = filter.map_or_else(
            || "NULL".to_string(),
            |f| format!("'{}'", f.replace('\\', "\\\\").replace('\'', "\\'")),
        );
        let test_dir = test_dir.display().to_string();
        self.args
            .iter()
            .map(|arg| arg.replace("{test_dir}", &test_dir).replace("{filter}", &filter))
            .collect()
    }
}

#[async_trait]
impl TestHarness for CommandHarness {
    async fn run(&self, test_dir: &Path, filter: Option<&str>) -> Result<HarnessReport> {
        let args = self.render_args(test_dir, filter);
        tracing::debug!(program = %self.program, ?args, "spawning test runner");

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(HarnessReport {
            success: output.status.success(),
            output: text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverError;
    use std::sync::Mutex;

    fn app_with_setup(content: Option<&str>) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let tests = dir.path().join(TEST_DIR);
        std::fs::create_dir_all(&tests).unwrap();
        if let Some(content) = content {
            std::fs::write(tests.join(SETUP_FILE), content).unwrap();
        }
        dir
    }

    /// Records what it was asked to run.
    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<(PathBuf, Option<String>)>>,
    }

    #[async_trait]
    impl TestHarness for Recording {
        async fn run(&self, test_dir: &Path, filter: Option<&str>) -> Result<HarnessReport> {
            self.calls
                .lock()
                .unwrap()
                .push((test_dir.to_path_buf(), filter.map(str::to_string)));
            Ok(HarnessReport {
                success: true,
                output: String::new(),
            })
        }
    }

    #[test]
    fn missing_setup_file_names_remediation() {
        let dir = app_with_setup(None);
        let err = check_setup_file(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSetupFile { .. }));
        let message = err.to_string();
        assert!(message.contains(SETUP_FILE));
        assert!(message.contains("use_shinytest2("));
        assert!(message.contains("setup = TRUE"));
    }

    #[test]
    fn setup_file_without_call_is_rejected() {
        let dir = app_with_setup(Some("library(shinytest2)\n"));
        let err = check_setup_file(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSetupCall { ref call, .. } if call == "load_app_env"));
    }

    #[test]
    fn valid_setup_file_passes() {
        let dir = app_with_setup(Some(
            "# Load application support files\nshinytest2::load_app_env()\n",
        ));
        let path = check_setup_file(dir.path()).unwrap();
        assert!(path.ends_with(SETUP_FILE));
    }

    #[tokio::test]
    async fn test_app_runs_harness_after_preflight() {
        let dir = app_with_setup(Some("shinytest2::load_app_env()\n"));
        let harness = Recording::default();
        let options = TestAppOptions {
            filter: Some("slider".into()),
            ..TestAppOptions::default()
        };
        let report = test_app(dir.path(), options, &harness).await.unwrap();
        assert!(report.success);

        let calls = harness.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, dir.path().join(TEST_DIR));
        assert_eq!(calls[0].1.as_deref(), Some("slider"));
    }

    #[tokio::test]
    async fn test_app_stops_at_preflight() {
        let dir = app_with_setup(None);
        let harness = Recording::default();
        let err = test_app(dir.path(), TestAppOptions::default(), &harness)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Config(ConfigError::MissingSetupFile { .. })));
        assert!(harness.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn preflight_can_be_skipped() {
        let dir = app_with_setup(None);
        let harness = Recording::default();
        let options = TestAppOptions {
            filter: None,
            check_setup: false,
        };
        assert!(test_app(dir.path(), options, &harness).await.is_ok());
    }

    #[test]
    fn renders_filter_as_r_literal() {
        let harness = CommandHarness::default();
        let args = harness.render_args(Path::new("/app/tests/testthat"), Some("it's"));
        assert_eq!(
            args[1],
            r"testthat::test_dir('/app/tests/testthat', filter = 'it\'s', stop_on_failure = TRUE)"
        );
        let args = harness.render_args(Path::new("/t"), None);
        assert!(args[1].contains("filter = NULL"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_harness_reports_exit_status() {
        let ok = CommandHarness::new("sh", vec!["-c".into(), "echo ran {test_dir}".into()]);
        let report = ok.run(Path::new("/tmp/t"), None).await.unwrap();
        assert!(report.success);
        assert_eq!(report.output.trim(), "ran /tmp/t");

        let failing = CommandHarness::new("sh", vec!["-c".into(), "echo boom >&2; exit 3".into()]);
        let report = failing.run(Path::new("/tmp/t"), None).await.unwrap();
        assert!(!report.success);
        assert!(report.output.contains("boom"));
    }
}
