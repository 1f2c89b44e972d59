//! Session configuration.
//!
//! `AppDriverConfig` is the user-facing option set. It is loaded from
//! multiple sources with this priority (highest first):
//!
//! 1. Programmatic overrides (`with_*` builders)
//! 2. Environment variables prefixed `APPDRIVE_` (`__` separates nested keys)
//! 3. `appdrive.toml` in the application directory
//! 4. Built-in defaults
//!
//! `resolve()` turns it into an immutable `ResolvedConfig` once per session,
//! filling in the environment-dependent defaults (CI runs get longer
//! timeouts and a sandbox-free browser).

use crate::error::ConfigError;
use figment::{
    Figment,
    providers::{Env, Format as _, Serialized, Toml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the optional per-app configuration file.
pub const CONFIG_FILE: &str = "appdrive.toml";

/// Environment variable consulted for CI detection.
const CI_ENV: &str = "CI";

const LOCAL_LOAD_TIMEOUT: Duration = Duration::from_secs(15);
const CI_LOAD_TIMEOUT: Duration = Duration::from_secs(60);
const LOCAL_TIMEOUT: Duration = Duration::from_secs(4);
const CI_TIMEOUT: Duration = Duration::from_secs(10);

/// Launches an R Shiny app in test mode. `{seed}` expands to a
/// `set.seed(N); ` statement, or nothing when no seed is configured.
const DEFAULT_COMMAND: &str = "Rscript";
const DEFAULT_LAUNCH_EXPR: &str = "options(shiny.testmode = TRUE); {seed_stmt}shiny::runApp('{app_dir}', host = '{host}', port = {port}, launch.browser = FALSE)";

/// Idle-detection tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleOptions {
    /// Interval between readiness probes.
    pub poll_interval_ms: u64,
    /// How long the DOM must stay unmutated before it counts as quiet.
    pub debounce_ms: u64,
    /// How long a dispatched input keeps the app busy while waiting for the
    /// server to acknowledge it.
    pub input_ack_timeout_ms: u64,
}

impl Default for IdleOptions {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            debounce_ms: 500,
            input_ack_timeout_ms: 3_000,
        }
    }
}

/// A regex replacement applied to every string value before snapshots are
/// compared or written, used to mask volatile text such as timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    /// Regular expression to match
    pub pattern: String,
    /// Replacement text (`$1`-style group references allowed)
    pub replacement: String,
}

impl Transform {
    /// Creates a transform.
    pub fn new(pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            replacement: replacement.into(),
        }
    }

    pub(crate) fn compile(&self) -> Result<(Regex, String), ConfigError> {
        Regex::new(&self.pattern)
            .map(|re| (re, self.replacement.clone()))
            .map_err(|e| ConfigError::InvalidValue {
                field: "transforms".to_string(),
                value: self.pattern.clone(),
                hint: format!("not a valid regular expression: {e}"),
            })
    }
}

/// User-facing session options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppDriverConfig {
    /// Directory containing the application.
    pub app_dir: PathBuf,
    /// Snapshot prefix and per-test snapshot directory. Defaults to the app
    /// directory's name.
    pub name: Option<String>,
    /// Optional snapshot variant (e.g. platform), adding a directory level.
    pub variant: Option<String>,
    /// Program launching the application. Defaults to `Rscript`.
    pub command: Option<String>,
    /// Arguments for `command`. Placeholders: `{app_dir}`, `{host}`,
    /// `{port}`, `{seed}`.
    pub args: Option<Vec<String>>,
    /// Extra arguments appended after `args`.
    pub launch_args: Vec<String>,
    /// Older spelling of `launch_args`. Placed before them when both are set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shiny_args: Option<Vec<String>>,
    /// Interface the application binds to.
    pub host: String,
    /// Fixed port. `None` allocates an ephemeral port.
    pub port: Option<u16>,
    /// Random seed injected into the application's runtime.
    pub seed: Option<u64>,
    /// Time allowed for the application and page to become servable.
    pub load_timeout_ms: Option<u64>,
    /// Default timeout for commands and idle waits.
    pub timeout_ms: Option<u64>,
    /// Show the browser window instead of running headless.
    pub view: bool,
    /// Viewport width.
    pub width: u32,
    /// Viewport height.
    pub height: u32,
    /// Extra browser arguments.
    pub browser_args: Vec<String>,
    /// Browser executable (auto-detected when unset).
    pub chrome_path: Option<PathBuf>,
    /// Disable the browser sandbox outside CI too.
    pub no_sandbox: bool,
    /// Force CI (or local) behaviour instead of detecting it.
    pub ci: Option<bool>,
    /// Idle-detection tuning.
    pub idle: IdleOptions,
    /// Script expression that evaluates to `true` when the application has
    /// no pending work. Combined with the built-in busy indicator.
    pub readiness_script: Option<String>,
    /// Save a debug screenshot next to every value snapshot.
    pub expect_values_screenshot: bool,
    /// Percentage of differing pixels tolerated in screenshot snapshots.
    pub screenshot_threshold: f64,
    /// Per-channel difference below which two pixels count as equal.
    pub pixel_tolerance: u8,
    /// Normalizers applied to snapshot string values.
    pub transforms: Vec<Transform>,
    /// Warn about duplicate element ids when the session starts.
    pub check_names: bool,
    /// Root of the snapshot tree. Defaults to `<app_dir>/tests/testthat/_snaps`.
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for AppDriverConfig {
    fn default() -> Self {
        Self {
            app_dir: PathBuf::from("."),
            name: None,
            variant: None,
            command: None,
            args: None,
            launch_args: Vec::new(),
            shiny_args: None,
            host: "127.0.0.1".to_string(),
            port: None,
            seed: None,
            load_timeout_ms: None,
            timeout_ms: None,
            view: false,
            width: 992,
            height: 1323,
            browser_args: Vec::new(),
            chrome_path: None,
            no_sandbox: false,
            ci: None,
            idle: IdleOptions::default(),
            readiness_script: None,
            expect_values_screenshot: true,
            screenshot_threshold: 0.1,
            pixel_tolerance: 5,
            transforms: Vec::new(),
            check_names: true,
            snapshot_dir: None,
        }
    }
}

impl AppDriverConfig {
    /// Creates a config for the app in `app_dir` with built-in defaults.
    pub fn new(app_dir: impl Into<PathBuf>) -> Self {
        Self {
            app_dir: app_dir.into(),
            ..Self::default()
        }
    }

    /// Loads configuration for `app_dir` from defaults, `appdrive.toml`,
    /// and `APPDRIVE_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` if any source has the wrong shape.
    pub fn load(app_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let app_dir = app_dir.as_ref();
        let mut figment = Figment::new().merge(Serialized::defaults(Self::new(app_dir)));

        let file = app_dir.join(CONFIG_FILE);
        if file.exists() {
            figment = figment.merge(Toml::file(file));
        }

        figment = figment.merge(Env::prefixed("APPDRIVE_").split("__"));

        let mut config: Self = figment.extract().map_err(|e| ConfigError::InvalidValue {
            field: "configuration".to_string(),
            value: e.to_string(),
            hint: format!("check {CONFIG_FILE} syntax and APPDRIVE_* variables"),
        })?;
        config.app_dir = app_dir.to_path_buf();
        Ok(config)
    }

    /// Sets the snapshot name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the snapshot variant.
    #[must_use]
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// Sets the launch command and its arguments.
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>, args: Vec<String>) -> Self {
        self.command = Some(command.into());
        self.args = Some(args);
        self
    }

    /// Appends launch arguments.
    #[must_use]
    pub fn with_launch_args(mut self, args: Vec<String>) -> Self {
        self.launch_args.extend(args);
        self
    }

    /// Pins the application port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the random seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Sets the load timeout.
    #[must_use]
    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout_ms = Some(duration_ms(timeout));
        self
    }

    /// Sets the default command timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(duration_ms(timeout));
        self
    }

    /// Shows the browser window.
    #[must_use]
    pub fn visible(mut self) -> Self {
        self.view = true;
        self
    }

    /// Sets the viewport size.
    #[must_use]
    pub fn with_window_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Adds a snapshot normalizer.
    #[must_use]
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Sets the snapshot root.
    #[must_use]
    pub fn with_snapshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshot_dir = Some(dir.into());
        self
    }

    /// Validates the options and fills in environment-dependent defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppDirNotFound` for a missing app directory and
    /// `InvalidValue` for out-of-range options or invalid transforms.
    pub fn resolve(self) -> Result<ResolvedConfig, ConfigError> {
        if !self.app_dir.is_dir() {
            return Err(ConfigError::AppDirNotFound(self.app_dir));
        }
        let app_dir = self
            .app_dir
            .canonicalize()
            .map_err(|source| ConfigError::Io {
                path: self.app_dir.clone(),
                source,
            })?;

        if !(0.0..=100.0).contains(&self.screenshot_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "screenshot_threshold".to_string(),
                value: self.screenshot_threshold.to_string(),
                hint: "use a percentage between 0 and 100".to_string(),
            });
        }
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidValue {
                field: "width/height".to_string(),
                value: format!("{}x{}", self.width, self.height),
                hint: "viewport dimensions must be positive".to_string(),
            });
        }
        if self.idle.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "idle.poll_interval_ms".to_string(),
                value: "0".to_string(),
                hint: "use a positive interval (tens of milliseconds)".to_string(),
            });
        }
        for transform in &self.transforms {
            transform.compile()?;
        }

        let ci = self.ci.unwrap_or_else(running_on_ci);
        let name = self.name.clone().unwrap_or_else(|| {
            app_dir
                .file_name()
                .map_or_else(|| "app".to_string(), |n| n.to_string_lossy().into_owned())
        });

        let mut browser_args = self.browser_args.clone();
        if ci {
            // Shared memory is tiny in most CI containers.
            browser_args.push("--disable-dev-shm-usage".to_string());
        }

        let mut launch_args = self.shiny_args.unwrap_or_default();
        launch_args.extend(self.launch_args);

        let snapshot_dir = self
            .snapshot_dir
            .clone()
            .unwrap_or_else(|| app_dir.join("tests").join("testthat").join("_snaps"));

        Ok(ResolvedConfig {
            name,
            variant: self.variant,
            command: self.command.unwrap_or_else(|| DEFAULT_COMMAND.to_string()),
            args: self
                .args
                .unwrap_or_else(|| vec!["-e".to_string(), DEFAULT_LAUNCH_EXPR.to_string()]),
            launch_args,
            host: self.host,
            port: self.port,
            seed: self.seed,
            ci,
            load_timeout: self.load_timeout_ms.map_or(
                if ci { CI_LOAD_TIMEOUT } else { LOCAL_LOAD_TIMEOUT },
                Duration::from_millis,
            ),
            timeout: self
                .timeout_ms
                .map_or(if ci { CI_TIMEOUT } else { LOCAL_TIMEOUT }, Duration::from_millis),
            view: self.view,
            window_size: (self.width, self.height),
            browser_args,
            chrome_path: self.chrome_path,
            sandbox: !(ci || self.no_sandbox),
            poll_interval: Duration::from_millis(self.idle.poll_interval_ms),
            debounce: Duration::from_millis(self.idle.debounce_ms),
            input_ack_timeout: Duration::from_millis(self.idle.input_ack_timeout_ms),
            readiness_script: self.readiness_script,
            expect_values_screenshot: self.expect_values_screenshot,
            screenshot_threshold: self.screenshot_threshold,
            pixel_tolerance: self.pixel_tolerance,
            transforms: self.transforms,
            check_names: self.check_names,
            snapshot_dir,
            app_dir,
        })
    }
}

/// Immutable, fully-resolved session options.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    /// Canonical application directory
    pub app_dir: PathBuf,
    /// Snapshot prefix and per-test directory name
    pub name: String,
    /// Snapshot variant
    pub variant: Option<String>,
    /// Launch program
    pub command: String,
    /// Launch arguments, before placeholder expansion
    pub args: Vec<String>,
    /// Extra launch arguments
    pub launch_args: Vec<String>,
    /// Bind host
    pub host: String,
    /// Fixed port, if any
    pub port: Option<u16>,
    /// Random seed, if any
    pub seed: Option<u64>,
    /// Whether CI defaults are in effect
    pub ci: bool,
    /// Time allowed for launch and first page load
    pub load_timeout: Duration,
    /// Default command and idle timeout
    pub timeout: Duration,
    /// Visible browser
    pub view: bool,
    /// Viewport size
    pub window_size: (u32, u32),
    /// Extra browser arguments
    pub browser_args: Vec<String>,
    /// Browser executable
    pub chrome_path: Option<PathBuf>,
    /// Keep the browser sandbox enabled
    pub sandbox: bool,
    /// Idle probe interval
    pub poll_interval: Duration,
    /// DOM quiescence window
    pub debounce: Duration,
    /// Input acknowledgement window
    pub input_ack_timeout: Duration,
    /// App-defined readiness expression
    pub readiness_script: Option<String>,
    /// Debug screenshot next to value snapshots
    pub expect_values_screenshot: bool,
    /// Screenshot mismatch threshold (percent)
    pub screenshot_threshold: f64,
    /// Per-channel pixel tolerance
    pub pixel_tolerance: u8,
    /// Snapshot normalizers
    pub transforms: Vec<Transform>,
    /// Duplicate id check at startup
    pub check_names: bool,
    /// Snapshot root
    pub snapshot_dir: PathBuf,
}

impl ResolvedConfig {
    /// Expands the launch command for a concrete port.
    ///
    /// Returns the program and its full argument list.
    #[must_use]
    pub fn launch_command(&self, port: u16) -> (String, Vec<String>) {
        let app_dir = self.app_dir.display().to_string();
        let seed = self.seed.map(|s| s.to_string()).unwrap_or_default();
        let seed_stmt = self
            .seed
            .map(|s| format!("set.seed({s}); "))
            .unwrap_or_default();
        let port = port.to_string();

        let expand = |arg: &str| {
            arg.replace("{app_dir}", &app_dir)
                .replace("{host}", &self.host)
                .replace("{port}", &port)
                .replace("{seed_stmt}", &seed_stmt)
                .replace("{seed}", &seed)
        };

        let args = self
            .args
            .iter()
            .chain(&self.launch_args)
            .map(|a| expand(a))
            .collect();
        (expand(&self.command), args)
    }
}

/// Returns true when the `CI` environment variable is set to a truthy value.
#[must_use]
pub fn running_on_ci() -> bool {
    std::env::var(CI_ENV).is_ok_and(|v| {
        matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
    })
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
