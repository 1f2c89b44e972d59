//! The session driver.
//!
//! `AppDriver` owns one application process and one browser page, and is
//! the only surface test code talks to. Every command waits for the
//! application to settle before acting; commands that change state wait
//! again before returning, so consecutive commands always observe a settled
//! application.
//!
//! # Example
//!
//! ```ignore
//! let mut app = AppDriver::start(AppDriverConfig::new("apps/slider")).await?;
//! app.set_inputs([("n", 7)]).await?;
//! assert_eq!(app.get_value("echo").await?, "7");
//! app.stop().await;
//! ```
//!
//! # Failure model
//!
//! A timed-out command fails alone and the session stays usable. A dead
//! server or browser makes every later command fail fast with
//! `ProcessDied`, and after `stop()` every command fails with
//! `SessionClosed`.

use crate::bridge::{self, PageState, SetInputsOutcome, ValueLookup, ValuesByKind};
use crate::browser::BrowserSession;
use crate::config::{AppDriverConfig, ResolvedConfig};
use crate::error::{Component, DriverError, Result};
use crate::log::{LogEntry, LogLevel, LogSource, LogStore};
use crate::process::AppProcess;
use crate::snapshot::{SnapshotOutcome, SnapshotRecord, SnapshotStore};
use crate::sync::{
    IdleConfig, IdleReport, IdleSignals, SignalSource, WaitConfig, wait_for_idle, wait_for_result,
};
use crate::value::{JsValue, ValueKind};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Dead(Component),
    Closed,
}

/// Errors swallowed while tearing a session down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Browser close failure, if any
    pub browser: Option<String>,
    /// Server stop failure, if any
    pub server: Option<String>,
}

impl TeardownReport {
    /// Returns true if both components shut down cleanly.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.browser.is_none() && self.server.is_none()
    }
}

/// One recorded snapshot assertion.
#[derive(Debug, Clone, PartialEq)]
pub struct AssertionResult {
    /// What was asserted (`values`, `screenshot`, `js`, `text`)
    pub assertion: &'static str,
    /// Outcome of the snapshot check
    pub outcome: SnapshotOutcome,
}

/// Readiness probe over the live session.
struct SessionProbe<'a> {
    server: &'a AppProcess,
    browser: &'a BrowserSession,
    state_expr: &'a str,
}

#[async_trait]
impl SignalSource for SessionProbe<'_> {
    async fn sample(&self) -> Result<IdleSignals> {
        self.server.check_alive()?;
        self.browser.check_alive().await?;
        let state: PageState = self.browser.bridge(self.state_expr).await?;
        tracing::trace!(?state, "page state");
        Ok(IdleSignals {
            pending_requests: self.browser.pending_requests(),
            quiet_for: state.quiet_for(),
            app_busy: state.busy,
        })
    }
}

/// A running application with a browser attached.
#[derive(Debug)]
pub struct AppDriver {
    config: ResolvedConfig,
    logs: LogStore,
    server: Option<AppProcess>,
    browser: Option<BrowserSession>,
    snapshots: SnapshotStore,
    state: SessionState,
    state_expr: String,
    http: reqwest::Client,
    assertions: Vec<AssertionResult>,
}

impl AppDriver {
    /// Loads configuration for `app_dir` (file and environment) and starts it.
    ///
    /// # Errors
    ///
    /// See [`AppDriver::start`].
    pub async fn start_in(app_dir: impl AsRef<Path>) -> Result<Self> {
        Self::start(AppDriverConfig::load(app_dir)?).await
    }

    /// Starts the application, attaches a browser, and waits until the
    /// first page has settled.
    ///
    /// Whatever was started is torn down again if a later step fails.
    ///
    /// # Errors
    ///
    /// - `Config` for invalid options
    /// - `PortInUse`, `LaunchFailed`, `LaunchTimeout` from the server
    /// - `LaunchFailed`, `PageLoadTimeout` from the browser
    /// - `StillBusy` if the first page never settles within `load_timeout`
    pub async fn start(config: AppDriverConfig) -> Result<Self> {
        let config = config.resolve()?;
        let logs = LogStore::new();
        let snapshots = SnapshotStore::for_config(&config)?;

        let server = AppProcess::start(&config, logs.clone()).await?;
        let browser = match BrowserSession::launch(&config, logs.clone()).await {
            Ok(browser) => browser,
            Err(e) => {
                let _ = server.stop().await;
                return Err(e);
            }
        };

        let mut driver = Self {
            state_expr: bridge::state_expr(config.readiness_script.as_deref()),
            http: reqwest::Client::new(),
            config,
            logs,
            server: Some(server),
            browser: Some(browser),
            snapshots,
            state: SessionState::Open,
            assertions: Vec::new(),
        };

        if let Err(e) = driver.open_page().await {
            driver.stop().await;
            return Err(e);
        }
        Ok(driver)
    }

    async fn open_page(&mut self) -> Result<()> {
        let url = self.server()?.url().to_string();
        let load_timeout = self.config.load_timeout;
        let result = self.browser()?.navigate(&url, load_timeout).await;
        self.track(result)?;
        self.settle(Some(load_timeout)).await?;

        if self.config.check_names {
            let dupes: Vec<String> = self.bridge(&bridge::duplicate_ids_expr()).await?;
            if !dupes.is_empty() {
                let message = format!(
                    "duplicate element ids found: {}; inputs and outputs must have unique ids",
                    dupes.join(", ")
                );
                tracing::warn!("{message}");
                self.logs
                    .push(LogEntry::new(LogSource::Driver, LogLevel::Warning, message));
            }
        }
        tracing::info!(%url, "session ready");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            SessionState::Open => Ok(()),
            SessionState::Dead(component) => Err(DriverError::ProcessDied {
                component,
                detail: "it died earlier in this session".to_string(),
            }),
            SessionState::Closed => Err(DriverError::SessionClosed),
        }
    }

    fn server(&self) -> Result<&AppProcess> {
        self.server.as_ref().ok_or(DriverError::SessionClosed)
    }

    fn browser(&self) -> Result<&BrowserSession> {
        self.browser.as_ref().ok_or(DriverError::SessionClosed)
    }

    /// Marks the session dead when a command reports a dead process.
    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(DriverError::ProcessDied { component, detail }) = &result {
            if self.state == SessionState::Open {
                tracing::error!(%component, "session process died");
                self.logs.push(LogEntry::new(
                    LogSource::Driver,
                    LogLevel::Error,
                    format!("{component} process died: {detail}"),
                ));
                self.state = SessionState::Dead(*component);
            }
        }
        result
    }

    async fn settle(&mut self, timeout: Option<Duration>) -> Result<IdleReport> {
        self.ensure_open()?;
        let config = IdleConfig {
            poll_interval: self.config.poll_interval,
            debounce: self.config.debounce,
            timeout: timeout.unwrap_or(self.config.timeout),
        };
        let probe = SessionProbe {
            server: self.server()?,
            browser: self.browser()?,
            state_expr: &self.state_expr,
        };
        let result = wait_for_idle(&probe, &config).await;
        self.track(result)
    }

    async fn bridge<T: DeserializeOwned>(&mut self, expression: &str) -> Result<T> {
        let result = self.browser()?.bridge(expression).await;
        self.track(result)
    }

    async fn evaluate(&mut self, expression: &str) -> Result<JsValue> {
        let result = self.browser()?.evaluate(expression).await;
        self.track(result)
    }

    /// Waits until the application is idle.
    ///
    /// Idempotent: with no intervening activity a second call returns
    /// immediately.
    ///
    /// # Errors
    ///
    /// `StillBusy` with the last sampled signals when `timeout` (default:
    /// the session timeout) expires.
    pub async fn wait_for_idle(&mut self, timeout: Option<Duration>) -> Result<IdleReport> {
        self.settle(timeout).await
    }

    /// Sets several inputs at once, then waits for the application to settle.
    ///
    /// All names are validated before anything is dispatched, and the whole
    /// batch shares a single settle wait.
    ///
    /// # Errors
    ///
    /// `UnknownField` naming every input the page does not have.
    pub async fn set_inputs<I, K, V>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<JsValue>,
    {
        let values: BTreeMap<String, JsValue> = values
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.settle(None).await?;
        if values.is_empty() {
            return Ok(());
        }

        tracing::debug!(names = ?values.keys().collect::<Vec<_>>(), "setting inputs");
        let outcome: SetInputsOutcome = self
            .bridge(&bridge::set_inputs_expr(&values, self.config.input_ack_timeout))
            .await?;
        if !outcome.missing.is_empty() {
            return Err(DriverError::UnknownField(outcome.missing.join(", ")));
        }

        self.settle(None).await?;
        Ok(())
    }

    /// Clicks the first element matching `selector`, then waits to settle.
    ///
    /// # Errors
    ///
    /// `UnknownField` if nothing matches.
    pub async fn click(&mut self, selector: &str) -> Result<()> {
        self.settle(None).await?;
        let clicked: bool = self.bridge(&bridge::click_expr(selector)).await?;
        if !clicked {
            return Err(DriverError::UnknownField(selector.to_string()));
        }
        self.settle(None).await?;
        Ok(())
    }

    async fn lookup(&mut self, name: &str) -> Result<Option<JsValue>> {
        let lookup: ValueLookup = self.bridge(&bridge::value_expr(name)).await?;
        if lookup.found {
            return Ok(Some(lookup.value));
        }
        Ok(self.fetch_exports().await?.remove(name))
    }

    /// Reads one output, input, element, or exported value, in that order.
    ///
    /// # Errors
    ///
    /// `UnknownField` if no value of that name exists.
    pub async fn get_value(&mut self, name: &str) -> Result<JsValue> {
        self.settle(None).await?;
        self.lookup(name)
            .await?
            .ok_or_else(|| DriverError::UnknownField(name.to_string()))
    }

    /// Reads several named values from one settled state.
    ///
    /// # Errors
    ///
    /// `UnknownField` for the first name that does not exist.
    pub async fn get_values(&mut self, names: &[&str]) -> Result<IndexMap<String, JsValue>> {
        self.settle(None).await?;
        let mut out = IndexMap::with_capacity(names.len());
        for name in names {
            let value = self
                .lookup(name)
                .await?
                .ok_or_else(|| DriverError::UnknownField((*name).to_string()))?;
            out.insert((*name).to_string(), value);
        }
        Ok(out)
    }

    /// Reads every value of the given kinds, keyed by kind then name.
    ///
    /// # Errors
    ///
    /// Returns an error if the page or export endpoint cannot be read.
    pub async fn get_all_values(
        &mut self,
        kinds: &[ValueKind],
    ) -> Result<IndexMap<String, JsValue>> {
        self.settle(None).await?;
        self.collect_values(kinds).await
    }

    async fn collect_values(&mut self, kinds: &[ValueKind]) -> Result<IndexMap<String, JsValue>> {
        let mut page: ValuesByKind = self.bridge(&bridge::values_expr(kinds)).await?;
        let mut out = IndexMap::new();
        for kind in ValueKind::ALL.iter().filter(|k| kinds.contains(*k)) {
            let values = match kind {
                ValueKind::Export => self.fetch_exports().await?,
                ValueKind::Input | ValueKind::Output => {
                    page.remove(kind.as_str()).unwrap_or_default()
                }
            };
            out.insert(kind.to_string(), JsValue::Object(values));
        }
        Ok(out)
    }

    /// Exported values from the application's test snapshot endpoint.
    ///
    /// Empty when the application does not run in test mode.
    async fn fetch_exports(&mut self) -> Result<BTreeMap<String, JsValue>> {
        let base: Option<String> = self.bridge(&bridge::snapshot_url_expr()).await?;
        let Some(base) = base else {
            return Ok(BTreeMap::new());
        };
        let url = format!("{base}&input=0&output=0&export=1&format=json&sortC=1");
        let body: serde_json::Value = self
            .http
            .get(&url)
            .timeout(self.config.timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(match JsValue::from(body) {
            JsValue::Object(mut map) => match map.remove(ValueKind::Export.as_str()) {
                Some(JsValue::Object(exports)) => exports,
                _ => BTreeMap::new(),
            },
            _ => BTreeMap::new(),
        })
    }

    /// Evaluates `code` in the page and returns its result, awaiting
    /// promises. Waits to settle before and after.
    ///
    /// # Errors
    ///
    /// `ScriptError` with the page's message if the code throws.
    pub async fn run_js(&mut self, code: &str) -> Result<JsValue> {
        self.settle(None).await?;
        let value = self.evaluate(code).await?;
        self.settle(None).await?;
        Ok(value)
    }

    /// Markup of every element matching `selector`; empty when none match.
    ///
    /// # Errors
    ///
    /// `ScriptError` for an invalid selector.
    pub async fn get_html(&mut self, selector: &str, outer: bool) -> Result<Vec<String>> {
        self.settle(None).await?;
        self.bridge(&bridge::html_expr(selector, outer)).await
    }

    /// Text content of every element matching `selector`.
    ///
    /// # Errors
    ///
    /// `ScriptError` for an invalid selector.
    pub async fn get_text(&mut self, selector: &str) -> Result<Vec<String>> {
        self.settle(None).await?;
        self.bridge(&bridge::text_expr(selector)).await
    }

    /// Captures the full page as PNG, writing it to `path` when given.
    ///
    /// # Errors
    ///
    /// Returns an error if capture or writing fails.
    pub async fn get_screenshot(&mut self, path: Option<&Path>) -> Result<Vec<u8>> {
        self.settle(None).await?;
        let bytes = self.screenshot().await?;
        if let Some(path) = path {
            tokio::fs::write(path, &bytes).await?;
        }
        Ok(bytes)
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>> {
        let result = self.browser()?.screenshot().await;
        self.track(result)
    }

    /// Accumulated logs in arrival order, optionally filtered by source.
    ///
    /// Non-destructive. Use [`AppDriver::logs`] after the session has died
    /// or stopped.
    ///
    /// # Errors
    ///
    /// Fails like any other command once the session is unusable.
    pub async fn get_logs(&mut self, sources: Option<&[LogSource]>) -> Result<Vec<LogEntry>> {
        self.settle(None).await?;
        Ok(match sources {
            Some(sources) => self.logs.from_sources(sources),
            None => self.logs.entries(),
        })
    }

    /// The session log store, readable in any state.
    #[must_use]
    pub fn logs(&self) -> &LogStore {
        &self.logs
    }

    /// Adds a driver-sourced entry to the session log.
    pub fn log_message(&self, message: impl Into<String>) {
        self.logs
            .push(LogEntry::new(LogSource::Driver, LogLevel::Info, message));
    }

    /// Polls until `name` holds a value not in `ignore`, then returns it.
    ///
    /// Useful for outputs that update without a driver-initiated command.
    ///
    /// # Errors
    ///
    /// `WaitTimeout` if the value keeps an ignored value for `timeout`.
    pub async fn wait_for_value(
        &mut self,
        name: &str,
        ignore: &[JsValue],
        timeout: Option<Duration>,
    ) -> Result<JsValue> {
        self.ensure_open()?;
        let timeout = timeout.unwrap_or(self.config.timeout);
        let browser = self.browser()?;
        let expr = bridge::value_expr(name);
        let expr = expr.as_str();
        let result = wait_for_result(
            move || async move {
                let lookup: ValueLookup = browser.bridge(expr).await?;
                let settled = lookup.found && !ignore.contains(&lookup.value);
                Ok::<_, DriverError>(settled.then_some(lookup.value))
            },
            WaitConfig::new(timeout, self.config.poll_interval),
            || DriverError::WaitTimeout {
                condition: format!("'{name}' to take a value other than {ignore:?}"),
                timeout,
            },
        )
        .await;
        self.track(result)
    }

    /// Polls until `expr` evaluates truthy in the page, then waits to settle.
    ///
    /// # Errors
    ///
    /// `WaitTimeout` if `expr` stays falsy for `timeout`.
    pub async fn wait_for_js(&mut self, expr: &str, timeout: Option<Duration>) -> Result<()> {
        self.ensure_open()?;
        let timeout = timeout.unwrap_or(self.config.timeout);
        let browser = self.browser()?;
        let result = wait_for_result(
            move || async move {
                Ok::<_, DriverError>(browser.evaluate(expr).await?.is_truthy().then_some(()))
            },
            WaitConfig::new(timeout, self.config.poll_interval),
            || DriverError::WaitTimeout {
                condition: format!("`{expr}` to be truthy"),
                timeout,
            },
        )
        .await;
        self.track(result)?;
        self.settle(None).await?;
        Ok(())
    }

    /// The application's root URL.
    ///
    /// # Errors
    ///
    /// Fails once the session is unusable.
    pub fn get_url(&self) -> Result<String> {
        self.ensure_open()?;
        Ok(self.server()?.url().to_string())
    }

    /// The application directory.
    #[must_use]
    pub fn get_dir(&self) -> &Path {
        &self.config.app_dir
    }

    /// The resolved session configuration.
    #[must_use]
    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Directory holding this session's snapshots.
    #[must_use]
    pub fn snapshot_dir(&self) -> &Path {
        self.snapshots.dir()
    }

    /// Returns true until the session is stopped or a process dies.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    fn check_snapshot(
        &mut self,
        assertion: &'static str,
        record: SnapshotRecord,
    ) -> Result<SnapshotOutcome> {
        let outcome = self.snapshots.check(&record)?;
        self.assertions.push(AssertionResult {
            assertion,
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }

    /// Snapshots all input, output, and export values.
    ///
    /// A mismatch is returned as an outcome, not an error; use
    /// [`SnapshotOutcome::into_result`] to fail on it.
    ///
    /// # Errors
    ///
    /// `DuplicateSnapshot` for a reused name, or any infrastructure error.
    pub async fn expect_values(&mut self, name: Option<&str>) -> Result<SnapshotOutcome> {
        self.settle(None).await?;
        let name = self.snapshots.claim_name(name)?;
        let values = self.collect_values(&ValueKind::ALL).await?;
        let mut record = self.snapshots.capture(name, Some(values), None);
        if self.config.expect_values_screenshot {
            record.debug_image = Some(self.screenshot().await?);
        }
        self.check_snapshot("values", record)
    }

    /// Snapshots a full-page screenshot, compared within the configured
    /// tolerance.
    ///
    /// # Errors
    ///
    /// `DuplicateSnapshot` for a reused name, or any infrastructure error.
    pub async fn expect_screenshot(&mut self, name: Option<&str>) -> Result<SnapshotOutcome> {
        self.settle(None).await?;
        let name = self.snapshots.claim_name(name)?;
        let image = self.screenshot().await?;
        let record = self.snapshots.capture(name, None, Some(image));
        self.check_snapshot("screenshot", record)
    }

    /// Snapshots the result of evaluating `code`.
    ///
    /// # Errors
    ///
    /// `ScriptError` if the code throws, or any snapshot error.
    pub async fn expect_js(&mut self, name: Option<&str>, code: &str) -> Result<SnapshotOutcome> {
        self.settle(None).await?;
        let name = self.snapshots.claim_name(name)?;
        let value = self.evaluate(code).await?;
        let record = self
            .snapshots
            .capture(name, Some(IndexMap::from([("js".to_string(), value)])), None);
        self.check_snapshot("js", record)
    }

    /// Snapshots the text of every element matching `selector`.
    ///
    /// # Errors
    ///
    /// Any snapshot or infrastructure error.
    pub async fn expect_text(
        &mut self,
        name: Option<&str>,
        selector: &str,
    ) -> Result<SnapshotOutcome> {
        self.settle(None).await?;
        let name = self.snapshots.claim_name(name)?;
        let text: Vec<String> = self.bridge(&bridge::text_expr(selector)).await?;
        let record = self
            .snapshots
            .capture(name, Some(IndexMap::from([("text".to_string(), JsValue::from(text))])), None);
        self.check_snapshot("text", record)
    }

    /// Every snapshot assertion made so far, in order.
    #[must_use]
    pub fn assertion_results(&self) -> &[AssertionResult] {
        &self.assertions
    }

    /// Closes the browser, then stops the server.
    ///
    /// Never fails: each component's teardown error is recorded in the
    /// returned report (and logged), and a warning is emitted when both fail.
    /// Calling it again is a no-op. Every later command fails with
    /// `SessionClosed`.
    pub async fn stop(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.state == SessionState::Closed {
            return report;
        }
        self.state = SessionState::Closed;

        if let Some(browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                tracing::debug!(error = %e, "browser teardown failed");
                report.browser = Some(e.to_string());
            }
        }
        if let Some(server) = self.server.take() {
            if let Err(e) = server.stop().await {
                tracing::debug!(error = %e, "server teardown failed");
                report.server = Some(e.to_string());
            }
        }

        if let (Some(browser), Some(server)) = (&report.browser, &report.server) {
            let message = format!("teardown errors: browser: {browser}; server: {server}");
            tracing::warn!("{message}");
            self.logs
                .push(LogEntry::new(LogSource::Driver, LogLevel::Warning, message));
        }
        tracing::debug!("session stopped");
        report
    }
}

impl Drop for AppDriver {
    fn drop(&mut self) {
        // Child processes are killed by their own Drop impls.
        if self.state != SessionState::Closed {
            tracing::warn!("AppDriver dropped without stop(); killing processes");
        }
    }
}
