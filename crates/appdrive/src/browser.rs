//! Headless browser session.
//!
//! `BrowserSession` launches Chrome, opens the single page a session drives,
//! registers the in-page bridge, and turns protocol events into log entries
//! and an in-flight request count. All evaluation goes through
//! [`BrowserSession::evaluate`], which bounds every round-trip and converts
//! a vanished browser into `ProcessDied`.
//!
//! # Resource Safety
//!
//! Dropping a session kills Chrome through chromiumoxide's own `Drop` and
//! removes the temporary profile directory. `close()` is still preferred: it
//! shuts down gracefully first.

use crate::bridge::{self, BRIDGE_SCRIPT};
use crate::config::ResolvedConfig;
use crate::error::{Component, DriverError, Result};
use crate::log::{
    LogEntry, LogLevel, LogSource, LogStore, parse_console_event, parse_exception_event,
};
use crate::sync::{WaitConfig, wait_for_result};
use crate::value::JsValue;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
    EventResponseReceived, ResourceType,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, CaptureScreenshotFormat,
};
use chromiumoxide::cdp::js_protocol::runtime::{
    EvaluateParams, EventConsoleApiCalled, EventExceptionThrown,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Lower bound for a single protocol round-trip.
const MIN_PROTOCOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for a graceful browser shutdown before it is killed.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

const PROFILE_PREFIX: &str = "appdrive-";

/// Requests the page has started but not finished, keyed by request id.
///
/// Streaming transports (event streams, `data:` URLs) never finish in the
/// ordinary sense and are not tracked.
#[derive(Debug, Clone, Default)]
pub(crate) struct NetworkTracker {
    pending: Arc<std::sync::Mutex<HashMap<String, String>>>,
}

impl NetworkTracker {
    pub(crate) fn started(&self, id: String, url: String) {
        self.lock().insert(id, url);
    }

    /// Marks a request complete and returns its URL if it was tracked.
    pub(crate) fn finished(&self, id: &str) -> Option<String> {
        self.lock().remove(id)
    }

    pub(crate) fn pending(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_tracked(kind: Option<&ResourceType>, url: &str) -> bool {
    !matches!(kind, Some(ResourceType::EventSource | ResourceType::WebSocket))
        && !url.starts_with("data:")
}

/// The browser process and the page under test.
pub struct BrowserSession {
    browser: Mutex<Option<Browser>>,
    page: Page,
    alive: Arc<AtomicBool>,
    network: NetworkTracker,
    user_data_dir: TempDir,
    protocol_timeout: Duration,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for BrowserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserSession")
            .field("alive", &self.is_alive())
            .field("user_data_dir", &self.user_data_dir.path())
            .finish_non_exhaustive()
    }
}

fn browser_config(
    config: &ResolvedConfig,
    user_data_dir: &Path,
    protocol_timeout: Duration,
) -> Result<BrowserConfig> {
    let (width, height) = config.window_size;
    let mut builder = BrowserConfig::builder()
        .window_size(width, height)
        .viewport(Viewport {
            width,
            height,
            ..Viewport::default()
        })
        .user_data_dir(user_data_dir)
        .request_timeout(protocol_timeout);

    if config.view || cfg!(feature = "visible") {
        builder = builder.with_head();
    }

    // The sandbox needs user namespaces, which containers usually lack.
    if !config.sandbox {
        builder = builder.no_sandbox();
    }

    for arg in &config.browser_args {
        builder = builder.arg(arg.clone());
    }

    if let Some(path) = &config.chrome_path {
        builder = builder.chrome_executable(path);
    }

    builder.build().map_err(|e| DriverError::LaunchFailed {
        reason: format!("invalid browser configuration: {e}"),
        source: None,
    })
}

fn new_profile() -> Result<TempDir> {
    Ok(tempfile::Builder::new().prefix(PROFILE_PREFIX).tempdir()?)
}

impl BrowserSession {
    /// Launches Chrome and prepares a blank page with the bridge registered
    /// and event capture running.
    ///
    /// # Errors
    ///
    /// `LaunchFailed` if Chrome cannot be found or started.
    pub async fn launch(config: &ResolvedConfig, logs: LogStore) -> Result<Self> {
        let protocol_timeout = config.load_timeout.max(MIN_PROTOCOL_TIMEOUT);
        // A fresh profile per session avoids ProcessSingleton conflicts
        // between parallel sessions. Removed on drop if launch fails.
        let user_data_dir = new_profile()?;
        let browser_config = browser_config(config, user_data_dir.path(), protocol_timeout)?;

        tracing::debug!(headless = !config.view, sandbox = config.sandbox, "launching browser");

        let (browser, mut handler) =
            Browser::launch(browser_config)
                .await
                .map_err(|e| DriverError::LaunchFailed {
                    reason: "failed to launch Chrome process".to_string(),
                    source: Some(Box::new(e)),
                })?;

        let alive = Arc::new(AtomicBool::new(true));
        let alive_flag = alive.clone();
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::trace!("browser handler error: {e}");
                }
            }
            alive_flag.store(false, Ordering::SeqCst);
            tracing::debug!("browser connection closed");
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                handler_task.abort();
                return Err(DriverError::LaunchFailed {
                    reason: "browser started but no page could be opened".to_string(),
                    source: Some(Box::new(e)),
                });
            }
        };

        let session = Self {
            browser: Mutex::new(Some(browser)),
            page,
            alive,
            network: NetworkTracker::default(),
            user_data_dir,
            protocol_timeout,
            tasks: std::sync::Mutex::new(vec![handler_task]),
        };

        if let Err(e) = session.prepare_page(logs).await {
            let _ = session.close().await;
            return Err(e);
        }

        tracing::debug!("browser launched");
        Ok(session)
    }

    /// Starts event capture and registers the bridge for every new document.
    async fn prepare_page(&self, logs: LogStore) -> Result<()> {
        let mut console = self.page.event_listener::<EventConsoleApiCalled>().await?;
        let console_logs = logs.clone();
        self.spawn(async move {
            while let Some(event) = console.next().await {
                console_logs.push(parse_console_event(&event));
            }
        });

        let mut exceptions = self.page.event_listener::<EventExceptionThrown>().await?;
        let exception_logs = logs.clone();
        self.spawn(async move {
            while let Some(event) = exceptions.next().await {
                exception_logs.push(parse_exception_event(&event));
            }
        });

        let mut requests = self.page.event_listener::<EventRequestWillBeSent>().await?;
        let tracker = self.network.clone();
        self.spawn(async move {
            while let Some(event) = requests.next().await {
                if is_tracked(event.r#type.as_ref(), &event.request.url) {
                    tracker.started(event.request_id.inner().clone(), event.request.url.clone());
                }
            }
        });

        let mut finished = self.page.event_listener::<EventLoadingFinished>().await?;
        let tracker = self.network.clone();
        self.spawn(async move {
            while let Some(event) = finished.next().await {
                tracker.finished(event.request_id.inner());
            }
        });

        let mut failed = self.page.event_listener::<EventLoadingFailed>().await?;
        let tracker = self.network.clone();
        let failed_logs = logs.clone();
        self.spawn(async move {
            while let Some(event) = failed.next().await {
                let url = tracker.finished(event.request_id.inner());
                if event.canceled != Some(true) {
                    let url = url.unwrap_or_else(|| "<unknown url>".to_string());
                    failed_logs.push(LogEntry::new(
                        LogSource::Network,
                        LogLevel::Error,
                        format!("{url} failed: {}", event.error_text),
                    ));
                }
            }
        });

        let mut responses = self.page.event_listener::<EventResponseReceived>().await?;
        self.spawn(async move {
            while let Some(event) = responses.next().await {
                let response = &event.response;
                if response.status >= 400 {
                    logs.push(LogEntry::new(
                        LogSource::Network,
                        LogLevel::Error,
                        format!("{} -> {} {}", response.url, response.status, response.status_text),
                    ));
                }
            }
        });

        self.page.execute(EnableParams::default()).await?;
        self.page
            .execute(AddScriptToEvaluateOnNewDocumentParams::new(BRIDGE_SCRIPT))
            .await?;
        Ok(())
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tokio::spawn(task));
    }

    /// Returns true while the protocol connection is open.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Fails with `ProcessDied` once the browser has gone away.
    ///
    /// # Errors
    ///
    /// `ProcessDied` if the connection closed or the Chrome process exited.
    pub async fn check_alive(&self) -> Result<()> {
        if !self.is_alive() {
            return Err(self.died("protocol connection closed"));
        }
        let mut guard = self.browser.lock().await;
        if let Some(browser) = guard.as_mut() {
            if let Ok(Some(status)) = browser.try_wait() {
                self.alive.store(false, Ordering::SeqCst);
                return Err(self.died(&format!("Chrome exited with {status}")));
            }
        }
        Ok(())
    }

    fn died(&self, detail: &str) -> DriverError {
        DriverError::ProcessDied {
            component: Component::Browser,
            detail: detail.to_string(),
        }
    }

    fn map_cdp(&self, error: CdpError) -> DriverError {
        match error {
            CdpError::JavascriptException(details) => DriverError::ScriptError(
                details
                    .exception
                    .as_ref()
                    .and_then(|e| e.description.clone())
                    .unwrap_or_else(|| details.text.clone()),
            ),
            _ if !self.is_alive() => self.died(&error.to_string()),
            other => DriverError::Browser(other.to_string()),
        }
    }

    /// Runs one protocol round-trip under the protocol timeout.
    async fn round_trip<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, CdpError>>,
    {
        if !self.is_alive() {
            return Err(self.died("protocol connection closed"));
        }
        match tokio::time::timeout(self.protocol_timeout, fut).await {
            Ok(result) => result.map_err(|e| self.map_cdp(e)),
            Err(_) if !self.is_alive() => Err(self.died("protocol connection closed")),
            Err(_) => Err(DriverError::ProtocolTimeout {
                operation: operation.to_string(),
                timeout: self.protocol_timeout,
            }),
        }
    }

    /// Navigates to `url` and waits until the document has loaded.
    ///
    /// # Errors
    ///
    /// `PageLoadTimeout` if the document is not complete within `timeout`.
    pub async fn navigate(&self, url: &str, timeout: Duration) -> Result<()> {
        tracing::debug!(%url, "navigating");
        let load_timeout = || DriverError::PageLoadTimeout {
            url: url.to_string(),
            timeout,
        };

        match tokio::time::timeout(timeout, self.page.goto(url)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(self.map_cdp(e)),
            Err(_) => return Err(load_timeout()),
        }

        wait_for_result(
            || async {
                let state = self.evaluate("document.readyState").await?;
                Ok::<_, DriverError>((state == "complete").then_some(()))
            },
            WaitConfig::with_timeout(timeout),
            load_timeout,
        )
        .await
    }

    /// Evaluates `expression` in the page, awaiting promises.
    ///
    /// # Errors
    ///
    /// `ScriptError` if the script throws, `ProcessDied` if the browser is
    /// gone, `ProtocolTimeout` if the round-trip stalls.
    pub async fn evaluate(&self, expression: &str) -> Result<JsValue> {
        let params = EvaluateParams::builder()
            .expression(expression)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(DriverError::Browser)?;

        let result = self
            .round_trip("Runtime.evaluate", self.page.evaluate_expression(params))
            .await?;
        Ok(result.value().cloned().map(JsValue::from).unwrap_or_default())
    }

    /// Calls into the bridge and decodes the result.
    ///
    /// Documents that predate bridge registration get it installed on demand.
    pub(crate) async fn bridge<T: DeserializeOwned>(&self, expression: &str) -> Result<T> {
        let value = match self.evaluate(expression).await {
            Err(DriverError::ScriptError(message)) if bridge::is_missing_bridge(&message) => {
                tracing::debug!("installing bridge into current document");
                self.evaluate(BRIDGE_SCRIPT).await?;
                self.evaluate(expression).await?
            }
            other => other?,
        };
        Ok(serde_json::from_value(value.to_json())?)
    }

    /// Requests started by the page that have not yet completed.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.network.pending()
    }

    /// Captures the full page as PNG.
    ///
    /// # Errors
    ///
    /// Returns an error if capture fails or the browser is gone.
    pub async fn screenshot(&self) -> Result<Vec<u8>> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        self.round_trip("Page.captureScreenshot", self.page.screenshot(params))
            .await
    }

    /// Shuts the browser down and removes its profile directory.
    ///
    /// Safe to call repeatedly and after the browser has died.
    ///
    /// # Errors
    ///
    /// `Io` if the profile directory cannot be removed.
    pub async fn close(&self) -> Result<()> {
        let browser = self.browser.lock().await.take();

        if let Some(mut browser) = browser {
            let graceful = self.is_alive()
                && matches!(
                    tokio::time::timeout(CLOSE_TIMEOUT, browser.close()).await,
                    Ok(Ok(_))
                );
            if graceful {
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, browser.wait()).await;
            } else {
                tracing::debug!("killing browser");
                let _ = browser.kill().await;
            }
        }

        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        self.alive.store(false, Ordering::SeqCst);

        match tokio::fs::remove_dir_all(self.user_data_dir.path()).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppDriverConfig;

    #[test]
    fn tracker_counts_in_flight_requests() {
        let tracker = NetworkTracker::default();
        tracker.started("1".into(), "http://app/a.js".into());
        tracker.started("2".into(), "http://app/b.css".into());
        // Redirects reuse the request id.
        tracker.started("2".into(), "http://app/c.css".into());
        assert_eq!(tracker.pending(), 2);

        assert_eq!(tracker.finished("1").as_deref(), Some("http://app/a.js"));
        assert_eq!(tracker.finished("1"), None);
        assert_eq!(tracker.pending(), 1);
    }

    #[test]
    fn streaming_requests_are_not_tracked() {
        assert!(!is_tracked(Some(&ResourceType::EventSource), "http://app/events"));
        assert!(!is_tracked(Some(&ResourceType::WebSocket), "ws://app/websocket/"));
        assert!(!is_tracked(None, "data:image/png;base64,AAAA"));
        assert!(is_tracked(Some(&ResourceType::Xhr), "http://app/session/1/download"));
    }

    #[test]
    fn browser_config_builds_for_ci() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppDriverConfig {
            ci: Some(true),
            ..AppDriverConfig::new(dir.path())
        }
        .resolve()
        .unwrap();
        let profile = dir.path().join("profile");
        // Building fails only when no Chrome can be located, which is an
        // environment property rather than a configuration error.
        if let Err(e) = browser_config(&config, &profile, MIN_PROTOCOL_TIMEOUT) {
            assert!(matches!(e, DriverError::LaunchFailed { .. }));
        }
    }

    fn profiles() -> Vec<std::path::PathBuf> {
        std::fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(PROFILE_PREFIX))
            })
            .collect()
    }

    #[tokio::test]
    async fn failed_launch_leaves_no_profile_behind() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppDriverConfig {
            chrome_path: Some(dir.path().join("no-such-chrome")),
            ..AppDriverConfig::new(dir.path())
        }
        .resolve()
        .unwrap();
        let before = profiles();

        let err = BrowserSession::launch(&config, LogStore::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::LaunchFailed { .. }));
        assert!(profiles().iter().all(|p| before.contains(p)));
    }

    #[test]
    fn profile_is_removed_on_drop() {
        let profile = new_profile().unwrap();
        let path = profile.path().to_path_buf();
        assert!(path.is_dir());
        drop(profile);
        assert!(!path.exists());
    }

    #[tokio::test]
    #[ignore] // Requires Chrome to be installed
    async fn launch_evaluate_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppDriverConfig::new(dir.path()).resolve().unwrap();
        let session = BrowserSession::launch(&config, LogStore::new())
            .await
            .expect("failed to launch browser");

        let value = session.evaluate("1 + 2").await.unwrap();
        assert_eq!(value.as_f64(), Some(3.0));

        let err = session.evaluate("throw new Error('boom')").await.unwrap_err();
        assert!(matches!(err, DriverError::ScriptError(ref m) if m.contains("boom")));

        session.close().await.expect("failed to close browser");
        assert!(!session.is_alive());
        session.close().await.expect("second close is a no-op");
    }
}
