//! Integration tests for appdrive
//!
//! These tests need Chrome/Chromium and `python3` (used to serve a static
//! application) and are marked #[ignore] by default. Run with:
//! cargo test --package appdrive -- --ignored

use appdrive::{
    AppDriver, AppDriverConfig, DriverError, JsValue, LogSource, PlayOptions, Script,
    SnapshotOutcome, StepStatus, ValueKind,
};
use std::time::Duration;
use tempfile::TempDir;

/// An application with an echoed input, a slow button and a slow input.
///
/// The button marks the app busy through `window.appBusy` for 1.5 s and the
/// `work` input for 2 s, longer than the DOM debounce, so only the readiness
/// script keeps the driver waiting.
const ECHO_APP: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Echo</title>
</head>
<body>
    <input id="n" type="number" value="1">
    <span id="echo">1</span>
    <button id="compute">Compute</button>
    <div id="result">idle</div>
    <input id="work" type="text" value="">
    <div id="work-result">none</div>
    <script>
        document.getElementById('n').addEventListener('input', (e) => {
            document.getElementById('echo').textContent = e.target.value;
        });
        document.getElementById('compute').addEventListener('click', () => {
            window.appBusy = true;
            console.log("computing");
            setTimeout(() => {
                document.getElementById('result').textContent = 'done';
                window.appBusy = false;
            }, 1500);
        });
        document.getElementById('work').addEventListener('input', (e) => {
            window.appBusy = true;
            const value = e.target.value;
            setTimeout(() => {
                document.getElementById('work-result').textContent = 'done ' + value;
                window.appBusy = false;
            }, 2000);
        });
    </script>
</body>
</html>
"#;

fn echo_app() -> TempDir {
    let dir = tempfile::tempdir().expect("failed to create app dir");
    std::fs::write(dir.path().join("index.html"), ECHO_APP).expect("failed to write app");
    dir
}

fn config(dir: &TempDir) -> AppDriverConfig {
    let mut config = AppDriverConfig::new(dir.path())
        .with_name("echo")
        .with_command(
            "python3",
            ["-m", "http.server", "{port}", "--bind", "{host}", "--directory", "{app_dir}"]
                .map(String::from)
                .to_vec(),
        )
        .with_load_timeout(Duration::from_secs(30))
        .with_timeout(Duration::from_secs(10));
    config.readiness_script = Some("!window.appBusy".to_string());
    config
}

async fn start(dir: &TempDir) -> AppDriver {
    appdrive::logging::init_test_logger();
    AppDriver::start(config(dir))
        .await
        .expect("failed to start session")
}

#[tokio::test]
#[ignore] // Requires Chrome and python3
async fn test_set_input_updates_echo() {
    let dir = echo_app();
    let mut app = start(&dir).await;

    app.set_inputs([("n", 7)]).await.expect("set_inputs failed");
    assert_eq!(app.get_value("echo").await.expect("get_value failed"), "7");

    let values = app.get_values(&["n", "echo"]).await.expect("get_values failed");
    assert_eq!(values["n"], "7");

    assert!(app.stop().await.is_clean());
}

#[tokio::test]
#[ignore]
async fn test_click_waits_for_slow_computation() {
    let dir = echo_app();
    let mut app = start(&dir).await;

    app.click("#compute").await.expect("click failed");
    // No explicit wait: the click returned only once the app was idle.
    assert_eq!(app.get_value("result").await.expect("get_value failed"), "done");

    let logs = app
        .get_logs(Some(&[LogSource::Browser]))
        .await
        .expect("get_logs failed");
    assert!(logs.iter().any(|e| e.message.contains("computing")));

    app.stop().await;
}

#[tokio::test]
#[ignore]
async fn test_set_inputs_waits_for_slow_input() {
    let dir = echo_app();
    let mut app = start(&dir).await;

    let started = std::time::Instant::now();
    app.set_inputs([("work", "x")]).await.expect("set_inputs failed");
    assert!(started.elapsed() >= Duration::from_millis(1500));
    assert_eq!(
        app.get_value("work-result").await.expect("get_value failed"),
        "done x"
    );

    app.stop().await;
}

#[tokio::test]
#[ignore]
async fn test_short_timeout_reports_still_busy_and_session_survives() {
    appdrive::logging::init_test_logger();
    let dir = echo_app();
    let mut app = AppDriver::start(config(&dir).with_timeout(Duration::from_millis(300)))
        .await
        .expect("failed to start session");

    let err = app
        .run_js("window.appBusy = true; setTimeout(() => { window.appBusy = false; }, 3000)")
        .await
        .expect_err("should still be busy");
    let DriverError::StillBusy { last: Some(signals), .. } = &err else {
        panic!("unexpected error: {err}");
    };
    assert!(signals.app_busy);

    app.wait_for_idle(Some(Duration::from_secs(10)))
        .await
        .expect("session should recover");
    assert!(app.is_open());
    app.stop().await;
}

#[tokio::test]
#[ignore]
async fn test_unknown_input_changes_nothing() {
    let dir = echo_app();
    let mut app = start(&dir).await;

    let err = app
        .set_inputs([("n", JsValue::from(5)), ("nope", JsValue::from(1))])
        .await
        .expect_err("unknown input should fail");
    assert!(matches!(err, DriverError::UnknownField(ref names) if names == "nope"));
    assert_eq!(app.get_value("echo").await.expect("get_value failed"), "1");

    let err = app.click("#missing").await.expect_err("missing element");
    assert!(matches!(err, DriverError::UnknownField(_)));

    app.stop().await;
}

#[tokio::test]
#[ignore]
async fn test_script_errors_and_wait_timeouts() {
    let dir = echo_app();
    let mut app = start(&dir).await;

    let err = app
        .run_js("throw new Error('kaboom')")
        .await
        .expect_err("script should throw");
    assert!(matches!(err, DriverError::ScriptError(ref msg) if msg.contains("kaboom")));

    let value = app.run_js("Promise.resolve(40 + 2)").await.expect("run_js failed");
    assert_eq!(value, JsValue::from(42));

    let err = app
        .wait_for_js("window.neverSet === true", Some(Duration::from_millis(300)))
        .await
        .expect_err("condition never holds");
    assert!(matches!(err, DriverError::WaitTimeout { .. }));

    let text = app.get_text("#result").await.expect("get_text failed");
    assert_eq!(text, ["idle"]);
    let html = app.get_html("#echo", true).await.expect("get_html failed");
    assert_eq!(html, [r#"<span id="echo">1</span>"#]);

    app.stop().await;
}

#[tokio::test]
#[ignore]
async fn test_first_snapshot_is_new_then_matches() {
    let dir = echo_app();

    let mut app = start(&dir).await;
    let first = app
        .expect_values(Some("initial"))
        .await
        .expect("expect_values failed");
    assert!(matches!(first, SnapshotOutcome::New { .. }));
    let snap_dir = app.snapshot_dir().to_path_buf();
    app.stop().await;

    assert!(snap_dir.join("initial.json").exists());
    assert!(snap_dir.join("initial_.png").exists());

    let mut app = start(&dir).await;
    let second = app
        .expect_values(Some("initial"))
        .await
        .expect("expect_values failed");
    assert!(matches!(second, SnapshotOutcome::Match { .. }), "{second:?}");

    let err = app
        .expect_values(Some("initial"))
        .await
        .expect_err("duplicate name");
    assert!(matches!(err, DriverError::DuplicateSnapshot(_)));
    app.stop().await;
}

#[tokio::test]
#[ignore]
async fn test_changed_value_is_a_mismatch() {
    let dir = echo_app();

    let mut app = start(&dir).await;
    app.expect_js(Some("echo-text"), "document.getElementById('echo').textContent")
        .await
        .expect("expect_js failed");
    app.stop().await;

    let mut app = start(&dir).await;
    app.set_inputs([("n", 3)]).await.expect("set_inputs failed");
    let outcome = app
        .expect_js(Some("echo-text"), "document.getElementById('echo').textContent")
        .await
        .expect("expect_js failed");
    let SnapshotOutcome::Mismatch(diff) = &outcome else {
        panic!("expected a mismatch, got {outcome:?}");
    };
    assert_eq!(diff.to_string(), r#"  ~ js: "1" -> "3""#);
    assert_eq!(app.assertion_results().len(), 1);
    assert!(app.snapshot_dir().join("echo-text.new.json").exists());
    app.stop().await;
}

#[tokio::test]
#[ignore]
async fn test_commands_after_stop_fail() {
    let dir = echo_app();
    let mut app = start(&dir).await;
    let url = app.get_url().expect("get_url failed");
    assert!(url.starts_with("http://127.0.0.1:"));

    assert!(app.stop().await.is_clean());
    assert!(app.stop().await.is_clean(), "second stop is a no-op");

    let err = app.get_value("echo").await.expect_err("session is closed");
    assert!(matches!(err, DriverError::SessionClosed));
    assert!(matches!(app.get_url(), Err(DriverError::SessionClosed)));

    // Logs stay readable after the session ends.
    assert!(!app.logs().is_empty());
}

#[tokio::test]
#[ignore]
async fn test_all_values_include_every_kind() {
    let dir = echo_app();
    let mut app = start(&dir).await;

    let values = app
        .get_all_values(&ValueKind::ALL)
        .await
        .expect("get_all_values failed");
    let kinds: Vec<&str> = values.keys().map(String::as_str).collect();
    assert_eq!(kinds, ["input", "output", "export"]);

    app.stop().await;
}

#[tokio::test]
#[ignore]
async fn test_script_playback() {
    let dir = echo_app();
    let mut app = start(&dir).await;

    let script = Script::from_json(
        r##"{
            "name": "echo",
            "steps": [
                { "action": "set_inputs", "values": { "n": 9 } },
                { "action": "click", "selector": "#compute" },
                { "action": "wait_for_value", "name": "result", "ignore": ["idle"] },
                { "action": "expect_values", "name": "played" }
            ]
        }"##,
    )
    .expect("script should parse");

    let report = appdrive::play(&mut app, &script, PlayOptions::default()).await;
    assert!(report.passed(), "{report:?}");
    assert!(report.steps.iter().all(|s| s.status == StepStatus::Passed));
    assert_eq!(app.get_value("echo").await.expect("get_value failed"), "9");

    app.stop().await;
}
