//! Replay of recorded interaction scripts.
//!
//! A script is a JSON document listing steps in order:
//!
//! ```json
//! {
//!   "name": "slider",
//!   "steps": [
//!     { "action": "set_inputs", "values": { "n": 7 } },
//!     { "action": "expect_values", "name": "after-slide" }
//!   ]
//! }
//! ```
//!
//! Steps run one at a time against a [`StepTarget`] (normally an
//! [`AppDriver`]). A snapshot mismatch fails its step and playback moves on,
//! unless `stop_on_failure` is set. Any other error aborts playback and the
//! remaining steps are reported as skipped.

use crate::driver::AppDriver;
use crate::error::{DriverError, Result};
use crate::snapshot::SnapshotOutcome;
use crate::value::JsValue;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

/// One recorded action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Set several inputs at once
    SetInputs {
        /// Input name to value
        values: IndexMap<String, JsValue>,
    },
    /// Click the first element matching a selector
    Click {
        /// CSS selector
        selector: String,
    },
    /// Evaluate script in the page
    RunJs {
        /// Script source
        code: String,
    },
    /// Wait for the application to settle
    WaitForIdle {
        /// Overrides the session timeout
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// Wait for a value to leave a set of ignored values
    WaitForValue {
        /// Value name
        name: String,
        /// Values that keep the wait going
        #[serde(default)]
        ignore: Vec<JsValue>,
        /// Overrides the session timeout
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// Snapshot all values
    ExpectValues {
        /// Snapshot name; auto-numbered when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Snapshot a screenshot
    ExpectScreenshot {
        /// Snapshot name; auto-numbered when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::SetInputs { values } => {
                let names: Vec<&str> = values.keys().map(String::as_str).collect();
                write!(f, "set_inputs({})", names.join(", "))
            }
            Step::Click { selector } => write!(f, "click({selector})"),
            Step::RunJs { .. } => f.write_str("run_js"),
            Step::WaitForIdle { .. } => f.write_str("wait_for_idle"),
            Step::WaitForValue { name, .. } => write!(f, "wait_for_value({name})"),
            Step::ExpectValues { name } => {
                write!(f, "expect_values({})", name.as_deref().unwrap_or("-"))
            }
            Step::ExpectScreenshot { name } => {
                write!(f, "expect_screenshot({})", name.as_deref().unwrap_or("-"))
            }
        }
    }
}

/// A recorded interaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Script {
    /// Optional label for reports
    #[serde(default)]
    pub name: Option<String>,
    /// Steps in execution order
    pub steps: Vec<Step>,
}

impl Script {
    /// Parses a script from JSON.
    ///
    /// # Errors
    ///
    /// `Json` for malformed documents or unknown actions.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a script file.
    ///
    /// # Errors
    ///
    /// `Io` if the file cannot be read, `Json` if it does not parse.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }
}

/// How one step ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StepStatus {
    /// The step ran and any assertion held
    Passed,
    /// A snapshot did not match its baseline
    Failed(String),
    /// The step did not run
    Skipped,
}

/// Result of one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    /// Zero-based position in the script
    pub index: usize,
    /// Short description of the step
    pub step: String,
    /// How it ended
    pub status: StepStatus,
    /// Time spent running it
    pub duration: Duration,
}

/// Result of playing a whole script.
#[derive(Debug, Default)]
pub struct PlaybackReport {
    /// One entry per step, in script order
    pub steps: Vec<StepResult>,
    /// The error that aborted playback, if any
    pub aborted: Option<DriverError>,
}

impl PlaybackReport {
    /// Returns true when every step passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.aborted.is_none() && self.steps.iter().all(|s| s.status == StepStatus::Passed)
    }

    /// Steps that failed an assertion.
    pub fn failures(&self) -> impl Iterator<Item = &StepResult> {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Failed(_)))
    }
}

/// Playback options.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlayOptions {
    /// Stop at the first failed assertion instead of continuing.
    pub stop_on_failure: bool,
}

/// Something steps can run against.
#[async_trait]
pub trait StepTarget: Send {
    /// Runs one step. `Ok(Some(outcome))` for snapshot steps.
    async fn run_step(&mut self, step: &Step) -> Result<Option<SnapshotOutcome>>;
}

#[async_trait]
impl StepTarget for AppDriver {
    async fn run_step(&mut self, step: &Step) -> Result<Option<SnapshotOutcome>> {
        let ms = |t: &Option<u64>| t.map(Duration::from_millis);
        match step {
            Step::SetInputs { values } => self.set_inputs(values.clone()).await?,
            Step::Click { selector } => self.click(selector).await?,
            Step::RunJs { code } => {
                self.run_js(code).await?;
            }
            Step::WaitForIdle { timeout_ms } => {
                self.wait_for_idle(ms(timeout_ms)).await?;
            }
            Step::WaitForValue {
                name,
                ignore,
                timeout_ms,
            } => {
                self.wait_for_value(name, ignore, ms(timeout_ms)).await?;
            }
            Step::ExpectValues { name } => {
                return self.expect_values(name.as_deref()).await.map(Some);
            }
            Step::ExpectScreenshot { name } => {
                return self.expect_screenshot(name.as_deref()).await.map(Some);
            }
        }
        Ok(None)
    }
}

/// Plays `script` against `target`.
pub async fn play(
    target: &mut dyn StepTarget,
    script: &Script,
    options: PlayOptions,
) -> PlaybackReport {
    let mut report = PlaybackReport::default();
    let label = script.name.as_deref().unwrap_or("script");
    tracing::info!(script = label, steps = script.steps.len(), "playing script");

    let mut halted = false;
    for (index, step) in script.steps.iter().enumerate() {
        let description = step.to_string();
        if halted {
            report.steps.push(StepResult {
                index,
                step: description,
                status: StepStatus::Skipped,
                duration: Duration::ZERO,
            });
            continue;
        }

        let start = Instant::now();
        let status = match target.run_step(step).await {
            Ok(Some(SnapshotOutcome::Mismatch(diff))) => StepStatus::Failed(format!(
                "snapshot '{}' differs from baseline:\n{diff}",
                diff.name
            )),
            Ok(_) => StepStatus::Passed,
            Err(e) if e.is_assertion() => StepStatus::Failed(e.to_string()),
            Err(e) => {
                tracing::warn!(step = %description, error = %e, "playback aborted");
                report.aborted = Some(e);
                halted = true;
                StepStatus::Skipped
            }
        };

        if let StepStatus::Failed(reason) = &status {
            tracing::debug!(step = %description, "{reason}");
            halted = options.stop_on_failure;
        }
        report.steps.push(StepResult {
            index,
            step: description,
            status,
            duration: start.elapsed(),
        });
    }

    if !report.passed() {
        let failed = report.failures().count();
        tracing::info!(
            script = label,
            failed,
            aborted = report.aborted.is_some(),
            "playback finished with problems"
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::SnapshotDiff;
    use crate::error::Component;

    const SCRIPT: &str = r##"{
        "name": "slider",
        "steps": [
            { "action": "set_inputs", "values": { "n": 7, "label": "seven" } },
            { "action": "click", "selector": "#go" },
            { "action": "wait_for_value", "name": "out", "ignore": [null, ""] },
            { "action": "expect_values", "name": "after" },
            { "action": "expect_screenshot" }
        ]
    }"##;

    /// Answers steps from a fixed list of outcomes.
    struct Fake {
        outcomes: Vec<Result<Option<SnapshotOutcome>>>,
        seen: Vec<String>,
    }

    #[async_trait]
    impl StepTarget for Fake {
        async fn run_step(&mut self, step: &Step) -> Result<Option<SnapshotOutcome>> {
            self.seen.push(step.to_string());
            if self.outcomes.is_empty() {
                Ok(None)
            } else {
                self.outcomes.remove(0)
            }
        }
    }

    fn mismatch(name: &str) -> SnapshotOutcome {
        SnapshotOutcome::Mismatch(SnapshotDiff {
            name: name.into(),
            items: vec![],
            image: None,
        })
    }

    #[test]
    fn parses_recorded_script() {
        let script = Script::from_json(SCRIPT).unwrap();
        assert_eq!(script.name.as_deref(), Some("slider"));
        assert_eq!(script.steps.len(), 5);
        match &script.steps[0] {
            Step::SetInputs { values } => {
                assert_eq!(values.keys().collect::<Vec<_>>(), ["n", "label"]);
                assert_eq!(values["n"], JsValue::from(7));
            }
            other => panic!("unexpected step {other:?}"),
        }
        assert_eq!(
            script.steps[2],
            Step::WaitForValue {
                name: "out".into(),
                ignore: vec![JsValue::Null, JsValue::from("")],
                timeout_ms: None,
            }
        );
        assert_eq!(script.steps[4], Step::ExpectScreenshot { name: None });
    }

    #[test]
    fn rejects_unknown_action() {
        let err = Script::from_json(r#"{"steps":[{"action":"hover"}]}"#).unwrap_err();
        assert!(matches!(err, DriverError::Json(_)));
    }

    #[test]
    fn step_descriptions() {
        let script = Script::from_json(SCRIPT).unwrap();
        let names: Vec<String> = script.steps.iter().map(ToString::to_string).collect();
        insta::assert_debug_snapshot!(names, @r#"
        [
            "set_inputs(n, label)",
            "click(#go)",
            "wait_for_value(out)",
            "expect_values(after)",
            "expect_screenshot(-)",
        ]
        "#);
    }

    #[tokio::test]
    async fn mismatch_fails_step_and_continues() {
        let script = Script::from_json(SCRIPT).unwrap();
        let mut fake = Fake {
            outcomes: vec![Ok(None), Ok(None), Ok(None), Ok(Some(mismatch("after")))],
            seen: vec![],
        };
        let report = play(&mut fake, &script, PlayOptions::default()).await;

        assert!(!report.passed());
        assert!(report.aborted.is_none());
        assert_eq!(fake.seen.len(), 5);
        let failed: Vec<usize> = report.failures().map(|s| s.index).collect();
        assert_eq!(failed, [3]);
        assert_eq!(report.steps[4].status, StepStatus::Passed);
    }

    #[tokio::test]
    async fn stop_on_failure_skips_the_rest() {
        let script = Script::from_json(SCRIPT).unwrap();
        let mut fake = Fake {
            outcomes: vec![Ok(None), Ok(None), Ok(None), Ok(Some(mismatch("after")))],
            seen: vec![],
        };
        let options = PlayOptions {
            stop_on_failure: true,
        };
        let report = play(&mut fake, &script, options).await;

        assert_eq!(fake.seen.len(), 4);
        assert_eq!(report.steps[4].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn error_aborts_playback() {
        let script = Script::from_json(SCRIPT).unwrap();
        let mut fake = Fake {
            outcomes: vec![
                Ok(None),
                Err(DriverError::ProcessDied {
                    component: Component::Server,
                    detail: "exit status: 1".into(),
                }),
            ],
            seen: vec![],
        };
        let report = play(&mut fake, &script, PlayOptions::default()).await;

        assert_eq!(fake.seen.len(), 2);
        assert!(matches!(report.aborted, Some(DriverError::ProcessDied { .. })));
        let statuses: Vec<&StepStatus> = report.steps.iter().map(|s| &s.status).collect();
        assert_eq!(
            statuses,
            [
                &StepStatus::Passed,
                &StepStatus::Skipped,
                &StepStatus::Skipped,
                &StepStatus::Skipped,
                &StepStatus::Skipped
            ]
        );
    }
}
