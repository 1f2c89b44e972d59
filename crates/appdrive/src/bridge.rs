//! The in-page bridge.
//!
//! `bridge.js` is registered to run before any application script on every
//! new document. It tracks DOM mutations and unacknowledged inputs, and
//! exposes read/write helpers under `window.__appdrive__`. This module
//! builds the expressions that call into it and decodes their results.
//!
//! Arguments are embedded as JSON literals, so user-supplied names,
//! selectors, and values never need manual escaping.

use crate::value::{JsValue, ValueKind};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;

/// Source of the bridge, evaluated on every new document.
pub(crate) const BRIDGE_SCRIPT: &str = include_str!("bridge.js");

const NAMESPACE: &str = "window.__appdrive__";

/// Thrown by guarded calls when the current document has no bridge.
const MISSING_BRIDGE: &str = "appdrive bridge not installed";

/// Page-side view of readiness, as reported by `state()`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PageState {
    pub ms_since_mutation: f64,
    pub busy_class: bool,
    pub pending_inputs: usize,
    pub connected: bool,
    pub ready_state: String,
    pub busy: bool,
}

impl PageState {
    pub(crate) fn quiet_for(&self) -> Duration {
        Duration::from_secs_f64(self.ms_since_mutation.max(0.0) / 1000.0)
    }
}

/// Result of looking up one named value.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct ValueLookup {
    pub found: bool,
    #[serde(default)]
    pub value: JsValue,
}

/// Names the page could not resolve to an input.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct SetInputsOutcome {
    pub missing: Vec<String>,
}

/// Input and output values keyed by kind, then by name.
pub(crate) type ValuesByKind = BTreeMap<String, BTreeMap<String, JsValue>>;

fn invoke(method: &str, args: &[Value]) -> String {
    let args = args
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!("{NAMESPACE}.{method}({args})")
}

fn guard(body: &str) -> String {
    format!("({NAMESPACE} ? {body} : (() => {{ throw new Error(\"{MISSING_BRIDGE}\"); }})())")
}

fn call(method: &str, args: &[Value]) -> String {
    guard(&invoke(method, args))
}

/// `state()` with an optional app-defined readiness expression.
///
/// The readiness expression is guarded so that a throwing or not-yet-defined
/// hook reads as "busy" rather than failing the probe.
pub(crate) fn state_expr(readiness_script: Option<&str>) -> String {
    match readiness_script {
        Some(script) => guard(&format!(
            "{NAMESPACE}.state((function () {{ try {{ return !!({script}); }} catch (e) {{ return false; }} }})())"
        )),
        None => call("state", &[]),
    }
}

/// `values()` for the page-visible kinds. Exports are not visible in the page.
pub(crate) fn values_expr(kinds: &[ValueKind]) -> String {
    let kinds: Vec<&str> = kinds
        .iter()
        .filter(|k| **k != ValueKind::Export)
        .map(ValueKind::as_str)
        .collect();
    call("values", &[json!(kinds)])
}

pub(crate) fn value_expr(name: &str) -> String {
    call("value", &[json!(name)])
}

pub(crate) fn set_inputs_expr(values: &BTreeMap<String, JsValue>, ack_timeout: Duration) -> String {
    let values: serde_json::Map<String, Value> = values
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect();
    let ack_ms = u64::try_from(ack_timeout.as_millis()).unwrap_or(u64::MAX);
    call("setInputs", &[Value::Object(values), json!(ack_ms)])
}

pub(crate) fn click_expr(selector: &str) -> String {
    call("click", &[json!(selector)])
}

pub(crate) fn html_expr(selector: &str, outer: bool) -> String {
    call("html", &[json!(selector), json!(outer)])
}

pub(crate) fn text_expr(selector: &str) -> String {
    call("text", &[json!(selector)])
}

pub(crate) fn duplicate_ids_expr() -> String {
    call("duplicateIds", &[])
}

pub(crate) fn snapshot_url_expr() -> String {
    call("snapshotUrl", &[])
}

/// Whether a script error means the bridge is absent from the current
/// document (e.g. a page that was loaded before registration).
pub(crate) fn is_missing_bridge(message: &str) -> bool {
    message.contains(MISSING_BRIDGE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_are_json_escaped() {
        insta::assert_snapshot!(
            invoke("value", &[json!(r#"it's "quoted""#)]),
            @r#"window.__appdrive__.value("it's \"quoted\"")"#
        );
        insta::assert_snapshot!(
            invoke("html", &[json!("#out > p"), json!(true)]),
            @r##"window.__appdrive__.html("#out > p", true)"##
        );
    }

    #[test]
    fn set_inputs_embeds_values_and_ack_window() {
        let mut values = BTreeMap::new();
        values.insert("n".to_string(), JsValue::from(7));
        values.insert("label".to_string(), JsValue::from("a\nb"));
        let expr = set_inputs_expr(&values, Duration::from_secs(3));
        assert!(
            expr.contains(r#"window.__appdrive__.setInputs({"label":"a\nb","n":7}, 3000)"#),
            "{expr}"
        );
    }

    #[test]
    fn exports_are_not_requested_from_the_page() {
        assert!(values_expr(&ValueKind::ALL).contains(r#".values(["input","output"])"#));
    }

    #[test]
    fn readiness_script_is_guarded() {
        let expr = state_expr(Some("window.appReady"));
        assert!(expr.contains("window.__appdrive__.state("));
        assert!(expr.contains("!!(window.appReady)"));
        assert!(expr.contains("catch (e) { return false; }"));
        assert!(state_expr(None).contains("window.__appdrive__.state()"));
    }

    #[test]
    fn calls_fail_recognizably_without_bridge() {
        insta::assert_snapshot!(
            duplicate_ids_expr(),
            @r#"(window.__appdrive__ ? window.__appdrive__.duplicateIds() : (() => { throw new Error("appdrive bridge not installed"); })())"#
        );
        assert!(is_missing_bridge("Error: appdrive bridge not installed\n    at <anonymous>:1:60"));
    }

    #[test]
    fn page_state_decodes() {
        let state: PageState = serde_json::from_value(json!({
            "msSinceMutation": 1250,
            "busyClass": false,
            "pendingInputs": 1,
            "connected": true,
            "readyState": "complete",
            "busy": true
        }))
        .unwrap();
        assert!(state.busy);
        assert_eq!(state.pending_inputs, 1);
        assert_eq!(state.quiet_for(), Duration::from_millis(1250));
    }

    #[test]
    fn missing_lookup_defaults_to_null() {
        let lookup: ValueLookup = serde_json::from_value(json!({ "found": false })).unwrap();
        assert!(!lookup.found);
        assert!(lookup.value.is_null());
    }

    #[test]
    fn script_installs_namespace() {
        assert!(BRIDGE_SCRIPT.contains("window.__appdrive__ = {"));
    }
}
