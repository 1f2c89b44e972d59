//! Tagged values crossing the script-evaluation boundary.
//!
//! Anything the page hands back (evaluated script results, input and output
//! values) is a `JsValue`. Object keys are kept sorted so that serialized
//! snapshots are stable across runs, and integral numbers render without a
//! fractional part (`7`, not `7.0`).

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use std::fmt;

/// A JSON-compatible value produced by the page.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum JsValue {
    /// `null` or `undefined`
    #[default]
    Null,
    /// A boolean
    Bool(bool),
    /// Any number. Script numbers are doubles.
    Number(f64),
    /// A string
    String(String),
    /// An array
    Array(Vec<JsValue>),
    /// An object with sorted keys
    Object(BTreeMap<String, JsValue>),
}

/// Categories of named application values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// Values the user controls
    Input,
    /// Values the application renders
    Output,
    /// Values the application publishes for testing only
    Export,
}

impl ValueKind {
    /// All kinds, in snapshot order.
    pub const ALL: [ValueKind; 3] = [ValueKind::Input, ValueKind::Output, ValueKind::Export];

    /// Lowercase name, used as the snapshot key.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Input => "input",
            ValueKind::Output => "output",
            ValueKind::Export => "export",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Largest integer a double represents exactly (2^53).
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

impl JsValue {
    /// Returns the string slice if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            JsValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the number if this is a number.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            JsValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the boolean if this is a boolean.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            JsValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the elements if this is an array.
    #[must_use]
    pub fn as_array(&self) -> Option<&[JsValue]> {
        match self {
            JsValue::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the entries if this is an object.
    #[must_use]
    pub fn as_object(&self) -> Option<&BTreeMap<String, JsValue>> {
        match self {
            JsValue::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Looks up a key if this is an object.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&JsValue> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// Returns true for `Null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, JsValue::Null)
    }

    /// Script-style truthiness.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            JsValue::Null => false,
            JsValue::Bool(b) => *b,
            JsValue::Number(n) => *n != 0.0 && !n.is_nan(),
            JsValue::String(s) => !s.is_empty(),
            JsValue::Array(_) | JsValue::Object(_) => true,
        }
    }

    /// Name of the variant, as a script `typeof`-like tag.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            JsValue::Null => "null",
            JsValue::Bool(_) => "boolean",
            JsValue::Number(_) => "number",
            JsValue::String(_) => "string",
            JsValue::Array(_) => "array",
            JsValue::Object(_) => "object",
        }
    }

    /// Applies `f` to every string leaf, recursively.
    pub fn map_strings(&mut self, f: &mut impl FnMut(&str) -> String) {
        match self {
            JsValue::String(s) => *s = f(s),
            JsValue::Array(items) => items.iter_mut().for_each(|v| v.map_strings(f)),
            JsValue::Object(map) => map.values_mut().for_each(|v| v.map_strings(f)),
            JsValue::Null | JsValue::Bool(_) | JsValue::Number(_) => {}
        }
    }

    /// Converts into a `serde_json::Value`.
    #[must_use]
    pub fn to_json(&self) -> Value {
        Value::from(self.clone())
    }
}

fn number_to_json(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        #[allow(clippy::cast_possible_truncation)]
        return Value::Number(Number::from(n as i64));
    }
    Number::from_f64(n).map_or(Value::Null, Value::Number)
}

impl From<Value> for JsValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => JsValue::Null,
            Value::Bool(b) => JsValue::Bool(b),
            Value::Number(n) => n.as_f64().map_or(JsValue::Null, JsValue::Number),
            Value::String(s) => JsValue::String(s),
            Value::Array(items) => JsValue::Array(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => {
                JsValue::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<JsValue> for Value {
    fn from(value: JsValue) -> Self {
        match value {
            JsValue::Null => Value::Null,
            JsValue::Bool(b) => Value::Bool(b),
            JsValue::Number(n) => number_to_json(n),
            JsValue::String(s) => Value::String(s),
            JsValue::Array(items) => Value::Array(items.into_iter().map(Into::into).collect()),
            JsValue::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl fmt::Display for JsValue {
    /// Compact JSON rendering. Strings are quoted.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<&str> for JsValue {
    fn from(s: &str) -> Self {
        JsValue::String(s.to_string())
    }
}

impl From<String> for JsValue {
    fn from(s: String) -> Self {
        JsValue::String(s)
    }
}

impl From<bool> for JsValue {
    fn from(b: bool) -> Self {
        JsValue::Bool(b)
    }
}

impl From<f64> for JsValue {
    fn from(n: f64) -> Self {
        JsValue::Number(n)
    }
}

impl From<i32> for JsValue {
    fn from(n: i32) -> Self {
        JsValue::Number(f64::from(n))
    }
}

impl From<u32> for JsValue {
    fn from(n: u32) -> Self {
        JsValue::Number(f64::from(n))
    }
}

impl<T: Into<JsValue>> From<Vec<T>> for JsValue {
    fn from(items: Vec<T>) -> Self {
        JsValue::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<JsValue>> From<Option<T>> for JsValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(JsValue::Null, Into::into)
    }
}

impl PartialEq<str> for JsValue {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == Some(other)
    }
}

impl PartialEq<&str> for JsValue {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == Some(*other)
    }
}
