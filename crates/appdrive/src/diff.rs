//! Structural differences between snapshot values.

use crate::value::JsValue;
use crate::visual::ImageComparison;
use std::collections::BTreeSet;
use std::fmt;

/// How one path differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    /// Present only in the candidate
    Added,
    /// Present only in the baseline
    Removed,
    /// Present in both with different values
    Changed,
}

/// One itemized difference.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffItem {
    /// Dotted path, with `[i]` for array elements (e.g. `output.table[2]`)
    pub path: String,
    /// Kind of difference
    pub kind: DiffKind,
    /// Baseline value, if present
    pub baseline: Option<JsValue>,
    /// Candidate value, if present
    pub candidate: Option<JsValue>,
}

impl fmt::Display for DiffItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: &Option<JsValue>| v.as_ref().map(ToString::to_string).unwrap_or_default();
        match self.kind {
            DiffKind::Added => write!(f, "+ {}: {}", self.path, show(&self.candidate)),
            DiffKind::Removed => write!(f, "- {}: {}", self.path, show(&self.baseline)),
            DiffKind::Changed => {
                write!(
                    f,
                    "~ {}: {} -> {}",
                    self.path,
                    show(&self.baseline),
                    show(&self.candidate)
                )?;
                match (&self.baseline, &self.candidate) {
                    (Some(a), Some(b)) if a.type_name() != b.type_name() => {
                        write!(f, " ({} -> {})", a.type_name(), b.type_name())
                    }
                    _ => Ok(()),
                }
            }
        }
    }
}

/// Everything that differs between a candidate snapshot and its baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotDiff {
    /// Snapshot name
    pub name: String,
    /// Value differences, in path order
    pub items: Vec<DiffItem>,
    /// Screenshot comparison, when the snapshot has a compared image
    pub image: Option<ImageComparison>,
}

impl SnapshotDiff {
    /// Returns true when nothing differs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.image.as_ref().is_none_or(|img| img.matches)
    }
}

impl fmt::Display for SnapshotDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines = self.items.iter().map(ToString::to_string).collect::<Vec<_>>();
        if let Some(image) = self.image.as_ref().filter(|img| !img.matches) {
            lines.push(format!("! screenshot: {}", image.summary()));
        }
        if lines.is_empty() {
            return f.write_str("  (no differences)");
        }
        for (i, line) in lines.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "  {line}")?;
        }
        Ok(())
    }
}

/// Compares two values recursively, returning one item per differing leaf.
///
/// Objects are compared key by key; arrays element by element, with extra
/// trailing elements reported as added or removed.
#[must_use]
pub fn diff_values(baseline: &JsValue, candidate: &JsValue) -> Vec<DiffItem> {
    let mut items = Vec::new();
    walk("", baseline, candidate, &mut items);
    items
}

fn child(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn walk(path: &str, baseline: &JsValue, candidate: &JsValue, items: &mut Vec<DiffItem>) {
    match (baseline, candidate) {
        (JsValue::Object(a), JsValue::Object(b)) => {
            let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            for key in keys {
                let path = child(path, key);
                match (a.get(key), b.get(key)) {
                    (Some(x), Some(y)) => walk(&path, x, y, items),
                    (Some(x), None) => items.push(removed(path, x)),
                    (None, Some(y)) => items.push(added(path, y)),
                    (None, None) => {}
                }
            }
        }
        (JsValue::Array(a), JsValue::Array(b)) => {
            for i in 0..a.len().max(b.len()) {
                let path = format!("{path}[{i}]");
                match (a.get(i), b.get(i)) {
                    (Some(x), Some(y)) => walk(&path, x, y, items),
                    (Some(x), None) => items.push(removed(path, x)),
                    (None, Some(y)) => items.push(added(path, y)),
                    (None, None) => {}
                }
            }
        }
        (a, b) if a == b => {}
        (a, b) => items.push(DiffItem {
            path: if path.is_empty() { "<root>".to_string() } else { path.to_string() },
            kind: DiffKind::Changed,
            baseline: Some(a.clone()),
            candidate: Some(b.clone()),
        }),
    }
}

fn added(path: String, value: &JsValue) -> DiffItem {
    DiffItem {
        path,
        kind: DiffKind::Added,
        baseline: None,
        candidate: Some(value.clone()),
    }
}

fn removed(path: String, value: &JsValue) -> DiffItem {
    DiffItem {
        path,
        kind: DiffKind::Removed,
        baseline: Some(value.clone()),
        candidate: None,
    }
}
