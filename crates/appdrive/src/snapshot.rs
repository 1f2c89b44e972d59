//! Snapshot persistence and comparison.
//!
//! Layout, one directory per test:
//!
//! ```text
//! <snapshot_dir>/[<variant>/]<test-name>/
//!     <name>.json        baseline values
//!     <name>.png         baseline screenshot
//!     <name>.new.json    candidate values (only after a mismatch)
//!     <name>.new.png     candidate screenshot (only after a mismatch)
//!     <name>.diff.png    changed pixels highlighted
//!     <name>_.png        debug screenshot, never compared
//! ```
//!
//! Baselines are never overwritten by `check`; accepting a candidate is an
//! explicit [`SnapshotStore::write_baseline`].

use crate::config::{ResolvedConfig, Transform};
use crate::diff::{SnapshotDiff, diff_values};
use crate::error::{ConfigError, DriverError, Result};
use crate::value::JsValue;
use crate::visual::{ImageTolerance, compare_png};
use indexmap::IndexMap;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// A named capture of application state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SnapshotRecord {
    /// Stable identifier, unique within a run
    pub name: String,
    /// Compared values, keyed by category (`input`, `output`, `export`, ...)
    pub values: Option<IndexMap<String, JsValue>>,
    /// Compared screenshot (PNG)
    pub image: Option<Vec<u8>>,
    /// Screenshot saved for human review only
    pub debug_image: Option<Vec<u8>>,
}

/// Outcome of checking a candidate against its baseline.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotOutcome {
    /// No baseline existed; the candidate became the baseline.
    New {
        /// Snapshot name
        name: String,
    },
    /// Candidate matches the baseline.
    Match {
        /// Snapshot name
        name: String,
    },
    /// Candidate differs; `.new` artifacts were written for review.
    Mismatch(SnapshotDiff),
}

impl SnapshotOutcome {
    /// Snapshot name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            SnapshotOutcome::New { name } | SnapshotOutcome::Match { name } => name,
            SnapshotOutcome::Mismatch(diff) => &diff.name,
        }
    }

    /// Returns true for a mismatch.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, SnapshotOutcome::Mismatch(_))
    }

    /// Converts a mismatch into a `SnapshotMismatch` error.
    ///
    /// # Errors
    ///
    /// `SnapshotMismatch` for `Mismatch`.
    pub fn into_result(self) -> Result<()> {
        match self {
            SnapshotOutcome::Mismatch(diff) => Err(DriverError::SnapshotMismatch {
                name: diff.name.clone(),
                diff,
            }),
            SnapshotOutcome::New { .. } | SnapshotOutcome::Match { .. } => Ok(()),
        }
    }
}

/// Reads, writes, and compares the snapshots of one test.
#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
    prefix: String,
    transforms: Vec<(Regex, String)>,
    tolerance: ImageTolerance,
    used: HashSet<String>,
    counter: u32,
}

impl SnapshotStore {
    /// Creates a store rooted at `dir`. Nothing is written until a snapshot
    /// is checked.
    ///
    /// # Errors
    ///
    /// `InvalidValue` if a transform is not a valid regular expression.
    pub fn new(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        transforms: &[Transform],
        tolerance: ImageTolerance,
    ) -> std::result::Result<Self, ConfigError> {
        Ok(Self {
            dir: dir.into(),
            prefix: prefix.into(),
            transforms: transforms
                .iter()
                .map(Transform::compile)
                .collect::<std::result::Result<_, _>>()?,
            tolerance,
            used: HashSet::new(),
            counter: 0,
        })
    }

    /// Creates the store for a session.
    ///
    /// # Errors
    ///
    /// `InvalidValue` if a transform is not a valid regular expression.
    pub fn for_config(config: &ResolvedConfig) -> std::result::Result<Self, ConfigError> {
        let mut dir = config.snapshot_dir.clone();
        if let Some(variant) = &config.variant {
            dir.push(variant);
        }
        dir.push(&config.name);
        Self::new(
            dir,
            config.name.clone(),
            &config.transforms,
            ImageTolerance {
                threshold_percent: config.screenshot_threshold,
                pixel_tolerance: config.pixel_tolerance,
            },
        )
    }

    /// Directory holding this test's snapshots.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Claims a snapshot name.
    ///
    /// Unnamed snapshots get `<prefix>-NNN`, counting up from 001.
    ///
    /// # Errors
    ///
    /// `DuplicateSnapshot` if an explicit name was already claimed this run.
    pub fn claim_name(&mut self, name: Option<&str>) -> Result<String> {
        if let Some(name) = name {
            if !self.used.insert(name.to_string()) {
                return Err(DriverError::DuplicateSnapshot(name.to_string()));
            }
            return Ok(name.to_string());
        }
        loop {
            self.counter += 1;
            let name = format!("{}-{:03}", self.prefix, self.counter);
            if self.used.insert(name.clone()) {
                return Ok(name);
            }
        }
    }

    /// Builds a record, applying the configured transforms to every string.
    #[must_use]
    pub fn capture(
        &self,
        name: impl Into<String>,
        values: Option<IndexMap<String, JsValue>>,
        image: Option<Vec<u8>>,
    ) -> SnapshotRecord {
        let values = values.map(|mut values| {
            for value in values.values_mut() {
                self.normalize(value);
            }
            values
        });
        SnapshotRecord {
            name: name.into(),
            values,
            image,
            debug_image: None,
        }
    }

    fn normalize(&self, value: &mut JsValue) {
        if self.transforms.is_empty() {
            return;
        }
        value.map_strings(&mut |s| {
            self.transforms
                .iter()
                .fold(s.to_string(), |acc, (re, replacement)| {
                    re.replace_all(&acc, replacement.as_str()).into_owned()
                })
        });
    }

    fn path(&self, name: &str, suffix: &str) -> PathBuf {
        self.dir.join(format!("{name}{suffix}"))
    }

    /// Loads the baseline for `name`, if any artifact of it exists.
    ///
    /// # Errors
    ///
    /// `Io` or `Json` if an existing baseline cannot be read.
    pub fn load_baseline(&self, name: &str) -> Result<Option<SnapshotRecord>> {
        let json = self.path(name, ".json");
        let png = self.path(name, ".png");
        let values = if json.exists() {
            Some(serde_json::from_slice(&std::fs::read(&json)?)?)
        } else {
            None
        };
        let image = if png.exists() { Some(std::fs::read(&png)?) } else { None };

        if values.is_none() && image.is_none() {
            return Ok(None);
        }
        Ok(Some(SnapshotRecord {
            name: name.to_string(),
            values,
            image,
            debug_image: None,
        }))
    }

    /// Compares a candidate with a baseline, artifact by artifact.
    ///
    /// Artifacts present on only one side are not compared.
    ///
    /// # Errors
    ///
    /// `Image` if a screenshot cannot be decoded.
    pub fn compare(
        &self,
        candidate: &SnapshotRecord,
        baseline: &SnapshotRecord,
    ) -> Result<SnapshotDiff> {
        let items = match (&baseline.values, &candidate.values) {
            (Some(b), Some(c)) => diff_values(&to_object(b), &to_object(c)),
            _ => Vec::new(),
        };
        let image = match (&baseline.image, &candidate.image) {
            (Some(b), Some(c)) => Some(compare_png(b, c, &self.tolerance)?),
            _ => None,
        };
        Ok(SnapshotDiff {
            name: candidate.name.clone(),
            items,
            image,
        })
    }

    /// Writes `record` as the baseline and clears any pending candidate.
    ///
    /// # Errors
    ///
    /// `Io` or `Json` on write failure.
    pub fn write_baseline(&self, record: &SnapshotRecord) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        if let Some(values) = &record.values {
            std::fs::write(self.path(&record.name, ".json"), to_json(values)?)?;
        }
        if let Some(image) = &record.image {
            std::fs::write(self.path(&record.name, ".png"), image)?;
        }
        self.clear_candidate(&record.name)?;
        tracing::debug!(name = %record.name, dir = %self.dir.display(), "wrote baseline");
        Ok(())
    }

    /// Checks a candidate against its baseline.
    ///
    /// With no baseline the candidate is written as the baseline and the
    /// outcome is `New`. Artifacts missing from an existing baseline are
    /// added to it. On a mismatch the candidate is written next to the
    /// baseline with a `.new` suffix, along with a diff image for screenshots.
    ///
    /// # Errors
    ///
    /// `Io`, `Json`, or `Image` on storage or decoding failure.
    pub fn check(&self, record: &SnapshotRecord) -> Result<SnapshotOutcome> {
        if let Some(debug) = &record.debug_image {
            std::fs::create_dir_all(&self.dir)?;
            std::fs::write(self.path(&record.name, "_.png"), debug)?;
        }

        let Some(baseline) = self.load_baseline(&record.name)? else {
            self.write_baseline(record)?;
            tracing::info!(name = %record.name, "new snapshot created");
            return Ok(SnapshotOutcome::New {
                name: record.name.clone(),
            });
        };

        let values_new = record.values.is_some() && baseline.values.is_none();
        let image_new = record.image.is_some() && baseline.image.is_none();
        if values_new || image_new {
            let missing = SnapshotRecord {
                name: record.name.clone(),
                values: record.values.clone().filter(|_| values_new),
                image: record.image.clone().filter(|_| image_new),
                debug_image: None,
            };
            std::fs::create_dir_all(&self.dir)?;
            if let Some(values) = &missing.values {
                std::fs::write(self.path(&missing.name, ".json"), to_json(values)?)?;
            }
            if let Some(image) = &missing.image {
                std::fs::write(self.path(&missing.name, ".png"), image)?;
            }
        }

        let diff = self.compare(record, &baseline)?;
        if diff.is_empty() {
            self.clear_candidate(&record.name)?;
            let fresh =
                (values_new || record.values.is_none()) && (image_new || record.image.is_none());
            return Ok(if fresh {
                SnapshotOutcome::New {
                    name: record.name.clone(),
                }
            } else {
                SnapshotOutcome::Match {
                    name: record.name.clone(),
                }
            });
        }

        if !diff.items.is_empty() {
            if let Some(values) = &record.values {
                std::fs::write(self.path(&record.name, ".new.json"), to_json(values)?)?;
            }
        }
        if let Some(image_diff) = diff.image.as_ref().filter(|img| !img.matches) {
            if let Some(image) = &record.image {
                std::fs::write(self.path(&record.name, ".new.png"), image)?;
            }
            if let Some(diff_png) = &image_diff.diff_image {
                std::fs::write(self.path(&record.name, ".diff.png"), diff_png)?;
            }
        }
        tracing::warn!(name = %record.name, "snapshot differs from baseline");
        Ok(SnapshotOutcome::Mismatch(diff))
    }

    fn clear_candidate(&self, name: &str) -> Result<()> {
        for suffix in [".new.json", ".new.png", ".diff.png"] {
            match std::fs::remove_file(self.path(name, suffix)) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }
}

fn to_object(values: &IndexMap<String, JsValue>) -> JsValue {
    JsValue::Object(values.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

fn to_json(values: &IndexMap<String, JsValue>) -> Result<String> {
    let mut json = serde_json::to_string_pretty(values)?;
    json.push('\n');
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::visual::tests::png;
    use serde_json::json;

    fn store(dir: &Path) -> SnapshotStore {
        SnapshotStore::new(dir, "app", &[], ImageTolerance::default()).unwrap()
    }

    fn values(echo: &str) -> IndexMap<String, JsValue> {
        let mut map = IndexMap::new();
        map.insert("input".to_string(), JsValue::from(json!({ "n": 7 })));
        map.insert("output".to_string(), JsValue::from(json!({ "echo": echo })));
        map
    }

    const WHITE: [u8; 4] = [255, 255, 255, 255];

    #[test]
    fn unnamed_snapshots_are_indexed() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        assert_eq!(store.claim_name(None).unwrap(), "app-001");
        assert_eq!(store.claim_name(Some("custom")).unwrap(), "custom");
        assert_eq!(store.claim_name(None).unwrap(), "app-002");
    }

    #[test]
    fn explicit_duplicate_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        store.claim_name(Some("after-click")).unwrap();
        let err = store.claim_name(Some("after-click")).unwrap_err();
        assert!(matches!(err, DriverError::DuplicateSnapshot(ref n) if n == "after-click"));
    }

    #[test]
    fn auto_names_skip_explicitly_claimed_ones() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        store.claim_name(Some("app-001")).unwrap();
        assert_eq!(store.claim_name(None).unwrap(), "app-002");
    }

    #[test]
    fn first_check_creates_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let record = store.capture("app-001", Some(values("7")), None);

        let outcome = store.check(&record).unwrap();
        assert_eq!(outcome, SnapshotOutcome::New { name: "app-001".into() });
        assert!(dir.path().join("app-001.json").exists());
        assert!(outcome.into_result().is_ok());
    }

    #[test]
    fn round_trip_reports_no_diff() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let image = png(4, 4, WHITE, &[]);
        let record = store.capture("app-001", Some(values("7")), Some(image.clone()));
        store.write_baseline(&record).unwrap();

        let again = store.capture("app-001", Some(values("7")), Some(image));
        let baseline = store.load_baseline("app-001").unwrap().unwrap();
        assert!(store.compare(&again, &baseline).unwrap().is_empty());
        assert!(matches!(store.check(&again).unwrap(), SnapshotOutcome::Match { .. }));
    }

    #[test]
    fn mismatch_writes_candidate_and_keeps_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store
            .write_baseline(&store.capture("app-001", Some(values("6")), None))
            .unwrap();

        let outcome = store
            .check(&store.capture("app-001", Some(values("7")), None))
            .unwrap();
        let SnapshotOutcome::Mismatch(diff) = &outcome else {
            panic!("expected mismatch, got {outcome:?}");
        };
        assert_eq!(diff.items.len(), 1);
        assert_eq!(diff.items[0].path, "output.echo");

        let baseline = std::fs::read_to_string(dir.path().join("app-001.json")).unwrap();
        assert!(baseline.contains("\"6\""));
        let candidate = std::fs::read_to_string(dir.path().join("app-001.new.json")).unwrap();
        assert!(candidate.contains("\"7\""));

        let err = outcome.into_result().unwrap_err();
        assert!(err.is_assertion());
    }

    #[test]
    fn matching_again_clears_stale_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store
            .write_baseline(&store.capture("app-001", Some(values("6")), None))
            .unwrap();
        store
            .check(&store.capture("app-001", Some(values("7")), None))
            .unwrap();
        assert!(dir.path().join("app-001.new.json").exists());

        store
            .check(&store.capture("app-001", Some(values("6")), None))
            .unwrap();
        assert!(!dir.path().join("app-001.new.json").exists());
    }

    #[test]
    fn screenshot_mismatch_writes_diff_image() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store
            .write_baseline(&store.capture("shot", None, Some(png(10, 10, WHITE, &[]))))
            .unwrap();

        let changed = png(10, 10, WHITE, &[(1, 1, [0, 0, 0, 255]), (2, 2, [0, 0, 0, 255])]);
        let outcome = store.check(&store.capture("shot", None, Some(changed))).unwrap();
        assert!(outcome.is_failure());
        assert!(dir.path().join("shot.new.png").exists());
        assert!(dir.path().join("shot.diff.png").exists());
    }

    #[test]
    fn transforms_normalize_strings_before_comparison() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(
            dir.path(),
            "app",
            &[Transform::new(r"\d{4}-\d{2}-\d{2}", "<date>")],
            ImageTolerance::default(),
        )
        .unwrap();

        let first = store.capture("dated", Some(values("updated 2024-01-02")), None);
        store.check(&first).unwrap();
        let second = store.capture("dated", Some(values("updated 2026-10-16")), None);
        assert!(matches!(store.check(&second).unwrap(), SnapshotOutcome::Match { .. }));

        let saved = std::fs::read_to_string(dir.path().join("dated.json")).unwrap();
        assert!(saved.contains("updated <date>"));
    }

    #[test]
    fn baseline_json_keeps_category_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let mut map = IndexMap::new();
        map.insert("output".to_string(), JsValue::from(1));
        map.insert("input".to_string(), JsValue::from(2));
        store.write_baseline(&store.capture("ordered", Some(map), None)).unwrap();

        let saved = std::fs::read_to_string(dir.path().join("ordered.json")).unwrap();
        insta::assert_snapshot!(saved.trim_end(), @r#"
        {
          "output": 1,
          "input": 2
        }
        "#);
    }

    #[test]
    fn debug_image_is_written_but_not_compared() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let mut record = store.capture("app-001", Some(values("7")), None);
        record.debug_image = Some(png(2, 2, WHITE, &[]));
        store.check(&record).unwrap();

        record.debug_image = Some(png(3, 3, [0, 0, 0, 255], &[]));
        assert!(matches!(store.check(&record).unwrap(), SnapshotOutcome::Match { .. }));
        assert!(dir.path().join("app-001_.png").exists());
        assert!(!dir.path().join("app-001.png").exists());
    }

    #[test]
    fn variant_adds_directory_level() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::AppDriverConfig::new(dir.path())
            .with_name("slider")
            .with_variant("linux")
            .with_snapshot_dir(dir.path().join("_snaps"))
            .resolve()
            .unwrap();
        let store = SnapshotStore::for_config(&config).unwrap();
        assert_eq!(store.dir(), dir.path().join("_snaps").join("linux").join("slider"));
    }
}
