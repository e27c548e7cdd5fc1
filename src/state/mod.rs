// src/state/mod.rs

//! Persisted per-part, per-step state.
//!
//! On successful completion of a step the part handler writes a state
//! record to `parts/<name>/state/<step>`. The record carries the canonical
//! part properties and project options at the time the step ran plus
//! step-specific data (fetched assets, content manifests). The sequencer
//! compares persisted records against the current specification to decide
//! whether a step must run again.
//!
//! Serialised forms are deterministic: sets are ordered, map keys are
//! sorted, so equality of two canonical forms is a reliable dirtiness
//! check.

use crate::error::Result;
use crate::parts::Part;
use crate::steps::Step;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Files and directories a part materialised in a shared area.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationContents {
    #[serde(default)]
    pub files: BTreeSet<String>,
    #[serde(default)]
    pub directories: BTreeSet<String>,
}

/// State of the PULL step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullState {
    #[serde(default)]
    pub part_properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub project_options: BTreeMap<String, Value>,
    /// Fetched assets: `stage-packages`, `stage-snaps`, `source-details`.
    #[serde(default)]
    pub assets: BTreeMap<String, Value>,
    /// Files reported changed by an incremental source update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outdated_files: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outdated_dirs: Option<Vec<String>>,
}

/// State of the OVERLAY step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverlayState {
    #[serde(default)]
    pub part_properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub project_options: BTreeMap<String, Value>,
    /// Name of the default partition at run time, if partitions are enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    /// Default-partition layer contents.
    #[serde(default)]
    pub files: BTreeSet<String>,
    #[serde(default)]
    pub directories: BTreeSet<String>,
    /// Contents recorded for non-default partitions.
    #[serde(default)]
    pub partitions_contents: BTreeMap<String, MigrationContents>,
}

/// State of the BUILD step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildState {
    #[serde(default)]
    pub part_properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub project_options: BTreeMap<String, Value>,
    /// Build assets: build-packages, build-snaps, installed packages, uname.
    #[serde(default)]
    pub assets: BTreeMap<String, Value>,
    /// Hex digest of the full overlay chain when the step ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay_hash: Option<String>,
}

/// State of the STAGE step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    #[serde(default)]
    pub part_properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub project_options: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    #[serde(default)]
    pub files: BTreeSet<String>,
    #[serde(default)]
    pub directories: BTreeSet<String>,
    #[serde(default)]
    pub partitions_contents: BTreeMap<String, MigrationContents>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay_hash: Option<String>,
    #[serde(default)]
    pub backstage_files: BTreeSet<String>,
    #[serde(default)]
    pub backstage_directories: BTreeSet<String>,
}

/// State of the PRIME step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrimeState {
    #[serde(default)]
    pub part_properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub project_options: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    #[serde(default)]
    pub files: BTreeSet<String>,
    #[serde(default)]
    pub directories: BTreeSet<String>,
    #[serde(default)]
    pub partitions_contents: BTreeMap<String, MigrationContents>,
    /// Stage packages that contributed files to the prime area.
    #[serde(default)]
    pub primed_stage_packages: BTreeSet<String>,
}

/// Per-step state, tagged by step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step")]
pub enum StepState {
    #[serde(rename = "pull")]
    Pull(PullState),
    #[serde(rename = "overlay")]
    Overlay(OverlayState),
    #[serde(rename = "build")]
    Build(BuildState),
    #[serde(rename = "stage")]
    Stage(StageState),
    #[serde(rename = "prime")]
    Prime(PrimeState),
}

impl StepState {
    pub fn step(&self) -> Step {
        match self {
            StepState::Pull(_) => Step::Pull,
            StepState::Overlay(_) => Step::Overlay,
            StepState::Build(_) => Step::Build,
            StepState::Stage(_) => Step::Stage,
            StepState::Prime(_) => Step::Prime,
        }
    }

    pub fn part_properties(&self) -> &BTreeMap<String, Value> {
        match self {
            StepState::Pull(s) => &s.part_properties,
            StepState::Overlay(s) => &s.part_properties,
            StepState::Build(s) => &s.part_properties,
            StepState::Stage(s) => &s.part_properties,
            StepState::Prime(s) => &s.part_properties,
        }
    }

    pub fn project_options(&self) -> &BTreeMap<String, Value> {
        match self {
            StepState::Pull(s) => &s.project_options,
            StepState::Overlay(s) => &s.project_options,
            StepState::Build(s) => &s.project_options,
            StepState::Stage(s) => &s.project_options,
            StepState::Prime(s) => &s.project_options,
        }
    }

    /// The file/directory manifest this state records for a partition.
    pub fn contents(
        &self,
        partition: Option<&str>,
    ) -> Option<(&BTreeSet<String>, &BTreeSet<String>)> {
        let (own_partition, files, directories, partitions_contents) = match self {
            StepState::Overlay(s) => (
                s.partition.as_deref(),
                &s.files,
                &s.directories,
                &s.partitions_contents,
            ),
            StepState::Stage(s) => (
                s.partition.as_deref(),
                &s.files,
                &s.directories,
                &s.partitions_contents,
            ),
            StepState::Prime(s) => (
                s.partition.as_deref(),
                &s.files,
                &s.directories,
                &s.partitions_contents,
            ),
            StepState::Pull(_) | StepState::Build(_) => return None,
        };

        if partition.is_none() || partition == own_partition {
            return Some((files, directories));
        }

        partition
            .and_then(|name| partitions_contents.get(name))
            .map(|mc| (&mc.files, &mc.directories))
    }

    /// The recorded overlay hash, for states that carry one.
    pub fn overlay_hash(&self) -> Option<&str> {
        match self {
            StepState::Build(s) => s.overlay_hash.as_deref(),
            StepState::Stage(s) => s.overlay_hash.as_deref(),
            _ => None,
        }
    }

    /// The part property names this state's step depends on.
    fn properties_of_interest(&self) -> &'static [&'static str] {
        match self.step() {
            Step::Pull => &[
                "overlay-packages",
                "override-pull",
                "plugin",
                "source",
                "source-branch",
                "source-checksum",
                "source-commit",
                "source-subdir",
                "source-submodules",
                "source-tag",
                "source-type",
                "stage-packages",
                "stage-snaps",
            ],
            Step::Overlay => &["overlay-files", "overlay-packages", "override-overlay"],
            Step::Build => &[
                "after",
                "build-environment",
                "build-packages",
                "build-snaps",
                "organize",
                "override-build",
                "plugin",
            ],
            Step::Stage => &["override-stage", "stage"],
            Step::Prime => &["override-prime", "prime"],
        }
    }

    /// The project option names this state's step depends on.
    fn project_options_of_interest(&self) -> &'static [&'static str] {
        match self.step() {
            Step::Build => &["target_arch"],
            _ => &[],
        }
    }

    /// Part property names of interest whose value changed, sorted.
    pub fn diff_properties_of_interest(
        &self,
        current_properties: &BTreeMap<String, Value>,
    ) -> Vec<String> {
        let mut keys: BTreeSet<String> = self
            .properties_of_interest()
            .iter()
            .map(|k| k.to_string())
            .collect();

        // plugin-specific keys participate in BUILD dirtiness
        if self.step() == Step::Build {
            let plugin = current_properties
                .get("plugin")
                .or_else(|| self.part_properties().get("plugin"))
                .and_then(Value::as_str);
            if let Some(plugin) = plugin {
                let prefix = format!("{plugin}-");
                for key in self.part_properties().keys().chain(current_properties.keys()) {
                    if key.starts_with(&prefix) {
                        keys.insert(key.clone());
                    }
                }
            }
        }

        keys.into_iter()
            .filter(|key| {
                let old = self.part_properties().get(key).unwrap_or(&Value::Null);
                let new = current_properties.get(key).unwrap_or(&Value::Null);
                old != new
            })
            .collect()
    }

    /// Project option names of interest whose value changed, sorted.
    pub fn diff_project_options_of_interest(
        &self,
        current_options: &BTreeMap<String, Value>,
    ) -> Vec<String> {
        self.project_options_of_interest()
            .iter()
            .filter(|key| {
                let old = self.project_options().get(**key).unwrap_or(&Value::Null);
                let new = current_options.get(**key).unwrap_or(&Value::Null);
                old != new
            })
            .map(|key| key.to_string())
            .collect()
    }

    /// Atomically serialise this state to `path`.
    pub fn write(&self, path: &Path) -> Result<()> {
        write_yaml(path, self)
    }
}

/// State of an overlay migration to a shared STAGE or PRIME area.
///
/// Kept separately from per-part states because the migrated overlay
/// content is shared by every part that declares overlay parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    #[serde(default)]
    pub files: BTreeSet<String>,
    #[serde(default)]
    pub directories: BTreeSet<String>,
}

impl MigrationState {
    /// Contents are recorded top-level, regardless of partition.
    pub fn contents(&self) -> (&BTreeSet<String>, &BTreeSet<String>) {
        (&self.files, &self.directories)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_yaml(path, self)
    }
}

fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let serialized = serde_yaml::to_string(value)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serialized)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// The path of the state file for a part's step.
pub fn get_step_state_path(part: &Part, step: Step) -> PathBuf {
    part.part_state_dir().join(step.name())
}

/// Load the persisted state of a part's step, if any.
pub fn load_step_state(part: &Part, step: Step) -> Result<Option<StepState>> {
    let path = get_step_state_path(part, step);
    load_yaml(&path)
}

/// Remove the persisted state of a part's step, tolerating absence.
pub fn remove(part: &Part, step: Step) -> Result<()> {
    let path = get_step_state_path(part, step);
    match fs::remove_file(&path) {
        Ok(()) => {
            debug!("removed state file {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// The path of the overlay migration state for a partition's overlay
/// directory and target step.
pub fn get_overlay_migration_state_path(overlay_dir: &Path, step: Step) -> PathBuf {
    overlay_dir.join(format!("{}_overlay", step.name()))
}

/// Load the overlay migration state for a partition, if any.
pub fn load_overlay_migration_state(
    overlay_dir: &Path,
    step: Step,
) -> Result<Option<MigrationState>> {
    load_yaml(&get_overlay_migration_state_path(overlay_dir, step))
}

fn load_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(serde_yaml::from_str(&content)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infos::ProjectDirs;
    use crate::parts::PartSpec;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn sample_properties() -> BTreeMap<String, Value> {
        PartSpec {
            source: Some("src".to_string()),
            overlay_packages: vec!["hello".to_string()],
            ..PartSpec::default()
        }
        .marshal()
    }

    #[test]
    fn test_state_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pull");

        let state = StepState::Pull(PullState {
            part_properties: sample_properties(),
            assets: BTreeMap::from([(
                "stage-packages".to_string(),
                serde_yaml::to_value(["hello"]).unwrap(),
            )]),
            ..PullState::default()
        });
        state.write(&path).unwrap();

        let loaded: StepState = load_yaml(&path).unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.step(), Step::Pull);
    }

    #[test]
    fn test_serialized_form_is_deterministic() {
        let state = StepState::Stage(StageState {
            part_properties: sample_properties(),
            files: BTreeSet::from(["b".to_string(), "a".to_string()]),
            directories: BTreeSet::from(["z".to_string(), "m".to_string()]),
            ..StageState::default()
        });
        let one = serde_yaml::to_string(&state).unwrap();
        let two = serde_yaml::to_string(&state).unwrap();
        assert_eq!(one, two);
        // sets serialise in sorted order
        assert!(one.find("- a").unwrap() < one.find("- b").unwrap());
    }

    #[test]
    fn test_diff_properties_of_interest() {
        let state = StepState::Overlay(OverlayState {
            part_properties: sample_properties(),
            ..OverlayState::default()
        });

        // unchanged
        assert!(state
            .diff_properties_of_interest(&sample_properties())
            .is_empty());

        // overlay-relevant change is reported
        let mut changed = sample_properties();
        changed.insert(
            "overlay-packages".to_string(),
            serde_yaml::to_value(["hello", "world"]).unwrap(),
        );
        assert_eq!(
            state.diff_properties_of_interest(&changed),
            vec!["overlay-packages".to_string()]
        );

        // a non-overlay change is not this step's concern
        let mut changed = sample_properties();
        changed.insert(
            "build-packages".to_string(),
            serde_yaml::to_value(["gcc"]).unwrap(),
        );
        assert!(state.diff_properties_of_interest(&changed).is_empty());
    }

    #[test]
    fn test_build_diff_includes_plugin_properties() {
        let mut properties = sample_properties();
        properties.insert("plugin".to_string(), Value::String("make".to_string()));
        properties.insert(
            "make-parameters".to_string(),
            serde_yaml::to_value(["-s"]).unwrap(),
        );

        let state = StepState::Build(BuildState {
            part_properties: properties.clone(),
            ..BuildState::default()
        });

        let mut changed = properties;
        changed.insert(
            "make-parameters".to_string(),
            serde_yaml::to_value(["-j4"]).unwrap(),
        );
        assert_eq!(
            state.diff_properties_of_interest(&changed),
            vec!["make-parameters".to_string()]
        );
    }

    #[test]
    fn test_contents_by_partition() {
        let state = StepState::Stage(StageState {
            partition: Some("system".to_string()),
            files: BTreeSet::from(["f".to_string()]),
            directories: BTreeSet::from(["d".to_string()]),
            partitions_contents: BTreeMap::from([(
                "data".to_string(),
                MigrationContents {
                    files: BTreeSet::from(["var/lib/x".to_string()]),
                    directories: BTreeSet::new(),
                },
            )]),
            ..StageState::default()
        });

        let (files, _) = state.contents(Some("system")).unwrap();
        assert!(files.contains("f"));

        let (files, _) = state.contents(Some("data")).unwrap();
        assert!(files.contains("var/lib/x"));

        assert!(state.contents(Some("missing")).is_none());
    }

    #[test]
    fn test_step_state_store() {
        let tmp = TempDir::new().unwrap();
        let dirs = Arc::new(ProjectDirs::new(tmp.path(), None));
        let part = Part::new("p1", PartSpec::default(), dirs).unwrap();

        assert!(load_step_state(&part, Step::Pull).unwrap().is_none());

        let state = StepState::Pull(PullState::default());
        state.write(&get_step_state_path(&part, Step::Pull)).unwrap();
        assert!(load_step_state(&part, Step::Pull).unwrap().is_some());

        remove(&part, Step::Pull).unwrap();
        assert!(load_step_state(&part, Step::Pull).unwrap().is_none());
        // removing twice is fine
        remove(&part, Step::Pull).unwrap();
    }

    #[test]
    fn test_overlay_migration_state_path() {
        let path = get_overlay_migration_state_path(Path::new("/work/overlay"), Step::Stage);
        assert_eq!(path, PathBuf::from("/work/overlay/stage_overlay"));
    }
}
