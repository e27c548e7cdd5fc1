// src/parts.rs

//! Part definitions and helpers.
//!
//! A part is a named unit of work with its own pull/overlay/build/stage/
//! prime lifecycle. The declared part order is significant: it defines the
//! overlay layer stack, bottom to top.

use crate::error::{Error, Result};
use crate::infos::ProjectDirs;
use crate::steps::Step;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use crate::permissions::Permissions;

/// The user-declared attributes of a part.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PartSpec {
    /// Plugin used to build this part. Defaults to the part name.
    pub plugin: Option<String>,

    /// Source reference handed to the source handler.
    pub source: Option<String>,
    pub source_type: Option<String>,
    pub source_branch: Option<String>,
    pub source_commit: Option<String>,
    pub source_tag: Option<String>,
    pub source_checksum: Option<String>,
    pub source_subdir: Option<String>,
    pub source_submodules: Option<Vec<String>>,

    /// Parts this part is ordered after.
    pub after: Vec<String>,

    pub build_packages: Vec<String>,
    pub build_snaps: Vec<String>,
    /// Ordered list of single-entry name/value maps, later entries may
    /// reference earlier ones.
    pub build_environment: Vec<BTreeMap<String, String>>,

    pub stage_packages: Vec<String>,
    pub stage_snaps: Vec<String>,

    pub overlay_packages: Vec<String>,
    /// Keep-globs applied to the part's layer. `None` keeps everything.
    pub overlay_files: Option<Vec<String>>,
    pub overlay_visibility: bool,

    pub override_pull: Option<String>,
    pub override_overlay: Option<String>,
    pub override_build: Option<String>,
    pub override_stage: Option<String>,
    pub override_prime: Option<String>,

    /// Source-glob to destination rename map applied after BUILD.
    pub organize: BTreeMap<String, String>,

    /// Keep-globs selecting what reaches the stage area. `None` keeps all.
    pub stage: Option<Vec<String>>,
    /// Keep-globs selecting what reaches the prime area. `None` keeps all.
    pub prime: Option<Vec<String>>,

    pub permissions: Vec<Permissions>,

    /// Plugin-specific properties (`<plugin>-<key>` convention).
    #[serde(flatten)]
    pub plugin_properties: BTreeMap<String, Value>,
}

impl PartSpec {
    /// The canonical dictionary form recorded in step states and compared
    /// for dirtiness. Keys are kebab-case and sorted.
    pub fn marshal(&self) -> BTreeMap<String, Value> {
        let value = serde_yaml::to_value(self).unwrap_or(Value::Null);
        match value {
            Value::Mapping(mapping) => mapping
                .into_iter()
                .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v)))
                .collect(),
            _ => BTreeMap::new(),
        }
    }

    /// The override scriptlet for the given step, if declared.
    pub fn scriptlet(&self, step: Step) -> Option<&str> {
        match step {
            Step::Pull => self.override_pull.as_deref(),
            Step::Overlay => self.override_overlay.as_deref(),
            Step::Build => self.override_build.as_deref(),
            Step::Stage => self.override_stage.as_deref(),
            Step::Prime => self.override_prime.as_deref(),
        }
    }

    /// Whether this part declares overlay parameters.
    pub fn has_overlay(&self) -> bool {
        !self.overlay_packages.is_empty()
            || self.override_overlay.is_some()
            || self.overlay_files.is_some()
            || self.overlay_visibility
    }
}

/// A part and its derived work directories.
#[derive(Debug, Clone)]
pub struct Part {
    name: String,
    spec: PartSpec,
    dirs: Arc<ProjectDirs>,
}

impl Part {
    pub fn new(name: impl Into<String>, spec: PartSpec, dirs: Arc<ProjectDirs>) -> Result<Self> {
        let name = name.into();
        validate_part_name(&name)?;
        Ok(Self { name, spec, dirs })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &PartSpec {
        &self.spec
    }

    /// The plugin name: the declared plugin or the part name itself.
    pub fn plugin_name(&self) -> &str {
        self.spec.plugin.as_deref().unwrap_or(&self.name)
    }

    pub fn has_overlay(&self) -> bool {
        self.spec.has_overlay()
    }

    pub fn dirs(&self) -> &ProjectDirs {
        &self.dirs
    }

    /// `parts/<name>`
    pub fn part_base_dir(&self) -> PathBuf {
        self.dirs.parts_dir().join(&self.name)
    }

    pub fn part_src_dir(&self) -> PathBuf {
        self.part_base_dir().join("src")
    }

    pub fn part_build_dir(&self) -> PathBuf {
        self.part_base_dir().join("build")
    }

    pub fn part_state_dir(&self) -> PathBuf {
        self.part_base_dir().join("state")
    }

    pub fn part_run_dir(&self) -> PathBuf {
        self.part_base_dir().join("run")
    }

    /// Side area staged to backstage instead of prime.
    pub fn part_export_dir(&self) -> PathBuf {
        self.part_base_dir().join("export")
    }

    /// Where fetched stage packages land.
    pub fn part_packages_dir(&self) -> PathBuf {
        self.part_base_dir().join("stage_packages")
    }

    /// Where fetched stage snaps land.
    pub fn part_snaps_dir(&self) -> PathBuf {
        self.part_base_dir().join("stage_snaps")
    }

    pub fn part_install_dir(&self, partition: Option<&str>) -> PathBuf {
        self.dirs
            .partition_parts_dir(partition)
            .join(&self.name)
            .join("install")
    }

    pub fn part_layer_dir(&self, partition: Option<&str>) -> PathBuf {
        self.dirs
            .partition_parts_dir(partition)
            .join(&self.name)
            .join("layer")
    }

    /// Install directories for every partition.
    pub fn part_install_dirs(&self) -> Vec<(Option<String>, PathBuf)> {
        self.dirs
            .partition_keys()
            .into_iter()
            .map(|p| {
                let dir = self.part_install_dir(p.as_deref());
                (p, dir)
            })
            .collect()
    }

    /// Layer directories for every partition.
    pub fn part_layer_dirs(&self) -> Vec<(Option<String>, PathBuf)> {
        self.dirs
            .partition_keys()
            .into_iter()
            .map(|p| {
                let dir = self.part_layer_dir(p.as_deref());
                (p, dir)
            })
            .collect()
    }

    pub fn stage_dir(&self, partition: Option<&str>) -> PathBuf {
        self.dirs.stage_dir(partition)
    }

    pub fn prime_dir(&self, partition: Option<&str>) -> PathBuf {
        self.dirs.prime_dir(partition)
    }

    pub fn overlay_dir(&self, partition: Option<&str>) -> PathBuf {
        self.dirs.overlay_dir(partition)
    }

    pub fn backstage_dir(&self) -> PathBuf {
        self.dirs.backstage_dir()
    }
}

fn validate_part_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidPartName(name.to_string()))
    }
}

/// Find a part by name.
pub fn part_by_name<'a>(name: &str, part_list: &'a [Part]) -> Result<&'a Part> {
    part_list
        .iter()
        .find(|p| p.name() == name)
        .ok_or_else(|| Error::InvalidPartName(name.to_string()))
}

/// The direct `after` dependencies of a part.
pub fn part_dependencies<'a>(part: &Part, part_list: &'a [Part]) -> Result<Vec<&'a Part>> {
    part.spec()
        .after
        .iter()
        .map(|name| part_by_name(name, part_list))
        .collect()
}

/// Stable topological sort of the part list by `after` relations.
///
/// Parts without mutual ordering constraints keep their declaration
/// order, which also fixes the overlay layer stack.
pub fn sort_parts(parts: Vec<Part>) -> Result<Vec<Part>> {
    // validate dependency references first
    let names: BTreeSet<&str> = parts.iter().map(|p| p.name()).collect();
    for part in &parts {
        for dep in &part.spec().after {
            if !names.contains(dep.as_str()) {
                return Err(Error::InvalidPartName(dep.clone()));
            }
            if dep == part.name() {
                return Err(Error::PartDependencyCycle(part.name().to_string()));
            }
        }
    }

    let mut pending = parts;
    let mut sorted: Vec<Part> = Vec::with_capacity(pending.len());

    while !pending.is_empty() {
        let placed: BTreeSet<String> = sorted.iter().map(|p| p.name().to_string()).collect();
        let position = pending.iter().position(|part| {
            part.spec()
                .after
                .iter()
                .all(|dep| placed.contains(dep.as_str()))
        });

        match position {
            Some(index) => sorted.push(pending.remove(index)),
            None => {
                // every remaining part waits on another remaining part
                let name = pending[0].name().to_string();
                return Err(Error::PartDependencyCycle(name));
            }
        }
    }

    Ok(sorted)
}

/// The parts that declare overlay parameters, in part order.
pub fn parts_with_overlay(part_list: &[Part]) -> Vec<&Part> {
    part_list.iter().filter(|p| p.has_overlay()).collect()
}

/// Whether a part can see the overlay filesystem during its build.
///
/// A part sees the overlay if it sets `overlay-visibility` itself or
/// transitively depends on a part that does.
pub fn has_overlay_visibility(part: &Part, part_list: &[Part]) -> bool {
    fn check(part: &Part, part_list: &[Part], seen: &mut BTreeSet<String>) -> bool {
        if part.spec().overlay_visibility {
            return true;
        }
        if !seen.insert(part.name().to_string()) {
            return false;
        }
        part.spec().after.iter().any(|dep| {
            part_by_name(dep, part_list)
                .map(|p| check(p, part_list, seen))
                .unwrap_or(false)
        })
    }

    check(part, part_list, &mut BTreeSet::new())
}
