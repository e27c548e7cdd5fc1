// src/lifecycle.rs

//! The lifecycle manager: the public façade of the engine.
//!
//! Applications construct a [`LifecycleManager`] from a parts definition
//! and options, call [`LifecycleManager::plan`] to obtain an ordered
//! action list, then enter [`LifecycleManager::action_executor`] and
//! pass the list back for execution.

use crate::actions::Action;
use crate::error::{Error, Result};
use crate::executor::{ActionExecutor, Executor};
use crate::infos::{FilesystemMounts, ProjectDirs, ProjectInfo};
use crate::overlays::LayerHash;
use crate::packages::{NullRepository, PackageRepository};
use crate::parts::{self, Part, PartSpec};
use crate::sequencer::Sequencer;
use crate::sources::{default_source_factory, OutdatedFiles, SourceFactory};
use crate::state;
use crate::steps::Step;
use crate::utils::file_utils;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// The declared parts, in declaration order.
///
/// Declaration order is meaningful: it fixes the overlay layer stack.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartsDefinition {
    pub parts: IndexMap<String, PartSpec>,
}

impl PartsDefinition {
    /// Parse a parts definition from its YAML form.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

/// Configuration of a lifecycle manager.
pub struct LifecycleOptions {
    pub application_name: String,
    pub work_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub arch: Option<String>,
    pub parallel_build_count: usize,
    pub partitions: Option<Vec<String>>,
    pub filesystem_mounts: FilesystemMounts,
    pub base_layer_dir: Option<PathBuf>,
    pub base_layer_hash: Option<Vec<u8>>,
    pub track_stage_packages: bool,
    pub ignore_patterns: Vec<String>,
    pub ignore_outdated: Vec<String>,
    pub project_name: Option<String>,
    pub project_vars: BTreeMap<String, String>,
    pub custom_args: BTreeMap<String, Value>,
    pub plugins: Option<crate::plugins::PluginRegistry>,
    pub packages: Option<Arc<dyn PackageRepository>>,
    pub source_factory: Option<SourceFactory>,
}

impl LifecycleOptions {
    /// Options with sensible defaults under the given work directory.
    pub fn new(application_name: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        Self {
            application_name: application_name.into(),
            cache_dir: work_dir.join("cache"),
            work_dir,
            arch: None,
            parallel_build_count: 1,
            partitions: None,
            filesystem_mounts: FilesystemMounts::new(),
            base_layer_dir: None,
            base_layer_hash: None,
            track_stage_packages: false,
            ignore_patterns: Vec::new(),
            ignore_outdated: Vec::new(),
            project_name: None,
            project_vars: BTreeMap::new(),
            custom_args: BTreeMap::new(),
            plugins: None,
            packages: None,
            source_factory: None,
        }
    }

    pub fn with_arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = Some(arch.into());
        self
    }

    pub fn with_partitions(mut self, partitions: Vec<String>) -> Self {
        self.partitions = Some(partitions);
        self
    }

    pub fn with_filesystem_mounts(mut self, mounts: FilesystemMounts) -> Self {
        self.filesystem_mounts = mounts;
        self
    }

    pub fn with_base_layer(mut self, dir: PathBuf, hash: Vec<u8>) -> Self {
        self.base_layer_dir = Some(dir);
        self.base_layer_hash = Some(hash);
        self
    }

    pub fn with_packages(mut self, packages: Arc<dyn PackageRepository>) -> Self {
        self.packages = Some(packages);
        self
    }

    pub fn with_plugins(mut self, plugins: crate::plugins::PluginRegistry) -> Self {
        self.plugins = Some(plugins);
        self
    }

    pub fn with_source_factory(mut self, factory: SourceFactory) -> Self {
        self.source_factory = Some(factory);
        self
    }

    pub fn with_track_stage_packages(mut self, track: bool) -> Self {
        self.track_stage_packages = track;
        self
    }
}

/// Runs the parts lifecycle.
pub struct LifecycleManager {
    project: Arc<ProjectInfo>,
    part_list: Vec<Part>,
    plugins: crate::plugins::PluginRegistry,
    packages: Arc<dyn PackageRepository>,
    source_factory: SourceFactory,
    base_layer_hash: Option<LayerHash>,
    track_stage_packages: bool,
    ignore_patterns: Vec<String>,
    ignore_outdated: Vec<String>,
}

impl LifecycleManager {
    /// Validate the parts definition and assemble the manager.
    pub fn new(parts: PartsDefinition, options: LifecycleOptions) -> Result<Self> {
        validate_partitions(options.partitions.as_deref(), &options.filesystem_mounts)?;

        let dirs = Arc::new(ProjectDirs::new(
            options.work_dir.clone(),
            options.partitions.clone(),
        ));

        let project = Arc::new(ProjectInfo::new(
            options.application_name,
            options.project_name,
            options.cache_dir,
            options.arch,
            options.parallel_build_count,
            Arc::clone(&dirs),
            options.filesystem_mounts,
            options.base_layer_dir.clone(),
            options.project_vars,
            options.custom_args,
        )?);

        let mut part_list = Vec::new();
        for (name, spec) in parts.parts {
            part_list.push(Part::new(name, spec, Arc::clone(&dirs))?);
        }
        let part_list = parts::sort_parts(part_list)?;

        let plugins = options.plugins.unwrap_or_default();
        for part in &part_list {
            if !plugins.contains(part.plugin_name()) {
                return Err(Error::PluginNotRegistered(part.plugin_name().to_string()));
            }
        }

        Ok(Self {
            project,
            part_list,
            plugins,
            packages: options
                .packages
                .unwrap_or_else(|| Arc::new(NullRepository)),
            source_factory: options
                .source_factory
                .unwrap_or_else(default_source_factory),
            base_layer_hash: options.base_layer_hash.map(LayerHash::new),
            track_stage_packages: options.track_stage_packages,
            ignore_patterns: options.ignore_patterns,
            ignore_outdated: options.ignore_outdated,
        })
    }

    pub fn project_info(&self) -> &ProjectInfo {
        &self.project
    }

    /// The validated parts, in processing order.
    pub fn parts(&self) -> &[Part] {
        &self.part_list
    }

    /// Produce the ordered action list to reach `target_step`.
    ///
    /// Persisted state is re-read on every call, so a plan always
    /// reflects the work tree as it is now.
    pub fn plan(
        &mut self,
        target_step: Step,
        part_names: Option<&[String]>,
    ) -> Result<Vec<Action>> {
        let source_outdated = self.check_sources_outdated()?;
        let mut sequencer = Sequencer::new(
            Arc::clone(&self.project),
            self.part_list.clone(),
            self.base_layer_hash.clone(),
            source_outdated,
        )?;
        sequencer.plan(target_step, part_names)
    }

    /// The scoped executor for running planned actions.
    pub fn action_executor(&mut self) -> Result<ActionExecutor> {
        let executor = Executor::new(
            Arc::clone(&self.project),
            &self.part_list,
            &self.plugins,
            Arc::clone(&self.packages),
            &self.source_factory,
            self.base_layer_hash.clone(),
            self.track_stage_packages,
            &self.ignore_patterns,
        )?;
        ActionExecutor::new(executor)
    }

    /// Clean the given step and everything after it.
    ///
    /// Cleaning PULL of every part removes the whole work tree areas.
    pub fn clean(&mut self, step: Step, part_names: Option<&[String]>) -> Result<()> {
        if step == Step::Pull && part_names.is_none() {
            info!("cleaning the whole work tree");
            let dirs = self.project.dirs();
            file_utils::remove(&dirs.parts_dir())?;
            file_utils::remove(&dirs.backstage_dir())?;
            file_utils::remove(&dirs.work_dir().join("partitions"))?;
            for partition in self.project.partition_keys() {
                file_utils::remove(&dirs.stage_dir(partition.as_deref()))?;
                file_utils::remove(&dirs.prime_dir(partition.as_deref()))?;
                file_utils::remove(&dirs.overlay_dir(partition.as_deref()))?;
            }
            return Ok(());
        }

        let selected: Vec<String> = match part_names {
            Some(names) => {
                for name in names {
                    parts::part_by_name(name, &self.part_list)?;
                }
                names.to_vec()
            }
            None => self.part_list.iter().map(|p| p.name().to_string()).collect(),
        };

        let executor = Executor::new(
            Arc::clone(&self.project),
            &self.part_list,
            &self.plugins,
            Arc::clone(&self.packages),
            &self.source_factory,
            self.base_layer_hash.clone(),
            self.track_stage_packages,
            &self.ignore_patterns,
        )?;

        for name in &selected {
            executor.clean_part_step(name, step)?;
            for next in step.next_steps() {
                executor.clean_part_step(name, next)?;
            }
        }

        Ok(())
    }

    /// Ask each part's source handler whether its upstream changed.
    fn check_sources_outdated(&self) -> Result<BTreeMap<String, OutdatedFiles>> {
        let mut outdated_map = BTreeMap::new();

        for part in &self.part_list {
            let state_path = state::get_step_state_path(part, Step::Pull);
            if !state_path.exists() {
                continue;
            }
            let Some(handler) =
                (self.source_factory)(part, &self.project, &self.ignore_patterns)?
            else {
                continue;
            };
            if let Some(mut outdated) = handler.check_if_outdated(&state_path)? {
                outdated.files.retain(|f| !self.is_ignored_outdated(f));
                outdated.dirs.retain(|d| !self.is_ignored_outdated(d));
                if !outdated.is_empty() {
                    outdated_map.insert(part.name().to_string(), outdated);
                }
            }
        }

        Ok(outdated_map)
    }

    fn is_ignored_outdated(&self, path: &str) -> bool {
        self.ignore_outdated.iter().any(|pattern| {
            glob::Pattern::new(pattern)
                .map(|p| p.matches(path))
                .unwrap_or(false)
        })
    }
}

fn validate_partitions(
    partitions: Option<&[String]>,
    filesystem_mounts: &FilesystemMounts,
) -> Result<()> {
    match partitions {
        None => {
            if !filesystem_mounts.is_empty() {
                return Err(Error::Feature(
                    "filesystem mounts require the partitions feature".to_string(),
                ));
            }
        }
        Some([]) => {
            return Err(Error::Feature(
                "partitions feature enabled but no partitions declared".to_string(),
            ));
        }
        Some(names) => {
            let mut seen = std::collections::BTreeSet::new();
            for name in names {
                let valid = !name.is_empty()
                    && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
                if !valid {
                    return Err(Error::Feature(format!("invalid partition name {name:?}")));
                }
                if !seen.insert(name) {
                    return Err(Error::Feature(format!("duplicate partition {name:?}")));
                }
            }
            for mount in filesystem_mounts.values() {
                for item in mount {
                    if !names.contains(&item.device) {
                        return Err(Error::Feature(format!(
                            "filesystem mount references unknown partition {:?}",
                            item.device
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infos::FilesystemMountItem;
    use tempfile::TempDir;

    fn parts_from_yaml(yaml: &str) -> PartsDefinition {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_parts_definition_keeps_declaration_order() {
        let definition = parts_from_yaml(
            "parts:\n  zebra:\n    plugin: nil\n  alpha:\n    plugin: nil\n",
        );
        let names: Vec<&String> = definition.parts.keys().collect();
        assert_eq!(names, vec!["zebra", "alpha"]);
    }

    #[test]
    fn test_empty_partition_list_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let definition = parts_from_yaml("parts:\n  p1:\n    plugin: nil\n");
        let options =
            LifecycleOptions::new("test", tmp.path()).with_partitions(vec![]);
        assert!(matches!(
            LifecycleManager::new(definition, options),
            Err(Error::Feature(_))
        ));
    }

    #[test]
    fn test_filesystem_mounts_require_partitions() {
        let tmp = TempDir::new().unwrap();
        let definition = parts_from_yaml("parts:\n  p1:\n    plugin: nil\n");
        let mut mounts = FilesystemMounts::new();
        mounts.insert(
            "default".to_string(),
            vec![FilesystemMountItem {
                mount: "/".to_string(),
                device: "default".to_string(),
            }],
        );
        let options = LifecycleOptions::new("test", tmp.path()).with_filesystem_mounts(mounts);
        assert!(matches!(
            LifecycleManager::new(definition, options),
            Err(Error::Feature(_))
        ));
    }

    #[test]
    fn test_overlay_packages_without_base_layer_plan_fine() {
        // planning must work; the feature error surfaces when the pull
        // step actually tries to fetch the packages
        let tmp = TempDir::new().unwrap();
        let definition = parts_from_yaml(
            "parts:\n  p1:\n    plugin: nil\n    overlay-packages: [hello]\n",
        );
        let options = LifecycleOptions::new("test", tmp.path());
        let mut manager = LifecycleManager::new(definition, options).unwrap();
        let actions = manager.plan(Step::Overlay, None).unwrap();
        assert_eq!(actions.len(), 2);
    }

    #[test]
    fn test_unknown_plugin_is_rejected_at_construction() {
        let tmp = TempDir::new().unwrap();
        let definition = parts_from_yaml("parts:\n  p1:\n    plugin: meson\n");
        let options = LifecycleOptions::new("test", tmp.path());
        assert!(matches!(
            LifecycleManager::new(definition, options),
            Err(Error::PluginNotRegistered(_))
        ));
    }

    #[test]
    fn test_unknown_after_reference_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let definition = parts_from_yaml(
            "parts:\n  p1:\n    plugin: nil\n    after: [ghost]\n",
        );
        let options = LifecycleOptions::new("test", tmp.path());
        assert!(matches!(
            LifecycleManager::new(definition, options),
            Err(Error::InvalidPartName(_))
        ));
    }
}
