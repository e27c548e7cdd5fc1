// src/executor/part_handler.rs

//! Per-part action execution.
//!
//! A part handler executes a single action on a single part: it creates
//! the work directories, fetches sources and packages, runs the step's
//! scriptlet or built-in handler, computes the new step state and
//! persists it. It also owns the reverse operation, [`PartHandler::clean_step`].

use crate::actions::{Action, ActionType};
use crate::error::{Error, Result};
use crate::executor::migration::{self, MigrateOptions};
use crate::executor::organize::organize_files;
use crate::executor::step_handler::{
    default_partition_key, StepContents, StepHandler, Stream,
};
use crate::executor::{environment, filesets};
use crate::infos::{FilesystemMount, PartInfo, ProjectInfo, StepInfo};
use crate::overlays::{self, LayerHash, LayerMount, OverlayManager, PackageCacheMount};
use crate::packages::PackageRepository;
use crate::parts::{self, Part};
use crate::plugins::{Plugin, PluginRegistry};
use crate::sources::SourceHandler;
use crate::state::{
    self, BuildState, MigrationContents, MigrationState, OverlayState, PrimeState, PullState,
    StageState, StepState,
};
use crate::steps::Step;
use crate::utils::file_utils::{self, CopyMode};
use serde_yaml::Value;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Squashes overlay layers and migrates layered content to shared areas.
///
/// Layers are visited top to bottom; entries already migrated by a higher
/// layer are subtracted so a lower layer cannot re-cover them. When the
/// source partition is the default one, content is distributed to other
/// partitions according to the filesystem mount entries.
struct Squasher {
    src_partition: Option<String>,
    default_partition: Option<String>,
    filesystem_mount: FilesystemMount,
    /// Per destination partition: source-relative path to migrated name.
    migrated_files: BTreeMap<Option<String>, BTreeMap<String, String>>,
    migrated_dirs: BTreeMap<Option<String>, BTreeMap<String, String>>,
}

impl Squasher {
    fn new(
        src_partition: Option<String>,
        default_partition: Option<String>,
        filesystem_mount: FilesystemMount,
    ) -> Self {
        Self {
            src_partition,
            default_partition,
            filesystem_mount,
            migrated_files: BTreeMap::new(),
            migrated_dirs: BTreeMap::new(),
        }
    }

    fn migrate(
        &mut self,
        srcdir: &Path,
        destdirs: &BTreeMap<Option<String>, PathBuf>,
    ) -> Result<()> {
        if self.src_partition.is_some() && self.src_partition == self.default_partition {
            // distribute content into partitions according to the mounts
            for entry in self.filesystem_mount.clone().iter().rev() {
                let sub_path = entry.mount.trim_start_matches('/').to_string();
                let dst_partition = Some(entry.device.clone());
                let Some(destdir) = destdirs.get(&dst_partition) else {
                    continue;
                };
                self.migrate_subtree(srcdir, &destdir.clone(), &sub_path, dst_partition)?;
            }
        } else {
            let Some(destdir) = destdirs.get(&self.src_partition) else {
                return Ok(());
            };
            self.migrate_subtree(srcdir, &destdir.clone(), "", self.src_partition.clone())?;
        }
        Ok(())
    }

    fn migrate_subtree(
        &mut self,
        srcdir: &Path,
        destdir: &Path,
        sub_path: &str,
        dst_partition: Option<String>,
    ) -> Result<()> {
        let effective_src = if sub_path.is_empty() {
            srcdir.to_path_buf()
        } else {
            srcdir.join(sub_path)
        };
        if !effective_src.is_dir() {
            return Ok(());
        }

        let source_key = |name: &str| {
            if sub_path.is_empty() {
                name.to_string()
            } else {
                format!("{sub_path}/{name}")
            }
        };

        let (mut visible_files, mut visible_dirs) =
            overlays::visible_in_layer(&effective_src, destdir)?;

        let already_migrated_files = self.all_migrated_files();
        let already_migrated_dirs = self.all_migrated_dirs();
        visible_files.retain(|f| !already_migrated_files.contains(&source_key(f)));
        visible_dirs.retain(|d| !already_migrated_dirs.contains(&source_key(d)));

        let (layer_files, layer_dirs) = migration::migrate_files(
            &visible_files,
            &visible_dirs,
            &effective_src,
            destdir,
            &MigrateOptions {
                oci_translation: true,
                ..MigrateOptions::default()
            },
        )?;

        let file_map = self.migrated_files.entry(dst_partition.clone()).or_default();
        for name in layer_files {
            file_map.insert(source_key(&name), name);
        }
        let dir_map = self.migrated_dirs.entry(dst_partition).or_default();
        for name in layer_dirs {
            dir_map.insert(source_key(&name), name);
        }

        Ok(())
    }

    fn all_migrated_files(&self) -> BTreeSet<String> {
        self.migrated_files
            .values()
            .flat_map(|m| m.keys().cloned())
            .collect()
    }

    fn all_migrated_dirs(&self) -> BTreeSet<String> {
        self.migrated_dirs
            .values()
            .flat_map(|m| m.keys().cloned())
            .collect()
    }

    /// Migrated names per destination partition.
    fn into_states(self) -> BTreeMap<Option<String>, MigrationState> {
        let mut states: BTreeMap<Option<String>, MigrationState> = BTreeMap::new();
        for (partition, files) in self.migrated_files {
            let state = states.entry(partition.clone()).or_default();
            state.partition = partition;
            state.files.extend(files.into_values());
        }
        for (partition, dirs) in self.migrated_dirs {
            let state = states.entry(partition.clone()).or_default();
            state.partition = partition;
            state.directories.extend(dirs.into_values());
        }
        states
    }
}

/// Handles lifecycle steps for one part.
pub struct PartHandler {
    part: Part,
    project: Arc<ProjectInfo>,
    part_list: Vec<Part>,
    track_stage_packages: bool,
    overlay_manager: Rc<RefCell<OverlayManager>>,
    packages: Arc<dyn PackageRepository>,
    plugin: Box<dyn Plugin>,
    source_handler: Option<Box<dyn SourceHandler>>,
    base_layer_hash: LayerHash,
    part_properties: BTreeMap<String, Value>,
}

impl PartHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        part: Part,
        project: Arc<ProjectInfo>,
        part_list: Vec<Part>,
        plugins: &PluginRegistry,
        packages: Arc<dyn PackageRepository>,
        overlay_manager: Rc<RefCell<OverlayManager>>,
        source_handler: Option<Box<dyn SourceHandler>>,
        base_layer_hash: Option<LayerHash>,
        track_stage_packages: bool,
    ) -> Result<Self> {
        let plugin = plugins.create(&part, &project)?;
        let part_properties = part.spec().marshal();

        Ok(Self {
            part,
            project,
            part_list,
            track_stage_packages,
            overlay_manager,
            packages,
            plugin,
            source_handler,
            base_layer_hash: base_layer_hash.unwrap_or_default(),
            part_properties,
        })
    }

    pub fn part(&self) -> &Part {
        &self.part
    }

    /// Consolidated build packages for this part.
    pub fn build_packages(&self) -> Vec<String> {
        let mut packages: BTreeSet<String> =
            self.part.spec().build_packages.iter().cloned().collect();
        packages.extend(self.plugin.get_build_packages());
        if let Some(source_type) = self.source_type() {
            packages.extend(self.packages.get_packages_for_source_type(&source_type));
        }
        packages.into_iter().collect()
    }

    /// Consolidated build snaps for this part.
    pub fn build_snaps(&self) -> Vec<String> {
        let mut snaps: BTreeSet<String> = self.part.spec().build_snaps.iter().cloned().collect();
        snaps.extend(self.plugin.get_build_snaps());
        snaps.into_iter().collect()
    }

    fn source_type(&self) -> Option<String> {
        let spec = self.part.spec();
        spec.source_type.clone().or_else(|| {
            spec.source
                .as_deref()
                .map(|s| crate::sources::detect_source_type(s).name().to_string())
        })
    }

    /// Execute the given action for this part.
    pub fn run_action(
        &mut self,
        action: &Action,
        stdout: Stream<'_>,
        stderr: Stream<'_>,
    ) -> Result<()> {
        match action.action_type {
            ActionType::Update => return self.update_action(action, stdout, stderr),
            ActionType::Reapply => return self.reapply_action(action, stdout, stderr),
            ActionType::Rerun => {
                self.clean_step(action.step)?;
                // rebuilding a layer leaves downstream state in place;
                // overlay content changes invalidate downstream through
                // the recorded overlay hash instead
                if action.step != Step::Overlay {
                    for step in action.step.next_steps() {
                        self.clean_step(step)?;
                    }
                }
            }
            ActionType::Run => {}
            ActionType::Skip => {
                return Err(Error::InvalidAction(format!(
                    "cannot execute a skipped action for part {:?}",
                    self.part.name()
                )));
            }
        }

        if action.step == Step::Build {
            self.plugin.set_action_properties(&action.properties);
        }

        let state = match action.step {
            Step::Pull => self.run_pull(stdout, stderr)?,
            Step::Overlay => self.run_overlay(stdout, stderr)?,
            Step::Build => self.run_build(stdout, stderr, false)?,
            Step::Stage => self.run_stage(stdout, stderr)?,
            Step::Prime => self.run_prime(stdout, stderr)?,
        };

        let state_file = state::get_step_state_path(&self.part, action.step);
        state.write(&state_file)
    }

    fn run_pull(&self, stdout: Stream<'_>, stderr: Stream<'_>) -> Result<StepState> {
        file_utils::remove(&self.part.part_src_dir())?;
        self.make_dirs()?;

        let fetched_packages = self.fetch_stage_packages()?;
        let fetched_snaps = self.fetch_stage_snaps()?;
        self.fetch_overlay_packages()?;

        self.run_step(Step::Pull, &self.part.part_src_dir(), stdout, stderr)?;

        let mut assets: BTreeMap<String, Value> = BTreeMap::new();
        assets.insert(
            "stage-packages".to_string(),
            serde_yaml::to_value(&fetched_packages)?,
        );
        assets.insert(
            "stage-snaps".to_string(),
            serde_yaml::to_value(&fetched_snaps)?,
        );
        assets.insert(
            "source-details".to_string(),
            serde_yaml::to_value(
                self.source_handler
                    .as_ref()
                    .and_then(|h| h.source_details()),
            )?,
        );

        Ok(StepState::Pull(PullState {
            part_properties: self.part_properties.clone(),
            project_options: self.project.project_options(),
            assets,
            outdated_files: None,
            outdated_dirs: None,
        }))
    }

    fn run_overlay(&self, stdout: Stream<'_>, stderr: Stream<'_>) -> Result<StepState> {
        self.make_dirs()?;

        if self.part.has_overlay() {
            // install overlay packages into the layer
            let overlay_packages = &self.part.spec().overlay_packages;
            if !overlay_packages.is_empty() {
                let mount =
                    LayerMount::new(Rc::clone(&self.overlay_manager), &self.part, true)?;
                mount.install_packages(overlay_packages).map_err(|e| {
                    overlay_package_error(self.part.name(), e)
                })?;
            }

            // execute the overlay scriptlet inside the mounted view
            {
                let _mount =
                    LayerMount::new(Rc::clone(&self.overlay_manager), &self.part, false)?;
                self.run_step(
                    Step::Overlay,
                    &self.part.part_layer_dir(None),
                    stdout,
                    stderr,
                )?;
            }

            self.apply_overlay_filter()?;
        }

        let layer_hash = self.compute_layer_hash(false);
        layer_hash.save(&self.part)?;

        // record the layer contents per partition
        let mut files = BTreeSet::new();
        let mut directories = BTreeSet::new();
        let mut partitions_contents = BTreeMap::new();

        for partition in self.project.partition_keys() {
            let (layer_files, layer_dirs) =
                walk_tree(&self.part.part_layer_dir(partition.as_deref()))?;
            if self.project.is_default_partition(partition.as_deref()) {
                files = layer_files;
                directories = layer_dirs;
            } else if let Some(name) = partition {
                partitions_contents.insert(
                    name,
                    MigrationContents {
                        files: layer_files,
                        directories: layer_dirs,
                    },
                );
            }
        }

        Ok(StepState::Overlay(OverlayState {
            part_properties: self.part_properties.clone(),
            project_options: self.project.project_options(),
            partition: default_partition_key(&self.part),
            files,
            directories,
            partitions_contents,
        }))
    }

    fn run_build(
        &self,
        stdout: Stream<'_>,
        stderr: Stream<'_>,
        update: bool,
    ) -> Result<StepState> {
        self.make_dirs()?;
        self.unpack_stage_packages()?;
        self.unpack_stage_snaps()?;

        if !update && !self.plugin.get_out_of_source_build() {
            file_utils::remove(&self.part.part_build_dir())?;
            file_utils::copy_tree(
                &self.part.part_src_dir(),
                &self.part.part_build_dir(),
                CopyMode::Copy,
                &[],
            )?;
        }

        if parts::has_overlay_visibility(&self.part, &self.part_list) {
            let top_part = self.part_list.last().unwrap_or(&self.part).clone();
            let _mount = LayerMount::new(Rc::clone(&self.overlay_manager), &top_part, false)?;
            self.run_step(Step::Build, &self.part.part_build_dir(), stdout, stderr)?;
        } else {
            self.run_step(Step::Build, &self.part.part_build_dir(), stdout, stderr)?;
        }

        // organizing in the build step keeps stage re-runs working and
        // lets collision detection account for renamed paths; overwrite
        // is only allowed when updating, so a part can re-organize over
        // its own previous output but never clobber other content
        organize_files(
            self.part.name(),
            &self.part.spec().organize,
            &self.part.part_install_dirs(),
            update,
        )?;

        let mut assets: BTreeMap<String, Value> = BTreeMap::new();
        assets.insert(
            "build-packages".to_string(),
            serde_yaml::to_value(self.build_packages())?,
        );
        assets.insert(
            "build-snaps".to_string(),
            serde_yaml::to_value(self.build_snaps())?,
        );
        assets.insert(
            "installed-packages".to_string(),
            serde_yaml::to_value(self.packages.get_installed_packages().unwrap_or_default())?,
        );
        assets.insert("uname".to_string(), Value::String(uname_string()));

        // the whole stack's hash binds this build to the overlay contents
        // it could see
        let overlay_hash = self.compute_layer_hash(true);

        Ok(StepState::Build(BuildState {
            part_properties: self.part_properties.clone(),
            project_options: self.project.project_options(),
            assets,
            overlay_hash: Some(overlay_hash.hex()),
        }))
    }

    fn run_stage(&self, stdout: Stream<'_>, stderr: Stream<'_>) -> Result<StepState> {
        self.make_dirs()?;

        let contents = self.run_step(
            Step::Stage,
            &self.project.dirs().stage_dir(None),
            stdout,
            stderr,
        )?;

        self.migrate_overlay_files_to_stage()?;

        let overlay_hash = self.compute_layer_hash(true);

        let default_key = default_partition_key(&self.part);
        let default_contents = contents.get(default_key.as_deref()).cloned().unwrap_or_default();

        Ok(StepState::Stage(StageState {
            part_properties: self.part_properties.clone(),
            project_options: self.project.project_options(),
            partition: default_key,
            files: default_contents.files,
            directories: default_contents.dirs,
            partitions_contents: non_default_contents(&self.project, &contents),
            overlay_hash: Some(overlay_hash.hex()),
            backstage_files: default_contents.backstage_files,
            backstage_directories: default_contents.backstage_dirs,
        }))
    }

    fn run_prime(&self, stdout: Stream<'_>, stderr: Stream<'_>) -> Result<StepState> {
        self.make_dirs()?;

        let contents = self.run_step(
            Step::Prime,
            &self.project.dirs().prime_dir(None),
            stdout,
            stderr,
        )?;

        self.migrate_overlay_files_to_prime()?;

        let default_key = default_partition_key(&self.part);
        let default_contents = contents.get(default_key.as_deref()).cloned().unwrap_or_default();

        let primed_stage_packages = if !self.part.spec().stage_packages.is_empty()
            && self.track_stage_packages
        {
            self.get_primed_stage_packages(&default_contents.files)?
        } else {
            BTreeSet::new()
        };

        Ok(StepState::Prime(PrimeState {
            part_properties: self.part_properties.clone(),
            project_options: self.project.project_options(),
            partition: default_key,
            files: default_contents.files,
            directories: default_contents.dirs,
            partitions_contents: non_default_contents(&self.project, &contents),
            primed_stage_packages,
        }))
    }

    /// Run the step's scriptlet if overriding, the built-in handler
    /// otherwise.
    fn run_step(
        &self,
        step: Step,
        work_dir: &Path,
        stdout: Stream<'_>,
        stderr: Stream<'_>,
    ) -> Result<StepContents> {
        let part_info = PartInfo::new(&self.project, &self.part);
        let step_info = StepInfo::new(part_info, step);

        let env = environment::generate_step_environment(
            &self.part,
            self.plugin.as_ref(),
            &step_info,
        );

        if step == Step::Build {
            // dependencies have all run at this point, so the composed
            // environment is final
            environment::validate_build_environment(&self.part, self.plugin.as_ref(), &env)?;
        }

        let handler = StepHandler::new(
            &self.part,
            step_info,
            self.plugin.as_ref(),
            self.source_handler.as_deref(),
            &env,
            stdout,
            stderr,
        );

        if let Some(scriptlet) = self.part.spec().scriptlet(step) {
            let scriptlet_name = format!("override-{}", step.name());
            handler.run_scriptlet(scriptlet, &scriptlet_name, work_dir)?;
            return Ok(StepContents::default());
        }

        handler.run_builtin()
    }

    /// Delete layer entries not matching the overlay file filter.
    fn apply_overlay_filter(&self) -> Result<()> {
        let Some(overlay_files) = &self.part.spec().overlay_files else {
            return Ok(());
        };

        let destdir = self.part.part_layer_dir(None);
        let fileset = filesets::Fileset::new("overlay", Some(overlay_files.clone()));
        let (keep_files, keep_dirs) = filesets::migratable_filesets(&fileset, &destdir)?;

        let mut removed_dirs: Vec<PathBuf> = Vec::new();
        for entry in WalkDir::new(&destdir).min_depth(1) {
            let entry = entry.map_err(std::io::Error::from)?;
            if removed_dirs.iter().any(|d| entry.path().starts_with(d)) {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&destdir)
                .expect("walked entry is under the walk root")
                .to_string_lossy()
                .into_owned();

            if entry.file_type().is_dir() {
                if !keep_dirs.contains(&rel) {
                    debug!("delete dir: {:?}", rel);
                    fs::remove_dir_all(entry.path())?;
                    removed_dirs.push(entry.path().to_path_buf());
                }
            } else if !keep_files.contains(&rel)
                && !overlays::is_whiteout_file(entry.path())
                && !overlays::is_oci_whiteout(entry.path())
            {
                debug!("delete file: {:?}", rel);
                fs::remove_file(entry.path())?;
            }
        }

        Ok(())
    }

    /// Compute the layer verification hash up to this part, or for the
    /// whole stack.
    fn compute_layer_hash(&self, all_parts: bool) -> LayerHash {
        let mut part_hash = self.base_layer_hash.clone();
        for part in &self.part_list {
            part_hash = LayerHash::for_part(part, &part_hash);
            if !all_parts && part.name() == self.part.name() {
                break;
            }
        }
        part_hash
    }

    fn update_action(
        &mut self,
        action: &Action,
        stdout: Stream<'_>,
        stderr: Stream<'_>,
    ) -> Result<()> {
        match action.step {
            Step::Pull => self.update_pull(stdout, stderr)?,
            // an out of date overlay must not rerun, or its state would be
            // cleaned and build would rerun instead of updating
            Step::Overlay => {}
            Step::Build => {
                self.plugin.set_action_properties(&action.properties);
                self.update_build(stdout, stderr)?;
            }
            step => {
                return Err(Error::InvalidAction(format!(
                    "cannot update step {:?} of {:?}",
                    step.name(),
                    self.part.name()
                )));
            }
        }

        // refresh the state so downstream steps see this update
        let state_file = state::get_step_state_path(&self.part, action.step);
        if action.step == Step::Pull {
            if let Some(StepState::Pull(pull_state)) =
                state::load_step_state(&self.part, Step::Pull)?
            {
                let new_state = StepState::Pull(PullState {
                    outdated_files: action.properties.changed_files.clone(),
                    outdated_dirs: action.properties.changed_dirs.clone(),
                    ..pull_state
                });
                new_state.write(&state_file)?;
            }
        } else {
            touch(&state_file)?;
        }

        Ok(())
    }

    fn update_pull(&self, stdout: Stream<'_>, stderr: Stream<'_>) -> Result<()> {
        self.make_dirs()?;

        // an override-pull scriptlet replaces the source update
        if self.part.spec().override_pull.is_some() {
            self.run_step(Step::Pull, &self.part.part_src_dir(), stdout, stderr)?;
            return Ok(());
        }

        let Some(handler) = &self.source_handler else {
            warn!(
                "update requested on part {:?} without a source handler",
                self.part.name()
            );
            return Ok(());
        };

        handler.update()
    }

    fn update_build(&self, stdout: Stream<'_>, stderr: Stream<'_>) -> Result<()> {
        if !self.plugin.get_out_of_source_build() {
            // real copies, the build may modify these files in place
            file_utils::copy_tree(
                &self.part.part_src_dir(),
                &self.part.part_build_dir(),
                CopyMode::Copy,
                &[],
            )?;
        }

        file_utils::remove(&self.part.part_install_dir(None))?;

        self.run_build(stdout, stderr, true)?;
        Ok(())
    }

    fn reapply_action(
        &mut self,
        action: &Action,
        stdout: Stream<'_>,
        stderr: Stream<'_>,
    ) -> Result<()> {
        if action.step != Step::Overlay {
            return Err(Error::InvalidAction(format!(
                "cannot reapply step {:?} of {:?}",
                action.step.name(),
                self.part.name()
            )));
        }

        // repopulate the layer, keeping the step state
        for (_, layer_dir) in self.part.part_layer_dirs() {
            file_utils::remove(&layer_dir)?;
        }
        self.run_overlay(stdout, stderr)?;
        Ok(())
    }

    /// Migrate visible overlay content into the shared stage tree.
    ///
    /// Only the first part with overlay parameters to reach the step
    /// performs the migration; the overlay migration state file is the
    /// exclusion mark.
    fn migrate_overlay_files_to_stage(&self) -> Result<()> {
        let parts_with_overlay = parts::parts_with_overlay(&self.part_list);
        if !parts_with_overlay.iter().any(|p| p.name() == self.part.name()) {
            return Ok(());
        }

        debug!("staging overlay files");
        let mut consolidated: BTreeMap<Option<String>, MigrationState> = BTreeMap::new();

        for src_partition in self.project.partition_keys() {
            let state_path = state::get_overlay_migration_state_path(
                &self.part.overlay_dir(src_partition.as_deref()),
                Step::Stage,
            );
            if state_path.exists() {
                debug!(
                    "stage overlay migration state exists, not migrating overlay data \
                     for partition {:?}",
                    src_partition
                );
                continue;
            }

            let mut squasher = Squasher::new(
                src_partition.clone(),
                default_partition_key(&self.part),
                self.project.default_filesystem_mount(),
            );

            let destdirs: BTreeMap<Option<String>, PathBuf> = self
                .project
                .partition_keys()
                .into_iter()
                .map(|p| {
                    let dir = self.project.dirs().stage_dir(p.as_deref());
                    (p, dir)
                })
                .collect();

            // process layers from top to bottom
            for part in parts_with_overlay.iter().rev() {
                debug!(
                    "migrate {:?} partition part {:?} layer to stage",
                    src_partition,
                    part.name()
                );
                squasher.migrate(&part.part_layer_dir(src_partition.as_deref()), &destdirs)?;
            }

            for (partition, state) in squasher.into_states() {
                let entry = consolidated.entry(partition.clone()).or_default();
                entry.partition = partition;
                entry.files.extend(state.files);
                entry.directories.extend(state.directories);
            }
        }

        self.write_overlay_migration_states(consolidated, Step::Stage)
    }

    /// Migrate previously staged overlay content into the prime tree.
    fn migrate_overlay_files_to_prime(&self) -> Result<()> {
        let parts_with_overlay = parts::parts_with_overlay(&self.part_list);
        if !parts_with_overlay.iter().any(|p| p.name() == self.part.name()) {
            return Ok(());
        }

        debug!("priming overlay files");
        let mut migration_states: BTreeMap<Option<String>, MigrationState> = BTreeMap::new();

        for partition in self.project.partition_keys() {
            let overlay_dir = self.part.overlay_dir(partition.as_deref());
            let prime_state_path =
                state::get_overlay_migration_state_path(&overlay_dir, Step::Prime);
            if prime_state_path.exists() {
                debug!(
                    "prime overlay migration state exists, not migrating overlay data \
                     for partition {:?}",
                    partition
                );
                continue;
            }

            // the stage migration state is the input set for priming
            let Some(stage_migration_state) =
                state::load_overlay_migration_state(&overlay_dir, Step::Stage)?
            else {
                debug!(
                    "no overlay content was migrated to stage for partition {:?}",
                    partition
                );
                continue;
            };

            let prime_dir = self.project.dirs().prime_dir(partition.as_deref());
            let (mut migrated_files, migrated_dirs) = migration::migrate_files(
                &stage_migration_state.files,
                &stage_migration_state.directories,
                &self.project.dirs().stage_dir(partition.as_deref()),
                &prime_dir,
                &MigrateOptions {
                    permissions: &self.part.spec().permissions,
                    ..MigrateOptions::default()
                },
            )?;

            let whiteouts = if self.project.is_default_partition(partition.as_deref()) {
                // only the default partition lands on the base layer, so
                // only its dangling whiteouts are meaningful
                migration::filter_dangling_whiteouts(
                    &mut migrated_files,
                    &migrated_dirs,
                    self.overlay_manager.borrow().base_layer_dir(),
                )
            } else {
                migration::filter_all_whiteouts(&mut migrated_files)
            };
            self.clean_whiteouts(&prime_dir, &whiteouts);

            migration_states.insert(
                partition.clone(),
                MigrationState {
                    partition,
                    files: migrated_files,
                    directories: migrated_dirs,
                },
            );
        }

        self.write_overlay_migration_states(migration_states, Step::Prime)
    }

    /// Write one overlay migration state per partition, never
    /// overwriting an existing state file.
    fn write_overlay_migration_states(
        &self,
        states: BTreeMap<Option<String>, MigrationState>,
        step: Step,
    ) -> Result<()> {
        for partition in self.project.partition_keys() {
            let state_path = state::get_overlay_migration_state_path(
                &self.part.overlay_dir(partition.as_deref()),
                step,
            );
            if state_path.exists() {
                debug!(
                    "{} overlay migration state exists, not overwriting migrated overlay data",
                    step.name()
                );
                continue;
            }
            if let Some(state) = states.get(&partition) {
                state.write(&state_path)?;
            }
        }
        Ok(())
    }

    fn clean_whiteouts(&self, prime_dir: &Path, whiteouts: &BTreeSet<String>) {
        for whiteout in whiteouts {
            let primed_whiteout = prime_dir.join(whiteout);
            if let Err(e) = fs::remove_file(&primed_whiteout) {
                debug!("error unlinking {:?}: {}", primed_whiteout, e);
            }
        }
    }

    /// Remove the work files and the state of the given step.
    pub fn clean_step(&self, step: Step) -> Result<()> {
        debug!("clean {}:{}", self.part.name(), step);

        match step {
            Step::Pull => self.clean_pull()?,
            Step::Overlay => self.clean_overlay()?,
            Step::Build => self.clean_build()?,
            Step::Stage => self.clean_stage()?,
            Step::Prime => self.clean_prime()?,
        }

        state::remove(&self.part, step)
    }

    fn clean_pull(&self) -> Result<()> {
        file_utils::remove(&self.part.part_packages_dir())?;
        file_utils::remove(&self.part.part_snaps_dir())?;
        file_utils::remove(&self.part.part_src_dir())
    }

    fn clean_overlay(&self) -> Result<()> {
        for (_, layer_dir) in self.part.part_layer_dirs() {
            file_utils::remove(&layer_dir)?;
        }
        file_utils::remove(&self.part.part_state_dir().join("layer_hash"))
    }

    fn clean_build(&self) -> Result<()> {
        file_utils::remove(&self.part.part_build_dir())?;
        for (_, install_dir) in self.part.part_install_dirs() {
            file_utils::remove(&install_dir)?;
        }
        file_utils::remove(&self.part.part_export_dir())
    }

    fn clean_stage(&self) -> Result<()> {
        for partition in self.project.partition_keys() {
            self.clean_shared(
                Step::Stage,
                partition.as_deref(),
                &self.project.dirs().stage_dir(partition.as_deref()),
            )?;
        }

        let part_states = load_part_states(Step::Stage, &self.part_list)?;
        migration::clean_backstage(
            self.part.name(),
            &self.part.backstage_dir(),
            &part_states,
        )
    }

    fn clean_prime(&self) -> Result<()> {
        for partition in self.project.partition_keys() {
            self.clean_shared(
                Step::Prime,
                partition.as_deref(),
                &self.project.dirs().prime_dir(partition.as_deref()),
            )?;
        }
        Ok(())
    }

    fn clean_shared(
        &self,
        step: Step,
        partition: Option<&str>,
        shared_dir: &Path,
    ) -> Result<()> {
        debug!(
            "clean shared dir {:?} for step {} and partition {:?}",
            shared_dir, step, partition
        );
        let part_states = load_part_states(step, &self.part_list)?;
        let overlay_dir = self.part.overlay_dir(partition);
        let overlay_migration_state = state::load_overlay_migration_state(&overlay_dir, step)?;

        migration::clean_shared_area(
            self.part.name(),
            shared_dir,
            &part_states,
            overlay_migration_state.as_ref(),
            partition,
        )?;

        // remove the migrated overlay data when the last part with
        // overlay parameters leaves this step
        let parts_with_overlay_in_step: Vec<&Part> = parts::parts_with_overlay(&self.part_list)
            .into_iter()
            .filter(|p| part_states.contains_key(p.name()))
            .collect();

        if self.part.has_overlay() && parts_with_overlay_in_step.len() == 1 {
            migration::clean_shared_overlay(
                shared_dir,
                &part_states,
                overlay_migration_state.as_ref(),
                partition,
            )?;
            let state_path = state::get_overlay_migration_state_path(&overlay_dir, step);
            info!(
                "remove overlay migration state for part {:?}, step {}",
                self.part.name(),
                step
            );
            if let Err(e) = fs::remove_file(&state_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }

        Ok(())
    }

    /// Create the alias symlinks for a renamed default partition.
    fn symlink_alias_to_default(&self) -> Result<()> {
        let Some(alias_dir) = self.project.alias_partition_dir() else {
            return Ok(());
        };
        fs::create_dir_all(&alias_dir)?;

        let dirs = self.project.dirs();
        let links = [
            (dirs.parts_dir(), alias_dir.join("parts")),
            (dirs.stage_dir(None), alias_dir.join("stage")),
            (dirs.prime_dir(None), alias_dir.join("prime")),
            (dirs.overlay_dir(None), alias_dir.join("overlay")),
        ];

        for (src, dst) in links {
            match fs::symlink_metadata(&dst) {
                Ok(meta) if meta.file_type().is_symlink() => continue,
                Ok(_) => {
                    // the alias name clashed with a previously concrete
                    // partition directory
                    return Err(Error::EnvironmentChanged(format!(
                        "cannot create symlink {dst:?}, a concrete directory already exists"
                    )));
                }
                Err(_) => std::os::unix::fs::symlink(&src, &dst)?,
            }
        }

        Ok(())
    }

    fn make_dirs(&self) -> Result<()> {
        let mut dirs = vec![
            self.part.part_src_dir(),
            self.part.part_build_dir(),
            self.part.part_export_dir(),
            self.part.part_state_dir(),
            self.part.part_run_dir(),
            self.part.backstage_dir(),
        ];
        for (_, dir) in self.part.part_install_dirs() {
            dirs.push(dir);
        }
        for (_, dir) in self.part.part_layer_dirs() {
            dirs.push(dir);
        }
        for partition in self.project.partition_keys() {
            dirs.push(self.project.dirs().stage_dir(partition.as_deref()));
            dirs.push(self.project.dirs().prime_dir(partition.as_deref()));
            dirs.push(self.project.dirs().overlay_dir(partition.as_deref()));
        }

        for dir in dirs {
            fs::create_dir_all(dir)?;
        }

        self.symlink_alias_to_default()
    }

    fn fetch_stage_packages(&self) -> Result<Option<Vec<String>>> {
        let stage_packages = &self.part.spec().stage_packages;
        if stage_packages.is_empty() {
            return Ok(None);
        }

        info!("fetching stage packages for part {:?}", self.part.name());
        let fetched = self
            .packages
            .fetch_stage_packages(
                self.project.cache_dir(),
                stage_packages,
                self.project.target_arch(),
                &self.part.part_packages_dir(),
            )
            .map_err(|e| stage_package_error(self.part.name(), e))?;
        Ok(Some(fetched))
    }

    fn fetch_stage_snaps(&self) -> Result<Option<Vec<String>>> {
        let stage_snaps = &self.part.spec().stage_snaps;
        if stage_snaps.is_empty() {
            return Ok(None);
        }

        info!("fetching stage snaps for part {:?}", self.part.name());
        self.packages
            .fetch_stage_snaps(stage_snaps, &self.part.part_snaps_dir())?;
        Ok(Some(stage_snaps.clone()))
    }

    fn fetch_overlay_packages(&self) -> Result<()> {
        let overlay_packages = &self.part.spec().overlay_packages;
        if overlay_packages.is_empty() {
            return Ok(());
        }

        if self.overlay_manager.borrow().base_layer_dir().is_none() {
            return Err(Error::Feature(format!(
                "part {:?} declares overlay packages but no base layer is configured",
                self.part.name()
            )));
        }

        info!("fetching overlay packages for part {:?}", self.part.name());
        let mount = PackageCacheMount::new(Rc::clone(&self.overlay_manager))?;
        mount
            .download_packages(overlay_packages)
            .map_err(|e| overlay_package_error(self.part.name(), e))
    }

    fn unpack_stage_packages(&self) -> Result<()> {
        let pulled_packages: Option<Vec<String>> =
            match state::load_step_state(&self.part, Step::Pull)? {
                Some(StepState::Pull(pull_state)) => pull_state
                    .assets
                    .get("stage-packages")
                    .and_then(|v| serde_yaml::from_value(v.clone()).ok()),
                _ => None,
            };

        self.packages.unpack_stage_packages(
            &self.part.part_packages_dir(),
            &self.part.part_install_dir(None),
            pulled_packages.as_deref(),
            self.track_stage_packages,
        )
    }

    fn unpack_stage_snaps(&self) -> Result<()> {
        if self.part.spec().stage_snaps.is_empty() {
            return Ok(());
        }
        debug!(
            "unpacking stage snaps to {:?}",
            self.part.part_install_dir(None)
        );
        self.packages
            .unpack_stage_snaps(&self.part.part_snaps_dir(), &self.part.part_install_dir(None))
    }

    fn get_primed_stage_packages(
        &self,
        primed_files: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>> {
        let mut primed_stage_packages = BTreeSet::new();
        for file in primed_files {
            for partition in self.project.partition_keys() {
                let path = self.project.dirs().prime_dir(partition.as_deref()).join(file);
                if !path.exists() {
                    continue;
                }
                if let Some(package) = self.packages.read_origin_stage_package(&path)? {
                    primed_stage_packages.insert(package);
                }
            }
        }
        Ok(primed_stage_packages)
    }
}

/// Load every part's state for a step from disk.
pub fn load_part_states(
    step: Step,
    part_list: &[Part],
) -> Result<BTreeMap<String, StepState>> {
    let mut states = BTreeMap::new();
    for part in part_list {
        if let Some(state) = state::load_step_state(part, step)? {
            states.insert(part.name().to_string(), state);
        }
    }
    Ok(states)
}

fn non_default_contents(
    project: &ProjectInfo,
    contents: &StepContents,
) -> BTreeMap<String, MigrationContents> {
    contents
        .partitions
        .iter()
        .filter_map(|(partition, entry)| match partition {
            Some(name) if !project.is_default_partition(Some(name)) => Some((
                name.clone(),
                MigrationContents {
                    files: entry.files.clone(),
                    directories: entry.dirs.clone(),
                },
            )),
            _ => None,
        })
        .collect()
}

fn walk_tree(root: &Path) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
    let mut files = BTreeSet::new();
    let mut dirs = BTreeSet::new();

    if !root.is_dir() {
        return Ok((files, dirs));
    }

    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(std::io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .expect("walked entry is under the walk root")
            .to_string_lossy()
            .into_owned();
        if entry.file_type().is_dir() {
            dirs.insert(rel);
        } else {
            files.insert(rel);
        }
    }

    Ok((files, dirs))
}

fn touch(path: &Path) -> Result<()> {
    match fs::read(path) {
        Ok(content) => {
            fs::write(path, content)?;
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn stage_package_error(part_name: &str, error: Error) -> Error {
    match error {
        Error::PackageNotFound(package_name) => Error::StagePackageNotFound {
            part_name: part_name.to_string(),
            package_name,
        },
        other => other,
    }
}

fn overlay_package_error(part_name: &str, error: Error) -> Error {
    match error {
        Error::PackageNotFound(package_name) => Error::OverlayPackageNotFound {
            part_name: part_name.to_string(),
            package_name,
        },
        other => other,
    }
}

fn uname_string() -> String {
    let mut buf: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut buf) } != 0 {
        return String::new();
    }
    let field = |ptr: *const libc::c_char| {
        unsafe { std::ffi::CStr::from_ptr(ptr) }
            .to_string_lossy()
            .into_owned()
    };
    format!(
        "{} {} {} {}",
        field(buf.sysname.as_ptr()),
        field(buf.release.as_ptr()),
        field(buf.version.as_ptr()),
        field(buf.machine.as_ptr()),
    )
}
