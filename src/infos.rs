// src/infos.rs

//! Project, part and step information.
//!
//! Information cascades by explicit composition: a [`StepInfo`] borrows a
//! [`PartInfo`], which borrows the [`ProjectInfo`], and each level exposes
//! delegating accessors. Application-defined custom arguments are a typed
//! mapping reachable through [`ProjectInfo::get`], not shadow attributes.

use crate::error::{Error, Result};
use crate::parts::Part;
use crate::steps::Step;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name of the partition used when the partitions feature is disabled.
pub const DEFAULT_PARTITION: &str = "default";

/// Architecture translations: deb-style name to platform triplet.
const ARCH_TRANSLATIONS: &[(&str, &str)] = &[
    ("amd64", "x86_64-linux-gnu"),
    ("arm64", "aarch64-linux-gnu"),
    ("armhf", "arm-linux-gnueabihf"),
    ("i386", "i386-linux-gnu"),
    ("ppc64el", "powerpc64le-linux-gnu"),
    ("riscv64", "riscv64-linux-gnu"),
    ("s390x", "s390x-linux-gnu"),
];

fn arch_triplet(arch: &str) -> Result<&'static str> {
    ARCH_TRANSLATIONS
        .iter()
        .find(|(name, _)| *name == arch)
        .map(|(_, triplet)| *triplet)
        .ok_or_else(|| Error::InvalidArchitecture(arch.to_string()))
}

/// The deb-style name of the architecture we are running on.
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "armhf",
        "x86" => "i386",
        "powerpc64" => "ppc64el",
        "riscv64" => "riscv64",
        "s390x" => "s390x",
        other => other,
    }
}

/// One entry of a filesystem mount: the subtree at `mount` goes to the
/// partition named by `device`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemMountItem {
    pub mount: String,
    pub device: String,
}

/// An ordered list of mount entries for one filesystem.
pub type FilesystemMount = Vec<FilesystemMountItem>;

/// Filesystem mounts by filesystem name.
pub type FilesystemMounts = BTreeMap<String, FilesystemMount>;

/// The work directory layout.
///
/// ```text
/// parts/<name>/{src,build,install,layer,state,run,export,stage_packages,stage_snaps}
/// stage/  prime/  backstage/  overlay/{mount,work,packages,empty}
/// partitions/<partition>/{parts,stage,prime,overlay}
/// ```
#[derive(Debug, Clone)]
pub struct ProjectDirs {
    work_dir: PathBuf,
    partitions: Option<Vec<String>>,
}

impl ProjectDirs {
    pub fn new(work_dir: impl Into<PathBuf>, partitions: Option<Vec<String>>) -> Self {
        Self {
            work_dir: work_dir.into(),
            partitions,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// The declared partitions, if the feature is enabled.
    pub fn partitions(&self) -> Option<&[String]> {
        self.partitions.as_deref()
    }

    /// The first declared partition, if partitions are enabled.
    pub fn default_partition(&self) -> Option<&str> {
        self.partitions.as_ref().and_then(|p| p.first()).map(String::as_str)
    }

    /// Iteration keys: one `None` entry without partitions, otherwise each
    /// partition name.
    pub fn partition_keys(&self) -> Vec<Option<String>> {
        match &self.partitions {
            Some(partitions) => partitions.iter().cloned().map(Some).collect(),
            None => vec![None],
        }
    }

    /// Whether the given partition key refers to the default partition.
    pub fn is_default_partition(&self, partition: Option<&str>) -> bool {
        match partition {
            None => true,
            Some(name) => self.default_partition() == Some(name),
        }
    }

    /// The directory holding a non-default partition's content, if any.
    fn partition_base(&self, partition: Option<&str>) -> Option<PathBuf> {
        if self.is_default_partition(partition) {
            None
        } else {
            partition.map(|name| self.work_dir.join("partitions").join(name))
        }
    }

    pub fn parts_dir(&self) -> PathBuf {
        self.work_dir.join("parts")
    }

    /// The parts directory holding a partition's per-part areas.
    pub fn partition_parts_dir(&self, partition: Option<&str>) -> PathBuf {
        match self.partition_base(partition) {
            Some(base) => base.join("parts"),
            None => self.parts_dir(),
        }
    }

    pub fn stage_dir(&self, partition: Option<&str>) -> PathBuf {
        match self.partition_base(partition) {
            Some(base) => base.join("stage"),
            None => self.work_dir.join("stage"),
        }
    }

    pub fn prime_dir(&self, partition: Option<&str>) -> PathBuf {
        match self.partition_base(partition) {
            Some(base) => base.join("prime"),
            None => self.work_dir.join("prime"),
        }
    }

    pub fn backstage_dir(&self) -> PathBuf {
        self.work_dir.join("backstage")
    }

    pub fn overlay_dir(&self, partition: Option<&str>) -> PathBuf {
        match self.partition_base(partition) {
            Some(base) => base.join("overlay"),
            None => self.work_dir.join("overlay"),
        }
    }

    /// Mountpoint of the merged overlay view.
    pub fn overlay_mount_dir(&self) -> PathBuf {
        self.overlay_dir(None).join("mount")
    }

    /// Scratch directory required by the overlay filesystem driver.
    pub fn overlay_work_dir(&self) -> PathBuf {
        self.overlay_dir(None).join("work")
    }

    /// The shared overlay package cache layer.
    pub fn overlay_packages_dir(&self) -> PathBuf {
        self.overlay_dir(None).join("packages")
    }

    /// An always-empty base layer stand-in.
    pub fn overlay_empty_dir(&self) -> PathBuf {
        self.overlay_dir(None).join("empty")
    }
}

/// Project-wide information, shared by every part.
#[derive(Debug)]
pub struct ProjectInfo {
    application_name: String,
    project_name: Option<String>,
    cache_dir: PathBuf,
    arch: String,
    host_arch: String,
    arch_triplet: String,
    parallel_build_count: usize,
    dirs: Arc<ProjectDirs>,
    filesystem_mounts: FilesystemMounts,
    base_layer_dir: Option<PathBuf>,
    project_vars: BTreeMap<String, String>,
    custom_args: BTreeMap<String, Value>,
}

impl ProjectInfo {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        application_name: String,
        project_name: Option<String>,
        cache_dir: PathBuf,
        arch: Option<String>,
        parallel_build_count: usize,
        dirs: Arc<ProjectDirs>,
        filesystem_mounts: FilesystemMounts,
        base_layer_dir: Option<PathBuf>,
        project_vars: BTreeMap<String, String>,
        custom_args: BTreeMap<String, Value>,
    ) -> Result<Self> {
        let host_arch = host_architecture().to_string();
        let arch = arch.unwrap_or_else(|| host_arch.clone());
        let triplet = arch_triplet(&arch)?.to_string();

        Ok(Self {
            application_name,
            project_name,
            cache_dir,
            arch,
            host_arch,
            arch_triplet: triplet,
            parallel_build_count: parallel_build_count.max(1),
            dirs,
            filesystem_mounts,
            base_layer_dir,
            project_vars,
            custom_args,
        })
    }

    pub fn application_name(&self) -> &str {
        &self.application_name
    }

    pub fn project_name(&self) -> Option<&str> {
        self.project_name.as_deref()
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// The architecture we are building for, deb-style.
    pub fn target_arch(&self) -> &str {
        &self.arch
    }

    /// The architecture we are building on, deb-style.
    pub fn host_arch(&self) -> &str {
        &self.host_arch
    }

    pub fn arch_triplet(&self) -> &str {
        &self.arch_triplet
    }

    pub fn is_cross_compiling(&self) -> bool {
        self.arch != self.host_arch
    }

    pub fn parallel_build_count(&self) -> usize {
        self.parallel_build_count
    }

    pub fn dirs(&self) -> &ProjectDirs {
        &self.dirs
    }

    pub(crate) fn dirs_arc(&self) -> Arc<ProjectDirs> {
        Arc::clone(&self.dirs)
    }

    pub fn partitions(&self) -> Option<&[String]> {
        self.dirs.partitions()
    }

    pub fn partition_keys(&self) -> Vec<Option<String>> {
        self.dirs.partition_keys()
    }

    pub fn default_partition(&self) -> Option<&str> {
        self.dirs.default_partition()
    }

    pub fn is_default_partition(&self, partition: Option<&str>) -> bool {
        self.dirs.is_default_partition(partition)
    }

    /// Whether the default partition has a name other than `default`.
    pub fn is_default_partition_aliased(&self) -> bool {
        matches!(self.default_partition(), Some(name) if name != DEFAULT_PARTITION)
    }

    /// The alias directory for a renamed default partition.
    pub fn alias_partition_dir(&self) -> Option<PathBuf> {
        if !self.is_default_partition_aliased() {
            return None;
        }
        self.default_partition()
            .map(|name| self.dirs.work_dir().join("partitions").join(name))
    }

    pub fn base_layer_dir(&self) -> Option<&Path> {
        self.base_layer_dir.as_deref()
    }

    pub fn filesystem_mounts(&self) -> &FilesystemMounts {
        &self.filesystem_mounts
    }

    /// The mount layout used to route default-partition overlay content.
    pub fn default_filesystem_mount(&self) -> FilesystemMount {
        if let Some(mount) = self.filesystem_mounts.get("default") {
            return mount.clone();
        }
        vec![FilesystemMountItem {
            mount: "/".to_string(),
            device: self
                .default_partition()
                .unwrap_or(DEFAULT_PARTITION)
                .to_string(),
        }]
    }

    pub fn project_vars(&self) -> &BTreeMap<String, String> {
        &self.project_vars
    }

    /// Look up an application-defined custom argument.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.custom_args.get(name)
    }

    /// The canonical project-wide options recorded in step states.
    pub fn project_options(&self) -> BTreeMap<String, Value> {
        let mut options = BTreeMap::new();
        options.insert(
            "application_name".to_string(),
            Value::String(self.application_name.clone()),
        );
        options.insert(
            "arch_triplet".to_string(),
            Value::String(self.arch_triplet.clone()),
        );
        options.insert("target_arch".to_string(), Value::String(self.arch.clone()));
        options.insert(
            "project_vars".to_string(),
            serde_yaml::to_value(&self.project_vars).unwrap_or(Value::Null),
        );
        options
    }
}

/// Information about one part, borrowing the project context.
#[derive(Debug, Clone, Copy)]
pub struct PartInfo<'a> {
    project: &'a ProjectInfo,
    part: &'a Part,
}

impl<'a> PartInfo<'a> {
    pub fn new(project: &'a ProjectInfo, part: &'a Part) -> Self {
        Self { project, part }
    }

    pub fn project(&self) -> &'a ProjectInfo {
        self.project
    }

    pub fn part(&self) -> &'a Part {
        self.part
    }

    pub fn part_name(&self) -> &str {
        self.part.name()
    }

    pub fn part_src_dir(&self) -> PathBuf {
        self.part.part_src_dir()
    }

    pub fn part_build_dir(&self) -> PathBuf {
        self.part.part_build_dir()
    }

    pub fn part_install_dir(&self) -> PathBuf {
        self.part.part_install_dir(None)
    }

    pub fn stage_dir(&self) -> PathBuf {
        self.project.dirs().stage_dir(None)
    }

    pub fn prime_dir(&self) -> PathBuf {
        self.project.dirs().prime_dir(None)
    }
}

/// Information about one step of one part.
#[derive(Debug, Clone, Copy)]
pub struct StepInfo<'a> {
    part_info: PartInfo<'a>,
    step: Step,
}

impl<'a> StepInfo<'a> {
    pub fn new(part_info: PartInfo<'a>, step: Step) -> Self {
        Self { part_info, step }
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn part_info(&self) -> PartInfo<'a> {
        self.part_info
    }

    pub fn part(&self) -> &'a Part {
        self.part_info.part()
    }

    pub fn project(&self) -> &'a ProjectInfo {
        self.part_info.project()
    }

    pub fn part_name(&self) -> &str {
        self.part_info.part_name()
    }

    pub fn project_options(&self) -> BTreeMap<String, Value> {
        self.project().project_options()
    }
}
