// src/executor/step_handler.rs

//! Built-in and user-specified step command execution.
//!
//! Each step either runs its override scriptlet or the built-in handler.
//! Scriptlets are rendered to a shell script under the part's run
//! directory and executed with bash; the generated step environment is
//! exported at the top of the script.

use crate::error::{Error, Result};
use crate::executor::environment::environment_script;
use crate::executor::filesets::{migratable_filesets, Fileset};
use crate::executor::migration::{migrate_files, MigrateOptions};
use crate::infos::StepInfo;
use crate::parts::Part;
use crate::plugins::Plugin;
use crate::sources::SourceHandler;
use crate::state;
use crate::steps::Step;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Output redirection for scriptlets and build commands.
pub type Stream<'a> = Option<&'a fs::File>;

/// Contents one step produced in one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepPartitionContents {
    pub files: BTreeSet<String>,
    pub dirs: BTreeSet<String>,
    pub backstage_files: BTreeSet<String>,
    pub backstage_dirs: BTreeSet<String>,
}

/// Contents one step produced, per partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepContents {
    pub partitions: BTreeMap<Option<String>, StepPartitionContents>,
}

impl StepContents {
    /// The contents entry for a partition, creating it if absent.
    pub fn entry(&mut self, partition: Option<String>) -> &mut StepPartitionContents {
        self.partitions.entry(partition).or_default()
    }

    /// The contents recorded for a partition.
    pub fn get(&self, partition: Option<&str>) -> Option<&StepPartitionContents> {
        self.partitions.get(&partition.map(str::to_string))
    }
}

/// Runs one step of one part.
pub struct StepHandler<'a> {
    part: &'a Part,
    step_info: StepInfo<'a>,
    plugin: &'a dyn Plugin,
    source_handler: Option<&'a dyn SourceHandler>,
    env: &'a [(String, String)],
    stdout: Stream<'a>,
    stderr: Stream<'a>,
}

impl<'a> StepHandler<'a> {
    pub fn new(
        part: &'a Part,
        step_info: StepInfo<'a>,
        plugin: &'a dyn Plugin,
        source_handler: Option<&'a dyn SourceHandler>,
        env: &'a [(String, String)],
        stdout: Stream<'a>,
        stderr: Stream<'a>,
    ) -> Self {
        Self {
            part,
            step_info,
            plugin,
            source_handler,
            env,
            stdout,
            stderr,
        }
    }

    /// Run the built-in handler for the step.
    pub fn run_builtin(&self) -> Result<StepContents> {
        match self.step_info.step() {
            Step::Pull => self.builtin_pull(),
            Step::Overlay => Ok(StepContents::default()),
            Step::Build => self.builtin_build(),
            Step::Stage => self.builtin_stage(),
            Step::Prime => self.builtin_prime(),
        }
    }

    fn builtin_pull(&self) -> Result<StepContents> {
        if let Some(handler) = self.source_handler {
            handler.pull()?;
        }
        Ok(StepContents::default())
    }

    fn builtin_build(&self) -> Result<StepContents> {
        let commands = self.plugin.get_build_commands();
        if commands.is_empty() {
            return Ok(StepContents::default());
        }

        self.run_commands(&commands, "build", &self.part.part_build_dir())?;
        Ok(StepContents::default())
    }

    fn builtin_stage(&self) -> Result<StepContents> {
        let mut contents = StepContents::default();
        let fileset = Fileset::new("stage", self.part.spec().stage.clone());

        for partition in self.part.dirs().partition_keys() {
            let install_dir = self.part.part_install_dir(partition.as_deref());
            let stage_dir = self.part.stage_dir(partition.as_deref());
            fs::create_dir_all(&stage_dir)?;

            let (files, dirs) = migratable_filesets(&fileset, &install_dir)?;
            let (migrated_files, migrated_dirs) = migrate_files(
                &files,
                &dirs,
                &install_dir,
                &stage_dir,
                &MigrateOptions::default(),
            )?;

            let entry = contents.entry(partition);
            entry.files = migrated_files;
            entry.dirs = migrated_dirs;
        }

        // the export area feeds the backstage, never the prime tree
        let export_dir = self.part.part_export_dir();
        if export_dir.is_dir() {
            let backstage_dir = self.part.backstage_dir();
            fs::create_dir_all(&backstage_dir)?;
            let fileset = Fileset::new("export", None);
            let (files, dirs) = migratable_filesets(&fileset, &export_dir)?;
            let (migrated_files, migrated_dirs) = migrate_files(
                &files,
                &dirs,
                &export_dir,
                &backstage_dir,
                &MigrateOptions::default(),
            )?;

            let entry = contents.entry(default_partition_key(self.part));
            entry.backstage_files = migrated_files;
            entry.backstage_dirs = migrated_dirs;
        }

        Ok(contents)
    }

    fn builtin_prime(&self) -> Result<StepContents> {
        let mut contents = StepContents::default();
        let fileset = Fileset::new("prime", self.part.spec().prime.clone());

        let stage_state = state::load_step_state(self.part, Step::Stage)?;

        for partition in self.part.dirs().partition_keys() {
            let stage_dir = self.part.stage_dir(partition.as_deref());
            let prime_dir = self.part.prime_dir(partition.as_deref());
            fs::create_dir_all(&prime_dir)?;

            let (mut files, mut dirs) = migratable_filesets(&fileset, &stage_dir)?;

            // only prime what this part staged
            if let Some(stage_state) = &stage_state {
                if let Some((staged_files, staged_dirs)) =
                    stage_state.contents(partition.as_deref())
                {
                    files = &files & staged_files;
                    dirs = dirs
                        .into_iter()
                        .filter(|d| {
                            staged_dirs.contains(d)
                                || files.iter().any(|f| f.starts_with(&format!("{d}/")))
                        })
                        .collect();
                }
            }

            let (migrated_files, migrated_dirs) = migrate_files(
                &files,
                &dirs,
                &stage_dir,
                &prime_dir,
                &MigrateOptions {
                    permissions: &self.part.spec().permissions,
                    ..MigrateOptions::default()
                },
            )?;

            let entry = contents.entry(partition);
            entry.files = migrated_files;
            entry.dirs = migrated_dirs;
        }

        Ok(contents)
    }

    /// Run a step scriptlet in the given working directory.
    pub fn run_scriptlet(
        &self,
        scriptlet: &str,
        scriptlet_name: &str,
        work_dir: &Path,
    ) -> Result<()> {
        info!(
            "running {} scriptlet for part {:?}",
            scriptlet_name,
            self.part.name()
        );
        self.run_commands(&[scriptlet.to_string()], scriptlet_name, work_dir)
    }

    fn run_commands(&self, commands: &[String], name: &str, work_dir: &Path) -> Result<()> {
        let run_dir = self.part.part_run_dir();
        fs::create_dir_all(&run_dir)?;
        fs::create_dir_all(work_dir)?;

        let mut script = String::from("#!/bin/bash\nset -euo pipefail\n");
        script.push_str(&environment_script(self.env));
        for command in commands {
            script.push_str(command);
            script.push('\n');
        }

        let script_path = run_dir.join(format!("{}.sh", self.step_info.step().name()));
        fs::write(&script_path, script)?;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;

        debug!("executing {:?} in {:?}", script_path, work_dir);

        let mut command = Command::new("/bin/bash");
        command
            .arg(&script_path)
            .current_dir(work_dir)
            .stdin(Stdio::null());
        if let Some(stdout) = self.stdout {
            command.stdout(stdout.try_clone()?);
        }
        if let Some(stderr) = self.stderr {
            command.stderr(stderr.try_clone()?);
        }

        let status = command.status()?;
        if !status.success() {
            return Err(Error::Scriptlet {
                part_name: self.part.name().to_string(),
                scriptlet_name: name.to_string(),
                exit_code: status.code().unwrap_or(-1),
            });
        }

        Ok(())
    }
}

/// The partition key the default partition is recorded under.
pub fn default_partition_key(part: &Part) -> Option<String> {
    part.dirs().default_partition().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infos::{FilesystemMounts, PartInfo, ProjectDirs, ProjectInfo};
    use crate::parts::PartSpec;
    use crate::plugins::NilPlugin;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn fixture(tmp: &TempDir, spec: PartSpec) -> (ProjectInfo, Part) {
        let dirs = Arc::new(ProjectDirs::new(tmp.path(), None));
        let project = ProjectInfo::new(
            "test".to_string(),
            None,
            tmp.path().join("cache"),
            Some("amd64".to_string()),
            1,
            dirs,
            FilesystemMounts::new(),
            None,
            BTreeMap::new(),
            BTreeMap::new(),
        )
        .unwrap();
        let part = Part::new("p1", spec, project.dirs_arc()).unwrap();
        (project, part)
    }

    #[test]
    fn test_scriptlet_runs_in_work_dir() {
        let tmp = TempDir::new().unwrap();
        let (project, part) = fixture(&tmp, PartSpec::default());
        let part_info = PartInfo::new(&project, &part);
        let step_info = StepInfo::new(part_info, Step::Pull);
        let env = vec![];
        let handler = StepHandler::new(&part, step_info, &NilPlugin, None, &env, None, None);

        let work_dir = part.part_src_dir();
        handler
            .run_scriptlet("touch pulled-here", "override-pull", &work_dir)
            .unwrap();

        assert!(work_dir.join("pulled-here").is_file());
    }

    #[test]
    fn test_scriptlet_failure_reports_exit_code() {
        let tmp = TempDir::new().unwrap();
        let (project, part) = fixture(&tmp, PartSpec::default());
        let part_info = PartInfo::new(&project, &part);
        let step_info = StepInfo::new(part_info, Step::Build);
        let env = vec![];
        let handler = StepHandler::new(&part, step_info, &NilPlugin, None, &env, None, None);

        let err = handler
            .run_scriptlet("exit 7", "override-build", &part.part_build_dir())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Scriptlet {
                exit_code: 7,
                ..
            }
        ));
    }

    #[test]
    fn test_scriptlet_sees_step_environment() {
        let tmp = TempDir::new().unwrap();
        let (project, part) = fixture(&tmp, PartSpec::default());
        let part_info = PartInfo::new(&project, &part);
        let step_info = StepInfo::new(part_info, Step::Pull);
        let env = vec![("TEST_PART_NAME".to_string(), "p1".to_string())];
        let handler = StepHandler::new(&part, step_info, &NilPlugin, None, &env, None, None);

        handler
            .run_scriptlet(
                "echo \"$TEST_PART_NAME\" > name",
                "override-pull",
                &part.part_src_dir(),
            )
            .unwrap();

        let content = fs::read_to_string(part.part_src_dir().join("name")).unwrap();
        assert_eq!(content.trim(), "p1");
    }

    #[test]
    fn test_builtin_stage_migrates_fileset() {
        let tmp = TempDir::new().unwrap();
        let spec = PartSpec {
            stage: Some(vec!["usr/*".to_string()]),
            ..PartSpec::default()
        };
        let (project, part) = fixture(&tmp, spec);

        let install = part.part_install_dir(None);
        fs::create_dir_all(install.join("usr/bin")).unwrap();
        fs::write(install.join("usr/bin/tool"), b"x").unwrap();
        fs::write(install.join("stray"), b"x").unwrap();

        let part_info = PartInfo::new(&project, &part);
        let step_info = StepInfo::new(part_info, Step::Stage);
        let env = vec![];
        let handler = StepHandler::new(&part, step_info, &NilPlugin, None, &env, None, None);

        let contents = handler.run_builtin().unwrap();
        let entry = contents.get(None).unwrap();

        assert!(entry.files.contains("usr/bin/tool"));
        assert!(!entry.files.contains("stray"));
        assert!(part.stage_dir(None).join("usr/bin/tool").is_file());
        assert!(!part.stage_dir(None).join("stray").exists());
    }
}
