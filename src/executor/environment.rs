// src/executor/environment.rs

//! Step execution environment.
//!
//! Scriptlets and plugin build commands run with a generated environment:
//! engine-provided variables first, then the plugin's build environment,
//! then the user's `build-environment` entries in declaration order, so
//! later entries can reference earlier ones.

use crate::error::{Error, Result};
use crate::infos::StepInfo;
use crate::parts::Part;
use crate::plugins::Plugin;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Generate the ordered environment for a step of a part.
pub fn generate_step_environment(
    part: &Part,
    plugin: &dyn Plugin,
    step_info: &StepInfo<'_>,
) -> Vec<(String, String)> {
    let project = step_info.project();
    let prefix = project
        .application_name()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect::<String>();

    let var = |name: &str| format!("{prefix}_{name}");
    let path = |p: std::path::PathBuf| p.to_string_lossy().into_owned();

    let mut env: Vec<(String, String)> = vec![
        (var("ARCH_TRIPLET"), project.arch_triplet().to_string()),
        (var("TARGET_ARCH"), project.target_arch().to_string()),
        (
            var("PARALLEL_BUILD_COUNT"),
            project.parallel_build_count().to_string(),
        ),
        (var("PART_NAME"), part.name().to_string()),
        (var("STEP_NAME"), step_info.step().name().to_string()),
        (var("PART_SRC"), path(part.part_src_dir())),
        (var("PART_BUILD"), path(part.part_build_dir())),
        (var("PART_INSTALL"), path(part.part_install_dir(None))),
        (var("OVERLAY"), path(project.dirs().overlay_mount_dir())),
        (var("STAGE"), path(project.dirs().stage_dir(None))),
        (var("PRIME"), path(project.dirs().prime_dir(None))),
    ];

    if let Some(name) = project.project_name() {
        env.push((var("PROJECT_NAME"), name.to_string()));
    }

    env.extend(plugin.get_build_environment());

    for entry in &part.spec().build_environment {
        for (name, value) in entry {
            env.push((name.clone(), value.clone()));
        }
    }

    env
}

/// Render the environment as a shell prelude.
///
/// Values are emitted in double quotes without escaping `$`, so entries
/// may reference previously exported variables.
pub fn environment_script(env: &[(String, String)]) -> String {
    let mut script = String::new();
    for (name, value) in env {
        script.push_str(&format!("export {name}=\"{value}\"\n"));
    }
    script
}

/// Validate the composed build environment before BUILD.
///
/// Every command the plugin requires must resolve through the effective
/// `PATH`.
pub fn validate_build_environment(
    part: &Part,
    plugin: &dyn Plugin,
    env: &[(String, String)],
) -> Result<()> {
    let path_value = env
        .iter()
        .rev()
        .find(|(name, _)| name == "PATH")
        .map(|(_, value)| value.clone())
        .or_else(|| std::env::var("PATH").ok())
        .unwrap_or_default();

    for command in plugin.required_commands() {
        let found = path_value
            .split(':')
            .filter(|dir| !dir.is_empty())
            .any(|dir| is_executable(&Path::new(dir).join(&command)));
        if !found {
            return Err(Error::PluginEnvironmentValidation {
                part_name: part.name().to_string(),
                reason: format!("{command:?} not found in the build environment"),
            });
        }
    }

    Ok(())
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
