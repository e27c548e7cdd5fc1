// src/executor/organize.rs

//! File organization after BUILD.
//!
//! The `organize` map renames install-directory content: keys are globs
//! relative to the default install directory, values are destinations. A
//! destination with a trailing slash (or matching multiple sources) is a
//! directory; a `(partition)/path` destination routes the entry into that
//! partition's install directory.
//!
//! Organization runs in the build step so cleaning and re-running stage
//! keeps working, and so collision detection sees organized paths.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Apply the organize map to the part's install directories.
pub fn organize_files(
    part_name: &str,
    file_map: &BTreeMap<String, String>,
    install_dirs: &[(Option<String>, PathBuf)],
    overwrite: bool,
) -> Result<()> {
    let default_install = install_dirs
        .first()
        .map(|(_, dir)| dir.clone())
        .unwrap_or_default();

    for (key, destination) in file_map {
        let (dst_partition, dst_path) = parse_partition(destination);

        let dst_root = match dst_partition {
            None => default_install.clone(),
            Some(name) => install_dirs
                .iter()
                .find(|(p, _)| p.as_deref() == Some(name))
                .map(|(_, dir)| dir.clone())
                .ok_or_else(|| Error::FileOrganize {
                    part_name: part_name.to_string(),
                    message: format!("unknown partition in organize entry: {destination:?}"),
                })?,
        };

        let pattern = default_install.join(key);
        let mut sources: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| Error::FileOrganize {
                part_name: part_name.to_string(),
                message: format!("invalid organize glob {key:?}: {e}"),
            })?
            .flatten()
            .collect();
        sources.sort();

        let dst_is_dir = dst_path.ends_with('/') || sources.len() > 1;

        for src in sources {
            let target = if dst_is_dir {
                let file_name = src.file_name().ok_or_else(|| Error::FileOrganize {
                    part_name: part_name.to_string(),
                    message: format!("cannot organize {src:?}"),
                })?;
                dst_root.join(dst_path.trim_end_matches('/')).join(file_name)
            } else {
                dst_root.join(&dst_path)
            };

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }

            if fs::symlink_metadata(&target).is_ok() {
                if !overwrite {
                    return Err(Error::FileOrganize {
                        part_name: part_name.to_string(),
                        message: format!(
                            "trying to organize {key:?} to {destination:?}, but {target:?} \
                             already exists"
                        ),
                    });
                }
                remove_target(&target)?;
            }

            debug!("organize {:?} -> {:?}", src, target);
            fs::rename(&src, &target)?;
        }
    }

    Ok(())
}

fn remove_target(target: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(target)?;
    if meta.file_type().is_dir() {
        fs::remove_dir_all(target)?;
    } else {
        fs::remove_file(target)?;
    }
    Ok(())
}

/// Split a `(partition)/path` destination into its parts.
fn parse_partition(destination: &str) -> (Option<&str>, String) {
    if let Some(rest) = destination.strip_prefix('(') {
        if let Some((partition, path)) = rest.split_once(')') {
            return (Some(partition), path.trim_start_matches('/').to_string());
        }
    }
    (None, destination.to_string())
}
