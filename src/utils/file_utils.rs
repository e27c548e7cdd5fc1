// src/utils/file_utils.rs

//! File migration helpers.
//!
//! Files moved between lifecycle areas are hard-linked whenever possible
//! and copied otherwise (cross-device links, permission restrictions).
//! Directory entries are recreated with the permissions of the source.

use crate::error::Result;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// How file content is transferred by [`copy_tree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Hard-link when possible, copy otherwise.
    Link,
    /// Always copy file content.
    Copy,
}

/// Create a hard link from `src` at `dst`, falling back to a copy.
///
/// If `src` is a symlink and `follow_symlinks` is false, the link itself
/// is recreated at the destination.
pub fn link_or_copy(src: &Path, dst: &Path, follow_symlinks: bool) -> Result<()> {
    let meta = fs::symlink_metadata(src)?;

    if meta.file_type().is_symlink() && !follow_symlinks {
        let target = fs::read_link(src)?;
        if fs::symlink_metadata(dst).is_ok() {
            fs::remove_file(dst)?;
        }
        std::os::unix::fs::symlink(&target, dst)?;
        return Ok(());
    }

    if fs::symlink_metadata(dst).is_ok() {
        fs::remove_file(dst)?;
    }

    if fs::hard_link(src, dst).is_err() {
        debug!("hardlink failed for {:?}, falling back to copy", src);
        copy_file(src, dst)?;
    }

    Ok(())
}

/// Copy a file preserving its permission bits.
pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst)?;
    let mode = fs::metadata(src)?.permissions().mode();
    fs::set_permissions(dst, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Create `dst` as a directory with the same permission bits as `src`.
///
/// Existing directories are left in place (their permissions are not
/// modified, another part may own them).
pub fn create_similar_directory(src: &Path, dst: &Path) -> Result<()> {
    if dst.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dst)?;
    let mode = fs::symlink_metadata(src)?.permissions().mode();
    fs::set_permissions(dst, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Recursively copy `src` into `dst`, preserving symlinks.
///
/// Entries whose name matches one of `ignore_patterns` are skipped at any
/// depth.
pub fn copy_tree(src: &Path, dst: &Path, mode: CopyMode, ignore_patterns: &[String]) -> Result<()> {
    let ignored = |name: &str| {
        ignore_patterns
            .iter()
            .any(|p| glob::Pattern::new(p).map(|g| g.matches(name)).unwrap_or(false))
    };

    fs::create_dir_all(dst)?;

    let walker = WalkDir::new(src).min_depth(1).into_iter().filter_entry(|e| {
        !e.file_name().to_str().map(ignored).unwrap_or(false)
    });

    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walked entry is under the walk root");
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            create_similar_directory(entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link_target = fs::read_link(entry.path())?;
            if fs::symlink_metadata(&target).is_ok() {
                fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(&link_target, &target)?;
        } else {
            match mode {
                CopyMode::Link => link_or_copy(entry.path(), &target, false)?,
                CopyMode::Copy => {
                    if fs::symlink_metadata(&target).is_ok() {
                        fs::remove_file(&target)?;
                    }
                    copy_file(entry.path(), &target)?;
                }
            }
        }
    }

    Ok(())
}

/// Remove a directory entry of any kind, tolerating absence.
pub fn remove(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            if meta.file_type().is_dir() {
                debug!("remove directory {:?}", path);
                fs::remove_dir_all(path)?;
            } else {
                debug!("remove file {:?}", path);
                fs::remove_file(path)?;
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
