// src/executor/migration.rs

//! File migration between lifecycle areas.
//!
//! Files and directories move from one step's area to the next during
//! lifecycle processing. Whenever possible files are hard-linked instead
//! of copied. Overlay whiteout markers are translated to their OCI form
//! on the way into shared areas, and shared-area cleaning consults every
//! part's state so a part never removes files another part still owns.

use crate::error::Result;
use crate::overlays;
use crate::permissions::{apply_permissions, filter_permissions, Permissions};
use crate::state::{MigrationState, StepState};
use crate::utils::file_utils;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Options for [`migrate_files`].
#[derive(Default)]
pub struct MigrateOptions<'a> {
    /// Ignore entries that don't exist in the source.
    pub missing_ok: bool,
    /// Migrate symlink targets instead of the links.
    pub follow_symlinks: bool,
    /// Convert overlayfs whiteouts and opaque dirs to OCI markers.
    pub oci_translation: bool,
    /// Permissions applied to migrated entries.
    pub permissions: &'a [Permissions],
    /// Run on each migrated file, e.g. to rewrite embedded paths.
    pub fixup: Option<&'a dyn Fn(&Path) -> Result<()>>,
}

/// Copy or link the given file and directory sets from `srcdir` into
/// `destdir`.
///
/// Returns the sets of destination-relative paths actually created.
pub fn migrate_files(
    files: &BTreeSet<String>,
    dirs: &BTreeSet<String>,
    srcdir: &Path,
    destdir: &Path,
    options: &MigrateOptions<'_>,
) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
    let mut migrated_files: BTreeSet<String> = BTreeSet::new();
    let mut migrated_dirs: BTreeSet<String> = BTreeSet::new();

    // ascending path order creates parents before children
    for dirname in dirs {
        let mut src = srcdir.join(dirname);
        let mut dst = destdir.join(dirname);

        // a whited out directory migrated from an OCI area keeps its
        // whiteout name
        if !src.exists() && overlays::oci_whiteout(&src).exists() {
            src = overlays::oci_whiteout(&src);
            dst = overlays::oci_whiteout(&dst);
        }

        file_utils::create_similar_directory(&src, &dst)?;
        apply_permissions(&dst, &filter_permissions(dirname, options.permissions))?;
        migrated_dirs.insert(dirname.clone());

        // an opaque source directory leaves an OCI opaque marker in the
        // destination, recorded as a migrated file so cleaning removes it
        if options.oci_translation && is_any_opaque_dir(&src) {
            let marker = overlays::oci_opaque_dir(Path::new(dirname));
            let marker_dst = destdir.join(&marker);
            debug!("create OCI opaque dir marker {:?}", marker_dst);
            fs::write(&marker_dst, b"")?;
            migrated_files.insert(marker.to_string_lossy().into_owned());
        }
    }

    for filename in files {
        let mut src = srcdir.join(filename);
        let mut dst = destdir.join(filename);

        if !src.exists() {
            if overlays::oci_whiteout(&src).exists() {
                src = overlays::oci_whiteout(&src);
                dst = overlays::oci_whiteout(&dst);
            } else if options.missing_ok && !src.is_symlink() {
                continue;
            }
        }

        // if the file is already here and it's a symlink, leave it alone
        if dst.is_symlink() {
            continue;
        }

        if dst.exists() {
            fs::remove_file(&dst)?;
        }

        if options.oci_translation && is_any_whiteout_file(&src) {
            // a source already in OCI form keeps its name
            let whiteout = if overlays::is_oci_whiteout_file(Path::new(filename)) {
                std::path::PathBuf::from(filename)
            } else {
                overlays::oci_whiteout(Path::new(filename))
            };
            let whiteout_dst = destdir.join(&whiteout);
            debug!("create OCI whiteout file {:?}", whiteout_dst);
            fs::write(&whiteout_dst, b"")?;
            migrated_files.insert(whiteout.to_string_lossy().into_owned());
        } else {
            file_utils::link_or_copy(&src, &dst, options.follow_symlinks)?;
            apply_permissions(&dst, &filter_permissions(filename, options.permissions))?;
            if let Some(fixup) = options.fixup {
                fixup(&dst)?;
            }
            migrated_files.insert(filename.clone());
        }
    }

    Ok((migrated_files, migrated_dirs))
}

fn is_any_whiteout_file(path: &Path) -> bool {
    overlays::is_whiteout_file(path) || overlays::is_oci_whiteout_file(path)
}

fn is_any_opaque_dir(path: &Path) -> bool {
    overlays::is_opaque_dir(path) || overlays::is_oci_opaque_dir(path)
}

/// Remove the files a part added to a shared directory.
///
/// Entries recorded in any other part's state for the same step, or in
/// the overlay migration state, are owned in common and left alone.
pub fn clean_shared_area(
    part_name: &str,
    shared_dir: &Path,
    part_states: &BTreeMap<String, StepState>,
    overlay_migration_state: Option<&MigrationState>,
    partition: Option<&str>,
) -> Result<()> {
    // no state for this part, we won't remove files
    let Some(state) = part_states.get(part_name) else {
        return Ok(());
    };

    let (mut files, mut directories) = match state.contents(partition) {
        Some((files, dirs)) => (files.clone(), dirs.clone()),
        None => (BTreeSet::new(), BTreeSet::new()),
    };

    for (other_name, other_state) in part_states {
        if other_name == part_name {
            continue;
        }
        if let Some((other_files, other_dirs)) = other_state.contents(partition) {
            files = &files - other_files;
            directories = &directories - other_dirs;
        }
    }

    if let Some(migration_state) = overlay_migration_state {
        let (overlay_files, overlay_dirs) = migration_state.contents();
        files = &files - overlay_files;
        directories = &directories - overlay_dirs;
    }

    clean_migrated_files(&files, &directories, shared_dir);
    Ok(())
}

/// Remove the backstage files a part contributed.
pub fn clean_backstage(
    part_name: &str,
    shared_dir: &Path,
    part_states: &BTreeMap<String, StepState>,
) -> Result<()> {
    let Some(StepState::Stage(state)) = part_states.get(part_name) else {
        return Ok(());
    };

    let mut files = state.backstage_files.clone();
    let mut directories = state.backstage_directories.clone();

    for (other_name, other_state) in part_states {
        if other_name == part_name {
            continue;
        }
        if let StepState::Stage(other) = other_state {
            files = &files - &other.backstage_files;
            directories = &directories - &other.backstage_directories;
        }
    }

    clean_migrated_files(&files, &directories, shared_dir);
    Ok(())
}

/// Remove migrated overlay files from a shared directory.
///
/// Called when the last part with overlay parameters leaves the step.
/// Entries also recorded by a part's own state remain.
pub fn clean_shared_overlay(
    shared_dir: &Path,
    part_states: &BTreeMap<String, StepState>,
    overlay_migration_state: Option<&MigrationState>,
    partition: Option<&str>,
) -> Result<()> {
    let Some(migration_state) = overlay_migration_state else {
        return Ok(());
    };

    let (overlay_files, overlay_dirs) = migration_state.contents();
    let mut files = overlay_files.clone();
    let mut directories = overlay_dirs.clone();

    for state in part_states.values() {
        if let Some((part_files, part_dirs)) = state.contents(partition) {
            files = &files - part_files;
            directories = &directories - part_dirs;
        }
    }

    clean_migrated_files(&files, &directories, shared_dir);
    Ok(())
}

fn clean_migrated_files(files: &BTreeSet<String>, dirs: &BTreeSet<String>, directory: &Path) {
    for file in files {
        let path = directory.join(file);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() == std::io::ErrorKind::NotFound {
                warn!(
                    "attempted to remove file {:?}, but it didn't exist, skipping",
                    file
                );
            }
        }
    }

    // subdirectories first so empty parents can be removed as well
    for dir in dirs.iter().rev() {
        let path = directory.join(dir);
        match fs::read_dir(&path) {
            Ok(mut entries) => {
                if entries.next().is_none() {
                    let _ = fs::remove_dir(&path);
                }
            }
            Err(_) => {
                warn!(
                    "attempted to remove directory {:?}, but it didn't exist, skipping",
                    dir
                );
            }
        }
    }
}

/// Remove dangling whiteouts from the migrated sets.
///
/// A whiteout with no backing file in the base layer hides nothing.
/// Returns the set of filtered-out whiteout names.
pub fn filter_dangling_whiteouts(
    files: &mut BTreeSet<String>,
    dirs: &BTreeSet<String>,
    base_dir: Option<&Path>,
) -> BTreeSet<String> {
    // whiteouts are meaningless if no base dir is specified
    let Some(base_dir) = base_dir else {
        return BTreeSet::new();
    };

    let mut whiteouts = BTreeSet::new();

    for file in files.clone() {
        if overlays::is_oci_whiteout_file(Path::new(&file)) {
            let backing_file = base_dir.join(overlays::oci_whited_out_file(Path::new(&file)));
            if !backing_file.exists() {
                debug!("filter whiteout file {:?}", file);
                files.remove(&file);
                whiteouts.insert(file);
            }
        }
    }

    for dir in dirs {
        let opaque_marker = overlays::oci_opaque_dir(Path::new(dir))
            .to_string_lossy()
            .into_owned();
        if files.contains(&opaque_marker) && !base_dir.join(dir).exists() {
            debug!("filter whiteout file {:?}", opaque_marker);
            files.remove(&opaque_marker);
            whiteouts.insert(opaque_marker);
        }
    }

    whiteouts
}

/// Remove every whiteout from the migrated file set.
///
/// Used for partitions that are not applied on top of a base layer.
pub fn filter_all_whiteouts(files: &mut BTreeSet<String>) -> BTreeSet<String> {
    let mut whiteouts = BTreeSet::new();

    for file in files.clone() {
        if overlays::is_oci_whiteout(Path::new(&file)) {
            debug!("filter whiteout file {:?}", file);
            files.remove(&file);
            whiteouts.insert(file);
        }
    }

    whiteouts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StageState;
    use tempfile::TempDir;

    fn sets(files: &[&str], dirs: &[&str]) -> (BTreeSet<String>, BTreeSet<String>) {
        (
            files.iter().map(|s| s.to_string()).collect(),
            dirs.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_migrate_files_links_and_creates_dirs() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        fs::create_dir_all(src.join("usr/bin")).unwrap();
        fs::write(src.join("usr/bin/tool"), b"x").unwrap();
        fs::create_dir_all(&dst).unwrap();

        let (files, dirs) = sets(&["usr/bin/tool"], &["usr", "usr/bin"]);
        let (migrated_files, migrated_dirs) =
            migrate_files(&files, &dirs, &src, &dst, &MigrateOptions::default()).unwrap();

        assert!(dst.join("usr/bin/tool").is_file());
        assert_eq!(migrated_files, files);
        assert_eq!(migrated_dirs, dirs);
    }

    #[test]
    fn test_migrate_files_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        fs::create_dir_all(src.join("d")).unwrap();
        fs::write(src.join("d/f"), b"x").unwrap();
        fs::create_dir_all(&dst).unwrap();

        let (files, dirs) = sets(&["d/f"], &["d"]);
        let first =
            migrate_files(&files, &dirs, &src, &dst, &MigrateOptions::default()).unwrap();
        let second =
            migrate_files(&files, &dirs, &src, &dst, &MigrateOptions::default()).unwrap();

        assert_eq!(first, second);
        assert!(dst.join("d/f").is_file());
    }

    #[test]
    fn test_migrate_files_leaves_existing_symlink() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(src.join("f"), b"new").unwrap();
        fs::write(dst.join("target"), b"old").unwrap();
        std::os::unix::fs::symlink("target", dst.join("f")).unwrap();

        let (files, dirs) = sets(&["f"], &[]);
        migrate_files(&files, &dirs, &src, &dst, &MigrateOptions::default()).unwrap();

        // the symlink was not replaced
        assert!(dst.join("f").symlink_metadata().unwrap().file_type().is_symlink());
    }

    #[test]
    fn test_migrate_oci_whiteout_translation() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        // an OCI whiteout in the source is re-created as a marker file
        fs::write(src.join(".wh.gone"), b"").unwrap();

        let (files, dirs) = sets(&[".wh.gone"], &[]);
        let options = MigrateOptions {
            oci_translation: true,
            ..MigrateOptions::default()
        };
        let (migrated_files, _) = migrate_files(&files, &dirs, &src, &dst, &options).unwrap();

        assert!(dst.join(".wh.gone").is_file());
        assert!(migrated_files.contains(".wh.gone"));
    }

    #[test]
    fn test_migrate_opaque_dir_marker() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        fs::create_dir_all(src.join("etc")).unwrap();
        fs::write(src.join("etc/.wh..wh..opq"), b"").unwrap();
        fs::create_dir_all(&dst).unwrap();

        let (files, dirs) = sets(&[], &["etc"]);
        let options = MigrateOptions {
            oci_translation: true,
            ..MigrateOptions::default()
        };
        let (migrated_files, migrated_dirs) =
            migrate_files(&files, &dirs, &src, &dst, &options).unwrap();

        assert!(dst.join("etc/.wh..wh..opq").is_file());
        assert!(migrated_files.contains("etc/.wh..wh..opq"));
        assert!(migrated_dirs.contains("etc"));
    }

    fn stage_state(files: &[&str], dirs: &[&str]) -> StepState {
        StepState::Stage(StageState {
            files: files.iter().map(|s| s.to_string()).collect(),
            directories: dirs.iter().map(|s| s.to_string()).collect(),
            ..StageState::default()
        })
    }

    #[test]
    fn test_clean_shared_area_preserves_common_files() {
        let tmp = TempDir::new().unwrap();
        let shared = tmp.path().join("stage");
        fs::create_dir_all(shared.join("bin")).unwrap();
        fs::write(shared.join("bin/shared"), b"x").unwrap();
        fs::write(shared.join("bin/own"), b"x").unwrap();

        let part_states = BTreeMap::from([
            ("a".to_string(), stage_state(&["bin/shared", "bin/own"], &["bin"])),
            ("b".to_string(), stage_state(&["bin/shared"], &["bin"])),
        ]);

        clean_shared_area("a", &shared, &part_states, None, None).unwrap();

        // the common file is still owned by part b
        assert!(shared.join("bin/shared").is_file());
        assert!(!shared.join("bin/own").exists());
        // the directory is still in use
        assert!(shared.join("bin").is_dir());
    }

    #[test]
    fn test_clean_shared_area_removes_empty_dirs_bottom_up() {
        let tmp = TempDir::new().unwrap();
        let shared = tmp.path().join("stage");
        fs::create_dir_all(shared.join("a/b")).unwrap();
        fs::write(shared.join("a/b/f"), b"x").unwrap();

        let part_states =
            BTreeMap::from([("solo".to_string(), stage_state(&["a/b/f"], &["a", "a/b"]))]);

        clean_shared_area("solo", &shared, &part_states, None, None).unwrap();

        assert!(!shared.join("a").exists());
    }

    #[test]
    fn test_clean_shared_area_without_state_is_noop() {
        let tmp = TempDir::new().unwrap();
        let shared = tmp.path().join("stage");
        fs::create_dir_all(&shared).unwrap();
        fs::write(shared.join("f"), b"x").unwrap();

        clean_shared_area("ghost", &shared, &BTreeMap::new(), None, None).unwrap();
        assert!(shared.join("f").is_file());
    }

    #[test]
    fn test_clean_shared_area_spares_overlay_content() {
        let tmp = TempDir::new().unwrap();
        let shared = tmp.path().join("stage");
        fs::create_dir_all(&shared).unwrap();
        fs::write(shared.join("from-overlay"), b"x").unwrap();

        let part_states =
            BTreeMap::from([("a".to_string(), stage_state(&["from-overlay"], &[]))]);
        let overlay_state = MigrationState {
            files: BTreeSet::from(["from-overlay".to_string()]),
            ..MigrationState::default()
        };

        clean_shared_area("a", &shared, &part_states, Some(&overlay_state), None).unwrap();
        assert!(shared.join("from-overlay").is_file());
    }

    #[test]
    fn test_filter_dangling_whiteouts() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("base");
        fs::create_dir_all(&base).unwrap();
        fs::write(base.join("kept"), b"x").unwrap();

        let mut files: BTreeSet<String> =
            [".wh.kept", ".wh.gone", "normal"].iter().map(|s| s.to_string()).collect();
        let dirs = BTreeSet::new();

        let filtered = filter_dangling_whiteouts(&mut files, &dirs, Some(&base));

        // .wh.kept hides an existing base file and stays
        assert!(files.contains(".wh.kept"));
        // .wh.gone hides nothing and is dropped
        assert!(!files.contains(".wh.gone"));
        assert_eq!(filtered, BTreeSet::from([".wh.gone".to_string()]));
        assert!(files.contains("normal"));
    }

    #[test]
    fn test_filter_dangling_whiteouts_without_base() {
        let mut files: BTreeSet<String> = [".wh.gone"].iter().map(|s| s.to_string()).collect();
        let dirs = BTreeSet::new();
        let filtered = filter_dangling_whiteouts(&mut files, &dirs, None);
        assert!(filtered.is_empty());
        assert!(files.contains(".wh.gone"));
    }

    #[test]
    fn test_filter_all_whiteouts() {
        let mut files: BTreeSet<String> = [".wh.a", "etc/.wh..wh..opq", "keep"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let filtered = filter_all_whiteouts(&mut files);
        assert_eq!(files, BTreeSet::from(["keep".to_string()]));
        assert_eq!(filtered.len(), 2);
    }
}
