// src/executor/filesets.rs

//! Filesets: glob keep-lists applied to a directory tree.
//!
//! Fileset entries are include globs; a leading `-` marks an exclusion.
//! An empty fileset keeps everything.

use crate::error::Result;
use std::collections::BTreeSet;
use std::path::Path;
use walkdir::WalkDir;

/// A named list of fileset entries.
#[derive(Debug, Clone)]
pub struct Fileset {
    name: String,
    entries: Vec<String>,
}

impl Fileset {
    pub fn new(name: impl Into<String>, entries: Option<Vec<String>>) -> Self {
        Self {
            name: name.into(),
            entries: entries.unwrap_or_else(|| vec!["*".to_string()]),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Include globs; defaults to everything when only exclusions are given.
    pub fn includes(&self) -> Vec<&str> {
        let includes: Vec<&str> = self
            .entries
            .iter()
            .filter(|e| !e.starts_with('-'))
            .map(String::as_str)
            .collect();
        if includes.is_empty() {
            vec!["*"]
        } else {
            includes
        }
    }

    /// Exclusion globs, with the `-` prefix stripped.
    pub fn excludes(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter_map(|e| e.strip_prefix('-'))
            .collect()
    }
}

/// Resolve a fileset against a source directory into migratable file and
/// directory sets (paths relative to `srcdir`).
pub fn migratable_filesets(
    fileset: &Fileset,
    srcdir: &Path,
) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
    let (include_files, include_dirs) = resolve_globs(&fileset.includes(), srcdir)?;
    let (exclude_files, exclude_dirs) = resolve_globs(&fileset.excludes(), srcdir)?;

    let under_excluded_dir = |path: &str| {
        exclude_dirs
            .iter()
            .any(|dir| path.starts_with(&format!("{dir}/")))
    };

    let mut files: BTreeSet<String> = include_files
        .into_iter()
        .filter(|f| !exclude_files.contains(f) && !under_excluded_dir(f))
        .collect();

    let mut dirs: BTreeSet<String> = include_dirs
        .into_iter()
        .filter(|d| !exclude_dirs.contains(d) && !under_excluded_dir(d))
        .collect();

    // parent directories of every kept file must exist at the destination
    for file in &files {
        let mut path = Path::new(file);
        while let Some(parent) = path.parent() {
            if parent.as_os_str().is_empty() {
                break;
            }
            dirs.insert(parent.to_string_lossy().into_owned());
            path = parent;
        }
    }

    files = files
        .into_iter()
        .filter(|f| !dirs.contains(f))
        .collect();

    Ok((files, dirs))
}

/// Expand glob patterns under `srcdir`, descending into matched
/// directories.
fn resolve_globs(
    patterns: &[&str],
    srcdir: &Path,
) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
    let mut files = BTreeSet::new();
    let mut dirs = BTreeSet::new();

    if !srcdir.is_dir() {
        return Ok((files, dirs));
    }

    for pattern in patterns {
        let full_pattern = srcdir.join(pattern);
        let matches = glob::glob(&full_pattern.to_string_lossy())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        for path in matches.flatten() {
            let rel = match path.strip_prefix(srcdir) {
                Ok(rel) => rel.to_string_lossy().into_owned(),
                Err(_) => continue,
            };
            let meta = match std::fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(_) => continue,
            };

            if meta.file_type().is_dir() {
                dirs.insert(rel.clone());
                for entry in WalkDir::new(&path).min_depth(1) {
                    let entry = entry.map_err(std::io::Error::from)?;
                    let entry_rel = entry
                        .path()
                        .strip_prefix(srcdir)
                        .expect("walked entry is under the walk root")
                        .to_string_lossy()
                        .into_owned();
                    if entry.file_type().is_dir() {
                        dirs.insert(entry_rel);
                    } else {
                        files.insert(entry_rel);
                    }
                }
            } else {
                files.insert(rel);
            }
        }
    }

    Ok((files, dirs))
}
