// src/sources/local.rs

//! The local directory source handler.

use crate::error::{Error, Result};
use crate::sources::{OutdatedFiles, SourceDetails, SourceHandler};
use crate::utils::file_utils::{self, CopyMode};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;
use walkdir::WalkDir;

/// Pulls a local directory tree into the part source directory.
pub struct LocalSource {
    part_name: String,
    source: PathBuf,
    part_src_dir: PathBuf,
    ignore_patterns: Vec<String>,
}

impl LocalSource {
    pub fn new(
        part_name: impl Into<String>,
        source: impl Into<PathBuf>,
        part_src_dir: impl Into<PathBuf>,
        ignore_patterns: Vec<String>,
    ) -> Self {
        Self {
            part_name: part_name.into(),
            source: source.into(),
            part_src_dir: part_src_dir.into(),
            ignore_patterns,
        }
    }

    fn check_source_dir(&self) -> Result<()> {
        if self.source.is_dir() {
            Ok(())
        } else {
            Err(Error::Source {
                part_name: self.part_name.clone(),
                message: format!("source directory {:?} does not exist", self.source),
            })
        }
    }
}

impl SourceHandler for LocalSource {
    fn pull(&self) -> Result<()> {
        self.check_source_dir()?;
        debug!(
            "pull local source {:?} -> {:?}",
            self.source, self.part_src_dir
        );
        file_utils::copy_tree(
            &self.source,
            &self.part_src_dir,
            CopyMode::Link,
            &self.ignore_patterns,
        )
    }

    fn update(&self) -> Result<()> {
        // the tree is hard-linked, a fresh copy is an incremental update
        self.pull()
    }

    fn check_if_outdated(&self, state_file: &Path) -> Result<Option<OutdatedFiles>> {
        self.check_source_dir()?;

        let reference = match fs::metadata(state_file) {
            Ok(meta) => meta.modified()?,
            // no state yet, nothing can be outdated relative to it
            Err(_) => return Ok(None),
        };

        let mut outdated = OutdatedFiles::default();
        for entry in WalkDir::new(&self.source).min_depth(1) {
            let entry = entry.map_err(std::io::Error::from)?;
            let modified = entry
                .metadata()
                .map_err(std::io::Error::from)?
                .modified()
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if modified <= reference {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.source)
                .expect("walked entry is under the walk root")
                .to_string_lossy()
                .into_owned();
            if entry.file_type().is_dir() {
                outdated.dirs.push(rel);
            } else {
                outdated.files.push(rel);
            }
        }

        outdated.files.sort();
        outdated.dirs.sort();

        if outdated.is_empty() {
            Ok(None)
        } else {
            Ok(Some(outdated))
        }
    }

    fn source_details(&self) -> Option<SourceDetails> {
        Some(SourceDetails {
            source: Some(self.source.to_string_lossy().into_owned()),
            source_type: Some("local".to_string()),
            ..SourceDetails::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn source_fixture() -> (TempDir, LocalSource) {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("tree");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("file"), b"one").unwrap();
        fs::write(src.join("sub/other"), b"two").unwrap();
        let handler = LocalSource::new(
            "p1",
            src,
            tmp.path().join("parts/p1/src"),
            vec![],
        );
        (tmp, handler)
    }

    #[test]
    fn test_pull_copies_tree() {
        let (tmp, handler) = source_fixture();
        handler.pull().unwrap();
        assert_eq!(
            fs::read(tmp.path().join("parts/p1/src/file")).unwrap(),
            b"one"
        );
        assert_eq!(
            fs::read(tmp.path().join("parts/p1/src/sub/other")).unwrap(),
            b"two"
        );
    }

    #[test]
    fn test_pull_missing_source_fails() {
        let tmp = TempDir::new().unwrap();
        let handler = LocalSource::new(
            "p1",
            tmp.path().join("missing"),
            tmp.path().join("src"),
            vec![],
        );
        assert!(matches!(
            handler.pull(),
            Err(Error::Source { part_name, .. }) if part_name == "p1"
        ));
    }

    #[test]
    fn test_check_if_outdated_reports_newer_files() {
        let (tmp, handler) = source_fixture();
        handler.pull().unwrap();

        let state_file = tmp.path().join("state-pull");
        fs::write(&state_file, b"state").unwrap();

        // nothing newer than the state file yet
        assert!(handler.check_if_outdated(&state_file).unwrap().is_none());

        // backdate the state file instead of waiting for the clock
        let past = filetime_from_secs(&state_file, 1_000_000);
        assert!(past.is_ok());

        let outdated = handler.check_if_outdated(&state_file).unwrap().unwrap();
        assert!(outdated.files.contains(&"file".to_string()));
    }

    fn filetime_from_secs(path: &Path, secs: i64) -> std::io::Result<()> {
        let times = [libc::timespec {
            tv_sec: secs,
            tv_nsec: 0,
        }; 2];
        let c_path = std::ffi::CString::new(path.to_string_lossy().as_bytes()).unwrap();
        let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}
