// src/sources/mod.rs

//! Source handlers.
//!
//! A source handler fetches a part's source tree during PULL and can
//! update it incrementally when the upstream changes. Only the local
//! directory handler is built in; handlers for remote source types are
//! provided by the embedding application through the source factory.

mod local;

pub use local::LocalSource;

use crate::error::{Error, Result};
use crate::infos::ProjectInfo;
use crate::parts::Part;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The kind of source reference declared by a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Local,
    Git,
    Tar,
    Zip,
    Unknown,
}

impl SourceType {
    pub fn name(self) -> &'static str {
        match self {
            SourceType::Local => "local",
            SourceType::Git => "git",
            SourceType::Tar => "tar",
            SourceType::Zip => "zip",
            SourceType::Unknown => "unknown",
        }
    }
}

/// Detect the source type from a source reference.
pub fn detect_source_type(source: &str) -> SourceType {
    if source.ends_with(".git") || source.starts_with("git:") || source.starts_with("git@") {
        return SourceType::Git;
    }
    if source.ends_with(".tar")
        || source.ends_with(".tar.gz")
        || source.ends_with(".tar.xz")
        || source.ends_with(".tar.bz2")
        || source.ends_with(".tgz")
    {
        return SourceType::Tar;
    }
    if source.ends_with(".zip") {
        return SourceType::Zip;
    }
    if source.starts_with("http:") || source.starts_with("https:") {
        return SourceType::Unknown;
    }
    SourceType::Local
}

/// Details of the source a PULL fetched, recorded in the pull state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_checksum: Option<String>,
}

/// Files and directories reported changed by an outdated check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutdatedFiles {
    pub files: Vec<String>,
    pub dirs: Vec<String>,
}

impl OutdatedFiles {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty()
    }
}

/// A part source handler.
pub trait SourceHandler {
    /// Fetch the source into the part's source directory.
    fn pull(&self) -> Result<()>;

    /// Incrementally update a previously pulled source.
    fn update(&self) -> Result<()>;

    /// Report upstream changes newer than the given state file.
    fn check_if_outdated(&self, state_file: &Path) -> Result<Option<OutdatedFiles>>;

    /// Snaps required to pull this source type.
    fn get_pull_snaps(&self) -> Vec<String> {
        Vec::new()
    }

    /// Details of the fetched source.
    fn source_details(&self) -> Option<SourceDetails> {
        None
    }
}

/// Builds the source handler for a part, or none if the part has no
/// source.
pub type SourceFactory =
    Box<dyn Fn(&Part, &ProjectInfo, &[String]) -> Result<Option<Box<dyn SourceHandler>>>>;

/// The built-in source factory: local directories only.
pub fn default_source_factory() -> SourceFactory {
    Box::new(default_source_handler)
}

fn default_source_handler(
    part: &Part,
    _project: &ProjectInfo,
    ignore_patterns: &[String],
) -> Result<Option<Box<dyn SourceHandler>>> {
    let Some(source) = part.spec().source.clone() else {
        return Ok(None);
    };

    let source_type = match part.spec().source_type.as_deref() {
        Some("local") => SourceType::Local,
        Some(other) => {
            return Err(Error::Source {
                part_name: part.name().to_string(),
                message: format!("no handler for source type {other:?}"),
            });
        }
        None => detect_source_type(&source),
    };

    match source_type {
        SourceType::Local => Ok(Some(Box::new(LocalSource::new(
            part.name(),
            source,
            part.part_src_dir(),
            ignore_patterns.to_vec(),
        )))),
        other => Err(Error::Source {
            part_name: part.name().to_string(),
            message: format!("no handler for source type {:?}", other.name()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_source_type() {
        assert_eq!(detect_source_type("."), SourceType::Local);
        assert_eq!(detect_source_type("src/tree"), SourceType::Local);
        assert_eq!(
            detect_source_type("https://example.com/x.git"),
            SourceType::Git
        );
        assert_eq!(detect_source_type("git@host:repo"), SourceType::Git);
        assert_eq!(
            detect_source_type("https://example.com/x.tar.gz"),
            SourceType::Tar
        );
        assert_eq!(detect_source_type("vendor.zip"), SourceType::Zip);
        assert_eq!(
            detect_source_type("https://example.com/blob"),
            SourceType::Unknown
        );
    }
}
