// src/error.rs

//! Crate-wide error type and result alias.
//!
//! A failed action never retries: errors bubble up through the scoped
//! mount guards (which unmount before re-raising) and abort the executor.
//! The step state file of a failed step is left unwritten, so the next
//! plan classifies the step as missing and emits RUN.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the lifecycle engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown target architecture value.
    #[error("invalid architecture: {0:?}")]
    InvalidArchitecture(String),

    /// Inconsistent feature configuration (partitions, overlay base layer).
    #[error("feature error: {0}")]
    Feature(String),

    /// A part name is not a valid identifier or references an unknown part.
    #[error("invalid part name: {0:?}")]
    InvalidPartName(String),

    /// The `after` relations of the parts form a cycle.
    #[error("dependency cycle involving part {0:?}")]
    PartDependencyCycle(String),

    /// A package could not be located by the repository collaborator.
    #[error("package not found: {0}")]
    PackageNotFound(String),

    /// A stage package declared by a part is not available.
    #[error("stage package not found in part {part_name:?}: {package_name}")]
    StagePackageNotFound {
        part_name: String,
        package_name: String,
    },

    /// An overlay package declared by a part is not available.
    #[error("overlay package not found in part {part_name:?}: {package_name}")]
    OverlayPackageNotFound {
        part_name: String,
        package_name: String,
    },

    /// Sequencer/executor mismatch, e.g. UPDATE requested on STAGE.
    /// This is a programming error and is never recovered.
    #[error("invalid action: {0}")]
    InvalidAction(String),

    /// A persistent path no longer matches its expected form, e.g. a
    /// partition alias that should be a symlink is a real directory.
    #[error("build environment changed: {0}")]
    EnvironmentChanged(String),

    /// No plugin registered under the requested name.
    #[error("plugin not registered: {0:?}")]
    PluginNotRegistered(String),

    /// Plugin-specific part properties failed to parse or validate.
    #[error("invalid plugin properties in part {part_name:?}: {message}")]
    PluginProperties { part_name: String, message: String },

    /// The composed build environment was rejected before BUILD.
    #[error("environment validation failed for part {part_name:?}: {reason}")]
    PluginEnvironmentValidation { part_name: String, reason: String },

    /// The overlay driver failed to mount the layer stack.
    #[error("cannot mount overlay on {mountpoint:?}: {message}")]
    OverlayMount {
        mountpoint: PathBuf,
        message: String,
    },

    /// The overlay driver failed to unmount the layer stack.
    #[error("cannot unmount overlay on {mountpoint:?}: {message}")]
    OverlayUnmount {
        mountpoint: PathBuf,
        message: String,
    },

    /// The chroot helper failed to prepare or enter the target root.
    #[error("chroot execution failed: {0}")]
    Chroot(String),

    /// A source handler operation failed.
    #[error("source error in part {part_name:?}: {message}")]
    Source { part_name: String, message: String },

    /// A build-time operation (plugin handler, file organization) failed.
    #[error("build error in part {part_name:?}: {message}")]
    Build { part_name: String, message: String },

    /// A step scriptlet exited with a non-zero status.
    #[error("{scriptlet_name} scriptlet of part {part_name:?} failed with exit code {exit_code}")]
    Scriptlet {
        part_name: String,
        scriptlet_name: String,
        exit_code: i32,
    },

    /// An `organize` entry would clobber an existing destination.
    #[error("cannot organize files in part {part_name:?}: {message}")]
    FileOrganize { part_name: String, message: String },

    /// Underlying filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Persisted state could not be serialized or deserialized.
    #[error("state serialization error: {0}")]
    State(#[from] serde_yaml::Error),
}
