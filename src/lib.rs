// src/lib.rs

//! Strata: a multi-part build lifecycle engine.
//!
//! A declarative set of *parts* is planned into an ordered sequence of
//! idempotent actions, executed through a fixed five-step pipeline
//! (PULL, OVERLAY, BUILD, STAGE, PRIME), and materialised into shared
//! `stage/` and `prime/` trees through a stack of per-part overlay
//! layers.
//!
//! # Architecture
//!
//! - State-first: every step persists a canonical record of its inputs
//!   and outputs; planning is a pure function of state and specification
//! - Deterministic invalidation: property fingerprints and a chained
//!   layer hash decide exactly which steps rerun when inputs change
//! - Shared-area ownership: stage and prime manifests track which part
//!   owns which files, so cleaning one part never touches another's
//! - Collaborator seams: plugins, source handlers, package repositories
//!   and the overlay driver are injected traits

pub mod actions;
mod error;
pub mod executor;
pub mod infos;
mod lifecycle;
pub mod overlays;
pub mod packages;
pub mod parts;
pub mod permissions;
pub mod plugins;
pub mod sequencer;
pub mod sources;
pub mod state;
pub mod steps;
pub mod utils;

pub use actions::{Action, ActionProperties, ActionType};
pub use error::{Error, Result};
pub use executor::{ActionExecutor, StepContents, Stream};
pub use infos::{
    FilesystemMount, FilesystemMountItem, FilesystemMounts, PartInfo, ProjectDirs, ProjectInfo,
    StepInfo, DEFAULT_PARTITION,
};
pub use lifecycle::{LifecycleManager, LifecycleOptions, PartsDefinition};
pub use overlays::{LayerHash, OverlayManager};
pub use packages::{NullRepository, PackageRepository};
pub use parts::{Part, PartSpec};
pub use permissions::Permissions;
pub use plugins::{Plugin, PluginRegistry};
pub use sequencer::Sequencer;
pub use sources::{
    LocalSource, OutdatedFiles, SourceDetails, SourceFactory, SourceHandler, SourceType,
};
pub use state::{MigrationContents, MigrationState, StepState};
pub use steps::Step;
