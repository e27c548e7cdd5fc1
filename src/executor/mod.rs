// src/executor/mod.rs

//! Action execution.
//!
//! The executor instantiates an overlay manager and a part handler per
//! part, then runs planned actions strictly in sequence. An error from
//! any action aborts execution immediately; scoped mounts are released
//! on every exit path.

pub mod environment;
pub mod filesets;
pub mod migration;
pub mod organize;
pub mod part_handler;
pub mod step_handler;

pub use part_handler::PartHandler;
pub use step_handler::{StepContents, StepPartitionContents, Stream};

use crate::actions::{Action, ActionType};
use crate::error::{Error, Result};
use crate::infos::ProjectInfo;
use crate::overlays::{LayerHash, OverlayManager};
use crate::packages::PackageRepository;
use crate::parts::Part;
use crate::plugins::PluginRegistry;
use crate::sources::SourceFactory;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Executes lifecycle actions against the on-disk work tree.
pub struct Executor {
    project: Arc<ProjectInfo>,
    overlay_manager: Rc<RefCell<OverlayManager>>,
    handlers: BTreeMap<String, PartHandler>,
    packages: Arc<dyn PackageRepository>,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        project: Arc<ProjectInfo>,
        part_list: &[Part],
        plugins: &PluginRegistry,
        packages: Arc<dyn PackageRepository>,
        source_factory: &SourceFactory,
        base_layer_hash: Option<LayerHash>,
        track_stage_packages: bool,
        ignore_patterns: &[String],
    ) -> Result<Self> {
        let overlay_manager = Rc::new(RefCell::new(OverlayManager::new(
            Arc::clone(&project),
            part_list,
            Arc::clone(&packages),
        )));

        let mut handlers = BTreeMap::new();
        for part in part_list {
            let source_handler = source_factory(part, &project, ignore_patterns)?;
            let handler = PartHandler::new(
                part.clone(),
                Arc::clone(&project),
                part_list.to_vec(),
                plugins,
                Arc::clone(&packages),
                Rc::clone(&overlay_manager),
                source_handler,
                base_layer_hash.clone(),
                track_stage_packages,
            )?;
            handlers.insert(part.name().to_string(), handler);
        }

        Ok(Self {
            project,
            overlay_manager,
            handlers,
            packages,
        })
    }

    /// Prepare the work tree and the build host.
    pub(crate) fn prologue(&mut self) -> Result<()> {
        fs::create_dir_all(self.project.dirs().parts_dir())?;
        for partition in self.project.partition_keys() {
            fs::create_dir_all(self.project.dirs().stage_dir(partition.as_deref()))?;
            fs::create_dir_all(self.project.dirs().prime_dir(partition.as_deref()))?;
        }

        let mut build_packages: Vec<String> = self
            .handlers
            .values()
            .flat_map(|h| h.build_packages())
            .collect();
        build_packages.sort();
        build_packages.dedup();

        if !build_packages.is_empty() {
            info!("installing build packages: {:?}", build_packages);
            self.packages.install_build_packages(&build_packages)?;
        }

        Ok(())
    }

    /// Release any mount still held.
    pub(crate) fn epilogue(&mut self) {
        let mut manager = self.overlay_manager.borrow_mut();
        if manager.is_mounted() {
            if let Err(e) = manager.unmount() {
                warn!("cannot unmount overlay on executor exit: {}", e);
            }
        }
    }

    /// Run the given actions in order.
    pub fn execute(
        &mut self,
        actions: &[Action],
        stdout: Stream<'_>,
        stderr: Stream<'_>,
    ) -> Result<()> {
        for action in actions {
            if action.action_type == ActionType::Skip {
                debug!("skip {}:{} (already ran)", action.part_name, action.step);
                continue;
            }

            info!("execute action {}", action);
            let handler = self
                .handlers
                .get_mut(&action.part_name)
                .ok_or_else(|| Error::InvalidPartName(action.part_name.clone()))?;
            handler.run_action(action, stdout, stderr)?;
        }
        Ok(())
    }

    /// Clean the given step (and implicitly its work files) for a part.
    pub(crate) fn clean_part_step(&self, part_name: &str, step: crate::steps::Step) -> Result<()> {
        let handler = self
            .handlers
            .get(part_name)
            .ok_or_else(|| Error::InvalidPartName(part_name.to_string()))?;
        handler.clean_step(step)
    }
}

/// Scoped executor handed out by the lifecycle manager.
///
/// Dropping the value releases all resources the execution acquired.
pub struct ActionExecutor {
    executor: Executor,
}

impl ActionExecutor {
    pub(crate) fn new(mut executor: Executor) -> Result<Self> {
        executor.prologue()?;
        Ok(Self { executor })
    }

    /// Run the given actions in order, inheriting this process's output
    /// streams.
    pub fn execute(&mut self, actions: &[Action]) -> Result<()> {
        self.executor.execute(actions, None, None)
    }

    /// Run the given actions with redirected output.
    pub fn execute_with_streams(
        &mut self,
        actions: &[Action],
        stdout: Stream<'_>,
        stderr: Stream<'_>,
    ) -> Result<()> {
        self.executor.execute(actions, stdout, stderr)
    }
}

impl Drop for ActionExecutor {
    fn drop(&mut self) {
        self.executor.epilogue();
    }
}
