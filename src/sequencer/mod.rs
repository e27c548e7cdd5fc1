// src/sequencer/mod.rs

//! Action planning.
//!
//! The sequencer turns the declared parts, the persisted state and a
//! requested target step into an ordered action list. Dependencies are
//! expanded recursively, so actions required by another action are
//! inserted just before it, labelled with a "required to ..." reason.

mod layers;
mod state_manager;

pub use state_manager::{DirtyReport, OutdatedReport, StateManager};

use crate::actions::{Action, ActionProperties, ActionType};
use crate::error::Result;
use crate::infos::ProjectInfo;
use crate::overlays::LayerHash;
use crate::parts::{self, Part};
use crate::sources::OutdatedFiles;
use crate::state::{
    BuildState, OverlayState, PrimeState, PullState, StageState, StepState,
};
use crate::steps::Step;
use layers::LayerStateManager;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Produces ordered action lists from parts, state and a target step.
pub struct Sequencer {
    project: Arc<ProjectInfo>,
    part_list: Vec<Part>,
    sm: StateManager,
    layer_state: LayerStateManager,
    actions: Vec<Action>,
}

impl Sequencer {
    /// Create a sequencer over a sorted part list.
    ///
    /// `source_outdated` is the per-part result of the source handlers'
    /// `check_if_outdated`, for parts with both a source handler and a
    /// persisted PULL state.
    pub fn new(
        project: Arc<ProjectInfo>,
        part_list: Vec<Part>,
        base_layer_hash: Option<LayerHash>,
        source_outdated: BTreeMap<String, OutdatedFiles>,
    ) -> Result<Self> {
        let sm = StateManager::new(&part_list, project.project_options(), source_outdated)?;
        let layer_state = LayerStateManager::new(&part_list, base_layer_hash)?;
        Ok(Self {
            project,
            part_list,
            sm,
            layer_state,
            actions: Vec::new(),
        })
    }

    /// Plan the actions required to reach `target_step`, optionally
    /// restricted to the named parts.
    pub fn plan(
        &mut self,
        target_step: Step,
        part_names: Option<&[String]>,
    ) -> Result<Vec<Action>> {
        if let Some(names) = part_names {
            for name in names {
                parts::part_by_name(name, &self.part_list)?;
            }
        }

        self.actions.clear();
        self.add_all_actions(target_step, part_names, None)?;
        Ok(std::mem::take(&mut self.actions))
    }

    fn add_all_actions(
        &mut self,
        target_step: Step,
        part_names: Option<&[String]>,
        reason: Option<&str>,
    ) -> Result<()> {
        let selected: Vec<Part> = self
            .part_list
            .iter()
            .filter(|p| match part_names {
                Some(names) => names.iter().any(|n| n == p.name()),
                None => true,
            })
            .cloned()
            .collect();

        let mut steps = target_step.previous_steps();
        steps.push(target_step);

        for current_step in steps {
            for part in &selected {
                debug!("process {}:{}", part.name(), current_step);
                self.add_step_actions(current_step, target_step, part, part_names, reason)?;
            }
        }

        Ok(())
    }

    /// Verify if the step should be executed, and how.
    fn add_step_actions(
        &mut self,
        current_step: Step,
        target_step: Step,
        part: &Part,
        part_names: Option<&[String]>,
        reason: Option<&str>,
    ) -> Result<()> {
        // if the step didn't run yet, run it
        if !self.sm.has_step_run(part, current_step) {
            return self.run_step(part, current_step, reason, false);
        }

        // the step already ran:
        //
        // 1. if this is the requested target step of an explicitly listed
        //    part, run it again
        if let Some(names) = part_names {
            if current_step == target_step && names.iter().any(|n| n == part.name()) {
                let reason = reason.unwrap_or("requested step");
                return self.rerun_step(part, current_step, Some(reason.to_string()));
            }
        }

        // 2. if the step is dirty, run it again; a step is dirty if
        //    properties or project options it uses changed since it ran
        if let Some(dirty) = self.sm.check_if_dirty(part, current_step) {
            debug!("{}:{} is dirty", part.name(), current_step);
            let reason = reason.map(str::to_string).unwrap_or_else(|| dirty.reason());
            return self.rerun_step(part, current_step, Some(reason));
        }

        // 3. if the step is outdated, update it if the step supports
        //    updating, rerun it otherwise
        if let Some(outdated) = self.sm.check_if_outdated(part, current_step) {
            debug!("{}:{} is outdated", part.name(), current_step);
            return match current_step {
                Step::Pull | Step::Overlay | Step::Build => {
                    self.update_step(part, current_step, &outdated)
                }
                _ => self.rerun_step(part, current_step, Some(outdated.reason())),
            };
        }

        // 4. if a lower layer changed, the overlay content must be
        //    reapplied on top of the new stack (downstream state stays)
        if current_step == Step::Overlay {
            let current_hash = self.layer_state.compute_layer_hash(&self.part_list, part);
            if self.layer_state.get_layer_hash(part) != Some(current_hash.clone()) {
                self.reapply_layer(part, current_hash, "previous layer changed");
                return Ok(());
            }
        }

        // 5. a part that can see the overlay must rebuild when the
        //    overlay contents changed
        if current_step == Step::Build
            && parts::has_overlay_visibility(part, &self.part_list)
            && self.recorded_overlay_hash_differs(part, current_step)
        {
            return self.rerun_step(part, current_step, Some("overlay changed".to_string()));
        }

        // 6. a part with overlay parameters must restage when the
        //    overlay contents changed
        if current_step == Step::Stage
            && part.has_overlay()
            && self.recorded_overlay_hash_differs(part, current_step)
        {
            return self.rerun_step(part, current_step, Some("overlay changed".to_string()));
        }

        // nothing to do
        self.add_action(part, current_step, ActionType::Skip, Some("already ran"), None);
        Ok(())
    }

    fn recorded_overlay_hash_differs(&self, part: &Part, step: Step) -> bool {
        let current = self.layer_state.overlay_hash(&self.part_list).hex();
        match self.sm.get_state(part, step).and_then(|s| s.overlay_hash()) {
            Some(recorded) => recorded != current,
            None => true,
        }
    }

    fn run_step(
        &mut self,
        part: &Part,
        step: Step,
        reason: Option<&str>,
        rerun: bool,
    ) -> Result<()> {
        self.process_dependencies(part, step)?;

        match step {
            Step::Overlay => {
                // the layer stack below this part must be in place
                let reason = format!("required to overlay '{}'", part.name());
                self.ensure_overlay_consistency(part, &reason, true)?;
            }
            Step::Build if parts::has_overlay_visibility(part, &self.part_list) => {
                // a build that can see the overlay depends on the whole stack
                if let Some(last) = self.part_list.last().cloned() {
                    let reason = format!("required to build '{}'", part.name());
                    self.ensure_overlay_consistency(&last, &reason, false)?;
                }
            }
            Step::Stage if part.has_overlay() => {
                // overlay content is migrated to stage along with this part
                if let Some(last) = self.part_list.last().cloned() {
                    let reason = format!("required to stage '{}'", part.name());
                    self.ensure_overlay_consistency(&last, &reason, false)?;
                }
            }
            _ => {}
        }

        let action_type = if rerun { ActionType::Rerun } else { ActionType::Run };
        self.add_action(part, step, action_type, reason, None);

        self.sm.set_state(part, step, self.marker_state(part, step));
        if step == Step::Overlay {
            let hash = self.layer_state.compute_layer_hash(&self.part_list, part);
            self.layer_state.set_layer_hash(part, hash);
        }

        Ok(())
    }

    fn rerun_step(&mut self, part: &Part, step: Step, reason: Option<String>) -> Result<()> {
        // clear this step and everything downstream; a layer rebuild is
        // the exception, downstream invalidation rides the overlay hash
        if step == Step::Overlay {
            self.sm.remove_state(part, step);
        } else {
            self.sm.clean_part(part, step);
        }
        self.run_step(part, step, reason.as_deref(), true)
    }

    fn update_step(&mut self, part: &Part, step: Step, outdated: &OutdatedReport) -> Result<()> {
        let properties = ActionProperties {
            changed_files: outdated.changed_files.clone(),
            changed_dirs: outdated.changed_dirs.clone(),
        };
        self.add_action(
            part,
            step,
            ActionType::Update,
            Some(&outdated.reason()),
            Some(properties),
        );
        self.sm.mark_step_updated(part, step);
        Ok(())
    }

    fn reapply_layer(&mut self, part: &Part, layer_hash: LayerHash, reason: &str) {
        self.add_action(part, Step::Overlay, ActionType::Reapply, Some(reason), None);
        self.layer_state.set_layer_hash(part, layer_hash);
    }

    /// Parts this part is `after` must be staged before it builds.
    fn process_dependencies(&mut self, part: &Part, step: Step) -> Result<()> {
        let Some(prerequisite_step) = step.dependency_prerequisite() else {
            return Ok(());
        };

        let deps: Vec<String> = parts::part_dependencies(part, &self.part_list)?
            .into_iter()
            .map(|p| p.name().to_string())
            .collect();

        let reason = format!("required to build '{}'", part.name());
        for dep_name in deps {
            let dep = parts::part_by_name(&dep_name, &self.part_list)?.clone();
            if self.sm.should_step_run(&dep, prerequisite_step) {
                self.add_all_actions(
                    prerequisite_step,
                    Some(&[dep_name]),
                    Some(&reason),
                )?;
            }
        }

        Ok(())
    }

    /// Make sure every layer up to `top_part` is in place and current.
    fn ensure_overlay_consistency(
        &mut self,
        top_part: &Part,
        reason: &str,
        skip_last: bool,
    ) -> Result<()> {
        let mut stack: Vec<Part> = Vec::new();
        for part in &self.part_list {
            if skip_last && part.name() == top_part.name() {
                break;
            }
            stack.push(part.clone());
            if part.name() == top_part.name() {
                break;
            }
        }

        for part in stack {
            if self.sm.should_step_run(&part, Step::Overlay) {
                self.add_all_actions(
                    Step::Overlay,
                    Some(&[part.name().to_string()]),
                    Some(reason),
                )?;
            } else if self.sm.has_step_run(&part, Step::Overlay) {
                let current_hash = self.layer_state.compute_layer_hash(&self.part_list, &part);
                if self.layer_state.get_layer_hash(&part) != Some(current_hash.clone()) {
                    self.reapply_layer(&part, current_hash, "previous layer changed");
                }
            }
        }

        Ok(())
    }

    fn add_action(
        &mut self,
        part: &Part,
        step: Step,
        action_type: ActionType,
        reason: Option<&str>,
        properties: Option<ActionProperties>,
    ) {
        let mut action = Action::new(part.name(), step).with_action_type(action_type);
        if let Some(reason) = reason {
            action = action.with_reason(reason);
        }
        if let Some(properties) = properties {
            action = action.with_properties(properties);
        }
        self.actions.push(action);
    }

    /// A lightweight state standing in for the step once it is planned.
    fn marker_state(&self, part: &Part, step: Step) -> StepState {
        let part_properties = part.spec().marshal();
        let project_options = self.project.project_options();
        let overlay_hash = Some(self.layer_state.overlay_hash(&self.part_list).hex());

        match step {
            Step::Pull => StepState::Pull(PullState {
                part_properties,
                project_options,
                ..PullState::default()
            }),
            Step::Overlay => StepState::Overlay(OverlayState {
                part_properties,
                project_options,
                ..OverlayState::default()
            }),
            Step::Build => StepState::Build(BuildState {
                part_properties,
                project_options,
                overlay_hash,
                ..BuildState::default()
            }),
            Step::Stage => StepState::Stage(StageState {
                part_properties,
                project_options,
                overlay_hash,
                ..StageState::default()
            }),
            Step::Prime => StepState::Prime(PrimeState {
                part_properties,
                project_options,
                ..PrimeState::default()
            }),
        }
    }
}
