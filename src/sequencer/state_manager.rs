// src/sequencer/state_manager.rs

//! Planning-time view of persisted step states.
//!
//! The state manager loads every part's persisted states once, ordered
//! by their file timestamps, and then tracks planned execution in
//! memory: when the sequencer decides a step will run, a marker state
//! with the current specification is recorded so later planning checks
//! see the step as fresh.

use crate::error::Result;
use crate::parts::Part;
use crate::sources::OutdatedFiles;
use crate::state::{self, StepState};
use crate::steps::Step;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fs;
use std::time::SystemTime;

/// Why a step's persisted state no longer matches the specification.
#[derive(Debug, Clone)]
pub struct DirtyReport {
    pub dirty_properties: Vec<String>,
    pub dirty_project_options: Vec<String>,
}

impl DirtyReport {
    pub fn reason(&self) -> String {
        if let Some(property) = self.dirty_properties.first() {
            format!("'{property}' property changed")
        } else if let Some(option) = self.dirty_project_options.first() {
            format!("'{option}' project option changed")
        } else {
            "properties changed".to_string()
        }
    }
}

/// Why a step's persisted state lags behind its inputs.
#[derive(Debug, Clone)]
pub struct OutdatedReport {
    /// A previous step ran more recently than this one.
    pub previous_step: Option<Step>,
    /// The upstream source changed (PULL only).
    pub source_updated: bool,
    pub changed_files: Option<Vec<String>>,
    pub changed_dirs: Option<Vec<String>>,
}

impl OutdatedReport {
    pub fn reason(&self) -> String {
        if self.source_updated {
            "upstream source changed".to_string()
        } else if let Some(step) = self.previous_step {
            format!("'{}' step changed", step.display_name())
        } else {
            "outdated".to_string()
        }
    }
}

struct StateWrapper {
    state: StepState,
    serial: u64,
}

/// In-memory database of part states, persisted and planned.
pub struct StateManager {
    db: BTreeMap<(String, Step), StateWrapper>,
    next_serial: u64,
    current_properties: BTreeMap<String, BTreeMap<String, Value>>,
    project_options: BTreeMap<String, Value>,
    source_outdated: BTreeMap<String, OutdatedFiles>,
}

impl StateManager {
    /// Load the persisted states of every part.
    ///
    /// `source_outdated` carries the per-part result of the source
    /// handlers' outdated checks, already filtered by the application's
    /// ignore patterns.
    pub fn new(
        part_list: &[Part],
        project_options: BTreeMap<String, Value>,
        source_outdated: BTreeMap<String, OutdatedFiles>,
    ) -> Result<Self> {
        let mut loaded: Vec<(SystemTime, usize, String, Step, StepState)> = Vec::new();

        for (part_index, part) in part_list.iter().enumerate() {
            for (step_index, step) in Step::ALL.iter().enumerate() {
                if let Some(state) = state::load_step_state(part, *step)? {
                    let path = state::get_step_state_path(part, *step);
                    let mtime = fs::metadata(&path)
                        .and_then(|m| m.modified())
                        .unwrap_or(SystemTime::UNIX_EPOCH);
                    loaded.push((
                        mtime,
                        part_index * Step::ALL.len() + step_index,
                        part.name().to_string(),
                        *step,
                        state,
                    ));
                }
            }
        }

        // serials follow write order; ties resolve in pipeline order
        loaded.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        let mut db = BTreeMap::new();
        let mut next_serial = 0;
        for (_, _, part_name, step, state) in loaded {
            db.insert((part_name, step), StateWrapper {
                state,
                serial: next_serial,
            });
            next_serial += 1;
        }

        let current_properties = part_list
            .iter()
            .map(|p| (p.name().to_string(), p.spec().marshal()))
            .collect();

        Ok(Self {
            db,
            next_serial,
            current_properties,
            project_options,
            source_outdated,
        })
    }

    fn key(part: &Part, step: Step) -> (String, Step) {
        (part.name().to_string(), step)
    }

    pub fn has_step_run(&self, part: &Part, step: Step) -> bool {
        self.db.contains_key(&Self::key(part, step))
    }

    pub fn get_state(&self, part: &Part, step: Step) -> Option<&StepState> {
        self.db.get(&Self::key(part, step)).map(|w| &w.state)
    }

    /// Record that the step was planned to run, making it fresh for
    /// later checks in the same plan.
    pub fn set_state(&mut self, part: &Part, step: Step, state: StepState) {
        self.db.insert(Self::key(part, step), StateWrapper {
            state,
            serial: self.next_serial,
        });
        self.next_serial += 1;
    }

    /// Drop a single step of a part.
    pub fn remove_state(&mut self, part: &Part, step: Step) {
        self.db.remove(&Self::key(part, step));
    }

    /// Drop the given step and every later step of a part.
    pub fn clean_part(&mut self, part: &Part, step: Step) {
        self.db.remove(&Self::key(part, step));
        for next in step.next_steps() {
            self.db.remove(&Self::key(part, next));
        }
    }

    /// Refresh the step's serial after an UPDATE, so later steps see it
    /// as newly touched.
    pub fn mark_step_updated(&mut self, part: &Part, step: Step) {
        if let Some(wrapper) = self.db.get_mut(&Self::key(part, step)) {
            wrapper.serial = self.next_serial;
            self.next_serial += 1;
        }
    }

    /// Whether the persisted state no longer matches the current
    /// specification.
    pub fn check_if_dirty(&self, part: &Part, step: Step) -> Option<DirtyReport> {
        let wrapper = self.db.get(&Self::key(part, step))?;
        let current = self.current_properties.get(part.name())?;

        let dirty_properties = wrapper.state.diff_properties_of_interest(current);
        let dirty_project_options = wrapper
            .state
            .diff_project_options_of_interest(&self.project_options);

        if dirty_properties.is_empty() && dirty_project_options.is_empty() {
            None
        } else {
            Some(DirtyReport {
                dirty_properties,
                dirty_project_options,
            })
        }
    }

    /// Whether the persisted state lags behind the step's inputs.
    pub fn check_if_outdated(&self, part: &Part, step: Step) -> Option<OutdatedReport> {
        let wrapper = self.db.get(&Self::key(part, step))?;

        if step == Step::Pull {
            let outdated = self.source_outdated.get(part.name())?;
            return Some(OutdatedReport {
                previous_step: None,
                source_updated: true,
                changed_files: Some(outdated.files.clone()),
                changed_dirs: Some(outdated.dirs.clone()),
            });
        }

        for previous in step.previous_steps() {
            if let Some(previous_wrapper) = self.db.get(&Self::key(part, previous)) {
                if previous_wrapper.serial > wrapper.serial {
                    return Some(OutdatedReport {
                        previous_step: Some(previous),
                        source_updated: false,
                        changed_files: None,
                        changed_dirs: None,
                    });
                }
            }
        }

        None
    }

    /// Whether planning must (re)run this step.
    pub fn should_step_run(&self, part: &Part, step: Step) -> bool {
        !self.has_step_run(part, step)
            || self.check_if_dirty(part, step).is_some()
            || self.check_if_outdated(part, step).is_some()
    }
}
