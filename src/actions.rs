// src/actions.rs

//! Lifecycle actions and action types.
//!
//! An [`Action`] is one entry of the ordered plan produced by the
//! sequencer: a part, a step, and how the step is to be executed.

use crate::steps::Step;

/// How an action is to be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActionType {
    /// Execute the step fresh.
    #[default]
    Run,
    /// Clear the existing state and outputs, then run.
    Rerun,
    /// Don't execute this action.
    Skip,
    /// Continue processing the step: source update or incremental build.
    Update,
    /// Rebuild just the overlay layer, without invalidating downstream state.
    Reapply,
}

/// Extra information attached to an action by the sequencer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ActionProperties {
    /// Files reported changed by the source handler, for UPDATE actions.
    pub changed_files: Option<Vec<String>>,
    /// Directories reported changed by the source handler, for UPDATE actions.
    pub changed_dirs: Option<Vec<String>>,
}

/// The action to be executed for a given part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    /// The name of the part this action will be performed on.
    pub part_name: String,
    /// The step this action will execute.
    pub step: Step,
    /// How the step is to be executed.
    pub action_type: ActionType,
    /// A textual description of why this action should be executed.
    pub reason: Option<String>,
    /// Extra execution properties.
    pub properties: ActionProperties,
}

impl Action {
    /// Create a plain RUN action with no reason.
    pub fn new(part_name: impl Into<String>, step: Step) -> Self {
        Self {
            part_name: part_name.into(),
            step,
            action_type: ActionType::Run,
            reason: None,
            properties: ActionProperties::default(),
        }
    }

    /// Set the action type.
    pub fn with_action_type(mut self, action_type: ActionType) -> Self {
        self.action_type = action_type;
        self
    }

    /// Set the reason text.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Set the execution properties.
    pub fn with_properties(mut self, properties: ActionProperties) -> Self {
        self.properties = properties;
        self
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} ({:?})", self.part_name, self.step, self.action_type)?;
        if let Some(reason) = &self.reason {
            write!(f, " [{}]", reason)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_builder() {
        let action = Action::new("foo", Step::Build)
            .with_action_type(ActionType::Rerun)
            .with_reason("'organize' property changed");
        assert_eq!(action.part_name, "foo");
        assert_eq!(action.step, Step::Build);
        assert_eq!(action.action_type, ActionType::Rerun);
        assert_eq!(
            action.reason.as_deref(),
            Some("'organize' property changed")
        );
    }

    #[test]
    fn test_action_display() {
        let action = Action::new("foo", Step::Pull).with_reason("requested step");
        assert_eq!(action.to_string(), "foo:pull (Run) [requested step]");
    }

    #[test]
    fn test_action_equality_ignores_nothing() {
        let a = Action::new("p1", Step::Stage);
        let b = Action::new("p1", Step::Stage);
        assert_eq!(a, b);
        let c = b.clone().with_reason("x");
        assert_ne!(a, c);
    }
}
