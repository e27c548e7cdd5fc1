// tests/common/mod.rs

//! Shared helpers for lifecycle integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Once;
use strata::{Action, ActionType, LifecycleManager, LifecycleOptions, PartsDefinition, Step};

static INIT_LOGGING: Once = Once::new();

/// Build a lifecycle manager over a work directory from a parts YAML
/// snippet.
pub fn lifecycle(work_dir: &Path, parts_yaml: &str) -> LifecycleManager {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
    let parts = PartsDefinition::from_yaml(parts_yaml).unwrap();
    LifecycleManager::new(parts, LifecycleOptions::new("test", work_dir)).unwrap()
}

pub fn run(part: &str, step: Step) -> Action {
    Action::new(part, step)
}

pub fn run_reason(part: &str, step: Step, reason: &str) -> Action {
    Action::new(part, step).with_reason(reason)
}

pub fn skip(part: &str, step: Step) -> Action {
    Action::new(part, step)
        .with_action_type(ActionType::Skip)
        .with_reason("already ran")
}

pub fn rerun(part: &str, step: Step, reason: &str) -> Action {
    Action::new(part, step)
        .with_action_type(ActionType::Rerun)
        .with_reason(reason)
}

pub fn reapply(part: &str, step: Step, reason: &str) -> Action {
    Action::new(part, step)
        .with_action_type(ActionType::Reapply)
        .with_reason(reason)
}

/// Drop SKIP actions, keeping everything else in order.
pub fn filter_skip(actions: Vec<Action>) -> Vec<Action> {
    actions
        .into_iter()
        .filter(|a| a.action_type != ActionType::Skip)
        .collect()
}

/// Names as owned strings, for part filters.
pub fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}
