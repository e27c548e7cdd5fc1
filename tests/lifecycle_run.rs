// tests/lifecycle_run.rs

//! End-to-end lifecycle execution against a real work tree.

mod common;

use common::*;
use std::fs;
use std::path::{Path, PathBuf};
use strata::{ActionType, Step, StepState};
use tempfile::TempDir;

fn make_source(root: &Path, name: &str, files: &[(&str, &str)]) -> PathBuf {
    let src = root.join(name);
    for (path, content) in files {
        let full = src.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }
    src
}

fn read_state(path: &Path) -> StepState {
    // state files are plain YAML mappings tagged with their step
    serde_yaml::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

fn stage_state(work: &Path, part: &str) -> StepState {
    read_state(&work.join("parts").join(part).join("state/stage"))
}

#[test]
fn test_dump_part_reaches_prime() {
    let tmp = TempDir::new().unwrap();
    let work = tmp.path().join("work");
    let src = make_source(tmp.path(), "content", &[("usr/bin/tool", "#!/bin/sh\n")]);

    let parts = format!(
        "parts:\n  content:\n    plugin: dump\n    source: {}\n",
        src.display()
    );
    let mut lf = lifecycle(&work, &parts);

    let actions = lf.plan(Step::Prime, None).unwrap();
    lf.action_executor().unwrap().execute(&actions).unwrap();

    assert!(work.join("parts/content/src/usr/bin/tool").is_file());
    assert!(work.join("parts/content/install/usr/bin/tool").is_file());
    assert!(work.join("stage/usr/bin/tool").is_file());
    assert!(work.join("prime/usr/bin/tool").is_file());

    // the stage manifest records exactly what was materialised
    let state = stage_state(&work, "content");
    let (files, dirs) = state.contents(None).unwrap();
    assert!(files.contains("usr/bin/tool"));
    assert!(dirs.contains("usr/bin"));

    // a full rerun of the same plan is all skips
    let actions = lf.plan(Step::Prime, None).unwrap();
    assert!(actions.iter().all(|a| a.action_type == ActionType::Skip));
}

#[test]
fn test_organize_renames_install_content() {
    let tmp = TempDir::new().unwrap();
    let work = tmp.path().join("work");
    let src = make_source(tmp.path(), "content", &[("hello", "hi\n")]);

    let parts = format!(
        "parts:\n  content:\n    plugin: dump\n    source: {}\n    organize:\n      hello: bin/hello\n",
        src.display()
    );
    let mut lf = lifecycle(&work, &parts);

    let actions = lf.plan(Step::Stage, None).unwrap();
    lf.action_executor().unwrap().execute(&actions).unwrap();

    assert!(work.join("parts/content/install/bin/hello").is_file());
    assert!(!work.join("parts/content/install/hello").exists());
    assert!(work.join("stage/bin/hello").is_file());
}

#[test]
fn test_stage_filter_limits_migration() {
    let tmp = TempDir::new().unwrap();
    let work = tmp.path().join("work");
    let src = make_source(
        tmp.path(),
        "content",
        &[("usr/bin/tool", "x"), ("usr/share/doc/README", "x")],
    );

    let parts = format!(
        "parts:\n  content:\n    plugin: dump\n    source: {}\n    stage: [\"usr/bin\"]\n",
        src.display()
    );
    let mut lf = lifecycle(&work, &parts);

    let actions = lf.plan(Step::Stage, None).unwrap();
    lf.action_executor().unwrap().execute(&actions).unwrap();

    assert!(work.join("stage/usr/bin/tool").is_file());
    assert!(!work.join("stage/usr/share").exists());
}

#[test]
fn test_shared_file_survives_cleaning_other_part() {
    let tmp = TempDir::new().unwrap();
    let work = tmp.path().join("work");
    let src_a = make_source(tmp.path(), "a", &[("common", "same"), ("only-a", "x")]);
    let src_b = make_source(tmp.path(), "b", &[("common", "same"), ("only-b", "x")]);

    let parts = format!(
        "parts:\n  a:\n    plugin: dump\n    source: {}\n  b:\n    plugin: dump\n    source: {}\n",
        src_a.display(),
        src_b.display()
    );
    let mut lf = lifecycle(&work, &parts);

    let actions = lf.plan(Step::Stage, None).unwrap();
    lf.action_executor().unwrap().execute(&actions).unwrap();

    assert!(work.join("stage/common").is_file());
    assert!(work.join("stage/only-a").is_file());
    assert!(work.join("stage/only-b").is_file());

    // cleaning a's stage keeps the file b also owns
    lf.clean(Step::Stage, Some(&names(&["a"]))).unwrap();

    assert!(work.join("stage/common").is_file());
    assert!(!work.join("stage/only-a").exists());
    assert!(work.join("stage/only-b").is_file());
    assert!(!work.join("parts/a/state/stage").exists());
    assert!(work.join("parts/b/state/stage").exists());
}

#[test]
fn test_clean_and_rerun_reproduces_manifest() {
    let tmp = TempDir::new().unwrap();
    let work = tmp.path().join("work");
    let src = make_source(
        tmp.path(),
        "content",
        &[("usr/bin/tool", "x"), ("etc/conf", "y")],
    );

    let parts = format!(
        "parts:\n  content:\n    plugin: dump\n    source: {}\n",
        src.display()
    );
    let mut lf = lifecycle(&work, &parts);

    let actions = lf.plan(Step::Stage, None).unwrap();
    lf.action_executor().unwrap().execute(&actions).unwrap();
    let before = stage_state(&work, "content");

    lf.clean(Step::Stage, Some(&names(&["content"]))).unwrap();
    assert!(!work.join("stage/usr/bin/tool").exists());

    let actions = lf.plan(Step::Stage, None).unwrap();
    let stage_actions: Vec<&strata::Action> = actions
        .iter()
        .filter(|a| a.action_type != ActionType::Skip)
        .collect();
    assert_eq!(stage_actions.len(), 1);
    assert_eq!(stage_actions[0].step, Step::Stage);
    lf.action_executor().unwrap().execute(&actions).unwrap();

    let after = stage_state(&work, "content");
    assert_eq!(before.contents(None), after.contents(None));
}

#[test]
fn test_failed_scriptlet_leaves_state_unwritten() {
    let tmp = TempDir::new().unwrap();
    let work = tmp.path().join("work");

    let parts = "
parts:
  p1:
    plugin: nil
    override-build: exit 3
";
    let mut lf = lifecycle(&work, parts);

    let actions = lf.plan(Step::Build, None).unwrap();
    let err = lf
        .action_executor()
        .unwrap()
        .execute(&actions)
        .unwrap_err();
    assert!(matches!(
        err,
        strata::Error::Scriptlet { exit_code: 3, .. }
    ));

    // the failed step has no state, the next plan runs it again
    assert!(!work.join("parts/p1/state/build").exists());
    let actions = lf.plan(Step::Build, None).unwrap();
    let kinds: Vec<(Step, ActionType)> =
        actions.iter().map(|a| (a.step, a.action_type)).collect();
    assert_eq!(
        kinds,
        vec![
            (Step::Pull, ActionType::Skip),
            (Step::Overlay, ActionType::Skip),
            (Step::Build, ActionType::Run),
        ]
    );
}

#[test]
fn test_overlay_content_flows_to_stage_and_prime() {
    let tmp = TempDir::new().unwrap();
    let work = tmp.path().join("work");

    let parts = "
parts:
  p1:
    plugin: nil
    override-overlay: touch from-overlay
  p2:
    plugin: nil
";
    let mut lf = lifecycle(&work, parts);

    let actions = lf.plan(Step::Prime, None).unwrap();
    lf.action_executor().unwrap().execute(&actions).unwrap();

    // the overlay scriptlet ran in the part's layer directory
    assert!(work.join("parts/p1/layer/from-overlay").is_file());
    // layer content was squashed into the shared trees
    assert!(work.join("stage/from-overlay").is_file());
    assert!(work.join("prime/from-overlay").is_file());
    // migration is marked per target step
    assert!(work.join("overlay/stage_overlay").is_file());
    assert!(work.join("overlay/prime_overlay").is_file());

    // the overlay state records the layer contents
    let overlay_state = read_state(&work.join("parts/p1/state/overlay"));
    let (files, _) = overlay_state.contents(None).unwrap();
    assert!(files.contains("from-overlay"));

    // cleaning the last overlay part removes the migrated content
    lf.clean(Step::Stage, Some(&names(&["p1"]))).unwrap();
    assert!(!work.join("stage/from-overlay").exists());
    assert!(!work.join("overlay/stage_overlay").exists());
}

#[test]
fn test_scriptlet_sees_generated_environment() {
    let tmp = TempDir::new().unwrap();
    let work = tmp.path().join("work");

    let parts = "
parts:
  p1:
    plugin: nil
    override-build: echo \"$TEST_PART_NAME:$TEST_STEP_NAME\" > \"$TEST_PART_INSTALL/id\"
";
    let mut lf = lifecycle(&work, parts);

    let actions = lf.plan(Step::Stage, None).unwrap();
    lf.action_executor().unwrap().execute(&actions).unwrap();

    let content = fs::read_to_string(work.join("parts/p1/install/id")).unwrap();
    assert_eq!(content.trim(), "p1:build");
    // whatever landed in the install tree was staged
    assert!(work.join("stage/id").is_file());
}
