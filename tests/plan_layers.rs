// tests/plan_layers.rs

//! Planning over the overlay layer stack: layer ordering, visibility
//! dependencies, and stage dependencies.

mod common;

use common::*;
use strata::Step;
use tempfile::TempDir;

const THREE_NIL_PARTS: &str = "
parts:
  p1:
    plugin: nil
  p2:
    plugin: nil
  p3:
    plugin: nil
";

#[test]
fn test_layer_order_bottom_layer() {
    let tmp = TempDir::new().unwrap();
    let mut lf = lifecycle(tmp.path(), THREE_NIL_PARTS);

    let actions = lf.plan(Step::Prime, Some(&names(&["p1"]))).unwrap();
    assert_eq!(
        actions,
        vec![
            run("p1", Step::Pull),
            run("p1", Step::Overlay),
            run("p1", Step::Build),
            run("p1", Step::Stage),
            run("p1", Step::Prime),
        ]
    );
}

#[test]
fn test_layer_order_top_layer() {
    let tmp = TempDir::new().unwrap();
    let mut lf = lifecycle(tmp.path(), THREE_NIL_PARTS);

    // priming p3 requires the p1 and p2 layers below it
    let actions = lf.plan(Step::Prime, Some(&names(&["p3"]))).unwrap();
    assert_eq!(
        actions,
        vec![
            run("p3", Step::Pull),
            run_reason("p1", Step::Pull, "required to overlay 'p3'"),
            run_reason("p1", Step::Overlay, "required to overlay 'p3'"),
            run_reason("p2", Step::Pull, "required to overlay 'p3'"),
            run_reason("p2", Step::Overlay, "required to overlay 'p3'"),
            run("p3", Step::Overlay),
            run("p3", Step::Build),
            run("p3", Step::Stage),
            run("p3", Step::Prime),
        ]
    );
}

#[test]
fn test_layer_parameter_change() {
    let tmp = TempDir::new().unwrap();
    let mut lf = lifecycle(tmp.path(), THREE_NIL_PARTS);

    let actions = lf.plan(Step::Overlay, Some(&names(&["p3"]))).unwrap();
    assert_eq!(
        actions,
        vec![
            run("p3", Step::Pull),
            run_reason("p1", Step::Pull, "required to overlay 'p3'"),
            run_reason("p1", Step::Overlay, "required to overlay 'p3'"),
            run_reason("p2", Step::Pull, "required to overlay 'p3'"),
            run_reason("p2", Step::Overlay, "required to overlay 'p3'"),
            run("p3", Step::Overlay),
        ]
    );

    lf.action_executor().unwrap().execute(&actions).unwrap();

    // plan again with no changes
    let actions = lf.plan(Step::Overlay, Some(&names(&["p3"]))).unwrap();
    assert_eq!(
        actions,
        vec![
            skip("p3", Step::Pull),
            rerun("p3", Step::Overlay, "requested step"),
        ]
    );

    // change an overlay parameter in p2, its layer must be rebuilt
    let changed = "
parts:
  p1:
    plugin: nil
  p2:
    plugin: nil
    override-overlay: echo
  p3:
    plugin: nil
";
    let mut lf = lifecycle(tmp.path(), changed);
    let actions = lf.plan(Step::Overlay, Some(&names(&["p3"]))).unwrap();
    assert_eq!(
        actions,
        vec![
            skip("p3", Step::Pull),
            skip("p2", Step::Pull),
            rerun("p2", Step::Overlay, "required to overlay 'p3'"),
            rerun("p3", Step::Overlay, "requested step"),
        ]
    );
}

#[test]
fn test_overlay_visibility_dependency_top() {
    let tmp = TempDir::new().unwrap();
    let parts = "
parts:
  p1:
    plugin: nil
  p2:
    plugin: nil
  p3:
    plugin: nil
    overlay-visibility: true
";
    let mut lf = lifecycle(tmp.path(), parts);

    let actions = lf.plan(Step::Build, Some(&names(&["p3"]))).unwrap();
    assert_eq!(
        actions,
        vec![
            run("p3", Step::Pull),
            run_reason("p1", Step::Pull, "required to overlay 'p3'"),
            run_reason("p1", Step::Overlay, "required to overlay 'p3'"),
            run_reason("p2", Step::Pull, "required to overlay 'p3'"),
            run_reason("p2", Step::Overlay, "required to overlay 'p3'"),
            run("p3", Step::Overlay),
            run("p3", Step::Build),
        ]
    );
}

#[test]
fn test_overlay_visibility_dependency_middle() {
    let tmp = TempDir::new().unwrap();
    let parts = "
parts:
  p1:
    plugin: nil
  p2:
    plugin: nil
    overlay-visibility: true
  p3:
    plugin: nil
";
    let mut lf = lifecycle(tmp.path(), parts);

    // building p2 requires every other part's layer, not just the ones
    // below it
    let actions = lf.plan(Step::Build, Some(&names(&["p2"]))).unwrap();
    assert_eq!(
        actions,
        vec![
            run("p2", Step::Pull),
            run_reason("p1", Step::Pull, "required to overlay 'p2'"),
            run_reason("p1", Step::Overlay, "required to overlay 'p2'"),
            run("p2", Step::Overlay),
            run_reason("p3", Step::Pull, "required to build 'p2'"),
            run_reason("p3", Step::Overlay, "required to build 'p2'"),
            run("p2", Step::Build),
        ]
    );
}

#[test]
fn test_overlay_visibility_dependency_bottom() {
    let tmp = TempDir::new().unwrap();
    let parts = "
parts:
  p1:
    plugin: nil
    overlay-visibility: true
  p2:
    plugin: nil
  p3:
    plugin: nil
";
    let mut lf = lifecycle(tmp.path(), parts);

    let actions = lf.plan(Step::Build, Some(&names(&["p1"]))).unwrap();
    assert_eq!(
        actions,
        vec![
            run("p1", Step::Pull),
            run("p1", Step::Overlay),
            run_reason("p2", Step::Pull, "required to build 'p1'"),
            run_reason("p2", Step::Overlay, "required to build 'p1'"),
            run_reason("p3", Step::Pull, "required to build 'p1'"),
            run_reason("p3", Step::Overlay, "required to build 'p1'"),
            run("p1", Step::Build),
        ]
    );
}

#[test]
fn test_overlay_stage_dependency_middle() {
    let tmp = TempDir::new().unwrap();
    let parts = "
parts:
  p1:
    plugin: nil
  p2:
    plugin: nil
    override-overlay: echo overlay
  p3:
    plugin: nil
";
    let mut lf = lifecycle(tmp.path(), parts);

    // staging a part with overlay parameters requires the whole stack
    let actions = lf.plan(Step::Stage, Some(&names(&["p2"]))).unwrap();
    assert_eq!(
        actions,
        vec![
            run("p2", Step::Pull),
            run_reason("p1", Step::Pull, "required to overlay 'p2'"),
            run_reason("p1", Step::Overlay, "required to overlay 'p2'"),
            run("p2", Step::Overlay),
            run("p2", Step::Build),
            run_reason("p3", Step::Pull, "required to stage 'p2'"),
            run_reason("p3", Step::Overlay, "required to stage 'p2'"),
            run("p2", Step::Stage),
        ]
    );
}

#[test]
fn test_overlay_stage_dependency_bottom() {
    let tmp = TempDir::new().unwrap();
    let parts = "
parts:
  p1:
    plugin: nil
    override-overlay: echo overlay
  p2:
    plugin: nil
  p3:
    plugin: nil
";
    let mut lf = lifecycle(tmp.path(), parts);

    let actions = lf.plan(Step::Stage, Some(&names(&["p1"]))).unwrap();
    assert_eq!(
        actions,
        vec![
            run("p1", Step::Pull),
            run("p1", Step::Overlay),
            run("p1", Step::Build),
            run_reason("p2", Step::Pull, "required to stage 'p1'"),
            run_reason("p2", Step::Overlay, "required to stage 'p1'"),
            run_reason("p3", Step::Pull, "required to stage 'p1'"),
            run_reason("p3", Step::Overlay, "required to stage 'p1'"),
            run("p1", Step::Stage),
        ]
    );
}

#[test]
fn test_after_dependency_full_plan() {
    let tmp = TempDir::new().unwrap();
    let parts = "
parts:
  A:
    plugin: nil
    after: [B]
  B:
    plugin: nil
";
    let mut lf = lifecycle(tmp.path(), parts);

    // parts are sorted so dependencies come first; B must be staged
    // before A builds
    let actions = filter_skip(lf.plan(Step::Stage, None).unwrap());
    assert_eq!(
        actions,
        vec![
            run("B", Step::Pull),
            run("A", Step::Pull),
            run("B", Step::Overlay),
            run("A", Step::Overlay),
            run("B", Step::Build),
            run_reason("B", Step::Stage, "required to build 'A'"),
            run("A", Step::Build),
            run("A", Step::Stage),
        ]
    );
}

#[test]
fn test_after_dependency_stage_one_part() {
    let tmp = TempDir::new().unwrap();
    let parts = "
parts:
  A:
    plugin: nil
    after: [B]
  B:
    plugin: nil
";
    let mut lf = lifecycle(tmp.path(), parts);

    let actions = filter_skip(lf.plan(Step::Stage, Some(&names(&["A"]))).unwrap());
    assert_eq!(
        actions,
        vec![
            run("A", Step::Pull),
            run_reason("B", Step::Pull, "required to overlay 'A'"),
            run_reason("B", Step::Overlay, "required to overlay 'A'"),
            run("A", Step::Overlay),
            run_reason("B", Step::Build, "required to build 'A'"),
            run_reason("B", Step::Stage, "required to build 'A'"),
            run("A", Step::Build),
            run("A", Step::Stage),
        ]
    );
}

#[test]
fn test_overlay_parts_stage_each_other() {
    let tmp = TempDir::new().unwrap();
    let parts = "
parts:
  A:
    plugin: nil
    override-overlay: echo A
  B:
    plugin: nil
    override-overlay: echo B
";
    let mut lf = lifecycle(tmp.path(), parts);

    let actions = filter_skip(lf.plan(Step::Stage, Some(&names(&["A"]))).unwrap());
    assert_eq!(
        actions,
        vec![
            run("A", Step::Pull),
            run("A", Step::Overlay),
            run("A", Step::Build),
            run_reason("B", Step::Pull, "required to stage 'A'"),
            run_reason("B", Step::Overlay, "required to stage 'A'"),
            run("A", Step::Stage),
        ]
    );
}

#[test]
fn test_visibility_and_after_combined() {
    let tmp = TempDir::new().unwrap();
    let parts = "
parts:
  A:
    plugin: nil
    overlay-visibility: true
  B:
    plugin: nil
    after: [A]
    override-overlay: echo B
";
    let mut lf = lifecycle(tmp.path(), parts);

    let actions = filter_skip(lf.plan(Step::Stage, Some(&names(&["B"]))).unwrap());
    assert_eq!(
        actions,
        vec![
            run("B", Step::Pull),
            run_reason("A", Step::Pull, "required to overlay 'B'"),
            run_reason("A", Step::Overlay, "required to overlay 'B'"),
            run("B", Step::Overlay),
            run_reason("A", Step::Build, "required to build 'B'"),
            run_reason("A", Step::Stage, "required to build 'B'"),
            run("B", Step::Build),
            run("B", Step::Stage),
        ]
    );
}

#[test]
fn test_visibility_part_pulls_overlay_parts_to_overlay_only() {
    let tmp = TempDir::new().unwrap();
    let parts = "
parts:
  A:
    plugin: nil
    overlay-visibility: true
  B:
    plugin: nil
    override-overlay: echo B
";
    let mut lf = lifecycle(tmp.path(), parts);

    let actions = filter_skip(lf.plan(Step::Stage, Some(&names(&["A"]))).unwrap());
    assert_eq!(
        actions,
        vec![
            run("A", Step::Pull),
            run("A", Step::Overlay),
            run_reason("B", Step::Pull, "required to build 'A'"),
            run_reason("B", Step::Overlay, "required to build 'A'"),
            run("A", Step::Build),
            run("A", Step::Stage),
        ]
    );
}
