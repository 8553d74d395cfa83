use approx::assert_abs_diff_eq;
use nalgebra::Vector3;

use crate::model::{TreeError, NO_PARENT};
use crate::tests::test_helpers::{
    add_segment, forest_of, root_only, thin_side_branch, vertical_chain,
};
use crate::transform::{decimate, decimate_by_ratio, prune_diameter, prune_length, reindex};

#[test]
fn diameter_prune_removes_thin_twig() {
    let forest = forest_of(vec![thin_side_branch()]);
    let pruned = prune_diameter(&forest, 10.0).unwrap();
    // thin twig (diameter 0.02) falls below 0.01 × 10.0; trunk survives
    assert_eq!(pruned.trees.len(), 1);
    assert_eq!(pruned.trees[0].segments.len(), 4);
    pruned.trees[0].validate().unwrap();
    // the input forest is untouched
    assert_eq!(forest.trees[0].segments.len(), 5);
}

#[test]
fn diameter_prune_keeps_everything_below_threshold() {
    let forest = forest_of(vec![thin_side_branch()]);
    let pruned = prune_diameter(&forest, 0.1).unwrap();
    assert_eq!(pruned.trees[0].segments.len(), 5);
}

#[test]
fn diameter_prune_is_idempotent() {
    let forest = forest_of(vec![thin_side_branch()]);
    let once = prune_diameter(&forest, 10.0).unwrap();
    let twice = prune_diameter(&once, 10.0).unwrap();
    assert_eq!(once.trees[0].segments.len(), twice.trees[0].segments.len());
}

#[test]
fn diameter_prune_drops_root_only_trees() {
    let forest = forest_of(vec![thin_side_branch()]);
    // threshold so large that every branch goes
    let pruned = prune_diameter(&forest, 1000.0).unwrap();
    assert!(pruned.trees.is_empty());
}

#[test]
fn trunk_only_tree_survives_pruning() {
    let forest = forest_of(vec![root_only()]);
    let by_diameter = prune_diameter(&forest, 0.01).unwrap();
    assert_eq!(by_diameter.trees.len(), 1);
    assert_eq!(by_diameter.trees[0].segments.len(), 1);
    let by_length = prune_length(&forest, 5.0).unwrap();
    assert_eq!(by_length.trees.len(), 1);
    assert_eq!(by_length.trees[0].segments.len(), 1);
}

#[test]
fn tighter_diameter_threshold_never_keeps_more() {
    let forest = forest_of(vec![thin_side_branch()]);
    let mut previous = usize::MAX;
    for threshold in [0.1, 10.0, 50.0, 1000.0] {
        let pruned = prune_diameter(&forest, threshold).unwrap();
        let kept = pruned.trees.first().map_or(0, |t| t.segments.len());
        assert!(
            kept <= previous,
            "threshold {threshold} kept {kept} segments, more than {previous}"
        );
        previous = kept;
    }
}

#[test]
fn repruning_at_a_smaller_threshold_changes_nothing() {
    let forest = forest_of(vec![thin_side_branch()]);
    let once = prune_diameter(&forest, 10.0).unwrap();
    let again = prune_diameter(&once, 5.0).unwrap();
    assert_eq!(once.trees[0].segments.len(), again.trees[0].segments.len());
}

#[test]
fn length_prune_cuts_at_exact_distance() {
    let forest = forest_of(vec![vertical_chain(3, 0.1)]);
    let pruned = prune_length(&forest, 1.5).unwrap();
    let tree = &pruned.trees[0];
    tree.validate().unwrap();
    // distances to the leaf: segment 1 is 2.0 (kept), segment 2 is 1.0
    // (interpolated), segment 3 is 0.0 (removed)
    assert_eq!(tree.segments.len(), 3);
    assert_abs_diff_eq!(tree.segments[2].tip.z, 1.5, epsilon = 1e-12);
}

#[test]
fn length_prune_preserves_short_trees_entirely_or_drops_them() {
    let forest = forest_of(vec![vertical_chain(2, 0.1)]);
    let pruned = prune_length(&forest, 10.0).unwrap();
    assert!(pruned.trees.is_empty());
}

#[test]
fn decimate_keeps_branch_points_and_leaves() {
    let mut tree = root_only();
    let mut parent = 0;
    for i in 1..=6 {
        parent = add_segment(&mut tree, parent, Vector3::new(0.0, 0.0, i as f64), 0.1);
    }
    // side branch at segment 3 makes it a branch point
    add_segment(&mut tree, 3, Vector3::new(1.0, 0.0, 3.0), 0.05);
    let forest = forest_of(vec![tree]);
    let decimated = decimate(&forest, 3).unwrap();
    let tree = &decimated.trees[0];
    tree.validate().unwrap();
    let children = tree.children();
    // both leaves survive
    let leaves = children.iter().filter(|c| c.is_empty()).count();
    assert_eq!(leaves, 2);
    // the branch point survives with both subtrees attached
    assert!(children.iter().any(|c| c.len() == 2));
    assert!(tree.segments.len() < forest.trees[0].segments.len());
}

#[test]
fn decimate_stride_one_is_identity() {
    let forest = forest_of(vec![vertical_chain(4, 0.1)]);
    let decimated = decimate(&forest, 1).unwrap();
    assert_eq!(decimated.trees[0].segments.len(), 5);
}

#[test]
fn ratio_decimation_splices_short_segments() {
    let mut tree = root_only();
    // a stubby 0.05 m segment of radius 0.1 (diameter 0.2) inside a chain
    let a = add_segment(&mut tree, 0, Vector3::new(0.0, 0.0, 1.0), 0.1);
    let b = add_segment(&mut tree, a, Vector3::new(0.0, 0.0, 1.05), 0.1);
    add_segment(&mut tree, b, Vector3::new(0.0, 0.0, 2.0), 0.1);
    let forest = forest_of(vec![tree]);
    let decimated = decimate_by_ratio(&forest, 1.0).unwrap();
    let tree = &decimated.trees[0];
    tree.validate().unwrap();
    assert_eq!(tree.segments.len(), 3);
    // the long segments retained their geometry
    assert_abs_diff_eq!(tree.segments[2].tip.z, 2.0, epsilon = 1e-12);
}

#[test]
fn transforms_reject_malformed_topology() {
    let mut tree = vertical_chain(2, 0.1);
    tree.segments[1].parent = 7; // out of range
    let forest = forest_of(vec![tree]);
    assert!(matches!(
        prune_diameter(&forest, 1.0),
        Err(TreeError::InvalidTopology { segment: 1, .. })
    ));
    assert!(matches!(
        prune_length(&forest, 1.0),
        Err(TreeError::InvalidTopology { .. })
    ));
    assert!(matches!(
        decimate(&forest, 2),
        Err(TreeError::InvalidTopology { .. })
    ));
    assert!(matches!(
        decimate_by_ratio(&forest, 1.0),
        Err(TreeError::InvalidTopology { .. })
    ));
}

#[test]
fn reindex_removes_marked_subtree() {
    let mut tree = root_only();
    let a = add_segment(&mut tree, 0, Vector3::new(0.0, 0.0, 1.0), 0.2);
    let b = add_segment(&mut tree, a, Vector3::new(0.0, 0.0, 2.0), 0.15);
    add_segment(&mut tree, b, Vector3::new(0.0, 0.0, 3.0), 0.1);
    let side = add_segment(&mut tree, a, Vector3::new(1.0, 0.0, 1.0), 0.1);
    add_segment(&mut tree, side, Vector3::new(2.0, 0.0, 1.0), 0.05);

    // shed the side branch: descendants follow automatically
    tree.segments[side].parent = NO_PARENT;
    reindex(&mut tree);
    tree.validate().unwrap();
    assert_eq!(tree.segments.len(), 4);
    assert!(tree
        .segments
        .iter()
        .all(|s| (s.tip.x - 0.0).abs() < 1e-12));
}

#[test]
fn reindex_without_marks_is_noop() {
    let mut tree = vertical_chain(3, 0.1);
    let before = tree.segments.len();
    reindex(&mut tree);
    assert_eq!(tree.segments.len(), before);
}
