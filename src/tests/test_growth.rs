use approx::assert_abs_diff_eq;

use crate::growth::{grow_forest, BranchingModel, GrowthParams};
use crate::tests::test_helpers::{binary_tree, forest_of, symmetric_fork, vertical_chain};
use crate::tests::PRUNE_LENGTH;

fn params(length_increment: f64) -> GrowthParams {
    GrowthParams {
        length_increment,
        prune_length: PRUNE_LENGTH,
        ..GrowthParams::default()
    }
}

#[test]
fn zero_dominance_gives_symmetric_scale_factors() {
    let model = BranchingModel::derive(2.0, 0.0, 45.0);
    let k = 2.0f64.powf(-0.5);
    assert_abs_diff_eq!(model.k1, model.k2, epsilon = 1e-12);
    assert_abs_diff_eq!(model.k1, k, epsilon = 1e-12);
    assert_abs_diff_eq!(model.angle1, model.angle2, epsilon = 1e-12);
}

#[test]
fn dominance_skews_the_pair_but_preserves_the_scale_product() {
    let model = BranchingModel::derive(2.0, 0.5, 45.0);
    let k = 2.0f64.powf(-0.5);
    assert!(model.k1 > model.k2);
    assert_abs_diff_eq!(model.k1 * model.k2, k * k, epsilon = 1e-12);
    // the dominant child bends away from the parent direction less
    assert!(model.angle1 < model.angle2);
}

#[test]
fn growth_extends_every_leaf() {
    let mut forest = forest_of(vec![binary_tree(4)]);
    let before = forest.num_segments();
    let leaves_before = forest.trees[0]
        .children()
        .iter()
        .filter(|c| c.is_empty())
        .count();
    grow_forest(&mut forest, &params(0.5)).unwrap();
    let tree = &forest.trees[0];
    tree.validate().unwrap();
    assert!(forest.num_segments() > before);
    // every former leaf gained at least one segment
    assert!(forest.num_segments() >= before + leaves_before);
}

#[test]
fn growth_is_deterministic() {
    let mut forest_a = forest_of(vec![binary_tree(4)]);
    let mut forest_b = forest_of(vec![binary_tree(4)]);
    grow_forest(&mut forest_a, &params(0.5)).unwrap();
    grow_forest(&mut forest_b, &params(0.5)).unwrap();
    let (a, b) = (&forest_a.trees[0], &forest_b.trees[0]);
    assert_eq!(a.segments.len(), b.segments.len());
    for (sa, sb) in a.segments.iter().zip(&b.segments) {
        assert_abs_diff_eq!((sa.tip - sb.tip).norm(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(sa.radius, sb.radius, epsilon = 1e-12);
        assert_eq!(sa.parent, sb.parent);
    }
}

#[test]
fn new_bifurcations_conserve_area() {
    let mut forest = forest_of(vec![binary_tree(4)]);
    let before = forest.num_segments();
    grow_forest(&mut forest, &params(2.0)).unwrap();
    let tree = &forest.trees[0];
    let children = tree.children();
    let mut checked = 0;
    for i in before..tree.segments.len() {
        if children[i].len() != 2 {
            continue;
        }
        let r = tree.segments[i].radius;
        let r1 = tree.segments[children[i][0]].radius;
        let r2 = tree.segments[children[i][1]].radius;
        // parents were thickened after synthesis, so allow some slack
        let ratio = (r1 * r1 + r2 * r2) / (r * r);
        assert!((0.5..=1.5).contains(&ratio), "area ratio {}", ratio);
        checked += 1;
    }
    assert!(checked > 0, "increment long enough to force bifurcation");
}

#[test]
fn growth_thickens_the_trunk() {
    let mut forest = forest_of(vec![binary_tree(4)]);
    let trunk_radius_before = forest.trees[0].segments[1].radius;
    grow_forest(&mut forest, &params(0.5)).unwrap();
    assert!(forest.trees[0].segments[1].radius > trunk_radius_before);
}

#[test]
fn growth_raises_the_canopy() {
    let mut forest = forest_of(vec![symmetric_fork()]);
    let height_before = forest.trees[0].height();
    grow_forest(&mut forest, &params(1.0)).unwrap();
    assert!(forest.trees[0].height() > height_before);
}

#[test]
fn negative_increment_shrinks() {
    let mut forest = forest_of(vec![vertical_chain(4, 0.1)]);
    grow_forest(&mut forest, &params(-1.5)).unwrap();
    assert_eq!(forest.trees.len(), 1);
    let tree = &forest.trees[0];
    tree.validate().unwrap();
    assert!(tree.segments.len() < 5);
    assert!(tree.height() < 4.0);
}

#[test]
fn shrinking_past_the_root_drops_the_tree() {
    let mut forest = forest_of(vec![vertical_chain(2, 0.1)]);
    grow_forest(&mut forest, &params(-50.0)).unwrap();
    assert!(forest.trees.is_empty());
}

#[test]
fn shedding_respects_removal_cap() {
    let mut forest = forest_of(vec![binary_tree(6)]);
    let mut p = params(0.5);
    p.shed_tolerance = Some(-10.0); // absurdly eager: everything offends
    grow_forest(&mut forest, &p).unwrap();
    let tree = &forest.trees[0];
    tree.validate().unwrap();
    assert!(!tree.segments.is_empty());
}

#[test]
fn grown_tree_keeps_valid_schema() {
    let mut tree = binary_tree(3);
    tree.add_attribute("section").unwrap();
    let mut forest = forest_of(vec![tree]);
    grow_forest(&mut forest, &params(0.5)).unwrap();
    forest.trees[0].validate().unwrap();
}
