//! Curvature smoothing for reconstructed trees.
//!
//! Scanned skeletons carry jitter from the reconstruction step. Each
//! iteration pulls every interior tip toward the straight line between its
//! parent and its (radius²-weighted centroidal) child, blended by the
//! segment's radius relative to the trunk, so the thick trunk straightens
//! fully while thin branch tips keep their measured shape.

use log::info;
use nalgebra::Vector3;
use rayon::prelude::*;

use crate::model::{Forest, Tree, TreeError};

/// Iterations applied by [`smooth_forest`] when the caller has no opinion.
pub const DEFAULT_SMOOTH_ITERATIONS: usize = 4;

fn smooth_tree(tree: &mut Tree, iterations: usize) {
    let children = tree.children();
    let full_rad_sqr = tree.segments[0].radius * tree.segments[0].radius;
    if full_rad_sqr <= 0.0 {
        return;
    }
    for _ in 0..iterations {
        let old_tips: Vec<Vector3<f64>> = tree.segments.iter().map(|s| s.tip).collect();
        for i in 1..tree.segments.len() {
            // leaves are thin; leave them where the scan put them
            if children[i].is_empty() {
                continue;
            }
            let parent_tip = old_tips[tree.segments[i].parent as usize];
            let child_tip = if children[i].len() == 1 {
                old_tips[children[i][0]]
            } else {
                // centroid of the child tips, weighted by cross-section
                let mut centroid = Vector3::zeros();
                let mut weight = 0.0;
                for &child in &children[i] {
                    let rad_sqr = tree.segments[child].radius * tree.segments[child].radius;
                    centroid += old_tips[child] * rad_sqr;
                    weight += rad_sqr;
                }
                if weight > 0.0 {
                    centroid /= weight;
                }
                centroid
            };
            let dir = (child_tip - parent_tip).normalize();
            let segment_tip = old_tips[i];
            let straight_tip = parent_tip + dir * (segment_tip - parent_tip).dot(&dir);
            let rad_sqr = tree.segments[i].radius * tree.segments[i].radius;
            let blend = 0.5 * rad_sqr / full_rad_sqr;
            tree.segments[i].tip = segment_tip * (1.0 - blend) + straight_tip * blend;
        }
    }
}

/// Smooths every tree in place. Run more iterations to smooth further; each
/// pass is mild by construction.
pub fn smooth_forest(forest: &mut Forest, iterations: usize) -> Result<(), TreeError> {
    forest.validate()?;
    info!(
        "smoothing {} tree(s), {} iteration(s)",
        forest.trees.len(),
        iterations
    );
    forest
        .trees
        .par_iter_mut()
        .for_each(|tree| smooth_tree(tree, iterations));
    Ok(())
}
