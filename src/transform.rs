//! Topology-preserving transforms: diameter pruning, length pruning and
//! segment decimation.
//!
//! All three share one pattern: a bottom-up pass computes a per-segment
//! scalar, then the tree is rebuilt top-down keeping only segments that pass
//! a threshold, remapping every survivor's parent to the nearest surviving
//! ancestor's new index. The result is always a valid rooted tree.
//!
//! Pruning returns a *new* forest rather than mutating in place, so callers
//! can compare before and after; a tree the pruning reduces to its root
//! alone is dropped from the output entirely. A tree that was root-only to
//! begin with is passed through unchanged.

use log::{debug, info, warn};
use rayon::prelude::*;

use crate::model::{Forest, Tree, TreeError, NO_PARENT};

const BLEND_FLOOR: f64 = 1e-10;

/// Bottom-up max-diameter propagation: from every leaf, walk toward the root
/// carrying `max(own diameter, subtree max so far)`, stopping as soon as the
/// carried value would not increase the parent's stored maximum. The stored
/// values only ever grow, so the early stop loses nothing.
pub(crate) fn max_diameters(tree: &Tree, children: &[Vec<usize>]) -> Vec<f64> {
    let n = tree.segments.len();
    let mut max_diameter = vec![0.0f64; n];
    for i in 0..n {
        if !children[i].is_empty() {
            continue;
        }
        let mut child = i;
        max_diameter[child] = 2.0 * tree.segments[child].radius;
        let mut parent = tree.segments[i].parent;
        while parent != NO_PARENT {
            let p = parent as usize;
            let diameter = max_diameter[child].max(2.0 * tree.segments[p].radius);
            if diameter > max_diameter[p] {
                max_diameter[p] = diameter;
            } else {
                break;
            }
            child = p;
            parent = tree.segments[p].parent;
        }
    }
    max_diameter
}

/// Bottom-up minimum distance to any leaf (0 at leaves), with the same
/// early-stop: propagation halts once it stops improving the parent's value.
pub(crate) fn min_lengths_from_leaf(tree: &Tree, children: &[Vec<usize>]) -> Vec<f64> {
    let n = tree.segments.len();
    let mut min_length = vec![f64::MAX; n];
    for i in 0..n {
        if !children[i].is_empty() {
            continue;
        }
        min_length[i] = 0.0;
        let mut child = i;
        let mut parent = tree.segments[i].parent;
        while parent != NO_PARENT {
            let p = parent as usize;
            let distance = (tree.segments[p].tip - tree.segments[child].tip).norm();
            let new_dist = min_length[child] + distance;
            if new_dist < min_length[p] {
                min_length[p] = new_dist;
            } else {
                break;
            }
            child = p;
            parent = tree.segments[p].parent;
        }
    }
    min_length
}

fn prune_tree_diameter(tree: &Tree, diameter_threshold: f64) -> Option<Tree> {
    let children = tree.children();
    let max_diameter = max_diameters(tree, &children);

    let mut new_index = vec![0i32; tree.segments.len()];
    let mut new_tree = Tree {
        segments: vec![tree.segments[0].clone()],
        attribute_names: tree.attribute_names.clone(),
        tree_attribute_names: tree.tree_attribute_names.clone(),
        tree_attributes: tree.tree_attributes.clone(),
    };
    for i in 1..tree.segments.len() {
        if max_diameter[i] > 0.01 * diameter_threshold {
            new_index[i] = new_tree.segments.len() as i32;
            let mut segment = tree.segments[i].clone();
            segment.parent = new_index[segment.parent as usize];
            new_tree.segments.push(segment);
        } else {
            new_index[i] = new_index[tree.segments[i].parent as usize];
        }
    }
    // a tree that was root-only on input stays; only trees the pruning
    // reduced to their root are dropped
    if tree.segments.len() > 1 && new_tree.segments.len() == 1 {
        None
    } else {
        Some(new_tree)
    }
}

fn prune_tree_length(tree: &Tree, length_threshold: f64) -> Option<Tree> {
    let children = tree.children();
    let min_length = min_lengths_from_leaf(tree, &children);

    let mut new_index = vec![0i32; tree.segments.len()];
    let mut new_tree = Tree {
        segments: vec![tree.segments[0].clone()],
        attribute_names: tree.attribute_names.clone(),
        tree_attribute_names: tree.tree_attribute_names.clone(),
        tree_attributes: tree.tree_attributes.clone(),
    };
    for i in 1..tree.segments.len() {
        let parent = tree.segments[i].parent as usize;
        if min_length[i] > length_threshold {
            new_index[i] = new_tree.segments.len() as i32;
            let mut segment = tree.segments[i].clone();
            segment.parent = new_index[parent];
            new_tree.segments.push(segment);
        } else if min_length[parent] > length_threshold {
            // the parent survives but this segment does not: blend the tip
            // toward the parent so the cut lands exactly at the threshold
            // distance from the nearest leaf
            let blend = ((min_length[parent] - length_threshold)
                / (min_length[parent] - min_length[i]).max(BLEND_FLOOR))
            .clamp(BLEND_FLOOR, 1.0);
            let mut segment = tree.segments[i].clone();
            segment.tip =
                tree.segments[parent].tip + (segment.tip - tree.segments[parent].tip) * blend;
            new_index[i] = new_tree.segments.len() as i32;
            segment.parent = new_index[parent];
            new_tree.segments.push(segment);
        } else {
            new_index[i] = new_index[parent];
        }
    }
    if tree.segments.len() > 1 && new_tree.segments.len() == 1 {
        None
    } else {
        Some(new_tree)
    }
}

/// Prunes every branch whose propagated maximum diameter falls below the
/// threshold. Trees reduced to their root are dropped from the output.
pub fn prune_diameter(forest: &Forest, diameter_threshold: f64) -> Result<Forest, TreeError> {
    forest.validate()?;
    info!(
        "pruning {} tree(s) by diameter {:.4}",
        forest.trees.len(),
        diameter_threshold
    );
    let trees: Vec<Tree> = forest
        .trees
        .par_iter()
        .filter_map(|tree| prune_tree_diameter(tree, diameter_threshold))
        .collect();
    if trees.len() < forest.trees.len() {
        warn!(
            "diameter pruning removed {} tree(s) entirely",
            forest.trees.len() - trees.len()
        );
    }
    Ok(Forest {
        trees,
        comments: forest.comments.clone(),
    })
}

/// Prunes every branch whose minimum distance to a leaf falls below the
/// threshold, interpolating the boundary segments for a clean cut.
pub fn prune_length(forest: &Forest, length_threshold: f64) -> Result<Forest, TreeError> {
    forest.validate()?;
    info!(
        "pruning {} tree(s) by length {:.4}",
        forest.trees.len(),
        length_threshold
    );
    let trees: Vec<Tree> = forest
        .trees
        .par_iter()
        .filter_map(|tree| prune_tree_length(tree, length_threshold))
        .collect();
    if trees.len() < forest.trees.len() {
        warn!(
            "length pruning removed {} tree(s) entirely",
            forest.trees.len() - trees.len()
        );
    }
    Ok(Forest {
        trees,
        comments: forest.comments.clone(),
    })
}

fn decimate_tree(tree: &Tree, stride: usize) -> Tree {
    let children = tree.children();
    let mut new_index = vec![0i32; tree.segments.len()];
    let mut counts = vec![0usize; tree.segments.len()];
    let mut new_tree = Tree {
        segments: vec![tree.segments[0].clone()],
        attribute_names: tree.attribute_names.clone(),
        tree_attribute_names: tree.tree_attribute_names.clone(),
        tree_attributes: tree.tree_attributes.clone(),
    };
    for i in 1..tree.segments.len() {
        let parent = tree.segments[i].parent as usize;
        counts[i] = counts[parent] + 1;
        // branch points and leaves are always kept so decimation cannot
        // change the topology or the branch endpoints
        if counts[i] == stride || children[i].len() > 1 || children[i].is_empty() {
            new_index[i] = new_tree.segments.len() as i32;
            let mut segment = tree.segments[i].clone();
            segment.parent = new_index[parent];
            new_tree.segments.push(segment);
            counts[i] = 0;
        } else {
            new_index[i] = new_index[parent];
        }
    }
    new_tree
}

/// Keeps every `stride`-th segment along unbranched runs; branch points and
/// leaves are kept regardless of their position in the run.
pub fn decimate(forest: &Forest, stride: usize) -> Result<Forest, TreeError> {
    assert!(stride > 0, "decimation stride must be positive");
    forest.validate()?;
    info!(
        "decimating {} tree(s) to every {} segment(s)",
        forest.trees.len(),
        stride
    );
    Ok(Forest {
        trees: forest
            .trees
            .par_iter()
            .map(|tree| decimate_tree(tree, stride))
            .collect(),
        comments: forest.comments.clone(),
    })
}

/// Removes single-child segments shorter than `ratio × diameter`, splicing
/// each removed segment's child directly onto its parent, then compacts the
/// array with [`reindex`].
pub fn decimate_by_ratio(forest: &Forest, ratio: f64) -> Result<Forest, TreeError> {
    forest.validate()?;
    info!(
        "decimating {} tree(s) by length/diameter ratio {:.2}",
        forest.trees.len(),
        ratio
    );
    let trees = forest
        .trees
        .par_iter()
        .map(|tree| {
            let mut tree = tree.clone();
            let children = tree.children();
            for i in 1..tree.segments.len() {
                if children[i].len() != 1 {
                    continue;
                }
                let length = tree.segment_length(i);
                if length < ratio * 2.0 * tree.segments[i].radius {
                    // splice the child onto this segment's parent, then mark
                    // this segment for removal
                    let parent = tree.segments[i].parent;
                    tree.segments[children[i][0]].parent = parent;
                    tree.segments[i].parent = NO_PARENT;
                }
            }
            reindex(&mut tree);
            tree
        })
        .collect();
    Ok(Forest {
        trees,
        comments: forest.comments.clone(),
    })
}

/// Compacts the segment array, dropping every non-root segment marked with
/// the `NO_PARENT` sentinel together with any descendants still parented to
/// a dropped segment, and remaps surviving parents to new indices.
///
/// Callers that only want to cut one segment out of a chain must re-parent
/// its children before marking it; callers removing whole subtrees mark just
/// the subtree root and let the cascade do the rest.
pub fn reindex(tree: &mut Tree) {
    let n = tree.segments.len();
    let mut keep = vec![true; n];
    for i in 1..n {
        let parent = tree.segments[i].parent;
        keep[i] = parent != NO_PARENT && keep[parent as usize];
    }
    let removed = keep.iter().filter(|&&k| !k).count();
    if removed == 0 {
        return;
    }
    debug!("reindex: removing {} of {} segment(s)", removed, n);

    let mut new_index = vec![0i32; n];
    let mut segments = Vec::with_capacity(n - removed);
    for (i, segment) in tree.segments.drain(..).enumerate() {
        if keep[i] {
            new_index[i] = segments.len() as i32;
            let mut segment = segment;
            if i > 0 {
                segment.parent = new_index[segment.parent as usize];
            }
            segments.push(segment);
        }
    }
    tree.segments = segments;
}
