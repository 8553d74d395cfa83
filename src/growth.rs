//! Procedural growth and shedding simulator.
//!
//! Extends every leaf of a measured tree into a synthetic binary subtree
//! whose scale ratios, branch angles and radii are derived from the tree's
//! own allometry (fractal dimension, mean dominance, mean branch angle), so
//! the new growth is statistically indistinguishable from the measured
//! crown. An optional shedding pass then removes branches whose
//! rank-vs-length position violates the measured power law, mimicking
//! natural self-pruning.
//!
//! Negative length increments shrink the tree instead, delegating to the
//! pruning transforms.

use log::{debug, info, warn};
use nalgebra::Vector3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::allometry::{
    bifurcations, branch_lengths, dominant_path, fractal_dimension, summarize_bifurcations,
    AllometryParams,
};
use crate::model::{Forest, Segment, Tree, TreeError, NO_PARENT};
use crate::powerlaw::fit_power_law;
use crate::transform::{self, reindex};

/// Default RNG seed, so repeated runs produce identical forests.
pub const GROWTH_SEED: u64 = 128;

/// Upward bias added to the growth direction at each bifurcation step.
const PHOTOTROPISM: f64 = 0.1;

/// Scale factor ceiling; `k1` at 1 or above would never reach the length
/// floor.
const MAX_SCALE: f64 = 0.95;

/// Fixed-point iterations for the dominance/angle coupling equation.
const ANGLE_ITERATIONS: usize = 20;

/// Branches thinner than this are removed after shrinkage.
const MIN_BRANCH_DIAMETER: f64 = 0.001;

/// Fallback dimension when a tree has too few branch points to measure one.
const DEFAULT_DIMENSION: f64 = 2.0;

/// Fallback total branch angle in degrees for unbranched trees.
const DEFAULT_ANGLE_DEGREES: f64 = 40.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GrowthParams {
    /// Length in metres added to (or, if negative, removed from) every
    /// branch tip.
    pub length_increment: f64,
    /// Minimum modelled branch length; branches shorter than this terminate
    /// as leaves instead of bifurcating.
    pub prune_length: f64,
    /// Radius growth per unit of added length, before scaling by the
    /// trunk's radius-to-length ratio.
    pub growth_rate: f64,
    /// Shedding threshold on the log-rank margin above the fitted power
    /// law. `None` disables shedding.
    pub shed_tolerance: Option<f64>,
    /// Largest fraction of a tree's segments the shedding pass may remove.
    pub shed_max_fraction: f64,
    pub seed: u64,
}

impl Default for GrowthParams {
    fn default() -> Self {
        Self {
            length_increment: 0.3,
            prune_length: 1.0,
            growth_rate: 1.0,
            shed_tolerance: None,
            shed_max_fraction: 0.2,
            seed: GROWTH_SEED,
        }
    }
}

/// Scale factors and angles governing one tree's synthetic bifurcations.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BranchingModel {
    pub(crate) k1: f64,
    pub(crate) k2: f64,
    pub(crate) angle1: f64,
    pub(crate) angle2: f64,
}

impl BranchingModel {
    /// Derives the two-child scale factors from dimension and dominance,
    /// then splits the total branch angle between the children by iterating
    /// `tan(a1) = tan(total − a1)·(k2/k1)²` to its fixed point.
    pub(crate) fn derive(dimension: f64, dominance: f64, total_angle_degrees: f64) -> Self {
        // k is the per-child scale if both children were equal; dominance
        // skews the pair while preserving k1·k2 = k²
        let k = 2.0f64.powf(-1.0 / dimension);
        let dominance = dominance.clamp(0.0, 0.9);
        let q = ((1.0 + dominance) / (1.0 - dominance)).sqrt();
        let mut k1 = (k * q.sqrt()).min(MAX_SCALE);
        let k2 = (k * k / k1).min(k1);
        k1 = (k * k / k2).min(MAX_SCALE);

        let total = total_angle_degrees.to_radians();
        let ratio = (k2 / k1) * (k2 / k1);
        let mut angle1 = 0.5 * total;
        for _ in 0..ANGLE_ITERATIONS {
            angle1 = ((total - angle1).tan() * ratio).atan();
        }
        Self {
            k1,
            k2,
            angle1,
            angle2: total - angle1,
        }
    }
}

/// One pending branch to synthesize: grows out of `parent`'s tip along
/// `direction` with a remaining length budget.
struct GrowthItem {
    parent: usize,
    direction: Vector3<f64>,
    length: f64,
    radius: f64,
}

fn random_perpendicular<R: Rng>(direction: &Vector3<f64>, rng: &mut R) -> Vector3<f64> {
    loop {
        let v = Vector3::new(
            rng.random_range(-1.0..1.0),
            rng.random_range(-1.0..1.0),
            rng.random_range(-1.0..1.0),
        );
        let perp = direction.cross(&v);
        let norm = perp.norm();
        if norm > 1e-6 {
            return perp / norm;
        }
    }
}

/// Extends every leaf of `tree` by `length_increment`, bifurcating per the
/// tree's own branching model. Worklist-driven so crown depth never maps to
/// call-stack depth.
fn grow_tree(tree: &mut Tree, params: &GrowthParams, model: BranchingModel, rng: &mut ChaCha8Rng) {
    let children = tree.children();
    let lengths = branch_lengths(tree, &children, params.prune_length);
    let num_attributes = tree.attribute_names.len();
    let new_segment = |tip, radius, parent: usize| Segment {
        tip,
        radius,
        parent: parent as i32,
        attributes: vec![0.0; num_attributes],
    };
    let mut worklist: Vec<GrowthItem> = (0..tree.segments.len())
        .filter(|&i| children[i].is_empty())
        .map(|i| GrowthItem {
            parent: i,
            direction: tree.segment_direction(i),
            length: lengths[i] + params.length_increment,
            radius: tree.segments[i].radius,
        })
        .collect();

    let radius_scale = (model.k1 * model.k1 + model.k2 * model.k2).sqrt();
    while let Some(item) = worklist.pop() {
        if item.length < params.prune_length {
            // below the floor the branch ends as a new leaf
            let tip = tree.segments[item.parent].tip + item.direction * item.length;
            tree.segments
                .push(new_segment(tip, item.radius, item.parent));
            continue;
        }
        let direction = (item.direction + Vector3::z() * PHOTOTROPISM).normalize();
        let tip = tree.segments[item.parent].tip + direction * (item.length * (1.0 - model.k1));
        let fork = tree.segments.len();
        tree.segments
            .push(new_segment(tip, item.radius, item.parent));

        let perp = random_perpendicular(&direction, rng);
        let dir1 = direction * model.angle1.cos() + perp * model.angle1.sin();
        let dir2 = direction * model.angle2.cos() - perp * model.angle2.sin();
        worklist.push(GrowthItem {
            parent: fork,
            direction: dir1,
            length: item.length * model.k1,
            radius: item.radius * model.k1 / radius_scale,
        });
        worklist.push(GrowthItem {
            parent: fork,
            direction: dir2,
            length: item.length * model.k2,
            radius: item.radius * model.k2 / radius_scale,
        });
    }
}

/// Thickens every leaf by the length-proportional growth rate and carries
/// the added cross-sectional area down every ancestor, so the trunk gains
/// exactly the area its crown gained.
fn thicken(tree: &mut Tree, radius_increment: f64) {
    let children = tree.children();
    for i in 0..tree.segments.len() {
        if !children[i].is_empty() {
            continue;
        }
        let old = tree.segments[i].radius;
        let new = old + radius_increment;
        let area_added = new * new - old * old;
        tree.segments[i].radius = new;
        let mut parent = tree.segments[i].parent;
        while parent != NO_PARENT {
            let r = tree.segments[parent as usize].radius;
            tree.segments[parent as usize].radius = (r * r + area_added).sqrt();
            parent = tree.segments[parent as usize].parent;
        }
    }
}

/// Removes branches whose rank sits further above the fitted
/// rank-vs-length power law than `tolerance` allows. Candidates are
/// sub-branch roots (children of the trunk root or of branch points);
/// smaller subtrees shed first, and at most `max_fraction` of the segments
/// go in one pass.
fn shed(tree: &mut Tree, params: &GrowthParams, tolerance: f64) {
    let children = tree.children();
    let lengths = branch_lengths(tree, &children, params.prune_length);
    let roots: Vec<usize> = (1..tree.segments.len())
        .filter(|&i| {
            let parent = tree.segments[i].parent as usize;
            parent == 0 || children[parent].len() > 1
        })
        .collect();
    if roots.len() < 3 {
        return;
    }
    let sizes: Vec<f64> = roots.iter().map(|&i| lengths[i]).collect();
    let Some(fit) = fit_power_law(&sizes) else {
        return;
    };

    // rank each sub-branch by length descending; the margin is how far the
    // observed rank sits above the predicted rank for that length
    let mut order: Vec<usize> = (0..roots.len()).collect();
    order.sort_by(|&a, &b| sizes[b].total_cmp(&sizes[a]));
    let subtree_sizes = subtree_segment_counts(tree);
    let mut offenders: Vec<(usize, usize)> = Vec::new();
    for (rank0, &idx) in order.iter().enumerate() {
        let rank = (rank0 + 1) as f64;
        let predicted = fit.predicted_count(sizes[idx]).max(1e-10);
        if rank.ln() - predicted.ln() > tolerance {
            offenders.push((subtree_sizes[roots[idx]], roots[idx]));
        }
    }
    if offenders.is_empty() {
        return;
    }
    offenders.sort_unstable();

    let budget = (params.shed_max_fraction * tree.segments.len() as f64) as usize;
    let mut removed = 0usize;
    for (size, root) in offenders {
        if removed + size > budget {
            break;
        }
        debug!("shedding branch at segment {} ({} segment(s))", root, size);
        tree.segments[root].parent = NO_PARENT;
        removed += size;
    }
    if removed == 0 {
        return;
    }
    reindex(tree);
    rebuild_interior_radii(tree);
}

fn subtree_segment_counts(tree: &Tree) -> Vec<usize> {
    let mut counts = vec![1usize; tree.segments.len()];
    for i in (1..tree.segments.len()).rev() {
        let parent = tree.segments[i].parent as usize;
        counts[parent] += counts[i];
    }
    counts
}

/// After shedding, interior radii are recomputed bottom-up from the
/// surviving children's cross-sectional areas, shrinking only.
fn rebuild_interior_radii(tree: &mut Tree) {
    let mut areas = vec![0.0f64; tree.segments.len()];
    for i in (1..tree.segments.len()).rev() {
        let parent = tree.segments[i].parent as usize;
        let r = tree.segments[i].radius.max(areas[i].sqrt());
        areas[parent] += r * r;
    }
    for i in 0..tree.segments.len() {
        if areas[i] > 0.0 {
            let shrunk = areas[i].sqrt();
            if shrunk < tree.segments[i].radius {
                tree.segments[i].radius = shrunk;
            }
        }
    }
}

/// Grows (or shrinks) every tree in the forest by the configured length
/// increment. Positive increments synthesize new crown growth and thicken
/// the tree; negative increments prune length from the tips and then strip
/// branches thinner than the minimum diameter.
pub fn grow_forest(forest: &mut Forest, params: &GrowthParams) -> Result<(), TreeError> {
    forest.validate()?;
    if params.length_increment < 0.0 {
        info!(
            "shrinking {} tree(s) by {:.3} m",
            forest.trees.len(),
            -params.length_increment
        );
        let pruned = transform::prune_length(forest, -params.length_increment)?;
        *forest = transform::prune_diameter(&pruned, MIN_BRANCH_DIAMETER)?;
        return Ok(());
    }
    info!(
        "growing {} tree(s) by {:.3} m",
        forest.trees.len(),
        params.length_increment
    );
    forest
        .trees
        .par_iter_mut()
        .enumerate()
        .for_each(|(index, tree)| {
            let mut rng = ChaCha8Rng::seed_from_u64(params.seed.wrapping_add(index as u64));
            let children = tree.children();
            let lengths = branch_lengths(tree, &children, params.prune_length);
            let points = bifurcations(tree, &children);
            let summary = summarize_bifurcations(&points);
            let min_branch_points = AllometryParams::default().min_branch_points;
            let dimension =
                fractal_dimension(&children, &lengths, min_branch_points).unwrap_or(DEFAULT_DIMENSION);
            let (dominance, angle) = if summary.total_weight > 0.0 {
                (summary.mean_dominance, summary.mean_angle)
            } else {
                warn!("tree {} has no bifurcations, growing with defaults", index);
                (0.0, DEFAULT_ANGLE_DEGREES)
            };
            let model = BranchingModel::derive(dimension, dominance, angle);

            let path = dominant_path(tree, &children, &lengths);
            let dominant_length: f64 = path.iter().map(|&i| tree.segment_length(i)).sum();
            let trunk_radius = tree.segments[path.get(1).copied().unwrap_or(0)].radius;

            grow_tree(tree, params, model, &mut rng);

            if dominant_length > 0.0 {
                let radius_increment =
                    params.growth_rate * params.length_increment * trunk_radius / dominant_length;
                thicken(tree, radius_increment);
            }

            if let Some(tolerance) = params.shed_tolerance {
                shed(tree, params, tolerance);
            }
        });
    Ok(())
}
