//! Allometry analyzer: independent traversal passes deriving per-segment and
//! per-tree statistics from the segment hierarchy.
//!
//! Every pass takes the precomputed children list. Per-segment outputs are
//! written into named attributes (resolved once per tree, never by assumed
//! ordering); per-tree outputs land in the tree attribute table. The
//! aggregate entry point is [`analyse_forest`], which runs all passes over
//! every tree in parallel and returns forest-wide summary statistics.
//!
//! Statistics derived per tree:
//! - branch length from each segment's base to its farthest leaf (greedy
//!   monotonic propagation, see [`branch_lengths`])
//! - dominance and branching angle at every bifurcation
//! - trunk bend (RMS deviation of the dominant path from a fitted line)
//! - diameter at breast height (DBH)
//! - monocotal (palm-likeness) score
//! - fractal dimension of the branch length distribution
//! - woody volume, diameter, strength and minimum strength to root

use log::{debug, info, trace, warn};
use nalgebra::{Vector2, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::model::{Forest, Tree, TreeError, NO_PARENT};
use crate::powerlaw::{fit_power_law, PowerLaw};

const DENOM_FLOOR: f64 = 1e-10;

/// Per-segment attribute names appended by [`analyse_forest`], in order.
pub const SEGMENT_ATTRIBUTES: [&str; 9] = [
    "volume",
    "diameter",
    "length",
    "strength",
    "min_strength",
    "dominance",
    "angle",
    "children",
    "dimension",
];

/// Per-tree attribute names appended by [`analyse_forest`], in order.
pub const TREE_ATTRIBUTES: [&str; 5] = ["height", "dbh", "monocotal", "bend", "dimension"];

/// Tunable constants for the analysis passes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AllometryParams {
    /// Length assigned to every leaf, standing in for the unmeasured twig
    /// beyond the reconstruction's resolution.
    pub prune_length: f64,
    /// Height above the base at which DBH is measured. 1.3 m is the
    /// forestry standard.
    pub breast_height: f64,
    /// A subtree with fewer branch points than this is a bare pole, not
    /// evidence of palm-like growth.
    pub min_monocotal_branches: usize,
    /// Minimum number of branch points for a meaningful power-law fit.
    pub min_branch_points: usize,
}

impl Default for AllometryParams {
    fn default() -> Self {
        Self {
            prune_length: 1.0,
            breast_height: 1.3,
            min_monocotal_branches: 5,
            min_branch_points: 6,
        }
    }
}

/// One bifurcation: the two largest-radius children compared.
#[derive(Debug, Clone, Copy)]
pub struct BifurcationPoint {
    pub segment: usize,
    /// `−1 + 2·r₁²/(r₁²+r₂²)`: 0 for co-dominant branches, toward 1 as one
    /// branch dominates.
    pub dominance: f64,
    /// Angle between the two children's directions, degrees.
    pub angle_degrees: f64,
    /// `√(r₁²+r₂²)`; used to weight tree-wide means without letting the
    /// thick trunk bifurcation swamp them.
    pub weight: f64,
    pub num_children: usize,
}

/// Weighted tree-wide means over all bifurcation points.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BifurcationSummary {
    pub mean_dominance: f64,
    pub mean_angle: f64,
    pub mean_children: f64,
    pub total_weight: f64,
}

/// Branch length from each segment's base to its farthest leaf.
///
/// Each leaf starts at the prune-length constant, then walks upward
/// accumulating tip-to-tip distance, stopping at the first ancestor whose
/// stored value is already at least the propagated one. The short-circuit is
/// a deliberate greedy approximation of longest-path; it can err slightly low
/// on some topologies but keeps the pass effectively linear. The root's
/// length is the max over its direct children.
pub fn branch_lengths(tree: &Tree, children: &[Vec<usize>], prune_length: f64) -> Vec<f64> {
    let n = tree.segments.len();
    let mut lengths = vec![0.0; n];
    for leaf in 0..n {
        if !children[leaf].is_empty() {
            continue;
        }
        lengths[leaf] = prune_length;
        let mut child = leaf;
        let mut i = leaf;
        let mut j = tree.segments[leaf].parent;
        while j != NO_PARENT {
            let dist = lengths[child]
                + (tree.segments[i].tip - tree.segments[j as usize].tip).norm();
            if dist > lengths[i] {
                lengths[i] = dist;
            } else {
                break;
            }
            child = i;
            i = j as usize;
            j = tree.segments[i].parent;
        }
    }
    for &c in &children[0] {
        lengths[0] = lengths[0].max(lengths[c]);
    }
    lengths
}

/// Finds every segment with more than one child and measures its dominance
/// and branching angle.
///
/// Radius and direction are noisy immediately after a bifurcation, so when a
/// child itself has exactly one child we look one hop further for both.
pub fn bifurcations(tree: &Tree, children: &[Vec<usize>]) -> Vec<BifurcationPoint> {
    let mut points = Vec::new();
    for i in 1..tree.segments.len() {
        if children[i].len() < 2 {
            continue;
        }
        let mut max_rad = -1.0;
        let mut second_max = -1.0;
        let mut dir1 = Vector3::zeros();
        let mut dir2 = Vector3::zeros();
        for &child in &children[i] {
            let mut rad = tree.segments[child].radius;
            let mut dir = tree.segments[child].tip - tree.segments[i].tip;
            if children[child].len() == 1 {
                let grandchild = children[child][0];
                rad = tree.segments[grandchild].radius;
                dir = tree.segments[grandchild].tip - tree.segments[child].tip;
            }
            if rad > max_rad {
                second_max = max_rad;
                max_rad = rad;
                dir2 = dir1;
                dir1 = dir;
            } else if rad > second_max {
                second_max = rad;
                dir2 = dir;
            }
        }
        let weight_area = max_rad * max_rad + second_max * second_max;
        let dominance = -1.0 + 2.0 * max_rad * max_rad / weight_area.max(DENOM_FLOOR);
        let angle_degrees = dir1.cross(&dir2).norm().atan2(dir1.dot(&dir2)).to_degrees();
        points.push(BifurcationPoint {
            segment: i,
            dominance,
            angle_degrees,
            weight: weight_area.max(0.0).sqrt(),
            num_children: children[i].len(),
        });
    }
    points
}

/// Weighted means over the bifurcation points; all zeros for an unbranched
/// tree (`total_weight == 0`).
pub fn summarize_bifurcations(points: &[BifurcationPoint]) -> BifurcationSummary {
    let mut summary = BifurcationSummary {
        mean_dominance: 0.0,
        mean_angle: 0.0,
        mean_children: 0.0,
        total_weight: 0.0,
    };
    for p in points {
        summary.mean_dominance += p.weight * p.dominance;
        summary.mean_angle += p.weight * p.angle_degrees;
        summary.mean_children += p.weight * p.num_children as f64;
        summary.total_weight += p.weight;
    }
    if summary.total_weight > 0.0 {
        summary.mean_dominance /= summary.total_weight;
        summary.mean_angle /= summary.total_weight;
        summary.mean_children /= summary.total_weight;
    }
    summary
}

/// Follows the dominant path from the root: at each branch point take the
/// child maximizing `radius × branch length`.
pub fn dominant_path(tree: &Tree, children: &[Vec<usize>], lengths: &[f64]) -> Vec<usize> {
    let mut path = vec![0usize];
    loop {
        let last = *path.last().expect("path starts non-empty");
        let mut max_score = -1.0;
        let mut largest_child = None;
        for &child in &children[last] {
            let score = tree.segments[child].radius * lengths[child];
            if score > max_score {
                max_score = score;
                largest_child = Some(child);
            }
        }
        match largest_child {
            Some(child) => path.push(child),
            None => break,
        }
    }
    path
}

/// Trunk bend: radius²-weighted RMS deviation of the dominant path from its
/// fitted 3D line, divided by the path's root-to-tip distance.
///
/// The horizontal axes are regressed against height, weighted by radius², so
/// the thick lower trunk anchors the line. A degenerate path (two points or
/// fewer) has zero bend by definition.
pub fn trunk_bend(tree: &Tree, path: &[usize]) -> f64 {
    if path.len() <= 2 {
        return 0.0;
    }
    let length = (tree.segments[0].tip - tree.segments[*path.last().unwrap()].tip).norm();

    let mut total_weight = DENOM_FLOOR;
    let mut mean = Vector3::zeros();
    for &id in path {
        let seg = &tree.segments[id];
        let w = seg.radius * seg.radius;
        total_weight += w;
        mean += w * seg.tip;
    }
    mean /= total_weight;

    // accumulators for the least-squares line of best fit
    let mut sum_x = 0.0;
    let mut sum_y = Vector2::zeros();
    let mut sum_xy = Vector2::zeros();
    let mut sum_x2 = 0.0;
    for &id in path {
        let seg = &tree.segments[id];
        let to_point = seg.tip - mean;
        let offset = Vector2::new(to_point.x, to_point.y);
        let w = seg.radius * seg.radius;
        let h = to_point.z;
        sum_x += h * w;
        sum_y += offset * w;
        sum_xy += h * offset * w;
        sum_x2 += h * h * w;
    }

    let mut sxy = sum_xy - sum_x * sum_y / total_weight;
    let sxx = sum_x2 - sum_x * sum_x / total_weight;
    if sxx.abs() > DENOM_FLOOR {
        sxy /= sxx;
    }
    let grad = Vector3::new(sxy.x, sxy.y, 1.0);

    // sigma relative to the fitted line, horizontal deviation only
    let mut variance = 0.0;
    for &id in path {
        let seg = &tree.segments[id];
        let h = seg.tip.z - mean.z;
        let pos = mean + grad * h;
        let mut dif = pos - seg.tip;
        dif.z = 0.0;
        variance += dif.norm_squared() * seg.radius * seg.radius;
    }
    variance /= total_weight;
    variance.sqrt() / length.max(DENOM_FLOOR)
}

/// Diameter at breast height, averaged over every root child whose
/// largest-radius walk reaches breast height.
///
/// The crossing segment's radius is interpolated toward its parent's only
/// when the walk did not pass a branch point into it; interpolating across a
/// branch point is not geometrically meaningful, so the crossing segment's
/// own radius is used unmodified there.
pub fn dbh(tree: &Tree, children: &[Vec<usize>], breast_height: f64) -> Option<f64> {
    let target = tree.segments[0].tip.z + breast_height;
    let mut total = 0.0;
    let mut count = 0usize;
    for &root_child in &children[0] {
        let mut prev = 0usize;
        let mut cur = root_child;
        let mut just_branched = children[0].len() > 1;
        loop {
            if tree.segments[cur].tip.z >= target {
                let radius = if just_branched {
                    tree.segments[cur].radius
                } else {
                    let z0 = tree.segments[prev].tip.z;
                    let z1 = tree.segments[cur].tip.z;
                    let t = ((target - z0) / (z1 - z0).max(DENOM_FLOOR)).clamp(0.0, 1.0);
                    tree.segments[prev].radius * (1.0 - t) + tree.segments[cur].radius * t
                };
                total += 2.0 * radius;
                count += 1;
                break;
            }
            let next = children[cur]
                .iter()
                .copied()
                .max_by(|&a, &b| {
                    tree.segments[a]
                        .radius
                        .partial_cmp(&tree.segments[b].radius)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            match next {
                Some(child) => {
                    just_branched = children[cur].len() > 1;
                    prev = cur;
                    cur = child;
                }
                None => break, // tree tops out below breast height
            }
        }
    }
    if count > 0 {
        Some(total / count as f64)
    } else {
        None
    }
}

/// Monocotal (palm-likeness) score: one candidate per root child, since many
/// palms grow from a single point at the bottom; the tree takes the max.
///
/// A straight trunk with little height between the first branch point and
/// the peak scores near 1. Sparse subtrees are forced to zero: a long bare
/// pole is not evidence of palm-like growth even when dead.
pub fn monocotal_score(tree: &Tree, children: &[Vec<usize>], min_branches: usize) -> f64 {
    let mut max_monocotal: f64 = 0.0;
    for &root_child in &children[0] {
        // walk the unbranched chain to the first branch point
        let mut segment = root_child;
        while children[segment].len() == 1 {
            segment = children[segment][0];
        }
        let branch_point = tree.segments[segment].tip;
        let straight_distance = (branch_point - tree.segments[0].tip).norm();

        let top_segment = segment;
        let mut path_length = 0.0;
        let mut s = segment;
        while tree.segments[s].parent != NO_PARENT {
            let parent = tree.segments[s].parent as usize;
            path_length += (tree.segments[s].tip - tree.segments[parent].tip).norm();
            s = parent;
        }

        let mut list = vec![root_child];
        let mut max_height = tree.segments[top_segment].tip.z;
        let mut num_branches = 0usize;
        let mut i = 0;
        while i < list.len() {
            let id = list[i];
            max_height = max_height.max(tree.segments[id].tip.z);
            if children[id].len() > 1 {
                num_branches += children[id].len();
            }
            list.extend_from_slice(&children[id]);
            i += 1;
        }
        let dist_to_top = max_height - tree.segments[top_segment].tip.z;

        let mut monocotal = straight_distance / (path_length + dist_to_top).max(DENOM_FLOOR);
        if num_branches < min_branches {
            monocotal = 0.0;
        }
        max_monocotal = max_monocotal.max(monocotal);
    }
    max_monocotal
}

/// Fractal dimension of the branch length distribution: `min(−d, 3)` from a
/// rank-size power-law fit over every branch point's subtree length. `None`
/// when too few branch points exist for the fit to mean anything.
pub fn fractal_dimension(
    children: &[Vec<usize>],
    lengths: &[f64],
    min_branch_points: usize,
) -> Option<f64> {
    let samples: Vec<f64> = (0..children.len())
        .filter(|&i| children[i].len() > 1)
        .map(|i| lengths[i])
        .collect();
    if samples.len() < min_branch_points {
        debug!(
            "fractal dimension skipped: {} branch point(s), need {}",
            samples.len(),
            min_branch_points
        );
        return None;
    }
    let fit = fit_power_law(&samples)?;
    Some((-fit.d).min(3.0))
}

/// Mean/min/max of one per-tree metric across a forest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Range {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct RangeAcc {
    total: f64,
    min: f64,
    max: f64,
    count: usize,
}

impl RangeAcc {
    fn new() -> Self {
        Self {
            total: 0.0,
            min: f64::MAX,
            max: f64::MIN,
            count: 0,
        }
    }

    fn add(&mut self, value: f64) {
        self.total += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.count += 1;
    }

    fn range(&self) -> Range {
        if self.count == 0 {
            return Range {
                mean: 0.0,
                min: 0.0,
                max: 0.0,
            };
        }
        Range {
            mean: self.total / self.count as f64,
            min: self.min,
            max: self.max,
        }
    }
}

/// Forest-wide summary statistics computed by [`analyse_forest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestStats {
    pub num_trees: usize,
    /// Trees with at least one bifurcation; dominance/angle means only draw
    /// from these.
    pub num_branched_trees: usize,
    pub total_volume: f64,
    pub volume: Range,
    pub trunk_diameter: Range,
    pub height: Range,
    pub strength: Range,
    pub dominance: Range,
    pub angle: Range,
    pub bend: Range,
    pub children: Range,
    pub dimension: Range,
    /// `count(trunk diameter ≥ x)` across trees.
    pub trunk_power_law: Option<PowerLaw>,
    /// `count(tree length ≥ x)` across trees.
    pub length_power_law: Option<PowerLaw>,
    /// `count(branch length ≥ x)` across every branch point in the forest.
    pub branch_power_law: Option<PowerLaw>,
}

/// A single tree's contribution to the forest aggregation.
struct TreeSummary {
    volume: f64,
    diameter: f64,
    height: f64,
    strength: f64,
    length: f64,
    bend: f64,
    bifurcation: BifurcationSummary,
    dimension: Option<f64>,
    branch_lengths: Vec<f64>,
}

/// Runs every analysis pass over one tree, appending the per-segment and
/// per-tree attributes in place.
fn analyse_tree(tree: &mut Tree, params: &AllometryParams) -> Result<TreeSummary, TreeError> {
    tree.validate()?;
    let children = tree.children();

    let mut ids = [0usize; SEGMENT_ATTRIBUTES.len()];
    for (slot, name) in ids.iter_mut().zip(SEGMENT_ATTRIBUTES) {
        *slot = tree.add_attribute(name)?;
    }
    let [volume_id, diameter_id, length_id, strength_id, min_strength_id, dominance_id, angle_id, children_id, dimension_id] =
        ids;

    // branch lengths
    let lengths = branch_lengths(tree, &children, params.prune_length);
    for (segment, &length) in tree.segments.iter_mut().zip(&lengths) {
        segment.attributes[length_id] = length;
    }

    // bifurcation dominance and angles
    let points = bifurcations(tree, &children);
    for p in &points {
        let attrs = &mut tree.segments[p.segment].attributes;
        attrs[dominance_id] = p.dominance;
        attrs[angle_id] = p.angle_degrees;
        attrs[children_id] = p.num_children as f64;
    }
    let summary = summarize_bifurcations(&points);
    tree.segments[0].attributes[dominance_id] = summary.mean_dominance;
    tree.segments[0].attributes[angle_id] = summary.mean_angle;
    tree.segments[0].attributes[children_id] = summary.mean_children;

    // trunk bend along the dominant path
    let path = dominant_path(tree, &children, &lengths);
    let bend = trunk_bend(tree, &path);

    // per-segment volume, diameter and strength
    let mut tree_volume = 0.0;
    let mut tree_diameter = 0.0f64;
    for i in 1..tree.segments.len() {
        let length = tree.segment_length(i);
        let radius = tree.segments[i].radius;
        let volume = std::f64::consts::PI * length * radius * radius;
        let diameter = 2.0 * radius;
        let attrs = &mut tree.segments[i].attributes;
        attrs[volume_id] = volume;
        attrs[diameter_id] = diameter;
        attrs[strength_id] = diameter.powf(0.75) / lengths[i].max(DENOM_FLOOR);
        tree_volume += volume;
        tree_diameter = tree_diameter.max(diameter);
    }
    tree.segments[0].attributes[volume_id] = tree_volume;
    tree.segments[0].attributes[diameter_id] = tree_diameter;
    let tree_strength = tree_diameter.powf(0.75) / lengths[0].max(DENOM_FLOOR);
    tree.segments[0].attributes[strength_id] = tree_strength;

    // minimum strength from root to each segment, top-down. The trunk
    // strength does not cap its children, so the root seeds the walk with
    // an unbounded value and gets its own strength afterwards.
    tree.segments[0].attributes[min_strength_id] = f64::MAX;
    let mut stack: Vec<usize> = children[0].clone();
    while let Some(i) = stack.pop() {
        let parent = tree.segments[i].parent as usize;
        let parent_min = tree.segments[parent].attributes[min_strength_id];
        let own = tree.segments[i].attributes[strength_id];
        tree.segments[i].attributes[min_strength_id] = own.min(parent_min);
        stack.extend_from_slice(&children[i]);
    }
    tree.segments[0].attributes[min_strength_id] = tree_strength;

    // fractal dimension from the branch length distribution
    let dimension = fractal_dimension(&children, &lengths, params.min_branch_points);
    if let Some(dim) = dimension {
        for segment in &mut tree.segments {
            segment.attributes[dimension_id] = dim;
        }
    }

    let tree_dbh = dbh(tree, &children, params.breast_height);
    let monocotal = monocotal_score(tree, &children, params.min_monocotal_branches);

    tree.add_tree_attribute("height", tree.height())?;
    tree.add_tree_attribute("dbh", tree_dbh.unwrap_or(0.0))?;
    tree.add_tree_attribute("monocotal", monocotal)?;
    tree.add_tree_attribute("bend", bend)?;
    tree.add_tree_attribute("dimension", dimension.unwrap_or(0.0))?;

    let branch_lengths_at_points: Vec<f64> = points.iter().map(|p| lengths[p.segment]).collect();
    Ok(TreeSummary {
        volume: tree_volume,
        diameter: tree_diameter,
        height: tree.height(),
        strength: tree_strength,
        length: lengths[0],
        bend,
        bifurcation: summary,
        dimension,
        branch_lengths: branch_lengths_at_points,
    })
}

/// Analyses every tree in the forest in parallel, appending attributes in
/// place, and aggregates forest-wide statistics.
///
/// Fails if any tree violates the topology invariant or already carries one
/// of the attribute names this pass would add.
pub fn analyse_forest(
    forest: &mut Forest,
    params: &AllometryParams,
) -> Result<ForestStats, TreeError> {
    info!("analysing {} tree(s)", forest.trees.len());
    let summaries: Vec<TreeSummary> = forest
        .trees
        .par_iter_mut()
        .map(|tree| analyse_tree(tree, params))
        .collect::<Result<_, _>>()?;

    let mut total_volume = 0.0;
    let mut volume = RangeAcc::new();
    let mut diameter = RangeAcc::new();
    let mut height = RangeAcc::new();
    let mut strength = RangeAcc::new();
    let mut dominance = RangeAcc::new();
    let mut angle = RangeAcc::new();
    let mut bend = RangeAcc::new();
    let mut children = RangeAcc::new();
    let mut dimension = RangeAcc::new();
    let mut trunk_diameters = Vec::with_capacity(summaries.len());
    let mut tree_lengths = Vec::with_capacity(summaries.len());
    let mut all_branch_lengths = Vec::new();
    let mut num_branched = 0usize;

    for (tree, summary) in forest.trees.iter().zip(&summaries) {
        total_volume += summary.volume;
        volume.add(summary.volume);
        diameter.add(summary.diameter);
        height.add(summary.height);
        strength.add(summary.strength);
        bend.add(summary.bend);
        if summary.bifurcation.total_weight > 0.0 {
            num_branched += 1;
            dominance.add(summary.bifurcation.mean_dominance);
            angle.add(summary.bifurcation.mean_angle);
            children.add(summary.bifurcation.mean_children);
        }
        if let Some(dim) = summary.dimension {
            dimension.add(dim);
        }
        trunk_diameters.push(2.0 * tree.segments[0].radius);
        tree_lengths.push(summary.length);
        all_branch_lengths.extend_from_slice(&summary.branch_lengths);
    }

    let stats = ForestStats {
        num_trees: forest.trees.len(),
        num_branched_trees: num_branched,
        total_volume,
        volume: volume.range(),
        trunk_diameter: diameter.range(),
        height: height.range(),
        strength: strength.range(),
        dominance: dominance.range(),
        angle: angle.range(),
        bend: bend.range(),
        children: children.range(),
        dimension: dimension.range(),
        trunk_power_law: fit_power_law(&trunk_diameters),
        length_power_law: fit_power_law(&tree_lengths),
        branch_power_law: fit_power_law(&all_branch_lengths),
    };
    if num_branched == 0 {
        warn!("no branched trees in forest; dominance and angle means are empty");
    }
    debug!(
        "forest analysis: volume {:.3} m^3 over {} tree(s), {} branched",
        stats.total_volume, stats.num_trees, stats.num_branched_trees
    );
    trace!("forest stats: {:?}", stats);
    Ok(stats)
}
