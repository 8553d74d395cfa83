//! Approximate cylinder-cylinder intersection volume, for comparing two
//! reconstructions of the same tree.
//!
//! Exact finite-cylinder intersection has no closed form, so the estimate
//! assumes the two axes are similar: both cylinders are projected onto the
//! averaged axis direction and the overlap cross-section is measured once at
//! the midpoint of the shared interval. Callers should expect a few percent
//! of systematic error against a true integral.

use log::debug;
use nalgebra::Vector3;
use rayon::prelude::*;

use crate::model::{Tree, NO_PARENT};

const AXIS_EPS: f64 = 1e-6;
const LENGTH_EPS_SQR: f64 = 1e-7;

/// A finite cylinder between two endpoints.
#[derive(Debug, Clone, Copy)]
pub struct Cylinder {
    pub v1: Vector3<f64>,
    pub v2: Vector3<f64>,
    pub radius: f64,
}

impl Cylinder {
    pub fn new(v1: Vector3<f64>, v2: Vector3<f64>, radius: f64) -> Self {
        Self { v1, v2, radius }
    }
}

/// Intersection volume of two cylinders under the similar-axes assumption.
///
/// A capsule-capsule separating test along the common perpendicular rejects
/// distant pairs first (skipped for near-parallel axes, where the
/// perpendicular degenerates and the test is unnecessary anyway). Returns
/// NaN for degenerate geometry such as a zero-length cylinder; callers must
/// treat NaN as zero overlap.
pub fn intersection_volume(cyl1: &Cylinder, cyl2: &Cylinder) -> f64 {
    let dir1 = cyl1.v2 - cyl1.v1;
    let mut dir2 = cyl2.v2 - cyl2.v1;
    let r = cyl1.radius;
    let big_r = cyl2.radius;

    let cross = dir1.cross(&dir2);
    let side1 = cross.cross(&dir1);
    let side2 = cross.cross(&dir2);
    let den1 = dir1.dot(&side2);
    let den2 = dir2.dot(&side1);
    if den1.abs() > AXIS_EPS && den2.abs() > AXIS_EPS {
        let f1 = -(cyl1.v1 - cyl2.v1).dot(&side2) / den1;
        let p1 = cyl1.v1 + dir1 * f1.clamp(0.0, 1.0);
        let f2 = -(cyl2.v1 - cyl1.v1).dot(&side1) / den2;
        let p2 = cyl2.v1 + dir2 * f2.clamp(0.0, 1.0);
        if (p1 - p2).norm_squared() >= (r + big_r) * (r + big_r) {
            return 0.0;
        }
    }

    let (mut e1, mut e2) = (cyl2.v1, cyl2.v2);
    if dir2.dot(&dir1) < 0.0 {
        dir2 = -dir2;
        std::mem::swap(&mut e1, &mut e2);
    }
    let dir = (dir1 + dir2).normalize();
    let d1 = cyl1.v1.dot(&dir);
    let d2 = cyl1.v2.dot(&dir);
    let f1 = e1.dot(&dir);
    let f2 = e2.dot(&dir);
    let (mind, maxd) = (d1.min(d2), d1.max(d2));
    let (mine, maxe) = (f1.min(f2), f1.max(f2));
    if mind >= maxe || mine >= maxd {
        return 0.0;
    }

    let minx = maxd.min(maxe);
    let maxx = mind.max(mine);
    let overlap_length = minx - maxx;
    if overlap_length <= 0.0 {
        return 0.0;
    }

    // offset between the two centerlines at the middle of the shared span
    let mid = (minx + maxx) / 2.0;
    let pos1 = cyl1.v1 + (cyl1.v2 - cyl1.v1) * ((mid - d1) / (d2 - d1));
    let pos2 = e1 + (e2 - e1) * ((mid - f1) / (f2 - f1));
    let d = (pos1 - pos2).norm();
    if d >= r + big_r {
        return 0.0;
    }
    let min_r = r.min(big_r);
    let max_r = r.max(big_r);
    if d < AXIS_EPS + max_r - min_r {
        // the smaller circle is entirely inside the larger one
        return std::f64::consts::PI * min_r * min_r * overlap_length;
    }

    // circle-circle intersection area, law of cosines plus two circular
    // segments
    let cos1 = (d * d + r * r - big_r * big_r) / (2.0 * d * r);
    let cos2 = (d * d + big_r * big_r - r * r) / (2.0 * d * big_r);
    let square = (-d + r + big_r) * (d + r - big_r) * (d - r + big_r) * (d + r + big_r);
    let area = r * r * cos1.acos() + big_r * big_r * cos2.acos() - 0.5 * square.sqrt();
    area * overlap_length
}

fn segment_cylinders(tree: &Tree, scale: f64) -> Vec<Cylinder> {
    let root = tree.segments[0].tip;
    tree.segments
        .iter()
        .filter(|segment| segment.parent != NO_PARENT)
        .filter_map(|segment| {
            let base = tree.segments[segment.parent as usize].tip;
            if (base - segment.tip).norm_squared() < LENGTH_EPS_SQR {
                return None;
            }
            Some(Cylinder::new(
                (segment.tip - root) * scale,
                (base - root) * scale,
                segment.radius * scale,
            ))
        })
        .collect()
}

/// Total overlap volume between two trees, with the first tree uniformly
/// scaled about its root. Both trees are expressed relative to their own
/// roots, so a perfectly aligned pair overlaps regardless of where each was
/// planted.
pub fn tree_overlap_volume(tree1: &Tree, tree2: &Tree, tree1_scale: f64) -> f64 {
    let cylinders1 = segment_cylinders(tree1, tree1_scale);
    let cylinders2 = segment_cylinders(tree2, 1.0);
    cylinders1
        .par_iter()
        .map(|cyl1| {
            cylinders2
                .iter()
                .map(|cyl2| {
                    let volume = intersection_volume(cyl1, cyl2);
                    if volume.is_nan() {
                        0.0
                    } else {
                        volume
                    }
                })
                .sum::<f64>()
        })
        .sum()
}

/// Scale found by [`best_overlap_scale`], with the overlap it achieved.
#[derive(Debug, Clone, Copy)]
pub struct OverlapMatch {
    /// Uniform scale applied to the first tree for the best match.
    pub scale: f64,
    /// Overlap volume at that scale.
    pub overlap_volume: f64,
    /// Overlap volume over the mean of the two tree volumes, in `[0, 1]`.
    pub overlap_fraction: f64,
}

/// Searches for the uniform scale of `tree1` that maximizes its overlap
/// fraction with `tree2`, by repeatedly subdividing a shrinking scale range
/// around the best candidate. Used to estimate growth between two scans of
/// the same tree taken years apart.
pub fn best_overlap_scale(tree1: &Tree, tree2: &Tree) -> OverlapMatch {
    let tree1_volume = tree1.volume();
    let tree2_volume = tree2.volume();
    let mut scale_mid = 1.0;
    let mut scale_range = 0.5;
    const DIVISIONS: f64 = 5.0;
    let mut best = OverlapMatch {
        scale: 1.0,
        overlap_volume: 0.0,
        overlap_fraction: 0.0,
    };
    while scale_range > 0.02 {
        let mut best_scale = 0.0;
        let mut best_fraction = 0.0;
        let mut best_volume = 0.0;
        let mut scale = scale_mid - scale_range;
        while scale <= scale_mid + scale_range {
            let overlap = tree_overlap_volume(tree1, tree2, scale);
            let fraction = overlap * 2.0 / (scale * scale * scale * tree1_volume + tree2_volume);
            if fraction > best_fraction {
                best_scale = scale;
                best_fraction = fraction;
                best_volume = overlap;
            }
            scale += scale_range / DIVISIONS;
        }
        if best_scale == 0.0 {
            // no overlap at any scale in range; stop with whatever we had
            break;
        }
        debug!(
            "overlap search: scale {:.3} fraction {:.3}",
            best_scale, best_fraction
        );
        scale_mid = best_scale;
        scale_range /= DIVISIONS;
        best = OverlapMatch {
            scale: best_scale,
            overlap_volume: best_volume,
            overlap_fraction: best_fraction,
        };
    }
    best
}
