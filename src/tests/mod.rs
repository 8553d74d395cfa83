mod test_growth;
mod test_transform;

use crate::allometry::AllometryParams;

pub const PRUNE_LENGTH: f64 = 1.0;

pub const ANALYSIS_PARAMS: AllometryParams = AllometryParams {
    prune_length: PRUNE_LENGTH,
    breast_height: 1.3,
    min_monocotal_branches: 5,
    min_branch_points: 6,
};
