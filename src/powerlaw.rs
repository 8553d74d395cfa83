//! Weighted rank-size power-law fitting.
//!
//! Fits `count(size ≥ x) ≈ c·x^d` in log-log space, where `d` is negative for
//! typical size distributions. Each log-log point is weighted by its local
//! spacing along the log-size axis, which corrects the bias a plain least
//! squares fit picks up from densely sampled size ranges.

use std::fmt::Write as _;

use approx::relative_eq;
use log::{debug, trace};
use serde::{Deserialize, Serialize};

/// Denominator floor for weight and variance accumulators, so singular
/// configurations yield zero rather than NaN.
const ACCUM_FLOOR: f64 = 1e-10;

/// Result of a rank-size power-law fit: `count(size ≥ x) = c·x^d` with
/// correlation coefficient `r2`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PowerLaw {
    pub c: f64,
    pub d: f64,
    pub r2: f64,
}

impl PartialEq for PowerLaw {
    fn eq(&self, other: &Self) -> bool {
        relative_eq!(self.c, other.c)
            && relative_eq!(self.d, other.d)
            && relative_eq!(self.r2, other.r2)
    }
}

impl PowerLaw {
    /// Predicted count of items at least as large as `x`.
    #[inline]
    pub fn predicted_count(&self, x: f64) -> f64 {
        self.c * x.powf(self.d)
    }
}

/// Fits the rank-size power law to a set of positive sizes.
///
/// Sizes are sorted ascending; the item at sorted position `i` (of `n`)
/// becomes the log-log point `(ln size_i, ln (n−i))`, its rank counted from
/// the large end. Point weights equal the log-size spacing between each
/// point's neighbours, doubled at the two sequence ends to compensate for the
/// missing neighbour there. Slope and intercept follow the standard bivariate
/// weighted least-squares formula.
///
/// Returns `None` for fewer than two samples: too few points to fit is a
/// degenerate input, not an error.
pub fn fit_power_law(sizes: &[f64]) -> Option<PowerLaw> {
    if sizes.len() < 2 {
        debug!("power-law fit skipped: {} sample(s)", sizes.len());
        return None;
    }
    let mut xs = sizes.to_vec();
    xs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let n = xs.len();
    let loglog: Vec<(f64, f64)> = xs
        .iter()
        .enumerate()
        .map(|(i, &x)| (x.ln(), ((n - i) as f64).ln()))
        .collect();

    let mut weights = vec![0.0; n];
    let mut total_weight = ACCUM_FLOOR;
    for i in 0..n {
        let i0 = i.saturating_sub(1);
        let i2 = (i + 1).min(n - 1);
        weights[i] = loglog[i2].0 - loglog[i0].0;
        if i == 0 || i == n - 1 {
            weights[i] *= 2.0; // hampered by being on the end
        }
        total_weight += weights[i];
    }

    let mut mean = (0.0, 0.0);
    for (w, p) in weights.iter().zip(&loglog) {
        mean.0 += w * p.0;
        mean.1 += w * p.1;
    }
    mean.0 /= total_weight;
    mean.1 /= total_weight;

    let mut xx = ACCUM_FLOOR;
    let mut xy = 0.0;
    let mut yy = 0.0;
    for (w, p) in weights.iter().zip(&loglog) {
        let dx = p.0 - mean.0;
        let dy = p.1 - mean.1;
        xx += w * dx * dx;
        xy += w * dx * dy;
        yy += w * dy * dy;
    }

    // log count = a + b * log size
    let b = xy / xx;
    let a = mean.1 - b * mean.0;
    let r2 = xy * xy / (xx * yy.max(ACCUM_FLOOR));

    let fit = PowerLaw {
        c: a.exp(),
        d: b,
        r2,
    };
    trace!("power-law fit over {} samples: {:?}", n, fit);
    Some(fit)
}

/// Renders the log-log scatter and fitted line of a set of sizes as an SVG
/// document string. Purely diagnostic; callers decide whether and where to
/// persist it.
pub fn render_loglog_svg(title: &str, sizes: &[f64], fit: &PowerLaw) -> String {
    let width = 300.0;
    let height = 200.0;
    let canvas_width = width + 10.0;
    let canvas_height = height + 10.0;

    let mut xs = sizes.to_vec();
    xs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = xs.len();
    let loglog: Vec<(f64, f64)> = xs
        .iter()
        .enumerate()
        .map(|(i, &x)| (x.ln(), ((n - i) as f64).ln()))
        .collect();

    let (mut minx, mut maxx) = (f64::MAX, f64::MIN);
    let (mut miny, mut maxy) = (f64::MAX, f64::MIN);
    for &(x, y) in &loglog {
        minx = minx.min(x);
        maxx = maxx.max(x);
        miny = miny.min(y);
        maxy = maxy.max(y);
    }
    let spanx = (maxx - minx).max(ACCUM_FLOOR);
    let spany = (maxy - miny).max(ACCUM_FLOOR);

    let a = fit.c.ln();
    let b = fit.d;

    let mut svg = String::new();
    let _ = writeln!(
        svg,
        "<svg version=\"1.1\" width=\"{}\" height=\"{}\" xmlns=\"http://www.w3.org/2000/svg\">",
        canvas_width, canvas_height
    );
    // axes plus the fitted line
    let fit0 = height * ((a + minx * b) - miny) / spany;
    let fit1 = height * ((a + maxx * b) - miny) / spany;
    let lines = [
        ((0.0, 0.0), (width, 0.0)),
        ((0.0, 0.0), (0.0, height)),
        ((0.0, fit0), (width, fit1)),
    ];
    for ((x1, y1), (x2, y2)) in lines {
        let _ = writeln!(
            svg,
            "<line x1=\"{}\" y1=\"{}\" x2=\"{}\" y2=\"{}\" style=\"stroke:rgb(0,0,0);stroke-width:1\" />",
            x1,
            canvas_height - y1,
            x2,
            canvas_height - y2
        );
    }
    for &(x, y) in &loglog {
        let px = width * (x - minx) / spanx;
        let py = height * (y - miny) / spany;
        let _ = writeln!(
            svg,
            "<circle cx=\"{}\" cy=\"{}\" r=\"1\" stroke-width=\"0\" fill=\"green\" />",
            px,
            canvas_height - py
        );
    }
    let _ = writeln!(
        svg,
        "<text x=\"{}\" y=\"{}\" font-size=\"8\" text-anchor=\"middle\" fill=\"black\">log {}</text>",
        width / 2.0,
        canvas_height - 3.0,
        title
    );
    let _ = writeln!(
        svg,
        "<text font-size=\"8\" text-anchor=\"middle\" fill=\"black\" transform=\"translate(8,{}) rotate(-90)\">log number larger</text>",
        canvas_height / 2.0
    );
    svg.push_str("</svg>\n");
    svg
}
