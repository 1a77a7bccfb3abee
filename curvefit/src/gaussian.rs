//! 2-D elliptical Gaussian star profile fit

use crate::lm::{levenberg_marquardt, LeastSquares, LmConfig};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, PI};

/// FWHM of a Gaussian in units of its sigma, 2·sqrt(2·ln 2)
pub const FWHM_PER_SIGMA: f64 = 2.354_820_045_030_949;

/// Smallest sigma accepted by the solver, in pixels
const MIN_SIGMA: f64 = 0.1;

/// Elliptical Gaussian
///
/// `f(x, y) = background + peak·exp(-(A·dx² + 2B·dx·dy + C·dy²))` with
///
/// - `A = cos²θ/(2σx²) + sin²θ/(2σy²)`
/// - `B = -sin2θ/(4σx²) + sin2θ/(4σy²)`
/// - `C = sin²θ/(2σx²) + cos²θ/(2σy²)`
///
/// θ is measured counter-clockwise from the +x axis in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaussianProfile {
    pub background: f64,
    pub peak: f64,
    pub x0: f64,
    pub y0: f64,
    pub sigma_x: f64,
    pub sigma_y: f64,
    pub theta: f64,
}

impl GaussianProfile {
    pub fn evaluate(&self, x: f64, y: f64) -> f64 {
        let (sin_t, cos_t) = self.theta.sin_cos();
        let sin_2t = (2.0 * self.theta).sin();
        let sx2 = self.sigma_x * self.sigma_x;
        let sy2 = self.sigma_y * self.sigma_y;

        let a = cos_t * cos_t / (2.0 * sx2) + sin_t * sin_t / (2.0 * sy2);
        let b = -sin_2t / (4.0 * sx2) + sin_2t / (4.0 * sy2);
        let c = sin_t * sin_t / (2.0 * sx2) + cos_t * cos_t / (2.0 * sy2);

        let dx = x - self.x0;
        let dy = y - self.y0;
        self.background + self.peak * (-(a * dx * dx + 2.0 * b * dx * dy + c * dy * dy)).exp()
    }

    pub fn fwhm_x(&self) -> f64 {
        self.sigma_x * FWHM_PER_SIGMA
    }

    pub fn fwhm_y(&self) -> f64 {
        self.sigma_y * FWHM_PER_SIGMA
    }

    pub(crate) fn to_vec(self) -> Vec<f64> {
        vec![self.background, self.peak, self.x0, self.y0, self.sigma_x, self.sigma_y, self.theta]
    }

    fn from_params(p: &DVector<f64>) -> Self {
        Self {
            background: p[0],
            peak: p[1],
            x0: p[2],
            y0: p[3],
            sigma_x: p[4],
            sigma_y: p[5],
            theta: p[6],
        }
    }

    /// Same ellipse with sigmas positive and θ folded into (-π/2, π/2]
    fn normalized(mut self) -> Self {
        self.sigma_x = self.sigma_x.abs();
        self.sigma_y = self.sigma_y.abs();
        let mut theta = self.theta % PI;
        if theta > FRAC_PI_2 {
            theta -= PI;
        } else if theta <= -FRAC_PI_2 {
            theta += PI;
        }
        self.theta = theta;
        self
    }
}

/// Per-star fitted profile
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StarParams {
    pub background: f64,
    pub peak: f64,
    pub x: f64,
    pub y: f64,
    /// Half-flux radius of the fitted Gaussian (FWHM / 2)
    pub hfr: f64,
    pub fwhm_x: f64,
    pub fwhm_y: f64,
    /// Rotation in radians, counter-clockwise from +x
    pub theta: f64,
    pub r_squared: f64,
}

impl StarParams {
    /// Mean of the two axis FWHMs
    pub fn fwhm(&self) -> f64 {
        (self.fwhm_x + self.fwhm_y) / 2.0
    }

    pub fn profile(&self) -> GaussianProfile {
        GaussianProfile {
            background: self.background,
            peak: self.peak,
            x0: self.x,
            y0: self.y,
            sigma_x: self.fwhm_x / FWHM_PER_SIGMA,
            sigma_y: self.fwhm_y / FWHM_PER_SIGMA,
            theta: self.theta,
        }
    }
}

/// Pixels of a square sub-window
struct Window {
    xs: Vec<f64>,
    ys: Vec<f64>,
    values: Vec<f64>,
}

impl Window {
    fn model(&self, p: &DVector<f64>, i: usize) -> f64 {
        GaussianProfile::from_params(p).evaluate(self.xs[i], self.ys[i])
    }
}

impl LeastSquares for Window {
    fn residuals(&self, p: &DVector<f64>) -> DVector<f64> {
        DVector::from_fn(self.values.len(), |i, _| self.values[i] - self.model(p, i))
    }

    // Central differences; the analytic form in θ is long and gains nothing here
    fn jacobian(&self, p: &DVector<f64>) -> DMatrix<f64> {
        let mut jac = DMatrix::zeros(self.values.len(), p.len());
        for j in 0..p.len() {
            let h = 1e-6 * p[j].abs().max(1.0);
            let mut plus = p.clone();
            let mut minus = p.clone();
            plus[j] += h;
            minus[j] -= h;
            for i in 0..self.values.len() {
                jac[(i, j)] = (self.model(&plus, i) - self.model(&minus, i)) / (2.0 * h);
            }
        }
        jac
    }

    fn is_admissible(&self, p: &DVector<f64>) -> bool {
        p.iter().all(|v| v.is_finite()) && p[1] > 0.0 && p[4] > MIN_SIGMA && p[5] > MIN_SIGMA
    }
}

/// Fit an elliptical Gaussian to the window of `half_size` pixels around
/// `center` in a row-major plane.
///
/// `initial_sigma` seeds both axes. Returns `None` when the window is too
/// small, the solver fails, or the centroid wanders outside the window.
pub fn fit_star_profile(
    pixels: &[f64],
    width: usize,
    height: usize,
    center: (f64, f64),
    half_size: usize,
    initial_sigma: f64,
    config: &LmConfig,
) -> Option<StarParams> {
    if pixels.len() < width * height || !center.0.is_finite() || !center.1.is_finite() {
        return None;
    }

    let cx = center.0.round() as i64;
    let cy = center.1.round() as i64;
    let half = half_size as i64;
    let x_start = (cx - half).max(0);
    let x_end = (cx + half).min(width as i64 - 1);
    let y_start = (cy - half).max(0);
    let y_end = (cy + half).min(height as i64 - 1);
    if x_end - x_start < 4 || y_end - y_start < 4 {
        return None;
    }

    let mut window = Window { xs: Vec::new(), ys: Vec::new(), values: Vec::new() };
    let mut min_value = f64::INFINITY;
    let mut max_value = f64::NEG_INFINITY;
    for y in y_start..=y_end {
        for x in x_start..=x_end {
            let v = pixels[y as usize * width + x as usize];
            min_value = min_value.min(v);
            max_value = max_value.max(v);
            window.xs.push(x as f64);
            window.ys.push(y as f64);
            window.values.push(v);
        }
    }
    if max_value <= min_value {
        return None;
    }

    let sigma = if initial_sigma.is_finite() && initial_sigma > MIN_SIGMA { initial_sigma } else { 2.0 };
    let initial = DVector::from_vec(vec![
        min_value,
        max_value - min_value,
        center.0,
        center.1,
        sigma,
        sigma * 1.05,
        0.0,
    ]);

    let outcome = levenberg_marquardt(&window, initial, config)?;
    if !outcome.converged {
        return None;
    }

    let profile = GaussianProfile::from_params(&outcome.params).normalized();
    if profile.x0 < x_start as f64 || profile.x0 > x_end as f64 || profile.y0 < y_start as f64 || profile.y0 > y_end as f64 {
        return None;
    }

    let mean = window.values.iter().sum::<f64>() / window.values.len() as f64;
    let total: f64 = window.values.iter().map(|v| (v - mean).powi(2)).sum();
    let r_squared = if total > 0.0 { (1.0 - outcome.chi_squared / total).max(0.0) } else { 0.0 };

    let fwhm_x = profile.fwhm_x();
    let fwhm_y = profile.fwhm_y();

    Some(StarParams {
        background: profile.background,
        peak: profile.peak,
        x: profile.x0,
        y: profile.y0,
        hfr: (fwhm_x + fwhm_y) / 4.0,
        fwhm_x,
        fwhm_y,
        theta: profile.theta,
        r_squared,
    })
}
