//! CurveFitter: V-curve fitting with a warm-start cache

use crate::error::FitError;
use crate::gaussian::{fit_star_profile, StarParams};
use crate::lm::{levenberg_marquardt, LeastSquares, LmConfig};
use crate::model::{CurveKind, CurveModel};
use nalgebra::{DMatrix, DVector, Matrix3, Vector3};

/// Fitter tuning
#[derive(Debug, Clone)]
pub struct FitterConfig {
    pub lm: LmConfig,
    /// How far outside the search range a vertex may lie, as a fraction of
    /// the range width, before `find_minimum` refuses to trust the fit
    pub vertex_tolerance: f64,
}

impl Default for FitterConfig {
    fn default() -> Self {
        Self {
            lm: LmConfig::default(),
            vertex_tolerance: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
struct WarmStart {
    kind: CurveKind,
    weighted: bool,
    coefficients: Vec<f64>,
}

/// Fits curve models to (position, metric) samples.
///
/// Keeps the last successful coefficients as the starting guess for the next
/// nonlinear fit of the same kind and weighting mode. The cache only affects
/// convergence speed; `reset` discards it.
#[derive(Debug, Clone, Default)]
pub struct CurveFitter {
    config: FitterConfig,
    warm_start: Option<WarmStart>,
    model: Option<CurveModel>,
    r_squared: f64,
}

impl CurveFitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: FitterConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Fit `kind` to the samples.
    ///
    /// `sigmas` are per-sample standard deviations; with `use_weights` each
    /// sample is weighted by `1/σ²`, otherwise all weights are 1.
    pub fn fit(
        &mut self,
        positions: &[f64],
        metrics: &[f64],
        sigmas: Option<&[f64]>,
        kind: CurveKind,
        use_weights: bool,
    ) -> Result<CurveModel, FitError> {
        let result = self.fit_inner(positions, metrics, sigmas, kind, use_weights);

        match result {
            Ok((model, weights)) => {
                self.r_squared = r_squared(&model, positions, metrics, &weights);
                self.warm_start = Some(WarmStart {
                    kind,
                    weighted: use_weights,
                    coefficients: model.coefficients(),
                });
                self.model = Some(model.clone());
                tracing::debug!("{:?} fit: {:?}, R² = {:.4}", kind, model, self.r_squared);
                Ok(model)
            }
            Err(e) => {
                tracing::debug!("{:?} fit failed: {}", kind, e);
                self.warm_start = None;
                self.model = None;
                self.r_squared = 0.0;
                Err(e)
            }
        }
    }

    fn fit_inner(
        &self,
        positions: &[f64],
        metrics: &[f64],
        sigmas: Option<&[f64]>,
        kind: CurveKind,
        use_weights: bool,
    ) -> Result<(CurveModel, Vec<f64>), FitError> {
        if positions.len() != metrics.len() {
            return Err(FitError::LengthMismatch {
                positions: positions.len(),
                metrics: metrics.len(),
            });
        }
        let required = kind.coefficient_count();
        if positions.len() < required {
            return Err(FitError::NotEnoughPoints {
                kind,
                required,
                actual: positions.len(),
            });
        }
        if let Some(i) = positions
            .iter()
            .zip(metrics)
            .position(|(x, y)| !x.is_finite() || !y.is_finite())
        {
            return Err(FitError::NonFiniteInput(i));
        }

        let weights = sample_weights(positions.len(), sigmas, use_weights)?;

        let model = match kind {
            CurveKind::Quadratic => fit_quadratic(positions, metrics, &weights)?,
            CurveKind::Hyperbola | CurveKind::Parabola => {
                self.fit_nonlinear(positions, metrics, &weights, kind, use_weights)?
            }
        };
        Ok((model, weights))
    }

    fn fit_nonlinear(
        &self,
        positions: &[f64],
        metrics: &[f64],
        weights: &[f64],
        kind: CurveKind,
        use_weights: bool,
    ) -> Result<CurveModel, FitError> {
        let guess = match &self.warm_start {
            Some(warm)
                if warm.kind == kind
                    && warm.weighted == use_weights
                    && warm.coefficients.len() == kind.coefficient_count() =>
            {
                warm.coefficients.clone()
            }
            _ => initial_guess(positions, metrics, kind),
        };

        let problem = VCurveProblem {
            kind,
            xs: positions,
            ys: metrics,
            sqrt_w: weights.iter().map(|w| w.sqrt()).collect(),
        };

        let outcome = levenberg_marquardt(&problem, DVector::from_vec(guess), &self.config.lm)
            .ok_or(FitError::Singular)?;
        if !outcome.converged {
            return Err(FitError::NotConverged(outcome.iterations));
        }

        let coefficients: Vec<f64> = outcome.params.iter().copied().collect();
        CurveModel::from_coefficients(kind, &coefficients).ok_or(FitError::Singular)
    }

    /// Position and value of the fitted minimum inside `[search_min, search_max]`.
    ///
    /// `None` means "measure again, do not trust the fit yet": no fit, a curve that
    /// does not open upward, or a vertex outside the range by more than the
    /// configured tolerance.
    pub fn find_minimum(&self, expected: f64, search_min: f64, search_max: f64) -> Option<(f64, f64)> {
        let model = self.model.as_ref()?;
        let tolerance = self.config.vertex_tolerance * (search_max - search_min).abs();
        model.minimum(expected, search_min, search_max, tolerance)
    }

    /// R² of the last fit, never negative
    pub fn goodness_of_fit(&self) -> f64 {
        self.r_squared
    }

    pub fn model(&self) -> Option<&CurveModel> {
        self.model.as_ref()
    }

    /// Fit an elliptical Gaussian to one star; the profile becomes the
    /// current model.
    pub fn fit_star(
        &mut self,
        pixels: &[f64],
        width: usize,
        height: usize,
        center: (f64, f64),
        half_size: usize,
        initial_sigma: f64,
    ) -> Option<StarParams> {
        let star = fit_star_profile(pixels, width, height, center, half_size, initial_sigma, &self.config.lm);
        match &star {
            Some(s) => {
                self.model = Some(CurveModel::Gaussian(s.profile()));
                self.r_squared = s.r_squared;
            }
            None => {
                self.model = None;
                self.r_squared = 0.0;
            }
        }
        star
    }

    /// Forget the warm-start coefficients
    pub fn reset(&mut self) {
        self.warm_start = None;
    }
}

fn sample_weights(n: usize, sigmas: Option<&[f64]>, use_weights: bool) -> Result<Vec<f64>, FitError> {
    match (use_weights, sigmas) {
        (true, Some(sigmas)) => {
            if sigmas.len() != n {
                return Err(FitError::SigmaLengthMismatch {
                    expected: n,
                    actual: sigmas.len(),
                });
            }
            sigmas
                .iter()
                .enumerate()
                .map(|(index, &sigma)| {
                    if sigma.is_finite() && sigma > 0.0 {
                        Ok(1.0 / (sigma * sigma))
                    } else {
                        Err(FitError::InvalidSigma { index, sigma })
                    }
                })
                .collect()
        }
        _ => Ok(vec![1.0; n]),
    }
}

/// Weighted normal equations for `y = a·x² + b·x + c`, solved about the mean
/// position for conditioning.
fn fit_quadratic(xs: &[f64], ys: &[f64], ws: &[f64]) -> Result<CurveModel, FitError> {
    let weight_sum: f64 = ws.iter().sum();
    let x0 = xs.iter().zip(ws).map(|(x, w)| x * w).sum::<f64>() / weight_sum;

    let mut normal = Matrix3::<f64>::zeros();
    let mut rhs = Vector3::<f64>::zeros();
    for ((&x, &y), &w) in xs.iter().zip(ys).zip(ws) {
        let u = x - x0;
        let basis = Vector3::new(1.0, u, u * u);
        normal += basis * basis.transpose() * w;
        rhs += basis * (w * y);
    }

    let solution = normal.lu().solve(&rhs).ok_or(FitError::Singular)?;
    if solution.iter().any(|v| !v.is_finite()) {
        return Err(FitError::Singular);
    }

    // y = A·u² + B·u + C with u = x - x0
    let (c_u, b_u, a_u) = (solution[0], solution[1], solution[2]);
    Ok(CurveModel::Quadratic {
        a: a_u,
        b: b_u - 2.0 * a_u * x0,
        c: a_u * x0 * x0 - b_u * x0 + c_u,
    })
}

/// Coarse vertex and asymptote estimate from the data extremes
fn initial_guess(xs: &[f64], ys: &[f64], kind: CurveKind) -> Vec<f64> {
    let (min_index, _) = ys
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |best, (i, &y)| if y < best.1 { (i, y) } else { best });
    let x_min = xs[min_index];
    let y_min = ys[min_index];

    // Sample farthest from the vertex estimate
    let (far_index, _) = xs
        .iter()
        .enumerate()
        .fold((0, -1.0), |best, (i, &x)| {
            let dist = (x - x_min).abs();
            if dist > best.1 { (i, dist) } else { best }
        });
    let span = (xs[far_index] - x_min).abs().max(1.0);
    let y_far = ys[far_index];

    match kind {
        CurveKind::Hyperbola => {
            let b = if y_min > 0.0 { y_min } else { 1.0 };
            let ratio = (y_far - y_min + b) / b;
            let a = if ratio > 1.0 { span / (ratio * ratio - 1.0).sqrt() } else { span };
            vec![a, b, x_min, y_min - b]
        }
        CurveKind::Parabola => {
            let b = ((y_far - y_min) / (span * span)).max(f64::EPSILON);
            vec![y_min, b, x_min]
        }
        CurveKind::Quadratic => vec![0.0, 0.0, y_min],
    }
}

/// R² = 1 - χ²/TSS with weights, clamped at zero
fn r_squared(model: &CurveModel, xs: &[f64], ys: &[f64], ws: &[f64]) -> f64 {
    let weight_sum: f64 = ws.iter().sum();
    if weight_sum <= 0.0 {
        return 0.0;
    }
    let mean = ys.iter().zip(ws).map(|(y, w)| y * w).sum::<f64>() / weight_sum;

    let mut chi_squared = 0.0;
    let mut total = 0.0;
    for ((&x, &y), &w) in xs.iter().zip(ys).zip(ws) {
        chi_squared += w * (y - model.evaluate(x)).powi(2);
        total += w * (y - mean).powi(2);
    }

    if total > 0.0 {
        (1.0 - chi_squared / total).max(0.0)
    } else {
        0.0
    }
}

struct VCurveProblem<'a> {
    kind: CurveKind,
    xs: &'a [f64],
    ys: &'a [f64],
    sqrt_w: Vec<f64>,
}

impl VCurveProblem<'_> {
    fn value_and_gradient(&self, p: &DVector<f64>, x: f64) -> (f64, [f64; 4]) {
        match self.kind {
            CurveKind::Hyperbola => {
                let (a, b, c, d) = (p[0], p[1], p[2], p[3]);
                let u = (x - c) / a;
                let s = (1.0 + u * u).sqrt();
                (b * s + d, [-b * u * u / (a * s), s, -b * u / (a * s), 1.0])
            }
            CurveKind::Parabola => {
                let (a, b, c) = (p[0], p[1], p[2]);
                let dx = x - c;
                (a + b * dx * dx, [1.0, dx * dx, -2.0 * b * dx, 0.0])
            }
            CurveKind::Quadratic => {
                let (a, b, c) = (p[0], p[1], p[2]);
                ((a * x + b) * x + c, [x * x, x, 1.0, 0.0])
            }
        }
    }
}

impl LeastSquares for VCurveProblem<'_> {
    fn residuals(&self, p: &DVector<f64>) -> DVector<f64> {
        DVector::from_fn(self.xs.len(), |i, _| {
            let (f, _) = self.value_and_gradient(p, self.xs[i]);
            self.sqrt_w[i] * (self.ys[i] - f)
        })
    }

    fn jacobian(&self, p: &DVector<f64>) -> DMatrix<f64> {
        let cols = self.kind.coefficient_count();
        let mut jac = DMatrix::zeros(self.xs.len(), cols);
        for i in 0..self.xs.len() {
            let (_, grad) = self.value_and_gradient(p, self.xs[i]);
            for j in 0..cols {
                jac[(i, j)] = self.sqrt_w[i] * grad[j];
            }
        }
        jac
    }

    fn is_admissible(&self, p: &DVector<f64>) -> bool {
        p.iter().all(|v| v.is_finite()) && (self.kind != CurveKind::Hyperbola || p[0].abs() > f64::EPSILON)
    }
}
