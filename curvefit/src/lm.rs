//! Levenberg-Marquardt nonlinear least squares
//!
//! Damped Gauss-Newton solver shared by the hyperbola, parabola and Gaussian
//! star profile fits. The damping follows the Marquardt scaling of the
//! normal-matrix diagonal.

use nalgebra::{DMatrix, DVector};

/// Solver tuning
#[derive(Debug, Clone)]
pub struct LmConfig {
    /// Maximum number of accepted or rejected steps
    pub max_iterations: usize,
    /// Step tolerance: converged when every |step_i| < tol + tol·|p_i|
    pub tolerance: f64,
    /// Initial damping factor
    pub initial_lambda: f64,
    /// Factor to increase lambda on a rejected step
    pub lambda_up: f64,
    /// Factor to decrease lambda on an accepted step
    pub lambda_down: f64,
    /// Damping above which no further progress is possible
    pub max_lambda: f64,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            tolerance: 1e-5,
            initial_lambda: 1e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
            max_lambda: 1e10,
        }
    }
}

/// Result of a solver run
#[derive(Debug, Clone)]
pub struct LmOutcome {
    pub params: DVector<f64>,
    /// Weighted sum of squared residuals at `params`
    pub chi_squared: f64,
    pub iterations: usize,
    /// False only when the iteration cap was hit while still improving
    pub converged: bool,
}

/// A weighted least-squares problem.
///
/// `residuals` returns `sqrt(w_i)·(y_i - f(x_i; p))` and `jacobian` returns
/// `sqrt(w_i)·∂f(x_i; p)/∂p_j`.
pub trait LeastSquares {
    fn residuals(&self, params: &DVector<f64>) -> DVector<f64>;

    fn jacobian(&self, params: &DVector<f64>) -> DMatrix<f64>;

    /// Reject parameter vectors outside the model's domain.
    fn is_admissible(&self, _params: &DVector<f64>) -> bool {
        true
    }
}

/// Run Levenberg-Marquardt from `initial`.
///
/// Returns `None` when the starting point is not admissible or produces a
/// non-finite chi-square.
pub fn levenberg_marquardt<P: LeastSquares>(
    problem: &P,
    initial: DVector<f64>,
    config: &LmConfig,
) -> Option<LmOutcome> {
    if !problem.is_admissible(&initial) {
        return None;
    }

    let mut params = initial;
    let mut residuals = problem.residuals(&params);
    let mut chi_squared = residuals.norm_squared();
    if !chi_squared.is_finite() {
        return None;
    }

    let n = params.len();
    let mut lambda = config.initial_lambda;
    let mut jacobian = problem.jacobian(&params);

    for iteration in 0..config.max_iterations {
        let jt = jacobian.transpose();
        let mut normal = &jt * &jacobian;
        let gradient = &jt * &residuals;

        for i in 0..n {
            let diag = normal[(i, i)];
            normal[(i, i)] = if diag > 0.0 { diag * (1.0 + lambda) } else { lambda };
        }

        let step = match normal.clone().cholesky() {
            Some(chol) => Some(chol.solve(&gradient)),
            None => normal.lu().solve(&gradient),
        };

        let accepted = step.and_then(|step| {
            let candidate = &params + &step;
            if !problem.is_admissible(&candidate) {
                return None;
            }
            let candidate_residuals = problem.residuals(&candidate);
            let candidate_chi = candidate_residuals.norm_squared();
            (candidate_chi.is_finite() && candidate_chi < chi_squared)
                .then_some((step, candidate, candidate_residuals, candidate_chi))
        });

        match accepted {
            Some((step, candidate, candidate_residuals, candidate_chi)) => {
                let small_step = step
                    .iter()
                    .zip(candidate.iter())
                    .all(|(s, p)| s.abs() < config.tolerance + config.tolerance * p.abs());

                params = candidate;
                residuals = candidate_residuals;
                chi_squared = candidate_chi;
                lambda *= config.lambda_down;

                if small_step || chi_squared < 1e-30 {
                    return Some(LmOutcome {
                        params,
                        chi_squared,
                        iterations: iteration + 1,
                        converged: true,
                    });
                }
                jacobian = problem.jacobian(&params);
            }
            None => {
                lambda *= config.lambda_up;
                if lambda > config.max_lambda {
                    // No direction decreases chi-square any more
                    return Some(LmOutcome {
                        params,
                        chi_squared,
                        iterations: iteration + 1,
                        converged: true,
                    });
                }
            }
        }
    }

    tracing::debug!(
        "Levenberg-Marquardt hit {} iterations, chi² = {:.3e}",
        config.max_iterations,
        chi_squared
    );

    Some(LmOutcome {
        params,
        chi_squared,
        iterations: config.max_iterations,
        converged: false,
    })
}
