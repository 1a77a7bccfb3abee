//! Parametric curve models
//!
//! All models use the (x = focuser position, y = metric) convention.

use crate::gaussian::GaussianProfile;
use crate::minimize::brent_minimize;
use serde::{Deserialize, Serialize};

/// Curve family used to model a focus V-curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CurveKind {
    /// Degree-2 polynomial, closed-form least squares
    Quadratic,
    /// `b·sqrt(1 + ((x - c)/a)²) + d`, nonlinear least squares
    Hyperbola,
    /// `a + b·(x - c)²`, nonlinear least squares
    Parabola,
}

impl CurveKind {
    /// Number of free coefficients
    pub fn coefficient_count(self) -> usize {
        match self {
            CurveKind::Quadratic => 3,
            CurveKind::Hyperbola => 4,
            CurveKind::Parabola => 3,
        }
    }
}

/// A fitted model with its coefficients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CurveModel {
    /// `y = a·x² + b·x + c`
    Quadratic { a: f64, b: f64, c: f64 },
    /// `y = b·sqrt(1 + ((x - c)/a)²) + d`
    Hyperbola { a: f64, b: f64, c: f64, d: f64 },
    /// `y = a + b·(x - c)²`
    Parabola { a: f64, b: f64, c: f64 },
    /// Star profile; `evaluate` samples it along the centroid row
    Gaussian(GaussianProfile),
}

impl CurveModel {
    /// Build a V-curve model from a coefficient vector in declaration order.
    pub fn from_coefficients(kind: CurveKind, coefficients: &[f64]) -> Option<Self> {
        match (kind, coefficients) {
            (CurveKind::Quadratic, &[a, b, c]) => Some(CurveModel::Quadratic { a, b, c }),
            (CurveKind::Hyperbola, &[a, b, c, d]) => Some(CurveModel::Hyperbola { a, b, c, d }),
            (CurveKind::Parabola, &[a, b, c]) => Some(CurveModel::Parabola { a, b, c }),
            _ => None,
        }
    }

    pub fn kind(&self) -> Option<CurveKind> {
        match self {
            CurveModel::Quadratic { .. } => Some(CurveKind::Quadratic),
            CurveModel::Hyperbola { .. } => Some(CurveKind::Hyperbola),
            CurveModel::Parabola { .. } => Some(CurveKind::Parabola),
            CurveModel::Gaussian(_) => None,
        }
    }

    pub fn coefficients(&self) -> Vec<f64> {
        match *self {
            CurveModel::Quadratic { a, b, c } => vec![a, b, c],
            CurveModel::Hyperbola { a, b, c, d } => vec![a, b, c, d],
            CurveModel::Parabola { a, b, c } => vec![a, b, c],
            CurveModel::Gaussian(ref g) => g.to_vec(),
        }
    }

    /// Evaluate y at x
    pub fn evaluate(&self, x: f64) -> f64 {
        match *self {
            CurveModel::Quadratic { a, b, c } => (a * x + b) * x + c,
            CurveModel::Hyperbola { a, b, c, d } => {
                let u = (x - c) / a;
                b * (1.0 + u * u).sqrt() + d
            }
            CurveModel::Parabola { a, b, c } => a + b * (x - c).powi(2),
            CurveModel::Gaussian(ref g) => g.evaluate(x, g.y0),
        }
    }

    /// Position of the theoretical vertex, if the model opens upward.
    pub fn vertex(&self) -> Option<f64> {
        match *self {
            CurveModel::Quadratic { a, b, .. } if a > 0.0 => Some(-b / (2.0 * a)),
            CurveModel::Hyperbola { a, b, c, d } if a.abs() > f64::EPSILON && b > 0.0 && b + d > 0.0 => Some(c),
            CurveModel::Parabola { b, c, .. } if b > 0.0 => Some(c),
            _ => None,
        }
    }

    /// Minimum of the model inside `[search_min, search_max]`.
    ///
    /// Quadratic and parabola use the analytic vertex clamped into the range;
    /// the hyperbola is minimised numerically, seeded with `expected`. Returns
    /// `None` when the model has no minimum or its vertex lies outside the
    /// range by more than `tolerance` (absolute, in position units).
    pub fn minimum(
        &self,
        expected: f64,
        search_min: f64,
        search_max: f64,
        tolerance: f64,
    ) -> Option<(f64, f64)> {
        let (lo, hi) = if search_min <= search_max {
            (search_min, search_max)
        } else {
            (search_max, search_min)
        };

        let vertex = self.vertex()?;
        if !vertex.is_finite() || vertex < lo - tolerance || vertex > hi + tolerance {
            return None;
        }

        let position = match self {
            CurveModel::Hyperbola { .. } => {
                let (x, _) = brent_minimize(|x| self.evaluate(x), lo, hi, Some(expected), 1e-10, 200);
                x
            }
            _ => vertex.clamp(lo, hi),
        };

        Some((position, self.evaluate(position)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_hyperbola_evaluate_at_vertex() {
        let model = CurveModel::Hyperbola { a: 200.0, b: 2.0, c: 5000.0, d: 0.5 };
        assert_relative_eq!(model.evaluate(5000.0), 2.5);
        assert!(model.evaluate(5400.0) > model.evaluate(5200.0), "Hyperbola should rise away from c");
    }

    #[test]
    fn test_quadratic_minimum_clamped() {
        // Vertex at 100, range [0, 95], tolerance 10 -> clamped to 95
        let model = CurveModel::Quadratic { a: 1.0, b: -200.0, c: 0.0 };
        let (x, _) = model.minimum(50.0, 0.0, 95.0, 10.0).expect("Vertex is within tolerance");
        assert_relative_eq!(x, 95.0);
    }

    #[test]
    fn test_minimum_rejects_far_vertex() {
        let model = CurveModel::Parabola { a: 1.0, b: 0.01, c: 500.0 };
        assert!(model.minimum(50.0, 0.0, 100.0, 10.0).is_none(), "Vertex 400 units outside should be rejected");
    }

    #[test]
    fn test_downward_quadratic_has_no_minimum() {
        let model = CurveModel::Quadratic { a: -1.0, b: 0.0, c: 10.0 };
        assert!(model.minimum(0.0, -5.0, 5.0, 1.0).is_none(), "Concave quadratic has no minimum");
    }

    #[test]
    fn test_invalid_hyperbola_has_no_minimum() {
        let model = CurveModel::Hyperbola { a: 100.0, b: 1.0, c: 0.0, d: -2.0 };
        assert!(model.vertex().is_none(), "b + d <= 0 is not a valid focus curve");
    }

    #[test]
    fn test_star_profile_is_not_a_focus_curve() {
        let profile = GaussianProfile {
            background: 10.0,
            peak: 200.0,
            x0: 7.0,
            y0: 5.0,
            sigma_x: 1.5,
            sigma_y: 1.5,
            theta: 0.0,
        };
        let model = CurveModel::Gaussian(profile);
        assert_eq!(model.kind(), None, "Star profiles have no V-curve kind");
        assert!(model.vertex().is_none());
        assert!(model.minimum(7.0, 0.0, 14.0, 1.0).is_none(), "A peaked profile has no focus minimum");
        assert_relative_eq!(model.evaluate(7.0), 210.0);
        assert!(model.evaluate(10.0) < model.evaluate(8.0), "Profile falls away from the centroid row");
    }

    #[test]
    fn test_from_coefficients_checks_length() {
        assert!(CurveModel::from_coefficients(CurveKind::Hyperbola, &[1.0, 2.0, 3.0]).is_none());
        let model = CurveModel::from_coefficients(CurveKind::Parabola, &[1.0, 2.0, 3.0]);
        assert_eq!(model, Some(CurveModel::Parabola { a: 1.0, b: 2.0, c: 3.0 }));
    }
}
