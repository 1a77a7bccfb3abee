//! Curve fitting for focus V-curves and star profiles
//!
//! Fits parametric models to accumulated (focuser position, blur metric)
//! samples and locates the position of the fitted minimum. Also fits 2-D
//! elliptical Gaussian profiles to individual stars.
//!
//! ## Features
//!
//! - Quadratic fit via weighted normal equations
//! - Hyperbola and parabola fits via Levenberg-Marquardt
//! - Warm start from the previous solution when the curve type is unchanged
//! - Bounded Brent minimisation for models without a usable analytic vertex
//! - Elliptical Gaussian star profile fit with FWHM, HFR and rotation
//! - R² goodness of fit, clamped to be non-negative

mod error;
pub mod fitter;
pub mod gaussian;
pub mod lm;
pub mod minimize;
pub mod model;

pub use error::FitError;
pub use fitter::{CurveFitter, FitterConfig};
pub use gaussian::{fit_star_profile, GaussianProfile, StarParams, FWHM_PER_SIGMA};
pub use lm::{levenberg_marquardt, LeastSquares, LmConfig, LmOutcome};
pub use minimize::brent_minimize;
pub use model::{CurveKind, CurveModel};
