//! Autofocus configuration
//!
//! Settings are handed to the controller at construction. The empirically
//! tuned constants of the step logic live in [`TuningParameters`] so they can
//! be adjusted per rig instead of being buried in the algorithm.

use crate::error::{FocusError, FocusResult};
use serde::{Deserialize, Serialize};
use starfocus_curvefit::CurveKind;
use starfocus_imaging::{MetricConfig, Region};

/// How an absolute focuser picks the position after a confirmed reversal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FocusAlgorithm {
    /// Walk back towards the best position seen so far
    #[default]
    Iterative,
    /// Fit a curve through the samples and go to its minimum
    Polynomial,
    /// Start outside focus, sweep inward at a fixed step and return to the
    /// fitted minimum in a finer second pass
    Linear,
}

/// Tuned constants of the absolute step logic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningParameters {
    /// Step multiplier applied on a confirmed reversal
    pub step_shrink: f64,
    /// Fraction of the current metric the slope extrapolation aims to remove
    pub slope_reduction: f64,
    /// Decrement applied to `slope_reduction` until the target is reachable
    pub slope_decrement: f64,
    /// Smallest travel between two samples usable for a slope, in steps
    pub min_slope_travel: i32,
    /// Metric change that counts as a fluctuation after an unconfirmed increase
    pub fluctuation_threshold: f64,
    /// Fluctuations tolerated before the run is declared unstable
    pub max_fluctuations: u32,
}

impl Default for TuningParameters {
    fn default() -> Self {
        Self {
            step_shrink: 0.75,
            slope_reduction: 0.5,
            slope_decrement: 0.005,
            min_slope_travel: 10,
            fluctuation_threshold: 0.1,
            max_fluctuations: 10,
        }
    }
}

/// Settings for focusers that only accept relative moves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelativeFocusConfig {
    /// Step multiplier applied on every direction reversal
    pub step_shrink: f64,
    /// The run fails once the step drops to this size
    pub min_pulse: i32,
    pub max_iterations: u32,
}

impl Default for RelativeFocusConfig {
    fn default() -> Self {
        Self {
            step_shrink: 0.5,
            min_pulse: 32,
            max_iterations: 30,
        }
    }
}

/// Settings of the [`FocusAlgorithm::Linear`] sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearFocusConfig {
    /// Steps moved outward from the start position before sweeping inward
    pub initial_outward_steps: u32,
    /// Consecutive fits placing the minimum behind the sweep before it ends
    pub solutions_required: u32,
    /// Fits placing the minimum beyond the sweep start before it restarts
    pub restarts_required: u32,
    /// Above this metric the sweep may take larger steps towards a distant minimum
    pub decent_metric: f64,
    /// Steps above the fitted minimum at which the second pass starts
    pub second_pass_margin: f64,
}

impl Default for LinearFocusConfig {
    fn default() -> Self {
        Self {
            initial_outward_steps: 5,
            solutions_required: 2,
            restarts_required: 3,
            decent_metric: 2.5,
            second_pass_margin: 2.0,
        }
    }
}

/// Dark-library calibration of focus frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DarkConfig {
    pub enabled: bool,
    /// Prefer the defect map over full dark subtraction
    pub use_defect_map: bool,
    /// Largest sensor temperature difference accepted, °C
    pub temperature_tolerance: f64,
    /// Library entries older than this are ignored
    pub max_age_days: i64,
}

impl Default for DarkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            use_defect_map: true,
            temperature_tolerance: 2.0,
            max_age_days: 30,
        }
    }
}

/// Configuration of one autofocus run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FocusConfig {
    /// Star detection and frame metric
    pub metric: MetricConfig,
    pub algorithm: FocusAlgorithm,
    /// Curve used by the polynomial and linear algorithms
    pub curve: CurveKind,
    /// Weight fitted samples by their metric confidence
    pub use_weights: bool,
    /// Exposure of each focus frame in seconds
    pub exposure_secs: f64,
    pub binning: u32,
    /// Capture sub-frame, whole sensor when unset
    pub region: Option<Region>,
    /// Initial step in focuser units
    pub step_size: i32,
    /// Relative metric change, in percent, below which focus is reached
    pub tolerance_percent: f64,
    /// Largest distance from the start position the run may travel
    pub max_travel: i32,
    /// Largest single move, in focuser units
    pub max_single_step: i32,
    pub max_iterations: u32,
    /// Moves required before a flat metric counts as convergence
    pub min_convergence_iterations: u32,
    /// Recaptures of a frame without stars before the penalty metric is used
    pub max_no_star_retries: u32,
    /// Metric substituted for frames that keep failing to show stars
    pub penalty_metric: f64,
    /// Samples required before the polynomial algorithm fits a curve
    pub min_fit_points: usize,
    /// Settling time after each focuser move in milliseconds
    pub settle_time_ms: u64,
    pub tuning: TuningParameters,
    pub relative: RelativeFocusConfig,
    pub linear: LinearFocusConfig,
    pub dark: DarkConfig,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            metric: MetricConfig::default(),
            algorithm: FocusAlgorithm::Iterative,
            curve: CurveKind::Quadratic,
            use_weights: true,
            exposure_secs: 2.0,
            binning: 1,
            region: None,
            step_size: 250,
            tolerance_percent: 1.0,
            max_travel: 10_000,
            max_single_step: 1_000,
            max_iterations: 30,
            min_convergence_iterations: 3,
            max_no_star_retries: 3,
            penalty_metric: 100.0,
            min_fit_points: 5,
            settle_time_ms: 500,
            tuning: TuningParameters::default(),
            relative: RelativeFocusConfig::default(),
            linear: LinearFocusConfig::default(),
            dark: DarkConfig::default(),
        }
    }
}

impl FocusConfig {
    /// Parse and validate settings from the configuration collaborator
    pub fn from_json(json: &str) -> FocusResult<Self> {
        let config: FocusConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FocusResult<()> {
        let fail = |msg: String| Err(FocusError::InvalidConfig(msg));

        if self.step_size <= 0 {
            return fail(format!("step size must be positive, got {}", self.step_size));
        }
        if !(self.tolerance_percent > 0.0) {
            return fail(format!("tolerance must be positive, got {}%", self.tolerance_percent));
        }
        if !(self.exposure_secs > 0.0) {
            return fail(format!("exposure must be positive, got {}s", self.exposure_secs));
        }
        if self.binning == 0 {
            return fail("binning must be at least 1".to_string());
        }
        if self.max_iterations == 0 || self.relative.max_iterations == 0 {
            return fail("iteration limit must be at least 1".to_string());
        }
        if self.max_travel <= 0 || self.max_single_step <= 0 {
            return fail("travel limits must be positive".to_string());
        }
        if !(self.penalty_metric > 0.0) {
            return fail(format!("penalty metric must be positive, got {}", self.penalty_metric));
        }
        for (name, value) in [("step shrink", self.tuning.step_shrink), ("relative step shrink", self.relative.step_shrink)] {
            if !(value > 0.0 && value < 1.0) {
                return fail(format!("{} must lie in (0, 1), got {}", name, value));
            }
        }
        if !(self.tuning.slope_reduction > 0.0 && self.tuning.slope_reduction <= 1.0) {
            return fail(format!("slope reduction must lie in (0, 1], got {}", self.tuning.slope_reduction));
        }
        if !(self.tuning.slope_decrement > 0.0) {
            return fail("slope decrement must be positive".to_string());
        }
        if self.relative.min_pulse <= 0 {
            return fail("relative minimum pulse must be positive".to_string());
        }
        let required = self.curve.coefficient_count();
        let fits = matches!(self.algorithm, FocusAlgorithm::Polynomial | FocusAlgorithm::Linear);
        if fits && self.min_fit_points < required {
            return fail(format!("{:?} fit needs at least {} points, configured {}", self.curve, required, self.min_fit_points));
        }
        if self.linear.solutions_required == 0 || self.linear.restarts_required == 0 {
            return fail("linear solution counts must be at least 1".to_string());
        }
        if !(self.linear.second_pass_margin > 0.0) {
            return fail("linear second pass margin must be positive".to_string());
        }
        if self.dark.temperature_tolerance < 0.0 || self.dark.max_age_days < 0 {
            return fail("dark library limits must not be negative".to_string());
        }
        Ok(())
    }

    /// Tolerance as a fraction
    pub fn tolerance(&self) -> f64 {
        self.tolerance_percent / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = FocusConfig::default();
        assert!(config.validate().is_ok(), "Default configuration must validate");
        assert_eq!(config.max_iterations, 30);
        assert_eq!(config.relative.min_pulse, 32);
        assert_eq!(config.tuning.step_shrink, 0.75);
    }

    #[test]
    fn test_from_json_overrides_only_given_fields() {
        let config = FocusConfig::from_json(
            r#"{ "step_size": 100, "tolerance_percent": 0.5, "tuning": { "max_fluctuations": 4 } }"#,
        )
        .unwrap();
        assert_eq!(config.step_size, 100);
        assert_eq!(config.tolerance(), 0.005);
        assert_eq!(config.tuning.max_fluctuations, 4);
        assert_eq!(config.tuning.step_shrink, 0.75, "Unset nested fields keep their defaults");
        assert_eq!(config.exposure_secs, 2.0);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = FocusConfig::from_json(r#"{ "step_size": 0 }"#).unwrap_err();
        assert!(matches!(err, FocusError::InvalidConfig(_)), "Got {:?}", err);

        let config = FocusConfig {
            tuning: TuningParameters { step_shrink: 1.5, ..Default::default() },
            ..Default::default()
        };
        assert!(config.validate().is_err(), "Step shrink above 1 grows the step");

        let config = FocusConfig {
            algorithm: FocusAlgorithm::Polynomial,
            curve: CurveKind::Hyperbola,
            min_fit_points: 3,
            ..Default::default()
        };
        assert!(config.validate().is_err(), "A hyperbola needs four points");

        let config = FocusConfig {
            algorithm: FocusAlgorithm::Linear,
            linear: LinearFocusConfig { solutions_required: 0, ..Default::default() },
            ..Default::default()
        };
        assert!(config.validate().is_err(), "The sweep needs at least one solution to end");
    }

    #[test]
    fn test_linear_algorithm_from_json() {
        let config = FocusConfig::from_json(r#"{ "algorithm": "Linear", "linear": { "initial_outward_steps": 3 } }"#).unwrap();
        assert_eq!(config.algorithm, FocusAlgorithm::Linear);
        assert_eq!(config.linear.initial_outward_steps, 3);
        assert_eq!(config.linear.solutions_required, 2, "Unset fields keep their defaults");
    }

    #[test]
    fn test_malformed_json() {
        let err = FocusConfig::from_json("{ step_size: ").unwrap_err();
        assert!(matches!(err, FocusError::Config(_)), "Got {:?}", err);
    }
}
