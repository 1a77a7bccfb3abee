//! Step decisions of the focus loop
//!
//! Each strategy consumes one measurement at a time and answers with the
//! next device action. They hold no device handle and never block, so the
//! whole decision logic runs synchronously inside the controller.

use crate::config::{FocusAlgorithm, FocusConfig};
use crate::error::FocusFailure;
use crate::state::{FocusDirection, FocusRunState, FocusSample};
use serde::{Deserialize, Serialize};
use starfocus_curvefit::CurveFitter;
use starfocus_imaging::INVALID_MEASURE;
use std::ops::ControlFlow;

/// One frame's score as seen by the step logic. Lower is sharper.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub value: f64,
    pub weight: f64,
    pub star_count: usize,
}

impl Measurement {
    pub fn new(value: f64, weight: f64, star_count: usize) -> Self {
        Self { value, weight, star_count }
    }

    pub fn invalid() -> Self {
        Self { value: INVALID_MEASURE, weight: 0.0, star_count: 0 }
    }

    pub fn is_valid(&self) -> bool {
        self.value != INVALID_MEASURE && self.value.is_finite() && self.value > 0.0
    }
}

/// What the controller does next
#[derive(Debug, Clone, PartialEq)]
pub enum FocusDecision {
    /// Move an absolute focuser, then capture
    MoveTo { position: i32 },
    /// Move a relative focuser, then capture
    MoveRelative { steps: i32, direction: FocusDirection },
    /// Capture again without moving
    Recapture,
    Converged { position: i32, metric: f64 },
    Failed(FocusFailure),
}

/// A focus search driven one measurement at a time
pub trait FocusStrategy: Send {
    /// Consume the measurement taken at the current position
    fn next(&mut self, measurement: &Measurement) -> FocusDecision;

    fn state(&self) -> &FocusRunState;
}

/// Relative change of `value` against `reference`
fn relative_change(value: f64, reference: f64) -> f64 {
    if reference.abs() > f64::EPSILON {
        (value - reference).abs() / reference.abs()
    } else {
        (value - reference).abs()
    }
}

/// Shared no-star handling. Returns the metric to use, or `None` when the
/// frame should be captured again.
fn accept_measurement(state: &mut FocusRunState, measurement: &Measurement, config: &FocusConfig) -> Option<(f64, bool)> {
    if measurement.is_valid() {
        state.no_star_count = 0;
        return Some((measurement.value, false));
    }
    state.no_star_count += 1;
    if state.no_star_count <= config.max_no_star_retries {
        tracing::info!("No stars detected, capturing again ({}/{})", state.no_star_count, config.max_no_star_retries);
        return None;
    }
    state.no_star_count = 0;
    tracing::warn!(
        "Failed to detect any stars at position {}, using penalty metric {}",
        state.current_position,
        config.penalty_metric
    );
    Some((config.penalty_metric, true))
}

// =============================================================================
// ABSOLUTE FOCUSERS
// =============================================================================

/// Target candidate produced by one of the branches
struct Target {
    position: i32,
    /// Skip the single-step clamp (retargets and curve solutions)
    unlimited: bool,
    /// Position came from a fitted curve minimum
    from_fit: bool,
}

/// Slope-guided search for focusers with absolute positions
pub struct AbsoluteFocusAlgorithm {
    config: FocusConfig,
    /// Mechanical travel range of the focuser
    range: (i32, i32),
    state: FocusRunState,
    fitter: CurveFitter,
}

impl AbsoluteFocusAlgorithm {
    pub fn new(config: FocusConfig, range: (i32, i32), start_position: i32) -> Self {
        let pulse = config.step_size;
        Self::with_state(config, range, FocusRunState::new(start_position, pulse))
    }

    fn with_state(config: FocusConfig, range: (i32, i32), state: FocusRunState) -> Self {
        Self {
            config,
            range,
            state,
            fitter: CurveFitter::new(),
        }
    }

    fn first_move(&mut self) -> FocusDecision {
        let state = &mut self.state;
        let (min, max) = self.range;
        let position = state.current_position;
        let mut pulse = state.pulse;

        if position + pulse > max {
            pulse = if position < max { max - position } else { -pulse };
        } else if position + pulse < min {
            pulse = if min < position { position - min } else { 0 };
        }
        if pulse == 0 {
            return FocusDecision::Failed(FocusFailure::DeviceLimits { position });
        }

        let target = position + pulse;
        tracing::info!("Autofocus baseline at {}, moving {:?} to {}", position, FocusDirection::between(position, target), target);
        state.last_delta = pulse;
        state.last_direction = FocusDirection::between(position, target);
        state.current_position = target;
        state.iteration += 1;
        FocusDecision::MoveTo { position: target }
    }

    /// Extrapolate along the V-curve from the last reversal point
    fn slope_target(&self, position: i32, metric: f64) -> Option<i32> {
        let state = &self.state;
        let tuning = &self.config.tuning;
        if state.reversal_points.len() < 2 {
            return None;
        }
        let &(reversal_position, reversal_metric) = state.reversal_points.last()?;
        let travel = position - reversal_position;
        if travel.abs() < tuning.min_slope_travel {
            return None;
        }
        let slope = (metric - reversal_metric) / travel as f64;
        // Moving along the trend must lower the metric
        if slope == 0.0 || slope * state.last_direction.sign() as f64 >= 0.0 {
            return None;
        }

        let (min, max) = self.range;
        let mut reduction = tuning.slope_reduction;
        while reduction > 0.0 {
            let target = (position as f64 - reduction * metric / slope).round() as i32;
            let inside_limits = state.in_limit.map_or(true, |l| target >= l) && state.out_limit.map_or(true, |l| target <= l);
            if inside_limits && target >= min && target <= max && (target - position).abs() <= self.config.max_single_step {
                tracing::debug!("Slope {:.5} from reversal at {}, reduction {:.3}, target {}", slope, reversal_position, reduction, target);
                return Some(target);
            }
            reduction -= tuning.slope_decrement;
        }
        None
    }

    fn on_decrease(&mut self, position: i32, metric: f64) -> Target {
        let tuning = &self.config.tuning;
        let last = self.state.last_metric.unwrap_or(metric);

        if self.state.increase_count >= 1 {
            self.state.reversal_points.push((position, metric));
            if (metric - last).abs() > tuning.fluctuation_threshold {
                // The increase was noise: the side behind us is now bounded
                let behind = self.state.last_direction.reversed();
                self.state.tighten_limit(behind, self.state.last_position);
                self.state.fluctuations += 1;
                tracing::info!("Metric fluctuation {} at {}", self.state.fluctuations, position);
            }
        }

        let target = self.slope_target(position, metric).unwrap_or_else(|| {
            let factor = (self.state.decrease_count as f64 / 2.0).max(1.0);
            position + (self.state.pulse as f64 * factor).round() as i32 * self.state.last_direction.sign()
        });

        let state = &mut self.state;
        state.last_metric = Some(metric);
        state.last_position = position;
        state.decrease_count += 1;
        state.increase_count = 0;
        Target { position: target, unlimited: false, from_fit: false }
    }

    /// `None` asks for a recapture
    fn on_increase(&mut self, position: i32, metric: f64) -> Option<Target> {
        let state = &mut self.state;
        state.increase_count += 1;
        state.decrease_count = 0;
        state.last_metric = Some(metric);
        state.last_position = position;

        if state.increase_count == 1 {
            tracing::info!("Metric increased at {}, confirming with another frame", position);
            return None;
        }

        state.reversed = true;
        state.increase_count = 0;
        let direction = state.last_direction;
        state.tighten_limit(direction, position);
        state.reversal_points.push((position, metric));
        state.pulse = ((state.pulse as f64 * self.config.tuning.step_shrink) as i32).max(1);
        tracing::info!(
            "Metric worsening while moving {:?}, reversing; limits in {:?} out {:?}, step {}",
            direction,
            state.in_limit,
            state.out_limit,
            state.pulse
        );

        if self.config.algorithm == FocusAlgorithm::Polynomial {
            if let Some(position) = self.fitted_minimum() {
                return Some(Target { position, unlimited: true, from_fit: true });
            }
        }

        let state = &self.state;
        let position = match direction {
            FocusDirection::Out => state.min_position - state.pulse / 2,
            _ => state.min_position + state.pulse / 2,
        };
        Some(Target { position, unlimited: true, from_fit: false })
    }

    fn fitted_minimum(&mut self) -> Option<i32> {
        let samples: Vec<&FocusSample> = self.state.fit_samples().collect();
        if samples.len() < self.config.min_fit_points {
            return None;
        }
        let positions: Vec<f64> = samples.iter().map(|s| s.position as f64).collect();
        let metrics: Vec<f64> = samples.iter().map(|s| s.metric).collect();
        let use_weights = self.config.use_weights && samples.iter().all(|s| s.weight > 0.0);
        let sigmas: Vec<f64> = samples.iter().map(|s| 1.0 / s.weight.max(f64::MIN_POSITIVE).sqrt()).collect();

        if let Err(e) = self.fitter.fit(&positions, &metrics, Some(sigmas.as_slice()), self.config.curve, use_weights) {
            tracing::info!("Curve fit rejected: {}", e);
            return None;
        }
        let lo = positions.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = positions.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        match self.fitter.find_minimum(self.state.min_position as f64, lo, hi) {
            Some((x, y)) => {
                tracing::info!("{:?} fit minimum at {:.0} ({:.3}), R² {:.3}", self.config.curve, x, y, self.fitter.goodness_of_fit());
                Some(x.round() as i32)
            }
            None => {
                tracing::info!("Fitted minimum outside the sampled range, continuing the search");
                None
            }
        }
    }

    fn finalize(&mut self, target: Target, metric: f64) -> FocusDecision {
        let (min, max) = self.range;
        let state = &mut self.state;
        let position = state.current_position;

        if state.limits_deadlocked() {
            let limit = state.in_limit.unwrap_or(position);
            tracing::warn!("Deadlock reached at {}, cannot bracket a minimum", limit);
            return FocusDecision::Failed(FocusFailure::Deadlock { position: limit });
        }

        let mut goal = target.position;
        if let Some(l) = state.in_limit {
            goal = goal.max(l);
        }
        if let Some(l) = state.out_limit {
            goal = goal.min(l);
        }
        goal = goal.clamp(min, max);

        if goal == position {
            if state.min_metric.is_none() {
                return FocusDecision::Failed(FocusFailure::NoStars);
            }
            if position == state.min_position || target.from_fit {
                tracing::info!("Focus target is the current position {}, autofocus complete", position);
                return FocusDecision::Converged { position, metric };
            }
            tracing::warn!("Focuser cannot move past {} towards the best position", position);
            return FocusDecision::Failed(FocusFailure::DeviceLimits { position });
        }

        if state.fluctuations >= self.config.tuning.max_fluctuations {
            tracing::warn!("Too many fluctuations ({}), seeing or focuser is unstable", state.fluctuations);
            return FocusDecision::Failed(FocusFailure::Unstable { fluctuations: state.fluctuations });
        }

        if (goal - state.start_position).abs() > self.config.max_travel {
            tracing::warn!(
                "Target {} exceeds the maximum travel of {} from {}",
                goal,
                self.config.max_travel,
                state.start_position
            );
            return FocusDecision::Failed(FocusFailure::MaxTravel { target: goal, start: state.start_position });
        }

        let mut delta = goal - position;
        if !target.unlimited {
            let limit = self.config.max_single_step;
            if delta.abs() > limit {
                tracing::debug!("Move of {} limited to the maximum single step {}", delta, limit);
                delta = delta.clamp(-limit, limit);
            }
        }

        let next = position + delta;
        state.last_delta = delta;
        state.last_direction = FocusDirection::between(position, next);
        state.current_position = next;
        state.iteration += 1;
        FocusDecision::MoveTo { position: next }
    }
}

impl FocusStrategy for AbsoluteFocusAlgorithm {
    fn next(&mut self, measurement: &Measurement) -> FocusDecision {
        if self.state.iteration >= self.config.max_iterations {
            tracing::warn!("Autofocus failed to reach proper focus within {} iterations", self.config.max_iterations);
            return FocusDecision::Failed(FocusFailure::MaxIterations(self.config.max_iterations));
        }
        let Some((metric, penalty)) = accept_measurement(&mut self.state, measurement, &self.config) else {
            return FocusDecision::Recapture;
        };

        let position = self.state.current_position;
        let previous_min = self.state.min_metric;
        self.state.record(FocusSample {
            position,
            metric,
            weight: measurement.weight,
            star_count: measurement.star_count,
            penalty,
        });
        tracing::info!(
            "Sample {} at {}: metric {:.3}, best {:.3} at {}",
            self.state.samples.len(),
            position,
            metric,
            self.state.min_metric.unwrap_or(metric),
            self.state.min_position
        );

        if self.state.last_direction == FocusDirection::None {
            self.state.last_metric = Some(metric);
            self.state.last_position = position;
            return self.first_move();
        }

        let state = &self.state;
        if let Some(best) = previous_min {
            let change = relative_change(metric, best);
            let bracketed = state.in_limit.is_some() && state.out_limit.is_some();
            if state.reversed && bracketed && state.increase_count == 0 && change < self.config.tolerance() {
                if state.iteration < self.config.min_convergence_iterations {
                    tracing::warn!("Change in metric is too small after {} iterations, try a smaller step size", state.iteration);
                    return FocusDecision::Failed(FocusFailure::StepTooCoarse { iterations: state.iteration });
                }
                tracing::info!("Autofocus complete at {} with metric {:.3} ({:.2}% from best)", position, metric, change * 100.0);
                return FocusDecision::Converged { position, metric };
            }
        }

        let decreasing = state.last_metric.map_or(true, |last| metric < last);
        let target = if decreasing {
            self.on_decrease(position, metric)
        } else {
            match self.on_increase(position, metric) {
                Some(target) => target,
                None => return FocusDecision::Recapture,
            }
        };
        self.finalize(target, metric)
    }

    fn state(&self) -> &FocusRunState {
        &self.state
    }
}

// =============================================================================
// LINEAR SWEEP
// =============================================================================

/// Consecutive worsening samples that abandon a second pass
const WORSENING_STREAK: usize = 3;

/// Fixed-step sweep for absolute focusers.
///
/// The first pass starts outside focus and steps inward, refitting the curve
/// after every sample until the fitted minimum is confirmed behind the sweep.
/// The second pass returns above that minimum and walks in at half the step
/// until a sample comes within tolerance of the best first-pass value.
pub struct LinearFocusAlgorithm {
    config: FocusConfig,
    state: FocusRunState,
    fitter: CurveFitter,
    /// Device range narrowed to `max_travel` around the start position
    min_limit: i32,
    max_limit: i32,
    /// Position the current sweep was planned from
    origin: i32,
    pass_start: i32,
    step: i32,
    first_pass: bool,
    solution_pending: bool,
    solutions: u32,
    restarts: u32,
    best_position: i32,
    best_value: f64,
    /// Index of the first sample of the current second pass
    second_pass_start: Option<usize>,
}

impl LinearFocusAlgorithm {
    pub fn new(config: FocusConfig, range: (i32, i32), start_position: i32) -> Self {
        let min_limit = range.0.max(start_position - config.max_travel);
        let max_limit = range.1.min(start_position + config.max_travel);
        let pulse = config.step_size;
        let mut algorithm = Self {
            config,
            state: FocusRunState::new(start_position, pulse),
            fitter: CurveFitter::new(),
            min_limit,
            max_limit,
            origin: start_position,
            pass_start: start_position,
            step: pulse,
            first_pass: true,
            solution_pending: false,
            solutions: 0,
            restarts: 0,
            best_position: start_position,
            best_value: f64::INFINITY,
            second_pass_start: None,
        };
        algorithm.begin_sweep();
        algorithm
    }

    fn begin_sweep(&mut self) {
        self.step = self.config.step_size;
        self.state.pulse = self.step;
        self.first_pass = true;
        self.solution_pending = false;
        self.solutions = 0;
        self.restarts = 0;
        self.second_pass_start = None;
        let outward = self.config.linear.initial_outward_steps as i32 * self.step;
        self.pass_start = (self.origin + outward).min(self.max_limit);
        tracing::info!(
            "Linear sweep from {} inward, step {}, travel {}..{}",
            self.pass_start,
            self.step,
            self.min_limit,
            self.max_limit
        );
    }

    fn move_to(&mut self, target: i32) -> FocusDecision {
        let state = &mut self.state;
        let position = state.current_position;
        state.last_delta = target - position;
        state.last_direction = FocusDirection::between(position, target);
        state.current_position = target;
        state.iteration += 1;
        FocusDecision::MoveTo { position: target }
    }

    /// Best valid sample so far
    fn best_sample(&self) -> Option<(i32, f64)> {
        self.state.min_metric.map(|metric| (self.state.min_position, metric))
    }

    fn fit_and_solve(&mut self, samples: &[FocusSample], position: i32) -> Option<(f64, f64)> {
        let positions: Vec<f64> = samples.iter().map(|s| s.position as f64).collect();
        let metrics: Vec<f64> = samples.iter().map(|s| s.metric).collect();
        let use_weights = self.config.use_weights && samples.iter().all(|s| s.weight > 0.0);
        let sigmas: Vec<f64> = samples.iter().map(|s| 1.0 / s.weight.max(f64::MIN_POSITIVE).sqrt()).collect();

        if let Err(e) = self.fitter.fit(&positions, &metrics, Some(sigmas.as_slice()), self.config.curve, use_weights) {
            tracing::debug!("Sweep fit rejected: {}", e);
            return None;
        }
        let minimum = self.fitter.find_minimum(position as f64, self.min_limit as f64, self.max_limit as f64);
        if let Some((x, y)) = minimum {
            tracing::debug!(
                "{:?} fit of {} samples: minimum {:.0} ({:.3}), R² {:.3}",
                self.config.curve,
                samples.len(),
                x,
                y,
                self.fitter.goodness_of_fit()
            );
        }
        minimum
    }

    /// Fitted minimum of the sweep. The first sample is dropped on a second
    /// attempt since backlash often spoils it.
    fn sweep_minimum(&mut self, position: i32) -> Option<(f64, f64)> {
        let samples: Vec<FocusSample> = self.state.fit_samples().copied().collect();
        if samples.len() < self.config.min_fit_points {
            return None;
        }
        let minimum = self.fit_and_solve(&samples, position);
        if minimum.is_none() && samples.len() > self.config.min_fit_points {
            return self.fit_and_solve(&samples[1..], position);
        }
        minimum
    }

    /// One of the two latest samples ranks among the two best
    fn recent_samples_best(&self) -> bool {
        let samples = &self.state.samples;
        let n = samples.len();
        if n < 5 {
            return true;
        }
        let mut values: Vec<f64> = samples.iter().map(|s| s.metric).collect();
        values.sort_by(|a, b| a.total_cmp(b));
        let second_best = values[1];
        samples[n - 1].metric <= second_best || samples[n - 2].metric <= second_best
    }

    fn getting_worse(&self) -> bool {
        let Some(start) = self.second_pass_start else {
            return false;
        };
        let pass = &self.state.samples[start.min(self.state.samples.len())..];
        if pass.len() < WORSENING_STREAK + 1 {
            return false;
        }
        pass.windows(2).rev().take(WORSENING_STREAK).all(|w| w[1].metric > w[0].metric)
    }

    /// Whether a sample within tolerance is worth one more step inward
    fn keep_searching(&mut self, position: i32, step: i32) -> bool {
        let samples = &self.state.samples;
        let n = samples.len();
        let in_pass = n - self.second_pass_start.unwrap_or(0).min(n);
        let improving = in_pass <= 1 || samples[n - 1].metric < samples[n - 2].metric;
        let next = position - step;
        if improving
            && next > self.best_position
            && next > self.min_limit
            && self.state.iteration + 2 < self.config.max_iterations
        {
            tracing::info!("Metric at {} within tolerance, searching further", position);
            self.solution_pending = true;
            return true;
        }
        false
    }

    fn setup_second_pass(&mut self, position: i32, value: f64, margin: f64) -> FocusDecision {
        self.best_position = position;
        self.best_value = value;
        self.first_pass = false;
        self.solution_pending = false;
        self.second_pass_start = Some(self.state.samples.len());
        let target = ((position as f64 + self.step as f64 * margin).round() as i32).min(self.max_limit);
        self.step = (self.config.step_size / 2).max(1);
        self.state.pulse = self.step;
        tracing::info!("Linear second pass from {} towards {} ({:.3}), step {}", target, position, value, self.step);
        self.move_to(target)
    }

    fn complete_iteration(&mut self, step: i32) -> FocusDecision {
        if self.state.iteration + 2 == self.config.max_iterations {
            if let Some((position, value)) = self.best_sample() {
                tracing::info!("Iteration limit near, retrying close to the best sample at {}", position);
                return self.setup_second_pass(position, value, 0.5);
            }
        }

        let target = self.state.current_position - step;
        if target < self.min_limit {
            let Some((position, value)) = self.best_sample() else {
                return FocusDecision::Failed(FocusFailure::NoStars);
            };
            tracing::info!("Sweep reached {} without a minimum, returning to the best sample at {}", self.min_limit, position);
            return self.setup_second_pass(position, value, self.config.linear.second_pass_margin);
        }
        self.move_to(target)
    }

    /// First-pass bookkeeping. `Continue` carries the step for the next move.
    fn first_pass_sample(&mut self, position: i32, metric: f64) -> ControlFlow<FocusDecision, i32> {
        let mut step = self.step;
        let Some((fit_position, fit_value)) = self.sweep_minimum(position) else {
            return ControlFlow::Continue(step);
        };
        let linear = self.config.linear.clone();

        let distance = position as f64 - fit_position;
        if distance >= 0.0 {
            self.solutions = 0;
            self.restarts = 0;
            if metric > linear.decent_metric {
                let steps_to_minimum = (distance / self.step as f64) as i32;
                if steps_to_minimum >= 8 {
                    step = self.step * 4;
                } else if steps_to_minimum >= 4 {
                    step = self.step * 2;
                }
            }
        } else if !self.recent_samples_best() {
            if fit_position > self.pass_start as f64 {
                self.restarts += 1;
                tracing::info!("Fitted minimum {:.0} lies beyond the sweep start ({})", fit_position, self.restarts);
            } else {
                self.solutions += 1;
                self.restarts = 0;
                tracing::info!("Fitted minimum {:.0} ({:.3}) behind the sweep ({})", fit_position, fit_value, self.solutions);
            }
        }

        if self.solutions >= linear.solutions_required {
            let best = self.state.min_metric.unwrap_or(fit_value);
            return ControlFlow::Break(self.setup_second_pass(fit_position.round() as i32, best, linear.second_pass_margin));
        }
        if self.restarts >= linear.restarts_required {
            let furthest = self.state.start_position + linear.initial_outward_steps as i32 * self.config.step_size;
            self.origin = (fit_position.round() as i32).min(furthest);
            self.begin_sweep();
            tracing::info!("Restarting the linear sweep at {}", self.pass_start);
            return ControlFlow::Break(self.move_to(self.pass_start));
        }
        ControlFlow::Continue(step)
    }
}

impl FocusStrategy for LinearFocusAlgorithm {
    fn next(&mut self, measurement: &Measurement) -> FocusDecision {
        if self.state.iteration == 0 && self.state.current_position != self.pass_start {
            tracing::info!("Moving out to {} to start the linear sweep", self.pass_start);
            return self.move_to(self.pass_start);
        }
        if self.state.iteration >= self.config.max_iterations {
            tracing::warn!("Linear sweep failed to reach focus within {} iterations", self.config.max_iterations);
            return FocusDecision::Failed(FocusFailure::MaxIterations(self.config.max_iterations));
        }
        let Some((metric, penalty)) = accept_measurement(&mut self.state, measurement, &self.config) else {
            return FocusDecision::Recapture;
        };

        let position = self.state.current_position;
        self.state.record(FocusSample {
            position,
            metric,
            weight: measurement.weight,
            star_count: measurement.star_count,
            penalty,
        });
        self.state.last_metric = Some(metric);
        self.state.last_position = position;
        tracing::info!("Sweep sample {} at {}: metric {:.3}", self.state.samples.len(), position, metric);

        let step = self.step;
        if self.solution_pending {
            if self.keep_searching(position, step) {
                return self.complete_iteration(step);
            }
            tracing::info!("Linear sweep complete at {} with metric {:.3}", position, metric);
            return FocusDecision::Converged { position, metric };
        }

        if self.first_pass {
            return match self.first_pass_sample(position, metric) {
                ControlFlow::Break(decision) => decision,
                ControlFlow::Continue(step) => self.complete_iteration(step),
            };
        }

        if metric < self.best_value * (1.0 + self.config.tolerance()) {
            if self.keep_searching(position, step) {
                return self.complete_iteration(step);
            }
            tracing::info!("Linear sweep complete at {} with metric {:.3} (best {:.3})", position, metric, self.best_value);
            return FocusDecision::Converged { position, metric };
        }
        if self.getting_worse() {
            tracing::info!("Second pass getting worse, starting it again");
            return self.setup_second_pass(self.best_position, self.best_value, self.config.linear.second_pass_margin);
        }
        self.complete_iteration(step)
    }

    fn state(&self) -> &FocusRunState {
        &self.state
    }
}

// =============================================================================
// RELATIVE FOCUSERS
// =============================================================================

/// Step-halving search for focusers without absolute positions.
///
/// Positions in the run state are dead-reckoned from the issued moves.
pub struct RelativeFocusAlgorithm {
    config: FocusConfig,
    state: FocusRunState,
    /// Best metric since the first move; the baseline frame is excluded
    best: Option<f64>,
}

impl RelativeFocusAlgorithm {
    pub fn new(config: FocusConfig, start_position: i32) -> Self {
        let pulse = config.step_size;
        Self {
            config,
            state: FocusRunState::new(start_position, pulse),
            best: None,
        }
    }

    fn step(&mut self, direction: FocusDirection) -> FocusDecision {
        let state = &mut self.state;
        let steps = state.pulse;
        state.last_direction = direction;
        state.last_delta = steps * direction.sign();
        state.current_position += state.last_delta;
        state.iteration += 1;
        FocusDecision::MoveRelative { steps, direction }
    }
}

impl FocusStrategy for RelativeFocusAlgorithm {
    fn next(&mut self, measurement: &Measurement) -> FocusDecision {
        let min_pulse = self.config.relative.min_pulse;
        if self.state.pulse <= min_pulse {
            tracing::warn!("Autofocus failed to reach proper focus, step {} below {}", self.state.pulse, min_pulse);
            return FocusDecision::Failed(FocusFailure::StepUnderflow { pulse: self.state.pulse, minimum: min_pulse });
        }
        let max_iterations = self.config.relative.max_iterations;
        if self.state.iteration >= max_iterations {
            return FocusDecision::Failed(FocusFailure::MaxIterations(max_iterations));
        }
        let Some((metric, penalty)) = accept_measurement(&mut self.state, measurement, &self.config) else {
            return FocusDecision::Recapture;
        };

        let position = self.state.current_position;
        self.state.record(FocusSample {
            position,
            metric,
            weight: measurement.weight,
            star_count: measurement.star_count,
            penalty,
        });
        tracing::info!("Sample at ~{}: metric {:.3}, best {:?}", position, metric, self.best);

        let direction = self.state.last_direction;
        if direction == FocusDirection::None {
            self.state.last_metric = Some(metric);
            return self.step(FocusDirection::In);
        }

        if let Some(best) = self.best {
            if relative_change(metric, best) < self.config.tolerance() {
                let iterations = self.state.iteration;
                if iterations < self.config.min_convergence_iterations {
                    return FocusDecision::Failed(FocusFailure::StepTooCoarse { iterations });
                }
                tracing::info!("Autofocus complete at ~{} with metric {:.3}", position, metric);
                return FocusDecision::Converged { position, metric };
            }
        }

        let last = self.state.last_metric.unwrap_or(metric);
        self.state.last_metric = Some(metric);
        self.state.last_position = position;
        if metric < last {
            if !penalty && self.best.map_or(true, |b| metric < b) {
                self.best = Some(metric);
            }
            self.state.decrease_count += 1;
            return self.step(direction);
        }

        let state = &mut self.state;
        state.reversed = true;
        state.reversal_points.push((position, metric));
        state.pulse = (state.pulse as f64 * self.config.relative.step_shrink) as i32;
        tracing::info!("Metric worsening, reversing with step {}", state.pulse);
        self.step(direction.reversed())
    }

    fn state(&self) -> &FocusRunState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Symmetric V-curve with its minimum of 1.5 at 5300
    fn v_curve(position: i32) -> f64 {
        1.5 * (1.0 + ((position as f64 - 5300.0) / 150.0).powi(2)).sqrt()
    }

    fn config() -> FocusConfig {
        FocusConfig {
            step_size: 100,
            settle_time_ms: 0,
            ..Default::default()
        }
    }

    fn measure(metric: f64) -> Measurement {
        Measurement::new(metric, 1.0, 12)
    }

    /// Feed the V-curve until the strategy stops
    fn drive(strategy: &mut dyn FocusStrategy) -> FocusDecision {
        for _ in 0..200 {
            let position = strategy.state().current_position;
            match strategy.next(&measure(v_curve(position))) {
                FocusDecision::MoveTo { .. } | FocusDecision::MoveRelative { .. } | FocusDecision::Recapture => {}
                done => return done,
            }
        }
        panic!("Strategy did not terminate");
    }

    fn bracketed_state() -> FocusRunState {
        FocusRunState {
            iteration: 5,
            start_position: 5000,
            current_position: 5050,
            pulse: 56,
            last_direction: FocusDirection::In,
            last_metric: Some(2.3),
            last_position: 5150,
            min_metric: Some(2.0),
            min_position: 5000,
            reversed: true,
            in_limit: Some(4800),
            out_limit: Some(5200),
            ..FocusRunState::new(5000, 56)
        }
    }

    #[test]
    fn test_absolute_converges_on_v_curve() {
        let mut algorithm = AbsoluteFocusAlgorithm::new(config(), (0, 100_000), 5000);
        match drive(&mut algorithm) {
            FocusDecision::Converged { position, metric } => {
                assert!((position - 5300).abs() <= 50, "Converged at {}", position);
                assert!(metric < 1.5 * 1.01, "Metric {}", metric);
            }
            other => panic!("Expected convergence, got {:?}", other),
        }
        let state = algorithm.state();
        assert!(state.reversed && state.in_limit.is_some() && state.out_limit.is_some());
        assert!(state.iteration >= 3 && state.iteration < 30, "Iterations {}", state.iteration);
        assert!(state.pulse < 100, "Step must shrink on reversals");
    }

    #[test]
    fn test_first_increase_is_recaptured() {
        let mut algorithm = AbsoluteFocusAlgorithm::new(config(), (0, 100_000), 5200);
        assert_eq!(algorithm.next(&measure(2.0)), FocusDecision::MoveTo { position: 5300 });
        assert_eq!(algorithm.next(&measure(2.4)), FocusDecision::Recapture, "First increase may be noise");
        let decision = algorithm.next(&measure(2.4));
        assert_eq!(decision, FocusDecision::MoveTo { position: 5200 - 37 }, "Confirmed: back past the best point");
        assert_eq!(algorithm.state().out_limit, Some(5300));
        assert_eq!(algorithm.state().pulse, 75);
    }

    #[test]
    fn test_first_move_respects_device_range() {
        let mut algorithm = AbsoluteFocusAlgorithm::new(config(), (0, 5000), 5000);
        assert_eq!(algorithm.next(&measure(2.0)), FocusDecision::MoveTo { position: 4900 }, "At the outer end, go in");

        let mut algorithm = AbsoluteFocusAlgorithm::new(config(), (0, 5040), 5000);
        assert_eq!(algorithm.next(&measure(2.0)), FocusDecision::MoveTo { position: 5040 });
    }

    #[test]
    fn test_deadlock_fails_immediately() {
        let state = FocusRunState {
            current_position: 5000,
            out_limit: Some(5000),
            in_limit: None,
            increase_count: 1,
            last_metric: Some(2.0),
            min_position: 5200,
            ..bracketed_state()
        };
        let mut algorithm = AbsoluteFocusAlgorithm::with_state(config(), (0, 100_000), state);
        let decision = algorithm.next(&measure(2.5));
        assert_eq!(decision, FocusDecision::Failed(FocusFailure::Deadlock { position: 5000 }));
        assert!(algorithm.state().iteration < 30);
    }

    #[test]
    fn test_penalty_after_three_empty_frames() {
        let mut algorithm = AbsoluteFocusAlgorithm::new(config(), (0, 100_000), 5000);
        algorithm.next(&measure(3.0));
        for attempt in 1..=3 {
            assert_eq!(algorithm.next(&Measurement::invalid()), FocusDecision::Recapture, "Retry {}", attempt);
        }
        let decision = algorithm.next(&Measurement::invalid());
        assert!(matches!(decision, FocusDecision::Recapture), "Penalty 100 > 3.0 is a first increase: {:?}", decision);

        let state = algorithm.state();
        let last = state.samples.last().unwrap();
        assert!(last.penalty, "Fourth empty frame uses the penalty metric");
        assert_eq!(last.metric, 100.0);
        assert_eq!(state.min_metric, Some(3.0), "Penalties never become the best point");
        assert_eq!(state.no_star_count, 0);
    }

    #[test]
    fn test_tolerance_boundary() {
        let below = 2.0 * 1.0099;
        let above = 2.0 * 1.0101;

        let mut algorithm = AbsoluteFocusAlgorithm::with_state(config(), (0, 100_000), bracketed_state());
        assert_eq!(algorithm.next(&measure(below)), FocusDecision::Converged { position: 5050, metric: below });

        let mut algorithm = AbsoluteFocusAlgorithm::with_state(config(), (0, 100_000), bracketed_state());
        let decision = algorithm.next(&measure(above));
        assert!(matches!(decision, FocusDecision::MoveTo { .. }), "1.01% keeps iterating: {:?}", decision);

        let early = FocusRunState { iteration: 2, ..bracketed_state() };
        let mut algorithm = AbsoluteFocusAlgorithm::with_state(config(), (0, 100_000), early);
        assert_eq!(
            algorithm.next(&measure(below)),
            FocusDecision::Failed(FocusFailure::StepTooCoarse { iterations: 2 })
        );
    }

    #[test]
    fn test_max_travel_and_iteration_cap() {
        let config = FocusConfig { max_travel: 150, ..config() };
        let mut algorithm = AbsoluteFocusAlgorithm::new(config, (0, 100_000), 5000);
        assert!(matches!(algorithm.next(&measure(3.0)), FocusDecision::MoveTo { position: 5100 }));
        let decision = algorithm.next(&measure(2.5));
        assert_eq!(decision, FocusDecision::Failed(FocusFailure::MaxTravel { target: 5200, start: 5000 }));

        let state = FocusRunState { iteration: 30, ..bracketed_state() };
        let mut algorithm = AbsoluteFocusAlgorithm::with_state(self::config(), (0, 100_000), state);
        assert_eq!(algorithm.next(&measure(2.1)), FocusDecision::Failed(FocusFailure::MaxIterations(30)));
    }

    #[test]
    fn test_fluctuations_fail_run() {
        let config = FocusConfig {
            tuning: crate::config::TuningParameters { max_fluctuations: 1, ..Default::default() },
            ..config()
        };
        let mut algorithm = AbsoluteFocusAlgorithm::new(config, (0, 100_000), 5000);
        algorithm.next(&measure(3.0));
        algorithm.next(&measure(2.5));
        assert_eq!(algorithm.next(&measure(2.9)), FocusDecision::Recapture);
        let decision = algorithm.next(&measure(2.4));
        assert_eq!(decision, FocusDecision::Failed(FocusFailure::Unstable { fluctuations: 1 }));
    }

    #[test]
    fn test_polynomial_targets_fitted_minimum() {
        let config = FocusConfig { algorithm: FocusAlgorithm::Polynomial, ..config() };
        let mut algorithm = AbsoluteFocusAlgorithm::new(config, (0, 100_000), 5000);
        let mut decision = FocusDecision::Recapture;
        for _ in 0..6 {
            let position = algorithm.state().current_position;
            decision = algorithm.next(&measure(v_curve(position)));
        }
        match decision {
            FocusDecision::MoveTo { position } => {
                assert!((position - 5300).abs() <= 15, "Quadratic minimum near 5300, got {}", position)
            }
            other => panic!("Expected a move to the fitted minimum, got {:?}", other),
        }
    }

    /// Moving in at 5400 after two reversals, metric 4.0 on the last frame
    fn sloped_state(reversal_points: Vec<(i32, f64)>) -> FocusRunState {
        FocusRunState {
            iteration: 4,
            current_position: 5400,
            pulse: 100,
            last_direction: FocusDirection::In,
            last_metric: Some(4.0),
            last_position: 5500,
            reversed: true,
            reversal_points,
            ..FocusRunState::new(5000, 100)
        }
    }

    fn sloped(reversal_points: Vec<(i32, f64)>) -> AbsoluteFocusAlgorithm {
        AbsoluteFocusAlgorithm::with_state(config(), (0, 100_000), sloped_state(reversal_points))
    }

    #[test]
    fn test_slope_extrapolates_from_last_reversal() {
        let algorithm = sloped(vec![(5800, 5.0), (5600, 4.0)]);
        // slope 0.005, half of metric / slope is 300 steps further in
        assert_eq!(algorithm.slope_target(5400, 3.0), Some(5100));

        let mut algorithm = sloped(vec![(5800, 5.0), (5600, 4.0)]);
        let target = algorithm.on_decrease(5400, 3.0);
        assert_eq!(target.position, 5100, "Decrease follows the slope");
        assert!(!target.unlimited && !target.from_fit);
        assert_eq!(algorithm.state().decrease_count, 1);
        assert_eq!(algorithm.state().last_metric, Some(3.0));
    }

    #[test]
    fn test_slope_reduction_shrinks_into_limits() {
        let state = FocusRunState { in_limit: Some(5200), ..sloped_state(vec![(5800, 5.0), (5600, 4.0)]) };
        let algorithm = AbsoluteFocusAlgorithm::with_state(config(), (0, 100_000), state);
        // 0.5 lands at 5100; the first reduction inside the bracket is 0.33
        assert_eq!(algorithm.slope_target(5400, 3.0), Some(5202));

        let state = sloped_state(vec![(5800, 5.0), (5600, 4.0)]);
        let algorithm = AbsoluteFocusAlgorithm::with_state(config(), (5250, 100_000), state);
        assert_eq!(algorithm.slope_target(5400, 3.0), Some(5250), "Reduction also respects the device range");

        let config = FocusConfig { max_single_step: 150, ..config() };
        let algorithm = AbsoluteFocusAlgorithm::with_state(config, (0, 100_000), sloped_state(vec![(5800, 5.0), (5600, 4.0)]));
        assert_eq!(algorithm.slope_target(5400, 3.0), Some(5250), "Reduction also respects the single step");
    }

    #[test]
    fn test_slope_needs_two_reversals() {
        let algorithm = sloped(vec![(5600, 4.0)]);
        assert_eq!(algorithm.slope_target(5400, 3.0), None);

        let mut algorithm = sloped(vec![(5600, 4.0)]);
        assert_eq!(algorithm.on_decrease(5400, 3.0).position, 5300, "Falls back to one pulse inward");

        let state = FocusRunState { decrease_count: 4, ..sloped_state(Vec::new()) };
        let mut algorithm = AbsoluteFocusAlgorithm::with_state(config(), (0, 100_000), state);
        assert_eq!(algorithm.on_decrease(5400, 3.0).position, 5200, "Pulse grows with consecutive decreases");
    }

    #[test]
    fn test_slope_rejects_short_travel() {
        let algorithm = sloped(vec![(5800, 5.0), (5405, 3.2)]);
        assert_eq!(algorithm.slope_target(5400, 3.0), None, "5 steps from the reversal is below the minimum travel");

        let mut algorithm = sloped(vec![(5800, 5.0), (5405, 3.2)]);
        assert_eq!(algorithm.on_decrease(5400, 3.0).position, 5300);
    }

    #[test]
    fn test_slope_rejects_flat_and_wrong_sign() {
        let flat = sloped(vec![(5800, 5.0), (5600, 3.0)]);
        assert_eq!(flat.slope_target(5400, 3.0), None, "Flat slope has no zero crossing");

        let mut flat = sloped(vec![(5800, 5.0), (5600, 3.0)]);
        assert_eq!(flat.on_decrease(5400, 3.0).position, 5300, "Flat slope falls back to the pulse");

        let rising = sloped(vec![(5800, 5.0), (5600, 2.0)]);
        assert_eq!(rising.slope_target(5400, 3.0), None, "Metric rising along the direction of travel");
    }

    #[test]
    fn test_linear_sweep_converges_on_v_curve() {
        let config = FocusConfig { algorithm: FocusAlgorithm::Linear, ..config() };
        let mut algorithm = LinearFocusAlgorithm::new(config, (0, 100_000), 5000);
        assert_eq!(
            algorithm.next(&measure(v_curve(5000))),
            FocusDecision::MoveTo { position: 5500 },
            "Baseline is discarded and the sweep starts outside focus"
        );

        match drive(&mut algorithm) {
            FocusDecision::Converged { position, metric } => {
                assert!((position - 5300).abs() <= 25, "Converged at {}", position);
                assert!(metric < 1.5 * 1.01, "Metric {}", metric);
            }
            other => panic!("Expected convergence, got {:?}", other),
        }
        let state = algorithm.state();
        assert_eq!(state.samples[0].position, 5500);
        assert!(state.samples.iter().any(|s| s.position < 5200), "First pass crosses the minimum");
        assert!(state.samples.windows(2).take(6).all(|w| w[1].position < w[0].position), "First pass sweeps inward");
        assert!(state.iteration < 30, "Iterations {}", state.iteration);
    }

    #[test]
    fn test_linear_sweep_start_within_travel() {
        let linear = |config: FocusConfig, range: (i32, i32)| {
            let config = FocusConfig { algorithm: FocusAlgorithm::Linear, ..config };
            LinearFocusAlgorithm::new(config, range, 5000)
        };

        let mut algorithm = linear(FocusConfig { max_travel: 200, ..config() }, (0, 100_000));
        assert_eq!(algorithm.next(&measure(3.0)), FocusDecision::MoveTo { position: 5200 });

        let mut algorithm = linear(config(), (0, 5300));
        assert_eq!(algorithm.next(&measure(3.0)), FocusDecision::MoveTo { position: 5300 });

        let mut algorithm = linear(config(), (0, 5000));
        assert_eq!(
            algorithm.next(&measure(3.0)),
            FocusDecision::MoveTo { position: 4900 },
            "At the outer end the baseline is the first sweep sample"
        );
        assert_eq!(algorithm.state().samples.len(), 1);
    }

    #[test]
    fn test_relative_halves_step_and_underflows() {
        let mut algorithm = RelativeFocusAlgorithm::new(config(), 0);
        assert_eq!(
            algorithm.next(&measure(3.0)),
            FocusDecision::MoveRelative { steps: 100, direction: FocusDirection::In }
        );
        assert_eq!(
            algorithm.next(&measure(3.5)),
            FocusDecision::MoveRelative { steps: 50, direction: FocusDirection::Out },
            "Worse: halve and reverse"
        );
        assert_eq!(
            algorithm.next(&measure(3.9)),
            FocusDecision::MoveRelative { steps: 25, direction: FocusDirection::In }
        );
        assert_eq!(
            algorithm.next(&measure(4.0)),
            FocusDecision::Failed(FocusFailure::StepUnderflow { pulse: 25, minimum: 32 })
        );
    }

    #[test]
    fn test_relative_converges_on_v_curve() {
        let config = FocusConfig { step_size: 200, ..config() };
        let mut algorithm = RelativeFocusAlgorithm::new(config, 5800);
        match drive(&mut algorithm) {
            FocusDecision::Converged { position, .. } => {
                assert!((position - 5300).abs() <= 100, "Converged at {}", position)
            }
            other => panic!("Expected convergence, got {:?}", other),
        }
    }
}
