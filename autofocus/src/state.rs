//! Run state of one autofocus pass

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FocusDirection {
    #[default]
    None,
    In,
    Out,
}

impl FocusDirection {
    /// +1 for outward, -1 for inward
    pub fn sign(self) -> i32 {
        match self {
            FocusDirection::Out => 1,
            FocusDirection::In => -1,
            FocusDirection::None => 0,
        }
    }

    pub fn reversed(self) -> Self {
        match self {
            FocusDirection::In => FocusDirection::Out,
            FocusDirection::Out => FocusDirection::In,
            FocusDirection::None => FocusDirection::None,
        }
    }

    /// Direction of travel from `from` to `to`
    pub fn between(from: i32, to: i32) -> Self {
        match to.cmp(&from) {
            std::cmp::Ordering::Greater => FocusDirection::Out,
            std::cmp::Ordering::Less => FocusDirection::In,
            std::cmp::Ordering::Equal => FocusDirection::None,
        }
    }
}

/// One measured point of the focus curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FocusSample {
    pub position: i32,
    /// Value the algorithm minimises
    pub metric: f64,
    pub weight: f64,
    pub star_count: usize,
    /// The frame showed no stars and `metric` is the penalty value
    pub penalty: bool,
}

/// Mutable state of a run, owned by the controller's focus strategy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FocusRunState {
    /// Focuser moves issued so far
    pub iteration: u32,
    pub start_position: i32,
    pub current_position: i32,
    /// Current step size in focuser units
    pub pulse: i32,
    pub last_direction: FocusDirection,
    /// Signed size of the previous move
    pub last_delta: i32,
    /// Last accepted metric and where it was taken
    pub last_metric: Option<f64>,
    pub last_position: i32,
    pub min_metric: Option<f64>,
    pub min_position: i32,
    /// Consecutive decreases and unconfirmed increases
    pub decrease_count: u32,
    pub increase_count: u32,
    pub reversed: bool,
    /// Inner and outer travel bounds learned from reversals
    pub in_limit: Option<i32>,
    pub out_limit: Option<i32>,
    pub fluctuations: u32,
    /// Points where the trend changed sign
    pub reversal_points: Vec<(i32, f64)>,
    pub no_star_count: u32,
    pub samples: Vec<FocusSample>,
}

impl FocusRunState {
    pub fn new(start_position: i32, pulse: i32) -> Self {
        Self {
            start_position,
            current_position: start_position,
            last_position: start_position,
            min_position: start_position,
            pulse,
            ..Default::default()
        }
    }

    /// Record a sample and update the best point
    pub fn record(&mut self, sample: FocusSample) {
        if !sample.penalty && self.min_metric.map_or(true, |m| sample.metric < m) {
            self.min_metric = Some(sample.metric);
            self.min_position = sample.position;
        }
        self.samples.push(sample);
    }

    /// Tighten the travel limit on `direction`'s side. Limits only ever
    /// narrow the bracket.
    pub fn tighten_limit(&mut self, direction: FocusDirection, position: i32) {
        match direction {
            FocusDirection::In => {
                self.in_limit = Some(self.in_limit.map_or(position, |l| l.max(position)));
            }
            FocusDirection::Out => {
                self.out_limit = Some(self.out_limit.map_or(position, |l| l.min(position)));
            }
            FocusDirection::None => {}
        }
    }

    /// Both sides bracketed and they have met or crossed
    pub fn limits_deadlocked(&self) -> bool {
        matches!((self.in_limit, self.out_limit), (Some(lo), Some(hi)) if lo >= hi)
    }

    /// Samples usable for a curve fit
    pub fn fit_samples(&self) -> impl Iterator<Item = &FocusSample> {
        self.samples.iter().filter(|s| !s.penalty)
    }
}
