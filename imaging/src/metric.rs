//! Frame-level focus metric
//!
//! Turns one frame into a single blur score plus a confidence weight. HFR and
//! FWHM are aggregated across isolated stars with a sigma-clipped location;
//! Fourier power needs no star detection at all.

use crate::detect::{self, search_region, DetectorConfig, Region, StarCandidate};
use crate::fourier::tiled_fourier_power;
use crate::pixel::ImageFrame;
use crate::stats::{mad_sigma, scale_to_weight, sigma_clipped_location};
use serde::{Deserialize, Serialize};
use starfocus_curvefit::{CurveFitter, StarParams};

/// Sentinel for "no usable measurement"
pub const INVALID_MEASURE: f64 = -1.0;

/// HFR of a Gaussian in units of sigma, sqrt(2 ln 2)
const HFR_PER_SIGMA: f64 = 1.177_410_022_515_475;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MetricKind {
    /// Half-flux radius
    #[default]
    Hfr,
    /// Full width at half maximum from a Gaussian fit
    Fwhm,
    /// Spectral power, higher is sharper
    FourierPower,
}

impl MetricKind {
    pub fn lower_is_better(self) -> bool {
        !matches!(self, MetricKind::FourierPower)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricConfig {
    pub kind: MetricKind,
    pub detector: DetectorConfig,
    /// Gaussian fits below this R² are dropped
    pub min_r_squared: f64,
    /// Clip width, in standard deviations, for aggregating per-star values
    pub clip_sigma: f64,
    /// Largest half size of a per-star box, pixels
    pub max_box_half_size: usize,
    /// Fourier background cut in frame sigmas above the mean
    pub fourier_background_sigma: f64,
    /// Fourier mosaic tiles per side
    pub fourier_tiles: usize,
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self {
            kind: MetricKind::Hfr,
            detector: DetectorConfig::default(),
            min_r_squared: 0.25,
            clip_sigma: 2.0,
            max_box_half_size: 16,
            fourier_background_sigma: 3.0,
            fourier_tiles: 1,
        }
    }
}

/// Result of measuring one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetric {
    pub kind: MetricKind,
    /// Blur score, or [`INVALID_MEASURE`]
    pub value: f64,
    /// Inverse-variance style confidence
    pub weight: f64,
    /// Stars that contributed to the value
    pub star_count: usize,
    /// Fitted profiles (FWHM only)
    pub stars: Vec<StarParams>,
}

impl FrameMetric {
    pub fn invalid(kind: MetricKind) -> Self {
        Self {
            kind,
            value: INVALID_MEASURE,
            weight: 0.0,
            star_count: 0,
            stars: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.value != INVALID_MEASURE && self.value.is_finite() && self.value > 0.0
    }
}

/// Star detection plus metric aggregation
#[derive(Debug, Clone, Default)]
pub struct StarMetricExtractor {
    config: MetricConfig,
}

impl StarMetricExtractor {
    pub fn new(config: MetricConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MetricConfig {
        &self.config
    }

    pub fn detect_stars(&self, frame: &ImageFrame, roi: Option<&Region>) -> Vec<StarCandidate> {
        detect::detect_stars(frame, roi, &self.config.detector)
    }

    /// Detect and measure in one step
    pub fn measure(&self, frame: &ImageFrame, roi: Option<&Region>) -> FrameMetric {
        let candidates = match self.config.kind {
            MetricKind::FourierPower => Vec::new(),
            MetricKind::Hfr | MetricKind::Fwhm => self.detect_stars(frame, roi),
        };
        self.compute_frame_metric(frame, &candidates, roi)
    }

    /// Aggregate `candidates` into the configured metric.
    ///
    /// Never fails: an unusable frame yields [`INVALID_MEASURE`].
    pub fn compute_frame_metric(&self, frame: &ImageFrame, candidates: &[StarCandidate], roi: Option<&Region>) -> FrameMetric {
        let kind = self.config.kind;
        let metric = match kind {
            MetricKind::FourierPower => self.fourier_metric(frame, roi),
            MetricKind::Hfr => {
                let values: Vec<f64> = self.isolated(candidates).iter().map(|s| s.hfr).filter(|h| *h > 0.0).collect();
                self.aggregate(kind, values, Vec::new())
            }
            MetricKind::Fwhm => {
                let stars = self.fit_profiles(frame, &self.isolated(candidates));
                let values = stars.iter().map(|s| s.fwhm()).collect();
                self.aggregate(kind, values, stars)
            }
        };

        tracing::debug!(
            "{:?} metric {:.4} (weight {:.3e}) from {} of {} candidates",
            kind,
            metric.value,
            metric.weight,
            metric.star_count,
            candidates.len()
        );
        metric
    }

    fn fourier_metric(&self, frame: &ImageFrame, roi: Option<&Region>) -> FrameMetric {
        let region = search_region(frame.width(), frame.height(), self.config.detector.frame_mode, roi);
        let plane = frame.to_f64();
        match tiled_fourier_power(&plane, frame.width(), &region, self.config.fourier_tiles, self.config.fourier_background_sigma) {
            Some(power) if power > 0.0 && power.is_finite() => FrameMetric {
                kind: MetricKind::FourierPower,
                value: power,
                weight: 1.0,
                star_count: 0,
                stars: Vec::new(),
            },
            _ => FrameMetric::invalid(MetricKind::FourierPower),
        }
    }

    fn box_half_size(&self, star: &StarCandidate) -> f64 {
        star.box_radius().ceil().min(self.config.max_box_half_size as f64)
    }

    /// Candidates whose boxes touch no other box. No deblending: both stars
    /// of an intersecting pair are dropped.
    fn isolated(&self, candidates: &[StarCandidate]) -> Vec<StarCandidate> {
        let halves: Vec<f64> = candidates.iter().map(|s| self.box_half_size(s)).collect();
        candidates
            .iter()
            .enumerate()
            .filter(|(i, a)| {
                !candidates.iter().enumerate().any(|(j, b)| {
                    j != *i
                        && (a.x - b.x).abs() < halves[*i] + halves[j]
                        && (a.y - b.y).abs() < halves[*i] + halves[j]
                })
            })
            .map(|(_, s)| *s)
            .collect()
    }

    fn fit_profiles(&self, frame: &ImageFrame, stars: &[StarCandidate]) -> Vec<StarParams> {
        let plane = frame.to_f64();
        let mut fitter = CurveFitter::new();
        stars
            .iter()
            .filter_map(|star| {
                let half = self.box_half_size(star) as usize;
                let sigma = star.hfr / HFR_PER_SIGMA;
                let fitted = fitter.fit_star(&plane, frame.width(), frame.height(), (star.x, star.y), half, sigma)?;
                if fitted.r_squared < self.config.min_r_squared {
                    tracing::trace!("Dropping star at ({:.1}, {:.1}), R² {:.3}", star.x, star.y, fitted.r_squared);
                    return None;
                }
                Some(fitted)
            })
            .collect()
    }

    fn aggregate(&self, kind: MetricKind, values: Vec<f64>, stars: Vec<StarParams>) -> FrameMetric {
        let Some(value) = sigma_clipped_location(&values, self.config.clip_sigma) else {
            return FrameMetric::invalid(kind);
        };
        let weight = scale_to_weight(mad_sigma(&values).unwrap_or(0.0));
        FrameMetric {
            kind,
            value,
            weight,
            star_count: values.len(),
            stars,
        }
    }
}
