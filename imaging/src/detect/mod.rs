//! Star detection
//!
//! Three detector strategies share one contract: given a frame and a boundary
//! rectangle, return candidate stars with position, width, flux and HFR.
//! Callers pick a strategy through [`DetectorKind`] in the configuration.

mod centroid;
mod gradient;
mod threshold;

pub use centroid::CentroidDetector;
pub use gradient::GradientDetector;
pub use threshold::ThresholdDetector;

use crate::pixel::ImageFrame;
use serde::{Deserialize, Serialize};

/// Rectangular pixel region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Region {
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self { x, y, width, height }
    }

    pub fn full(width: usize, height: usize) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Exclusive right edge
    pub fn right(&self) -> usize {
        self.x + self.width
    }

    /// Exclusive bottom edge
    pub fn bottom(&self) -> usize {
        self.y + self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Intersection with a `width`×`height` frame
    pub fn clamped_to(&self, width: usize, height: usize) -> Region {
        let x = self.x.min(width);
        let y = self.y.min(height);
        Region::new(x, y, self.right().min(width) - x, self.bottom().min(height) - y)
    }
}

/// What the frame is being captured for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FrameMode {
    #[default]
    Normal,
    Focus,
    Guide,
}

/// Default search area: the central 70% for focus and guide frames, the
/// whole frame otherwise. An explicit region of interest wins.
pub fn search_region(width: usize, height: usize, mode: FrameMode, roi: Option<&Region>) -> Region {
    if let Some(roi) = roi {
        return roi.clamped_to(width, height);
    }
    match mode {
        FrameMode::Focus | FrameMode::Guide => {
            let sub_x = (width as f64 * 0.15).round() as usize;
            let sub_y = (height as f64 * 0.15).round() as usize;
            Region::new(sub_x, sub_y, width - 2 * sub_x, height - 2 * sub_y)
        }
        FrameMode::Normal => Region::full(width, height),
    }
}

/// A detected star
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StarCandidate {
    /// Centroid in pixel coordinates (pixel centres on integers)
    pub x: f64,
    pub y: f64,
    /// Estimated diameter in pixels
    pub width: f64,
    /// Background-subtracted summed flux
    pub flux: f64,
    /// Background-subtracted peak value
    pub peak: f64,
    pub hfr: f64,
}

impl StarCandidate {
    /// Half size of the measurement box around the star
    pub fn box_radius(&self) -> f64 {
        (self.width * 1.5).max(3.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DetectorKind {
    #[default]
    Centroid,
    Threshold,
    Gradient,
}

/// Detector tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub kind: DetectorKind,
    pub frame_mode: FrameMode,
    /// Centroid: number of threshold-lowering passes
    pub max_stdvar: u32,
    /// Threshold: detection level in frame sigmas above the mean
    pub threshold_sigma: f64,
    /// Threshold: running threshold drops by this fraction per retry
    pub fuzziness_decay: f64,
    /// Threshold: lowest running threshold as a fraction of the initial one
    pub fuzziness_floor: f64,
    /// Gradient: regions above which a dominant region is required
    pub max_regions: usize,
    /// Gradient: required mass ratio of the dominant region
    pub dominance_ratio: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            kind: DetectorKind::Centroid,
            frame_mode: FrameMode::Focus,
            max_stdvar: 5,
            threshold_sigma: 3.0,
            fuzziness_decay: 0.10,
            fuzziness_floor: 0.70,
            max_regions: 10,
            dominance_ratio: 1.5,
        }
    }
}

/// Shared detection contract
pub trait StarDetector: Send + Sync {
    fn kind(&self) -> DetectorKind;

    /// Candidates inside `boundary`, which lies within the frame
    fn detect(&self, frame: &ImageFrame, boundary: &Region) -> Vec<StarCandidate>;
}

/// Tagged detector selected by configuration
#[derive(Debug, Clone)]
pub enum Detector {
    Centroid(CentroidDetector),
    Threshold(ThresholdDetector),
    Gradient(GradientDetector),
}

impl Detector {
    pub fn from_config(config: &DetectorConfig) -> Self {
        match config.kind {
            DetectorKind::Centroid => Detector::Centroid(CentroidDetector::new(config.max_stdvar, config.frame_mode)),
            DetectorKind::Threshold => Detector::Threshold(ThresholdDetector::new(
                config.threshold_sigma,
                config.fuzziness_decay,
                config.fuzziness_floor,
            )),
            DetectorKind::Gradient => {
                Detector::Gradient(GradientDetector::new(config.max_regions, config.dominance_ratio))
            }
        }
    }

    fn inner(&self) -> &dyn StarDetector {
        match self {
            Detector::Centroid(d) => d,
            Detector::Threshold(d) => d,
            Detector::Gradient(d) => d,
        }
    }
}

impl StarDetector for Detector {
    fn kind(&self) -> DetectorKind {
        self.inner().kind()
    }

    fn detect(&self, frame: &ImageFrame, boundary: &Region) -> Vec<StarCandidate> {
        self.inner().detect(frame, boundary)
    }
}

/// Detect stars with the configured strategy inside the mode's search area.
pub fn detect_stars(frame: &ImageFrame, roi: Option<&Region>, config: &DetectorConfig) -> Vec<StarCandidate> {
    let boundary = search_region(frame.width(), frame.height(), config.frame_mode, roi);
    if boundary.is_empty() {
        return Vec::new();
    }
    let detector = Detector::from_config(config);
    let stars = detector.detect(frame, &boundary);
    tracing::debug!("{:?} detector found {} stars in {:?}", detector.kind(), stars.len(), boundary);
    stars
}

/// Background-subtracted photometry of a circular aperture
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Aperture {
    pub hfr: f64,
    pub flux: f64,
    pub peak: f64,
}

/// Measure the aperture of `radius` around `(cx, cy)`. The HFR is the radius
/// enclosing half of the flux, interpolated between pixel distances.
pub(crate) fn measure_aperture(
    plane: &[f64],
    width: usize,
    height: usize,
    cx: f64,
    cy: f64,
    radius: f64,
    background: f64,
) -> Aperture {
    let mut aperture = Aperture { hfr: 0.0, flux: 0.0, peak: 0.0 };
    if width == 0 || height == 0 || !cx.is_finite() || !cy.is_finite() {
        return aperture;
    }

    let x_start = (cx - radius).floor().max(0.0) as usize;
    let y_start = (cy - radius).floor().max(0.0) as usize;
    let x_end = ((cx + radius).ceil().max(0.0) as usize).min(width - 1);
    let y_end = ((cy + radius).ceil().max(0.0) as usize).min(height - 1);

    let mut samples: Vec<(f64, f64)> = Vec::new();
    for y in y_start..=y_end {
        for x in x_start..=x_end {
            let r = ((x as f64 - cx).powi(2) + (y as f64 - cy).powi(2)).sqrt();
            if r <= radius {
                let flux = (plane[y * width + x] - background).max(0.0);
                aperture.peak = aperture.peak.max(flux);
                samples.push((r, flux));
            }
        }
    }

    aperture.flux = samples.iter().map(|(_, f)| f).sum();
    if aperture.flux <= 0.0 {
        return aperture;
    }
    samples.sort_by(|a, b| a.0.total_cmp(&b.0));

    let half = aperture.flux / 2.0;
    let mut enclosed = 0.0;
    let mut previous_r = 0.0;
    for (r, flux) in samples {
        if flux > 0.0 && enclosed + flux >= half {
            aperture.hfr = previous_r + (half - enclosed) / flux * (r - previous_r);
            return aperture;
        }
        enclosed += flux;
        previous_r = r;
    }
    aperture.hfr = previous_r;
    aperture
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::pixel::ImageFrame;

    /// Render Gaussian stars `(x, y, sigma, peak)` on a flat background.
    pub fn star_field(width: usize, height: usize, background: f64, stars: &[(f64, f64, f64, f64)]) -> ImageFrame {
        let mut data = vec![background; width * height];
        for &(sx, sy, sigma, peak) in stars {
            for y in 0..height {
                for x in 0..width {
                    let r2 = (x as f64 - sx).powi(2) + (y as f64 - sy).powi(2);
                    data[y * width + x] += peak * (-r2 / (2.0 * sigma * sigma)).exp();
                }
            }
        }
        let samples: Vec<u16> = data.iter().map(|v| v.round().clamp(0.0, 65535.0) as u16).collect();
        ImageFrame::new(width, height, samples).expect("Valid synthetic frame")
    }
}
