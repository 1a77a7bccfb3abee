//! Global-threshold detector for a single bright star
//!
//! Finds the flux-weighted centroid of everything above the threshold, then
//! grows a ring outward from it until the ring falls mostly below the running
//! threshold. Soft stars get a few retries at a lower threshold.

use super::{measure_aperture, DetectorKind, Region, StarCandidate, StarDetector};
use crate::pixel::ImageFrame;
use std::f64::consts::TAU;

/// Angles sampled on each ring
const RING_SAMPLES: usize = 10;
/// Ring samples that must clear the threshold
const RING_HITS: usize = 5;

#[derive(Debug, Clone)]
pub struct ThresholdDetector {
    threshold_sigma: f64,
    fuzziness_decay: f64,
    fuzziness_floor: f64,
}

impl ThresholdDetector {
    pub fn new(threshold_sigma: f64, fuzziness_decay: f64, fuzziness_floor: f64) -> Self {
        Self {
            threshold_sigma,
            fuzziness_decay: fuzziness_decay.clamp(0.01, 1.0),
            fuzziness_floor: fuzziness_floor.clamp(0.0, 1.0),
        }
    }

    /// Largest ring radius whose samples still mostly exceed `level`
    fn ring_radius(plane: &[f64], width: usize, height: usize, cx: f64, cy: f64, max_radius: usize, level: f64) -> usize {
        let mut radius = 0;
        for r in 1..=max_radius {
            let hits = (0..RING_SAMPLES)
                .filter(|i| {
                    let angle = *i as f64 * TAU / RING_SAMPLES as f64;
                    let x = (cx + r as f64 * angle.cos()).round();
                    let y = (cy + r as f64 * angle.sin()).round();
                    x >= 0.0
                        && y >= 0.0
                        && (x as usize) < width
                        && (y as usize) < height
                        && plane[y as usize * width + x as usize] > level
                })
                .count();
            if hits < RING_HITS {
                break;
            }
            radius = r;
        }
        radius
    }
}

impl StarDetector for ThresholdDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Threshold
    }

    fn detect(&self, frame: &ImageFrame, boundary: &Region) -> Vec<StarCandidate> {
        let stats = *frame.statistics();
        let (width, height) = (frame.width(), frame.height());
        let boundary = boundary.clamped_to(width, height);
        if stats.stddev <= 0.0 || boundary.is_empty() {
            return Vec::new();
        }
        let plane = frame.to_f64();
        let threshold = stats.mean + self.threshold_sigma * stats.stddev;

        let (mut sum_x, mut sum_y, mut total) = (0.0, 0.0, 0.0);
        for y in boundary.y..boundary.bottom() {
            for x in boundary.x..boundary.right() {
                let v = plane[y * width + x];
                if v > threshold {
                    let w = v - stats.mean;
                    sum_x += x as f64 * w;
                    sum_y += y as f64 * w;
                    total += w;
                }
            }
        }
        if total <= 0.0 {
            return Vec::new();
        }
        let (cx, cy) = (sum_x / total, sum_y / total);
        let max_radius = boundary.width.min(boundary.height) / 2;

        let mut fraction = 1.0;
        while fraction >= self.fuzziness_floor - 1e-9 {
            let level = threshold * fraction;
            let radius = Self::ring_radius(&plane, width, height, cx, cy, max_radius, level);
            if radius > 0 {
                let mut star = StarCandidate { x: cx, y: cy, width: 2.0 * radius as f64, flux: 0.0, peak: 0.0, hfr: 0.0 };
                let aperture = measure_aperture(&plane, width, height, cx, cy, star.box_radius(), stats.median);
                star.flux = aperture.flux;
                star.peak = aperture.peak;
                star.hfr = aperture.hfr;
                return vec![star];
            }
            tracing::trace!("No ring above {:.1}, lowering threshold", level);
            fraction -= self.fuzziness_decay;
        }
        Vec::new()
    }
}
