//! Sobel-gradient detector for the dominant star in the search area
//!
//! The search area is smoothed with a 3×3 median, faint structure is
//! suppressed, and the Sobel magnitude is split into 8-connected regions. The
//! heaviest region gives the centre; a ring of samples on its gradient gives the
//! width.

use super::{DetectorKind, Region, StarCandidate, StarDetector};
use crate::pixel::ImageFrame;
use crate::stats::mean_stddev;
use std::f64::consts::TAU;

/// Angles sampled on the radius ring
const RING_ANGLES: usize = 36;
/// Ring samples that must lie on the star's gradient
const RING_HITS: usize = 24;
/// Sub-pixel step of the half-flux integration
const SUBPIXEL: f64 = 1.0 / 20.0;

#[derive(Debug, Clone)]
pub struct GradientDetector {
    max_regions: usize,
    dominance_ratio: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Mass {
    total: f64,
    x: f64,
    y: f64,
}

impl GradientDetector {
    pub fn new(max_regions: usize, dominance_ratio: f64) -> Self {
        Self { max_regions, dominance_ratio }
    }
}

fn median_filter(src: &[f64], width: usize, height: usize) -> Vec<f64> {
    let mut out = src.to_vec();
    let mut window = [0.0; 9];
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let mut i = 0;
            for dy in 0..3 {
                for dx in 0..3 {
                    window[i] = src[(y + dy - 1) * width + x + dx - 1];
                    i += 1;
                }
            }
            window.select_nth_unstable_by(4, |a, b| a.total_cmp(b));
            out[y * width + x] = window[4];
        }
    }
    out
}

/// Zero everything not clearly above the local background
fn suppress_contrast(values: &mut [f64]) {
    if let Some((mean, stddev)) = mean_stddev(values) {
        let cut = mean + stddev;
        for v in values.iter_mut() {
            *v = if *v > cut { *v - cut } else { 0.0 };
        }
    }
}

fn sobel(src: &[f64], width: usize, height: usize) -> Vec<f64> {
    let mut out = vec![0.0; src.len()];
    let at = |x: usize, y: usize| src[y * width + x];
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let gx = (at(x + 1, y - 1) + 2.0 * at(x + 1, y) + at(x + 1, y + 1))
                - (at(x - 1, y - 1) + 2.0 * at(x - 1, y) + at(x - 1, y + 1));
            let gy = (at(x - 1, y + 1) + 2.0 * at(x, y + 1) + at(x + 1, y + 1))
                - (at(x - 1, y - 1) + 2.0 * at(x, y - 1) + at(x + 1, y - 1));
            out[y * width + x] = gx.abs() + gy.abs();
        }
    }
    out
}

/// 8-connected labelling of non-zero pixels, border excluded. Labels start at 1.
fn label_regions(gradient: &[f64], width: usize, height: usize) -> (Vec<u32>, u32) {
    let mut labels = vec![0u32; gradient.len()];
    let mut count = 0;
    let mut stack = Vec::new();

    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let idx = y * width + x;
            if gradient[idx] <= 0.0 || labels[idx] != 0 {
                continue;
            }
            count += 1;
            labels[idx] = count;
            stack.push((x, y));

            while let Some((px, py)) = stack.pop() {
                for ny in py - 1..=py + 1 {
                    for nx in px - 1..=px + 1 {
                        if nx < 1 || ny < 1 || nx >= width - 1 || ny >= height - 1 {
                            continue;
                        }
                        let n = ny * width + nx;
                        if gradient[n] > 0.0 && labels[n] == 0 {
                            labels[n] = count;
                            stack.push((nx, ny));
                        }
                    }
                }
            }
        }
    }
    (labels, count)
}

/// Half-flux radius along one row, integrated at sub-pixel resolution
fn subpixel_hfr(row: &[f64], cx: f64, half_width: f64, background: f64) -> (f64, f64, f64) {
    let steps = (half_width / SUBPIXEL).round() as i64;
    let sample = |offset: i64| {
        let x = (cx + offset as f64 * SUBPIXEL).round();
        if x < 0.0 || x as usize >= row.len() {
            0.0
        } else {
            (row[x as usize] - background).max(0.0) * SUBPIXEL
        }
    };

    let flux: f64 = (-steps..=steps).map(sample).sum();
    let peak = (-steps..=steps).map(sample).fold(0.0, f64::max) / SUBPIXEL;
    if flux <= 0.0 {
        return (0.0, 0.0, 0.0);
    }

    let half = flux / 2.0;
    let mut enclosed = sample(0);
    if enclosed >= half {
        return (0.5 * SUBPIXEL * half / enclosed, flux, peak);
    }
    for k in 1..=steps {
        let previous = enclosed;
        enclosed += sample(k) + sample(-k);
        if enclosed >= half {
            let frac = (half - previous) / (enclosed - previous);
            return ((k as f64 - 0.5 + frac) * SUBPIXEL, flux, peak);
        }
    }
    (half_width, flux, peak)
}

impl StarDetector for GradientDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Gradient
    }

    fn detect(&self, frame: &ImageFrame, boundary: &Region) -> Vec<StarCandidate> {
        let width = frame.width();
        let boundary = boundary.clamped_to(width, frame.height());
        let (bw, bh) = (boundary.width, boundary.height);
        if bw < 5 || bh < 5 {
            return Vec::new();
        }

        let plane = frame.to_f64();
        let mut sub = Vec::with_capacity(bw * bh);
        for y in boundary.y..boundary.bottom() {
            sub.extend_from_slice(&plane[y * width + boundary.x..y * width + boundary.right()]);
        }

        let mut smoothed = median_filter(&sub, bw, bh);
        suppress_contrast(&mut smoothed);
        let gradient = sobel(&smoothed, bw, bh);
        let (labels, count) = label_regions(&gradient, bw, bh);
        if count == 0 {
            return Vec::new();
        }

        let mut masses = vec![Mass::default(); count as usize + 1];
        for (idx, &label) in labels.iter().enumerate() {
            if label == 0 {
                continue;
            }
            let g = gradient[idx];
            let mass = &mut masses[label as usize];
            mass.total += g;
            mass.x += (idx % bw) as f64 * g;
            mass.y += (idx / bw) as f64 * g;
        }

        let mut order: Vec<usize> = (1..masses.len()).collect();
        order.sort_by(|a, b| masses[*b].total.total_cmp(&masses[*a].total));
        let best = order[0];
        let ratio = match order.get(1) {
            Some(&second) if masses[second].total > 0.0 => masses[best].total / masses[second].total,
            _ => f64::INFINITY,
        };
        if count as usize > self.max_regions && ratio < self.dominance_ratio {
            tracing::debug!("{} gradient regions without a dominant one (ratio {:.2})", count, ratio);
            return Vec::new();
        }

        let mass = masses[best];
        if mass.total <= 0.0 {
            return Vec::new();
        }
        let (lx, ly) = (mass.x / mass.total, mass.y / mass.total);

        let max_radius = (bw.min(bh) - 1) / 2;
        let mut star_width = 0.0;
        for r in (2..=max_radius).rev() {
            let mut hits = 0;
            let mut inside = true;
            for i in 0..RING_ANGLES {
                let angle = i as f64 * TAU / RING_ANGLES as f64;
                let x = (lx + r as f64 * angle.cos()).round();
                let y = (ly + r as f64 * angle.sin()).round();
                if x < 0.0 || y < 0.0 || x as usize >= bw || y as usize >= bh {
                    inside = false;
                    break;
                }
                if labels[y as usize * bw + x as usize] == best as u32 {
                    hits += 1;
                }
            }
            if inside && hits >= RING_HITS {
                star_width = 2.0 * r as f64;
                break;
            }
        }
        if star_width == 0.0 {
            return Vec::new();
        }

        let cx = boundary.x as f64 + lx;
        let cy = boundary.y as f64 + ly;
        let row_index = (cy.round() as usize).min(frame.height() - 1);
        let row = &plane[row_index * width..(row_index + 1) * width];
        let (hfr, flux, peak) = subpixel_hfr(row, cx, star_width / 2.0, frame.statistics().median);
        if flux <= 0.0 {
            return Vec::new();
        }

        vec![StarCandidate { x: cx, y: cy, width: star_width, flux, peak, hfr }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::test_support::star_field;

    #[test]
    fn test_labels_skip_border_and_split_regions() {
        let (w, h) = (8, 6);
        let mut gradient = vec![0.0; w * h];
        // Two blobs plus a border pixel that must stay unlabelled
        gradient[w + 1] = 1.0;
        gradient[2 * w + 2] = 1.0;
        gradient[3 * w + 5] = 1.0;
        gradient[0] = 5.0;
        let (labels, count) = label_regions(&gradient, w, h);
        assert_eq!(count, 2, "Diagonal neighbours join, distant pixels do not");
        assert_eq!(labels[w + 1], labels[2 * w + 2]);
        assert_eq!(labels[0], 0);
    }

    #[test]
    fn test_dominant_star_chosen() {
        let frame = star_field(80, 80, 150.0, &[(40.0, 40.0, 2.5, 8000.0), (15.0, 60.0, 1.0, 600.0)]);
        let stars = GradientDetector::new(10, 1.5).detect(&frame, &Region::full(80, 80));
        assert_eq!(stars.len(), 1);
        assert!((stars[0].x - 40.0).abs() < 1.0 && (stars[0].y - 40.0).abs() < 1.0, "{:?}", stars[0]);
    }

    #[test]
    fn test_subpixel_hfr_of_flat_top() {
        // Uniform 5-pixel plateau: half the flux lies within ±1.25 px
        let mut row = vec![0.0; 21];
        for v in row.iter_mut().skip(8).take(5) {
            *v = 100.0;
        }
        let (hfr, flux, peak) = subpixel_hfr(&row, 10.0, 4.0, 0.0);
        assert!((hfr - 1.25).abs() < 0.06, "HFR {}", hfr);
        assert!((flux - 500.0).abs() < 10.0, "Flux {}", flux);
        assert!((peak - 100.0).abs() < 1e-9, "Peak {}", peak);
    }
}
