//! Row-edge centroid detector
//!
//! Each row of the search area is scanned for runs of pixels above a
//! threshold ("edges"). Runs that are wide enough and brighter in the middle
//! than at their ends are kept, then vertically adjacent edges are merged into
//! star centres. The threshold is lowered over several passes until enough
//! edges turn up.

use super::{measure_aperture, DetectorKind, FrameMode, Region, StarCandidate, StarDetector};
use crate::pixel::ImageFrame;

/// Rows that must merge into a centre at the strictest pass
const MIN_ROWS_PER_CENTER: i32 = 3;
/// Edge count at which detection gives up
const MAX_EDGES: usize = 10_000;
/// Below this many edges one row is enough for a centre
const FEW_EDGES: usize = 10;
/// Below this many edges two rows are enough for a centre
const SOME_EDGES: usize = 50;
const INITIAL_EDGE_WIDTH: usize = 6;
const INITIAL_EDGE_COUNT: usize = 4;
const MIN_EDGE_FLOOR: usize = 3;

#[derive(Debug, Clone)]
pub struct CentroidDetector {
    max_stdvar: u32,
    mode: FrameMode,
}

#[derive(Debug, Clone)]
struct Edge {
    x: f64,
    y: f64,
    /// Centre value above the frame minimum
    val: f64,
    width: usize,
    /// Summed value of the run
    sum: f64,
    scanned: bool,
}

#[derive(Default)]
struct Run {
    weighted: f64,
    sum: f64,
    diameter: usize,
}

/// Per-pass scan settings
struct Pass {
    min: f64,
    threshold: f64,
    min_edge_width: usize,
    dispersion_ratio: f64,
}

impl CentroidDetector {
    pub fn new(max_stdvar: u32, mode: FrameMode) -> Self {
        Self { max_stdvar: max_stdvar.max(1), mode }
    }

    fn scan_edges(&self, plane: &[f64], width: usize, boundary: &Region, pass: &Pass) -> Vec<Edge> {
        let mut edges = Vec::new();
        for y in boundary.y..boundary.bottom() {
            let row = &plane[y * width..(y + 1) * width];
            let mut run = Run::default();
            for x in boundary.x..boundary.right() {
                let v = row[x] - pass.min;
                if v > pass.threshold {
                    run.weighted += x as f64 * v;
                    run.sum += v;
                    run.diameter += 1;
                } else if run.sum > 0.0 {
                    edges.extend(Self::close_run(row, y, &run, pass));
                    run = Run::default();
                }
            }
            if run.sum > 0.0 {
                edges.extend(Self::close_run(row, y, &run, pass));
            }
        }
        edges
    }

    /// Turn a finished run into an edge if it is wide and peaked enough
    fn close_run(row: &[f64], y: usize, run: &Run, pass: &Pass) -> Option<Edge> {
        if run.diameter < pass.min_edge_width {
            return None;
        }
        let center = run.weighted / run.sum;
        let ic = center.round() as usize;
        let half = run.diameter / 2;
        let left = ic.checked_sub(half)?;
        let right = ic + half;
        if right >= row.len() {
            return None;
        }

        let center_v = row[ic] - pass.min;
        let peaked = |edge_v: f64| edge_v <= 0.0 || center_v / edge_v >= pass.dispersion_ratio;
        if !(peaked(row[left] - pass.min) && peaked(row[right] - pass.min)) {
            return None;
        }

        Some(Edge {
            x: center,
            y: y as f64,
            val: center_v,
            width: run.diameter,
            sum: run.sum,
            scanned: false,
        })
    }

    fn collides(a: &Edge, b: &Edge) -> bool {
        let distance = ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt();
        distance - (a.width / 2) as f64 - (b.width / 2) as f64 <= 0.0
    }
}

impl StarDetector for CentroidDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Centroid
    }

    fn detect(&self, frame: &ImageFrame, boundary: &Region) -> Vec<StarCandidate> {
        let stats = *frame.statistics();
        if stats.stddev <= 0.0 || boundary.is_empty() {
            return Vec::new();
        }
        let width = frame.width();
        let plane = frame.to_f64();
        let boundary = boundary.clamped_to(width, frame.height());

        let max_k = self.max_stdvar as i32;
        let mut k = max_k;
        let mut min_edge_width = INITIAL_EDGE_WIDTH;
        let mut min_edge_count = INITIAL_EDGE_COUNT;
        let mut edges = Vec::new();

        while k >= 1 {
            min_edge_width = (min_edge_width - 1).max(MIN_EDGE_FLOOR);
            min_edge_count = (min_edge_count - 1).max(MIN_EDGE_FLOOR);

            let relaxed = (max_k - k) as f64;
            let pass = Pass {
                min: stats.min,
                threshold: stats.mean + stats.stddev * k as f64 * (0.3 - relaxed * 0.05) - stats.min,
                min_edge_width,
                dispersion_ratio: 1.8 - relaxed * 0.2,
            };
            edges = self.scan_edges(&plane, width, &boundary, &pass);
            tracing::trace!(
                "Centroid pass k={} threshold={:.1} min width={} found {} edges",
                k,
                pass.threshold,
                min_edge_width,
                edges.len()
            );

            // A lone edge is most likely a hot pixel
            if edges.len() == 1 && k > 1 {
                k -= 1;
                continue;
            }
            if edges.len() >= MAX_EDGES {
                tracing::warn!("Too many edges ({}), aborting star detection", edges.len());
                return Vec::new();
            }
            if edges.len() >= min_edge_count {
                break;
            }
            edges.clear();
            k -= 1;
        }

        if edges.is_empty() {
            return Vec::new();
        }

        let mut cen_limit = MIN_ROWS_PER_CENTER - (max_k - k);
        if edges.len() < SOME_EDGES {
            cen_limit = if edges.len() < FEW_EDGES { 1 } else { 2 };
        }
        if cen_limit < 1 {
            return Vec::new();
        }

        edges.sort_by(|a, b| b.sum.total_cmp(&a.sum));

        let mut centers: Vec<(f64, f64, usize)> = Vec::new();
        for i in 0..edges.len() {
            if edges[i].scanned {
                continue;
            }
            let seed = edges[i].clone();
            let mut best_sum = seed.sum;
            let mut best_width = seed.width;
            let (mut avg_x, mut avg_y, mut total) = (0.0, 0.0, 0.0);
            let mut count = 0;

            for edge in edges.iter_mut().filter(|e| !e.scanned) {
                if !Self::collides(edge, &seed) {
                    continue;
                }
                if edge.sum >= best_sum {
                    best_sum = edge.sum;
                    best_width = edge.width;
                }
                edge.scanned = true;
                count += 1;
                avg_x += edge.x * edge.val;
                avg_y += edge.y * edge.val;
                total += edge.val;
            }

            if count >= cen_limit && total > 0.0 {
                centers.push((avg_x / total, avg_y / total, best_width));
            }
        }

        let mut stars: Vec<StarCandidate> = centers
            .into_iter()
            .filter_map(|(x, y, star_width)| {
                let mut star = StarCandidate { x, y, width: star_width as f64, flux: 0.0, peak: 0.0, hfr: 0.0 };
                let aperture = measure_aperture(&plane, width, frame.height(), x, y, star.box_radius(), stats.median);
                if aperture.flux <= 0.0 {
                    return None;
                }
                star.flux = aperture.flux;
                star.peak = aperture.peak;
                star.hfr = aperture.hfr;
                Some(star)
            })
            .collect();

        if stars.len() > 1 && self.mode != FrameMode::Focus {
            let n = stars.len() as f64;
            let mean = stars.iter().map(|s| s.width).sum::<f64>() / n;
            let sdev = (stars.iter().map(|s| (s.width - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt();
            stars.retain(|s| s.width <= mean + 4.0 * sdev);
        }

        stars
    }
}
