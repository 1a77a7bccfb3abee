//! Fourier-power sharpness score
//!
//! Background below `mean + k·sigma` is zeroed, the rest is shifted down to
//! the cut. The 2-D spectrum is built from row FFTs followed by column FFTs and
//! its total power is normalised by the squared pixel count. Sharper frames
//! concentrate flux and score higher.

use crate::detect::Region;
use crate::stats::mean_stddev;
use rayon::prelude::*;
use rustfft::{num_complex::Complex, FftPlanner};

fn try_buffer(len: usize) -> Option<Vec<Complex<f64>>> {
    let mut buffer = Vec::new();
    if let Err(e) = buffer.try_reserve_exact(len) {
        tracing::warn!("Cannot allocate FFT buffer of {} samples: {}", len, e);
        return None;
    }
    Some(buffer)
}

/// Spectral power of `region` in a row-major plane of `width` columns.
///
/// `None` when the region is empty or the FFT buffers cannot be allocated.
pub fn fourier_power(plane: &[f64], width: usize, region: &Region, background_sigma: f64) -> Option<f64> {
    let (w, h) = (region.width, region.height);
    if w == 0 || h == 0 || region.right() > width || region.bottom() * width > plane.len() {
        return None;
    }

    let mut values = Vec::with_capacity(w * h);
    for y in region.y..region.bottom() {
        values.extend_from_slice(&plane[y * width + region.x..y * width + region.right()]);
    }
    let (mean, stddev) = mean_stddev(&values)?;
    let cut = mean + background_sigma * stddev;

    let mut rows = try_buffer(w * h)?;
    rows.extend(values.iter().map(|&v| Complex::new(if v < cut { 0.0 } else { v - cut }, 0.0)));

    let mut planner = FftPlanner::<f64>::new();
    // process() walks the buffer in chunks of the plan length
    planner.plan_fft_forward(w).process(&mut rows);

    let mut columns = try_buffer(w * h)?;
    for x in 0..w {
        columns.extend((0..h).map(|y| rows[y * w + x]));
    }
    planner.plan_fft_forward(h).process(&mut columns);

    let n = (w * h) as f64;
    Some(columns.iter().map(|c| c.norm_sqr()).sum::<f64>() / (n * n))
}

/// Mean Fourier power over a `tiles`×`tiles` mosaic of `region`, tiles
/// computed in parallel.
pub fn tiled_fourier_power(
    plane: &[f64],
    width: usize,
    region: &Region,
    tiles: usize,
    background_sigma: f64,
) -> Option<f64> {
    if tiles <= 1 {
        return fourier_power(plane, width, region, background_sigma);
    }
    let tile_w = region.width / tiles;
    let tile_h = region.height / tiles;
    if tile_w == 0 || tile_h == 0 {
        return fourier_power(plane, width, region, background_sigma);
    }

    let mosaic: Vec<Region> = (0..tiles)
        .flat_map(|ty| {
            (0..tiles).map(move |tx| Region::new(region.x + tx * tile_w, region.y + ty * tile_h, tile_w, tile_h))
        })
        .collect();

    let powers: Vec<f64> = mosaic
        .par_iter()
        .filter_map(|tile| fourier_power(plane, width, tile, background_sigma))
        .collect();
    if powers.is_empty() {
        return None;
    }
    Some(powers.iter().sum::<f64>() / powers.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::test_support::star_field;

    #[test]
    fn test_power_matches_mean_square() {
        let frame = star_field(32, 24, 50.0, &[(16.0, 12.0, 1.5, 2000.0)]);
        let plane = frame.to_f64();
        let region = Region::full(32, 24);
        let power = fourier_power(&plane, 32, &region, 3.0).unwrap();

        let (mean, stddev) = mean_stddev(&plane).unwrap();
        let cut = mean + 3.0 * stddev;
        let expected = plane.iter().map(|&v| if v < cut { 0.0 } else { (v - cut).powi(2) }).sum::<f64>() / plane.len() as f64;
        assert!((power - expected).abs() <= 1e-9 * expected.max(1.0), "Parseval: {} vs {}", power, expected);
    }

    #[test]
    fn test_sharper_star_scores_higher() {
        let region = Region::full(48, 48);
        let sharp = star_field(48, 48, 100.0, &[(24.0, 24.0, 1.2, 3000.0)]);
        // Same total flux, spread wider
        let soft = star_field(48, 48, 100.0, &[(24.0, 24.0, 2.4, 750.0)]);
        let p_sharp = fourier_power(&sharp.to_f64(), 48, &region, 3.0).unwrap();
        let p_soft = fourier_power(&soft.to_f64(), 48, &region, 3.0).unwrap();
        assert!(p_sharp > p_soft, "Sharp {} should beat soft {}", p_sharp, p_soft);
    }

    #[test]
    fn test_tiled_power_averages_tiles() {
        let stars: Vec<(f64, f64, f64, f64)> =
            [(8.0, 8.0), (24.0, 8.0), (8.0, 24.0), (24.0, 24.0)].iter().map(|&(x, y)| (x, y, 1.5, 2000.0)).collect();
        let frame = star_field(32, 32, 80.0, &stars);
        let plane = frame.to_f64();

        let tiled = tiled_fourier_power(&plane, 32, &Region::full(32, 32), 2, 3.0).unwrap();
        let single = fourier_power(&plane, 32, &Region::new(0, 0, 16, 16), 3.0).unwrap();
        assert!((tiled - single).abs() <= 1e-6 * single, "Identical tiles should average to one tile's power");
    }

    #[test]
    fn test_empty_region_is_invalid() {
        let plane = vec![0.0; 16];
        assert!(fourier_power(&plane, 4, &Region::new(0, 0, 0, 4), 3.0).is_none());
        assert!(fourier_power(&plane, 4, &Region::new(2, 2, 4, 4), 3.0).is_none(), "Region outside the plane");
    }
}
