//! Dark-frame subtraction and hot/cold pixel repair
//!
//! Both operations work on a light frame that may be a sub-frame of the
//! calibration data: light pixel `(x, y)` corresponds to calibration pixel
//! `(x + offset_x, y + offset_y)`.

use crate::pixel::{ImageFrame, Pixel, PixelBuffer, PixelVisitorMut, SampleType};
use crate::stats::median;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DarkError {
    #[error("Dark frame holds {dark:?} samples but the light frame holds {light:?}")]
    SampleTypeMismatch {
        dark: SampleType,
        light: SampleType,
    },

    #[error(
        "Light frame {light_width}x{light_height} at offset ({offset_x}, {offset_y}) exceeds calibration frame {dark_width}x{dark_height}"
    )]
    OutOfBounds {
        light_width: usize,
        light_height: usize,
        offset_x: usize,
        offset_y: usize,
        dark_width: usize,
        dark_height: usize,
    },
}

fn check_bounds(
    light: &ImageFrame,
    offset_x: usize,
    offset_y: usize,
    dark_width: usize,
    dark_height: usize,
) -> Result<(), DarkError> {
    if light.width() + offset_x > dark_width || light.height() + offset_y > dark_height {
        return Err(DarkError::OutOfBounds {
            light_width: light.width(),
            light_height: light.height(),
            offset_x,
            offset_y,
            dark_width,
            dark_height,
        });
    }
    Ok(())
}

struct SubtractDark<'a> {
    dark: &'a PixelBuffer,
    dark_width: usize,
    light_width: usize,
    offset_x: usize,
    offset_y: usize,
}

impl PixelVisitorMut for SubtractDark<'_> {
    type Output = Result<(), DarkError>;

    fn visit_mut<T: Pixel>(self, light: &mut [T]) -> Self::Output {
        let dark = T::slice_of(self.dark).ok_or(DarkError::SampleTypeMismatch {
            dark: self.dark.sample_type(),
            light: T::SAMPLE_TYPE,
        })?;
        for (y, row) in light.chunks_exact_mut(self.light_width).enumerate() {
            let start = (y + self.offset_y) * self.dark_width + self.offset_x;
            let dark_row = &dark[start..start + self.light_width];
            for (pixel, &d) in row.iter_mut().zip(dark_row) {
                *pixel = pixel.clamped_sub(d);
            }
        }
        Ok(())
    }
}

/// `light = max(light - dark, 0)` over the overlapping window, in the light
/// frame's own sample type. Statistics are refreshed afterwards.
pub fn subtract(dark: &ImageFrame, light: &mut ImageFrame, offset_x: usize, offset_y: usize) -> Result<(), DarkError> {
    if dark.sample_type() != light.sample_type() {
        return Err(DarkError::SampleTypeMismatch {
            dark: dark.sample_type(),
            light: light.sample_type(),
        });
    }
    check_bounds(light, offset_x, offset_y, dark.width(), dark.height())?;

    let light_width = light.width();
    light.buffer_mut().accept_mut(SubtractDark {
        dark: dark.buffer(),
        dark_width: dark.width(),
        light_width,
        offset_x,
        offset_y,
    })?;
    light.recompute_statistics();
    Ok(())
}

/// Hot and cold pixel coordinates in calibration-frame space
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefectMap {
    pub width: usize,
    pub height: usize,
    pub hot: Vec<(usize, usize)>,
    pub cold: Vec<(usize, usize)>,
}

impl DefectMap {
    /// Classify pixels of a master dark more than `hot_sigma` above or
    /// `cold_sigma` below its median.
    pub fn from_dark(dark: &ImageFrame, hot_sigma: f64, cold_sigma: f64) -> Self {
        let stats = dark.statistics();
        let hot_level = stats.median + hot_sigma * stats.stddev;
        let cold_level = stats.median - cold_sigma * stats.stddev;
        let width = dark.width();

        let mut map = DefectMap { width, height: dark.height(), ..Default::default() };
        if stats.stddev <= 0.0 {
            return map;
        }
        for (idx, v) in dark.to_f64().into_iter().enumerate() {
            if v > hot_level {
                map.hot.push((idx % width, idx / width));
            } else if v < cold_level {
                map.cold.push((idx % width, idx / width));
            }
        }
        tracing::debug!("Defect map: {} hot, {} cold pixels", map.hot.len(), map.cold.len());
        map
    }

    pub fn len(&self) -> usize {
        self.hot.len() + self.cold.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn defects(&self) -> impl Iterator<Item = &(usize, usize)> {
        self.hot.iter().chain(self.cold.iter())
    }
}

struct RepairDefects {
    defects: Vec<(usize, usize)>,
    width: usize,
    height: usize,
}

impl PixelVisitorMut for RepairDefects {
    type Output = usize;

    fn visit_mut<T: Pixel>(self, data: &mut [T]) -> usize {
        let original: Vec<f64> = data.iter().map(|v| v.to_f64()).collect();
        let mut neighbours = Vec::with_capacity(8);
        let mut repaired = 0;

        for &(x, y) in &self.defects {
            neighbours.clear();
            for ny in y.saturating_sub(1)..=(y + 1).min(self.height - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(self.width - 1) {
                    if (nx, ny) != (x, y) {
                        neighbours.push(original[ny * self.width + nx]);
                    }
                }
            }
            if let Some(m) = median(&neighbours) {
                data[y * self.width + x] = T::from_f64(m);
                repaired += 1;
            }
        }
        repaired
    }
}

/// Replace every defect inside the light window with the median of its
/// in-bounds 8 neighbours, read from the unmodified frame. Returns the number
/// of repaired pixels.
pub fn normalize_defects(
    map: &DefectMap,
    light: &mut ImageFrame,
    offset_x: usize,
    offset_y: usize,
) -> Result<usize, DarkError> {
    check_bounds(light, offset_x, offset_y, map.width, map.height)?;

    let (width, height) = (light.width(), light.height());
    let defects: Vec<(usize, usize)> = map
        .defects()
        .filter_map(|&(x, y)| {
            let lx = x.checked_sub(offset_x)?;
            let ly = y.checked_sub(offset_y)?;
            (lx < width && ly < height).then_some((lx, ly))
        })
        .collect();

    let repaired = light.buffer_mut().accept_mut(RepairDefects { defects, width, height });
    light.recompute_statistics();
    Ok(repaired)
}
