//! Frame handling and star metrics for autofocus
//!
//! ## Features
//!
//! - Typed single-channel frames over eight sample kinds with one generic visitor
//! - Centroid, threshold and gradient star detectors behind a shared trait
//! - HFR, Gaussian-fit FWHM and Fourier-power frame metrics
//! - Dark subtraction and hot/cold pixel repair for sub-framed lights

pub mod dark;
pub mod detect;
pub mod fourier;
pub mod metric;
pub mod pixel;
pub mod stats;

pub use dark::{normalize_defects, subtract, DarkError, DefectMap};
pub use detect::{
    detect_stars, search_region, Detector, DetectorConfig, DetectorKind, FrameMode, Region, StarCandidate, StarDetector,
};
pub use fourier::{fourier_power, tiled_fourier_power};
pub use metric::{FrameMetric, MetricConfig, MetricKind, StarMetricExtractor, INVALID_MEASURE};
pub use pixel::{FrameError, FrameStatistics, ImageFrame, Pixel, PixelBuffer, PixelVisitor, PixelVisitorMut, SampleType};
