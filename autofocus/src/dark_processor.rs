//! Asynchronous dark calibration of focus frames
//!
//! The library lookup is awaited and the pixel work runs on the blocking
//! pool, so the controller never stalls on calibration. Missing calibration
//! data is a warning: the raw frame goes on to measurement unchanged.

use crate::dark_library::SharedDarkLibrary;
use crate::device::CapturedFrame;
use crate::error::{FocusError, FocusResult};
use starfocus_imaging::{normalize_defects, subtract, DefectMap, ImageFrame};
use std::sync::Arc;

/// What was done to a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenoiseMethod {
    /// Hot and cold pixels replaced by their neighbour median
    DefectMap { repaired: usize },
    /// Master dark subtracted
    DarkSubtraction,
}

#[derive(Debug, Clone)]
pub enum DenoiseOutcome {
    Denoised { frame: ImageFrame, method: DenoiseMethod },
    /// No usable calibration data; the frame is untouched
    Unmodified { frame: ImageFrame, warning: String },
}

impl DenoiseOutcome {
    pub fn frame(&self) -> &ImageFrame {
        match self {
            DenoiseOutcome::Denoised { frame, .. } | DenoiseOutcome::Unmodified { frame, .. } => frame,
        }
    }

    pub fn into_frame(self) -> ImageFrame {
        match self {
            DenoiseOutcome::Denoised { frame, .. } | DenoiseOutcome::Unmodified { frame, .. } => frame,
        }
    }
}

enum Calibration {
    Defects(Arc<DefectMap>),
    Dark(Arc<ImageFrame>),
}

fn apply(calibration: Calibration, mut frame: ImageFrame, offset_x: usize, offset_y: usize) -> DenoiseOutcome {
    let result = match &calibration {
        Calibration::Defects(map) => {
            normalize_defects(map, &mut frame, offset_x, offset_y).map(|repaired| DenoiseMethod::DefectMap { repaired })
        }
        Calibration::Dark(dark) => subtract(dark, &mut frame, offset_x, offset_y).map(|_| DenoiseMethod::DarkSubtraction),
    };
    match result {
        Ok(method) => DenoiseOutcome::Denoised { frame, method },
        Err(e) => DenoiseOutcome::Unmodified { frame, warning: e.to_string() },
    }
}

/// Applies the best dark-library match to captured frames
pub struct DarkProcessor {
    library: SharedDarkLibrary,
    use_defect_map: bool,
}

impl DarkProcessor {
    pub fn new(library: SharedDarkLibrary, use_defect_map: bool) -> Self {
        Self { library, use_defect_map }
    }

    /// Calibrate one capture.
    ///
    /// A defect map is preferred when enabled and available, then a master
    /// dark. Only a failure of the blocking task itself is an error.
    pub async fn denoise(&self, captured: CapturedFrame) -> FocusResult<DenoiseOutcome> {
        let CapturedFrame { frame, chip, exposure_secs, offset_x, offset_y, temperature } = captured;

        let mut calibration = None;
        if self.use_defect_map {
            calibration = self
                .library
                .find_defect_map(&chip, temperature, exposure_secs)
                .await
                .map(Calibration::Defects);
        }
        if calibration.is_none() {
            calibration = self
                .library
                .find_dark_frame(&chip, temperature, exposure_secs)
                .await
                .map(Calibration::Dark);
        }

        let Some(calibration) = calibration else {
            let warning = format!(
                "No suitable dark frame or defect map for {} ({}, bin {}) at {:.1}s",
                chip.device, chip.chip, chip.binning, exposure_secs
            );
            tracing::warn!("{}", warning);
            return Ok(DenoiseOutcome::Unmodified { frame, warning });
        };

        let outcome = tokio::task::spawn_blocking(move || apply(calibration, frame, offset_x, offset_y))
            .await
            .map_err(|e| FocusError::Calibration(e.to_string()))?;

        match &outcome {
            DenoiseOutcome::Denoised { method, .. } => tracing::debug!("Focus frame calibrated: {:?}", method),
            DenoiseOutcome::Unmodified { warning, .. } => tracing::warn!("Calibration skipped: {}", warning),
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dark_library::{CalibrationEntry, ChipIdentity, InMemoryDarkLibrary};

    fn chip() -> ChipIdentity {
        ChipIdentity::new("CCD Simulator", "primary", 1)
    }

    fn captured(offset: usize) -> CapturedFrame {
        let mut data = vec![500u16; 100 * 100];
        data[0] = 9000;
        CapturedFrame {
            frame: ImageFrame::new(100, 100, data).unwrap(),
            chip: chip(),
            exposure_secs: 2.0,
            offset_x: offset,
            offset_y: offset,
            temperature: Some(-10.0),
        }
    }

    async fn library_with_dark() -> Arc<InMemoryDarkLibrary> {
        let library = Arc::new(InMemoryDarkLibrary::new(2.0, 30));
        let dark = ImageFrame::new(200, 200, vec![100u16; 200 * 200]).unwrap();
        library.add_dark(CalibrationEntry::new(chip(), Some(-10.0), 2.0, dark)).await;
        library
    }

    #[tokio::test]
    async fn test_subtracts_dark_at_offset() {
        let processor = DarkProcessor::new(library_with_dark().await, true);
        let outcome = processor.denoise(captured(50)).await.unwrap();
        match &outcome {
            DenoiseOutcome::Denoised { method, .. } => assert_eq!(*method, DenoiseMethod::DarkSubtraction),
            other => panic!("Expected a dark subtraction, got {:?}", other),
        }
        assert_eq!(outcome.frame().value(5, 5), Some(400.0));
    }

    #[tokio::test]
    async fn test_prefers_defect_map() {
        let library = library_with_dark().await;
        let map = DefectMap { width: 200, height: 200, hot: vec![(50, 50)], cold: Vec::new() };
        library.add_defect_map(CalibrationEntry::new(chip(), Some(-10.0), 2.0, map)).await;

        let outcome = DarkProcessor::new(library.clone(), true).denoise(captured(50)).await.unwrap();
        assert!(
            matches!(outcome, DenoiseOutcome::Denoised { method: DenoiseMethod::DefectMap { repaired: 1 }, .. }),
            "Got {:?}",
            outcome
        );
        assert_eq!(outcome.frame().value(0, 0), Some(500.0), "Hot pixel replaced by its neighbours");

        let outcome = DarkProcessor::new(library, false).denoise(captured(50)).await.unwrap();
        assert!(matches!(outcome, DenoiseOutcome::Denoised { method: DenoiseMethod::DarkSubtraction, .. }));
    }

    #[tokio::test]
    async fn test_missing_calibration_is_a_warning() {
        let library = Arc::new(InMemoryDarkLibrary::new(2.0, 30));
        let outcome = DarkProcessor::new(library, true).denoise(captured(0)).await.unwrap();
        match outcome {
            DenoiseOutcome::Unmodified { frame, warning } => {
                assert_eq!(frame.value(0, 0), Some(9000.0), "Frame must be passed through untouched");
                assert!(warning.contains("No suitable dark"), "Warning: {}", warning);
            }
            other => panic!("Expected an unmodified frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_out_of_bounds_dark_leaves_frame_unmodified() {
        let processor = DarkProcessor::new(library_with_dark().await, false);
        let outcome = processor.denoise(captured(150)).await.unwrap();
        assert!(matches!(outcome, DenoiseOutcome::Unmodified { .. }), "Got {:?}", outcome);
        assert_eq!(outcome.frame().value(1, 1), Some(500.0));
    }
}
