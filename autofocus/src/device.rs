//! Device capability used by the focus loop
//!
//! The controller talks to the focuser and camera only through
//! [`FocusDevice`]. Driver stacks implement it; tests script it.

use crate::dark_library::ChipIdentity;
use crate::state::FocusDirection;
use async_trait::async_trait;
use starfocus_imaging::{ImageFrame, Region};
use std::sync::Arc;

/// Result type for device operations
pub type DeviceResult<T> = Result<T, String>;

/// One focus-frame exposure
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub exposure_secs: f64,
    /// Sub-frame in sensor pixels, whole sensor when `None`
    pub region: Option<Region>,
    pub binning: u32,
}

/// A completed exposure
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub frame: ImageFrame,
    pub chip: ChipIdentity,
    pub exposure_secs: f64,
    /// Sub-frame origin on the sensor, for calibration lookups
    pub offset_x: usize,
    pub offset_y: usize,
    /// Sensor temperature in °C, when the camera reports one
    pub temperature: Option<f64>,
}

/// Focuser and camera operations needed by autofocus
#[async_trait]
pub trait FocusDevice: Send + Sync {
    // =========================================================================
    // STATUS
    // =========================================================================

    /// Both focuser and camera are connected
    async fn is_connected(&self) -> bool;

    /// Focuser reports absolute positions
    async fn can_absolute_move(&self) -> bool;

    // =========================================================================
    // FOCUSER OPERATIONS
    // =========================================================================

    /// Current focuser position in steps
    async fn focuser_position(&self) -> DeviceResult<i32>;

    /// Mechanical travel range (min, max)
    async fn focuser_limits(&self) -> DeviceResult<(i32, i32)>;

    /// Move to an absolute position, resolving once the move completes
    async fn move_absolute(&self, position: i32) -> DeviceResult<()>;

    /// Move by `steps` (or a timed pulse) in `direction`
    async fn move_relative(&self, steps: i32, direction: FocusDirection) -> DeviceResult<()>;

    // =========================================================================
    // CAMERA OPERATIONS
    // =========================================================================

    /// Expose and download one frame
    async fn capture(&self, request: &CaptureRequest) -> DeviceResult<CapturedFrame>;

    /// Stop any pending move or exposure
    async fn abort(&self) -> DeviceResult<()>;
}

pub type SharedFocusDevice = Arc<dyn FocusDevice>;

/// Device that logs every call and returns blank frames
pub struct NullFocusDevice {
    width: usize,
    height: usize,
}

impl NullFocusDevice {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }
}

impl Default for NullFocusDevice {
    fn default() -> Self {
        Self::new(64, 64)
    }
}

#[async_trait]
impl FocusDevice for NullFocusDevice {
    async fn is_connected(&self) -> bool {
        true
    }

    async fn can_absolute_move(&self) -> bool {
        true
    }

    async fn focuser_position(&self) -> DeviceResult<i32> {
        Ok(25_000)
    }

    async fn focuser_limits(&self) -> DeviceResult<(i32, i32)> {
        Ok((0, 50_000))
    }

    async fn move_absolute(&self, position: i32) -> DeviceResult<()> {
        tracing::info!("[NULL] Focuser move to {}", position);
        Ok(())
    }

    async fn move_relative(&self, steps: i32, direction: FocusDirection) -> DeviceResult<()> {
        tracing::info!("[NULL] Focuser move {:?} by {}", direction, steps);
        Ok(())
    }

    async fn capture(&self, request: &CaptureRequest) -> DeviceResult<CapturedFrame> {
        tracing::info!("[NULL] Capturing {:.1}s focus frame, bin {}", request.exposure_secs, request.binning);
        let region = request.region.unwrap_or_else(|| Region::full(self.width, self.height));
        let frame = ImageFrame::new(region.width, region.height, vec![0u16; region.width * region.height])
            .map_err(|e| e.to_string())?;
        Ok(CapturedFrame {
            frame,
            chip: ChipIdentity::new("Null Camera", "primary", request.binning),
            exposure_secs: request.exposure_secs,
            offset_x: region.x,
            offset_y: region.y,
            temperature: None,
        })
    }

    async fn abort(&self) -> DeviceResult<()> {
        tracing::info!("[NULL] Aborting focuser and exposure");
        Ok(())
    }
}
