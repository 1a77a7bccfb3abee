//! Error types for the autofocus controller
//!
//! Run-terminating conditions that the focus loop decides on itself are
//! [`FocusFailure`]s. Everything the caller has to react to (device faults,
//! cancellation, bad configuration) is a [`FocusError`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a run stopped without reaching focus
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FocusFailure {
    #[error("Failed to reach focus within {0} iterations")]
    MaxIterations(u32),

    #[error("Travel limits met at position {position}, cannot bracket a minimum")]
    Deadlock { position: i32 },

    #[error("Target {target} lies beyond the maximum travel from start position {start}")]
    MaxTravel { target: i32, start: i32 },

    #[error("Change in metric is too small after {iterations} iterations, step size is too coarse")]
    StepTooCoarse { iterations: u32 },

    #[error("Focuser reached its limits at position {position} without finding focus")]
    DeviceLimits { position: i32 },

    #[error("Metric fluctuated {fluctuations} times, seeing or focuser is unstable")]
    Unstable { fluctuations: u32 },

    #[error("Step size underflow ({pulse} <= {minimum}), try a larger tolerance")]
    StepUnderflow { pulse: i32, minimum: i32 },

    #[error("No stars detected in any focus frame")]
    NoStars,
}

/// Errors reported by the focus controller
#[derive(Error, Debug, Clone)]
pub enum FocusError {
    // =========================================================================
    // Run outcome
    // =========================================================================

    #[error("Autofocus failed: {0}")]
    Failed(FocusFailure),

    #[error("Autofocus aborted")]
    Aborted,

    #[error("Autofocus is already running")]
    AlreadyRunning,

    // =========================================================================
    // Device errors
    // =========================================================================

    #[error("Device error during {operation}: {message}")]
    Device {
        operation: String,
        message: String,
    },

    #[error("Focuser or camera not connected")]
    NotConnected,

    #[error("Device disconnected during {0}")]
    Disconnected(String),

    // =========================================================================
    // Processing errors
    // =========================================================================

    #[error("Frame calibration failed: {0}")]
    Calibration(String),

    // =========================================================================
    // Configuration errors
    // =========================================================================

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration parse error: {0}")]
    Config(String),
}

impl FocusError {
    pub fn device(operation: &str, message: impl Into<String>) -> Self {
        FocusError::Device {
            operation: operation.to_string(),
            message: message.into(),
        }
    }
}

impl From<FocusFailure> for FocusError {
    fn from(failure: FocusFailure) -> Self {
        FocusError::Failed(failure)
    }
}

impl From<serde_json::Error> for FocusError {
    fn from(e: serde_json::Error) -> Self {
        FocusError::Config(e.to_string())
    }
}

pub type FocusResult<T> = Result<T, FocusError>;
