//! Autofocus for astronomical cameras
//!
//! Drives a focuser and camera through repeated capture, measure and move
//! cycles until the star blur metric reaches its minimum.
//!
//! ## Features
//!
//! - Slope-guided search with curve-fit refinement for absolute focusers
//! - Two-pass linear sweep with fitted V-curve minimum
//! - Step-halving search for relative-only focusers
//! - Travel, deadlock, fluctuation and iteration guards with typed failures
//! - Dark frame and defect map calibration from an async dark library
//! - Cancellable runs with a broadcast stream of progress events

pub mod algorithm;
pub mod config;
pub mod controller;
pub mod dark_library;
pub mod dark_processor;
pub mod device;
mod error;
pub mod events;
pub mod state;

pub use algorithm::{
    AbsoluteFocusAlgorithm, FocusDecision, FocusStrategy, LinearFocusAlgorithm, Measurement, RelativeFocusAlgorithm,
};
pub use config::{DarkConfig, FocusAlgorithm, FocusConfig, LinearFocusConfig, RelativeFocusConfig, TuningParameters};
pub use controller::{to_measurement, FocusController, FocusOutcome, FrameMeasurer};
pub use dark_library::{CalibrationEntry, ChipIdentity, DarkLibrary, InMemoryDarkLibrary, SharedDarkLibrary};
pub use dark_processor::{DarkProcessor, DenoiseMethod, DenoiseOutcome};
pub use device::{CaptureRequest, CapturedFrame, DeviceResult, FocusDevice, NullFocusDevice, SharedFocusDevice};
pub use error::{FocusError, FocusFailure, FocusResult};
pub use events::{FocusEvent, FocusState};
pub use state::{FocusDirection, FocusRunState, FocusSample};
