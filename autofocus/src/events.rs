//! Notification stream of the focus controller

use serde::{Deserialize, Serialize};

/// State of the focus controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FocusState {
    #[default]
    Idle,
    Capturing,
    Measuring,
    Moving,
    Converged,
    Failed,
    Aborted,
    /// Continuous capture without focus decisions
    Looping,
}

impl FocusState {
    pub fn is_active(self) -> bool {
        matches!(self, FocusState::Capturing | FocusState::Measuring | FocusState::Moving | FocusState::Looping)
    }
}

/// Event emitted by the controller. Purely observational.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FocusEvent {
    StateChanged(FocusState),
    /// Human-readable progress line
    Message(String),
    SampleMeasured {
        position: i32,
        /// Metric as reported by the extractor
        value: f64,
        weight: f64,
        star_count: usize,
    },
    /// Sent once when a run ends
    Completed {
        success: bool,
        position: i32,
        metric: Option<f64>,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_serialize() {
        let event = FocusEvent::Completed { success: true, position: 5300, metric: Some(1.5), message: "done".into() };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"Completed\""), "Externally tagged: {}", json);
        let back: FocusEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_active_states() {
        assert!(FocusState::Capturing.is_active());
        assert!(FocusState::Looping.is_active());
        assert!(!FocusState::Converged.is_active());
        assert!(!FocusState::default().is_active());
    }
}
