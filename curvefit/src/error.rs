//! Error types for curve fitting

use crate::model::CurveKind;
use thiserror::Error;

/// Reasons a fit can be rejected.
///
/// A failed fit is never fatal to the caller: the autofocus loop treats it as
/// "keep probing" and falls back to trend-following.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    // =========================================================================
    // Input validation
    // =========================================================================

    #[error("Position/metric length mismatch: {positions} positions, {metrics} metrics")]
    LengthMismatch {
        positions: usize,
        metrics: usize,
    },

    #[error("Sigma length mismatch: expected {expected}, got {actual}")]
    SigmaLengthMismatch {
        expected: usize,
        actual: usize,
    },

    #[error("Not enough points for {kind:?} fit: need {required}, got {actual}")]
    NotEnoughPoints {
        kind: CurveKind,
        required: usize,
        actual: usize,
    },

    #[error("Non-finite sample at index {0}")]
    NonFiniteInput(usize),

    #[error("Invalid sigma {sigma} at index {index}")]
    InvalidSigma {
        index: usize,
        sigma: f64,
    },

    // =========================================================================
    // Solver failures
    // =========================================================================

    #[error("Normal equations are singular")]
    Singular,

    #[error("Solver did not converge after {0} iterations")]
    NotConverged(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = FitError::LengthMismatch { positions: 5, metrics: 4 };
        assert!(err.to_string().contains("5 positions"), "Should name the position count");

        let err = FitError::NotEnoughPoints { kind: CurveKind::Hyperbola, required: 4, actual: 2 };
        let msg = err.to_string();
        assert!(msg.contains("Hyperbola") && msg.contains("need 4"), "Got: {}", msg);
    }
}
