//! Calibrated decision engine
//!
//! Aggregates a set of per-face (or per-frame-face) fake-probabilities into
//! one label and confidence. The policy is deliberately asymmetric: a
//! false-REAL near the boundary is tolerated more than a false-FAKE, and a
//! high but inconsistent score is downgraded to UNCERTAIN instead of being
//! averaged into a FAKE call.

use deepfake_common::Label;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur loading decision thresholds
#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("Failed to read threshold file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse threshold file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid threshold value: {0}")]
    InvalidThreshold(String),
}

/// Calibration constants for the decision policy
///
/// Derived offline from held-out class-conditional score distributions:
/// `real_percentile` is the 95th percentile of the real-class score
/// distribution, `consistency` bounds the standard deviation below which a
/// high median is trusted as FAKE (the fake-class 5th percentile informs the
/// same calibration run). Re-derive whenever the classifier weights change.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecisionThresholds {
    /// Scores at or below this median lean REAL (default 0.8926)
    pub real_percentile: f64,
    /// Maximum standard deviation for a FAKE call (default 0.15)
    pub consistency: f64,
}

impl Default for DecisionThresholds {
    fn default() -> Self {
        Self {
            real_percentile: 0.8926,
            consistency: 0.15,
        }
    }
}

impl DecisionThresholds {
    /// Load thresholds from a JSON file
    ///
    /// # Errors
    /// Returns `DecisionError` if the file is unreadable, malformed, or
    /// carries values outside [0, 1].
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, DecisionError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let thresholds: DecisionThresholds = serde_json::from_str(&contents)?;
        thresholds.validate()?;

        debug!(
            "Loaded decision thresholds from {:?}: real_percentile={}, consistency={}",
            path.as_ref(),
            thresholds.real_percentile,
            thresholds.consistency
        );

        Ok(thresholds)
    }

    fn validate(&self) -> Result<(), DecisionError> {
        if !(0.0..=1.0).contains(&self.real_percentile) {
            return Err(DecisionError::InvalidThreshold(format!(
                "real_percentile must be in [0, 1], got {}",
                self.real_percentile
            )));
        }
        if !(0.0..=1.0).contains(&self.consistency) {
            return Err(DecisionError::InvalidThreshold(format!(
                "consistency must be in [0, 1], got {}",
                self.consistency
            )));
        }
        Ok(())
    }
}

/// Outcome of the decision policy for one media unit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub label: Label,
    pub confidence: f64,
    /// Median fake-probability across the input set
    pub median: f64,
    /// Population standard deviation across the input set
    pub std_dev: f64,
}

/// Apply the calibrated decision policy to a set of fake-probabilities
///
/// Ordered policy, first match wins:
/// 1. Empty set -> NO_FACE, confidence 0 (no statistics computed)
/// 2. median <= real_percentile -> REAL, confidence 1 - median
/// 3. median > real_percentile and std <= consistency -> FAKE, confidence median
/// 4. Otherwise -> UNCERTAIN, confidence 0.5
#[must_use]
pub fn decide(fake_probs: &[f32], thresholds: &DecisionThresholds) -> Decision {
    if fake_probs.is_empty() {
        return Decision {
            label: Label::NoFace,
            confidence: 0.0,
            median: 0.0,
            std_dev: 0.0,
        };
    }

    let median_p = median(fake_probs);
    let std_p = std_dev(fake_probs);

    if median_p <= thresholds.real_percentile {
        // High-but-below-threshold scores are treated as noisy real images
        return Decision {
            label: Label::Real,
            confidence: 1.0 - median_p,
            median: median_p,
            std_dev: std_p,
        };
    }

    if std_p <= thresholds.consistency {
        return Decision {
            label: Label::Fake,
            confidence: median_p,
            median: median_p,
            std_dev: std_p,
        };
    }

    // High score but inconsistent across faces/frames: unreliable signal
    Decision {
        label: Label::Uncertain,
        confidence: 0.5,
        median: median_p,
        std_dev: std_p,
    }
}

/// Median with mean-of-middle-two semantics for even-length input
fn median(values: &[f32]) -> f64 {
    let mut sorted: Vec<f64> = values.iter().map(|&v| f64::from(v)).collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Population standard deviation
fn std_dev(values: &[f32]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
    let variance = values
        .iter()
        .map(|&v| {
            let d = f64::from(v) - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_set_is_no_face() {
        let decision = decide(&[], &DecisionThresholds::default());
        assert_eq!(decision.label, Label::NoFace);
        assert_eq!(decision.confidence, 0.0);
        assert_eq!(decision.median, 0.0);
        assert_eq!(decision.std_dev, 0.0);
    }

    #[test]
    fn test_low_median_is_real_regardless_of_spread() {
        // Median 0.2 with one wild outlier still lands REAL
        let decision = decide(&[0.1, 0.2, 0.9], &DecisionThresholds::default());
        assert_eq!(decision.label, Label::Real);
        assert!((decision.median - 0.2).abs() < 1e-6);
        assert!((decision.confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_high_consistent_median_is_fake() {
        let decision = decide(&[0.90, 0.92, 0.93], &DecisionThresholds::default());
        assert_eq!(decision.label, Label::Fake);
        assert!((decision.median - 0.92).abs() < 1e-6);
        assert!((decision.confidence - 0.92).abs() < 1e-6);
        assert!(decision.std_dev <= 0.15);
    }

    #[test]
    fn test_high_inconsistent_median_is_uncertain() {
        let decision = decide(&[0.95, 0.40, 0.91], &DecisionThresholds::default());
        assert_eq!(decision.label, Label::Uncertain);
        assert_eq!(decision.confidence, 0.5);
        assert!(decision.std_dev > 0.15);
    }

    #[test]
    fn test_median_at_threshold_is_real() {
        // Boundary case: median exactly at the threshold leans REAL
        let decision = decide(&[0.8926], &DecisionThresholds::default());
        assert_eq!(decision.label, Label::Real);
    }

    #[test]
    fn test_even_length_median() {
        let decision = decide(&[0.1, 0.2, 0.3, 0.4], &DecisionThresholds::default());
        assert!((decision.median - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_single_probability() {
        let decision = decide(&[0.95], &DecisionThresholds::default());
        // std of a single value is 0, so this is a consistent FAKE
        assert_eq!(decision.label, Label::Fake);
        assert!((decision.confidence - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_population_std_dev() {
        let values = [0.2_f32, 0.4, 0.6, 0.8];
        // mean 0.5, variance (0.09+0.01+0.01+0.09)/4 = 0.05; inputs are f32,
        // so the widened result carries ~1e-8 representation error
        assert!((std_dev(&values) - 0.05_f64.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_defaults() {
        let thresholds = DecisionThresholds::default();
        assert_eq!(thresholds.real_percentile, 0.8926);
        assert_eq!(thresholds.consistency, 0.15);
    }

    #[test]
    fn test_threshold_file_roundtrip() {
        let dir = std::env::temp_dir();
        let path = dir.join("deepfake_decision_thresholds_test.json");
        let custom = DecisionThresholds {
            real_percentile: 0.75,
            consistency: 0.2,
        };
        std::fs::write(&path, serde_json::to_string(&custom).unwrap()).unwrap();

        let loaded = DecisionThresholds::from_file(&path).unwrap();
        assert_eq!(loaded, custom);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_threshold_file_rejects_out_of_range() {
        let dir = std::env::temp_dir();
        let path = dir.join("deepfake_decision_thresholds_bad.json");
        std::fs::write(&path, r#"{"real_percentile": 1.5, "consistency": 0.15}"#).unwrap();

        let result = DecisionThresholds::from_file(&path);
        assert!(matches!(result, Err(DecisionError::InvalidThreshold(_))));

        std::fs::remove_file(&path).ok();
    }
}
