//! Ensemble score fusion
//!
//! Blends the general-purpose classifier's fake-probability with the
//! fine-tuned specialist's for one face. The specialist is optional: when
//! its weight file is missing at startup the scorer degrades to
//! general-model-only output, logged once per process.

use deepfake_classifier::{AttentionClassifier, ClassifierError, PatchEmbedder};
use deepfake_patch_sampler::PatchBag;
use once_cell::sync::OnceCell;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Fixed equal weighting between general and specialist probabilities.
/// Kept as trained/calibrated; there is no dynamic reweighting, and no
/// validation exists that this beats either model alone.
pub const FUSION_WEIGHT: f32 = 0.5;

static SPECIALIST_MISSING_LOGGED: OnceCell<()> = OnceCell::new();

/// Errors from ensemble construction or scoring
#[derive(Debug, Error)]
pub enum EnsembleError {
    #[error("General classifier unavailable: {0}")]
    GeneralModel(String),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),
}

/// Fuse a general probability with an optional specialist probability
///
/// Equal 0.5/0.5 split when both are present; identity when the specialist
/// is absent (fusion weight effectively 1.0 on the general model).
#[must_use]
pub fn fuse(general: f32, specialist: Option<f32>) -> f32 {
    match specialist {
        Some(fine) => FUSION_WEIGHT * general + (1.0 - FUSION_WEIGHT) * fine,
        None => general,
    }
}

/// General + optional specialist classifier pair scoring one bag at a time
pub struct EnsembleScorer {
    general: AttentionClassifier,
    specialist: Option<AttentionClassifier>,
}

impl EnsembleScorer {
    /// Assemble from already-built classifiers (tests inject stubs here)
    #[must_use]
    pub fn new(general: AttentionClassifier, specialist: Option<AttentionClassifier>) -> Self {
        Self {
            general,
            specialist,
        }
    }

    /// Load both classifiers over a shared backbone
    ///
    /// The general head file is required; a missing specialist head file
    /// degrades to general-only scoring with a single warning.
    ///
    /// # Errors
    /// Returns `EnsembleError::GeneralModel` if the general heads cannot be
    /// loaded.
    pub fn load(
        backbone: Arc<dyn PatchEmbedder>,
        general_heads: &Path,
        specialist_heads: &Path,
    ) -> Result<Self, EnsembleError> {
        let general = AttentionClassifier::from_head_file(Arc::clone(&backbone), general_heads)
            .map_err(|e| EnsembleError::GeneralModel(e.to_string()))?;

        let specialist = if specialist_heads.exists() {
            let clf = AttentionClassifier::from_head_file(backbone, specialist_heads)?;
            info!("Specialist heads loaded from {}", specialist_heads.display());
            Some(clf)
        } else {
            SPECIALIST_MISSING_LOGGED.get_or_init(|| {
                warn!(
                    "Specialist heads not found at {}; scoring with general model only",
                    specialist_heads.display()
                );
            });
            None
        };

        Ok(Self::new(general, specialist))
    }

    /// Whether the specialist half of the ensemble is available
    #[must_use]
    pub fn has_specialist(&self) -> bool {
        self.specialist.is_some()
    }

    /// Model identifier string carried in verdict metadata
    #[must_use]
    pub fn model_identifier(&self) -> &'static str {
        if self.has_specialist() {
            "Ensemble-Calibrated-V2"
        } else {
            "General-Calibrated-V2"
        }
    }

    /// Fused fake-probability for one face's patch bag
    ///
    /// # Errors
    /// Returns `EnsembleError::Classifier` on inference failure in either
    /// model; partial results are not reported.
    pub fn score(&self, bag: &PatchBag) -> Result<f32, EnsembleError> {
        let general = self.general.fake_probability(bag)?;
        let specialist = match &self.specialist {
            Some(clf) => Some(clf.fake_probability(bag)?),
            None => None,
        };
        Ok(fuse(general, specialist))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deepfake_classifier::{AttentionHead, ClassifierHead, LinearLayer};
    use ndarray::{Array1, Array2, ArrayView4, Axis};

    const HIDDEN: usize = 4;

    /// Embedder whose bias nudges the fake logit to a chosen level
    struct BiasedEmbedder {
        level: f32,
    }

    impl PatchEmbedder for BiasedEmbedder {
        fn hidden_size(&self) -> usize {
            HIDDEN
        }

        fn embed(&self, patches: ArrayView4<'_, f32>) -> Result<Array2<f32>, ClassifierError> {
            let n = patches.shape()[0];
            let mut out = Array2::<f32>::zeros((n, HIDDEN));
            for i in 0..n {
                let mean = patches.index_axis(Axis(0), i).mean().unwrap_or(0.0);
                out[[i, 0]] = self.level;
                out[[i, 1]] = mean;
            }
            Ok(out)
        }
    }

    fn build_classifier(level: f32) -> AttentionClassifier {
        let fc1 = LinearLayer::new(Array2::ones((HIDDEN / 2, HIDDEN)) * 0.1, Array1::zeros(2));
        let fc2 = LinearLayer::new(Array2::ones((1, HIDDEN / 2)) * 0.1, Array1::zeros(1));
        // Fake logit scales with embedding channel 0
        let mut weight = Array2::<f32>::zeros((2, HIDDEN));
        weight[[1, 0]] = 1.0;
        let head = LinearLayer::new(weight, Array1::zeros(2));

        AttentionClassifier::new(
            Arc::new(BiasedEmbedder { level }),
            AttentionHead::new(fc1, fc2).unwrap(),
            ClassifierHead::new(head).unwrap(),
        )
        .unwrap()
    }

    fn bag() -> PatchBag {
        PatchBag::from_tensor(ndarray::Array4::from_elem((2, 3, 4, 4), 0.5)).unwrap()
    }

    #[test]
    fn test_fuse_identity_without_specialist() {
        assert_eq!(fuse(0.73, None), 0.73);
    }

    #[test]
    fn test_fuse_equal_weighting() {
        assert!((fuse(0.8, Some(0.4)) - 0.6).abs() < 1e-6);
        assert!((fuse(0.0, Some(1.0)) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_scorer_without_specialist_returns_general_probability() {
        let general = build_classifier(3.0);
        let expected = general.fake_probability(&bag()).unwrap();

        let scorer = EnsembleScorer::new(build_classifier(3.0), None);
        let scored = scorer.score(&bag()).unwrap();

        assert!((scored - expected).abs() < 1e-6);
        assert!(!scorer.has_specialist());
        assert_eq!(scorer.model_identifier(), "General-Calibrated-V2");
    }

    #[test]
    fn test_scorer_fuses_both_models() {
        let general_p = build_classifier(3.0).fake_probability(&bag()).unwrap();
        let specialist_p = build_classifier(-3.0).fake_probability(&bag()).unwrap();

        let scorer = EnsembleScorer::new(build_classifier(3.0), Some(build_classifier(-3.0)));
        let scored = scorer.score(&bag()).unwrap();

        assert!((scored - (0.5 * general_p + 0.5 * specialist_p)).abs() < 1e-6);
        assert_eq!(scorer.model_identifier(), "Ensemble-Calibrated-V2");
    }
}
