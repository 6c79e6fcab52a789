//! Multi-instance attention classifier
//!
//! Scores one patch bag as real/fake: patches run through a shared frozen
//! ViT backbone, a tiny attention MLP weights each patch embedding, and a
//! linear head maps the attention-pooled embedding to 2 logits. Attention
//! weights are softmax-normalized across the bag, so they are strictly
//! positive and sum to 1 for any bag length.

pub mod heads;

use deepfake_common::onnx;
use deepfake_patch_sampler::PatchBag;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayView4, Axis};
use ort::{session::Session, value::TensorRef};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::info;

pub use heads::{load_heads, AttentionHead, ClassifierHead, LinearLayer};

/// Index of the fake class in the 2-logit head output
pub const FAKE_CLASS_INDEX: usize = 1;

/// Errors that can occur during classification
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Bad weight file: {0}")]
    WeightFormat(String),

    #[error("Embedding dimension mismatch: backbone produced {produced}, heads expect {expected}")]
    HiddenSizeMismatch { produced: usize, expected: usize },
}

impl From<onnx::OnnxError> for ClassifierError {
    fn from(err: onnx::OnnxError) -> Self {
        ClassifierError::ModelLoad(err.to_string())
    }
}

/// Source of per-patch embeddings
///
/// Implemented by the ONNX ViT backbone in production; tests substitute
/// deterministic stubs so head math can be exercised without model files.
pub trait PatchEmbedder: Send + Sync {
    /// Embedding dimensionality
    fn hidden_size(&self) -> usize;

    /// Embed a flattened batch of patches, (N, C, H, W) -> (N, hidden)
    fn embed(&self, patches: ArrayView4<'_, f32>) -> Result<Array2<f32>, ClassifierError>;
}

/// ViT patch backbone behind ONNX Runtime
///
/// Expects the exported graph to map (N, 3, 224, 224) pixel values to either
/// (N, hidden) CLS embeddings or (N, tokens, hidden) hidden states; in the
/// latter case the CLS token (index 0) is taken.
pub struct OnnxBackbone {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    hidden_size: usize,
}

impl OnnxBackbone {
    /// Load the backbone from an ONNX file
    ///
    /// # Errors
    /// Returns `ClassifierError::ModelLoad` if the session cannot be created.
    pub fn new<P: AsRef<Path>>(model_path: P, hidden_size: usize) -> Result<Self, ClassifierError> {
        let model_path = model_path.as_ref();
        info!("Loading patch backbone from {:?}", model_path);

        let session = onnx::create_session(model_path)?;

        let input_name = session
            .inputs
            .first()
            .ok_or_else(|| ClassifierError::ModelLoad("backbone has no inputs".into()))?
            .name
            .clone();
        let output_name = session
            .outputs
            .first()
            .ok_or_else(|| ClassifierError::ModelLoad("backbone has no outputs".into()))?
            .name
            .clone();

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            hidden_size,
        })
    }
}

impl PatchEmbedder for OnnxBackbone {
    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn embed(&self, patches: ArrayView4<'_, f32>) -> Result<Array2<f32>, ClassifierError> {
        let batch = patches.shape()[0];
        let input = patches.to_owned();

        let mut session = self
            .session
            .lock()
            .map_err(|_| ClassifierError::Inference("backbone session poisoned".into()))?;

        let input_tensor = TensorRef::from_array_view(input.view())
            .map_err(|e| ClassifierError::Inference(e.to_string()))?;
        let outputs = session
            .run(ort::inputs![&*self.input_name => input_tensor])
            .map_err(|e| ClassifierError::Inference(e.to_string()))?;

        let output = outputs
            .get(self.output_name.as_str())
            .unwrap_or(&outputs[0]);
        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::Inference(e.to_string()))?;

        let embeddings = match shape.len() {
            // (N, hidden): already pooled/CLS output
            2 => {
                let hidden = shape[1] as usize;
                Array2::from_shape_vec((batch, hidden), data.to_vec())
                    .map_err(|e| ClassifierError::Inference(e.to_string()))?
            }
            // (N, tokens, hidden): take the CLS token
            3 => {
                let tokens = shape[1] as usize;
                let hidden = shape[2] as usize;
                let mut cls = Array2::<f32>::zeros((batch, hidden));
                for i in 0..batch {
                    let offset = i * tokens * hidden;
                    cls.row_mut(i)
                        .assign(&ArrayView1::from(&data[offset..offset + hidden]));
                }
                cls
            }
            other => {
                return Err(ClassifierError::Inference(format!(
                    "unexpected backbone output rank {other} (shape {shape:?})"
                )))
            }
        };

        if embeddings.shape()[1] != self.hidden_size {
            return Err(ClassifierError::HiddenSizeMismatch {
                produced: embeddings.shape()[1],
                expected: self.hidden_size,
            });
        }

        Ok(embeddings)
    }
}

/// Attention-pooled 2-class patch bag classifier
pub struct AttentionClassifier {
    embedder: Arc<dyn PatchEmbedder>,
    attention: AttentionHead,
    head: ClassifierHead,
}

impl AttentionClassifier {
    /// Assemble a classifier from a backbone and loaded heads
    ///
    /// # Errors
    /// Returns `HiddenSizeMismatch` if the heads do not fit the backbone.
    pub fn new(
        embedder: Arc<dyn PatchEmbedder>,
        attention: AttentionHead,
        head: ClassifierHead,
    ) -> Result<Self, ClassifierError> {
        let hidden = embedder.hidden_size();
        if attention.input_size() != hidden || head.input_size() != hidden {
            return Err(ClassifierError::HiddenSizeMismatch {
                produced: hidden,
                expected: attention.input_size(),
            });
        }

        Ok(Self {
            embedder,
            attention,
            head,
        })
    }

    /// Load heads from a safetensors file and assemble the classifier
    ///
    /// # Errors
    /// Returns `ClassifierError` on missing/ill-shaped tensors.
    pub fn from_head_file<P: AsRef<Path>>(
        embedder: Arc<dyn PatchEmbedder>,
        head_path: P,
    ) -> Result<Self, ClassifierError> {
        let (attention, head) = load_heads(head_path.as_ref(), embedder.hidden_size())?;
        Self::new(embedder, attention, head)
    }

    /// Classify one bag, returning [`P(real)`, `P(fake)`]
    ///
    /// # Errors
    /// Returns `ClassifierError::Inference` on backbone failure.
    pub fn predict(&self, bag: &PatchBag) -> Result<[f32; 2], ClassifierError> {
        let embeddings = self.embedder.embed(bag.patches())?;
        Ok(self.classify_embeddings(embeddings.view()))
    }

    /// Fake-probability shortcut for one bag
    ///
    /// # Errors
    /// Returns `ClassifierError::Inference` on backbone failure.
    pub fn fake_probability(&self, bag: &PatchBag) -> Result<f32, ClassifierError> {
        Ok(self.predict(bag)?[FAKE_CLASS_INDEX])
    }

    /// Classify several bags with one flattened backbone pass
    ///
    /// Bags may have different lengths; embeddings are segmented back per
    /// bag before attention pooling, so results match per-bag `predict`.
    ///
    /// # Errors
    /// Returns `ClassifierError::Inference` on backbone failure.
    pub fn predict_batch(&self, bags: &[PatchBag]) -> Result<Vec<[f32; 2]>, ClassifierError> {
        if bags.is_empty() {
            return Ok(Vec::new());
        }

        let views: Vec<ArrayView4<'_, f32>> = bags.iter().map(|b| b.patches()).collect();
        let flattened = ndarray::concatenate(Axis(0), &views)
            .map_err(|e| ClassifierError::Inference(e.to_string()))?;

        let embeddings = self.embedder.embed(flattened.view())?;

        let mut results = Vec::with_capacity(bags.len());
        let mut offset = 0;
        for bag in bags {
            let segment = embeddings.slice(ndarray::s![offset..offset + bag.len(), ..]);
            results.push(self.classify_embeddings(segment));
            offset += bag.len();
        }

        Ok(results)
    }

    fn classify_embeddings(&self, embeddings: ArrayView2<'_, f32>) -> [f32; 2] {
        let weights = self.attention.weights(embeddings);

        let hidden = embeddings.shape()[1];
        let mut pooled = Array1::<f32>::zeros(hidden);
        for (i, row) in embeddings.rows().into_iter().enumerate() {
            pooled.scaled_add(weights[i], &row);
        }

        let logits = self.head.logits(pooled.view());
        let probs = softmax(logits.view());
        [probs[0], probs[1]]
    }
}

/// Numerically stable softmax
#[must_use]
pub fn softmax(logits: ArrayView1<'_, f32>) -> Array1<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Array1<f32> = logits.mapv(|v| (v - max).exp());
    let sum = exp.sum();
    exp / sum
}
