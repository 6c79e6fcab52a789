//! Attention and classification heads, loaded from safetensors exports
//!
//! The weight file contract follows the training export: a flat f32
//! safetensors file with tensors `attention.0.{weight,bias}` (hidden ->
//! hidden/2), `attention.2.{weight,bias}` (hidden/2 -> 1) and
//! `classifier.{weight,bias}` (hidden -> 2). Shapes are checked against the
//! backbone hidden size at load time.

use crate::ClassifierError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use safetensors::tensor::Dtype;
use safetensors::SafeTensors;
use std::path::Path;
use tracing::debug;

/// One dense layer, weight stored (out, in) as PyTorch exports it
#[derive(Debug, Clone)]
pub struct LinearLayer {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl LinearLayer {
    #[must_use]
    pub fn new(weight: Array2<f32>, bias: Array1<f32>) -> Self {
        Self { weight, bias }
    }

    #[must_use]
    pub fn input_size(&self) -> usize {
        self.weight.shape()[1]
    }

    #[must_use]
    pub fn output_size(&self) -> usize {
        self.weight.shape()[0]
    }

    /// Forward pass over a batch of rows, (n, in) -> (n, out)
    #[must_use]
    pub fn forward(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        x.dot(&self.weight.t()) + &self.bias
    }

    /// Forward pass for a single vector, (in,) -> (out,)
    #[must_use]
    pub fn forward_one(&self, x: ArrayView1<'_, f32>) -> Array1<f32> {
        self.weight.dot(&x) + &self.bias
    }
}

/// Two-layer attention scorer: Linear -> tanh -> Linear -> scalar
#[derive(Debug, Clone)]
pub struct AttentionHead {
    fc1: LinearLayer,
    fc2: LinearLayer,
}

impl AttentionHead {
    /// Build from its two layers, checking the hidden/2 -> 1 shape chain
    ///
    /// # Errors
    /// Returns `ClassifierError::WeightFormat` on inconsistent shapes.
    pub fn new(fc1: LinearLayer, fc2: LinearLayer) -> Result<Self, ClassifierError> {
        if fc2.input_size() != fc1.output_size() {
            return Err(ClassifierError::WeightFormat(format!(
                "attention layer chain mismatch: {} -> {}",
                fc1.output_size(),
                fc2.input_size()
            )));
        }
        if fc2.output_size() != 1 {
            return Err(ClassifierError::WeightFormat(format!(
                "attention scorer must emit 1 scalar, got {}",
                fc2.output_size()
            )));
        }
        Ok(Self { fc1, fc2 })
    }

    #[must_use]
    pub fn input_size(&self) -> usize {
        self.fc1.input_size()
    }

    /// Softmax-normalized attention weights across the bag dimension
    ///
    /// Strictly positive and summing to 1 for any bag length >= 1.
    #[must_use]
    pub fn weights(&self, embeddings: ArrayView2<'_, f32>) -> Array1<f32> {
        let hidden = self.fc1.forward(embeddings).mapv(f32::tanh);
        let scores = self.fc2.forward(hidden.view());
        let scores = scores.column(0).to_owned();
        crate::softmax(scores.view())
    }
}

/// Linear classification head mapping a pooled embedding to 2 logits
#[derive(Debug, Clone)]
pub struct ClassifierHead {
    linear: LinearLayer,
}

impl ClassifierHead {
    /// # Errors
    /// Returns `ClassifierError::WeightFormat` unless the head emits 2 logits.
    pub fn new(linear: LinearLayer) -> Result<Self, ClassifierError> {
        if linear.output_size() != 2 {
            return Err(ClassifierError::WeightFormat(format!(
                "classification head must emit 2 logits, got {}",
                linear.output_size()
            )));
        }
        Ok(Self { linear })
    }

    #[must_use]
    pub fn input_size(&self) -> usize {
        self.linear.input_size()
    }

    /// Raw logits for a pooled embedding; callers apply softmax
    #[must_use]
    pub fn logits(&self, pooled: ArrayView1<'_, f32>) -> Array1<f32> {
        self.linear.forward_one(pooled)
    }
}

/// Load attention and classification heads from a safetensors file
///
/// # Errors
/// Returns `ClassifierError::WeightFormat` on missing tensors, non-f32
/// dtypes, or shapes inconsistent with `hidden_size`.
pub fn load_heads(
    path: &Path,
    hidden_size: usize,
) -> Result<(AttentionHead, ClassifierHead), ClassifierError> {
    let buffer = std::fs::read(path).map_err(|e| {
        ClassifierError::WeightFormat(format!("cannot read {}: {e}", path.display()))
    })?;
    let tensors = SafeTensors::deserialize(&buffer)
        .map_err(|e| ClassifierError::WeightFormat(e.to_string()))?;

    let half = hidden_size / 2;

    let fc1 = LinearLayer::new(
        matrix(&tensors, "attention.0.weight", (half, hidden_size))?,
        vector(&tensors, "attention.0.bias", half)?,
    );
    let fc2 = LinearLayer::new(
        matrix(&tensors, "attention.2.weight", (1, half))?,
        vector(&tensors, "attention.2.bias", 1)?,
    );
    let classifier = LinearLayer::new(
        matrix(&tensors, "classifier.weight", (2, hidden_size))?,
        vector(&tensors, "classifier.bias", 2)?,
    );

    debug!(
        "Loaded heads from {} (hidden_size={})",
        path.display(),
        hidden_size
    );

    Ok((AttentionHead::new(fc1, fc2)?, ClassifierHead::new(classifier)?))
}

fn raw_f32(
    tensors: &SafeTensors<'_>,
    name: &str,
    expected_shape: &[usize],
) -> Result<Vec<f32>, ClassifierError> {
    let view = tensors
        .tensor(name)
        .map_err(|e| ClassifierError::WeightFormat(format!("missing tensor {name}: {e}")))?;

    if view.dtype() != Dtype::F32 {
        return Err(ClassifierError::WeightFormat(format!(
            "tensor {name} must be f32, got {:?}",
            view.dtype()
        )));
    }
    if view.shape() != expected_shape {
        return Err(ClassifierError::WeightFormat(format!(
            "tensor {name} has shape {:?}, expected {expected_shape:?}",
            view.shape()
        )));
    }

    // pod_collect_to_vec copes with unaligned safetensors payloads
    Ok(bytemuck::pod_collect_to_vec(view.data()))
}

fn matrix(
    tensors: &SafeTensors<'_>,
    name: &str,
    shape: (usize, usize),
) -> Result<Array2<f32>, ClassifierError> {
    let data = raw_f32(tensors, name, &[shape.0, shape.1])?;
    Array2::from_shape_vec(shape, data).map_err(|e| ClassifierError::WeightFormat(e.to_string()))
}

fn vector(
    tensors: &SafeTensors<'_>,
    name: &str,
    len: usize,
) -> Result<Array1<f32>, ClassifierError> {
    let data = raw_f32(tensors, name, &[len])?;
    Ok(Array1::from_vec(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use safetensors::tensor::TensorView;
    use std::collections::HashMap;

    fn serialize_heads(hidden: usize) -> Vec<u8> {
        let half = hidden / 2;
        let entries: Vec<(String, Vec<usize>, usize)> = vec![
            ("attention.0.weight".into(), vec![half, hidden], half * hidden),
            ("attention.0.bias".into(), vec![half], half),
            ("attention.2.weight".into(), vec![1, half], half),
            ("attention.2.bias".into(), vec![1], 1),
            ("classifier.weight".into(), vec![2, hidden], 2 * hidden),
            ("classifier.bias".into(), vec![2], 2),
        ];

        let buffers: Vec<Vec<u8>> = entries
            .iter()
            .map(|(_, _, count)| {
                let values: Vec<f32> = (0..*count).map(|i| (i as f32 * 0.01).sin()).collect();
                bytemuck::cast_slice(&values).to_vec()
            })
            .collect();

        let mut views = HashMap::new();
        for ((name, shape, _), buffer) in entries.iter().zip(&buffers) {
            views.insert(
                name.clone(),
                TensorView::new(Dtype::F32, shape.clone(), buffer).unwrap(),
            );
        }

        safetensors::serialize(&views, &None).unwrap()
    }

    #[test]
    fn test_load_heads_roundtrip() {
        let hidden = 16;
        let path = std::env::temp_dir().join("deepfake_classifier_heads_test.safetensors");
        std::fs::write(&path, serialize_heads(hidden)).unwrap();

        let (attention, head) = load_heads(&path, hidden).unwrap();
        assert_eq!(attention.input_size(), hidden);
        assert_eq!(head.input_size(), hidden);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_heads_rejects_wrong_hidden_size() {
        let path = std::env::temp_dir().join("deepfake_classifier_heads_wrong.safetensors");
        std::fs::write(&path, serialize_heads(16)).unwrap();

        let result = load_heads(&path, 32);
        assert!(matches!(result, Err(ClassifierError::WeightFormat(_))));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_linear_forward() {
        let layer = LinearLayer::new(
            Array2::from_shape_vec((2, 3), vec![1.0, 0.0, 0.0, 0.0, 1.0, 1.0]).unwrap(),
            Array1::from_vec(vec![0.5, -0.5]),
        );

        let x = Array2::from_shape_vec((1, 3), vec![2.0, 3.0, 4.0]).unwrap();
        let out = layer.forward(x.view());
        assert_eq!(out.shape(), &[1, 2]);
        assert!((out[[0, 0]] - 2.5).abs() < 1e-6);
        assert!((out[[0, 1]] - 6.5).abs() < 1e-6);

        let one = layer.forward_one(x.row(0));
        assert!((one[0] - 2.5).abs() < 1e-6);
        assert!((one[1] - 6.5).abs() < 1e-6);
    }

    #[test]
    fn test_attention_head_rejects_bad_chain() {
        let fc1 = LinearLayer::new(Array2::zeros((4, 8)), Array1::zeros(4));
        let fc2 = LinearLayer::new(Array2::zeros((1, 5)), Array1::zeros(1));
        assert!(AttentionHead::new(fc1, fc2).is_err());
    }

    #[test]
    fn test_classifier_head_requires_two_logits() {
        let linear = LinearLayer::new(Array2::zeros((3, 8)), Array1::zeros(3));
        assert!(ClassifierHead::new(linear).is_err());
    }
}
