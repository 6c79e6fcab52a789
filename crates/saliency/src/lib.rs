//! Gradient-weighted saliency explanation
//!
//! Produces a heatmap of the image regions that most influenced a generic
//! pretrained CNN (the explainer, not the deepfake classifier). The
//! explainer graph is exported with two outputs, the final convolutional
//! feature map and the logits, and its linear head weights ship alongside
//! as safetensors. Because the head sits behind global average pooling, the
//! gradient of the mean logit with respect to the feature map is constant
//! per channel (mean over classes of the head column, divided by the
//! spatial extent), which yields the channel weights a gradient-weighted
//! class activation map needs without a backward pass.
//!
//! Each explanation call builds its own activation capture; nothing is
//! shared across calls, so concurrent explanations cannot interfere.

use deepfake_common::onnx;
use image::{Rgb, RgbImage};
use ndarray::{Array2, Array4};
use ort::{session::Session, value::TensorRef};
use safetensors::tensor::Dtype;
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

/// Configuration for saliency explanation
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SaliencyConfig {
    /// Explainer input resolution (square)
    pub input_size: u32,
    /// Alpha applied to the original face crop in the blended output
    pub blend_original: f32,
    /// Alpha applied to the colorized heatmap
    pub blend_heatmap: f32,
}

impl Default for SaliencyConfig {
    fn default() -> Self {
        Self {
            input_size: 224,
            blend_original: 0.6,
            blend_heatmap: 0.4,
        }
    }
}

/// Errors that can occur during explanation
#[derive(Debug, Error)]
pub enum SaliencyError {
    #[error("Failed to load explainer model: {0}")]
    ModelLoad(String),

    #[error("Explainer inference failed: {0}")]
    Inference(String),

    #[error("Bad explainer weight file: {0}")]
    WeightFormat(String),

    #[error("Unexpected explainer outputs: {0}")]
    OutputShape(String),
}

impl From<onnx::OnnxError> for SaliencyError {
    fn from(err: onnx::OnnxError) -> Self {
        SaliencyError::ModelLoad(err.to_string())
    }
}

/// One explanation: the blended heatmap plus the face crop it overlays
#[derive(Debug, Clone)]
pub struct Explanation {
    pub heatmap: RgbImage,
    pub face: RgbImage,
}

/// Activations captured from a single explainer pass
///
/// Scoped to one explanation call and dropped with it; replaces the global
/// forward/backward hook lists a framework-level implementation would use.
struct ActivationCapture {
    /// Final convolutional feature map, (1, C, h, w)
    features: Array4<f32>,
}

/// Saliency explainer over a two-output ONNX CNN
pub struct SaliencyExplainer {
    session: Mutex<Session>,
    /// Linear head weight matrix, (num_classes, C)
    head_weight: Array2<f32>,
    config: SaliencyConfig,
}

impl SaliencyExplainer {
    /// Load the explainer graph and its head weight matrix
    ///
    /// # Errors
    /// Returns `SaliencyError` if either file is missing or malformed.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        head_path: P,
        config: SaliencyConfig,
    ) -> Result<Self, SaliencyError> {
        let model_path = model_path.as_ref();
        info!("Loading saliency explainer from {:?}", model_path);

        let session = onnx::create_session(model_path)?;
        let head_weight = load_head_weight(head_path.as_ref())?;

        Ok(Self {
            session: Mutex::new(session),
            head_weight,
            config,
        })
    }

    /// Explain one face crop
    ///
    /// Returns the heatmap alpha-blended over the crop plus an untouched
    /// copy of the crop; the caller persists both.
    ///
    /// # Errors
    /// Returns `SaliencyError::Inference` on model failure.
    pub fn explain(&self, face: &RgbImage) -> Result<Explanation, SaliencyError> {
        let capture = self.forward(face)?;
        let cam = compute_cam(&capture.features, &self.head_weight)?;

        let (face_w, face_h) = face.dimensions();
        let heat_gray = cam_to_gray(&cam);
        let heat_resized = image::imageops::resize(
            &heat_gray,
            face_w,
            face_h,
            image::imageops::FilterType::Triangle,
        );

        let colorized = colorize_jet(&heat_resized);
        let heatmap = blend(
            face,
            &colorized,
            self.config.blend_original,
            self.config.blend_heatmap,
        );

        Ok(Explanation {
            heatmap,
            face: face.clone(),
        })
    }

    fn forward(&self, face: &RgbImage) -> Result<ActivationCapture, SaliencyError> {
        let size = self.config.input_size;
        let resized =
            image::imageops::resize(face, size, size, image::imageops::FilterType::Triangle);

        // Explainer contract: [0, 1] scaling, no ImageNet normalization
        let s = size as usize;
        let mut input = Array4::<f32>::zeros((1, 3, s, s));
        for y in 0..s {
            for x in 0..s {
                let pixel = resized.get_pixel(x as u32, y as u32);
                for c in 0..3 {
                    input[[0, c, y, x]] = f32::from(pixel[c]) / 255.0;
                }
            }
        }

        let mut session = self
            .session
            .lock()
            .map_err(|_| SaliencyError::Inference("explainer session poisoned".into()))?;

        let input_tensor = TensorRef::from_array_view(input.view())
            .map_err(|e| SaliencyError::Inference(e.to_string()))?;
        let outputs = session
            .run(ort::inputs![input_tensor])
            .map_err(|e| SaliencyError::Inference(e.to_string()))?;

        // Locate the rank-4 feature map among the outputs (logits are rank 2
        // and unused: the mean-logit gradient depends only on the head).
        for (_name, value) in outputs.iter() {
            let Ok((shape, data)) = value.try_extract_tensor::<f32>() else {
                continue;
            };
            if shape.len() == 4 {
                let dims = (
                    shape[0] as usize,
                    shape[1] as usize,
                    shape[2] as usize,
                    shape[3] as usize,
                );
                let features = Array4::from_shape_vec(dims, data.to_vec())
                    .map_err(|e| SaliencyError::OutputShape(e.to_string()))?;
                return Ok(ActivationCapture { features });
            }
        }

        Err(SaliencyError::OutputShape(
            "no rank-4 feature map output found".into(),
        ))
    }
}

/// Channel-weighted class activation map, normalized to [0, 1]
///
/// With global average pooling between the (1, C, h, w) feature map and the
/// (K, C) linear head, the gradient of the mean of the K logits with
/// respect to activation A_c(x, y) is mean_k(W[k, c]) / (h * w) at every
/// position, so the gradient-weighted channel sum reduces to this closed
/// form. Negative contributions are clipped before normalization.
fn compute_cam(features: &Array4<f32>, head_weight: &Array2<f32>) -> Result<Array2<f32>, SaliencyError> {
    let channels = features.shape()[1];
    let height = features.shape()[2];
    let width = features.shape()[3];

    if head_weight.shape()[1] != channels {
        return Err(SaliencyError::WeightFormat(format!(
            "head expects {} channels, feature map has {channels}",
            head_weight.shape()[1]
        )));
    }

    let num_classes = head_weight.shape()[0] as f32;
    let spatial = (height * width) as f32;

    let mut cam = Array2::<f32>::zeros((height, width));
    for c in 0..channels {
        let alpha = head_weight.column(c).sum() / num_classes / spatial;
        for y in 0..height {
            for x in 0..width {
                cam[[y, x]] += alpha * features[[0, c, y, x]];
            }
        }
    }

    cam.mapv_inplace(|v| v.max(0.0));
    let max = cam.iter().copied().fold(0.0_f32, f32::max);
    cam.mapv_inplace(|v| v / (max + 1e-8));

    Ok(cam)
}

fn cam_to_gray(cam: &Array2<f32>) -> image::GrayImage {
    let (height, width) = (cam.shape()[0] as u32, cam.shape()[1] as u32);
    image::GrayImage::from_fn(width, height, |x, y| {
        image::Luma([(cam[[y as usize, x as usize]].clamp(0.0, 1.0) * 255.0) as u8])
    })
}

/// JET colormap: blue for cold, red for hot
#[must_use]
pub fn jet_color(value: f32) -> Rgb<u8> {
    let v = value.clamp(0.0, 1.0);
    let r = (1.5 - (4.0 * v - 3.0).abs()).clamp(0.0, 1.0);
    let g = (1.5 - (4.0 * v - 2.0).abs()).clamp(0.0, 1.0);
    let b = (1.5 - (4.0 * v - 1.0).abs()).clamp(0.0, 1.0);
    Rgb([(r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8])
}

fn colorize_jet(gray: &image::GrayImage) -> RgbImage {
    RgbImage::from_fn(gray.width(), gray.height(), |x, y| {
        jet_color(f32::from(gray.get_pixel(x, y)[0]) / 255.0)
    })
}

/// Per-pixel alpha blend of two same-sized images
fn blend(base: &RgbImage, overlay: &RgbImage, base_alpha: f32, overlay_alpha: f32) -> RgbImage {
    RgbImage::from_fn(base.width(), base.height(), |x, y| {
        let b = base.get_pixel(x, y);
        let o = overlay.get_pixel(x, y);
        Rgb([
            (f32::from(b[0]) * base_alpha + f32::from(o[0]) * overlay_alpha).min(255.0) as u8,
            (f32::from(b[1]) * base_alpha + f32::from(o[1]) * overlay_alpha).min(255.0) as u8,
            (f32::from(b[2]) * base_alpha + f32::from(o[2]) * overlay_alpha).min(255.0) as u8,
        ])
    })
}

/// Load the explainer's (K, C) linear head weight matrix
fn load_head_weight(path: &Path) -> Result<Array2<f32>, SaliencyError> {
    let buffer = std::fs::read(path)
        .map_err(|e| SaliencyError::WeightFormat(format!("cannot read {}: {e}", path.display())))?;
    let tensors = SafeTensors::deserialize(&buffer)
        .map_err(|e| SaliencyError::WeightFormat(e.to_string()))?;

    let view = tensors
        .tensor("classifier.weight")
        .map_err(|e| SaliencyError::WeightFormat(format!("missing classifier.weight: {e}")))?;

    if view.dtype() != Dtype::F32 {
        return Err(SaliencyError::WeightFormat(format!(
            "classifier.weight must be f32, got {:?}",
            view.dtype()
        )));
    }
    if view.shape().len() != 2 {
        return Err(SaliencyError::WeightFormat(format!(
            "classifier.weight must be rank 2, got shape {:?}",
            view.shape()
        )));
    }

    let shape = (view.shape()[0], view.shape()[1]);
    let data: Vec<f32> = bytemuck::pod_collect_to_vec(view.data());
    Array2::from_shape_vec(shape, data).map_err(|e| SaliencyError::WeightFormat(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cam_follows_positively_weighted_channel() {
        // Channel 0 weighted +1, channel 1 weighted -1 (clipped away)
        let mut features = Array4::<f32>::zeros((1, 2, 2, 2));
        features[[0, 0, 0, 0]] = 4.0;
        features[[0, 0, 1, 1]] = 2.0;
        features[[0, 1, 0, 1]] = 10.0;

        let head = Array2::from_shape_vec((1, 2), vec![1.0, -1.0]).unwrap();
        let cam = compute_cam(&features, &head).unwrap();

        assert!((cam[[0, 0]] - 1.0).abs() < 1e-4);
        assert!((cam[[1, 1]] - 0.5).abs() < 1e-4);
        // Negative-channel hotspot clips to zero
        assert_eq!(cam[[0, 1]], 0.0);
    }

    #[test]
    fn test_cam_normalized_to_unit_range() {
        let features = Array4::from_elem((1, 3, 4, 4), 2.5);
        let head = Array2::from_elem((5, 3), 0.2);
        let cam = compute_cam(&features, &head).unwrap();

        for &v in cam.iter() {
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn test_cam_rejects_channel_mismatch() {
        let features = Array4::<f32>::zeros((1, 4, 2, 2));
        let head = Array2::<f32>::zeros((2, 8));
        assert!(matches!(
            compute_cam(&features, &head),
            Err(SaliencyError::WeightFormat(_))
        ));
    }

    #[test]
    fn test_jet_endpoints() {
        let cold = jet_color(0.0);
        assert!(cold[2] > cold[0] && cold[2] > cold[1]);

        let hot = jet_color(1.0);
        assert!(hot[0] > hot[1] && hot[0] > hot[2]);

        let mid = jet_color(0.5);
        assert_eq!(mid[1], 255);
    }

    #[test]
    fn test_blend_weights() {
        let base = RgbImage::from_pixel(2, 2, Rgb([100, 100, 100]));
        let overlay = RgbImage::from_pixel(2, 2, Rgb([200, 0, 100]));

        let blended = blend(&base, &overlay, 0.6, 0.4);
        let px = blended.get_pixel(0, 0);
        assert_eq!(px[0], 140);
        assert_eq!(px[1], 60);
        assert_eq!(px[2], 100);
    }

    #[test]
    fn test_config_defaults() {
        let config = SaliencyConfig::default();
        assert_eq!(config.input_size, 224);
        assert!((config.blend_original - 0.6).abs() < 1e-6);
        assert!((config.blend_heatmap - 0.4).abs() < 1e-6);
    }
}
