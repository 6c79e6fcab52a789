/// Common types and utilities for deepfake media analysis
pub mod onnx;

use image::RgbImage;
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Model input resolution for the classifier backbone (square)
pub const MODEL_INPUT_SIZE: u32 = 224;

/// ImageNet channel means (RGB order)
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNet channel standard deviations (RGB order)
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Analysis errors
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Model file not found: {0}")]
    ModelNotFound(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Bad weight file: {0}")]
    WeightFormat(String),

    #[error("Video decoding error: {0}")]
    Video(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<image::ImageError> for AnalysisError {
    fn from(err: image::ImageError) -> Self {
        AnalysisError::Image(err.to_string())
    }
}

impl From<onnx::OnnxError> for AnalysisError {
    fn from(err: onnx::OnnxError) -> Self {
        match err {
            onnx::OnnxError::ModelNotFound(path) => AnalysisError::ModelNotFound(path),
            other => AnalysisError::ModelLoad(other.to_string()),
        }
    }
}

/// Result type for analysis operations
pub type Result<T> = std::result::Result<T, AnalysisError>;

/// Final classification label for one media unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Label {
    Real,
    Fake,
    Uncertain,
    NoFace,
}

impl Label {
    /// Wire/display form of the label
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Real => "REAL",
            Label::Fake => "FAKE",
            Label::Uncertain => "UNCERTAIN",
            Label::NoFace => "NO_FACE",
        }
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict for one analysis request
///
/// `score` is the median fake-probability across all scored face instances,
/// `confidence` the calibrated confidence for the chosen label. Both are
/// rounded to 4 decimals. `metadata` carries free-form diagnostics (model
/// identifier, reason, dispersion) destined for the job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub score: f64,
    pub label: Label,
    pub confidence: f64,
    pub faces_detected: usize,
    pub metadata: HashMap<String, String>,
}

impl Verdict {
    /// Terminal verdict for media with no detectable face
    #[must_use]
    pub fn no_face() -> Self {
        Self {
            score: 0.0,
            label: Label::NoFace,
            confidence: 0.0,
            faces_detected: 0,
            metadata: HashMap::new(),
        }
    }
}

/// Round to 4 decimal places (verdict field contract)
#[must_use]
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Face bounding box in image pixel space, already clamped to image bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl FaceBox {
    /// Box width in pixels
    #[must_use]
    #[inline]
    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    /// Box height in pixels
    #[must_use]
    #[inline]
    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    /// Box area in pixels
    #[must_use]
    #[inline]
    pub fn area(&self) -> u64 {
        u64::from(self.width()) * u64::from(self.height())
    }

    /// Expand the box by `margin` (fraction of width/height per side),
    /// clamped to the `img_w` x `img_h` bounds.
    #[must_use]
    pub fn expand(&self, margin: f32, img_w: u32, img_h: u32) -> FaceBox {
        let mx = (self.width() as f32 * margin) as u32;
        let my = (self.height() as f32 * margin) as u32;

        FaceBox {
            x1: self.x1.saturating_sub(mx),
            y1: self.y1.saturating_sub(my),
            x2: (self.x2 + mx).min(img_w),
            y2: (self.y2 + my).min(img_h),
        }
    }

    /// Rescale the box from one image resolution to another
    #[must_use]
    pub fn scale(&self, from: (u32, u32), to: (u32, u32)) -> FaceBox {
        let sx = f64::from(to.0) / f64::from(from.0.max(1));
        let sy = f64::from(to.1) / f64::from(from.1.max(1));

        FaceBox {
            x1: ((f64::from(self.x1) * sx) as u32).min(to.0),
            y1: ((f64::from(self.y1) * sy) as u32).min(to.1),
            x2: ((f64::from(self.x2) * sx) as u32).min(to.0),
            y2: ((f64::from(self.y2) * sy) as u32).min(to.1),
        }
    }
}

/// One detected face with its three derived views
///
/// `full` is the raw crop at source resolution, `display` an identical copy
/// kept for UI/heatmap output, `model` the crop resized to the classifier
/// input resolution.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub confidence: f32,
    pub bbox: FaceBox,
    pub full: RgbImage,
    pub display: RgbImage,
    pub model: RgbImage,
}

/// Convert an RGB image to a CHW float tensor with ImageNet normalization
#[must_use]
pub fn imagenet_chw(image: &RgbImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    let mut out = Array3::<f32>::zeros((3, height as usize, width as usize));

    for y in 0..height as usize {
        for x in 0..width as usize {
            let pixel = image.get_pixel(x as u32, y as u32);
            for c in 0..3 {
                out[[c, y, x]] =
                    (f32::from(pixel[c]) / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
            }
        }
    }

    out
}
