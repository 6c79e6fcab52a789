//! Face localization using BlazeFace via ONNX Runtime
//!
//! Decodes raw image bytes, detects face bounding boxes with the BlazeFace
//! short-range model, clamps them to image bounds and produces the three
//! derived views each downstream stage consumes (raw crop, display copy,
//! model-resolution crop). Malformed input never raises: decode failures
//! yield an empty face list.

pub mod anchors;

use deepfake_common::{onnx, DetectedFace, FaceBox, MODEL_INPUT_SIZE};
use image::RgbImage;
use ndarray::Array4;
use ort::{session::Session, value::TensorRef};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use anchors::{Anchor, RawDetection, INPUT_SIZE};

/// Configuration for face localization
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FaceLocatorConfig {
    /// Minimum detection confidence (0.0-1.0)
    pub confidence_threshold: f32,
    /// IoU threshold for non-maximum suppression
    pub nms_threshold: f32,
}

impl Default for FaceLocatorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            nms_threshold: 0.3,
        }
    }
}

/// Errors that can occur during face localization
#[derive(Debug, Error)]
pub enum FaceLocatorError {
    #[error("Failed to load detector model: {0}")]
    ModelLoad(String),

    #[error("Detector inference failed: {0}")]
    Inference(String),

    #[error("Failed to decode detector outputs: {0}")]
    Postprocessing(String),
}

impl From<onnx::OnnxError> for FaceLocatorError {
    fn from(err: onnx::OnnxError) -> Self {
        FaceLocatorError::ModelLoad(err.to_string())
    }
}

/// BlazeFace face locator backed by an ONNX Runtime session
pub struct FaceLocator {
    session: Mutex<Session>,
    config: FaceLocatorConfig,
    anchors: Vec<Anchor>,
}

impl FaceLocator {
    /// Load the BlazeFace short-range model
    ///
    /// # Errors
    /// Returns `FaceLocatorError::ModelLoad` if the session cannot be
    /// created.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        config: FaceLocatorConfig,
    ) -> Result<Self, FaceLocatorError> {
        let model_path = model_path.as_ref();
        info!("Loading BlazeFace detector from {:?}", model_path);

        let session = onnx::create_session(model_path)?;
        let anchors = anchors::generate_anchors();

        Ok(Self {
            session: Mutex::new(session),
            config,
            anchors,
        })
    }

    /// Detect faces in raw image bytes
    ///
    /// Malformed/undecodable bytes return an empty list, never an error;
    /// only inference-level failures propagate.
    ///
    /// # Errors
    /// Returns `FaceLocatorError::Inference` on model failure.
    pub fn process_image(&self, image_bytes: &[u8]) -> Result<Vec<DetectedFace>, FaceLocatorError> {
        let image = match image::load_from_memory(image_bytes) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                debug!("Image decode failed, reporting zero faces: {e}");
                return Ok(Vec::new());
            }
        };

        self.detect_frame(&image)
    }

    /// Detect faces in an already-decoded frame (video path)
    ///
    /// # Errors
    /// Returns `FaceLocatorError::Inference` on model failure.
    pub fn detect_frame(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, FaceLocatorError> {
        let (width, height) = image.dimensions();
        debug!("Detecting faces in {}x{} image", width, height);

        let input = preprocess(image);
        let detections = self.run_detector(&input)?;
        let kept = anchors::non_maximum_suppression(detections, self.config.nms_threshold);

        let mut faces = Vec::with_capacity(kept.len());
        for det in &kept {
            let bbox = clamp_to_bounds(det, width, height);
            if bbox.area() == 0 {
                continue;
            }
            faces.push(face_views(image, bbox, det.score));
        }

        debug!("Detected {} faces after NMS", faces.len());
        Ok(faces)
    }

    fn run_detector(&self, input: &Array4<f32>) -> Result<Vec<RawDetection>, FaceLocatorError> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| FaceLocatorError::Inference("detector session poisoned".into()))?;

        let input_tensor = TensorRef::from_array_view(input.view())
            .map_err(|e| FaceLocatorError::Inference(e.to_string()))?;
        let outputs = session
            .run(ort::inputs![input_tensor])
            .map_err(|e| FaceLocatorError::Inference(e.to_string()))?;

        if outputs.len() < 2 {
            return Err(FaceLocatorError::Postprocessing(format!(
                "expected 2 detector outputs, got {}",
                outputs.len()
            )));
        }

        // BlazeFace outputs: regressors [1, 896, 16] and scores [1, 896, 1];
        // identify them by element count rather than trusting export order.
        let (shape_a, data_a) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| FaceLocatorError::Postprocessing(e.to_string()))?;
        let (shape_b, data_b) = outputs[1]
            .try_extract_tensor::<f32>()
            .map_err(|e| FaceLocatorError::Postprocessing(e.to_string()))?;

        let (reg_data, score_data) = if shape_a.last() == Some(&16) {
            (data_a, data_b)
        } else if shape_b.last() == Some(&16) {
            (data_b, data_a)
        } else {
            return Err(FaceLocatorError::Postprocessing(format!(
                "no 16-float regressor output (shapes {shape_a:?}, {shape_b:?})"
            )));
        };

        let num_anchors = self.anchors.len().min(score_data.len());
        if reg_data.len() < num_anchors * 16 {
            return Err(FaceLocatorError::Postprocessing(format!(
                "regressor tensor too small: {} floats for {} anchors",
                reg_data.len(),
                num_anchors
            )));
        }

        let mut detections = Vec::new();
        for i in 0..num_anchors {
            let score = anchors::sigmoid(score_data[i]);
            if score < self.config.confidence_threshold {
                continue;
            }

            let decoded = anchors::decode_box(&self.anchors[i], &reg_data[i * 16..i * 16 + 4]);
            detections.push(RawDetection {
                x1: decoded[0],
                y1: decoded[1],
                x2: decoded[2],
                y2: decoded[3],
                score,
            });
        }

        Ok(detections)
    }
}

/// Resize to the detector input and normalize to [0, 1] NCHW
fn preprocess(image: &RgbImage) -> Array4<f32> {
    let resized = image::imageops::resize(
        image,
        INPUT_SIZE,
        INPUT_SIZE,
        image::imageops::FilterType::Triangle,
    );

    let size = INPUT_SIZE as usize;
    let mut input = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..size {
        for x in 0..size {
            let pixel = resized.get_pixel(x as u32, y as u32);
            for c in 0..3 {
                input[[0, c, y, x]] = f32::from(pixel[c]) / 255.0;
            }
        }
    }

    input
}

/// Clamp a normalized detection to pixel bounds of the source image
fn clamp_to_bounds(det: &RawDetection, width: u32, height: u32) -> FaceBox {
    let w = width as f32;
    let h = height as f32;

    FaceBox {
        x1: (det.x1.max(0.0) * w) as u32,
        y1: (det.y1.max(0.0) * h) as u32,
        x2: ((det.x2 * w).min(w)).max(0.0) as u32,
        y2: ((det.y2 * h).min(h)).max(0.0) as u32,
    }
}

/// Build the three derived views for one surviving box
///
/// `full` is the raw crop, `display` an identical copy for UI/heatmap use,
/// `model` the crop resized to the classifier input resolution.
#[must_use]
pub fn face_views(image: &RgbImage, bbox: FaceBox, confidence: f32) -> DetectedFace {
    let full = image::imageops::crop_imm(image, bbox.x1, bbox.y1, bbox.width(), bbox.height())
        .to_image();
    let display = full.clone();
    let model = image::imageops::resize(
        &full,
        MODEL_INPUT_SIZE,
        MODEL_INPUT_SIZE,
        image::imageops::FilterType::Triangle,
    );

    DetectedFace {
        confidence,
        bbox,
        full,
        display,
        model,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = FaceLocatorConfig::default();
        assert_eq!(config.confidence_threshold, 0.6);
        assert_eq!(config.nms_threshold, 0.3);
    }

    #[test]
    fn test_clamp_to_bounds() {
        let det = RawDetection {
            x1: -0.1,
            y1: 0.25,
            x2: 1.2,
            y2: 0.75,
            score: 0.9,
        };

        let bbox = clamp_to_bounds(&det, 640, 480);
        assert_eq!(bbox.x1, 0);
        assert_eq!(bbox.x2, 640);
        assert_eq!(bbox.y1, 120);
        assert_eq!(bbox.y2, 360);
    }

    #[test]
    fn test_clamped_zero_area_detectable() {
        // A box entirely off-frame clamps to zero area
        let det = RawDetection {
            x1: 1.1,
            y1: 1.1,
            x2: 1.3,
            y2: 1.4,
            score: 0.9,
        };

        let bbox = clamp_to_bounds(&det, 640, 480);
        assert_eq!(bbox.area(), 0);
    }

    #[test]
    fn test_face_views_shapes() {
        let img = RgbImage::from_pixel(320, 240, image::Rgb([200, 150, 100]));
        let bbox = FaceBox {
            x1: 40,
            y1: 30,
            x2: 140,
            y2: 150,
        };

        let face = face_views(&img, bbox, 0.8);
        assert_eq!(face.full.dimensions(), (100, 120));
        assert_eq!(face.display.dimensions(), (100, 120));
        assert_eq!(face.model.dimensions(), (224, 224));
        assert_eq!(face.bbox, bbox);
        assert!((face.confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_shape_and_range() {
        let img = RgbImage::from_pixel(64, 48, image::Rgb([255, 0, 128]));
        let input = preprocess(&img);

        assert_eq!(input.shape(), &[1, 3, 128, 128]);
        assert!((input[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!(input[[0, 1, 0, 0]].abs() < 1e-6);
    }

    #[test]
    #[ignore] // Run manually with a real model: cargo test -p deepfake-face-locator --ignored
    fn test_detection_with_real_model() {
        let model_path = std::env::var("CARGO_MANIFEST_DIR")
            .map(|dir| format!("{dir}/../../models/blazeface_short_range.onnx"))
            .unwrap_or_else(|_| "models/blazeface_short_range.onnx".to_string());

        if !std::path::Path::new(&model_path).exists() {
            println!("Model not found at {model_path}, skipping");
            return;
        }

        let locator = FaceLocator::new(&model_path, FaceLocatorConfig::default())
            .expect("Failed to load model");

        // A blank frame must produce zero detections, not an error
        let blank = RgbImage::new(128, 128);
        let faces = locator.detect_frame(&blank).expect("Detection failed");
        assert!(faces.is_empty());

        // Garbage bytes decode-fail into an empty list
        let faces = locator.process_image(&[0u8; 64]).expect("Process failed");
        assert!(faces.is_empty());
    }
}
