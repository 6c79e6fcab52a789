//! Patch sampling for multi-instance classification
//!
//! Builds the bounded bag of fixed-size patches one media unit feeds to the
//! attention classifier: up to two face-focused patches (30% margin crops)
//! plus a sliding-window grid over the full image, reflect-padded so the
//! stride tiles exactly. Bags over the cap are uniformly subsampled with a
//! caller-supplied RNG; the sampling noise is intentional regularization,
//! carried over from training.

use deepfake_common::{imagenet_chw, FaceBox, MODEL_INPUT_SIZE};
use image::RgbImage;
use ndarray::{Array3, Array4, ArrayView4, Axis};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Configuration for patch sampling
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PatchSamplerConfig {
    /// Square patch edge length in pixels
    pub patch_size: u32,
    /// Sliding-window stride in pixels
    pub stride: u32,
    /// Hard cap on bag length
    pub max_patches: usize,
    /// Maximum number of face-focused patches per bag
    pub max_face_patches: usize,
    /// Margin expansion applied to face boxes (fraction per side)
    pub face_margin: f32,
    /// Source image is resized to this square resolution before extraction.
    /// Fixed at serving time to keep bags deterministic; training varied it.
    pub inference_resolution: u32,
}

impl Default for PatchSamplerConfig {
    fn default() -> Self {
        Self {
            patch_size: MODEL_INPUT_SIZE,
            stride: 112,
            max_patches: 5,
            max_face_patches: 2,
            face_margin: 0.3,
            inference_resolution: 384,
        }
    }
}

/// An ordered bag of normalized patches, shape (N, 3, patch, patch)
///
/// Invariants: never empty, N <= `max_patches`, all patches share the same
/// channel/height/width.
#[derive(Debug, Clone)]
pub struct PatchBag {
    tensor: Array4<f32>,
}

impl PatchBag {
    /// Wrap an already-built (N, C, H, W) tensor, rejecting empty bags
    #[must_use]
    pub fn from_tensor(tensor: Array4<f32>) -> Option<Self> {
        if tensor.shape()[0] == 0 {
            return None;
        }
        Some(Self { tensor })
    }

    /// Number of patches in the bag
    #[must_use]
    pub fn len(&self) -> usize {
        self.tensor.shape()[0]
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the (N, C, H, W) tensor
    #[must_use]
    pub fn patches(&self) -> ArrayView4<'_, f32> {
        self.tensor.view()
    }

    /// Consume the bag, yielding the underlying tensor
    #[must_use]
    pub fn into_tensor(self) -> Array4<f32> {
        self.tensor
    }
}

/// Build the patch bag for one media unit
///
/// `face_boxes` are in `image` pixel space (detection order); up to
/// `max_face_patches` of them contribute one margin-expanded patch each,
/// followed by the full sliding-window grid. `rng` drives the uniform
/// subsample when the combined bag exceeds the cap.
pub fn sample(
    image: &RgbImage,
    face_boxes: &[FaceBox],
    config: &PatchSamplerConfig,
    rng: &mut StdRng,
) -> PatchBag {
    let res = config.inference_resolution;
    let (orig_w, orig_h) = image.dimensions();

    let resized = image::imageops::resize(image, res, res, image::imageops::FilterType::Triangle);

    let mut patches: Vec<Array3<f32>> = Vec::new();

    // Face-focused patches: one 30%-margin crop per face, detection order
    for bbox in face_boxes.iter().take(config.max_face_patches) {
        let scaled = bbox.scale((orig_w, orig_h), (res, res));
        let expanded = scaled.expand(config.face_margin, res, res);
        if expanded.area() == 0 {
            continue;
        }

        let crop = image::imageops::crop_imm(
            &resized,
            expanded.x1,
            expanded.y1,
            expanded.width(),
            expanded.height(),
        )
        .to_image();
        let face_patch = image::imageops::resize(
            &crop,
            config.patch_size,
            config.patch_size,
            image::imageops::FilterType::Triangle,
        );
        patches.push(imagenet_chw(&face_patch));
    }

    // Global grid over the whole frame
    let global = imagenet_chw(&resized);
    patches.extend(extract_patches(&global, config));

    trace!(
        "Sampled {} candidate patches ({} face boxes)",
        patches.len(),
        face_boxes.len()
    );

    if patches.len() > config.max_patches {
        let chosen = rand::seq::index::sample(rng, patches.len(), config.max_patches);
        let mut subsampled = Vec::with_capacity(config.max_patches);
        for idx in chosen.iter() {
            subsampled.push(patches[idx].clone());
        }
        patches = subsampled;
    }

    stack_patches(patches, config.patch_size)
}

/// Collect every sliding-window patch from a (C, H, W) tensor
///
/// The tensor is reflect-padded on the bottom/right so (H - patch) and
/// (W - patch) are multiples of the stride. If the padded tensor is still
/// smaller than the patch size the grid is empty and a single
/// top-left-anchored patch is returned instead (zero-filled past the data).
#[must_use]
pub fn extract_patches(tensor: &Array3<f32>, config: &PatchSamplerConfig) -> Vec<Array3<f32>> {
    let patch = config.patch_size as usize;
    let stride = config.stride as usize;

    let padded = pad_to_stride(tensor, patch, stride);
    let (channels, height, width) = (padded.shape()[0], padded.shape()[1], padded.shape()[2]);

    let mut patches = Vec::new();

    if height >= patch && width >= patch {
        let mut y = 0;
        while y + patch <= height {
            let mut x = 0;
            while x + patch <= width {
                let window = padded
                    .slice(ndarray::s![.., y..y + patch, x..x + patch])
                    .to_owned();
                patches.push(window);
                x += stride;
            }
            y += stride;
        }
    }

    if patches.is_empty() {
        // Degenerate fallback: one patch anchored at the top-left corner
        let mut fallback = Array3::<f32>::zeros((channels, patch, patch));
        let copy_h = height.min(patch);
        let copy_w = width.min(patch);
        fallback
            .slice_mut(ndarray::s![.., ..copy_h, ..copy_w])
            .assign(&padded.slice(ndarray::s![.., ..copy_h, ..copy_w]));
        patches.push(fallback);
    }

    patches
}

/// Reflect-pad bottom/right so (H - patch) and (W - patch) tile the stride
///
/// Reflection excludes the edge pixel (PyTorch `reflect` semantics); the pad
/// amount never exceeds dim - 1, which the stride arithmetic guarantees for
/// any tensor at least 2 pixels wide.
fn pad_to_stride(tensor: &Array3<f32>, patch: usize, stride: usize) -> Array3<f32> {
    let (channels, height, width) = (tensor.shape()[0], tensor.shape()[1], tensor.shape()[2]);

    let pad_h = pad_amount(height, patch, stride).min(height.saturating_sub(1));
    let pad_w = pad_amount(width, patch, stride).min(width.saturating_sub(1));

    if pad_h == 0 && pad_w == 0 {
        return tensor.clone();
    }

    let new_h = height + pad_h;
    let new_w = width + pad_w;
    let mut padded = Array3::<f32>::zeros((channels, new_h, new_w));

    for c in 0..channels {
        for y in 0..new_h {
            let src_y = reflect_index(y, height);
            for x in 0..new_w {
                let src_x = reflect_index(x, width);
                padded[[c, y, x]] = tensor[[c, src_y, src_x]];
            }
        }
    }

    padded
}

/// Pad needed so (dim - patch) is a non-negative multiple of stride
fn pad_amount(dim: usize, patch: usize, stride: usize) -> usize {
    // Euclidean remainder of (dim - patch), matching Python's % on negatives
    let rem = (dim as i64 - patch as i64).rem_euclid(stride as i64) as usize;
    (stride - rem) % stride
}

/// Map a padded index back into [0, len) by reflecting off the far edge
fn reflect_index(idx: usize, len: usize) -> usize {
    if idx < len {
        idx
    } else {
        2 * len - 2 - idx
    }
}

fn stack_patches(patches: Vec<Array3<f32>>, patch_size: u32) -> PatchBag {
    debug_assert!(!patches.is_empty(), "patch bag must never be empty");

    let patch = patch_size as usize;
    let mut tensor = Array4::<f32>::zeros((patches.len(), 3, patch, patch));
    for (i, p) in patches.iter().enumerate() {
        tensor.index_axis_mut(Axis(0), i).assign(p);
    }

    PatchBag { tensor }
}
