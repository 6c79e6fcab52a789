// BlazeFace short-range anchor generation and box decoding
//
// The short-range model runs at 128x128 and emits 896 anchor predictions:
// a 16x16 grid with 2 anchors per cell plus an 8x8 grid with 6 per cell.
// Regressors are 16 floats per anchor (box deltas + 6 keypoints); only the
// first 4 (dx, dy, w, h) are used here.

/// BlazeFace model input resolution
pub const INPUT_SIZE: u32 = 128;

/// Total anchors emitted by the short-range model
pub const NUM_ANCHORS: usize = 896;

/// Anchor center in normalized [0, 1] coordinates
#[derive(Debug, Clone, Copy)]
pub struct Anchor {
    pub x: f32,
    pub y: f32,
}

/// Generate the 896 short-range anchors
///
/// Strides 8 and 16 over the 128px input give 16x16 and 8x8 grids with 2
/// and 6 anchors per cell respectively.
#[must_use]
pub fn generate_anchors() -> Vec<Anchor> {
    let strides = [(8u32, 2usize), (16u32, 6usize)];
    let mut anchors = Vec::with_capacity(NUM_ANCHORS);

    for &(stride, per_cell) in &strides {
        let grid = (INPUT_SIZE / stride) as usize;
        for y in 0..grid {
            for x in 0..grid {
                let cx = (x as f32 + 0.5) / grid as f32;
                let cy = (y as f32 + 0.5) / grid as f32;
                for _ in 0..per_cell {
                    anchors.push(Anchor { x: cx, y: cy });
                }
            }
        }
    }

    debug_assert_eq!(anchors.len(), NUM_ANCHORS);
    anchors
}

/// Decode one anchor's regressor into a normalized [x1, y1, x2, y2] box
///
/// Regressor values are pixel offsets in model input space, hence the
/// division by the input size.
#[must_use]
pub fn decode_box(anchor: &Anchor, regressor: &[f32]) -> [f32; 4] {
    let cx = anchor.x + regressor[0] / INPUT_SIZE as f32;
    let cy = anchor.y + regressor[1] / INPUT_SIZE as f32;
    let w = regressor[2] / INPUT_SIZE as f32;
    let h = regressor[3] / INPUT_SIZE as f32;

    [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
}

#[inline]
#[must_use]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Candidate detection in normalized coordinates, pre-NMS
#[derive(Debug, Clone, Copy)]
pub struct RawDetection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
}

impl RawDetection {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn iou(&self, other: &RawDetection) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        if x2 < x1 || y2 < y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }

        intersection / union
    }
}

/// Greedy non-maximum suppression; raw anchor decode produces duplicates
#[must_use]
pub fn non_maximum_suppression(
    mut detections: Vec<RawDetection>,
    iou_threshold: f32,
) -> Vec<RawDetection> {
    detections.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::with_capacity(detections.len() / 3 + 1);
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i]);

        for j in (i + 1)..detections.len() {
            if !suppressed[j] && detections[i].iou(&detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}
