/// End-to-end media analysis: face localization, patch scoring and the
/// calibrated decision, assembled behind a single read-only model context.
pub mod job;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use tracing::{debug, info, warn};

use deepfake_classifier::OnnxBackbone;
use deepfake_common::{round4, AnalysisError, DetectedFace, Label, Verdict};
use deepfake_decision::{decide, Decision, DecisionThresholds};
use deepfake_ensemble::EnsembleScorer;
use deepfake_face_locator::{FaceLocator, FaceLocatorConfig, FaceLocatorError};
use deepfake_patch_sampler::{sample, PatchBag, PatchSamplerConfig};
use deepfake_saliency::{SaliencyConfig, SaliencyExplainer};
use deepfake_temporal::{sample_frames, FrameControl, TemporalError};

/// Model identifier reported for video verdicts
const VIDEO_MODEL_ID: &str = "Video-Calibrated-V2";

/// Kind of media unit being analyzed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Infer the media kind from a file extension; unknown extensions are
    /// treated as images.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);

        match ext.as_deref() {
            Some("mp4" | "avi" | "mov" | "mkv" | "webm") => MediaKind::Video,
            _ => MediaKind::Image,
        }
    }
}

/// Face localization seam
///
/// Production uses the ONNX face locator; tests substitute stubs that
/// return fixed detections.
pub trait FaceLocate: Send + Sync {
    /// Detect faces in an already-decoded frame
    fn locate_frame(&self, frame: &image::RgbImage) -> Result<Vec<DetectedFace>, AnalysisError>;
}

impl FaceLocate for FaceLocator {
    fn locate_frame(&self, frame: &image::RgbImage) -> Result<Vec<DetectedFace>, AnalysisError> {
        self.detect_frame(frame).map_err(locator_error)
    }
}

fn locator_error(err: FaceLocatorError) -> AnalysisError {
    match err {
        FaceLocatorError::ModelLoad(msg) => AnalysisError::ModelLoad(msg),
        FaceLocatorError::Inference(msg) | FaceLocatorError::Postprocessing(msg) => {
            AnalysisError::Inference(msg)
        }
    }
}

/// Bag scoring seam
///
/// Production uses the two-model ensemble; tests substitute stubs that
/// emit scripted probabilities.
pub trait ScoreBags: Send + Sync {
    /// Fused fake-probability for one patch bag
    fn score(&self, bag: &PatchBag) -> Result<f32, AnalysisError>;

    /// Model identifier carried in verdict metadata
    fn model_identifier(&self) -> &'static str;
}

impl ScoreBags for EnsembleScorer {
    fn score(&self, bag: &PatchBag) -> Result<f32, AnalysisError> {
        EnsembleScorer::score(self, bag).map_err(|e| AnalysisError::Inference(e.to_string()))
    }

    fn model_identifier(&self) -> &'static str {
        EnsembleScorer::model_identifier(self)
    }
}

fn default_detector_file() -> String {
    "blazeface_short_range.onnx".to_string()
}

fn default_backbone_file() -> String {
    "vit_backbone.onnx".to_string()
}

fn default_hidden_size() -> usize {
    768
}

fn default_general_heads_file() -> String {
    "general_heads.safetensors".to_string()
}

fn default_specialist_heads_file() -> String {
    "specialist_heads.safetensors".to_string()
}

fn default_explainer_file() -> String {
    "explainer.onnx".to_string()
}

fn default_explainer_heads_file() -> String {
    "explainer_heads.safetensors".to_string()
}

fn default_enable_explainer() -> bool {
    true
}

fn default_seed() -> u64 {
    42
}

/// Model file layout and runtime tuning, usually loaded from JSON
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Directory holding every model artifact
    pub model_dir: PathBuf,

    #[serde(default = "default_detector_file")]
    pub detector_file: String,

    #[serde(default = "default_backbone_file")]
    pub backbone_file: String,

    /// Backbone embedding width
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    #[serde(default = "default_general_heads_file")]
    pub general_heads_file: String,

    #[serde(default = "default_specialist_heads_file")]
    pub specialist_heads_file: String,

    #[serde(default = "default_explainer_file")]
    pub explainer_file: String,

    #[serde(default = "default_explainer_heads_file")]
    pub explainer_heads_file: String,

    #[serde(default = "default_enable_explainer")]
    pub enable_explainer: bool,

    /// Optional calibrated-threshold file; defaults apply when absent
    #[serde(default)]
    pub thresholds_file: Option<PathBuf>,

    #[serde(default)]
    pub sampler: PatchSamplerConfig,

    #[serde(default)]
    pub locator: FaceLocatorConfig,

    #[serde(default)]
    pub saliency: SaliencyConfig,

    /// Seed for the per-request patch subsampling RNG
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl ModelConfig {
    /// Load configuration from a JSON file
    ///
    /// # Errors
    /// Returns `AnalysisError::Config` on missing or malformed files.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, AnalysisError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| AnalysisError::Config(format!("cannot read config: {e}")))?;
        serde_json::from_str(&contents)
            .map_err(|e| AnalysisError::Config(format!("cannot parse config: {e}")))
    }

    fn artifact(&self, file: &str) -> PathBuf {
        self.model_dir.join(file)
    }
}

/// Read-only bundle of loaded models and policy, shared across requests
///
/// Constructed once at startup; every `analyze` call borrows it
/// immutably, so a single context serves concurrent requests.
pub struct ModelContext {
    locator: Box<dyn FaceLocate>,
    scorer: Box<dyn ScoreBags>,
    explainer: Option<SaliencyExplainer>,
    sampler: PatchSamplerConfig,
    thresholds: DecisionThresholds,
    seed: u64,
}

impl ModelContext {
    /// Assemble a context from pre-built components (test seam)
    #[must_use]
    pub fn new(
        locator: Box<dyn FaceLocate>,
        scorer: Box<dyn ScoreBags>,
        explainer: Option<SaliencyExplainer>,
        sampler: PatchSamplerConfig,
        thresholds: DecisionThresholds,
        seed: u64,
    ) -> Self {
        Self {
            locator,
            scorer,
            explainer,
            sampler,
            thresholds,
            seed,
        }
    }

    /// Load every model named by the configuration
    ///
    /// The detector, backbone and general heads are required. Specialist
    /// heads and the explainer degrade gracefully when their files are
    /// missing.
    ///
    /// # Errors
    /// Returns `AnalysisError` if a required artifact fails to load.
    pub fn from_config(config: &ModelConfig) -> Result<Self, AnalysisError> {
        info!("Loading model context from {:?}", config.model_dir);

        let locator = FaceLocator::new(config.artifact(&config.detector_file), config.locator)
            .map_err(locator_error)?;

        let backbone = Arc::new(OnnxBackbone::new(
            config.artifact(&config.backbone_file),
            config.hidden_size,
        )?);

        let scorer = EnsembleScorer::load(
            backbone,
            &config.artifact(&config.general_heads_file),
            &config.artifact(&config.specialist_heads_file),
        )
        .map_err(|e| AnalysisError::ModelLoad(e.to_string()))?;

        let explainer_path = config.artifact(&config.explainer_file);
        let explainer = if !config.enable_explainer {
            None
        } else if explainer_path.exists() {
            let explainer = SaliencyExplainer::new(
                &explainer_path,
                &config.artifact(&config.explainer_heads_file),
                config.saliency,
            )
            .map_err(|e| AnalysisError::ModelLoad(e.to_string()))?;
            Some(explainer)
        } else {
            warn!(
                "Explainer model not found at {}; heatmaps disabled",
                explainer_path.display()
            );
            None
        };

        let thresholds = match &config.thresholds_file {
            Some(path) => DecisionThresholds::from_file(path)
                .map_err(|e| AnalysisError::Config(e.to_string()))?,
            None => DecisionThresholds::default(),
        };

        Ok(Self::new(
            Box::new(locator),
            Box::new(scorer),
            explainer,
            config.sampler,
            thresholds,
            config.seed,
        ))
    }

    /// Whether heatmap explanations can be produced
    #[must_use]
    pub fn can_explain(&self) -> bool {
        self.explainer.is_some()
    }

    /// The saliency explainer, when loaded
    #[must_use]
    pub fn explainer(&self) -> Option<&SaliencyExplainer> {
        self.explainer.as_ref()
    }

    /// Face locator used for primary-face re-detection in the job runner
    #[must_use]
    pub fn locator(&self) -> &dyn FaceLocate {
        self.locator.as_ref()
    }
}

/// Analyze one media file
///
/// # Errors
/// Returns `AnalysisError` on I/O or inference failure; undecodable
/// images and undetectable faces produce a NO_FACE verdict instead.
pub fn analyze(ctx: &ModelContext, path: &Path, kind: MediaKind) -> Result<Verdict, AnalysisError> {
    match kind {
        MediaKind::Image => {
            let bytes = std::fs::read(path)?;
            analyze_image_bytes(ctx, &bytes)
        }
        MediaKind::Video => analyze_video(ctx, path),
    }
}

/// Analyze one encoded image
///
/// # Errors
/// Returns `AnalysisError::Inference` if scoring fails for any face.
pub fn analyze_image_bytes(ctx: &ModelContext, bytes: &[u8]) -> Result<Verdict, AnalysisError> {
    let image = match image::load_from_memory(bytes) {
        Ok(img) => img.to_rgb8(),
        Err(e) => {
            warn!("Image decode failed, reporting no face: {e}");
            return Ok(Verdict::no_face());
        }
    };

    let faces = ctx.locator.locate_frame(&image)?;
    if faces.is_empty() {
        debug!("No faces detected in image");
        return Ok(Verdict::no_face());
    }

    let mut rng = StdRng::seed_from_u64(ctx.seed);
    let mut fake_probs = Vec::with_capacity(faces.len());

    // One bag per face, scored independently in detection order
    for face in &faces {
        let bag = sample(&image, &[face.bbox], &ctx.sampler, &mut rng);
        fake_probs.push(ctx.scorer.score(&bag)?);
    }

    let decision = decide(&fake_probs, &ctx.thresholds);
    Ok(build_verdict(
        &decision,
        fake_probs.len(),
        image_metadata(ctx, &decision),
    ))
}

/// Analyze one video file
///
/// Samples roughly two frames per second and accumulates per-face
/// probabilities across every sampled frame into a single decision.
///
/// # Errors
/// Returns `AnalysisError::Inference` if scoring fails for any face.
/// Mid-stream decode failures end sampling but keep partial results.
pub fn analyze_video(ctx: &ModelContext, path: &Path) -> Result<Verdict, AnalysisError> {
    let mut rng = StdRng::seed_from_u64(ctx.seed);
    let mut fake_probs: Vec<f32> = Vec::new();

    let stats = sample_frames(path, |frame, _index| {
        let faces = ctx.locator.locate_frame(&frame)?;
        for face in &faces {
            let bag = sample(&frame, &[face.bbox], &ctx.sampler, &mut rng);
            fake_probs.push(ctx.scorer.score(&bag)?);
        }
        Ok(FrameControl::Continue)
    });

    match stats {
        Ok(stats) => {
            debug!(
                frames_seen = stats.frames_seen,
                frames_sampled = stats.frames_sampled,
                faces_scored = fake_probs.len(),
                "Video sampling complete"
            );
        }
        // Analysis errors raised inside the callback are real failures
        Err(TemporalError::Callback(e)) => return Err(e),
        // Container/decode failures degrade to whatever was collected
        Err(e) => warn!("Video sampling ended early: {e}"),
    }

    if fake_probs.is_empty() {
        return Ok(Verdict::no_face());
    }

    let decision = decide(&fake_probs, &ctx.thresholds);
    let mut metadata = HashMap::new();
    metadata.insert("model".to_string(), VIDEO_MODEL_ID.to_string());

    Ok(build_verdict(&decision, fake_probs.len(), metadata))
}

fn build_verdict(
    decision: &Decision,
    faces_detected: usize,
    metadata: HashMap<String, String>,
) -> Verdict {
    Verdict {
        score: round4(decision.median),
        label: decision.label,
        confidence: round4(decision.confidence),
        faces_detected,
        metadata,
    }
}

/// Diagnostics attached to image verdicts
///
/// `explainable` marks verdicts eligible for heatmap generation: decisive
/// image labels only, and only when the explainer is loaded.
fn image_metadata(ctx: &ModelContext, decision: &Decision) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert(
        "model".to_string(),
        ctx.scorer.model_identifier().to_string(),
    );
    metadata.insert(
        "reason".to_string(),
        format!(
            "Calibrated threshold check: {} (Score: {:.4})",
            decision.label, decision.median
        ),
    );
    metadata.insert(
        "uncertainty".to_string(),
        format!("{:.1}% variance", decision.std_dev * 100.0),
    );

    if matches!(decision.label, Label::Real | Label::Fake) && ctx.can_explain() {
        metadata.insert("explainable".to_string(), "true".to_string());
    }

    metadata
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use deepfake_common::FaceBox;
    use image::RgbImage;
    use std::sync::Mutex;

    /// Locator returning a fixed number of centered face boxes
    pub struct StubLocator {
        pub faces: usize,
    }

    impl FaceLocate for StubLocator {
        fn locate_frame(&self, frame: &RgbImage) -> Result<Vec<DetectedFace>, AnalysisError> {
            let (w, h) = frame.dimensions();
            let bbox = FaceBox {
                x1: w / 4,
                y1: h / 4,
                x2: w / 2,
                y2: h / 2,
            };
            Ok((0..self.faces)
                .map(|_| deepfake_face_locator::face_views(frame, bbox, 0.9))
                .collect())
        }
    }

    /// Scorer emitting a scripted probability sequence, cycling at the end
    pub struct ScriptedScorer {
        probs: Mutex<Vec<f32>>,
        cursor: Mutex<usize>,
    }

    impl ScriptedScorer {
        pub fn new(probs: Vec<f32>) -> Self {
            Self {
                probs: Mutex::new(probs),
                cursor: Mutex::new(0),
            }
        }
    }

    impl ScoreBags for ScriptedScorer {
        fn score(&self, _bag: &PatchBag) -> Result<f32, AnalysisError> {
            let probs = self.probs.lock().unwrap();
            let mut cursor = self.cursor.lock().unwrap();
            let p = probs[*cursor % probs.len()];
            *cursor += 1;
            Ok(p)
        }

        fn model_identifier(&self) -> &'static str {
            "Ensemble-Calibrated-V2"
        }
    }

    pub fn stub_context(faces: usize, probs: Vec<f32>) -> ModelContext {
        ModelContext::new(
            Box::new(StubLocator { faces }),
            Box::new(ScriptedScorer::new(probs)),
            None,
            PatchSamplerConfig::default(),
            DecisionThresholds::default(),
            42,
        )
    }

    pub fn encode_png(image: &RgbImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        image
            .write_to(
                &mut std::io::Cursor::new(&mut bytes),
                image::ImageFormat::Png,
            )
            .unwrap();
        bytes
    }
}
