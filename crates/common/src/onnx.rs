//! ONNX Runtime utilities for optimized model loading
//!
//! Helper functions for creating ONNX Runtime sessions with graph
//! optimizations, execution providers, and performance tuning. Every neural
//! model in the pipeline (face detector, patch backbone, saliency explainer)
//! goes through one of these constructors.

use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use std::path::Path;
use tracing::debug;

/// Error type for ONNX operations
#[derive(Debug, thiserror::Error)]
pub enum OnnxError {
    #[error("Failed to create session builder: {0}")]
    SessionBuilderError(String),

    #[error("Failed to load ONNX model from {path}: {error}")]
    ModelLoadError { path: String, error: String },

    #[error("Model file not found: {0}")]
    ModelNotFound(String),
}

/// Intra-op thread count: physical cores, overridable via `DEEPFAKE_THREADS`
fn intra_threads() -> usize {
    std::env::var("DEEPFAKE_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or_else(num_cpus::get_physical)
}

/// Create an optimized ONNX Runtime session
///
/// Configures ONNX Runtime with:
/// - Maximum graph optimizations (`GraphOptimizationLevel::Level3`)
/// - Intra-op parallelism sized to physical CPU cores
/// - Execution providers tried in order: CoreML, CUDA, CPU fallback
///
/// If CoreML fails to compile the model (unsupported operations), the
/// session is retried with CUDA/CPU only.
///
/// # Errors
/// Returns `OnnxError` if the file is missing or no provider can load it.
pub fn create_session(model_path: &Path) -> Result<Session, OnnxError> {
    if !model_path.exists() {
        return Err(OnnxError::ModelNotFound(model_path.display().to_string()));
    }

    let num_threads = intra_threads();

    let session = Session::builder()
        .map_err(|e| OnnxError::SessionBuilderError(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| OnnxError::SessionBuilderError(e.to_string()))?
        .with_intra_threads(num_threads)
        .map_err(|e| OnnxError::SessionBuilderError(e.to_string()))?
        .with_memory_pattern(true)
        .map_err(|e| OnnxError::SessionBuilderError(e.to_string()))?
        .with_execution_providers([
            CoreMLExecutionProvider::default().with_subgraphs(true).build(),
            CUDAExecutionProvider::default().build(),
            CPUExecutionProvider::default().build(),
        ])
        .map_err(|e| OnnxError::SessionBuilderError(e.to_string()))?
        .commit_from_file(model_path);

    match session {
        Ok(s) => Ok(s),
        Err(e) => {
            let error_msg = e.to_string();
            // CoreML compilation failures get a CUDA/CPU-only retry
            if error_msg.contains("CoreML") || error_msg.contains("MLModel") {
                debug!(
                    "CoreML failed for {}, retrying with CUDA/CPU: {}",
                    model_path.display(),
                    error_msg
                );

                Session::builder()
                    .map_err(|e| OnnxError::SessionBuilderError(e.to_string()))?
                    .with_optimization_level(GraphOptimizationLevel::Level3)
                    .map_err(|e| OnnxError::SessionBuilderError(e.to_string()))?
                    .with_intra_threads(num_threads)
                    .map_err(|e| OnnxError::SessionBuilderError(e.to_string()))?
                    .with_memory_pattern(true)
                    .map_err(|e| OnnxError::SessionBuilderError(e.to_string()))?
                    .with_execution_providers([
                        CUDAExecutionProvider::default().build(),
                        CPUExecutionProvider::default().build(),
                    ])
                    .map_err(|e| OnnxError::SessionBuilderError(e.to_string()))?
                    .commit_from_file(model_path)
                    .map_err(|e| OnnxError::ModelLoadError {
                        path: model_path.display().to_string(),
                        error: format!("CoreML failed, CPU/CUDA also failed: {e}"),
                    })
            } else {
                Err(OnnxError::ModelLoadError {
                    path: model_path.display().to_string(),
                    error: error_msg,
                })
            }
        }
    }
}

/// Create an ONNX Runtime session with CPU-only execution
///
/// For models incompatible with hardware acceleration.
///
/// # Errors
/// Returns `OnnxError` if the file is missing or session creation fails.
pub fn create_cpu_session(model_path: &Path) -> Result<Session, OnnxError> {
    if !model_path.exists() {
        return Err(OnnxError::ModelNotFound(model_path.display().to_string()));
    }

    Session::builder()
        .map_err(|e| OnnxError::SessionBuilderError(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| OnnxError::SessionBuilderError(e.to_string()))?
        .with_intra_threads(intra_threads())
        .map_err(|e| OnnxError::SessionBuilderError(e.to_string()))?
        .with_memory_pattern(true)
        .map_err(|e| OnnxError::SessionBuilderError(e.to_string()))?
        .with_execution_providers([CPUExecutionProvider::default().build()])
        .map_err(|e| OnnxError::SessionBuilderError(e.to_string()))?
        .commit_from_file(model_path)
        .map_err(|e| OnnxError::ModelLoadError {
            path: model_path.display().to_string(),
            error: e.to_string(),
        })
}
