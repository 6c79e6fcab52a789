//! Background job execution: status transitions, artifact persistence
//! and the blocking-task bridge used by async callers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use deepfake_common::{AnalysisError, Verdict};

use crate::{analyze, MediaKind, ModelContext};

/// Lifecycle states of one analysis job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Artifacts persisted alongside a completed job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobArtifacts {
    /// URL of the persisted primary face crop
    pub face_url: Option<String>,
    /// URL of the persisted saliency heatmap
    pub heatmap_url: Option<String>,
}

/// Job state store
///
/// Production backs this with a database row per job; tests use an
/// in-memory map.
pub trait JobSink: Send + Sync {
    /// Record that the job has started
    fn mark_processing(&self, job_id: Uuid) -> Result<(), AnalysisError>;

    /// Record the final verdict and any persisted artifacts
    fn mark_completed(
        &self,
        job_id: Uuid,
        verdict: &Verdict,
        artifacts: &JobArtifacts,
    ) -> Result<(), AnalysisError>;

    /// Record an analysis failure with its error text
    fn mark_failed(&self, job_id: Uuid, error: &str) -> Result<(), AnalysisError>;
}

/// Image artifact store
///
/// Production writes to object storage; the CLI writes to a directory.
pub trait BlobSink: Send + Sync {
    /// Persist one image under `name` (no extension) and return its URL
    fn persist_image(&self, name: &str, image: &RgbImage) -> Result<String, AnalysisError>;
}

/// Run one analysis job to completion
///
/// Analysis failures are recorded on the job and do not propagate; only
/// sink failures surface to the caller. Explainable image verdicts get
/// the primary face crop and its heatmap persisted before completion.
///
/// # Errors
/// Returns `AnalysisError` when a status or artifact write fails.
pub fn run_analysis_job(
    ctx: &ModelContext,
    jobs: &dyn JobSink,
    blobs: &dyn BlobSink,
    job_id: Uuid,
    media_path: &Path,
) -> Result<(), AnalysisError> {
    jobs.mark_processing(job_id)?;

    let kind = MediaKind::from_path(media_path);
    info!(%job_id, ?kind, "Starting analysis job");

    let verdict = match analyze(ctx, media_path, kind) {
        Ok(verdict) => verdict,
        Err(e) => {
            error!(%job_id, "Analysis failed: {e}");
            jobs.mark_failed(job_id, &e.to_string())?;
            return Ok(());
        }
    };

    let artifacts = match persist_explanation(ctx, blobs, job_id, media_path, &verdict) {
        Ok(artifacts) => artifacts,
        Err(e) => {
            // Heatmap persistence is best-effort; the verdict still stands
            error!(%job_id, "Explanation persistence failed: {e}");
            JobArtifacts::default()
        }
    };

    info!(%job_id, label = %verdict.label, score = verdict.score, "Job completed");
    jobs.mark_completed(job_id, &verdict, &artifacts)
}

/// Persist the primary face crop and its heatmap for explainable verdicts
fn persist_explanation(
    ctx: &ModelContext,
    blobs: &dyn BlobSink,
    job_id: Uuid,
    media_path: &Path,
    verdict: &Verdict,
) -> Result<JobArtifacts, AnalysisError> {
    if verdict.metadata.get("explainable").map(String::as_str) != Some("true") {
        return Ok(JobArtifacts::default());
    }
    let Some(explainer) = ctx.explainer() else {
        return Ok(JobArtifacts::default());
    };

    let bytes = std::fs::read(media_path)?;
    let image = image::load_from_memory(&bytes)?.to_rgb8();
    let faces = ctx.locator().locate_frame(&image)?;
    let Some(primary) = faces.first() else {
        return Ok(JobArtifacts::default());
    };

    let explanation = explainer
        .explain(&primary.model)
        .map_err(|e| AnalysisError::Inference(e.to_string()))?;

    let face_url = blobs.persist_image(&format!("{job_id}_face"), &primary.full)?;
    let heatmap_url = blobs.persist_image(&format!("{job_id}_heatmap"), &explanation.heatmap)?;

    Ok(JobArtifacts {
        face_url: Some(face_url),
        heatmap_url: Some(heatmap_url),
    })
}

/// Dispatch a job onto the blocking thread pool
///
/// Fire-and-continue: the handle can be awaited for test synchronization
/// but callers normally drop it. Failures are already recorded on the
/// job sink by `run_analysis_job`.
pub fn spawn_analysis(
    ctx: Arc<ModelContext>,
    jobs: Arc<dyn JobSink>,
    blobs: Arc<dyn BlobSink>,
    job_id: Uuid,
    media_path: PathBuf,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        if let Err(e) = run_analysis_job(&ctx, jobs.as_ref(), blobs.as_ref(), job_id, &media_path) {
            error!(%job_id, "Job sink failure: {e}");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{encode_png, stub_context};
    use deepfake_common::Label;
    use image::RgbImage;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryJobs {
        statuses: Mutex<Vec<JobStatus>>,
        verdict: Mutex<Option<Verdict>>,
        error: Mutex<Option<String>>,
    }

    impl JobSink for MemoryJobs {
        fn mark_processing(&self, _job_id: Uuid) -> Result<(), AnalysisError> {
            self.statuses.lock().unwrap().push(JobStatus::Processing);
            Ok(())
        }

        fn mark_completed(
            &self,
            _job_id: Uuid,
            verdict: &Verdict,
            _artifacts: &JobArtifacts,
        ) -> Result<(), AnalysisError> {
            self.statuses.lock().unwrap().push(JobStatus::Completed);
            *self.verdict.lock().unwrap() = Some(verdict.clone());
            Ok(())
        }

        fn mark_failed(&self, _job_id: Uuid, error: &str) -> Result<(), AnalysisError> {
            self.statuses.lock().unwrap().push(JobStatus::Failed);
            *self.error.lock().unwrap() = Some(error.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryBlobs {
        images: Mutex<HashMap<String, (u32, u32)>>,
    }

    impl BlobSink for MemoryBlobs {
        fn persist_image(&self, name: &str, image: &RgbImage) -> Result<String, AnalysisError> {
            self.images
                .lock()
                .unwrap()
                .insert(name.to_string(), image.dimensions());
            Ok(format!("mem://{name}.png"))
        }
    }

    #[test]
    fn test_job_completes_with_verdict() {
        let dir = std::env::temp_dir().join(format!("dfjob-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let media = dir.join("input.png");
        std::fs::write(&media, encode_png(&RgbImage::new(128, 128))).unwrap();

        let ctx = stub_context(1, vec![0.95]);
        let jobs = MemoryJobs::default();
        let blobs = MemoryBlobs::default();

        run_analysis_job(&ctx, &jobs, &blobs, Uuid::new_v4(), &media).unwrap();

        let statuses = jobs.statuses.lock().unwrap();
        assert_eq!(&*statuses, &[JobStatus::Processing, JobStatus::Completed]);
        let verdict = jobs.verdict.lock().unwrap();
        assert_eq!(verdict.as_ref().unwrap().label, Label::Fake);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_media_marks_job_failed() {
        let ctx = stub_context(1, vec![0.5]);
        let jobs = MemoryJobs::default();
        let blobs = MemoryBlobs::default();

        run_analysis_job(
            &ctx,
            &jobs,
            &blobs,
            Uuid::new_v4(),
            Path::new("/nonexistent/input.png"),
        )
        .unwrap();

        let statuses = jobs.statuses.lock().unwrap();
        assert_eq!(&*statuses, &[JobStatus::Processing, JobStatus::Failed]);
        assert!(jobs.error.lock().unwrap().is_some());
    }

    #[test]
    fn test_no_heatmap_without_explainer() {
        let dir = std::env::temp_dir().join(format!("dfjob-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let media = dir.join("input.png");
        std::fs::write(&media, encode_png(&RgbImage::new(128, 128))).unwrap();

        let ctx = stub_context(1, vec![0.95]);
        let jobs = MemoryJobs::default();
        let blobs = MemoryBlobs::default();

        run_analysis_job(&ctx, &jobs, &blobs, Uuid::new_v4(), &media).unwrap();
        assert!(blobs.images.lock().unwrap().is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_spawn_analysis_runs_to_completion() {
        let dir = std::env::temp_dir().join(format!("dfjob-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let media = dir.join("input.png");
        std::fs::write(&media, encode_png(&RgbImage::new(128, 128))).unwrap();

        let ctx = Arc::new(stub_context(2, vec![0.1, 0.2]));
        let jobs: Arc<MemoryJobs> = Arc::new(MemoryJobs::default());
        let blobs: Arc<MemoryBlobs> = Arc::new(MemoryBlobs::default());

        spawn_analysis(
            Arc::clone(&ctx),
            Arc::clone(&jobs) as Arc<dyn JobSink>,
            Arc::clone(&blobs) as Arc<dyn BlobSink>,
            Uuid::new_v4(),
            media,
        )
        .await
        .unwrap();

        let verdict = jobs.verdict.lock().unwrap();
        assert_eq!(verdict.as_ref().unwrap().label, Label::Real);

        std::fs::remove_dir_all(&dir).ok();
    }
}
