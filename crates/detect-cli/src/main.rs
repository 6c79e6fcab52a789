//! Deepfake Detect CLI - Calibrated deepfake analysis for images and video
//!
//! Command-line front end over the analysis pipeline: face localization,
//! patch-based ensemble scoring and the calibrated decision policy.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

use deepfake_analyzer::job::{run_analysis_job, BlobSink, JobArtifacts, JobSink};
use deepfake_analyzer::{ModelConfig, ModelContext};
use deepfake_common::{AnalysisError, Verdict};
use deepfake_decision::DecisionThresholds;

#[derive(Parser)]
#[command(
    name = "deepfake-detect",
    version,
    about = "Calibrated deepfake detection for images and video",
    after_help = "EXAMPLES:\n  \
                  # Analyze one image with models from ./models\n  \
                  deepfake-detect analyze photo.jpg\n\n  \
                  # Analyze a video clip\n  \
                  deepfake-detect analyze clip.mp4 --model-dir /opt/models\n\n  \
                  # Use a full JSON configuration and keep heatmaps\n  \
                  deepfake-detect analyze photo.jpg --config detect.json --output-dir ./results\n\n  \
                  # Show the calibrated decision thresholds\n  \
                  deepfake-detect thresholds"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze one image or video file and print the verdict as JSON
    Analyze {
        /// Media file to analyze (extension selects image vs video handling)
        input: PathBuf,

        /// JSON model configuration file
        #[arg(long, conflicts_with = "model_dir")]
        config: Option<PathBuf>,

        /// Directory holding the model artifacts (default layout)
        #[arg(long, default_value = "models")]
        model_dir: PathBuf,

        /// Directory for face crops and heatmaps of explainable verdicts
        #[arg(long, default_value = "out")]
        output_dir: PathBuf,
    },

    /// Print the decision thresholds in effect
    Thresholds {
        /// Calibrated-threshold JSON file; defaults apply when omitted
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

/// Job sink that keeps the outcome in memory for printing
#[derive(Default)]
struct CliJobSink {
    verdict: Mutex<Option<Verdict>>,
    artifacts: Mutex<JobArtifacts>,
    error: Mutex<Option<String>>,
}

impl JobSink for CliJobSink {
    fn mark_processing(&self, _job_id: Uuid) -> Result<(), AnalysisError> {
        Ok(())
    }

    fn mark_completed(
        &self,
        _job_id: Uuid,
        verdict: &Verdict,
        artifacts: &JobArtifacts,
    ) -> Result<(), AnalysisError> {
        *self.verdict.lock().unwrap() = Some(verdict.clone());
        *self.artifacts.lock().unwrap() = artifacts.clone();
        Ok(())
    }

    fn mark_failed(&self, _job_id: Uuid, error: &str) -> Result<(), AnalysisError> {
        *self.error.lock().unwrap() = Some(error.to_string());
        Ok(())
    }
}

/// Blob sink writing PNG artifacts into a directory
struct DirBlobSink {
    dir: PathBuf,
}

impl BlobSink for DirBlobSink {
    fn persist_image(
        &self,
        name: &str,
        image: &image::RgbImage,
    ) -> Result<String, AnalysisError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{name}.png"));
        image.save(&path)?;
        Ok(path.display().to_string())
    }
}

fn run_analyze(
    input: &Path,
    config: Option<&Path>,
    model_dir: &Path,
    output_dir: &Path,
) -> Result<()> {
    let config = match config {
        Some(path) => ModelConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => {
            // Default layout: every artifact lives under --model-dir
            let json = serde_json::json!({ "model_dir": model_dir });
            serde_json::from_value(json).context("Failed to build default config")?
        }
    };

    let ctx = ModelContext::from_config(&config).context("Failed to load models")?;

    let jobs = CliJobSink::default();
    let blobs = DirBlobSink {
        dir: output_dir.to_path_buf(),
    };

    run_analysis_job(&ctx, &jobs, &blobs, Uuid::new_v4(), input)
        .context("Analysis job failed")?;

    if let Some(error) = jobs.error.lock().unwrap().as_ref() {
        anyhow::bail!("Analysis failed: {error}");
    }

    let verdict = jobs
        .verdict
        .lock()
        .unwrap()
        .take()
        .context("Job finished without a verdict")?;

    let mut output = serde_json::to_value(&verdict)?;
    let artifacts = jobs.artifacts.lock().unwrap();
    if let Some(face_url) = &artifacts.face_url {
        output["face_url"] = serde_json::json!(face_url);
    }
    if let Some(heatmap_url) = &artifacts.heatmap_url {
        output["heatmap_url"] = serde_json::json!(heatmap_url);
    }

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn run_thresholds(file: Option<&Path>) -> Result<()> {
    let thresholds = match file {
        Some(path) => DecisionThresholds::from_file(path)
            .with_context(|| format!("Failed to load thresholds {}", path.display()))?,
        None => DecisionThresholds::default(),
    };

    println!("{}", serde_json::to_string_pretty(&thresholds)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command {
        Commands::Analyze {
            input,
            config,
            model_dir,
            output_dir,
        } => run_analyze(&input, config.as_deref(), &model_dir, &output_dir),
        Commands::Thresholds { file } => run_thresholds(file.as_deref()),
    }
}
