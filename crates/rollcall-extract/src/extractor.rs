//! External face extractor, run as a child process per image.
//!
//! The extractor is invoked as
//! `<program> <args..> --model <hog|cnn> --upsample <n> <image>` and must
//! print a single JSON document on stdout:
//!
//! ```json
//! {"faces": [{"box": [top, right, bottom, left], "embedding": [0.01, ...]}]}
//! ```

use async_trait::async_trait;
use rollcall_core::{
    BoundingBox, DetectedFace, DetectionModel, Embedding, EmbeddingProvider, ProviderError,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;

/// Longest stderr excerpt carried in an error.
const STDERR_EXCERPT: usize = 512;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("extractor program not found: {0}")]
    ProgramNotFound(String),
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("cannot read image: {0}")]
    Image(#[from] image::ImageError),
    #[error("failed to run extractor: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("extractor did not finish within {0:?}")]
    Timeout(Duration),
    #[error("extractor exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },
    #[error("extractor output is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("face {index}: {reason}")]
    InvalidFace { index: usize, reason: String },
}

impl From<ExtractError> for ProviderError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::ImageNotFound(path) => ProviderError::ImageNotFound(path),
            e @ (ExtractError::Json(_) | ExtractError::InvalidFace { .. }) => {
                ProviderError::InvalidOutput(e.to_string())
            }
            other => ProviderError::ExtractionFailed(other.to_string()),
        }
    }
}

/// How to run the extractor.
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub program: PathBuf,
    /// Arguments placed before the generated `--model/--upsample/<image>` tail.
    pub args: Vec<String>,
    pub model: DetectionModel,
    /// Number of times the detector upsamples the image; higher finds smaller faces.
    pub upsample: u32,
    pub timeout: Duration,
}

#[derive(Deserialize)]
struct ExtractorOutput {
    faces: Vec<RawFace>,
}

#[derive(Deserialize)]
struct RawFace {
    #[serde(rename = "box")]
    bbox: [u32; 4],
    embedding: Vec<f32>,
}

/// [`EmbeddingProvider`] backed by an external extractor program.
pub struct CommandExtractor {
    config: ExtractorConfig,
}

impl CommandExtractor {
    /// Validate the configuration. A program given as a path must exist;
    /// a bare name is resolved through `PATH` at run time.
    pub fn new(config: ExtractorConfig) -> Result<Self, ExtractError> {
        let program = &config.program;
        if program.components().count() > 1 && !program.exists() {
            return Err(ExtractError::ProgramNotFound(program.display().to_string()));
        }
        tracing::info!(
            program = %program.display(),
            model = %config.model,
            upsample = config.upsample,
            timeout_ms = config.timeout.as_millis() as u64,
            "face extractor configured"
        );
        Ok(Self { config })
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    async fn run(&self, image: &Path) -> Result<Vec<DetectedFace>, ExtractError> {
        if !image.is_file() {
            return Err(ExtractError::ImageNotFound(image.display().to_string()));
        }
        let (width, height) = image::image_dimensions(image)?;

        let mut cmd = tokio::process::Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .arg("--model")
            .arg(self.config.model.as_str())
            .arg("--upsample")
            .arg(self.config.upsample.to_string())
            .arg(image)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.config.timeout, cmd.output())
            .await
            .map_err(|_| ExtractError::Timeout(self.config.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
            return Err(ExtractError::Exit {
                status: output.status.to_string(),
                stderr,
            });
        }

        let faces = parse_output(&output.stdout, width, height)?;
        tracing::debug!(
            image = %image.display(),
            width,
            height,
            faces = faces.len(),
            "extractor finished"
        );
        Ok(faces)
    }
}

#[async_trait]
impl EmbeddingProvider for CommandExtractor {
    async fn detect(&self, image: &Path) -> Result<Vec<DetectedFace>, ProviderError> {
        Ok(self.run(image).await?)
    }
}

/// Parse and validate extractor output for a `width` x `height` image.
///
/// Every embedding must be non-empty, finite, and share one dimension.
/// Boxes are clamped to the image.
pub fn parse_output(
    stdout: &[u8],
    width: u32,
    height: u32,
) -> Result<Vec<DetectedFace>, ExtractError> {
    let parsed: ExtractorOutput = serde_json::from_slice(stdout)?;
    let mut dim: Option<usize> = None;
    let mut faces = Vec::with_capacity(parsed.faces.len());

    for (index, raw) in parsed.faces.into_iter().enumerate() {
        let invalid = |reason: String| ExtractError::InvalidFace { index, reason };
        let [top, right, bottom, left] = raw.bbox;
        if bottom < top || right < left {
            return Err(invalid(format!(
                "box [{top}, {right}, {bottom}, {left}] is inverted"
            )));
        }
        let embedding = Embedding::new(raw.embedding);
        if embedding.dim() == 0 {
            return Err(invalid("embedding is empty".into()));
        }
        if !embedding.is_finite() {
            return Err(invalid("embedding has non-finite values".into()));
        }
        match dim {
            None => dim = Some(embedding.dim()),
            Some(d) if d != embedding.dim() => {
                return Err(invalid(format!(
                    "embedding has {} values, earlier faces have {d}",
                    embedding.dim()
                )));
            }
            Some(_) => {}
        }
        let bounding_box = BoundingBox { top, right, bottom, left }.clamp_to(width, height);
        faces.push(DetectedFace { bounding_box, embedding });
    }

    Ok(faces)
}
