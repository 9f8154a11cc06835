//! facetrace-core: face embedding pipeline for photo galleries.
//!
//! Decodes photos, detects faces with SCRFD, aligns each face to a canonical
//! 112×112 crop and embeds it with ArcFace (both via ONNX Runtime). On top of
//! the single-image pipeline sit the gallery batch orchestrator, selfie face
//! selection and the refined gallery search.

pub mod alignment;
pub mod batch;
pub mod decoder;
pub mod detector;
pub mod pipeline;
pub mod recognizer;
pub mod search;
pub mod selfie;
pub mod types;

use std::path::{Path, PathBuf};

pub use batch::{
    process_gallery, FaceStore, FetchError, ImageSource, JobStatus, JobUpdate, MediaItem, ProcessingSummary,
    StoreError,
};
pub use detector::{FaceDetector, ScrfdDetector};
pub use pipeline::{FacePipeline, ImagePipeline, PipelineConfig, PipelineError};
pub use recognizer::{ArcFaceRecognizer, FaceEmbedder};
pub use search::{refined_search, FaceCandidate, FaceIndex, FaceMatch, SearchConfig, SearchResult};
pub use selfie::{embed_selfie, SelfieOutcome};
pub use types::{BoundingBox, DetectedFace, Embedding, FaceResult, Landmarks, PixelGrid, Point};

/// SCRFD detection model file name.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";

/// ArcFace recognition model file name.
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Per-user data directory: `$XDG_DATA_HOME/facetrace`, falling back to
/// `~/.local/share/facetrace`.
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facetrace")
}

/// Where the ONNX models are looked up when no directory is configured.
pub fn default_model_dir() -> PathBuf {
    data_dir().join("models")
}

/// Model loading failure at startup.
#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    Detector(#[from] detector::DetectorError),
    #[error(transparent)]
    Recognizer(#[from] recognizer::RecognizerError),
}

/// Load both ONNX models from `model_dir` into a ready pipeline.
pub fn load_pipeline(
    model_dir: &Path,
    intra_threads: usize,
    config: PipelineConfig,
) -> Result<FacePipeline<ScrfdDetector, ArcFaceRecognizer>, LoadError> {
    let detector = ScrfdDetector::load(&model_dir.join(SCRFD_MODEL_FILE), intra_threads)?;
    tracing::info!("SCRFD detector loaded");
    let recognizer = ArcFaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE), intra_threads)?;
    tracing::info!("ArcFace recognizer loaded");
    Ok(FacePipeline::new(detector, recognizer, config))
}
