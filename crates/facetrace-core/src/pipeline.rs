//! Single-image pipeline: decode → detect (one retry on empty) → per-face
//! crop/align/embed with failures isolated to the face that raised them.

use crate::alignment::{self, AlignError, FACE_CROP_PADDING};
use crate::decoder::{decode_image, DecodeError};
use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{generate_embedding, FaceEmbedder, RecognizerError};
use crate::types::{DetectedFace, FaceResult, PixelGrid};
use thiserror::Error;

/// Image-level failures. Anything after detection is isolated per face.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("face detection failed: {0}")]
    Detect(#[from] DetectorError),
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Fraction of the box size added on each side before alignment.
    pub crop_padding: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            crop_padding: FACE_CROP_PADDING,
        }
    }
}

/// What happened to one detected face.
#[derive(Debug)]
pub enum FaceOutcome {
    Embedded(FaceResult),
    /// Padded crop was empty; dropped without counting as a failure.
    Skipped { face_index: usize, reason: AlignError },
    Failed { face_index: usize, error: RecognizerError },
}

impl FaceOutcome {
    pub fn into_result(self) -> Option<FaceResult> {
        match self {
            FaceOutcome::Embedded(result) => Some(result),
            _ => None,
        }
    }
}

/// Anything that turns encoded image bytes into face results.
pub trait ImagePipeline {
    /// Returns the embedded faces in detection order, possibly empty. Only
    /// decode and detector failures are errors.
    fn process_single_image(&mut self, image_bytes: &[u8]) -> Result<Vec<FaceResult>, PipelineError>;
}

impl<T: ImagePipeline + ?Sized> ImagePipeline for Box<T> {
    fn process_single_image(&mut self, image_bytes: &[u8]) -> Result<Vec<FaceResult>, PipelineError> {
        (**self).process_single_image(image_bytes)
    }
}

/// Detector + embedding network composed into the per-image pipeline.
///
/// Holds the loaded models; built once per worker and reused across requests.
pub struct FacePipeline<D, E> {
    detector: D,
    embedder: E,
    config: PipelineConfig,
}

impl<D: FaceDetector, E: FaceEmbedder> FacePipeline<D, E> {
    pub fn new(detector: D, embedder: E, config: PipelineConfig) -> Self {
        Self {
            detector,
            embedder,
            config,
        }
    }

    /// Detect faces, retrying exactly once when the first pass finds none.
    pub fn detect_with_retry(&mut self, image: &PixelGrid) -> Result<Vec<DetectedFace>, DetectorError> {
        let faces = self.detector.detect(image)?;
        if !faces.is_empty() {
            return Ok(faces);
        }

        tracing::debug!("no faces on first detection pass, retrying once");
        self.detector.detect(image)
    }

    /// Crop, align and embed a single face.
    pub fn process_face(&mut self, image: &PixelGrid, face_index: usize, face: &DetectedFace) -> FaceOutcome {
        let aligned = match alignment::align_face(image, face, self.config.crop_padding) {
            Ok(aligned) => aligned,
            Err(reason) => return FaceOutcome::Skipped { face_index, reason },
        };

        match generate_embedding(&mut self.embedder, &aligned) {
            Ok(embedding) => FaceOutcome::Embedded(FaceResult {
                face_index,
                embedding,
                confidence: face.confidence,
                bbox: face.bounding_box.truncated(),
            }),
            Err(error) => FaceOutcome::Failed { face_index, error },
        }
    }

    /// Run the whole pipeline and report every face's outcome.
    pub fn analyze(&mut self, image_bytes: &[u8]) -> Result<Vec<FaceOutcome>, PipelineError> {
        let image = decode_image(image_bytes)?;
        let faces = self.detect_with_retry(&image)?;

        let outcomes: Vec<FaceOutcome> = faces
            .iter()
            .enumerate()
            .map(|(idx, face)| {
                let outcome = self.process_face(&image, idx, face);
                match &outcome {
                    FaceOutcome::Embedded(_) => {}
                    FaceOutcome::Skipped { face_index, reason } => {
                        tracing::debug!(face_index, %reason, "face skipped");
                    }
                    FaceOutcome::Failed { face_index, error } => {
                        tracing::warn!(face_index, %error, "error processing face");
                    }
                }
                outcome
            })
            .collect();

        tracing::debug!(
            width = image.width,
            height = image.height,
            detected = faces.len(),
            "image analyzed"
        );
        Ok(outcomes)
    }
}

impl<D: FaceDetector, E: FaceEmbedder> ImagePipeline for FacePipeline<D, E> {
    fn process_single_image(&mut self, image_bytes: &[u8]) -> Result<Vec<FaceResult>, PipelineError> {
        Ok(self
            .analyze(image_bytes)?
            .into_iter()
            .filter_map(FaceOutcome::into_result)
            .collect())
    }
}
