//! Embedding capability and its ArcFace implementation via ONNX Runtime.
//!
//! Extracts 512-dimensional face embeddings from aligned 112×112 crops,
//! using the w600k_r50 ArcFace model.

use crate::alignment::AlignedFace;
use crate::types::{Embedding, PixelGrid, EMBEDDING_DIM};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (place the insightface buffalo_l model in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("expected {expected}-dim embedding, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Embedding network: maps an aligned RGB face to a raw, unnormalized vector.
pub trait FaceEmbedder {
    fn raw_embedding(&mut self, face_rgb: &PixelGrid) -> Result<Vec<f32>, RecognizerError>;

    /// Identifier stored with each embedding.
    fn model_version(&self) -> Option<&str> {
        None
    }
}

impl<T: FaceEmbedder + ?Sized> FaceEmbedder for Box<T> {
    fn raw_embedding(&mut self, face_rgb: &PixelGrid) -> Result<Vec<f32>, RecognizerError> {
        (**self).raw_embedding(face_rgb)
    }

    fn model_version(&self) -> Option<&str> {
        (**self).model_version()
    }
}

/// Embed an aligned face: hand the network RGB, flatten its output and
/// L2-normalize.
pub fn generate_embedding<E: FaceEmbedder + ?Sized>(
    embedder: &mut E,
    face: &AlignedFace,
) -> Result<Embedding, RecognizerError> {
    let rgb = face.grid().swap_rb();
    let raw = embedder.raw_embedding(&rgb)?;

    if raw.len() != EMBEDDING_DIM {
        return Err(RecognizerError::DimensionMismatch {
            expected: EMBEDDING_DIM,
            actual: raw.len(),
        });
    }

    Ok(Embedding::normalized(raw, embedder.model_version().map(str::to_string)))
}

/// ArcFace-based face recognizer.
pub struct ArcFaceRecognizer {
    session: Session,
}

impl ArcFaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Preprocess a 112x112 RGB face into a NCHW float tensor.
    ///
    /// w600k_r50 takes its blob with R and B swapped relative to the image it
    /// is given, so channel 0 carries the blue plane.
    fn preprocess(face_rgb: &PixelGrid) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for y in 0..size {
            for x in 0..size {
                let off = (y * size + x) * PixelGrid::CHANNELS;
                for c in 0..3 {
                    let pixel = face_rgb.data.get(off + 2 - c).copied().unwrap_or(0) as f32;
                    tensor[[0, c, y, x]] = (pixel - ARCFACE_MEAN) / ARCFACE_STD;
                }
            }
        }

        tensor
    }
}

impl FaceEmbedder for ArcFaceRecognizer {
    fn raw_embedding(&mut self, face_rgb: &PixelGrid) -> Result<Vec<f32>, RecognizerError> {
        if face_rgb.width as usize != ARCFACE_INPUT_SIZE || face_rgb.height as usize != ARCFACE_INPUT_SIZE {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_INPUT_SIZE}x{ARCFACE_INPUT_SIZE} face, got {}x{}",
                face_rgb.width, face_rgb.height
            )));
        }

        let input = Self::preprocess(face_rgb);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        // Output is [1, 512]; the flat slice drops the batch dimension.
        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        Ok(raw_data.to_vec())
    }

    fn model_version(&self) -> Option<&str> {
        Some(ARCFACE_MODEL_VERSION)
    }
}
