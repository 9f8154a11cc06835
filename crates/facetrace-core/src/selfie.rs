//! Selfie embedding: pick one representative face from a single image.

use crate::pipeline::{ImagePipeline, PipelineError};
use crate::types::{Embedding, FaceResult};

#[derive(Debug, Clone, PartialEq)]
pub enum SelfieOutcome {
    Face {
        embedding: Embedding,
        confidence: f32,
        face_count: usize,
    },
    NoFace,
}

/// The face with the largest pre-padding box. Ties keep the earliest face.
pub fn select_largest_face(faces: &[FaceResult]) -> Option<&FaceResult> {
    let mut best: Option<&FaceResult> = None;
    for face in faces {
        match best {
            Some(current) if face.area() <= current.area() => {}
            _ => best = Some(face),
        }
    }
    best
}

/// Run the pipeline once and return the largest face with the total count.
pub fn embed_selfie<P: ImagePipeline + ?Sized>(
    pipeline: &mut P,
    image_bytes: &[u8],
) -> Result<SelfieOutcome, PipelineError> {
    let faces = pipeline.process_single_image(image_bytes)?;

    let Some(best) = select_largest_face(&faces) else {
        tracing::info!("no face detected in selfie");
        return Ok(SelfieOutcome::NoFace);
    };

    tracing::info!(
        face_count = faces.len(),
        face_index = best.face_index,
        confidence = best.confidence,
        "selfie embedded"
    );
    Ok(SelfieOutcome::Face {
        embedding: best.embedding.clone(),
        confidence: best.confidence,
        face_count: faces.len(),
    })
}
