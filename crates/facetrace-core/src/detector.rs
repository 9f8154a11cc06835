//! Face detection capability and its SCRFD implementation via ONNX Runtime.
//!
//! SCRFD (det_10g) predicts, per stride level, a score, a box as distances
//! from the anchor centre, and five landmark offsets. Decoding maps those back
//! through the letterbox into source pixels before NMS.

use crate::types::{BoundingBox, DetectedFace, Landmarks, PixelGrid, Point};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [u32; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (place the insightface buffalo_l model in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates faces in a pixel grid.
///
/// Implementations return faces in a reproducible order, so repeated calls on
/// identical input assign identical face indices. "No face" is an empty
/// result, never an error. Every returned face carries a full landmark set.
pub trait FaceDetector {
    fn detect(&mut self, image: &PixelGrid) -> Result<Vec<DetectedFace>, DetectorError>;
}

impl<T: FaceDetector + ?Sized> FaceDetector for Box<T> {
    fn detect(&mut self, image: &PixelGrid) -> Result<Vec<DetectedFace>, DetectorError> {
        (**self).detect(image)
    }
}

/// Raw detection; landmarks are missing when the kps head was short.
#[derive(Debug, Clone)]
struct Candidate {
    bbox: BoundingBox,
    confidence: f32,
    landmarks: Option<[Point; 5]>,
}

/// How the source image sits inside the square network input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
    width: u32,
    height: u32,
}

impl Letterbox {
    fn fit(src_w: u32, src_h: u32, side: u32) -> Self {
        let scale = (side as f32 / src_w as f32).min(side as f32 / src_h as f32);
        let width = ((src_w as f32 * scale).round() as u32).clamp(1, side);
        let height = ((src_h as f32 * scale).round() as u32).clamp(1, side);
        Self {
            scale,
            pad_x: (side - width) / 2,
            pad_y: (side - height) / 2,
            width,
            height,
        }
    }

    /// Network-input coordinates back to source pixels.
    fn to_source(&self, x: f32, y: f32) -> Point {
        Point::new(
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Output positions of the three heads for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideHeads {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// Decodes one stride level's flat head outputs.
struct StrideDecoder<'a> {
    stride: u32,
    grid_w: usize,
    letterbox: &'a Letterbox,
}

impl StrideDecoder<'_> {
    fn decode(&self, scores: &[f32], bboxes: &[f32], kps: &[f32], threshold: f32) -> Vec<Candidate> {
        let s = self.stride as f32;
        scores
            .iter()
            .enumerate()
            .filter(|&(_, &score)| score > threshold)
            .filter_map(|(idx, &score)| {
                let cell = idx / SCRFD_ANCHORS_PER_CELL;
                let cx = (cell % self.grid_w) as f32 * s;
                let cy = (cell / self.grid_w) as f32 * s;

                let d = bboxes.get(idx * 4..idx * 4 + 4)?;
                let top_left = self.letterbox.to_source(cx - d[0] * s, cy - d[1] * s);
                let bottom_right = self.letterbox.to_source(cx + d[2] * s, cy + d[3] * s);

                let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
                    std::array::from_fn(|i| self.letterbox.to_source(cx + k[i * 2] * s, cy + k[i * 2 + 1] * s))
                });

                Some(Candidate {
                    bbox: BoundingBox {
                        x1: top_left.x,
                        y1: top_left.y,
                        x2: bottom_right.x,
                        y2: bottom_right.y,
                    },
                    confidence: score,
                    landmarks,
                })
            })
            .collect()
    }
}

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    /// Heads for strides 8, 16, 32, resolved at load time.
    heads: [StrideHeads; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps for 3 strides), model has {}",
                output_names.len()
            )));
        }

        let heads = resolve_heads(&output_names);
        tracing::debug!(?heads, "SCRFD output heads");
        Ok(Self { session, heads })
    }

    /// Letterbox a BGR grid into a normalized RGB NCHW tensor.
    fn preprocess(image: &PixelGrid) -> (Array4<f32>, Letterbox) {
        let side = SCRFD_INPUT_SIZE;
        let lb = Letterbox::fit(image.width, image.height, side);

        // Channel order is irrelevant to the resampler; the buffer stays BGR.
        let resized = RgbImage::from_raw(image.width, image.height, image.data.clone())
            .map(|src| imageops::resize(&src, lb.width, lb.height, FilterType::Triangle));

        // Border pixels sit at the mean and normalize to zero.
        let n = side as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, n, n));
        let Some(resized) = resized else {
            return (tensor, lb);
        };

        for (x, y, px) in resized.enumerate_pixels() {
            let tx = (x + lb.pad_x) as usize;
            let ty = (y + lb.pad_y) as usize;
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = (px.0[2 - c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }
        (tensor, lb)
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, image: &PixelGrid) -> Result<Vec<DetectedFace>, DetectorError> {
        if image.is_empty() {
            return Ok(Vec::new());
        }

        let (input, lb) = Self::preprocess(image);
        let heads = self.heads;
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let extract = |idx: usize, what: &str, stride: u32| {
            outputs[idx]
                .try_extract_tensor::<f32>()
                .map(|(_, data)| data)
                .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
        };

        let mut candidates = Vec::new();
        for (h, &stride) in heads.iter().zip(SCRFD_STRIDES.iter()) {
            let decoder = StrideDecoder {
                stride,
                grid_w: (SCRFD_INPUT_SIZE / stride) as usize,
                letterbox: &lb,
            };
            candidates.extend(decoder.decode(
                extract(h.score, "scores", stride)?,
                extract(h.bbox, "bboxes", stride)?,
                extract(h.kps, "kps", stride)?,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        let faces = finalize(nms(candidates, SCRFD_NMS_THRESHOLD));
        tracing::debug!(faces = faces.len(), "SCRFD detection complete");
        Ok(faces)
    }
}

/// Map head outputs to strides by name (`score_8`, `bbox_16`, ...), or fall
/// back to the usual export order: scores, then boxes, then keypoints, each
/// for strides 8/16/32.
fn resolve_heads(names: &[String]) -> [StrideHeads; 3] {
    let position = |head: &str, stride: u32| names.iter().position(|n| *n == format!("{head}_{stride}"));
    let named = |stride: u32| {
        Some(StrideHeads {
            score: position("score", stride)?,
            bbox: position("bbox", stride)?,
            kps: position("kps", stride)?,
        })
    };

    if let [Some(a), Some(b), Some(c)] = SCRFD_STRIDES.map(named) {
        return [a, b, c];
    }

    tracing::info!(?names, "SCRFD output names not recognized, using positional heads");
    std::array::from_fn(|i| StrideHeads {
        score: i,
        bbox: i + 3,
        kps: i + 6,
    })
}

/// Greedy NMS, highest confidence first.
fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for c in candidates {
        if kept.iter().all(|k| iou(&k.bbox, &c.bbox) <= iou_threshold) {
            kept.push(c);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = w * h;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

/// Drop detections without landmarks and impose the stable output order:
/// descending confidence, then top-left position.
fn finalize(candidates: Vec<Candidate>) -> Vec<DetectedFace> {
    let mut faces: Vec<DetectedFace> = candidates
        .into_iter()
        .filter_map(|c| {
            Some(DetectedFace {
                bounding_box: c.bbox,
                landmarks: Landmarks::from_points(c.landmarks?),
                confidence: c.confidence,
            })
        })
        .collect();

    faces.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.bounding_box.y1.total_cmp(&b.bounding_box.y1))
            .then_with(|| a.bounding_box.x1.total_cmp(&b.bounding_box.x1))
    });
    faces
}
