use serde::{Deserialize, Serialize};

/// Length of every face embedding (ArcFace w600k_r50).
pub const EMBEDDING_DIM: usize = 512;

/// Norm floor applied when normalizing near-zero vectors.
pub const L2_EPS: f32 = 1e-10;

/// A 2D point in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Face bounding box in source-image pixels, corner form (`x1 < x2`, `y1 < y2`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Corners truncated toward zero, as persisted alongside the embedding.
    pub fn truncated(&self) -> [i32; 4] {
        [self.x1 as i32, self.y1 as i32, self.x2 as i32, self.y2 as i32]
    }
}

/// Five-point facial landmarks located by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmarks {
    pub left_eye: Point,
    pub right_eye: Point,
    pub nose: Point,
    pub mouth_left: Point,
    pub mouth_right: Point,
}

impl Landmarks {
    /// Build from the detector's fixed order:
    /// [left_eye, right_eye, nose, mouth_left, mouth_right].
    pub fn from_points(points: [Point; 5]) -> Self {
        Self {
            left_eye: points[0],
            right_eye: points[1],
            nose: points[2],
            mouth_left: points[3],
            mouth_right: points[4],
        }
    }
}

/// One detector output. The confidence is an opaque, detector-defined score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bounding_box: BoundingBox,
    pub landmarks: Landmarks,
    pub confidence: f32,
}

/// 8-bit, 3-channel pixel grid, row-major, in the pipeline's working order (BGR).
#[derive(Clone, PartialEq, Eq)]
pub struct PixelGrid {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl PixelGrid {
    pub const CHANNELS: usize = 3;

    /// Wrap raw interleaved bytes. Returns `None` when the length does not
    /// match `width * height * 3`.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        if data.len() != width as usize * height as usize * Self::CHANNELS {
            return None;
        }
        Some(Self { data, width, height })
    }

    /// A grid where every pixel has the same value.
    pub fn filled(width: u32, height: u32, pixel: [u8; 3]) -> Self {
        let count = width as usize * height as usize;
        let mut data = Vec::with_capacity(count * Self::CHANNELS);
        for _ in 0..count {
            data.extend_from_slice(&pixel);
        }
        Self { data, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let off = (y as usize * self.width as usize + x as usize) * Self::CHANNELS;
        [self.data[off], self.data[off + 1], self.data[off + 2]]
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, pixel: [u8; 3]) {
        let off = (y as usize * self.width as usize + x as usize) * Self::CHANNELS;
        self.data[off..off + Self::CHANNELS].copy_from_slice(&pixel);
    }

    /// Copy out the half-open region `[x1, x2) × [y1, y2)`. Callers clip first.
    pub fn crop(&self, x1: u32, y1: u32, x2: u32, y2: u32) -> PixelGrid {
        let width = x2.saturating_sub(x1);
        let height = y2.saturating_sub(y1);
        let row_bytes = width as usize * Self::CHANNELS;
        let mut data = Vec::with_capacity(row_bytes * height as usize);
        for y in y1..y2 {
            let start = (y as usize * self.width as usize + x1 as usize) * Self::CHANNELS;
            data.extend_from_slice(&self.data[start..start + row_bytes]);
        }
        PixelGrid { data, width, height }
    }

    /// Reverse the channel order of every pixel (BGR ↔ RGB).
    pub fn swap_rb(&self) -> PixelGrid {
        let mut data = self.data.clone();
        for px in data.chunks_exact_mut(Self::CHANNELS) {
            px.swap(0, 2);
        }
        PixelGrid {
            data,
            width: self.width,
            height: self.height,
        }
    }
}

impl std::fmt::Debug for PixelGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelGrid")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

/// L2-normalize a vector. Norms below [`L2_EPS`] divide by the floor instead,
/// so a degenerate vector shrinks rather than erroring.
pub fn l2_normalize(mut values: Vec<f32>) -> Vec<f32> {
    let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm.max(L2_EPS);
    for v in &mut values {
        *v /= denom;
    }
    values
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// L2-normalize a raw network output into an embedding.
    pub fn normalized(raw: Vec<f32>, model_version: Option<String>) -> Self {
        Self {
            values: l2_normalize(raw),
            model_version,
        }
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One successfully embedded face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceResult {
    /// Position in the detector's ordered output for this image. Not renumbered
    /// when sibling faces are dropped.
    pub face_index: usize,
    pub embedding: Embedding,
    pub confidence: f32,
    /// Pre-padding detection box, truncated: [x1, y1, x2, y2].
    pub bbox: [i32; 4],
}

impl FaceResult {
    /// Area of the pre-padding box in whole pixels.
    pub fn area(&self) -> i64 {
        let [x1, y1, x2, y2] = self.bbox;
        (x2 as i64 - x1 as i64) * (y2 as i64 - y1 as i64)
    }
}
