//! Face alignment to the canonical 112×112 crop.
//!
//! Steps, in order: padded crop around the detection box, eye landmarks
//! re-based into the crop, rotation about the eye midpoint so the eye line is
//! horizontal (bicubic), area-averaging resize to 112×112, then a fixed 180°
//! turn. Stored gallery embeddings were produced with exactly this geometry;
//! every step must stay bit-for-bit stable.

use crate::types::{BoundingBox, DetectedFace, PixelGrid, Point};
use thiserror::Error;

/// Fraction of the box width/height added on each side before cropping.
pub const FACE_CROP_PADDING: f64 = 0.2;

/// Side length of the canonical face image.
pub const ALIGNED_FACE_SIZE: u32 = 112;

/// Fractional sample positions are quantized to 1/32 pixel.
const INTER_BITS: u32 = 5;
const INTER_TAB_SIZE: i64 = 1 << INTER_BITS;

/// Keys cubic convolution coefficient.
const CUBIC_A: f64 = -0.75;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AlignError {
    #[error("padded crop is empty ({width}x{height})")]
    DegenerateCrop { width: u32, height: u32 },
}

/// Canonical 112×112 face image in the pipeline's working channel order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignedFace(PixelGrid);

impl AlignedFace {
    pub fn grid(&self) -> &PixelGrid {
        &self.0
    }
}

/// Half-open pixel rectangle `[x1, x2) × [y1, y2)` clipped to the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl CropRect {
    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

/// Expand `bbox` by `padding` of its own size on each side, truncate to whole
/// pixels and clip to a `width × height` image.
pub fn padded_crop_rect(bbox: &BoundingBox, padding: f64, width: u32, height: u32) -> CropRect {
    let (x1, y1, x2, y2) = (bbox.x1 as f64, bbox.y1 as f64, bbox.x2 as f64, bbox.y2 as f64);
    let box_w = x2 - x1;
    let box_h = y2 - y1;

    let clip = |v: f64, max: u32| (v as i64).clamp(0, max as i64) as u32;

    let x1p = clip(x1 - box_w * padding, width);
    let y1p = clip(y1 - box_h * padding, height);
    let x2p = clip(x2 + box_w * padding, width);
    let y2p = clip(y2 + box_h * padding, height);

    CropRect {
        x1: x1p,
        y1: y1p,
        x2: x2p.max(x1p),
        y2: y2p.max(y1p),
    }
}

/// Angle of the left→right eye line from horizontal, in degrees.
pub fn rotation_angle(left_eye: (f64, f64), right_eye: (f64, f64)) -> f64 {
    let dx = right_eye.0 - left_eye.0;
    let dy = right_eye.1 - left_eye.1;
    dy.atan2(dx).to_degrees()
}

/// 2×3 similarity transform rotating by `angle` degrees (counter-clockwise as
/// displayed, y axis down) about `center` at `scale`.
///
/// Returned as `[a, b, c, d, e, f]` for the matrix:
/// ```text
/// | a  b  c |
/// | d  e  f |
/// ```
pub fn rotation_matrix(center: (f64, f64), angle: f64, scale: f64) -> [f64; 6] {
    let rad = angle.to_radians();
    let alpha = rad.cos() * scale;
    let beta = rad.sin() * scale;
    let (cx, cy) = center;

    [
        alpha,
        beta,
        (1.0 - alpha) * cx - beta * cy,
        -beta,
        alpha,
        beta * cx + (1.0 - alpha) * cy,
    ]
}

/// Apply a 2×3 affine matrix to a point.
pub fn transform_point(m: &[f64; 6], p: (f64, f64)) -> (f64, f64) {
    (m[0] * p.0 + m[1] * p.1 + m[2], m[3] * p.0 + m[4] * p.1 + m[5])
}

fn invert_affine(m: &[f64; 6]) -> [f64; 6] {
    let det = m[0] * m[4] - m[1] * m[3];
    let d = if det != 0.0 { 1.0 / det } else { 0.0 };
    let a11 = m[4] * d;
    let a22 = m[0] * d;
    let a12 = -m[1] * d;
    let a21 = -m[3] * d;
    [
        a11,
        a12,
        -a11 * m[2] - a12 * m[5],
        a21,
        a22,
        -a21 * m[2] - a22 * m[5],
    ]
}

fn cubic_coeffs(t: f64) -> [f64; 4] {
    let c0 = ((CUBIC_A * (t + 1.0) - 5.0 * CUBIC_A) * (t + 1.0) + 8.0 * CUBIC_A) * (t + 1.0) - 4.0 * CUBIC_A;
    let c1 = ((CUBIC_A + 2.0) * t - (CUBIC_A + 3.0)) * t * t + 1.0;
    let c2 = ((CUBIC_A + 2.0) * (1.0 - t) - (CUBIC_A + 3.0)) * (1.0 - t) * (1.0 - t) + 1.0;
    [c0, c1, c2, 1.0 - c0 - c1 - c2]
}

/// Warp `src` through the forward matrix `m` into an image of the same size.
///
/// Bicubic sampling; samples outside the source read as black.
pub fn warp_affine_cubic(src: &PixelGrid, m: &[f64; 6]) -> PixelGrid {
    let inv = invert_affine(m);
    let (w, h) = (src.width as i64, src.height as i64);
    let ch = PixelGrid::CHANNELS;
    let mut out = vec![0u8; src.data.len()];

    for y in 0..h {
        for x in 0..w {
            let (sx, sy) = transform_point(&inv, (x as f64, y as f64));
            let qx = (sx * INTER_TAB_SIZE as f64).round() as i64;
            let qy = (sy * INTER_TAB_SIZE as f64).round() as i64;
            let ix = qx >> INTER_BITS;
            let iy = qy >> INTER_BITS;
            let wx = cubic_coeffs((qx & (INTER_TAB_SIZE - 1)) as f64 / INTER_TAB_SIZE as f64);
            let wy = cubic_coeffs((qy & (INTER_TAB_SIZE - 1)) as f64 / INTER_TAB_SIZE as f64);

            let mut acc = [0.0f64; 3];
            for (j, wyj) in wy.iter().enumerate() {
                let py = iy - 1 + j as i64;
                if py < 0 || py >= h {
                    continue;
                }
                for (i, wxi) in wx.iter().enumerate() {
                    let px = ix - 1 + i as i64;
                    if px < 0 || px >= w {
                        continue;
                    }
                    let off = (py as usize * w as usize + px as usize) * ch;
                    let weight = wyj * wxi;
                    for c in 0..ch {
                        acc[c] += weight * src.data[off + c] as f64;
                    }
                }
            }

            let dst = (y as usize * w as usize + x as usize) * ch;
            for c in 0..ch {
                out[dst + c] = acc[c].round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    PixelGrid {
        data: out,
        width: src.width,
        height: src.height,
    }
}

/// Per-destination-index list of `(source index, weight)` covering one output
/// cell when shrinking `src_len` samples to `dst_len`.
fn area_weights(src_len: u32, dst_len: u32) -> Vec<Vec<(usize, f64)>> {
    let scale = src_len as f64 / dst_len as f64;
    let last = src_len as i64 - 1;

    (0..dst_len)
        .map(|d| {
            let fs1 = d as f64 * scale;
            let fs2 = fs1 + scale;
            let cell = scale.min(src_len as f64 - fs1);

            let s2 = (fs2.floor() as i64).min(last);
            let s1 = (fs1.ceil() as i64).min(s2);

            let mut taps = Vec::new();
            if s1 as f64 - fs1 > 1e-3 {
                taps.push(((s1 - 1) as usize, (s1 as f64 - fs1) / cell));
            }
            for s in s1..s2 {
                taps.push((s as usize, 1.0 / cell));
            }
            if fs2 - s2 as f64 > 1e-3 {
                taps.push((s2 as usize, (fs2 - s2 as f64).min(1.0).min(cell) / cell));
            }
            taps
        })
        .collect()
}

/// Per-destination-index `(source index, weight)` pairs for enlarging along one
/// axis, where area resampling degenerates to linear interpolation.
fn enlarge_weights(src_len: u32, dst_len: u32) -> Vec<Vec<(usize, f64)>> {
    let scale = src_len as f64 / dst_len as f64;
    let inv_scale = 1.0 / scale;

    (0..dst_len)
        .map(|d| {
            let mut s = (d as f64 * scale).floor() as i64;
            let mut f = (d + 1) as f64 - (s + 1) as f64 * inv_scale;
            f = if f <= 0.0 { 0.0 } else { f - f.floor() };

            if s < 0 {
                s = 0;
                f = 0.0;
            }
            if s >= src_len as i64 - 1 {
                s = src_len as i64 - 1;
                f = 0.0;
            }

            let s = s as usize;
            if f == 0.0 {
                vec![(s, 1.0)]
            } else {
                vec![(s, 1.0 - f), (s + 1, f)]
            }
        })
        .collect()
}

/// Resize with area averaging (shrinking) or its linear counterpart (enlarging).
pub fn resize_area(src: &PixelGrid, dst_w: u32, dst_h: u32) -> PixelGrid {
    let shrinking = src.width >= dst_w && src.height >= dst_h;
    let (wx, wy) = if shrinking {
        (area_weights(src.width, dst_w), area_weights(src.height, dst_h))
    } else {
        (enlarge_weights(src.width, dst_w), enlarge_weights(src.height, dst_h))
    };

    let ch = PixelGrid::CHANNELS;
    let src_w = src.width as usize;
    let mut out = Vec::with_capacity(dst_w as usize * dst_h as usize * ch);

    for row in &wy {
        for col in &wx {
            let mut acc = [0.0f64; 3];
            for &(sy, wgt_y) in row {
                for &(sx, wgt_x) in col {
                    let off = (sy * src_w + sx) * ch;
                    let weight = wgt_y * wgt_x;
                    for c in 0..ch {
                        acc[c] += weight * src.data[off + c] as f64;
                    }
                }
            }
            out.extend(acc.iter().map(|v| v.round().clamp(0.0, 255.0) as u8));
        }
    }

    PixelGrid {
        data: out,
        width: dst_w,
        height: dst_h,
    }
}

/// Rotate a grid by 180 degrees.
pub fn rotate_180(src: &PixelGrid) -> PixelGrid {
    let data = src
        .data
        .chunks_exact(PixelGrid::CHANNELS)
        .rev()
        .flatten()
        .copied()
        .collect();
    PixelGrid {
        data,
        width: src.width,
        height: src.height,
    }
}

/// Align one detected face from `image` into the canonical 112×112 crop.
///
/// Fails only when the padded crop is empty after clipping.
pub fn align_face(image: &PixelGrid, face: &DetectedFace, padding: f64) -> Result<AlignedFace, AlignError> {
    let rect = padded_crop_rect(&face.bounding_box, padding, image.width, image.height);
    if rect.is_empty() {
        return Err(AlignError::DegenerateCrop {
            width: rect.width(),
            height: rect.height(),
        });
    }
    let crop = image.crop(rect.x1, rect.y1, rect.x2, rect.y2);

    let rebase = |p: Point| (p.x as f64 - rect.x1 as f64, p.y as f64 - rect.y1 as f64);
    let left_eye = rebase(face.landmarks.left_eye);
    let right_eye = rebase(face.landmarks.right_eye);

    let angle = rotation_angle(left_eye, right_eye);
    let eyes_center = (
        (left_eye.0 + right_eye.0) / 2.0,
        (left_eye.1 + right_eye.1) / 2.0,
    );

    let m = rotation_matrix(eyes_center, angle, 1.0);
    let rotated = warp_affine_cubic(&crop, &m);
    let resized = resize_area(&rotated, ALIGNED_FACE_SIZE, ALIGNED_FACE_SIZE);

    // Compatibility constant: the stored gallery was embedded upside down.
    Ok(AlignedFace(rotate_180(&resized)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Landmarks;

    fn face_at(bbox: BoundingBox, left_eye: Point, right_eye: Point) -> DetectedFace {
        DetectedFace {
            bounding_box: bbox,
            landmarks: Landmarks {
                left_eye,
                right_eye,
                nose: Point::new((left_eye.x + right_eye.x) / 2.0, left_eye.y + 10.0),
                mouth_left: Point::new(left_eye.x, left_eye.y + 20.0),
                mouth_right: Point::new(right_eye.x, right_eye.y + 20.0),
            },
            confidence: 0.99,
        }
    }

    fn gradient(width: u32, height: u32) -> PixelGrid {
        let mut grid = PixelGrid::filled(width, height, [0, 0, 0]);
        for y in 0..height {
            for x in 0..width {
                grid.put_pixel(x, y, [(x * 7 % 256) as u8, (y * 5 % 256) as u8, ((x + y) % 256) as u8]);
            }
        }
        grid
    }

    #[test]
    fn test_padded_crop_expands_box() {
        let bbox = BoundingBox { x1: 100.0, y1: 80.0, x2: 200.0, y2: 230.0 };
        let rect = padded_crop_rect(&bbox, FACE_CROP_PADDING, 640, 480);
        assert_eq!(rect, CropRect { x1: 80, y1: 50, x2: 220, y2: 260 });
    }

    #[test]
    fn test_padded_crop_clips_to_image() {
        let bbox = BoundingBox { x1: 5.0, y1: 2.0, x2: 95.0, y2: 60.0 };
        let rect = padded_crop_rect(&bbox, FACE_CROP_PADDING, 100, 64);
        assert_eq!(rect.x1, 0);
        assert_eq!(rect.y1, 0);
        assert_eq!(rect.x2, 100);
        assert_eq!(rect.y2, 64);
    }

    #[test]
    fn test_padded_crop_never_smaller_than_box_and_within_bounds() {
        let (w, h) = (320u32, 240u32);
        for i in 0..40u32 {
            let x1 = (i * 13 % 250) as f32;
            let y1 = (i * 7 % 180) as f32;
            let bw = (10 + i * 3 % 60) as f32;
            let bh = (12 + i * 5 % 50) as f32;
            let bbox = BoundingBox { x1, y1, x2: (x1 + bw).min(w as f32), y2: (y1 + bh).min(h as f32) };
            let rect = padded_crop_rect(&bbox, FACE_CROP_PADDING, w, h);

            assert!(rect.width() as f32 >= bbox.width(), "{bbox:?} -> {rect:?}");
            assert!(rect.height() as f32 >= bbox.height(), "{bbox:?} -> {rect:?}");
            assert!(rect.x2 <= w && rect.y2 <= h, "{rect:?}");
        }
    }

    #[test]
    fn test_degenerate_crop_is_rejected() {
        let image = gradient(64, 64);
        let zero_width = face_at(
            BoundingBox { x1: 30.0, y1: 10.0, x2: 30.0, y2: 40.0 },
            Point::new(30.0, 20.0),
            Point::new(30.0, 20.0),
        );
        let err = align_face(&image, &zero_width, FACE_CROP_PADDING).unwrap_err();
        assert_eq!(err, AlignError::DegenerateCrop { width: 0, height: 42 });

        let outside = face_at(
            BoundingBox { x1: 150.0, y1: 150.0, x2: 170.0, y2: 170.0 },
            Point::new(155.0, 155.0),
            Point::new(165.0, 155.0),
        );
        assert!(matches!(
            align_face(&image, &outside, FACE_CROP_PADDING),
            Err(AlignError::DegenerateCrop { .. })
        ));
    }

    #[test]
    fn test_rotation_angle() {
        assert!(rotation_angle((0.0, 0.0), (10.0, 0.0)).abs() < 1e-12);
        assert!((rotation_angle((0.0, 0.0), (10.0, 10.0)) - 45.0).abs() < 1e-9);
        assert!((rotation_angle((0.0, 10.0), (10.0, 0.0)) + 45.0).abs() < 1e-9);
    }

    #[test]
    fn test_rotation_matrix_levels_eye_line() {
        let left = (30.0, 52.0);
        let right = (71.0, 38.0);
        let center = ((left.0 + right.0) / 2.0, (left.1 + right.1) / 2.0);
        let m = rotation_matrix(center, rotation_angle(left, right), 1.0);

        let l = transform_point(&m, left);
        let r = transform_point(&m, right);
        assert!((l.1 - r.1).abs() < 1e-9, "eyes not level: {l:?} {r:?}");
        assert!(r.0 > l.0);
        // Unit scale: inter-eye distance is preserved.
        let before = ((right.0 - left.0).powi(2) + (right.1 - left.1).powi(2)).sqrt();
        assert!(((r.0 - l.0) - before).abs() < 1e-9);
        // The center is a fixed point.
        let c = transform_point(&m, center);
        assert!((c.0 - center.0).abs() < 1e-9 && (c.1 - center.1).abs() < 1e-9);
    }

    #[test]
    fn test_invert_affine_roundtrip() {
        let m = rotation_matrix((12.0, 7.0), 33.0, 1.0);
        let inv = invert_affine(&m);
        let p = transform_point(&inv, transform_point(&m, (5.0, -3.0)));
        assert!((p.0 - 5.0).abs() < 1e-9 && (p.1 + 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_cubic_coeffs_partition_of_unity() {
        for i in 0..32 {
            let c = cubic_coeffs(i as f64 / 32.0);
            assert!((c.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        }
        assert_eq!(cubic_coeffs(0.0), [0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_warp_identity_is_lossless() {
        let src = gradient(37, 29);
        let out = warp_affine_cubic(&src, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        assert_eq!(out, src);
    }

    #[test]
    fn test_warp_zero_angle_rotation_is_lossless() {
        let src = gradient(40, 40);
        let m = rotation_matrix((20.0, 20.0), 0.0, 1.0);
        assert_eq!(warp_affine_cubic(&src, &m), src);
    }

    #[test]
    fn test_warp_fills_outside_with_black() {
        let src = PixelGrid::filled(20, 20, [200, 200, 200]);
        // Shift content 50 px right: the whole output samples outside the source.
        let out = warp_affine_cubic(&src, &[1.0, 0.0, 50.0, 0.0, 1.0, 0.0]);
        assert!(out.data.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_resize_area_averages_blocks() {
        // 2x2 checkerboard of 0/100 halves to a uniform 50.
        let mut src = PixelGrid::filled(224, 224, [0, 0, 0]);
        for y in 0..224 {
            for x in 0..224 {
                if (x + y) % 2 == 0 {
                    src.put_pixel(x, y, [100, 100, 100]);
                }
            }
        }
        let out = resize_area(&src, 112, 112);
        assert_eq!((out.width, out.height), (112, 112));
        assert!(out.data.iter().all(|&v| v == 50), "first = {}", out.data[0]);
    }

    #[test]
    fn test_resize_area_fractional_shrink_keeps_uniform() {
        let src = PixelGrid::filled(173, 151, [10, 120, 250]);
        let out = resize_area(&src, 112, 112);
        assert!(out.data.chunks_exact(3).all(|p| p == [10, 120, 250]));
    }

    #[test]
    fn test_resize_area_enlarge_keeps_uniform() {
        let src = PixelGrid::filled(40, 90, [77, 88, 99]);
        let out = resize_area(&src, 112, 112);
        assert_eq!(out.data.len(), 112 * 112 * 3);
        assert!(out.data.chunks_exact(3).all(|p| p == [77, 88, 99]));
    }

    #[test]
    fn test_area_weights_sum_to_one() {
        for (src, dst) in [(224, 112), (173, 112), (113, 112), (500, 112)] {
            for taps in area_weights(src, dst) {
                let sum: f64 = taps.iter().map(|t| t.1).sum();
                assert!((sum - 1.0).abs() < 1e-9, "{src}->{dst}: {sum}");
            }
        }
    }

    #[test]
    fn test_rotate_180() {
        let src = gradient(5, 3);
        let out = rotate_180(&src);
        assert_eq!(out.pixel(0, 0), src.pixel(4, 2));
        assert_eq!(out.pixel(4, 2), src.pixel(0, 0));
        assert_eq!(out.pixel(1, 2), src.pixel(3, 0));
        assert_eq!(rotate_180(&out), src);
    }

    #[test]
    fn test_align_face_output_is_canonical_and_deterministic() {
        let image = gradient(320, 240);
        let face = face_at(
            BoundingBox { x1: 100.0, y1: 60.0, x2: 190.0, y2: 170.0 },
            Point::new(125.0, 100.0),
            Point::new(165.0, 92.0),
        );

        let a = align_face(&image, &face, FACE_CROP_PADDING).unwrap();
        let b = align_face(&image, &face, FACE_CROP_PADDING).unwrap();
        assert_eq!(a.grid().width, ALIGNED_FACE_SIZE);
        assert_eq!(a.grid().height, ALIGNED_FACE_SIZE);
        assert_eq!(a, b);
    }

    #[test]
    fn test_align_face_applies_final_half_turn() {
        // Top half white, bottom half black; level eyes so no rotation happens.
        let mut image = PixelGrid::filled(200, 200, [0, 0, 0]);
        for y in 0..100 {
            for x in 0..200 {
                image.put_pixel(x, y, [255, 255, 255]);
            }
        }
        let face = face_at(
            BoundingBox { x1: 50.0, y1: 50.0, x2: 150.0, y2: 150.0 },
            Point::new(80.0, 90.0),
            Point::new(120.0, 90.0),
        );
        let aligned = align_face(&image, &face, FACE_CROP_PADDING).unwrap();
        let grid = aligned.grid();
        // After the half turn the bright region ends up at the bottom.
        assert_eq!(grid.pixel(56, 5), [0, 0, 0]);
        assert_eq!(grid.pixel(56, 106), [255, 255, 255]);
    }
}
