//! Encoded image bytes → BGR pixel grid.

use crate::types::PixelGrid;
use image::{DynamicImage, ImageDecoder, ImageReader};
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("failed to decode image: {0}")]
    Image(#[from] image::ImageError),
    #[error("failed to read image: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode image: empty pixel data")]
    Empty,
}

/// Decode JPEG/PNG/WebP/... bytes into an 8-bit BGR grid.
///
/// EXIF orientation is applied so the grid matches how the photo is viewed.
pub fn decode_image(bytes: &[u8]) -> Result<PixelGrid, DecodeError> {
    let mut decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut image = DynamicImage::from_decoder(decoder)?;
    image.apply_orientation(orientation);

    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    if width == 0 || height == 0 {
        return Err(DecodeError::Empty);
    }

    let mut data = rgb.into_raw();
    for px in data.chunks_exact_mut(PixelGrid::CHANNELS) {
        px.swap(0, 2);
    }

    PixelGrid::from_raw(width, height, data).ok_or(DecodeError::Empty)
}
