use image::RgbImage;
use std::sync::Arc;

/// A decoded camera frame: 8-bit RGB, row-major, with capture metadata.
///
/// Pixel data sits behind an `Arc`, so cloning a frame is cheap and every
/// clone is a read-only view. The capture loop, motion detector and encoder
/// can all hold the same frame at once without copying pixels.
#[derive(Debug, Clone)]
pub struct Frame {
    image: Arc<RgbImage>,
    pub captured_at_ms: i64,
    pub seq: u64,
}

impl Frame {
    pub fn new(image: RgbImage, captured_at_ms: i64, seq: u64) -> Self {
        Self {
            image: Arc::new(image),
            captured_at_ms,
            seq,
        }
    }

    /// Build a frame from packed `rgb24` bytes. Returns `None` when the
    /// buffer length does not match `width * height * 3`.
    pub fn from_rgb(
        width: u32,
        height: u32,
        data: Vec<u8>,
        captured_at_ms: i64,
        seq: u64,
    ) -> Option<Self> {
        RgbImage::from_raw(width, height, data).map(|image| Self::new(image, captured_at_ms, seq))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Raw packed `rgb24` bytes, the layout ffmpeg's rawvideo input expects.
    pub fn as_bytes(&self) -> &[u8] {
        self.image.as_raw()
    }
}
