//! Bitmap decode / encode pipeline.
//!
//! Handles the conversion between fetched or stored bytes and decoded
//! bitmaps, plus the two renditions the loader produces: scaled to a size
//! hint, and masked with rounded corners. Every operation is pure; failure
//! is reported as `None` rather than an error.

use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgba, RgbaImage};

use crate::cache::memory::Weighted;

/// A decoded image. Cloning shares the pixel buffer.
#[derive(Clone, PartialEq)]
pub struct Bitmap {
    pixels: Arc<RgbaImage>,
}

impl Bitmap {
    pub fn new(pixels: RgbaImage) -> Self {
        Self {
            pixels: Arc::new(pixels),
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    /// Decoded size in bytes.
    pub fn byte_size(&self) -> usize {
        self.pixels.as_raw().len()
    }

    /// Whether both handles share one pixel buffer.
    pub fn ptr_eq(&self, other: &Bitmap) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("bytes", &self.byte_size())
            .finish()
    }
}

impl Weighted for Bitmap {
    fn cost(&self) -> usize {
        self.byte_size()
    }
}

/// Decode / encode / scale collaborator.
pub trait ImageCodec: Send + Sync {
    /// Decode fetched or stored bytes.
    fn decode(&self, bytes: &[u8]) -> Option<Bitmap>;

    /// Encode a bitmap for the disk tier. `None` aborts the disk write.
    fn encode(&self, bitmap: &Bitmap) -> Option<Vec<u8>>;

    /// Fit inside `width` x `height`, keeping the aspect ratio.
    fn scale(&self, bitmap: &Bitmap, width: u32, height: u32, upsample: bool) -> Bitmap;

    /// Resize to exactly `width` x `height`.
    fn scale_exact(&self, bitmap: &Bitmap, width: u32, height: u32) -> Bitmap;

    /// Mask the corners, leaving `margin` transparent pixels on every side.
    fn rounded(&self, bitmap: &Bitmap, corner_radius: u32, margin: u32) -> Bitmap;
}

/// `image`-backed codec that stores PNG on disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct PngCodec;

impl ImageCodec for PngCodec {
    fn decode(&self, bytes: &[u8]) -> Option<Bitmap> {
        image::load_from_memory(bytes)
            .ok()
            .map(|decoded| Bitmap::new(decoded.into_rgba8()))
    }

    fn encode(&self, bitmap: &Bitmap) -> Option<Vec<u8>> {
        let mut out = Cursor::new(Vec::with_capacity(bitmap.byte_size() / 4));
        bitmap.pixels().write_to(&mut out, ImageFormat::Png).ok()?;
        Some(out.into_inner())
    }

    fn scale(&self, bitmap: &Bitmap, width: u32, height: u32, upsample: bool) -> Bitmap {
        if width == 0 || height == 0 || bitmap.width() == 0 || bitmap.height() == 0 {
            return bitmap.clone();
        }
        let factor = f64::min(
            width as f64 / bitmap.width() as f64,
            height as f64 / bitmap.height() as f64,
        );
        if factor == 1.0 || (factor > 1.0 && !upsample) {
            return bitmap.clone();
        }
        let target_w = ((bitmap.width() as f64 * factor).round() as u32).max(1);
        let target_h = ((bitmap.height() as f64 * factor).round() as u32).max(1);
        Bitmap::new(imageops::resize(
            bitmap.pixels(),
            target_w,
            target_h,
            FilterType::Triangle,
        ))
    }

    fn scale_exact(&self, bitmap: &Bitmap, width: u32, height: u32) -> Bitmap {
        if width == 0 || height == 0 || (width == bitmap.width() && height == bitmap.height()) {
            return bitmap.clone();
        }
        Bitmap::new(imageops::resize(
            bitmap.pixels(),
            width,
            height,
            FilterType::Triangle,
        ))
    }

    fn rounded(&self, bitmap: &Bitmap, corner_radius: u32, margin: u32) -> Bitmap {
        let (w, h) = (bitmap.width(), bitmap.height());
        let mut out = RgbaImage::from_pixel(w, h, Rgba([0, 0, 0, 0]));
        if 2 * margin >= w || 2 * margin >= h {
            return Bitmap::new(out);
        }

        let left = margin as f64;
        let top = margin as f64;
        let right = (w - margin) as f64;
        let bottom = (h - margin) as f64;
        let radius = f64::min(corner_radius as f64, f64::min(right - left, bottom - top) / 2.0);

        for (x, y, pixel) in bitmap.pixels().enumerate_pixels() {
            let px = x as f64 + 0.5;
            let py = y as f64 + 0.5;
            if px < left || px > right || py < top || py > bottom {
                continue;
            }
            // Distance from the nearest corner circle centre.
            let cx = px.clamp(left + radius, right - radius);
            let cy = py.clamp(top + radius, bottom - radius);
            let (dx, dy) = (px - cx, py - cy);
            if dx * dx + dy * dy <= radius * radius {
                out.put_pixel(x, y, *pixel);
            }
        }
        Bitmap::new(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32) -> Bitmap {
        Bitmap::new(RgbaImage::from_pixel(w, h, Rgba([200, 10, 10, 255])))
    }

    #[test]
    fn test_png_roundtrip_is_lossless() {
        let codec = PngCodec;
        let bitmap = solid(12, 7);
        let encoded = codec.encode(&bitmap).unwrap();
        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, bitmap);
    }

    #[test]
    fn test_decode_garbage_is_none() {
        assert!(PngCodec.decode(b"not an image").is_none());
    }

    #[test]
    fn test_scale_keeps_aspect_ratio() {
        let scaled = PngCodec.scale(&solid(100, 50), 40, 40, true);
        assert_eq!((scaled.width(), scaled.height()), (40, 20));
    }

    #[test]
    fn test_scale_without_upsample_keeps_small_images() {
        let bitmap = solid(10, 10);
        let scaled = PngCodec.scale(&bitmap, 40, 40, false);
        assert!(scaled.ptr_eq(&bitmap));

        let upsampled = PngCodec.scale(&bitmap, 40, 40, true);
        assert_eq!((upsampled.width(), upsampled.height()), (40, 40));
    }

    #[test]
    fn test_scale_exact() {
        let scaled = PngCodec.scale_exact(&solid(100, 50), 30, 30);
        assert_eq!((scaled.width(), scaled.height()), (30, 30));
    }

    #[test]
    fn test_rounded_clears_corners_and_margin() {
        let rounded = PngCodec.rounded(&solid(20, 20), 6, 2);
        // Margin is transparent.
        assert_eq!(rounded.pixels().get_pixel(0, 10)[3], 0);
        // Corner inside the margin box but outside the arc is transparent.
        assert_eq!(rounded.pixels().get_pixel(2, 2)[3], 0);
        // Centre keeps its pixel.
        assert_eq!(rounded.pixels().get_pixel(10, 10)[3], 255);
    }

    #[test]
    fn test_cost_is_decoded_size() {
        assert_eq!(solid(4, 5).cost(), 4 * 5 * 4);
    }
}
