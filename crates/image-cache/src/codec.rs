//! Image decoding and rounded-corner rendering

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, RgbaImage};

use crate::error::{CacheError, Result};

/// Turns bytes into pixels and pixels into rounded variants
pub trait ImageCodec: Send + Sync {
    fn decode(&self, data: &[u8]) -> Result<DynamicImage>;

    /// Scale `image` to cover `width` x `height`, round its corners with
    /// `radius` and return the encoded result
    fn render_rounded(
        &self,
        image: &DynamicImage,
        radius: u32,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>>;
}

/// `image`-crate codec producing PNG variants
#[derive(Debug, Default, Clone, Copy)]
pub struct RasterCodec;

impl ImageCodec for RasterCodec {
    fn decode(&self, data: &[u8]) -> Result<DynamicImage> {
        image::load_from_memory(data)
            .map_err(|e| CacheError::Decode(format!("Failed to decode image: {}", e)))
    }

    fn render_rounded(
        &self,
        image: &DynamicImage,
        radius: u32,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>> {
        if width == 0 || height == 0 {
            return Err(CacheError::InvalidRequest(format!(
                "cannot render a {}x{} variant",
                width, height
            )));
        }

        let mut pixels = image
            .resize_to_fill(width, height, FilterType::Triangle)
            .to_rgba8();
        round_corners(&mut pixels, radius);

        let mut encoded = Vec::new();
        DynamicImage::ImageRgba8(pixels)
            .write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)
            .map_err(|e| CacheError::Decode(format!("Failed to encode variant: {}", e)))?;
        Ok(encoded)
    }
}

/// Fade the alpha channel outside each corner's quarter circle
///
/// Coverage is estimated from the distance of the pixel centre to the arc,
/// which gives a one-pixel anti-aliased edge.
pub fn round_corners(pixels: &mut RgbaImage, radius: u32) {
    let (width, height) = pixels.dimensions();
    let radius = radius.min(width / 2).min(height / 2);
    if radius == 0 {
        return;
    }

    let r = radius as f32;
    for dy in 0..radius {
        for dx in 0..radius {
            let fx = r - (dx as f32 + 0.5);
            let fy = r - (dy as f32 + 0.5);
            let coverage = (r - (fx * fx + fy * fy).sqrt() + 0.5).clamp(0.0, 1.0);
            if coverage >= 1.0 {
                continue;
            }

            let corners = [
                (dx, dy),
                (width - 1 - dx, dy),
                (dx, height - 1 - dy),
                (width - 1 - dx, height - 1 - dy),
            ];
            for (x, y) in corners {
                let pixel = pixels.get_pixel_mut(x, y);
                pixel[3] = (pixel[3] as f32 * coverage).round() as u8;
            }
        }
    }
}
