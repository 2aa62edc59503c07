use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};

use crate::models::BoundingBox;

/// Fill value for letterbox padding
const PAD_VALUE: u8 = 114;

/// How a source image was fitted into the square model input
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: u32,
    pub pad_y: u32,
}

impl Letterbox {
    /// Map a center/size box in model-input pixels back to a box in a
    /// `width` x `height` source image.
    pub fn to_source(
        &self,
        cx: f32,
        cy: f32,
        w: f32,
        h: f32,
        width: u32,
        height: u32,
    ) -> Option<BoundingBox> {
        if self.scale <= 0.0 {
            return None;
        }
        let x1 = (cx - w / 2.0 - self.pad_x as f32) / self.scale;
        let y1 = (cy - h / 2.0 - self.pad_y as f32) / self.scale;
        let x2 = (cx + w / 2.0 - self.pad_x as f32) / self.scale;
        let y2 = (cy + h / 2.0 - self.pad_y as f32) / self.scale;
        BoundingBox::from_corners(x1, y1, x2, y2)?.clamp(width, height)
    }
}

/// Resize `image` to fit a `size` x `size` square, keeping its aspect ratio and
/// centering it on a grey canvas.
pub fn letterbox(image: &DynamicImage, size: u32) -> (RgbImage, Letterbox) {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let scaled_w = ((width as f32 * scale).round() as u32).clamp(1, size);
    let scaled_h = ((height as f32 * scale).round() as u32).clamp(1, size);

    let mut canvas = RgbImage::from_pixel(size, size, Rgb([PAD_VALUE; 3]));
    let pad_x = (size - scaled_w) / 2;
    let pad_y = (size - scaled_h) / 2;

    if (scaled_w, scaled_h) == (width, height) {
        image::imageops::overlay(&mut canvas, &rgb, pad_x.into(), pad_y.into());
    } else {
        let scaled = image::imageops::resize(&rgb, scaled_w, scaled_h, FilterType::Triangle);
        image::imageops::overlay(&mut canvas, &scaled, pad_x.into(), pad_y.into());
    }

    (canvas, Letterbox { scale, pad_x, pad_y })
}

/// Planar RGB float data in `[0, 1]`, laid out channel-major (CHW).
pub fn to_chw(image: &RgbImage) -> Vec<f32> {
    let (width, height) = image.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0.0f32; plane * 3];
    for (x, y, pixel) in image.enumerate_pixels() {
        let idx = (y * width + x) as usize;
        for c in 0..3 {
            data[c * plane + idx] = pixel[c] as f32 / 255.0;
        }
    }
    data
}
