use anyhow::{Result, anyhow};
use image::{DynamicImage, Rgb, RgbImage, RgbaImage, imageops};

use crate::segment::Segmenter;

/// Neutral background level, in normalized [0, 1] space.
const BACKGROUND: f32 = 0.5;

/// Turn an uploaded image into the canonical RGB input the reconstruction
/// model expects.
///
/// With `remove_background` the segmentation engine supplies the matte, the
/// subject is reframed so its bounding box fills `foreground_ratio` of the
/// output frame, and the matte is composited away over neutral gray. Without
/// it, an existing alpha channel is composited over the same gray; an opaque
/// image passes through unchanged.
pub fn normalize(
    image: &DynamicImage,
    remove_background: bool,
    foreground_ratio: f32,
    segmenter: Option<&Segmenter>,
) -> Result<RgbImage> {
    if remove_background {
        let segmenter = segmenter.ok_or_else(|| {
            anyhow!("segmentation model not available; fetch its weights or disable background removal")
        })?;
        let matted = segmenter.segment(image)?;
        let framed = resize_foreground(&matted, foreground_ratio);
        Ok(composite_over_gray(&framed))
    } else if image.color().has_alpha() {
        Ok(composite_over_gray(&image.to_rgba8()))
    } else {
        Ok(image.to_rgb8())
    }
}

/// Blend `rgb * a + BACKGROUND * (1 - a)` per pixel, discarding alpha.
pub fn composite_over_gray(image: &RgbaImage) -> RgbImage {
    let mut out = RgbImage::new(image.width(), image.height());
    for (x, y, pixel) in image.enumerate_pixels() {
        let alpha = pixel[3] as f32 / 255.0;
        let blend = |c: u8| {
            let v = c as f32 / 255.0 * alpha + BACKGROUND * (1.0 - alpha);
            (v * 255.0).round() as u8
        };
        out.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    out
}

/// Crop to the bounding box of the non-transparent subject and center it on a
/// square transparent canvas sized so the box spans `ratio` of the frame.
/// A fully transparent matte keeps the whole frame as the subject.
pub fn resize_foreground(image: &RgbaImage, ratio: f32) -> RgbaImage {
    let (width, height) = image.dimensions();
    let mut x0 = width;
    let mut y0 = height;
    let mut x1 = 0u32;
    let mut y1 = 0u32;
    for (x, y, pixel) in image.enumerate_pixels() {
        if pixel[3] > 0 {
            x0 = x0.min(x);
            y0 = y0.min(y);
            x1 = x1.max(x);
            y1 = y1.max(y);
        }
    }
    if x0 > x1 || y0 > y1 {
        (x0, y0, x1, y1) = (0, 0, width - 1, height - 1);
    }

    let (box_w, box_h) = (x1 - x0 + 1, y1 - y0 + 1);
    let subject = imageops::crop_imm(image, x0, y0, box_w, box_h).to_image();

    let side = box_w.max(box_h);
    let frame = (side as f32 / ratio).ceil() as u32;
    let mut canvas = RgbaImage::new(frame, frame);
    let offset_x = (frame - box_w) / 2;
    let offset_y = (frame - box_h) / 2;
    imageops::overlay(&mut canvas, &subject, offset_x as i64, offset_y as i64);
    canvas
}
