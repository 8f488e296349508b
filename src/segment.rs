use anyhow::{Result, anyhow};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, GrayImage, Luma, Rgba, RgbaImage};
use ndarray::{Array, CowArray, IxDyn};
use ort::session::Session;
use std::path::Path;
use std::sync::Mutex;

use crate::model::{Device, build_session};

/// Input resolution of the saliency model.
const MATTE_SIZE: u32 = 320;

const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Foreground/background separator backed by a u2net-class saliency ONNX
/// model. Produces the source image with the predicted matte as its alpha
/// channel.
pub struct Segmenter {
    session: Mutex<Session>,
}

impl Segmenter {
    pub fn new(model_path: &Path, device: Device) -> Result<Self> {
        log::info!(
            "loading segmentation model from {} on {device}",
            model_path.display()
        );
        Ok(Self {
            session: Mutex::new(build_session(model_path, device)?),
        })
    }

    pub fn segment(&self, image: &DynamicImage) -> Result<RgbaImage> {
        let (width, height) = image.dimensions();
        let resized = image
            .resize_exact(MATTE_SIZE, MATTE_SIZE, FilterType::Triangle)
            .to_rgb8();

        let size = MATTE_SIZE as usize;
        let mut arr = Array::zeros(IxDyn(&[1, 3, size, size]));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                arr[[0, c, y, x]] = (pixel[c] as f32 / 255.0 - MEAN[c]) / STD[c];
            }
        }

        let xs = CowArray::from(arr);
        let inputs = ort::inputs![xs.view()]?;
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("segmentation session lock poisoned"))?;
        let outputs = session.run(inputs)?;
        // the first output is the finest-scale matte, [1, 1, H, W]
        let matte = outputs
            .iter()
            .map(|(_k, v)| v.try_extract_tensor::<f32>().map(|t| t.into_owned()))
            .next()
            .ok_or_else(|| anyhow!("segmentation model produced no outputs"))??;
        drop(outputs);
        drop(session);

        let matte = matte.into_dimensionality::<ndarray::Ix4>()?;

        // min-max normalize; a flat matte degrades to an all-zero mask
        // without failing
        let mut lo = f32::MAX;
        let mut hi = f32::MIN;
        for &v in matte.iter() {
            lo = lo.min(v);
            hi = hi.max(v);
        }
        let scale = if hi > lo { 1.0 / (hi - lo) } else { 0.0 };

        let mut mask = GrayImage::new(MATTE_SIZE, MATTE_SIZE);
        for (x, y, pixel) in mask.enumerate_pixels_mut() {
            let v = (matte[[0, 0, y as usize, x as usize]] - lo) * scale;
            *pixel = Luma([(v.clamp(0.0, 1.0) * 255.0).round() as u8]);
        }
        let mask = imageops::resize(&mask, width, height, FilterType::Triangle);

        let source = image.to_rgba8();
        let mut out = RgbaImage::new(width, height);
        for (x, y, pixel) in out.enumerate_pixels_mut() {
            let rgb = source.get_pixel(x, y);
            let alpha = mask.get_pixel(x, y)[0];
            *pixel = Rgba([rgb[0], rgb[1], rgb[2], alpha]);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_weights_fail_to_load() {
        let path = std::env::temp_dir().join("img2mesh-no-weights.onnx");
        assert!(Segmenter::new(&path, Device::Cpu).is_err());
    }
}
