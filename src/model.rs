use anyhow::{Result, anyhow, bail};
use image::RgbImage;
use image::imageops::{self, FilterType};
use ndarray::{Array, ArrayD, CowArray, IxDyn};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider, ExecutionProviderDispatch,
};
use ort::session::Session;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use crate::mesh::{self, Mesh};

/// Image-conditioning resolution expected by the encoder.
const INPUT_SIZE: u32 = 512;

/// Number of grid points queried per decoder call. Memory/throughput knob.
const RENDER_CHUNK_SIZE: usize = 8192;

/// Density level of the extracted iso-surface.
const DENSITY_THRESHOLD: f32 = 25.0;

pub const ENCODER_FILE: &str = "encoder.onnx";
pub const DECODER_FILE: &str = "decoder.onnx";

/// Compute device resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cuda,
    Cpu,
}

impl Device {
    /// CUDA when the provider reports itself available, CPU otherwise.
    pub fn detect() -> Self {
        if CUDAExecutionProvider::default()
            .is_available()
            .unwrap_or(false)
        {
            Device::Cuda
        } else {
            Device::Cpu
        }
    }

    fn providers(self) -> Vec<ExecutionProviderDispatch> {
        match self {
            Device::Cuda => vec![CUDAExecutionProvider::default().build().error_on_failure()],
            Device::Cpu => vec![CPUExecutionProvider::default().build()],
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cuda => write!(f, "cuda"),
            Device::Cpu => write!(f, "cpu"),
        }
    }
}

pub fn build_session(model_path: &Path, device: Device) -> Result<Session> {
    let session = SessionBuilder::new()?
        .with_execution_providers(device.providers())?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .commit_from_file(model_path)?;
    Ok(session)
}

/// Latent produced by [`Reconstructor::infer`] for a single image. Opaque to
/// the pipeline; only mesh extraction consumes it.
pub struct SceneCode(pub(crate) ArrayD<f32>);

/// Capability contract of the pretrained reconstruction model.
pub trait Reconstructor: Send + Sync {
    /// Encode one normalized RGB image into a scene code.
    fn infer(&self, image: &RgbImage) -> Result<SceneCode>;

    /// Query the implicit field at `resolution^3` and extract the surface.
    /// `clean` additionally drops degenerate geometry from the result.
    fn extract_mesh(&self, code: &SceneCode, resolution: u32, clean: bool) -> Result<Mesh>;
}

/// ONNX-backed reconstruction model: an image encoder producing a triplane
/// scene code and a point decoder mapping query positions to densities.
/// Each session sits behind a mutex so concurrent requests serialize on the
/// shared weights.
pub struct TriplaneReconstructor {
    encoder: Mutex<Session>,
    decoder: Mutex<Session>,
    chunk_size: usize,
}

impl TriplaneReconstructor {
    pub fn load(model_dir: &Path, device: Device) -> Result<Self> {
        let encoder_path = model_dir.join(ENCODER_FILE);
        let decoder_path = model_dir.join(DECODER_FILE);
        for path in [&encoder_path, &decoder_path] {
            if !path.exists() {
                bail!("reconstruction model file not found: {}", path.display());
            }
        }

        log::info!(
            "loading reconstruction model from {} on {device}",
            model_dir.display()
        );
        Ok(Self {
            encoder: Mutex::new(build_session(&encoder_path, device)?),
            decoder: Mutex::new(build_session(&decoder_path, device)?),
            chunk_size: RENDER_CHUNK_SIZE,
        })
    }
}

impl Reconstructor for TriplaneReconstructor {
    fn infer(&self, image: &RgbImage) -> Result<SceneCode> {
        let xs = CowArray::from(image_to_tensor(image));
        let inputs = ort::inputs![xs.view()]?;

        let mut session = self
            .encoder
            .lock()
            .map_err(|_| anyhow!("encoder session lock poisoned"))?;
        let outputs = session.run(inputs)?;
        let code = outputs
            .iter()
            .map(|(_k, v)| v.try_extract_tensor::<f32>().map(|t| t.into_owned()))
            .next()
            .ok_or_else(|| anyhow!("encoder produced no outputs"))??;
        Ok(SceneCode(code))
    }

    fn extract_mesh(&self, code: &SceneCode, resolution: u32, clean: bool) -> Result<Mesh> {
        let res = resolution as usize;
        let points = grid_points(res);
        let code_arr = CowArray::from(code.0.view());
        let mut density = Vec::with_capacity(points.len());

        let mut session = self
            .decoder
            .lock()
            .map_err(|_| anyhow!("decoder session lock poisoned"))?;
        for chunk in points.chunks(self.chunk_size) {
            let mut pts = Array::zeros(IxDyn(&[chunk.len(), 3]));
            for (i, p) in chunk.iter().enumerate() {
                for k in 0..3 {
                    pts[[i, k]] = p[k];
                }
            }
            let pts = CowArray::from(pts);
            let inputs = ort::inputs![code_arr.view(), pts.view()]?;
            let outputs = session.run(inputs)?;
            let values = outputs
                .iter()
                .map(|(_k, v)| v.try_extract_tensor::<f32>().map(|t| t.into_owned()))
                .next()
                .ok_or_else(|| anyhow!("decoder produced no outputs"))??;
            density.extend(values.iter().copied());
        }
        drop(session);

        if density.len() != res * res * res {
            bail!(
                "decoder returned {} densities for a {res}^3 grid",
                density.len()
            );
        }

        let mut mesh = mesh::extract_isosurface(&density, res, DENSITY_THRESHOLD);
        if clean {
            mesh.cleanup();
        }
        Ok(mesh)
    }
}

fn image_to_tensor(image: &RgbImage) -> ArrayD<f32> {
    let resized = imageops::resize(image, INPUT_SIZE, INPUT_SIZE, FilterType::Lanczos3);
    let size = INPUT_SIZE as usize;
    let mut arr = Array::zeros(IxDyn(&[1, 3, size, size]));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        arr[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
        arr[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
        arr[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
    }
    arr
}

/// Sample positions covering `[-1, 1]^3`, laid out as `(x * res + y) * res + z`
/// to match [`mesh::extract_isosurface`].
fn grid_points(res: usize) -> Vec<[f32; 3]> {
    let coord = |i: usize| 2.0 * i as f32 / (res - 1) as f32 - 1.0;
    let mut points = Vec::with_capacity(res * res * res);
    for x in 0..res {
        for y in 0..res {
            for z in 0..res {
                points.push([coord(x), coord(y), coord(z)]);
            }
        }
    }
    points
}

/// Test stand-in for the pretrained model: the scene code is ignored and the
/// extracted field is a solid sphere, so the full pipeline runs without
/// weights on disk.
#[cfg(test)]
pub(crate) struct MockReconstructor;

#[cfg(test)]
impl Reconstructor for MockReconstructor {
    fn infer(&self, _image: &RgbImage) -> Result<SceneCode> {
        Ok(SceneCode(ArrayD::zeros(IxDyn(&[1, 1]))))
    }

    fn extract_mesh(&self, _code: &SceneCode, resolution: u32, clean: bool) -> Result<Mesh> {
        let res = resolution as usize;
        let coord = |i: usize| 2.0 * i as f32 / (res - 1) as f32 - 1.0;
        let mut density = Vec::with_capacity(res * res * res);
        for x in 0..res {
            for y in 0..res {
                for z in 0..res {
                    let (px, py, pz) = (coord(x), coord(y), coord(z));
                    let dist = (px * px + py * py + pz * pz).sqrt();
                    density.push(DENSITY_THRESHOLD + 50.0 * (0.5 - dist));
                }
            }
        }
        let mut mesh = mesh::extract_isosurface(&density, res, DENSITY_THRESHOLD);
        if clean {
            mesh.cleanup();
        }
        Ok(mesh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_layout_matches_isosurface_indexing() {
        let res = 4;
        let points = grid_points(res);
        assert_eq!(points.len(), res * res * res);
        // (x, y, z) = (1, 2, 3)
        let p = points[(1 * res + 2) * res + 3];
        let coord = |i: usize| 2.0 * i as f32 / (res - 1) as f32 - 1.0;
        assert_eq!(p, [coord(1), coord(2), coord(3)]);
        assert_eq!(points[0], [-1.0, -1.0, -1.0]);
        assert_eq!(points[points.len() - 1], [1.0, 1.0, 1.0]);
    }

    #[test]
    fn image_tensor_is_unit_scaled_chw() {
        let mut img = RgbImage::new(8, 8);
        for p in img.pixels_mut() {
            *p = image::Rgb([255, 0, 51]);
        }
        let arr = image_to_tensor(&img);
        assert_eq!(arr.shape(), &[1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize]);
        assert!((arr[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!(arr[[0, 1, 0, 0]].abs() < 1e-6);
        assert!((arr[[0, 2, 0, 0]] - 0.2).abs() < 1e-2);
    }

    #[test]
    fn missing_model_files_fail_to_load() {
        let dir = std::env::temp_dir().join("img2mesh-no-models");
        assert!(TriplaneReconstructor::load(&dir, Device::Cpu).is_err());
    }

    #[test]
    fn mock_reconstructor_produces_a_mesh() {
        let code = MockReconstructor.infer(&RgbImage::new(4, 4)).unwrap();
        let mesh = MockReconstructor.extract_mesh(&code, 24, true).unwrap();
        assert!(!mesh.is_empty());
    }
}
