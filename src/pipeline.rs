use std::env;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::preprocess;
use crate::registry::ModelRegistry;

/// Fixed iso-surface flag: always extract with the mesh-cleanup pass on.
const CLEAN_MESH: bool = true;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// A request arrived before the model registry was ready.
    #[error("Model not initialized")]
    Unavailable,

    /// Any failure while processing a single request; carries the message
    /// surfaced to the client.
    #[error("{0}")]
    Processing(String),
}

/// Per-request knobs, pre-populated with the service defaults.
#[derive(Debug, Clone, Copy)]
pub struct RequestParams {
    pub mc_resolution: u32,
    pub foreground_ratio: f32,
    pub remove_background: bool,
}

impl Default for RequestParams {
    fn default() -> Self {
        Self {
            mc_resolution: 256,
            foreground_ratio: 0.85,
            remove_background: true,
        }
    }
}

impl RequestParams {
    /// Clamp out-of-range values instead of rejecting the request:
    /// `foreground_ratio` into (0, 1], `mc_resolution` to a workable floor.
    pub fn sanitized(mut self) -> Self {
        if !self.foreground_ratio.is_finite() {
            self.foreground_ratio = Self::default().foreground_ratio;
        }
        self.foreground_ratio = self.foreground_ratio.clamp(0.05, 1.0);
        self.mc_resolution = self.mc_resolution.max(16);
        self
    }
}

/// Run the full reconstruction for one request: decode → normalize → infer →
/// extract mesh → write a uniquely named `.glb` artifact under the OS temp
/// directory. Returns the artifact path; the caller owns its deletion.
pub fn reconstruct(bytes: &[u8], params: &RequestParams, registry: &ModelRegistry) -> Result<PathBuf> {
    let image = image::load_from_memory(bytes).map_err(|e| fail("decoding uploaded image", e))?;

    let normalized = preprocess::normalize(
        &image,
        params.remove_background,
        params.foreground_ratio,
        registry.segmenter(),
    )
    .map_err(|e| fail("normalizing image", e))?;

    let code = registry
        .reconstructor()
        .infer(&normalized)
        .map_err(|e| fail("running inference", e))?;

    let mesh = registry
        .reconstructor()
        .extract_mesh(&code, params.mc_resolution, CLEAN_MESH)
        .map_err(|e| fail("extracting mesh", e))?;

    let path = env::temp_dir().join(format!("img2mesh-{}.glb", Uuid::new_v4()));
    if let Err(e) = fs::write(&path, mesh.to_glb()) {
        let _ = fs::remove_file(&path);
        return Err(fail("writing mesh artifact", e));
    }
    log::debug!("mesh artifact written to {}", path.display());
    Ok(path)
}

fn fail(stage: &str, err: impl std::fmt::Display) -> PipelineError {
    log::error!("{stage} failed: {err:#}");
    PipelineError::Processing(format!("{stage}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MockReconstructor;
    use image::{DynamicImage, RgbImage};
    use std::io::Cursor;

    fn mock_registry() -> ModelRegistry {
        ModelRegistry::for_tests(Box::new(MockReconstructor))
    }

    fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(
            width,
            height,
            image::Rgb([90, 120, 200]),
        ));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Jpeg)
            .unwrap();
        bytes
    }

    #[test]
    fn solid_image_yields_a_glb_artifact() {
        let registry = mock_registry();
        let params = RequestParams {
            mc_resolution: 64,
            remove_background: false,
            ..RequestParams::default()
        };

        let path = reconstruct(&jpeg_bytes(512, 512), &params, &registry).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert!(!bytes.is_empty());
        assert_eq!(&bytes[0..4], b"glTF");
    }

    #[test]
    fn corrupt_upload_is_a_processing_error() {
        let registry = mock_registry();
        let params = RequestParams {
            remove_background: false,
            ..RequestParams::default()
        };

        let err = reconstruct(b"not an image", &params, &registry).unwrap_err();
        assert!(matches!(err, PipelineError::Processing(_)));
        assert!(err.to_string().contains("decoding uploaded image"));
    }

    #[test]
    fn background_removal_without_weights_is_a_processing_error() {
        let registry = mock_registry();
        let params = RequestParams::default();

        let err = reconstruct(&jpeg_bytes(32, 32), &params, &registry).unwrap_err();
        assert!(matches!(err, PipelineError::Processing(_)));
    }

    #[test]
    fn concurrent_requests_get_distinct_artifacts() {
        let registry = std::sync::Arc::new(mock_registry());
        let params = RequestParams {
            mc_resolution: 24,
            remove_background: false,
            ..RequestParams::default()
        };

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    reconstruct(&jpeg_bytes(64, 64), &params, &registry).unwrap()
                })
            })
            .collect();

        let mut paths: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 4);
        for path in paths {
            fs::remove_file(path).unwrap();
        }
    }

    #[test]
    fn out_of_range_parameters_are_clamped() {
        let params = RequestParams {
            mc_resolution: 1,
            foreground_ratio: 7.5,
            remove_background: false,
        }
        .sanitized();
        assert_eq!(params.mc_resolution, 16);
        assert_eq!(params.foreground_ratio, 1.0);

        let params = RequestParams {
            foreground_ratio: -0.3,
            ..RequestParams::default()
        }
        .sanitized();
        assert_eq!(params.foreground_ratio, 0.05);

        let params = RequestParams {
            foreground_ratio: f32::NAN,
            ..RequestParams::default()
        }
        .sanitized();
        assert_eq!(params.foreground_ratio, 0.85);
    }
}
