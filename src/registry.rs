use anyhow::Result;
use std::env;
use std::path::{Path, PathBuf};

use crate::model::{Device, Reconstructor, TriplaneReconstructor};
use crate::segment::Segmenter;

/// Environment variable designating the segmentation asset root.
pub const ASSET_DIR_ENV: &str = "IMG2MESH_ASSET_DIR";

/// Segmentation weight file expected under the asset root.
pub const SEG_WEIGHTS_FILE: &str = "u2net.onnx";

/// Upstream source of the segmentation weights.
pub const SEG_WEIGHTS_URL: &str =
    "https://github.com/danielgatis/rembg/releases/download/v0.0.0/u2net.onnx";

/// Resolve the asset root: explicit override, then `IMG2MESH_ASSET_DIR`,
/// then `.assets` next to the working directory.
pub fn asset_root(override_dir: Option<&str>) -> PathBuf {
    override_dir
        .map(PathBuf::from)
        .or_else(|| env::var_os(ASSET_DIR_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(".assets"))
}

/// Read-only bundle of everything the request path shares: the resolved
/// compute device, the loaded reconstruction model and the segmentation
/// engine. Built exactly once at startup and handed to every handler behind
/// an `Arc`; never mutated afterwards.
pub struct ModelRegistry {
    device: Device,
    reconstructor: Box<dyn Reconstructor>,
    segmenter: Option<Segmenter>,
}

impl ModelRegistry {
    /// Load both engines. A reconstruction-model failure aborts startup;
    /// missing segmentation weights only disable background removal until
    /// the asset is fetched.
    pub fn initialize(model_dir: &Path, asset_dir: &Path, device: Device) -> Result<Self> {
        log::info!("initializing model registry on {device}");
        let reconstructor = TriplaneReconstructor::load(model_dir, device)?;

        let weights = asset_dir.join(SEG_WEIGHTS_FILE);
        let segmenter = if weights.exists() {
            match Segmenter::new(&weights, device) {
                Ok(segmenter) => Some(segmenter),
                Err(e) => {
                    log::error!("failed to load segmentation model: {e:#}");
                    None
                }
            }
        } else {
            log::error!(
                "segmentation weights not found at {}; background removal requests will fail",
                weights.display()
            );
            None
        };

        log::info!("model registry initialized");
        Ok(Self {
            device,
            reconstructor: Box::new(reconstructor),
            segmenter,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn reconstructor(&self) -> &dyn Reconstructor {
        self.reconstructor.as_ref()
    }

    pub fn segmenter(&self) -> Option<&Segmenter> {
        self.segmenter.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn for_tests(reconstructor: Box<dyn Reconstructor>) -> Self {
        Self {
            device: Device::Cpu,
            reconstructor,
            segmenter: None,
        }
    }
}
