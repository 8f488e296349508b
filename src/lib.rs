pub mod cli;
pub mod download;
pub mod mesh;
pub mod model;
pub mod pipeline;
pub mod preprocess;
pub mod registry;
pub mod segment;
pub mod service;

pub use crate::cli::Args;
pub use crate::mesh::Mesh;
pub use crate::model::{Device, Reconstructor, SceneCode, TriplaneReconstructor};
pub use crate::pipeline::{PipelineError, RequestParams};
pub use crate::registry::ModelRegistry;
pub use crate::segment::Segmenter;
pub use crate::service::AppState;
