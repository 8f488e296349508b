use clap::Parser;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceChoice {
    /// Use CUDA when available, fall back to CPU
    Auto,
    Cuda,
    Cpu,
}

#[derive(Parser, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Directory containing the reconstruction model ONNX files
    #[arg(long, default_value = "models")]
    pub model_dir: String,

    /// Segmentation asset root (overrides IMG2MESH_ASSET_DIR)
    #[arg(long)]
    pub asset_dir: Option<String>,

    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Bind port
    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    /// Compute device
    #[arg(long, value_enum, default_value_t = DeviceChoice::Auto)]
    pub device: DeviceChoice,
}
