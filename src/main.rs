use clap::Parser;
use std::path::Path;
use std::sync::Arc;

use img2mesh::cli::{Args, DeviceChoice};
use img2mesh::model::Device;
use img2mesh::registry::{self, ModelRegistry, SEG_WEIGHTS_FILE};
use img2mesh::service::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let asset_dir = registry::asset_root(args.asset_dir.as_deref());
    log::info!("segmentation asset root: {}", asset_dir.display());
    let weights = asset_dir.join(SEG_WEIGHTS_FILE);
    if weights.exists() {
        log::info!("found segmentation weights at {}", weights.display());
    } else {
        log::error!(
            "segmentation weights NOT found at {} (run fetch_assets)",
            weights.display()
        );
    }

    let device = match args.device {
        DeviceChoice::Auto => Device::detect(),
        DeviceChoice::Cuda => Device::Cuda,
        DeviceChoice::Cpu => Device::Cpu,
    };

    // A model-load failure must abort here, before the listener binds.
    let registry = ModelRegistry::initialize(Path::new(&args.model_dir), &asset_dir, device)?;
    let state = AppState::new(Some(Arc::new(registry)));

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("listening on {addr}");
    axum::serve(listener, service::router(state)).await?;

    Ok(())
}
