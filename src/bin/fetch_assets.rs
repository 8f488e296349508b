//! Standalone downloader for the segmentation model weights.

use clap::Parser;

use img2mesh::download;
use img2mesh::registry::{self, SEG_WEIGHTS_FILE, SEG_WEIGHTS_URL};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Segmentation asset root (overrides IMG2MESH_ASSET_DIR)
    #[arg(long)]
    asset_dir: Option<String>,

    /// Source URL for the weights
    #[arg(long, default_value = SEG_WEIGHTS_URL)]
    url: String,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let dest = registry::asset_root(args.asset_dir.as_deref()).join(SEG_WEIGHTS_FILE);
    println!("Checking model at: {}", dest.display());
    download::ensure(&args.url, &dest)
}
