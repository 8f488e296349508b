//! Print the inputs and outputs of an ONNX model file.

use clap::Parser;
use std::path::Path;

use img2mesh::model::{Device, build_session};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// ONNX model path
    #[arg(long, required = true)]
    model: String,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let session = build_session(Path::new(&args.model), Device::Cpu)?;

    println!("=== Model Inputs ===");
    for input in &session.inputs {
        println!("Name: {}, Type: {:?}", input.name, input.input_type);
    }

    println!("\n=== Model Outputs ===");
    for output in &session.outputs {
        println!("Name: {}, Type: {:?}", output.name, output.output_type);
    }

    println!("\nModel loaded successfully.");
    Ok(())
}
