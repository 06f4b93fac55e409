use std::path::Path;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use effnet_export::config::Settings;
use effnet_export::pipeline::{self, EXPORT_PATH, INPUT_SEED, REPRESENTATIVE_INPUT_SHAPE};
use effnet_export::{display, logging};

/// Exports pretrained EfficientNet-B0 to ONNX with a dynamic batch axis and
/// verifies the artifact by running it.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {}

fn main() -> anyhow::Result<()> {
    let _cli = Cli::parse();

    let settings = Settings::new().context("Failed to load configuration")?;
    logging::init(&settings.logging).map_err(|e| anyhow::anyhow!(e))?;
    info!("effnet-export starting up");

    let path = Path::new(EXPORT_PATH);

    display::stage(1, 3, "Acquiring pretrained model");
    let model = pipeline::acquire_model(&settings).context("Failed to acquire the pretrained model")?;

    display::stage(2, 3, "Exporting to ONNX");
    let sample = pipeline::representative_input(&REPRESENTATIVE_INPUT_SHAPE, INPUT_SEED);
    let report = pipeline::export_stage(&model, &sample, path)
        .with_context(|| format!("Failed to export to {}", path.display()))?;
    display::print_export_report(&report);

    display::stage(3, 3, "Verifying the artifact");
    let verification = pipeline::verify_stage(path, &sample)
        .with_context(|| format!("Failed to verify {}", path.display()))?;
    display::success(&format!("Artifact verified in {:.2?}", verification.elapsed));

    println!("{}", pipeline::format_tuple(&verification.output_shape));
    Ok(())
}
